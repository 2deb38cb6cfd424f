//! Database bootstrap command: `crowdtask init-db`.

use anyhow::{Context, Result};
use std::path::Path;

use crowdtask::platform::db::PlatformDb;

pub fn cmd_init_db(db_path: &Path) -> Result<()> {
    PlatformDb::new(db_path)
        .with_context(|| format!("Failed to initialize database at {}", db_path.display()))?;
    println!("Database initialized at {}", db_path.display());
    Ok(())
}
