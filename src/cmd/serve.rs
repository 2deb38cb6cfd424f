//! HTTP service command: `crowdtask serve`.

use anyhow::Result;
use std::path::PathBuf;
use tracing::warn;

use crowdtask::config::CrowdtaskToml;
use crowdtask::platform::server;

pub async fn cmd_serve(
    settings: &CrowdtaskToml,
    port: Option<u16>,
    host: Option<String>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    for warning in settings.validate() {
        warn!("Configuration: {}", warning);
    }

    let mut config = settings.to_server_config();
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(db_path) = db_path {
        config.db_path = db_path;
    }
    if dev {
        config.cors_permissive = true;
    }

    server::start_server(config).await
}
