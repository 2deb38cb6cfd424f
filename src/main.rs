use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::warn;

use crowdtask::config::{self, CrowdtaskToml};
use crowdtask::importers::ImporterKind;
use crowdtask::logging;

mod cmd;

#[derive(Parser)]
#[command(name = "crowdtask")]
#[command(version, about = "Project and bulk task-import service for crowdsourcing projects")]
pub struct Cli {
    /// Path to crowdtask.toml (defaults to .crowdtask/crowdtask.toml)
    #[arg(long, global = true, env = "CROWDTASK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level regardless of the configured level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP service, import workers and autoimport scheduler
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS permissive for a local frontend)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and exit
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Import tasks into a project from the command line
    Import(ImportArgs),
    /// List registered importers
    Importers,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

/// Arguments for `crowdtask import`. Runs synchronously, with no
/// queueing threshold.
#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    /// Short name of the target project
    pub short_name: String,

    /// Importer: csv, gdocs, epicollect, flickr or dropbox
    #[arg(long = "type", value_name = "TYPE")]
    pub kind: ImporterKind,

    /// CSV or Google Docs spreadsheet URL
    #[arg(long)]
    pub url: Option<String>,

    /// EpiCollect Plus project name
    #[arg(long)]
    pub epicollect_project: Option<String>,

    /// EpiCollect Plus form name
    #[arg(long)]
    pub epicollect_form: Option<String>,

    /// Flickr album (photoset) id
    #[arg(long)]
    pub album_id: Option<String>,

    /// Dropbox share link, once per file
    #[arg(long = "dropbox-link", value_name = "LINK")]
    pub dropbox_links: Vec<String>,

    /// Create the project when it does not exist yet
    #[arg(long)]
    pub create: bool,

    /// Database path
    #[arg(long)]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default crowdtask.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = std::env::current_dir().context("Failed to get current directory")?;
    let config_path = config::resolve_config_path(&project_dir, cli.config.as_deref());

    // `config` reports on the file itself, so it runs before the file is
    // required to parse.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&config_path, command.clone());
    }

    let mut settings = CrowdtaskToml::load_or_default(&config_path)?;
    let env_warnings = settings.apply_env_overrides();
    let level = if cli.verbose {
        "debug"
    } else {
        settings.logging.level.as_str()
    };
    let _log_guard = logging::init(
        level,
        settings.logging.format,
        settings.logging.directory.as_deref(),
    )?;
    for warning in env_warnings {
        warn!("{}", warning);
    }

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => cmd::cmd_serve(&settings, port, host, db_path, dev).await?,
        Commands::InitDb { db_path } => {
            let db_path = db_path.unwrap_or_else(|| settings.server.db_path.clone());
            cmd::cmd_init_db(&db_path)?;
        }
        Commands::Import(args) => cmd::cmd_import(&settings, args).await?,
        Commands::Importers => cmd::cmd_importers(&settings)?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
