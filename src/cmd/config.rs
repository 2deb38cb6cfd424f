//! Configuration view and validation commands: `crowdtask config`.

use anyhow::Result;
use std::path::Path;

use crowdtask::config::CrowdtaskToml;

use crate::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("crowdtask configuration");
            println!("=======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                CrowdtaskToml::load(config_path)?
            } else {
                println!("No crowdtask.toml found at {}", config_path.display());
                println!("Using default configuration.");
                CrowdtaskToml::default()
            };
            println!();
            print_config(&toml);

            let mut effective = toml.clone();
            let warnings = effective.apply_env_overrides();
            if effective != toml {
                println!("Effective values (with environment overrides):");
                println!("  server.db_path = \"{}\"", effective.server.db_path.display());
                println!(
                    "  import.max_synchronous_tasks = {}",
                    effective.import.max_synchronous_tasks
                );
                println!(
                    "  flickr.api_key = {}",
                    if effective.flickr.api_key.is_some() { "(set)" } else { "(unset)" }
                );
                println!();
            }
            for warning in warnings {
                println!("Warning: {}", warning);
            }
            if !config_path.exists() {
                println!("Run 'crowdtask config init' to create a crowdtask.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No crowdtask.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = CrowdtaskToml::load(config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("crowdtask.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            CrowdtaskToml::default().save(config_path)?;

            println!("Created crowdtask.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, db_path");
            println!("  - [import] max_synchronous_tasks, workers, autoimport_interval_secs");
            println!("  - [flickr] api_key to enable the flickr importer");
            println!("  - [logging] level, format, directory");
            println!();
        }
    }

    Ok(())
}

fn print_config(toml: &CrowdtaskToml) {
    println!("[server]");
    println!("  host = \"{}\"", toml.server.host);
    println!("  port = {}", toml.server.port);
    println!("  db_path = \"{}\"", toml.server.db_path.display());
    println!("  cors_permissive = {}", toml.server.cors_permissive);
    println!();

    println!("[import]");
    println!(
        "  max_synchronous_tasks = {}",
        toml.import.max_synchronous_tasks
    );
    println!("  workers = {}", toml.import.workers);
    println!(
        "  autoimport_interval_secs = {}",
        toml.import.autoimport_interval_secs
    );
    println!("  request_timeout_secs = {}", toml.import.request_timeout_secs);
    println!();

    println!("[flickr]");
    // Never echo the key itself.
    println!(
        "  api_key = {}",
        if toml.flickr.api_key.is_some() { "(set)" } else { "(unset)" }
    );
    println!("  api_url = \"{}\"", toml.flickr.api_url);
    println!();

    println!("[epicollect]");
    println!("  base_url = \"{}\"", toml.epicollect.base_url);
    println!();

    println!("[logging]");
    println!("  level = \"{}\"", toml.logging.level);
    println!("  format = \"{}\"", toml.logging.format);
    if let Some(dir) = &toml.logging.directory {
        println!("  directory = \"{}\"", dir.display());
    }
    println!();
}
