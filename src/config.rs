//! Configuration for crowdtask, read from `.crowdtask/crowdtask.toml`.
//!
//! Values are layered: file → environment → CLI flags. Every field has a
//! default, so an empty or missing file is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 5000
//! db_path = ".crowdtask/crowdtask.db"
//! cors_permissive = false
//!
//! [import]
//! max_synchronous_tasks = 200
//! workers = 1
//! autoimport_interval_secs = 86400
//! request_timeout_secs = 30
//!
//! [flickr]
//! api_key = "..."
//! api_url = "https://api.flickr.com/services/rest/"
//!
//! [epicollect]
//! base_url = "http://plus.epicollect.net"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! directory = ".crowdtask/logs"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::importers::{SourceSettings, epicollect, flickr};
use crate::logging::LogFormat;
use crate::platform::jobs::DispatchSettings;
use crate::platform::server::ServerConfig;

pub const CONFIG_DIR: &str = ".crowdtask";
pub const CONFIG_FILE: &str = "crowdtask.toml";

pub const ENV_FLICKR_API_KEY: &str = "CROWDTASK_FLICKR_API_KEY";
pub const ENV_MAX_SYNC_TASKS: &str = "CROWDTASK_MAX_SYNC_TASKS";
pub const ENV_DB_PATH: &str = "CROWDTASK_DB_PATH";

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Allow any origin (local frontend development)
    #[serde(default)]
    pub cors_permissive: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("crowdtask.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            cors_permissive: false,
        }
    }
}

/// `[import]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSection {
    /// Imports estimated at or below this many tasks run inline
    #[serde(default = "default_max_synchronous_tasks")]
    pub max_synchronous_tasks: usize,
    /// Background import workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_autoimport_interval_secs")]
    pub autoimport_interval_secs: u64,
    /// Timeout for each remote source request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_synchronous_tasks() -> usize {
    200
}

fn default_workers() -> usize {
    1
}

fn default_autoimport_interval_secs() -> u64 {
    86_400
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ImportSection {
    fn default() -> Self {
        Self {
            max_synchronous_tasks: default_max_synchronous_tasks(),
            workers: default_workers(),
            autoimport_interval_secs: default_autoimport_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// `[flickr]` section. The Flickr importer is only registered with a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlickrSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_flickr_api_url")]
    pub api_url: String,
}

fn default_flickr_api_url() -> String {
    flickr::DEFAULT_API_URL.to_string()
}

impl Default for FlickrSection {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_flickr_api_url(),
        }
    }
}

/// `[epicollect]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpiCollectSection {
    #[serde(default = "default_epicollect_base_url")]
    pub base_url: String,
}

fn default_epicollect_base_url() -> String {
    epicollect::DEFAULT_BASE_URL.to_string()
}

impl Default for EpiCollectSection {
    fn default() -> Self {
        Self {
            base_url: default_epicollect_base_url(),
        }
    }
}

/// `[logging]` section. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for the daily rolling log file; console only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

/// The complete crowdtask.toml configuration structure.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CrowdtaskToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub import: ImportSection,
    #[serde(default)]
    pub flickr: FlickrSection,
    #[serde(default)]
    pub epicollect: EpiCollectSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl CrowdtaskToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse crowdtask.toml")
    }

    /// Load from `path`, or return the defaults if it doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating its directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize crowdtask.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CROWDTASK_*` environment overrides. Returns a warning for every
    /// variable whose value could not be used.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();

        if let Some(key) = lookup(ENV_FLICKR_API_KEY).filter(|k| !k.trim().is_empty()) {
            self.flickr.api_key = Some(key);
        }
        if let Some(raw) = lookup(ENV_MAX_SYNC_TASKS) {
            match raw.trim().parse::<usize>() {
                Ok(n) => self.import.max_synchronous_tasks = n,
                Err(_) => warnings.push(format!(
                    "Ignoring {}='{}': expected a non-negative integer",
                    ENV_MAX_SYNC_TASKS, raw
                )),
            }
        }
        if let Some(path) = lookup(ENV_DB_PATH).filter(|p| !p.trim().is_empty()) {
            self.server.db_path = PathBuf::from(path);
        }

        warnings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.import.workers == 0 {
            warnings.push(
                "import.workers is 0: queued imports will never run; 1 worker will be started"
                    .to_string(),
            );
        }
        if self.import.max_synchronous_tasks == 0 {
            warnings.push(
                "import.max_synchronous_tasks is 0: every non-empty import will be queued"
                    .to_string(),
            );
        }
        if self.import.autoimport_interval_secs == 0 {
            warnings.push("import.autoimport_interval_secs must be greater than 0".to_string());
        }
        if self.import.request_timeout_secs == 0 {
            warnings.push("import.request_timeout_secs must be greater than 0".to_string());
        }
        for (field, url) in [
            ("flickr.api_url", &self.flickr.api_url),
            ("epicollect.base_url", &self.epicollect.base_url),
        ] {
            if let Err(e) = reqwest::Url::parse(url) {
                warnings.push(format!("Invalid {} '{}': {}", field, url, e));
            }
        }
        if self
            .flickr
            .api_key
            .as_deref()
            .is_some_and(|k| k.trim().is_empty())
        {
            warnings.push("flickr.api_key is empty; the flickr importer will be disabled".to_string());
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            warnings.push(format!(
                "Unknown logging.level '{}': expected trace, debug, info, warn or error",
                self.logging.level
            ));
        }

        warnings
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            epicollect_base_url: self.epicollect.base_url.clone(),
            flickr_api_url: self.flickr.api_url.clone(),
            flickr_api_key: self
                .flickr
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty()),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            max_synchronous_tasks: self.import.max_synchronous_tasks,
            workers: self.import.workers,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.import.request_timeout_secs.max(1))
    }

    /// Everything `start_server` needs, before CLI overrides.
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            db_path: self.server.db_path.clone(),
            cors_permissive: self.server.cors_permissive,
            dispatch: self.dispatch_settings(),
            autoimport_interval: Duration::from_secs(self.import.autoimport_interval_secs.max(1)),
            request_timeout: self.request_timeout(),
            sources: self.source_settings(),
        }
    }
}

/// `.crowdtask/crowdtask.toml` under `project_dir`.
pub fn project_config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Per-user fallback, e.g. `~/.config/crowdtask/crowdtask.toml`.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("crowdtask").join(CONFIG_FILE))
}

/// Pick the config file to use: an explicit path, then the project file, then
/// the per-user file if it exists. Falls back to the project path so
/// `config init` has somewhere to write.
pub fn resolve_config_path(project_dir: &Path, explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    let project = project_config_path(project_dir);
    if project.exists() {
        return project;
    }
    match user_config_path() {
        Some(user) if user.exists() => user,
        _ => project,
    }
}
