//! Bulk task import from remote sources.
//!
//! Every source type implements [`BulkTaskImport`]: it can estimate how many
//! tasks an import form would produce and hand back a lazy sequence of rows.
//! The [`Importer`] registry maps an [`ImporterKind`] to its adapter and
//! persists rows through the platform store.
//!
//! ## Module Map
//!
//! - `fetch`: `RemoteFetcher` seam and its reqwest implementation
//! - `tabular`: CSV files and Google Docs spreadsheets
//! - `epicollect`: EpiCollect Plus form submissions
//! - `flickr`: Flickr photo sets (paginated REST API)
//! - `dropbox`: files picked with the Dropbox chooser

pub mod dropbox;
pub mod epicollect;
pub mod fetch;
pub mod flickr;
pub mod tabular;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::errors::ImportError;
use crate::platform::db::DbHandle;

pub use dropbox::{DropboxFile, DropboxImporter};
pub use epicollect::EpiCollectImporter;
pub use fetch::{FetchedResponse, HttpFetcher, RemoteFetcher};
pub use flickr::FlickrImporter;
pub use tabular::{CsvImporter, GoogleDocsImporter};

/// Column names that map onto task attributes instead of the `info` payload.
pub const TASK_FIELDS: [&str; 5] = ["state", "quorum", "calibration", "priority_0", "n_answers"];

/// Lazy sequence of imported rows. Rows are produced one at a time so large
/// sources never have to be materialized as task records up front.
pub type TaskRows = Box<dyn Iterator<Item = Result<TaskData, ImportError>> + Send>;

// ── Kinds and forms ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImporterKind {
    Csv,
    Gdocs,
    Epicollect,
    Flickr,
    Dropbox,
}

impl ImporterKind {
    pub const ALL: [ImporterKind; 5] = [
        ImporterKind::Csv,
        ImporterKind::Gdocs,
        ImporterKind::Epicollect,
        ImporterKind::Flickr,
        ImporterKind::Dropbox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImporterKind::Csv => "csv",
            ImporterKind::Gdocs => "gdocs",
            ImporterKind::Epicollect => "epicollect",
            ImporterKind::Flickr => "flickr",
            ImporterKind::Dropbox => "dropbox",
        }
    }
}

impl fmt::Display for ImporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImporterKind {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImporterKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ImportError::UnknownImporter(s.to_string()))
    }
}

/// Parameters of one import, tagged by importer type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ImportForm {
    Csv {
        csv_url: String,
    },
    Gdocs {
        googledocs_url: String,
    },
    Epicollect {
        epicollect_project: String,
        epicollect_form: String,
    },
    Flickr {
        album_id: String,
    },
    Dropbox {
        files: Vec<DropboxFile>,
    },
}

impl ImportForm {
    pub fn kind(&self) -> ImporterKind {
        match self {
            ImportForm::Csv { .. } => ImporterKind::Csv,
            ImportForm::Gdocs { .. } => ImporterKind::Gdocs,
            ImportForm::Epicollect { .. } => ImporterKind::Epicollect,
            ImportForm::Flickr { .. } => ImporterKind::Flickr,
            ImportForm::Dropbox { .. } => ImporterKind::Dropbox,
        }
    }

    /// Short human description used in logs and job listings.
    pub fn describe(&self) -> String {
        match self {
            ImportForm::Csv { csv_url } => format!("csv {}", csv_url),
            ImportForm::Gdocs { googledocs_url } => format!("gdocs {}", googledocs_url),
            ImportForm::Epicollect {
                epicollect_project,
                epicollect_form,
            } => format!("epicollect {}/{}", epicollect_project, epicollect_form),
            ImportForm::Flickr { album_id } => format!("flickr album {}", album_id),
            ImportForm::Dropbox { files } => format!("dropbox ({} files)", files.len()),
        }
    }
}

// ── Task rows ────────────────────────────────────────────────────────

/// One task produced by an importer: the `info` payload plus any task
/// attributes the source set explicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskData {
    pub info: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_0: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_answers: Option<i64>,
}

impl TaskData {
    pub fn from_info(info: Map<String, Value>) -> Self {
        Self {
            info,
            ..Self::default()
        }
    }

    /// Assign a tabular cell. Task attribute columns are parsed into their
    /// typed field, every other column lands in `info` as a string.
    pub fn set_field(&mut self, column: &str, value: &str) -> Result<(), ImportError> {
        let trimmed = value.trim();
        let invalid = || ImportError::InvalidFieldValue {
            column: column.to_string(),
            value: value.to_string(),
        };
        // Empty attribute cells keep the store default.
        if TASK_FIELDS.contains(&column) && trimmed.is_empty() {
            return Ok(());
        }
        match column {
            "state" => self.state = Some(trimmed.to_string()),
            "quorum" => self.quorum = Some(trimmed.parse().map_err(|_| invalid())?),
            "calibration" => self.calibration = Some(trimmed.parse().map_err(|_| invalid())?),
            "priority_0" => self.priority_0 = Some(trimmed.parse().map_err(|_| invalid())?),
            "n_answers" => self.n_answers = Some(trimmed.parse().map_err(|_| invalid())?),
            _ => {
                self.info
                    .insert(column.to_string(), Value::String(value.to_string()));
            }
        }
        Ok(())
    }

    /// Canonical JSON text of `info`. Keys are sorted, so two rows with the
    /// same payload always serialize identically.
    pub fn info_json(&self) -> String {
        Value::Object(self.info.clone()).to_string()
    }
}

// ── Source adapter trait ─────────────────────────────────────────────

/// A remote task source.
#[async_trait]
pub trait BulkTaskImport: Send + Sync {
    fn kind(&self) -> ImporterKind;

    /// Produce the rows described by `form`.
    ///
    /// Fetching and header validation happen here; mapping individual rows
    /// happens as the returned iterator is driven.
    async fn tasks(&self, form: &ImportForm) -> Result<TaskRows, ImportError>;

    /// Number of tasks `form` would produce. Counting consumes the row
    /// sequence, so row-level errors surface here too.
    async fn count_tasks(&self, form: &ImportForm) -> Result<usize, ImportError> {
        let mut count = 0;
        for row in self.tasks(form).await? {
            row?;
            count += 1;
        }
        Ok(count)
    }
}

/// Reject a form meant for another adapter.
pub(crate) fn form_mismatch(importer: ImporterKind, form: &ImportForm) -> ImportError {
    ImportError::FormMismatch {
        importer,
        got: form.kind(),
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Endpoints and credentials the built-in adapters need.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub epicollect_base_url: String,
    pub flickr_api_url: String,
    pub flickr_api_key: Option<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            epicollect_base_url: epicollect::DEFAULT_BASE_URL.to_string(),
            flickr_api_url: flickr::DEFAULT_API_URL.to_string(),
            flickr_api_key: None,
        }
    }
}

/// Outcome of a synchronous import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

impl ImportReport {
    pub fn message(&self) -> String {
        match self.imported {
            0 => "It looks like there were no new records to import".to_string(),
            1 => "1 new task was imported successfully".to_string(),
            n => format!("{} new tasks were imported successfully", n),
        }
    }
}

/// Registry of source adapters keyed by importer kind.
pub struct Importer {
    fetcher: Arc<dyn RemoteFetcher>,
    settings: SourceSettings,
    importers: BTreeMap<ImporterKind, Arc<dyn BulkTaskImport>>,
}

impl Importer {
    /// Build the registry with the always-available adapters. Flickr is added
    /// as well when `settings` carries an API key.
    pub fn new(fetcher: Arc<dyn RemoteFetcher>, settings: SourceSettings) -> Self {
        let mut importers: BTreeMap<ImporterKind, Arc<dyn BulkTaskImport>> = BTreeMap::new();
        importers.insert(
            ImporterKind::Csv,
            Arc::new(CsvImporter::new(fetcher.clone())),
        );
        importers.insert(
            ImporterKind::Gdocs,
            Arc::new(GoogleDocsImporter::new(fetcher.clone())),
        );
        importers.insert(
            ImporterKind::Epicollect,
            Arc::new(EpiCollectImporter::new(
                fetcher.clone(),
                settings.epicollect_base_url.clone(),
            )),
        );
        importers.insert(ImporterKind::Dropbox, Arc::new(DropboxImporter));

        let mut registry = Self {
            fetcher,
            settings,
            importers,
        };
        if let Some(api_key) = registry.settings.flickr_api_key.clone() {
            registry.register_flickr_importer(api_key);
        }
        registry
    }

    pub fn register_flickr_importer(&mut self, api_key: String) {
        let importer = FlickrImporter::new(
            self.fetcher.clone(),
            api_key,
            self.settings.flickr_api_url.clone(),
        );
        self.importers.insert(ImporterKind::Flickr, Arc::new(importer));
        debug!("Registered flickr importer");
    }

    pub fn get_all_importer_names(&self) -> Vec<&'static str> {
        self.importers.keys().map(|kind| kind.as_str()).collect()
    }

    pub fn importer_for(&self, kind: ImporterKind) -> Result<&Arc<dyn BulkTaskImport>, ImportError> {
        self.importers
            .get(&kind)
            .ok_or_else(|| ImportError::UnknownImporter(kind.to_string()))
    }

    pub async fn count_tasks_to_import(&self, form: &ImportForm) -> Result<usize, ImportError> {
        self.importer_for(form.kind())?.count_tasks(form).await
    }

    /// Import every row of `form` into the project, skipping rows whose
    /// `info` payload the project already has.
    pub async fn create_tasks(
        &self,
        db: &DbHandle,
        project_id: i64,
        form: &ImportForm,
    ) -> Result<ImportReport, ImportError> {
        let kind = form.kind();
        let rows = self.importer_for(kind)?.tasks(form).await?;
        let report = db
            .call(move |db| db.import_tasks(project_id, rows))
            .await
            .map_err(ImportError::from_anyhow)?;
        info!(
            project_id,
            importer = %kind,
            imported = report.imported,
            skipped = report.skipped,
            "Imported tasks"
        );
        Ok(report)
    }
}
