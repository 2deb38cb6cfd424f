//! Typed error hierarchy for crowdtask.
//!
//! Two top-level enums cover the two subsystems:
//! - `ImportError`: bulk task import failures; `Display` is the message shown to users
//! - `PlatformError`: project store and import-job queue failures

use thiserror::Error;

use crate::importers::ImporterKind;

/// Errors raised while fetching or mapping a remote task source.
///
/// Variants fall into four classes: permission denied, wrong content type,
/// duplicate column name, and remote fetch failure. The remaining variants
/// cover malformed rows, unknown importers and storage failures during
/// `create_tasks`.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Oops! It looks like you don't have permission to access {resource}")]
    PermissionDenied { resource: &'static str },

    #[error("{message}")]
    WrongContentType { message: &'static str },

    #[error("The file you uploaded has two headers with the same name.")]
    DuplicateHeader { header: String },

    #[error("Oops! We could not fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// The remote service answered but rejected the request (e.g. Flickr `stat: fail`).
    #[error("{0}")]
    Remote(String),

    #[error("Oops! The imported data could not be read: {0}")]
    Malformed(String),

    #[error("Invalid value '{value}' in column '{column}'")]
    InvalidFieldValue { column: String, value: String },

    #[error("Unknown importer type '{0}'")]
    UnknownImporter(String),

    #[error("The {importer} importer received a {got} import form")]
    FormMismatch {
        importer: ImporterKind,
        got: ImporterKind,
    },

    #[error("Oops! Looks like there was an error!")]
    Storage(#[source] anyhow::Error),
}

impl ImportError {
    /// True when the message is safe and useful to show to the person importing.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, ImportError::Storage(_) | ImportError::FormMismatch { .. })
    }

    /// Recover an `ImportError` that travelled through an `anyhow::Error`
    /// (e.g. out of a `DbHandle::call` closure).
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<ImportError>() {
            Ok(import_err) => import_err,
            Err(other) => ImportError::Storage(other),
        }
    }
}

/// Errors from the project store and the import-job queue.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Project {short_name} not found")]
    ProjectNotFound { short_name: String },

    #[error("A project with short name '{short_name}' already exists")]
    DuplicateShortName { short_name: String },

    #[error("Import job {id} not found")]
    JobNotFound { id: i64 },

    #[error("Invalid import job transition for job {id}: {from} -> {to}")]
    InvalidJobTransition { id: i64, from: String, to: String },

    #[error("Project {short_name} already has an autoimporter")]
    AutoimporterExists { short_name: String },

    #[error("Import queue is closed")]
    QueueClosed,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PlatformError {
    /// Recover a `PlatformError` that travelled through an `anyhow::Error`.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<PlatformError>() {
            Ok(platform_err) => platform_err,
            Err(other) => match other.downcast::<ImportError>() {
                Ok(import_err) => PlatformError::Import(import_err),
                Err(other) => PlatformError::Other(other),
            },
        }
    }
}
