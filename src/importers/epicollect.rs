use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{form_mismatch, BulkTaskImport, ImportForm, ImporterKind, RemoteFetcher, TaskData, TaskRows};
use crate::errors::ImportError;

pub const DEFAULT_BASE_URL: &str = "http://plus.epicollect.net";

/// Imports the submissions of one EpiCollect Plus form. Each submitted entry
/// becomes the `info` of one task.
pub struct EpiCollectImporter {
    fetcher: Arc<dyn RemoteFetcher>,
    base_url: String,
}

impl EpiCollectImporter {
    pub fn new(fetcher: Arc<dyn RemoteFetcher>, base_url: String) -> Self {
        Self { fetcher, base_url }
    }

    pub fn data_url(&self, project: &str, form: &str) -> String {
        format!("{}/{}/{}.json", self.base_url.trim_end_matches('/'), project, form)
    }
}

#[async_trait]
impl BulkTaskImport for EpiCollectImporter {
    fn kind(&self) -> ImporterKind {
        ImporterKind::Epicollect
    }

    async fn tasks(&self, form: &ImportForm) -> Result<TaskRows, ImportError> {
        let ImportForm::Epicollect {
            epicollect_project,
            epicollect_form,
        } = form
        else {
            return Err(form_mismatch(self.kind(), form));
        };

        let url = self.data_url(epicollect_project, epicollect_form);
        let resp = self.fetcher.get(&url, &[]).await?;
        if resp.status == 403 {
            return Err(ImportError::PermissionDenied {
                resource: "the EpiCollect Plus project",
            });
        }
        if !resp.content_type_contains("application/json") {
            return Err(ImportError::WrongContentType {
                message: "Oops! That project and form do not look like the right one.",
            });
        }

        let entries: Vec<Value> =
            serde_json::from_str(&resp.body).map_err(|e| ImportError::Malformed(e.to_string()))?;
        Ok(Box::new(entries.into_iter().map(|entry| match entry {
            Value::Object(info) => Ok(TaskData::from_info(info)),
            other => Err(ImportError::Malformed(format!(
                "expected an EpiCollect entry object, got {}",
                other
            ))),
        })))
    }
}
