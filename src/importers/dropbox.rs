use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{form_mismatch, BulkTaskImport, ImportForm, ImporterKind, TaskData, TaskRows};
use crate::errors::ImportError;

/// One file picked with the Dropbox chooser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropboxFile {
    pub name: String,
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Turns each selected file into a task. Nothing is fetched: the chooser
/// already supplies the share links.
pub struct DropboxImporter;

#[async_trait]
impl BulkTaskImport for DropboxImporter {
    fn kind(&self) -> ImporterKind {
        ImporterKind::Dropbox
    }

    async fn tasks(&self, form: &ImportForm) -> Result<TaskRows, ImportError> {
        let ImportForm::Dropbox { files } = form else {
            return Err(form_mismatch(self.kind(), form));
        };
        let tasks: Vec<TaskData> = files.iter().map(file_task).collect();
        Ok(Box::new(tasks.into_iter().map(Ok)))
    }
}

/// Direct-content variant of a share link.
pub fn raw_link(link: &str) -> String {
    link.replace("dl=0", "raw=1")
        .replace("www.dropbox.com", "dl.dropboxusercontent.com")
}

fn file_task(file: &DropboxFile) -> TaskData {
    let link_raw = raw_link(&file.link);
    let mut info = Map::new();
    info.insert("filename".into(), Value::String(file.name.clone()));
    info.insert("link".into(), Value::String(file.link.clone()));
    info.insert("link_raw".into(), Value::String(link_raw.clone()));

    if let Some(mime) = mime_guess::from_path(&file.name).first() {
        match (mime.type_().as_str(), mime.essence_str()) {
            ("image", _) => {
                info.insert("url_m".into(), Value::String(link_raw.clone()));
                info.insert("url_b".into(), Value::String(link_raw));
                info.insert("title".into(), Value::String(file.name.clone()));
            }
            ("video", _) => {
                info.insert("video_url".into(), Value::String(link_raw));
            }
            ("audio", _) => {
                info.insert("audio_url".into(), Value::String(link_raw));
            }
            (_, "application/pdf") => {
                info.insert("pdf_url".into(), Value::String(link_raw));
            }
            _ => {}
        }
    }
    TaskData::from_info(info)
}
