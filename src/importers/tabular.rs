//! CSV files and Google Docs spreadsheets.
//!
//! Both sources are plain CSV once fetched: the first record is the header,
//! every following record becomes a task.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;

use super::{form_mismatch, BulkTaskImport, ImportForm, ImporterKind, RemoteFetcher, TaskData, TaskRows};
use crate::errors::ImportError;

const WRONG_FILE: &str = "Oops! That file doesn't look like the right file.";

pub struct CsvImporter {
    fetcher: Arc<dyn RemoteFetcher>,
}

impl CsvImporter {
    pub fn new(fetcher: Arc<dyn RemoteFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl BulkTaskImport for CsvImporter {
    fn kind(&self) -> ImporterKind {
        ImporterKind::Csv
    }

    async fn tasks(&self, form: &ImportForm) -> Result<TaskRows, ImportError> {
        let ImportForm::Csv { csv_url } = form else {
            return Err(form_mismatch(self.kind(), form));
        };
        fetch_csv_rows(self.fetcher.as_ref(), csv_url).await
    }
}

pub struct GoogleDocsImporter {
    fetcher: Arc<dyn RemoteFetcher>,
}

impl GoogleDocsImporter {
    pub fn new(fetcher: Arc<dyn RemoteFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl BulkTaskImport for GoogleDocsImporter {
    fn kind(&self) -> ImporterKind {
        ImporterKind::Gdocs
    }

    async fn tasks(&self, form: &ImportForm) -> Result<TaskRows, ImportError> {
        let ImportForm::Gdocs { googledocs_url } = form else {
            return Err(form_mismatch(self.kind(), form));
        };
        fetch_csv_rows(self.fetcher.as_ref(), &google_docs_csv_url(googledocs_url)).await
    }
}

/// Turn a spreadsheet share link into its CSV export link.
///
/// Old-style links (`ccc?key=...`) take an `output` parameter. New-style
/// links are cut before the first `edit` path segment and pointed at the
/// export endpoint.
pub fn google_docs_csv_url(url: &str) -> String {
    if url.contains("ccc?key") {
        return format!("{}&output=csv", url);
    }
    let base = url.split("edit").next().unwrap_or(url);
    format!("{}export?format=csv", base)
}

async fn fetch_csv_rows(fetcher: &dyn RemoteFetcher, url: &str) -> Result<TaskRows, ImportError> {
    let resp = fetcher.get(url, &[]).await?;
    if resp.status == 403 {
        return Err(ImportError::PermissionDenied {
            resource: "that file",
        });
    }
    if !(resp.content_type_contains("text/plain") || resp.content_type_contains("text/csv")) {
        return Err(ImportError::WrongContentType {
            message: WRONG_FILE,
        });
    }
    csv_task_rows(resp.body)
}

/// Parse a CSV body. The header is read and checked for duplicates up
/// front; data records are mapped lazily.
pub fn csv_task_rows(body: String) -> Result<TaskRows, ImportError> {
    let reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(Cursor::new(body.into_bytes()));
    let mut records = reader.into_records();

    let headers: Vec<String> = match records.next() {
        None => return Ok(Box::new(std::iter::empty())),
        Some(record) => record
            .map_err(|e| ImportError::Malformed(e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect(),
    };

    let mut seen = HashSet::new();
    for header in &headers {
        if !seen.insert(header.as_str()) {
            return Err(ImportError::DuplicateHeader {
                header: header.clone(),
            });
        }
    }

    Ok(Box::new(CsvTaskRows { headers, records }))
}

struct CsvTaskRows {
    headers: Vec<String>,
    records: csv::StringRecordsIntoIter<Cursor<Vec<u8>>>,
}

impl CsvTaskRows {
    fn map_record(&self, record: &csv::StringRecord) -> Result<TaskData, ImportError> {
        if record.len() > self.headers.len() {
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            return Err(ImportError::Malformed(format!(
                "line {} has {} fields but the header has {}",
                line,
                record.len(),
                self.headers.len()
            )));
        }
        let mut task = TaskData::default();
        for (header, cell) in self.headers.iter().zip(record.iter()) {
            task.set_field(header, cell)?;
        }
        Ok(task)
    }
}

impl Iterator for CsvTaskRows {
    type Item = Result<TaskData, ImportError>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = match self.records.next()? {
            Ok(record) => record,
            Err(e) => return Some(Err(ImportError::Malformed(e.to_string()))),
        };
        Some(self.map_record(&record))
    }
}
