use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::{form_mismatch, BulkTaskImport, FetchedResponse, ImportForm, ImporterKind, RemoteFetcher, TaskData, TaskRows};
use crate::errors::ImportError;

pub const DEFAULT_API_URL: &str = "https://api.flickr.com/services/rest/";

/// Upper bound on pages fetched for one album, whatever the API reports.
const MAX_PAGES: u64 = 1_000;

/// Imports the photos of a Flickr photo set. Requires an API key.
pub struct FlickrImporter {
    fetcher: Arc<dyn RemoteFetcher>,
    api_key: String,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct PhotosetEnvelope {
    stat: String,
    message: Option<String>,
    photoset: Option<Photoset>,
}

/// Flickr sends numeric fields either as numbers or as strings depending on
/// the endpoint, so they are kept as raw values and read with [`as_count`].
#[derive(Debug, Deserialize)]
struct Photoset {
    #[serde(default)]
    photo: Vec<FlickrPhoto>,
    #[serde(default)]
    pages: Value,
    #[serde(default)]
    perpage: Value,
    #[serde(default)]
    total: Value,
}

impl Photoset {
    /// Pages the album can plausibly span: enough to hold `total` photos at
    /// `perpage` each, never more than [`MAX_PAGES`].
    fn page_limit(&self) -> u64 {
        match (as_count(&self.total), as_count(&self.perpage)) {
            (Some(total), Some(perpage)) if perpage > 0 => {
                total.div_ceil(perpage).clamp(1, MAX_PAGES)
            }
            _ => MAX_PAGES,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FlickrPhoto {
    id: String,
    secret: String,
    server: String,
    farm: Value,
    #[serde(default)]
    title: String,
}

impl FlickrPhoto {
    fn into_task(self) -> TaskData {
        let farm = match self.farm {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let base = format!(
            "https://farm{}.staticflickr.com/{}/{}_{}",
            farm, self.server, self.id, self.secret
        );
        let mut info = Map::new();
        info.insert("title".into(), Value::String(self.title));
        info.insert("url".into(), Value::String(format!("{}.jpg", base)));
        info.insert("url_m".into(), Value::String(format!("{}_m.jpg", base)));
        info.insert("url_b".into(), Value::String(format!("{}_b.jpg", base)));
        TaskData::from_info(info)
    }
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl FlickrImporter {
    pub fn new(fetcher: Arc<dyn RemoteFetcher>, api_key: String, api_url: String) -> Self {
        Self {
            fetcher,
            api_key,
            api_url,
        }
    }

    async fn fetch_page(&self, album_id: &str, page: u64) -> Result<Photoset, ImportError> {
        let query = [
            ("method", "flickr.photosets.getPhotos".to_string()),
            ("api_key", self.api_key.clone()),
            ("photoset_id", album_id.to_string()),
            ("format", "json".to_string()),
            ("nojsoncallback", "1".to_string()),
            ("page", page.to_string()),
        ];
        let resp = self.fetcher.get(&self.api_url, &query).await?;
        parse_photoset(resp)
    }

    /// First page plus every remaining page, photos concatenated in order.
    async fn album_info(&self, album_id: &str) -> Result<Photoset, ImportError> {
        let mut album = self.fetch_page(album_id, 1).await?;
        let pages = as_count(&album.pages).unwrap_or(1);
        let limit = album.page_limit();
        if pages > limit {
            return Err(ImportError::Malformed(format!(
                "flickr photoset reports {} pages, expected at most {}",
                pages, limit
            )));
        }
        for page in 2..=pages {
            let next = self.fetch_page(album_id, page).await?;
            album.photo.extend(next.photo);
        }
        debug!(album_id, pages, photos = album.photo.len(), "Fetched flickr album");
        Ok(album)
    }
}

/// A response is usable only when it is a 200 whose `stat` is `ok`. Anything
/// else is reported with the API's own message, or the raw body when there
/// is none.
fn parse_photoset(resp: FetchedResponse) -> Result<Photoset, ImportError> {
    let envelope: Option<PhotosetEnvelope> = serde_json::from_str(&resp.body).ok();
    match envelope {
        Some(PhotosetEnvelope {
            stat,
            photoset: Some(photoset),
            ..
        }) if resp.status == 200 && stat == "ok" => Ok(photoset),
        Some(PhotosetEnvelope {
            message: Some(message),
            ..
        }) => Err(ImportError::Remote(message)),
        _ => Err(ImportError::Remote(resp.body)),
    }
}

#[async_trait]
impl BulkTaskImport for FlickrImporter {
    fn kind(&self) -> ImporterKind {
        ImporterKind::Flickr
    }

    async fn tasks(&self, form: &ImportForm) -> Result<TaskRows, ImportError> {
        let ImportForm::Flickr { album_id } = form else {
            return Err(form_mismatch(self.kind(), form));
        };
        let album = self.album_info(album_id).await?;
        Ok(Box::new(
            album.photo.into_iter().map(|photo| Ok(photo.into_task())),
        ))
    }

    /// The album total comes with the first page, so counting needs one
    /// request regardless of album size.
    async fn count_tasks(&self, form: &ImportForm) -> Result<usize, ImportError> {
        let ImportForm::Flickr { album_id } = form else {
            return Err(form_mismatch(self.kind(), form));
        };
        let first = self.fetch_page(album_id, 1).await?;
        as_count(&first.total)
            .map(|total| total as usize)
            .ok_or_else(|| ImportError::Malformed("flickr photoset has no total".into()))
    }
}
