//! Command-line imports: `crowdtask import` and `crowdtask importers`.

use anyhow::{Context, Result, anyhow, bail};
use std::sync::Arc;

use crowdtask::config::CrowdtaskToml;
use crowdtask::errors::PlatformError;
use crowdtask::importers::{DropboxFile, HttpFetcher, ImportForm, Importer, ImporterKind};
use crowdtask::platform::api::is_valid_short_name;
use crowdtask::platform::db::{DbHandle, PlatformDb};

use crate::ImportArgs;

pub async fn cmd_import(settings: &CrowdtaskToml, args: ImportArgs) -> Result<()> {
    let form = build_form(&args)?;
    if args.create && !is_valid_short_name(&args.short_name) {
        bail!("short_name may only contain letters, digits, '-' and '_'");
    }

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| settings.server.db_path.clone());
    let db = PlatformDb::new(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    let db = DbHandle::new(db);

    let short_name = args.short_name.clone();
    let create = args.create;
    let project = db
        .call(move |db| match db.get_project_by_short_name(&short_name)? {
            Some(project) => Ok(project),
            None if create => db.create_project(&short_name, &short_name, ""),
            None => Err(PlatformError::ProjectNotFound { short_name }.into()),
        })
        .await?;

    let fetcher = Arc::new(HttpFetcher::new(settings.request_timeout())?);
    let importer = Importer::new(fetcher, settings.source_settings());
    let report = importer.create_tasks(&db, project.id, &form).await?;

    println!("{}", report.message());
    Ok(())
}

pub fn cmd_importers(settings: &CrowdtaskToml) -> Result<()> {
    let fetcher = Arc::new(HttpFetcher::new(settings.request_timeout())?);
    let importer = Importer::new(fetcher, settings.source_settings());
    for name in importer.get_all_importer_names() {
        println!("{}", name);
    }
    Ok(())
}

fn build_form(args: &ImportArgs) -> Result<ImportForm> {
    let kind = args.kind;
    let form = match kind {
        ImporterKind::Csv => ImportForm::Csv {
            csv_url: required(&args.url, "url", kind)?,
        },
        ImporterKind::Gdocs => ImportForm::Gdocs {
            googledocs_url: required(&args.url, "url", kind)?,
        },
        ImporterKind::Epicollect => ImportForm::Epicollect {
            epicollect_project: required(&args.epicollect_project, "epicollect-project", kind)?,
            epicollect_form: required(&args.epicollect_form, "epicollect-form", kind)?,
        },
        ImporterKind::Flickr => ImportForm::Flickr {
            album_id: required(&args.album_id, "album-id", kind)?,
        },
        ImporterKind::Dropbox => {
            if args.dropbox_links.is_empty() {
                bail!("--dropbox-link is required for --type dropbox");
            }
            ImportForm::Dropbox {
                files: args
                    .dropbox_links
                    .iter()
                    .map(|link| DropboxFile {
                        name: file_name_from_link(link),
                        link: link.clone(),
                        bytes: None,
                        icon: None,
                    })
                    .collect(),
            }
        }
    };
    Ok(form)
}

fn required(value: &Option<String>, flag: &str, kind: ImporterKind) -> Result<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("--{} is required for --type {}", flag, kind))
}

/// Last path segment of a share link, without its query string.
fn file_name_from_link(link: &str) -> String {
    let path = link.split(['?', '#']).next().unwrap_or(link);
    match path.trim_end_matches('/').rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => link.to_string(),
    }
}
