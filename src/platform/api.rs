use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::error;

use super::db::DbHandle;
use super::export::{self, ExportFormat, NO_TASKS_MESSAGE};
use super::jobs::{ImportDispatcher, ImportOutcome};
use super::models::{Project, TaskPage, TaskScheduler};
use super::ws::{EventMessage, broadcast_event, ws_handler};
use crate::errors::{ImportError, PlatformError};
use crate::importers::{ImportForm, ImporterKind};

/// Message returned for failures whose details only belong in the log.
pub const GENERIC_ERROR: &str = "Oops! Looks like there was an error!";

const DEFAULT_PER_PAGE: i64 = 20;
const MAX_PER_PAGE: i64 = 100;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub events: broadcast::Sender<String>,
    pub dispatcher: ImportDispatcher,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub short_name: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: ExportFormat,
}

#[derive(Deserialize)]
pub struct NAnswersRequest {
    pub n_answers: i64,
}

#[derive(Deserialize)]
pub struct SchedulerRequest {
    pub sched: String,
}

#[derive(Deserialize)]
pub struct PriorityRequest {
    pub task_ids: Vec<i64>,
    pub priority_0: f64,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<PlatformError> for ApiError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::ProjectNotFound { .. } | PlatformError::JobNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            PlatformError::DuplicateShortName { .. }
            | PlatformError::AutoimporterExists { .. }
            | PlatformError::InvalidJobTransition { .. } => ApiError::Conflict(err.to_string()),
            PlatformError::BadRequest(msg) => ApiError::BadRequest(msg),
            PlatformError::Import(import_err) => import_err.into(),
            PlatformError::QueueClosed | PlatformError::Other(_) => {
                error!(error = %err, "Request failed");
                ApiError::Internal(GENERIC_ERROR.to_string())
            }
        }
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::UnknownImporter(_) => ApiError::NotFound(err.to_string()),
            e if e.is_user_facing() => ApiError::BadRequest(e.to_string()),
            e => {
                error!(error = ?e, "Import failed");
                ApiError::Internal(GENERIC_ERROR.to_string())
            }
        }
    }
}

impl ApiError {
    fn from_anyhow(err: anyhow::Error) -> Self {
        PlatformError::from_anyhow(err).into()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/api/importers", get(list_importers))
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/{short_name}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/api/projects/{short_name}/tasks/import", post(import_tasks))
        .route(
            "/api/projects/{short_name}/tasks",
            get(list_tasks).delete(delete_tasks),
        )
        .route("/api/projects/{short_name}/tasks/export", get(export_tasks))
        .route("/api/projects/{short_name}/tasks/n_answers", put(set_n_answers))
        .route("/api/projects/{short_name}/tasks/priority", put(set_priority))
        .route(
            "/api/projects/{short_name}/tasks/scheduler",
            get(get_scheduler).put(set_scheduler),
        )
        .route(
            "/api/projects/{short_name}/tasks/{id}",
            get(get_task).delete(delete_task),
        )
        .route("/api/projects/{short_name}/stats", get(project_stats))
        .route("/api/projects/{short_name}/import-jobs", get(list_import_jobs))
        .route(
            "/api/projects/{short_name}/autoimporter",
            get(get_autoimporter)
                .post(set_autoimporter)
                .delete(delete_autoimporter),
        )
        .route("/api/import-jobs/{id}", get(get_import_job))
}

// ── Helpers ───────────────────────────────────────────────────────────

async fn load_project(state: &SharedState, short_name: String) -> Result<Project, ApiError> {
    state
        .db
        .call(move |db| db.require_project(&short_name))
        .await
        .map_err(ApiError::from_anyhow)
}

/// Parse an import form, reporting an unknown `type` as an unknown importer
/// rather than a generic payload error.
fn parse_import_form(state: &SharedState, payload: Value) -> Result<ImportForm, ApiError> {
    let kind = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("Import form needs a 'type'".into()))?;
    let kind = ImporterKind::from_str(kind)?;
    state.dispatcher.importer().importer_for(kind)?;
    serde_json::from_value(payload)
        .map_err(|e| ApiError::BadRequest(format!("Invalid {} import form: {}", kind, e)))
}

pub fn is_valid_short_name(short_name: &str) -> bool {
    !short_name.is_empty()
        && short_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_importers(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({"importers": state.dispatcher.importer().get_all_importer_names()}))
}

async fn list_projects(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let projects = state
        .db
        .call(|db| db.list_projects())
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !is_valid_short_name(&req.short_name) {
        return Err(ApiError::BadRequest(
            "short_name may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".into()));
    }
    let project = state
        .db
        .call(move |db| db.create_project(&req.short_name, &req.name, &req.description))
        .await
        .map_err(ApiError::from_anyhow)?;
    broadcast_event(&state.events, &EventMessage::ProjectCreated {
        project: project.clone(),
    });
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(load_project(&state, short_name).await?))
}

async fn update_project(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, short_name).await?;
    let updated = state
        .db
        .call(move |db| {
            db.update_project(project.id, req.name.as_deref(), req.description.as_deref())
        })
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(updated))
}

async fn delete_project(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, short_name).await?;
    let project_id = project.id;
    state
        .db
        .call(move |db| db.delete_project(project_id))
        .await
        .map_err(ApiError::from_anyhow)?;
    broadcast_event(&state.events, &EventMessage::ProjectDeleted { project_id });
    Ok(StatusCode::NO_CONTENT)
}

async fn import_tasks(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, short_name).await?;
    let form = parse_import_form(&state, payload)?;
    let outcome = state.dispatcher.dispatch_import(&project, form).await?;

    let status = match outcome {
        ImportOutcome::Imported { .. } => StatusCode::OK,
        ImportOutcome::Enqueued { .. } => StatusCode::ACCEPTED,
    };
    let mut body = serde_json::to_value(&outcome)
        .map_err(|e| ApiError::from_anyhow(anyhow::Error::from(e)))?;
    body["message"] = Value::String(outcome.message());
    Ok((status, Json(body)))
}

async fn list_tasks(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let offset = (page - 1)
        .checked_mul(per_page)
        .ok_or_else(|| ApiError::BadRequest(format!("page {} is out of range", page)))?;
    let project = load_project(&state, short_name).await?;
    let project_id = project.id;

    let (tasks, total) = state
        .db
        .call(move |db| {
            let tasks = db.list_tasks(project_id, offset, per_page)?;
            Ok((tasks, db.count_tasks(project_id)?))
        })
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(TaskPage {
        tasks,
        total,
        page,
        per_page,
    }))
}

async fn get_task(
    State(state): State<SharedState>,
    Path((short_name, id)): Path<(String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, short_name).await?;
    let project_id = project.id;
    let task = state
        .db
        .call(move |db| db.get_task(project_id, id))
        .await
        .map_err(ApiError::from_anyhow)?
        .ok_or_else(|| {
            ApiError::NotFound(format!("Task {} not found in project {}", id, project.short_name))
        })?;
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<SharedState>,
    Path((short_name, id)): Path<(String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, short_name).await?;
    let project_id = project.id;
    let removed = state
        .db
        .call(move |db| db.delete_task(project_id, id))
        .await
        .map_err(ApiError::from_anyhow)?;
    if !removed {
        return Err(ApiError::NotFound(format!(
            "Task {} not found in project {}",
            id, project.short_name
        )));
    }
    broadcast_event(&state.events, &EventMessage::TasksDeleted {
        project_id,
        deleted: 1,
    });
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_tasks(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, short_name).await?;
    let project_id = project.id;
    let deleted = state
        .db
        .call(move |db| db.delete_tasks(project_id))
        .await
        .map_err(ApiError::from_anyhow)?;
    broadcast_event(&state.events, &EventMessage::TasksDeleted {
        project_id,
        deleted,
    });
    Ok(Json(json!({"deleted": deleted})))
}

async fn export_tasks(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let project = load_project(&state, short_name).await?;
    let project_id = project.id;
    let tasks = state
        .db
        .call(move |db| db.all_tasks(project_id))
        .await
        .map_err(ApiError::from_anyhow)?;
    if tasks.is_empty() {
        return Err(ApiError::NotFound(NO_TASKS_MESSAGE.to_string()));
    }

    match query.format {
        ExportFormat::Json => {
            let value = export::tasks_to_json(&tasks).map_err(ApiError::from_anyhow)?;
            Ok(Json(value).into_response())
        }
        ExportFormat::Csv => {
            let csv = export::tasks_to_csv(&tasks).map_err(ApiError::from_anyhow)?;
            let disposition = format!("attachment; filename={}_task.csv", project.short_name);
            Ok((
                [
                    (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                csv,
            )
                .into_response())
        }
    }
}

async fn set_n_answers(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
    Json(req): Json<NAnswersRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !(1..=1000).contains(&req.n_answers) {
        return Err(ApiError::BadRequest(
            "n_answers must be between 1 and 1000".into(),
        ));
    }
    let project = load_project(&state, short_name).await?;
    let project_id = project.id;
    let updated = state
        .db
        .call(move |db| db.set_n_answers(project_id, req.n_answers))
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(json!({"updated": updated})))
}

async fn set_priority(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
    Json(req): Json<PriorityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !(0.0..=1.0).contains(&req.priority_0) {
        return Err(ApiError::BadRequest(
            "priority_0 must be between 0 and 1".into(),
        ));
    }
    let project = load_project(&state, short_name).await?;
    let project_id = project.id;
    let updated = state
        .db
        .call(move |db| db.set_priority(project_id, &req.task_ids, req.priority_0))
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(json!({"updated": updated})))
}

async fn get_scheduler(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, short_name).await?;
    Ok(Json(json!({"sched": project.sched})))
}

async fn set_scheduler(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
    Json(req): Json<SchedulerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sched = TaskScheduler::from_str(&req.sched).map_err(ApiError::BadRequest)?;
    let project = load_project(&state, short_name).await?;
    let project_id = project.id;
    let updated = state
        .db
        .call(move |db| db.set_scheduler(project_id, sched))
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(json!({"sched": updated.sched})))
}

async fn project_stats(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, short_name).await?;
    let project_id = project.id;
    let stats = state
        .db
        .call(move |db| db.project_stats(project_id))
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(stats))
}

async fn list_import_jobs(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, short_name).await?;
    let project_id = project.id;
    let jobs = state
        .db
        .call(move |db| db.list_import_jobs(project_id))
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok(Json(jobs))
}

async fn get_import_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .db
        .call(move |db| db.get_import_job(id))
        .await
        .map_err(ApiError::from_anyhow)?
        .ok_or(PlatformError::JobNotFound { id })?;
    Ok(Json(job))
}

async fn get_autoimporter(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, short_name).await?;
    Ok(Json(json!({"autoimporter": project.autoimporter})))
}

async fn set_autoimporter(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, short_name).await?;
    let form = parse_import_form(&state, payload)?;
    let project_id = project.id;
    let updated = state
        .db
        .call(move |db| db.set_autoimporter(project_id, &form))
        .await
        .map_err(ApiError::from_anyhow)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"autoimporter": updated.autoimporter})),
    ))
}

async fn delete_autoimporter(
    State(state): State<SharedState>,
    Path(short_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, short_name).await?;
    let project_id = project.id;
    let removed = state
        .db
        .call(move |db| db.delete_autoimporter(project_id))
        .await
        .map_err(ApiError::from_anyhow)?;
    if !removed {
        return Err(ApiError::NotFound(format!(
            "Project {} has no autoimporter",
            project.short_name
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importers::fetch::testing::FakeFetcher;
    use crate::importers::{Importer, SourceSettings};
    use crate::platform::db::PlatformDb;
    use crate::platform::jobs::{DispatchSettings, ENQUEUED_MESSAGE};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// App with a synchronous threshold of 2. `spawn_workers` is never
    /// called, so enqueued jobs stay queued.
    fn test_app(fetcher: FakeFetcher) -> Router {
        let db = DbHandle::new(PlatformDb::new_in_memory().unwrap());
        let (events, _) = broadcast::channel(16);
        let importer = Arc::new(Importer::new(Arc::new(fetcher), SourceSettings::default()));
        let dispatcher = ImportDispatcher::new(
            importer,
            db.clone(),
            events.clone(),
            DispatchSettings {
                max_synchronous_tasks: 2,
                workers: 1,
            },
        );
        let state = Arc::new(AppState {
            db,
            events,
            dispatcher,
        });
        api_router().with_state(state)
    }

    fn csv_app(body: &str) -> Router {
        test_app(FakeFetcher::csv(body))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn create_birds(app: &Router) {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/projects",
                json!({"short_name": "birds", "name": "Bird counting"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    async fn import_csv(app: &Router) -> Response {
        app.clone()
            .oneshot(json_request(
                "POST",
                "/api/projects/birds/tasks/import",
                json!({"type": "csv", "csv_url": "http://example.com/tasks.csv"}),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = csv_app("");
        let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_list_importers() {
        let app = csv_app("");
        let response = app
            .oneshot(empty_request("GET", "/api/importers"))
            .await
            .unwrap();
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["importers"], json!(["csv", "gdocs", "epicollect", "dropbox"]));
    }

    #[tokio::test]
    async fn test_create_and_get_project() {
        let app = csv_app("");
        create_birds(&app).await;

        let response = app
            .oneshot(empty_request("GET", "/api/projects/birds"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let project: Value = body_json(response.into_body()).await;
        assert_eq!(project["short_name"], "birds");
        assert_eq!(project["name"], "Bird counting");
        assert_eq!(project["autoimporter"], Value::Null);
    }

    #[tokio::test]
    async fn test_duplicate_short_name_conflicts() {
        let app = csv_app("");
        create_birds(&app).await;
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/projects",
                json!({"short_name": "birds", "name": "Again"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_invalid_short_name_is_rejected() {
        let app = csv_app("");
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/projects",
                json!({"short_name": "no spaces", "name": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_project_is_not_found() {
        let app = csv_app("");
        let response = app
            .oneshot(empty_request("GET", "/api/projects/ghost/stats"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_update_and_delete_project() {
        let app = csv_app("");
        create_birds(&app).await;

        let response = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                "/api/projects/birds",
                json!({"description": "Count them all"}),
            ))
            .await
            .unwrap();
        let project: Value = body_json(response.into_body()).await;
        assert_eq!(project["description"], "Count them all");
        assert_eq!(project["name"], "Bird counting");

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", "/api/projects/birds"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty_request("GET", "/api/projects/birds"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_small_import_is_synchronous() {
        let app = csv_app("Foo,Bar\n1,2\n3,4\n");
        create_birds(&app).await;

        let response = import_csv(&app).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["status"], "imported");
        assert_eq!(body["report"]["imported"], 2);
        assert_eq!(body["message"], "2 new tasks were imported successfully");

        let response = import_csv(&app).await;
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(
            body["message"],
            "It looks like there were no new records to import"
        );
    }

    #[tokio::test]
    async fn test_large_import_is_accepted_as_job() {
        let app = csv_app("Foo\n1\n2\n3\n");
        create_birds(&app).await;

        let response = import_csv(&app).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["status"], "enqueued");
        assert_eq!(body["message"], ENQUEUED_MESSAGE);
        assert_eq!(body["job"]["status"], "queued");
        let job_id = body["job"]["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/api/import-jobs/{}", job_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(empty_request("GET", "/api/projects/birds/import-jobs"))
            .await
            .unwrap();
        let jobs: Vec<Value> = body_json(response.into_body()).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["form"]["type"], "csv");
    }

    #[tokio::test]
    async fn test_import_errors_are_bad_requests_with_message() {
        let app = test_app(FakeFetcher::single(403, "text/html", ""));
        create_birds(&app).await;

        let response = import_csv(&app).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(
            body["error"],
            "Oops! It looks like you don't have permission to access that file"
        );
    }

    #[tokio::test]
    async fn test_unknown_and_unregistered_importers_are_not_found() {
        let app = csv_app("");
        create_birds(&app).await;

        for form in [
            json!({"type": "ftp", "url": "ftp://example.com"}),
            json!({"type": "flickr", "album_id": "1"}),
        ] {
            let response = app
                .clone()
                .oneshot(json_request("POST", "/api/projects/birds/tasks/import", form))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn test_incomplete_form_is_bad_request() {
        let app = csv_app("");
        create_birds(&app).await;
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/projects/birds/tasks/import",
                json!({"type": "csv"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_tasks_paginates() {
        let app = csv_app("Foo\n1\n2\n");
        create_birds(&app).await;
        import_csv(&app).await;

        let response = app
            .oneshot(empty_request("GET", "/api/projects/birds/tasks?page=2&per_page=1"))
            .await
            .unwrap();
        let page: Value = body_json(response.into_body()).await;
        assert_eq!(page["total"], 2);
        assert_eq!(page["page"], 2);
        assert_eq!(page["tasks"].as_array().unwrap().len(), 1);
        assert_eq!(page["tasks"][0]["info"]["Foo"], "2");
    }

    #[tokio::test]
    async fn test_list_tasks_rejects_page_beyond_range() {
        let app = csv_app("Foo\n1\n2\n");
        create_birds(&app).await;
        import_csv(&app).await;

        let response = app
            .oneshot(empty_request(
                "GET",
                "/api/projects/birds/tasks?page=9223372036854775807&per_page=20",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("out of range"));
    }

    async fn first_task_id(app: &Router) -> i64 {
        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/projects/birds/tasks"))
            .await
            .unwrap();
        let page: Value = body_json(response.into_body()).await;
        page["tasks"][0]["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_get_single_task() {
        let app = csv_app("Foo\n1\n2\n");
        create_birds(&app).await;
        import_csv(&app).await;
        let id = first_task_id(&app).await;

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/api/projects/birds/tasks/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let task: Value = body_json(response.into_body()).await;
        assert_eq!(task["id"], id);
        assert_eq!(task["info"]["Foo"], "1");

        let response = app
            .oneshot(empty_request("GET", "/api/projects/birds/tasks/999999"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_single_task_is_scoped_to_its_project() {
        let app = csv_app("Foo\n1\n");
        create_birds(&app).await;
        import_csv(&app).await;
        let id = first_task_id(&app).await;
        app.clone()
            .oneshot(json_request(
                "POST",
                "/api/projects",
                json!({"short_name": "fish", "name": "Fish"}),
            ))
            .await
            .unwrap();

        let uri = format!("/api/projects/fish/tasks/{}", id);
        let response = app.clone().oneshot(empty_request("GET", &uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = app.clone().oneshot(empty_request("DELETE", &uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(empty_request("GET", &format!("/api/projects/birds/tasks/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_delete_single_task() {
        let app = csv_app("Foo\n1\n2\n");
        create_birds(&app).await;
        import_csv(&app).await;
        let id = first_task_id(&app).await;
        let uri = format!("/api/projects/birds/tasks/{}", id);

        let response = app.clone().oneshot(empty_request("DELETE", &uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = app.clone().oneshot(empty_request("GET", &uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(empty_request("GET", "/api/projects/birds/tasks"))
            .await
            .unwrap();
        let page: Value = body_json(response.into_body()).await;
        assert_eq!(page["total"], 1);
    }

    #[tokio::test]
    async fn test_task_scheduler_setting() {
        let app = csv_app("");
        create_birds(&app).await;

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/projects/birds/tasks/scheduler"))
            .await
            .unwrap();
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["sched"], "default");

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/projects/birds/tasks/scheduler",
                json!({"sched": "breadth_first"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["sched"], "breadth_first");

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/projects/birds"))
            .await
            .unwrap();
        let project: Value = body_json(response.into_body()).await;
        assert_eq!(project["sched"], "breadth_first");

        let response = app
            .oneshot(json_request(
                "PUT",
                "/api/projects/birds/tasks/scheduler",
                json!({"sched": "incremental"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("Invalid task scheduler"));
    }

    #[tokio::test]
    async fn test_task_settings_validate_input() {
        let app = csv_app("Foo\n1\n2\n");
        create_birds(&app).await;
        import_csv(&app).await;

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/projects/birds/tasks/n_answers",
                json!({"n_answers": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/projects/birds/tasks/n_answers",
                json!({"n_answers": 5}),
            ))
            .await
            .unwrap();
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["updated"], 2);

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/projects/birds/tasks/priority",
                json!({"task_ids": [1], "priority_0": 1.5}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(json_request(
                "PUT",
                "/api/projects/birds/tasks/priority",
                json!({"task_ids": [1], "priority_0": 0.7}),
            ))
            .await
            .unwrap();
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["updated"], 1);
    }

    #[tokio::test]
    async fn test_stats_and_delete_tasks() {
        let app = csv_app("Foo\n1\n2\n");
        create_birds(&app).await;
        import_csv(&app).await;

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/projects/birds/stats"))
            .await
            .unwrap();
        let stats: Value = body_json(response.into_body()).await;
        assert_eq!(stats["n_tasks"], 2);

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", "/api/projects/birds/tasks"))
            .await
            .unwrap();
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["deleted"], 2);

        let response = app
            .oneshot(empty_request("GET", "/api/projects/birds/stats"))
            .await
            .unwrap();
        let stats: Value = body_json(response.into_body()).await;
        assert_eq!(stats["n_tasks"], 0);
    }

    #[tokio::test]
    async fn test_export_without_tasks_is_not_found() {
        let app = csv_app("");
        create_birds(&app).await;
        let response = app
            .oneshot(empty_request("GET", "/api/projects/birds/tasks/export?format=csv"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["error"], NO_TASKS_MESSAGE);
    }

    #[tokio::test]
    async fn test_export_csv_and_json() {
        let app = csv_app("question\nIs it a bird?\n");
        create_birds(&app).await;
        import_csv(&app).await;

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/projects/birds/tasks/export?format=csv"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/csv")
        );
        assert!(
            response.headers()[header::CONTENT_DISPOSITION]
                .to_str()
                .unwrap()
                .contains("birds_task.csv")
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.lines().next().unwrap().contains("taskinfo__question"));
        assert!(text.contains("Is it a bird?"));

        let response = app
            .oneshot(empty_request("GET", "/api/projects/birds/tasks/export"))
            .await
            .unwrap();
        let tasks: Vec<Value> = body_json(response.into_body()).await;
        assert_eq!(tasks[0]["info"]["question"], "Is it a bird?");
    }

    #[tokio::test]
    async fn test_autoimporter_lifecycle() {
        let app = csv_app("");
        create_birds(&app).await;
        let form = json!({"type": "csv", "csv_url": "http://example.com/daily.csv"});

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/projects/birds/autoimporter",
                form.clone(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/projects/birds/autoimporter", form))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/projects/birds/autoimporter"))
            .await
            .unwrap();
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["autoimporter"]["csv_url"], "http://example.com/daily.csv");

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", "/api/projects/birds/autoimporter"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty_request("DELETE", "/api/projects/birds/autoimporter"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_import_job_is_not_found() {
        let app = csv_app("");
        let response = app
            .oneshot(empty_request("GET", "/api/import-jobs/42"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_storage_errors_hide_details() {
        let err: ApiError = PlatformError::Other(anyhow::anyhow!("disk full")).into();
        assert!(matches!(err, ApiError::Internal(msg) if msg == GENERIC_ERROR));
    }
}
