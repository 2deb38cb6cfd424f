use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use crate::errors::{ImportError, PlatformError};
use crate::importers::{ImportForm, ImportReport, TaskData};

/// Async-safe handle to the platform database.
///
/// Wraps `PlatformDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PlatformDb>>,
}

impl DbHandle {
    pub fn new(db: PlatformDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PlatformDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PlatformDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct PlatformDb {
    conn: Connection,
}

const PROJECT_COLUMNS: &str =
    "id, short_name, name, description, autoimporter, created_at, sched";
const TASK_COLUMNS: &str =
    "id, project_id, state, quorum, calibration, priority_0, n_answers, info, created_at";
const JOB_COLUMNS: &str =
    "id, project_id, form, origin, status, message, error, created_at, started_at, completed_at";

impl PlatformDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    short_name TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    autoimporter TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    sched TEXT NOT NULL DEFAULT 'default'
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    state TEXT NOT NULL DEFAULT 'ongoing',
                    quorum INTEGER NOT NULL DEFAULT 0,
                    calibration INTEGER NOT NULL DEFAULT 0,
                    priority_0 REAL NOT NULL DEFAULT 0.0,
                    n_answers INTEGER NOT NULL DEFAULT 30,
                    info TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS import_jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    form TEXT NOT NULL,
                    origin TEXT NOT NULL DEFAULT 'import',
                    status TEXT NOT NULL DEFAULT 'queued',
                    message TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_project_info ON tasks(project_id, info);
                CREATE INDEX IF NOT EXISTS idx_import_jobs_project ON import_jobs(project_id);
                CREATE INDEX IF NOT EXISTS idx_import_jobs_status ON import_jobs(status);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migration for databases created before `sched` existed.
        // Only "duplicate column" is ignored.
        match self.conn.execute(
            "ALTER TABLE projects ADD COLUMN sched TEXT NOT NULL DEFAULT 'default'",
            [],
        ) {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add sched column: {}", e)),
        }
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, short_name: &str, name: &str, description: &str) -> Result<Project> {
        if self.get_project_by_short_name(short_name)?.is_some() {
            return Err(PlatformError::DuplicateShortName {
                short_name: short_name.to_string(),
            }
            .into());
        }
        self.conn
            .execute(
                "INSERT INTO projects (short_name, name, description) VALUES (?1, ?2, ?3)",
                params![short_name, name, description],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM projects ORDER BY id", PROJECT_COLUMNS))
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], ProjectRow::from_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?.into_project()?);
        }
        Ok(projects)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS),
                params![id],
                ProjectRow::from_row,
            )
            .optional()
            .context("Failed to query project")?;
        row.map(ProjectRow::into_project).transpose()
    }

    pub fn get_project_by_short_name(&self, short_name: &str) -> Result<Option<Project>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE short_name = ?1", PROJECT_COLUMNS),
                params![short_name],
                ProjectRow::from_row,
            )
            .optional()
            .context("Failed to query project by short name")?;
        row.map(ProjectRow::into_project).transpose()
    }

    /// Like `get_project_by_short_name`, but a missing project is a
    /// `PlatformError::ProjectNotFound`.
    pub fn require_project(&self, short_name: &str) -> Result<Project> {
        self.get_project_by_short_name(short_name)?.ok_or_else(|| {
            PlatformError::ProjectNotFound {
                short_name: short_name.to_string(),
            }
            .into()
        })
    }

    pub fn update_project(
        &self,
        id: i64,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Project> {
        self.conn
            .execute(
                "UPDATE projects SET name = COALESCE(?1, name), description = COALESCE(?2, description) WHERE id = ?3",
                params![name, description, id],
            )
            .context("Failed to update project")?;
        self.get_project(id)?
            .context("Project not found after update")
    }

    /// Delete a project. Its tasks and import jobs go with it.
    pub fn delete_project(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .context("Failed to delete project")?;
        Ok(affected > 0)
    }

    /// Store the task scheduler the project hands tasks out with.
    pub fn set_scheduler(&self, id: i64, sched: TaskScheduler) -> Result<Project> {
        self.conn
            .execute(
                "UPDATE projects SET sched = ?1 WHERE id = ?2",
                params![sched.as_str(), id],
            )
            .context("Failed to update task scheduler")?;
        self.get_project(id)?
            .context("Project not found after updating scheduler")
    }

    // ── Autoimporter ──────────────────────────────────────────────────

    pub fn set_autoimporter(&self, id: i64, form: &ImportForm) -> Result<Project> {
        let project = self.get_project(id)?.context("Project not found")?;
        if project.autoimporter.is_some() {
            return Err(PlatformError::AutoimporterExists {
                short_name: project.short_name,
            }
            .into());
        }
        let json = serde_json::to_string(form).context("Failed to serialize autoimporter")?;
        self.conn
            .execute(
                "UPDATE projects SET autoimporter = ?1 WHERE id = ?2",
                params![json, id],
            )
            .context("Failed to set autoimporter")?;
        self.get_project(id)?
            .context("Project not found after setting autoimporter")
    }

    /// Returns whether an autoimporter was removed.
    pub fn delete_autoimporter(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "UPDATE projects SET autoimporter = NULL WHERE id = ?1 AND autoimporter IS NOT NULL",
                params![id],
            )
            .context("Failed to delete autoimporter")?;
        Ok(affected > 0)
    }

    pub fn list_autoimport_projects(&self) -> Result<Vec<Project>> {
        Ok(self
            .list_projects()?
            .into_iter()
            .filter(|p| p.autoimporter.is_some())
            .collect())
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    /// Whether the project already has a task with exactly this `info`.
    pub fn task_exists(&self, project_id: i64, info_json: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM tasks WHERE project_id = ?1 AND info = ?2 LIMIT 1",
                params![project_id, info_json],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up task by info")?;
        Ok(found.is_some())
    }

    pub fn insert_task(&self, project_id: i64, task: &TaskData) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO tasks (project_id, state, quorum, calibration, priority_0, n_answers, info)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    project_id,
                    task.state.as_deref().unwrap_or(DEFAULT_TASK_STATE),
                    task.quorum.unwrap_or(0),
                    task.calibration.unwrap_or(0),
                    task.priority_0.unwrap_or(0.0),
                    task.n_answers.unwrap_or(DEFAULT_N_ANSWERS),
                    task.info_json(),
                ],
            )
            .context("Failed to insert task")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Save every row whose `info` the project does not have yet.
    ///
    /// Runs in one transaction: a row error (bad cell, broken record) rolls
    /// back the whole import and is returned as the `ImportError` itself.
    pub fn import_tasks<I>(&self, project_id: i64, rows: I) -> Result<ImportReport>
    where
        I: IntoIterator<Item = std::result::Result<TaskData, ImportError>>,
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin import transaction")?;
        let mut report = ImportReport::default();
        for row in rows {
            let task = row?;
            if self.task_exists(project_id, &task.info_json())? {
                report.skipped += 1;
                continue;
            }
            self.insert_task(project_id, &task)?;
            report.imported += 1;
        }
        tx.commit().context("Failed to commit imported tasks")?;
        Ok(report)
    }

    pub fn list_tasks(&self, project_id: i64, offset: i64, limit: i64) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM tasks WHERE project_id = ?1 ORDER BY id LIMIT ?2 OFFSET ?3",
                TASK_COLUMNS
            ))
            .context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map(params![project_id, limit, offset], TaskRow::from_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    /// A single task, only if it belongs to `project_id`.
    pub fn get_task(&self, project_id: i64, task_id: i64) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM tasks WHERE id = ?1 AND project_id = ?2",
                    TASK_COLUMNS
                ),
                params![task_id, project_id],
                TaskRow::from_row,
            )
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Returns whether the task existed in `project_id` and was removed.
    pub fn delete_task(&self, project_id: i64, task_id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM tasks WHERE id = ?1 AND project_id = ?2",
                params![task_id, project_id],
            )
            .context("Failed to delete task")?;
        Ok(affected > 0)
    }

    pub fn all_tasks(&self, project_id: i64) -> Result<Vec<Task>> {
        self.list_tasks(project_id, 0, -1)
    }

    pub fn count_tasks(&self, project_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to count tasks")
    }

    pub fn delete_tasks(&self, project_id: i64) -> Result<usize> {
        self.conn
            .execute("DELETE FROM tasks WHERE project_id = ?1", params![project_id])
            .context("Failed to delete tasks")
    }

    /// Set the redundancy of every task in the project.
    pub fn set_n_answers(&self, project_id: i64, n_answers: i64) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE tasks SET n_answers = ?1 WHERE project_id = ?2",
                params![n_answers, project_id],
            )
            .context("Failed to update n_answers")
    }

    /// Set `priority_0` on the given tasks. Ids from other projects are ignored.
    pub fn set_priority(&self, project_id: i64, task_ids: &[i64], priority: f64) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin priority transaction")?;
        let mut updated = 0;
        for id in task_ids {
            updated += self
                .conn
                .execute(
                    "UPDATE tasks SET priority_0 = ?1 WHERE id = ?2 AND project_id = ?3",
                    params![priority, id, project_id],
                )
                .context("Failed to update task priority")?;
        }
        tx.commit().context("Failed to commit priority update")?;
        Ok(updated)
    }

    pub fn project_stats(&self, project_id: i64) -> Result<ProjectStats> {
        let (n_tasks, n_completed_tasks, last_task_created_at): (i64, i64, Option<String>) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(state = 'completed'), 0), MAX(created_at)
                 FROM tasks WHERE project_id = ?1",
                params![project_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("Failed to compute task stats")?;
        let n_pending_imports: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM import_jobs WHERE project_id = ?1 AND status IN ('queued', 'running')",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to count pending imports")?;
        let overall_progress = if n_tasks == 0 {
            0.0
        } else {
            n_completed_tasks as f64 * 100.0 / n_tasks as f64
        };
        Ok(ProjectStats {
            project_id,
            n_tasks,
            n_completed_tasks,
            overall_progress,
            n_pending_imports,
            last_task_created_at,
        })
    }

    // ── Import jobs ───────────────────────────────────────────────────

    pub fn create_import_job(
        &self,
        project_id: i64,
        form: &ImportForm,
        origin: JobOrigin,
    ) -> Result<ImportJob> {
        let json = serde_json::to_string(form).context("Failed to serialize import form")?;
        self.conn
            .execute(
                "INSERT INTO import_jobs (project_id, form, origin) VALUES (?1, ?2, ?3)",
                params![project_id, json, origin.as_str()],
            )
            .context("Failed to insert import job")?;
        let id = self.conn.last_insert_rowid();
        self.get_import_job(id)?
            .context("Import job not found after insert")
    }

    pub fn get_import_job(&self, id: i64) -> Result<Option<ImportJob>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM import_jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                JobRow::from_row,
            )
            .optional()
            .context("Failed to query import job")?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn list_import_jobs(&self, project_id: i64) -> Result<Vec<ImportJob>> {
        self.query_jobs(
            &format!(
                "SELECT {} FROM import_jobs WHERE project_id = ?1 ORDER BY id DESC",
                JOB_COLUMNS
            ),
            params![project_id],
        )
    }

    pub fn list_jobs_with_status(&self, status: JobStatus) -> Result<Vec<ImportJob>> {
        self.query_jobs(
            &format!(
                "SELECT {} FROM import_jobs WHERE status = ?1 ORDER BY id",
                JOB_COLUMNS
            ),
            params![status.as_str()],
        )
    }

    fn query_jobs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<ImportJob>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare job query")?;
        let rows = stmt
            .query_map(params, JobRow::from_row)
            .context("Failed to query import jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read import job row")?.into_job()?);
        }
        Ok(jobs)
    }

    /// Move a job to `next`, recording the result message or error.
    /// Transitions outside `queued -> running -> completed | failed` are
    /// rejected with `PlatformError::InvalidJobTransition`.
    pub fn update_job_status(
        &self,
        id: i64,
        next: JobStatus,
        message: Option<&str>,
        error: Option<&str>,
    ) -> Result<ImportJob> {
        let job = self
            .get_import_job(id)?
            .ok_or(PlatformError::JobNotFound { id })?;
        if !job.status.can_transition_to(next) {
            return Err(PlatformError::InvalidJobTransition {
                id,
                from: job.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }

        let sql = match next {
            JobStatus::Running => {
                "UPDATE import_jobs SET status = ?1, message = ?2, error = ?3, started_at = datetime('now') WHERE id = ?4"
            }
            s if s.is_terminal() => {
                "UPDATE import_jobs SET status = ?1, message = ?2, error = ?3, completed_at = datetime('now') WHERE id = ?4"
            }
            _ => "UPDATE import_jobs SET status = ?1, message = ?2, error = ?3 WHERE id = ?4",
        };
        self.conn
            .execute(sql, params![next.as_str(), message, error, id])
            .context("Failed to update import job")?;
        self.get_import_job(id)?
            .context("Import job not found after update")
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

struct ProjectRow {
    id: i64,
    short_name: String,
    name: String,
    description: String,
    autoimporter: Option<String>,
    created_at: String,
    sched: String,
}

impl ProjectRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            short_name: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            autoimporter: row.get(4)?,
            created_at: row.get(5)?,
            sched: row.get(6)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        let autoimporter = self
            .autoimporter
            .map(|json| serde_json::from_str::<ImportForm>(&json))
            .transpose()
            .context("Failed to parse autoimporter JSON")?;
        let sched = TaskScheduler::from_str(&self.sched).map_err(|e| anyhow::anyhow!(e))?;
        Ok(Project {
            id: self.id,
            short_name: self.short_name,
            name: self.name,
            description: self.description,
            autoimporter,
            sched,
            created_at: self.created_at,
        })
    }
}

struct TaskRow {
    id: i64,
    project_id: i64,
    state: String,
    quorum: i64,
    calibration: i64,
    priority_0: f64,
    n_answers: i64,
    info: String,
    created_at: String,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            state: row.get(2)?,
            quorum: row.get(3)?,
            calibration: row.get(4)?,
            priority_0: row.get(5)?,
            n_answers: row.get(6)?,
            info: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let info = serde_json::from_str(&self.info).context("Failed to parse task info JSON")?;
        Ok(Task {
            id: self.id,
            project_id: self.project_id,
            state: self.state,
            quorum: self.quorum,
            calibration: self.calibration,
            priority_0: self.priority_0,
            n_answers: self.n_answers,
            info,
            created_at: self.created_at,
        })
    }
}

struct JobRow {
    id: i64,
    project_id: i64,
    form: String,
    origin: String,
    status: String,
    message: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            form: row.get(2)?,
            origin: row.get(3)?,
            status: row.get(4)?,
            message: row.get(5)?,
            error: row.get(6)?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn into_job(self) -> Result<ImportJob> {
        let form = serde_json::from_str(&self.form).context("Failed to parse import form JSON")?;
        let origin = JobOrigin::from_str(&self.origin)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse import job origin")?;
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse import job status")?;
        Ok(ImportJob {
            id: self.id,
            project_id: self.project_id,
            form,
            origin,
            status,
            message: self.message,
            error: self.error,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
