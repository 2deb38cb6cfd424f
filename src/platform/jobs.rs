//! Sync/async import dispatch.
//!
//! Small imports run inline in the request. Imports above the configured
//! threshold become `ImportJob` rows and are pushed onto an mpsc queue that a
//! fixed pool of workers drains. The autoimport scheduler feeds the same queue.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::db::DbHandle;
use super::models::{ImportJob, JobOrigin, JobStatus, Project};
use super::ws::{EventMessage, broadcast_event};
use crate::errors::PlatformError;
use crate::importers::{ImportForm, ImportReport, Importer};

/// Shown when an import is handed to the background queue.
pub const ENQUEUED_MESSAGE: &str = "You're trying to import a large amount of tasks, so please be patient. You will receive an email when the tasks are ready.";

/// Error recorded on jobs that were running when the process stopped.
pub const INTERRUPTED_ERROR: &str = "interrupted by shutdown";

const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// Largest estimated task count imported inline.
    pub max_synchronous_tasks: usize,
    pub workers: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_synchronous_tasks: 200,
            workers: 1,
        }
    }
}

/// Result of `dispatch_import`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImportOutcome {
    Imported { report: ImportReport },
    Enqueued { job: ImportJob },
}

impl ImportOutcome {
    pub fn message(&self) -> String {
        match self {
            ImportOutcome::Imported { report } => report.message(),
            ImportOutcome::Enqueued { .. } => ENQUEUED_MESSAGE.to_string(),
        }
    }
}

/// Counts of jobs touched by startup recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    pub failed: usize,
    pub requeued: usize,
}

/// Everything a worker needs to run one job.
#[derive(Clone)]
struct JobContext {
    importer: Arc<Importer>,
    db: DbHandle,
    events: broadcast::Sender<String>,
}

impl JobContext {
    async fn run_job(&self, job_id: i64) -> Result<ImportJob, PlatformError> {
        let job = self
            .db
            .call(move |db| db.update_job_status(job_id, JobStatus::Running, None, None))
            .await
            .map_err(PlatformError::from_anyhow)?;
        broadcast_event(&self.events, &EventMessage::ImportJobStarted { job: job.clone() });
        info!(job_id, project_id = job.project_id, form = %job.form.describe(), "Import job started");

        match self
            .importer
            .create_tasks(&self.db, job.project_id, &job.form)
            .await
        {
            Ok(report) => {
                let message = report.message();
                let done = self
                    .db
                    .call(move |db| {
                        db.update_job_status(job_id, JobStatus::Completed, Some(&message), None)
                    })
                    .await
                    .map_err(PlatformError::from_anyhow)?;
                broadcast_event(
                    &self.events,
                    &EventMessage::TasksImported {
                        project_id: done.project_id,
                        imported: report.imported,
                        skipped: report.skipped,
                        message: report.message(),
                    },
                );
                broadcast_event(&self.events, &EventMessage::ImportJobCompleted { job: done.clone() });
                info!(job_id, imported = report.imported, "Import job completed");
                Ok(done)
            }
            Err(e) => {
                warn!(job_id, error = %e, "Import job failed");
                let reason = e.to_string();
                let failed = self
                    .db
                    .call(move |db| db.update_job_status(job_id, JobStatus::Failed, None, Some(&reason)))
                    .await
                    .map_err(PlatformError::from_anyhow)?;
                broadcast_event(&self.events, &EventMessage::ImportJobFailed { job: failed.clone() });
                Ok(failed)
            }
        }
    }
}

/// Handles of the spawned worker tasks.
pub struct ImportWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl ImportWorkers {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop the workers. A job in progress is cut short and will be marked
    /// failed by the next startup recovery.
    pub fn abort(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Routes imports to the inline path or the background queue.
#[derive(Clone)]
pub struct ImportDispatcher {
    ctx: JobContext,
    queue: mpsc::Sender<i64>,
    pending: Arc<Mutex<mpsc::Receiver<i64>>>,
    settings: DispatchSettings,
}

impl ImportDispatcher {
    pub fn new(
        importer: Arc<Importer>,
        db: DbHandle,
        events: broadcast::Sender<String>,
        settings: DispatchSettings,
    ) -> Self {
        let (queue, rx) = mpsc::channel::<i64>(QUEUE_CAPACITY);
        Self {
            ctx: JobContext {
                importer,
                db,
                events,
            },
            queue,
            pending: Arc::new(Mutex::new(rx)),
            settings,
        }
    }

    /// Spawn `settings.workers` queue workers (at least one). Jobs queued
    /// before the workers exist wait in the channel.
    pub fn spawn_workers(&self) -> ImportWorkers {
        let handles = (0..self.settings.workers.max(1))
            .map(|worker| {
                let rx = self.pending.clone();
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    loop {
                        let next = { rx.lock().await.recv().await };
                        let Some(job_id) = next else {
                            break;
                        };
                        if let Err(e) = ctx.run_job(job_id).await {
                            error!(worker, job_id, error = %e, "Import worker could not run job");
                        }
                    }
                })
            })
            .collect();
        ImportWorkers { handles }
    }

    pub fn importer(&self) -> &Importer {
        &self.ctx.importer
    }

    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }

    /// Estimate the size of the import, then either run it now or queue it.
    pub async fn dispatch_import(
        &self,
        project: &Project,
        form: ImportForm,
    ) -> Result<ImportOutcome, PlatformError> {
        let count = self.ctx.importer.count_tasks_to_import(&form).await?;
        if count <= self.settings.max_synchronous_tasks {
            let report = self
                .ctx
                .importer
                .create_tasks(&self.ctx.db, project.id, &form)
                .await?;
            broadcast_event(
                &self.ctx.events,
                &EventMessage::TasksImported {
                    project_id: project.id,
                    imported: report.imported,
                    skipped: report.skipped,
                    message: report.message(),
                },
            );
            return Ok(ImportOutcome::Imported { report });
        }

        info!(
            project_id = project.id,
            count,
            threshold = self.settings.max_synchronous_tasks,
            "Import exceeds synchronous threshold, queueing"
        );
        let job = self.enqueue(project.id, form, JobOrigin::Import).await?;
        Ok(ImportOutcome::Enqueued { job })
    }

    /// Persist a queued job and hand it to the workers.
    pub async fn enqueue(
        &self,
        project_id: i64,
        form: ImportForm,
        origin: JobOrigin,
    ) -> Result<ImportJob, PlatformError> {
        let job = self
            .ctx
            .db
            .call(move |db| db.create_import_job(project_id, &form, origin))
            .await
            .map_err(PlatformError::from_anyhow)?;
        broadcast_event(&self.ctx.events, &EventMessage::ImportJobQueued { job: job.clone() });
        self.queue
            .send(job.id)
            .await
            .map_err(|_| PlatformError::QueueClosed)?;
        Ok(job)
    }

    /// Run a queued job on the current task instead of a worker.
    pub async fn run_job(&self, job_id: i64) -> Result<ImportJob, PlatformError> {
        self.ctx.run_job(job_id).await
    }

    /// Settle jobs left over from a previous process: `running` jobs are
    /// marked failed, `queued` jobs go back on the queue.
    pub async fn recover_jobs(&self) -> Result<Recovery, PlatformError> {
        let (interrupted, queued) = self
            .ctx
            .db
            .call(|db| {
                let mut interrupted = Vec::new();
                for job in db.list_jobs_with_status(JobStatus::Running)? {
                    interrupted.push(db.update_job_status(
                        job.id,
                        JobStatus::Failed,
                        None,
                        Some(INTERRUPTED_ERROR),
                    )?);
                }
                Ok((interrupted, db.list_jobs_with_status(JobStatus::Queued)?))
            })
            .await
            .map_err(PlatformError::from_anyhow)?;

        for job in &interrupted {
            broadcast_event(&self.ctx.events, &EventMessage::ImportJobFailed { job: job.clone() });
        }
        for job in &queued {
            self.queue
                .send(job.id)
                .await
                .map_err(|_| PlatformError::QueueClosed)?;
        }

        let recovery = Recovery {
            failed: interrupted.len(),
            requeued: queued.len(),
        };
        if recovery != Recovery::default() {
            info!(
                failed = recovery.failed,
                requeued = recovery.requeued,
                "Recovered import jobs"
            );
        }
        Ok(recovery)
    }

    /// Queue one background import per project with an autoimporter,
    /// regardless of its size.
    pub async fn run_autoimports(&self) -> Result<Vec<ImportJob>, PlatformError> {
        let projects = self
            .ctx
            .db
            .call(|db| db.list_autoimport_projects())
            .await
            .map_err(PlatformError::from_anyhow)?;

        let mut jobs = Vec::new();
        for project in projects {
            let Some(form) = project.autoimporter else {
                continue;
            };
            jobs.push(self.enqueue(project.id, form, JobOrigin::Autoimport).await?);
        }
        info!(count = jobs.len(), "Queued autoimport jobs");
        Ok(jobs)
    }
}

/// Tick every `interval` and queue the autoimports. The first run happens
/// one full interval after startup.
pub fn spawn_autoimport_scheduler(dispatcher: ImportDispatcher, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = dispatcher.run_autoimports().await {
                error!(error = %e, "Autoimport run failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ImportError;
    use crate::importers::SourceSettings;
    use crate::importers::fetch::testing::FakeFetcher;
    use crate::platform::db::PlatformDb;
    use crate::platform::models::JobOrigin;

    struct Harness {
        dispatcher: ImportDispatcher,
        workers: Option<ImportWorkers>,
        db: DbHandle,
        project: Project,
        events: broadcast::Receiver<String>,
    }

    /// `workers == 0` leaves the queue undrained.
    fn harness(fetcher: FakeFetcher, max_synchronous_tasks: usize, workers: usize) -> Harness {
        let db = PlatformDb::new_in_memory().unwrap();
        let project = db.create_project("birds", "Birds", "").unwrap();
        let db = DbHandle::new(db);
        let (tx, events) = broadcast::channel(64);
        let importer = Arc::new(Importer::new(Arc::new(fetcher), SourceSettings::default()));
        let dispatcher = ImportDispatcher::new(
            importer,
            db.clone(),
            tx,
            DispatchSettings {
                max_synchronous_tasks,
                workers,
            },
        );
        let workers = (workers > 0).then(|| dispatcher.spawn_workers());
        Harness {
            dispatcher,
            workers,
            db,
            project,
            events,
        }
    }

    fn csv_form() -> ImportForm {
        ImportForm::Csv {
            csv_url: "http://example.com/tasks.csv".into(),
        }
    }

    async fn wait_for_event(events: &mut broadcast::Receiver<String>, kind: &str) -> String {
        let needle = format!("\"type\":\"{}\"", kind);
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let msg = events.recv().await.unwrap();
                if msg.contains(&needle) {
                    return msg;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_small_import_runs_inline() {
        let mut h = harness(FakeFetcher::csv("Foo\n1\n2\n"), 2, 1);
        let outcome = h
            .dispatcher
            .dispatch_import(&h.project, csv_form())
            .await
            .unwrap();

        assert!(matches!(outcome, ImportOutcome::Imported { report } if report.imported == 2));
        assert_eq!(outcome.message(), "2 new tasks were imported successfully");
        wait_for_event(&mut h.events, "TasksImported").await;
        assert!(h.workers.is_some_and(|w| w.len() == 1));
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let h = harness(FakeFetcher::csv("Foo\n1\n2\n3\n"), 3, 1);
        let outcome = h
            .dispatcher
            .dispatch_import(&h.project, csv_form())
            .await
            .unwrap();
        assert!(matches!(outcome, ImportOutcome::Imported { .. }));
    }

    #[tokio::test]
    async fn test_large_import_is_enqueued_and_processed() {
        let mut h = harness(FakeFetcher::csv("Foo\n1\n2\n3\n"), 2, 1);
        let outcome = h
            .dispatcher
            .dispatch_import(&h.project, csv_form())
            .await
            .unwrap();

        let ImportOutcome::Enqueued { job } = &outcome else {
            panic!("expected enqueued outcome, got {:?}", outcome);
        };
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.origin, JobOrigin::Import);
        assert_eq!(outcome.message(), ENQUEUED_MESSAGE);

        let completed = wait_for_event(&mut h.events, "ImportJobCompleted").await;
        assert!(completed.contains("3 new tasks were imported successfully"));

        let job_id = job.id;
        let stored = h
            .db
            .call(move |db| db.get_import_job(job_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        let project_id = h.project.id;
        assert_eq!(h.db.call(move |db| db.count_tasks(project_id)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failing_job_records_error() {
        let mut h = harness(FakeFetcher::single(403, "text/html", ""), 0, 1);
        let job = h
            .dispatcher
            .enqueue(h.project.id, csv_form(), JobOrigin::Import)
            .await
            .unwrap();

        wait_for_event(&mut h.events, "ImportJobFailed").await;
        let stored = h
            .db
            .call(move |db| db.get_import_job(job.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.error.as_deref(),
            Some("Oops! It looks like you don't have permission to access that file")
        );
    }

    #[tokio::test]
    async fn test_count_errors_surface_before_queueing() {
        let h = harness(FakeFetcher::csv("Foo,Foo\n1,2\n"), 0, 1);
        let err = h
            .dispatcher
            .dispatch_import(&h.project, csv_form())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PlatformError::Import(ImportError::DuplicateHeader { .. })
        ));
        let project_id = h.project.id;
        let jobs = h
            .db
            .call(move |db| db.list_import_jobs(project_id))
            .await
            .unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_recover_jobs_fails_running_and_requeues_queued() {
        let h = harness(FakeFetcher::csv("Foo\n1\n"), 200, 0);
        let project_id = h.project.id;
        let (running_id, queued_id) = h
            .db
            .call(move |db| {
                let running = db.create_import_job(project_id, &csv_form(), JobOrigin::Import)?;
                db.update_job_status(running.id, JobStatus::Running, None, None)?;
                let queued = db.create_import_job(project_id, &csv_form(), JobOrigin::Autoimport)?;
                Ok((running.id, queued.id))
            })
            .await
            .unwrap();

        let recovery = h.dispatcher.recover_jobs().await.unwrap();
        assert_eq!(
            recovery,
            Recovery {
                failed: 1,
                requeued: 1
            }
        );

        let interrupted = h
            .db
            .call(move |db| db.get_import_job(running_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(interrupted.status, JobStatus::Failed);
        assert_eq!(interrupted.error.as_deref(), Some(INTERRUPTED_ERROR));

        // The requeued job is still runnable.
        let done = h.dispatcher.run_job(queued_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_run_autoimports_queues_one_job_per_project() {
        let mut h = harness(FakeFetcher::csv("Foo\n1\n"), 200, 1);
        let project_id = h.project.id;
        h.db.call(move |db| {
            db.set_autoimporter(project_id, &csv_form())?;
            db.create_project("fish", "Fish", "")?;
            Ok(())
        })
        .await
        .unwrap();

        let jobs = h.dispatcher.run_autoimports().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].project_id, project_id);
        assert_eq!(jobs[0].origin, JobOrigin::Autoimport);
        wait_for_event(&mut h.events, "ImportJobCompleted").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_first_runs_one_interval_after_start() {
        let mut h = harness(FakeFetcher::csv("Foo\n1\n"), 200, 0);
        let project_id = h.project.id;
        h.db.call(move |db| db.set_autoimporter(project_id, &csv_form()))
            .await
            .unwrap();

        let scheduler = spawn_autoimport_scheduler(h.dispatcher.clone(), Duration::from_secs(60));
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(h.events.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        wait_for_event(&mut h.events, "ImportJobQueued").await;

        tokio::time::advance(Duration::from_secs(60)).await;
        wait_for_event(&mut h.events, "ImportJobQueued").await;
        scheduler.abort();

        let jobs = h
            .db
            .call(move |db| db.list_import_jobs(project_id))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job.origin == JobOrigin::Autoimport));
    }

    #[tokio::test]
    async fn test_rerunning_a_finished_job_is_rejected() {
        let h = harness(FakeFetcher::csv("Foo\n1\n"), 200, 0);
        let project_id = h.project.id;
        let job = h
            .db
            .call(move |db| db.create_import_job(project_id, &csv_form(), JobOrigin::Import))
            .await
            .unwrap();
        h.dispatcher.run_job(job.id).await.unwrap();
        let err = h.dispatcher.run_job(job.id).await.unwrap_err();
        assert!(matches!(err, PlatformError::InvalidJobTransition { .. }));
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = ImportOutcome::Imported {
            report: ImportReport {
                imported: 1,
                skipped: 0,
            },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "imported");
        assert_eq!(json["report"]["imported"], 1);
    }
}
