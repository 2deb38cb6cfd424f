use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::importers::ImportForm;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub short_name: String,
    pub name: String,
    pub description: String,
    /// Import replayed by the autoimport scheduler, if one is configured.
    pub autoimporter: Option<ImportForm>,
    /// How volunteers are handed the project's tasks.
    pub sched: TaskScheduler,
    pub created_at: String,
}

/// Task scheduler a project hands its tasks out with.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskScheduler {
    #[default]
    Default,
    BreadthFirst,
    DepthFirst,
    Random,
}

impl TaskScheduler {
    pub const ALL: [TaskScheduler; 4] = [
        Self::Default,
        Self::BreadthFirst,
        Self::DepthFirst,
        Self::Random,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::BreadthFirst => "breadth_first",
            Self::DepthFirst => "depth_first",
            Self::Random => "random",
        }
    }
}

impl std::fmt::Display for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskScheduler {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|sched| sched.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "Invalid task scheduler '{}'. Valid values: default, breadth_first, depth_first, random",
                    s
                )
            })
    }
}

pub const DEFAULT_TASK_STATE: &str = "ongoing";
pub const DEFAULT_N_ANSWERS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub state: String,
    pub quorum: i64,
    pub calibration: i64,
    pub priority_0: f64,
    pub n_answers: i64,
    pub info: Map<String, Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// `queued -> running -> completed | failed`, nothing else.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid import job status: {}", s)),
        }
    }
}

/// What created an import job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    /// A user import that exceeded the synchronous threshold.
    Import,
    /// A scheduled autoimporter run.
    Autoimport,
}

impl JobOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::Autoimport => "autoimport",
        }
    }
}

impl FromStr for JobOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "import" => Ok(Self::Import),
            "autoimport" => Ok(Self::Autoimport),
            _ => Err(format!("Invalid import job origin: {}", s)),
        }
    }
}

/// A background import, identified by project and import parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportJob {
    pub id: i64,
    pub project_id: i64,
    pub form: ImportForm,
    pub origin: JobOrigin,
    pub status: JobStatus,
    /// Result message once completed.
    pub message: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectStats {
    pub project_id: i64,
    pub n_tasks: i64,
    pub n_completed_tasks: i64,
    /// Percentage of tasks in the `completed` state, 0 when there are none.
    pub overall_progress: f64,
    pub n_pending_imports: i64,
    pub last_task_created_at: Option<String>,
}

/// One page of a project's tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::from_str("paused").is_err());
    }

    #[test]
    fn test_job_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn test_task_scheduler_round_trip() {
        for sched in TaskScheduler::ALL {
            assert_eq!(TaskScheduler::from_str(sched.as_str()).unwrap(), sched);
        }
        assert_eq!(TaskScheduler::default(), TaskScheduler::Default);
        let err = TaskScheduler::from_str("incremental").unwrap_err();
        assert!(err.contains("breadth_first"));
        assert_eq!(
            serde_json::to_string(&TaskScheduler::DepthFirst).unwrap(),
            "\"depth_first\""
        );
    }

    #[test]
    fn test_job_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(
            serde_json::to_string(&JobOrigin::Autoimport).unwrap(),
            "\"autoimport\""
        );
    }
}
