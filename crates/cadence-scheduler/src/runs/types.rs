use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::routing::{JobType, Queue};

/// Lifecycle state of a single dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, handed (or about to be handed) to the execution layer.
    Pending,
    /// A worker reported that it picked the run up.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    pub const TERMINAL: [RunStatus; 3] =
        [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled];

    /// Terminal states are absorbing: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// What caused a run to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// The periodic trigger found the schedule due.
    Schedule,
    /// A user asked for it.
    Manual,
    /// An API client asked for it.
    Api,
    /// Fired while the process was starting up.
    Startup,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Schedule => "schedule",
            TriggerSource::Manual => "manual",
            TriggerSource::Api => "api",
            TriggerSource::Startup => "startup",
        }
    }
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(TriggerSource::Schedule),
            "manual" => Ok(TriggerSource::Manual),
            "api" => Ok(TriggerSource::Api),
            "startup" => Ok(TriggerSource::Startup),
            other => Err(format!("unknown trigger source: {other}")),
        }
    }
}

/// One persisted dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    /// Time-sortable UUIDv7 primary key.
    pub id: String,
    /// `None` for manual runs. May point at a deleted schedule.
    pub schedule_id: Option<String>,
    pub template_ref: String,
    pub job_name: String,
    pub job_type: JobType,
    /// Lane the run was routed to, when it was routable.
    pub queue: Option<Queue>,
    pub status: RunStatus,
    pub triggered_by: TriggerSource,
    /// Correlation id assigned by the execution layer; set by `mark_started`.
    pub dispatch_id: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Latest progress signal from the worker.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    /// Entities (devices, sites, …) the run operates on. Opaque here.
    pub target_scope: Vec<String>,
}

impl JobRun {
    /// Wall time between start and terminal transition, once both are known.
    pub fn duration(&self) -> Option<Duration> {
        Some(self.completed_at? - self.started_at?)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Input for [`RunLifecycleManager::create`](super::RunLifecycleManager::create).
#[derive(Debug, Clone)]
pub struct NewRun {
    pub schedule_id: Option<String>,
    pub template_ref: String,
    pub job_name: String,
    pub job_type: JobType,
    pub queue: Option<Queue>,
    pub triggered_by: TriggerSource,
    pub target_scope: Vec<String>,
}

/// Run query filter. Within a field any listed value matches (OR); across
/// fields every non-empty field must match (AND). Empty means "any".
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub statuses: Vec<RunStatus>,
    pub job_types: Vec<JobType>,
    pub triggered_by: Vec<TriggerSource>,
    pub schedule_ids: Vec<String>,
    pub template_refs: Vec<String>,
}

impl RunFilter {
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = RunStatus>) -> Self {
        self.statuses.extend(statuses);
        self
    }

    pub fn with_job_types(mut self, job_types: impl IntoIterator<Item = JobType>) -> Self {
        self.job_types.extend(job_types);
        self
    }

    pub fn with_triggers(mut self, sources: impl IntoIterator<Item = TriggerSource>) -> Self {
        self.triggered_by.extend(sources);
        self
    }

    pub fn with_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_ids.push(schedule_id.into());
        self
    }

    pub fn with_template(mut self, template_ref: impl Into<String>) -> Self {
        self.template_refs.push(template_ref.into());
        self
    }
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    pub const MAX_PER_PAGE: u32 = 500;

    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, Self::MAX_PER_PAGE),
        }
    }

    pub(crate) fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.per_page)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 50)
    }
}

/// A run plus display metadata resolved from its schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub run: JobRun,
    /// `None` for manual runs and for runs whose schedule was deleted.
    pub schedule_identifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPage {
    pub items: Vec<RunSummary>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}
