use thiserror::Error;

use crate::routing::Queue;

/// Errors that can occur within the scheduling engine.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A schedule definition was rejected. `field` names the offending input.
    #[error("Invalid schedule: {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// Another schedule already uses this user-facing identifier.
    #[error("Schedule identifier already in use: {identifier}")]
    DuplicateIdentifier { identifier: String },

    /// No schedule with the given ID exists in the store.
    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: String },

    /// No run with the given ID exists in the store.
    #[error("Job run not found: {id}")]
    RunNotFound { id: String },

    /// The template a run should execute is unknown to this process.
    #[error("Template not found: {template_ref}")]
    TemplateNotFound { template_ref: String },

    /// A bulk delete named statuses of runs that are still in flight.
    #[error("Refusing to delete in-flight runs (status {statuses})")]
    InFlightDeletion { statuses: String },

    /// Static engine configuration (routing table, template catalog) is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The execution layer did not accept a submission.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A shared connection lock was poisoned by a panicking thread.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Short error code string for API surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Validation { .. } => "INVALID_SCHEDULE",
            SchedulerError::DuplicateIdentifier { .. } => "DUPLICATE_IDENTIFIER",
            SchedulerError::ScheduleNotFound { .. } => "SCHEDULE_NOT_FOUND",
            SchedulerError::RunNotFound { .. } => "RUN_NOT_FOUND",
            SchedulerError::TemplateNotFound { .. } => "TEMPLATE_NOT_FOUND",
            SchedulerError::InFlightDeletion { .. } => "IN_FLIGHT_DELETION",
            SchedulerError::Config(_) => "CONFIG_ERROR",
            SchedulerError::Dispatch(_) => "DISPATCH_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        SchedulerError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

/// Transient failures reported by a [`Dispatcher`](crate::dispatch::Dispatcher).
///
/// The run stays `pending` when any of these is returned; the broker's own
/// reconnect policy or the janitor takes it from there.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("queue lane {queue} is full")]
    LaneFull { queue: Queue },

    #[error("queue lane {queue} is closed")]
    LaneClosed { queue: Queue },

    #[error("no lane registered for queue {queue}")]
    UnknownLane { queue: Queue },

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
