//! Job run store: the lifecycle state machine plus history queries.

mod lifecycle;
mod query;
mod types;

pub(crate) use lifecycle::insert_pending;
pub use lifecycle::RunLifecycleManager;
pub use types::{
    JobRun, NewRun, PageRequest, RunFilter, RunPage, RunStatus, RunSummary, TriggerSource,
};
