//! `cadence-scheduler`: job scheduling and execution tracking on SQLite.
//!
//! # Overview
//!
//! Schedules are persisted in a `schedules` table and carry a precomputed
//! `next_run`. The [`engine::TriggerEngine`] polls for due schedules on a
//! fixed cadence, claims each one atomically (one pending [`runs::JobRun`]
//! per due schedule per tick) and submits it through a [`dispatch::Dispatcher`].
//! Workers report back through [`dispatch::DispatchEvent`]s, which drive the
//! run through its lifecycle; the [`janitor::Janitor`] fails runs whose
//! worker went silent and purges old history.
//!
//! # Schedule types
//!
//! | Type       | Next run after `reference`                                |
//! |------------|-----------------------------------------------------------|
//! | `now`      | none (fired explicitly, once)                             |
//! | `interval` | `reference + interval_minutes`                            |
//! | `hourly`   | top of the next hour                                      |
//! | `daily`    | next `start_time`                                         |
//! | `weekly`   | next `start_time` on the anchor weekday                   |
//! | `monthly`  | next `start_time` on the anchor day, clamped to month end |
//! | `custom`   | next cron match                                           |
//!
//! All instants are UTC.

pub mod clock;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod janitor;
pub mod manager;
pub mod routing;
pub mod runs;
pub mod schedule;
pub mod templates;
pub mod types;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{
    ChannelDispatcher, CompletionListener, DispatchEnvelope, DispatchEvent, DispatchRequest,
    Dispatcher,
};
pub use engine::{EngineContext, TickReport, TriggerConfig, TriggerEngine};
pub use error::{DispatchError, Result, SchedulerError};
pub use janitor::{Janitor, JanitorConfig, SweepReport};
pub use manager::ScheduleManager;
pub use routing::{JobType, Queue, RoutingTable};
pub use runs::{JobRun, NewRun, PageRequest, RunFilter, RunLifecycleManager, RunStatus, TriggerSource};
pub use schedule::compute_next_run;
pub use templates::{JobTemplate, StaticCatalog, TemplateCatalog};
pub use types::{NewSchedule, Parameters, Schedule, ScheduleFilter, ScheduleType, ScheduleUpdate};
