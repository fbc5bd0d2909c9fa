use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::{CadenceConfig, DispatchConfig};
use cadence_scheduler::{
    db, dispatch::LaneReceivers, ChannelDispatcher, Clock, EngineContext, Janitor, JanitorConfig,
    RoutingTable, RunLifecycleManager, ScheduleManager, StaticCatalog, TriggerConfig,
    TriggerEngine,
};
use tracing::info;

/// Every engine component, each on its own database connection.
pub struct App {
    pub schedules: ScheduleManager,
    pub runs: Arc<RunLifecycleManager>,
    pub trigger: Arc<TriggerEngine>,
    pub janitor: Janitor,
}

impl App {
    /// Open connections and wire the components from `config`.
    ///
    /// Routing overrides and templates are validated here so a bad config
    /// fails startup. Returns the dispatcher's lane receivers alongside.
    pub fn build(config: &CadenceConfig, clock: Arc<dyn Clock>) -> anyhow::Result<(Self, LaneReceivers)> {
        let db_path = &config.database.path;
        ensure_parent_dir(db_path);
        info!(path = %db_path, "opening SQLite database");

        let routing = RoutingTable::with_overrides(
            config
                .dispatch
                .routes
                .iter()
                .map(|(job_type, queue)| (job_type.as_str(), queue.as_str())),
        )?;
        let catalog = StaticCatalog::from_entries(config.templates.iter().map(|t| {
            (t.template_ref.as_str(), t.name.as_str(), t.job_type.as_str())
        }))?;
        info!(templates = catalog.len(), "template catalog loaded");

        let (dispatcher, lanes) = ChannelDispatcher::new(
            config.dispatch.lane_capacity,
            message_ttl(&config.dispatch),
            clock.clone(),
        );

        let schedules = ScheduleManager::new(db::open(db_path)?, clock.clone());
        let runs = Arc::new(RunLifecycleManager::new(db::open(db_path)?, clock.clone()));
        let trigger = Arc::new(TriggerEngine::new(
            db::open(db_path)?,
            runs.clone(),
            EngineContext {
                clock,
                routing,
                templates: Arc::new(catalog),
                dispatcher: Arc::new(dispatcher),
            },
            TriggerConfig {
                tick: Duration::from_secs(config.scheduler.tick_secs),
                tick_expiry: Duration::from_secs(config.scheduler.tick_expiry_secs),
            },
        ));
        let janitor = Janitor::new(runs.clone(), janitor_config(config));

        Ok((
            Self {
                schedules,
                runs,
                trigger,
                janitor,
            },
            lanes,
        ))
    }

    /// Startup repair: backfill missing `next_run` values and fail runs
    /// orphaned by a previous crash.
    pub fn repair(&self) -> anyhow::Result<()> {
        let backfilled = self.schedules.initialize_missing_next_runs()?;
        let report = self.janitor.sweep()?;
        info!(
            backfilled,
            stale = report.stale_failed.len(),
            expired = report.expired_failed.len(),
            purged = report.purged,
            "startup repair complete"
        );
        Ok(())
    }
}

fn message_ttl(dispatch: &DispatchConfig) -> chrono::Duration {
    chrono::Duration::from_std(Duration::from_secs(dispatch.message_ttl_secs))
        .unwrap_or_else(|_| chrono::Duration::weeks(52))
}

fn janitor_config(config: &CadenceConfig) -> JanitorConfig {
    let retention = match config.janitor.retention_days {
        0 => None,
        days => Some(Duration::from_secs(u64::from(days) * 24 * 3_600)),
    };
    JanitorConfig {
        interval: Duration::from_secs(config.janitor.interval_secs),
        stale_after: Duration::from_secs(config.janitor.stale_after_secs),
        pending_ttl: Duration::from_secs(config.dispatch.message_ttl_secs),
        retention,
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
