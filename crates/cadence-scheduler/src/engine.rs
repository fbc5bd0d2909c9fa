use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    clock::Clock,
    db::lock,
    dispatch::{DispatchRequest, Dispatcher},
    error::{Result, SchedulerError},
    manager::{
        due_schedule_ids, load_schedule, next_run_from, unfired_one_shot_ids, write_run_times,
    },
    routing::{JobType, RoutingTable},
    runs::{insert_pending, JobRun, NewRun, RunLifecycleManager, TriggerSource},
    templates::{JobTemplate, TemplateCatalog},
    types::{Parameters, ScheduleType},
};

pub const DEFAULT_TICK: Duration = Duration::from_secs(60);
pub const DEFAULT_TICK_EXPIRY: Duration = Duration::from_secs(50);

/// Everything the trigger needs from the rest of the process, passed in
/// explicitly.
pub struct EngineContext {
    pub clock: Arc<dyn Clock>,
    pub routing: RoutingTable,
    pub templates: Arc<dyn TemplateCatalog>,
    pub dispatcher: Arc<dyn Dispatcher>,
}

#[derive(Debug, Clone, Copy)]
pub struct TriggerConfig {
    /// Polling cadence.
    pub tick: Duration,
    /// Claims stop once a tick has been running this long. Must be shorter
    /// than `tick`.
    pub tick_expiry: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            tick_expiry: DEFAULT_TICK_EXPIRY,
        }
    }
}

/// A run created by a successful claim, ready for submission.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub run: JobRun,
    pub parameters: Parameters,
    /// `None` when the template could not be resolved.
    pub template: Option<JobTemplate>,
}

/// What happened to a claimed run at submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Accepted by the execution layer.
    Submitted { dispatch_id: String },
    /// Could not be dispatched at all (missing template, no route); the run
    /// was failed with the reason.
    Failed { reason: String },
    /// Transient submission error; the run stays pending.
    Deferred { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub claimed: usize,
    pub submitted: usize,
    pub failed: usize,
    pub deferred: usize,
    /// Due schedules left for the next tick because the deadline passed.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimMode {
    /// Periodic trigger: the schedule must still be active and due.
    Due,
    /// Explicit "run now": fires regardless of `next_run`. A future
    /// `next_run` is kept; one already due is advanced past now.
    Immediate,
    /// Startup catch-up: an active `now` schedule that has never fired.
    OneShot,
}

/// Periodic trigger: finds due schedules, claims each atomically and hands
/// the resulting run to the dispatcher.
///
/// Owns its own connection; the claim (re-check due, insert pending run,
/// advance `last_run`/`next_run`) is a single IMMEDIATE transaction, so two
/// triggers racing on the same schedule produce exactly one run.
pub struct TriggerEngine {
    db: Mutex<Connection>,
    runs: Arc<RunLifecycleManager>,
    ctx: EngineContext,
    config: TriggerConfig,
}

impl TriggerEngine {
    pub fn new(
        conn: Connection,
        runs: Arc<RunLifecycleManager>,
        ctx: EngineContext,
        config: TriggerConfig,
    ) -> Self {
        Self {
            db: Mutex::new(conn),
            runs,
            ctx,
            config,
        }
    }

    /// Main loop. Ticks every `config.tick` until `shutdown` broadcasts `true`.
    ///
    /// A tick that overruns its interval makes the loop skip the ticks it
    /// missed rather than bunching them up.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_secs = self.config.tick.as_secs(),
            expiry_secs = self.config.tick_expiry.as_secs(),
            "trigger engine started"
        );

        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match tokio::time::timeout(self.config.tick_expiry, self.tick()).await {
                        Ok(Ok(report)) if report.due > 0 => info!(
                            due = report.due,
                            claimed = report.claimed,
                            submitted = report.submitted,
                            failed = report.failed,
                            deferred = report.deferred,
                            skipped = report.skipped,
                            "tick finished"
                        ),
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("trigger tick error: {e}"),
                        Err(_) => warn!("trigger tick expired before finishing"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("trigger engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass: claim everything due (until the expiry deadline), then
    /// submit each claimed run.
    pub async fn tick(&self) -> Result<TickReport> {
        let deadline = Instant::now() + self.config.tick_expiry;
        let (claimed, mut report) = self.claim_due(Some(deadline))?;

        for claim in claimed {
            match self.dispatch(claim).await? {
                DispatchOutcome::Submitted { .. } => report.submitted += 1,
                DispatchOutcome::Failed { .. } => report.failed += 1,
                DispatchOutcome::Deferred { .. } => report.deferred += 1,
            }
        }
        Ok(report)
    }

    /// Claim every schedule due at the current instant. Stops early once
    /// `deadline` has passed; the rest stay due for the next tick.
    pub fn claim_due(&self, deadline: Option<Instant>) -> Result<(Vec<ClaimedRun>, TickReport)> {
        let now = self.ctx.clock.now();
        let mut db = lock(&self.db)?;
        let due = due_schedule_ids(&db, now)?;
        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };

        let mut claimed = Vec::with_capacity(due.len());
        for (i, schedule_id) in due.iter().enumerate() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                report.skipped = due.len() - i;
                warn!(skipped = report.skipped, "tick deadline passed, leaving schedules for next tick");
                break;
            }
            match self.claim_one(&mut db, schedule_id, now, ClaimMode::Due, TriggerSource::Schedule) {
                Ok(Some(claim)) => claimed.push(claim),
                Ok(None) => debug!(schedule_id = %schedule_id, "already claimed elsewhere"),
                Err(e) => error!(schedule_id = %schedule_id, "claim failed: {e}"),
            }
        }
        report.claimed = claimed.len();
        Ok((claimed, report))
    }

    /// Submit a claimed run. Never leaves a run unaccounted for: it is either
    /// accepted, failed with a reason, or left pending for the janitor.
    #[instrument(skip(self, claim), fields(run_id = %claim.run.id))]
    pub async fn dispatch(&self, claim: ClaimedRun) -> Result<DispatchOutcome> {
        let run = claim.run;
        if claim.template.is_none() {
            let reason = SchedulerError::TemplateNotFound {
                template_ref: run.template_ref.clone(),
            }
            .to_string();
            self.runs.mark_failed(&run.id, &reason)?;
            warn!(template_ref = %run.template_ref, "run failed: template missing");
            return Ok(DispatchOutcome::Failed { reason });
        }
        let Some(queue) = run.queue else {
            let reason = format!("job type {} has no queue route", run.job_type);
            self.runs.mark_failed(&run.id, &reason)?;
            warn!(job_type = %run.job_type, "run failed: unroutable");
            return Ok(DispatchOutcome::Failed { reason });
        };

        let request = DispatchRequest {
            run_id: run.id.clone(),
            template_ref: run.template_ref.clone(),
            job_type: run.job_type,
            parameters: claim.parameters,
            target_scope: run.target_scope.clone(),
            queue,
        };
        match self.ctx.dispatcher.submit(request).await {
            Ok(dispatch_id) => {
                info!(%queue, %dispatch_id, "run submitted");
                Ok(DispatchOutcome::Submitted { dispatch_id })
            }
            Err(e) => {
                warn!(%queue, "submission failed, run left pending: {e}");
                Ok(DispatchOutcome::Deferred {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Fire a schedule right away through the same claim path as the
    /// periodic trigger. A future `next_run` is left as it was; a due one
    /// is advanced so the next tick does not fire the same occurrence.
    #[instrument(skip(self))]
    pub async fn fire_now(&self, schedule_id: &str, triggered_by: TriggerSource) -> Result<JobRun> {
        let now = self.ctx.clock.now();
        let claim = {
            let mut db = lock(&self.db)?;
            self.claim_one(&mut db, schedule_id, now, ClaimMode::Immediate, triggered_by)?
        }
        .ok_or_else(|| SchedulerError::ScheduleNotFound {
            id: schedule_id.to_string(),
        })?;

        let run_id = claim.run.id.clone();
        self.dispatch(claim).await?;
        self.runs
            .get(&run_id)?
            .ok_or(SchedulerError::RunNotFound { id: run_id })
    }

    /// Fire every active `now` schedule that has never fired, e.g. because
    /// the process died between creating it and firing it.
    ///
    /// Each is claimed in its own transaction and re-checked there, so two
    /// processes starting together fire each one-shot once.
    pub async fn fire_unfired_one_shots(&self) -> Result<Vec<JobRun>> {
        let now = self.ctx.clock.now();
        let claimed = {
            let mut db = lock(&self.db)?;
            let ids = unfired_one_shot_ids(&db)?;
            let mut claimed = Vec::with_capacity(ids.len());
            for schedule_id in &ids {
                if let Some(claim) = self.claim_one(
                    &mut db,
                    schedule_id,
                    now,
                    ClaimMode::OneShot,
                    TriggerSource::Startup,
                )? {
                    claimed.push(claim);
                }
            }
            claimed
        };

        let mut fired = Vec::with_capacity(claimed.len());
        for claim in claimed {
            let run_id = claim.run.id.clone();
            self.dispatch(claim).await?;
            if let Some(run) = self.runs.get(&run_id)? {
                fired.push(run);
            }
        }
        if !fired.is_empty() {
            info!(count = fired.len(), "fired one-shot schedules left over from a previous run");
        }
        Ok(fired)
    }

    /// Create and submit a schedule-less run. Unknown templates are rejected
    /// before anything is persisted.
    #[instrument(skip(self, target_scope, parameters))]
    pub async fn run_manual(
        &self,
        template_ref: &str,
        target_scope: Vec<String>,
        parameters: Parameters,
        triggered_by: TriggerSource,
    ) -> Result<JobRun> {
        let template = self.ctx.templates.resolve(template_ref).ok_or_else(|| {
            SchedulerError::TemplateNotFound {
                template_ref: template_ref.to_string(),
            }
        })?;

        let run = self.runs.create(NewRun {
            schedule_id: None,
            template_ref: template.template_ref.clone(),
            job_name: template.name.clone(),
            job_type: template.job_type,
            queue: self.ctx.routing.route(template.job_type),
            triggered_by,
            target_scope,
        })?;
        let run_id = run.id.clone();
        self.dispatch(ClaimedRun {
            run,
            parameters,
            template: Some(template),
        })
        .await?;
        self.runs
            .get(&run_id)?
            .ok_or(SchedulerError::RunNotFound { id: run_id })
    }

    // --- private helpers ---------------------------------------------------

    /// Atomically turn one schedule into a pending run.
    ///
    /// Returns `None` when the schedule is gone or, in `Due` mode, is no
    /// longer due (another trigger got there first).
    fn claim_one(
        &self,
        conn: &mut Connection,
        schedule_id: &str,
        now: DateTime<Utc>,
        mode: ClaimMode,
        triggered_by: TriggerSource,
    ) -> Result<Option<ClaimedRun>> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(schedule) = load_schedule(&tx, schedule_id)? else {
            return Ok(None);
        };
        let still_claimable = match mode {
            ClaimMode::Due => schedule.is_active && schedule.next_run.is_some_and(|next| next <= now),
            ClaimMode::Immediate => true,
            ClaimMode::OneShot => {
                schedule.is_active
                    && schedule.schedule_type == ScheduleType::Now
                    && schedule.last_run.is_none()
            }
        };
        if !still_claimable {
            return Ok(None);
        }

        let template = self.ctx.templates.resolve(&schedule.template_ref);
        let (job_name, job_type) = match &template {
            Some(t) => (t.name.clone(), t.job_type),
            None => (schedule.identifier.clone(), JobType::Unknown),
        };

        let run = insert_pending(
            &tx,
            NewRun {
                schedule_id: Some(schedule.id.clone()),
                template_ref: schedule.template_ref.clone(),
                job_name,
                job_type,
                queue: self.ctx.routing.route(job_type),
                triggered_by,
                target_scope: Vec::new(),
            },
            now,
        )?;

        let next_run = match mode {
            ClaimMode::Due => next_run_from(&schedule, now),
            ClaimMode::Immediate => match schedule.next_run {
                Some(next) if next <= now => next_run_from(&schedule, now),
                kept => kept,
            },
            ClaimMode::OneShot => None,
        };
        write_run_times(&tx, &schedule.id, now, next_run, now)?;
        tx.commit()?;

        info!(
            schedule_id = %schedule.id,
            identifier = %schedule.identifier,
            run_id = %run.id,
            next_run = ?next_run,
            "schedule claimed"
        );
        Ok(Some(ClaimedRun {
            run,
            parameters: schedule.parameters,
            template,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::TempDir;

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::open;
    use crate::error::DispatchError;
    use crate::manager::ScheduleManager;
    use crate::routing::Queue;
    use crate::runs::RunStatus;
    use crate::templates::StaticCatalog;
    use crate::types::{NewSchedule, ScheduleType};

    /// Records requests; optionally refuses them.
    #[derive(Default)]
    struct RecordingDispatcher {
        requests: Mutex<Vec<DispatchRequest>>,
        refuse: AtomicBool,
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn submit(&self, request: DispatchRequest) -> std::result::Result<String, DispatchError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(DispatchError::Unavailable("broker down".into()));
            }
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            Ok(format!("d-{}", requests.len()))
        }
    }

    struct Fixture {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        schedules: ScheduleManager,
        runs: Arc<RunLifecycleManager>,
        dispatcher: Arc<RecordingDispatcher>,
        engine: TriggerEngine,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.db");
        let clock = Arc::new(ManualClock::new(t0()));
        let schedules = ScheduleManager::new(open(&path).unwrap(), clock.clone());
        let runs = Arc::new(RunLifecycleManager::new(open(&path).unwrap(), clock.clone()));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let templates = StaticCatalog::from_entries([("tpl-backup", "Config backup", "backup")]).unwrap();
        let engine = TriggerEngine::new(
            open(&path).unwrap(),
            runs.clone(),
            EngineContext {
                clock: clock.clone(),
                routing: RoutingTable::default(),
                templates: Arc::new(templates),
                dispatcher: dispatcher.clone(),
            },
            TriggerConfig::default(),
        );
        Fixture {
            _dir: dir,
            clock,
            schedules,
            runs,
            dispatcher,
            engine,
        }
    }

    fn every_five(identifier: &str, template_ref: &str) -> NewSchedule {
        NewSchedule::new(identifier, template_ref, ScheduleType::Interval).with_interval(5)
    }

    #[tokio::test]
    async fn tick_claims_due_schedule_once() {
        let f = fixture();
        let s = f.schedules.create(every_five("core-backup", "tpl-backup")).unwrap();

        // not yet due
        assert_eq!(f.engine.tick().await.unwrap().due, 0);

        f.clock.advance(ChronoDuration::minutes(5));
        let report = f.engine.tick().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.submitted, 1);

        let s = f.schedules.get(&s.id).unwrap().unwrap();
        assert_eq!(s.last_run, Some(t0() + ChronoDuration::minutes(5)));
        assert_eq!(s.next_run, Some(t0() + ChronoDuration::minutes(10)));

        // same instant again: nothing due
        assert_eq!(f.engine.tick().await.unwrap().claimed, 0);

        let requests = f.dispatcher.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].queue, Queue::Backup);
        let run = f.runs.get(&requests[0].run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.job_name, "Config backup");
        assert_eq!(run.schedule_id.as_deref(), Some(s.id.as_str()));
    }

    #[tokio::test]
    async fn missing_template_fails_the_run() {
        let f = fixture();
        let s = f.schedules.create(every_five("orphaned", "tpl-deleted")).unwrap();
        f.clock.advance(ChronoDuration::minutes(5));

        let report = f.engine.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        let runs = f.runs.by_schedule(&s.id, 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].job_type, JobType::Unknown);
        assert_eq!(runs[0].job_name, "orphaned");
        assert!(runs[0].error_message.as_deref().unwrap().contains("tpl-deleted"));
        assert!(f.dispatcher.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refused_submission_leaves_run_pending() {
        let f = fixture();
        f.schedules.create(every_five("core-backup", "tpl-backup")).unwrap();
        f.dispatcher.refuse.store(true, Ordering::SeqCst);
        f.clock.advance(ChronoDuration::minutes(5));

        let report = f.engine.tick().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(f.runs.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn inactive_schedules_are_not_claimed() {
        let f = fixture();
        f.schedules
            .create(every_five("paused", "tpl-backup").inactive())
            .unwrap();
        f.clock.advance(ChronoDuration::hours(1));
        assert_eq!(f.engine.tick().await.unwrap().due, 0);
    }

    #[test]
    fn expired_deadline_skips_claims() {
        let f = fixture();
        f.schedules.create(every_five("a", "tpl-backup")).unwrap();
        f.schedules.create(every_five("b", "tpl-backup")).unwrap();
        f.clock.advance(ChronoDuration::minutes(5));

        let (claimed, report) = f.engine.claim_due(Some(Instant::now())).unwrap();
        assert!(claimed.is_empty());
        assert_eq!(report.skipped, 2);
        assert_eq!(f.runs.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn fire_now_keeps_next_run() {
        let f = fixture();
        let s = f.schedules.create(every_five("core-backup", "tpl-backup")).unwrap();
        f.clock.advance(ChronoDuration::minutes(2));

        let run = f.engine.fire_now(&s.id, TriggerSource::Manual).await.unwrap();
        assert_eq!(run.triggered_by, TriggerSource::Manual);
        let after = f.schedules.get(&s.id).unwrap().unwrap();
        assert_eq!(after.next_run, s.next_run);
        assert_eq!(after.last_run, Some(t0() + ChronoDuration::minutes(2)));

        let now_schedule = f
            .schedules
            .create(NewSchedule::new("one-shot", "tpl-backup", ScheduleType::Now))
            .unwrap();
        f.engine.fire_now(&now_schedule.id, TriggerSource::Api).await.unwrap();
        assert_eq!(f.schedules.get(&now_schedule.id).unwrap().unwrap().next_run, None);

        assert!(matches!(
            f.engine.fire_now("missing", TriggerSource::Manual).await,
            Err(SchedulerError::ScheduleNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn fire_now_on_due_schedule_advances_next_run() {
        let f = fixture();
        let s = f.schedules.create(every_five("core-backup", "tpl-backup")).unwrap();
        f.clock.advance(ChronoDuration::minutes(6));

        f.engine.fire_now(&s.id, TriggerSource::Manual).await.unwrap();
        let after = f.schedules.get(&s.id).unwrap().unwrap();
        assert_eq!(after.last_run, Some(t0() + ChronoDuration::minutes(6)));
        assert_eq!(after.next_run, Some(t0() + ChronoDuration::minutes(11)));
        assert!(after.next_run > after.last_run);

        // the occurrence fire_now served is not dispatched again
        assert_eq!(f.engine.tick().await.unwrap().claimed, 0);
        assert_eq!(f.runs.by_schedule(&s.id, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unfired_one_shots_fire_once_at_startup() {
        let f = fixture();
        let one_shot = f
            .schedules
            .create(NewSchedule::new("one-shot", "tpl-backup", ScheduleType::Now))
            .unwrap();
        let already_fired = f
            .schedules
            .create(NewSchedule::new("fired", "tpl-backup", ScheduleType::Now))
            .unwrap();
        f.engine.fire_now(&already_fired.id, TriggerSource::Api).await.unwrap();
        f.schedules
            .create(NewSchedule::new("paused", "tpl-backup", ScheduleType::Now).inactive())
            .unwrap();
        f.schedules.create(every_five("core-backup", "tpl-backup")).unwrap();

        let fired = f.engine.fire_unfired_one_shots().await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].schedule_id.as_deref(), Some(one_shot.id.as_str()));
        assert_eq!(fired[0].triggered_by, TriggerSource::Startup);

        let after = f.schedules.get(&one_shot.id).unwrap().unwrap();
        assert_eq!(after.last_run, Some(t0()));
        assert_eq!(after.next_run, None);

        assert!(f.engine.fire_unfired_one_shots().await.unwrap().is_empty());
        assert_eq!(f.dispatcher.requests.lock().unwrap().len(), 2);
    }

    /// Stalls on the first submission only. Every call records when it
    /// started and moves the schedule clock on so the next tick finds work.
    struct StalledDispatcher {
        clock: Arc<ManualClock>,
        calls: Mutex<Vec<Duration>>,
        started: tokio::time::Instant,
    }

    #[async_trait]
    impl Dispatcher for StalledDispatcher {
        async fn submit(&self, _request: DispatchRequest) -> std::result::Result<String, DispatchError> {
            let first = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(self.started.elapsed());
                calls.len() == 1
            };
            self.clock.advance(ChronoDuration::minutes(5));
            if first {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
            Ok("d-1".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_tick_expires_and_missed_ticks_are_skipped() {
        let f = fixture();
        let s = f.schedules.create(every_five("core-backup", "tpl-backup")).unwrap();
        f.clock.advance(ChronoDuration::minutes(5));

        let dispatcher = Arc::new(StalledDispatcher {
            clock: f.clock.clone(),
            calls: Mutex::new(Vec::new()),
            started: tokio::time::Instant::now(),
        });
        let engine = Arc::new(TriggerEngine::new(
            open(f._dir.path().join("cadence.db")).unwrap(),
            f.runs.clone(),
            EngineContext {
                clock: f.clock.clone(),
                routing: RoutingTable::default(),
                templates: Arc::new(
                    StaticCatalog::from_entries([("tpl-backup", "Config backup", "backup")]).unwrap(),
                ),
                dispatcher: dispatcher.clone(),
            },
            TriggerConfig {
                tick: Duration::from_secs(10),
                tick_expiry: Duration::from_secs(25),
            },
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(shutdown_rx));
        tokio::time::sleep(Duration::from_secs(65)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        // the first tick is cut off at 25s; the late tick fires at once,
        // the missed 10s/20s ticks are dropped and the loop realigns on 30s
        let secs = |s| Duration::from_secs(s);
        let calls = dispatcher.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![Duration::ZERO, secs(25), secs(30), secs(40), secs(50), secs(60)]
        );

        // the abandoned submission leaves its run pending for the janitor
        let runs = f.runs.by_schedule(&s.id, 10).unwrap();
        assert_eq!(runs.len(), 6);
        assert!(runs.iter().all(|r| r.status == RunStatus::Pending));
    }

    #[tokio::test]
    async fn run_manual_submits_without_schedule() {
        let f = fixture();
        let mut params = Parameters::new();
        params.insert("full".into(), serde_json::json!(true));

        let run = f
            .engine
            .run_manual("tpl-backup", vec!["sw-1".into()], params.clone(), TriggerSource::Manual)
            .await
            .unwrap();
        assert_eq!(run.schedule_id, None);
        assert_eq!(run.target_scope, vec!["sw-1".to_string()]);
        let requests = f.dispatcher.requests.lock().unwrap();
        assert_eq!(requests[0].parameters, params);

        drop(requests);
        assert!(matches!(
            f.engine
                .run_manual("nope", vec![], Parameters::new(), TriggerSource::Api)
                .await,
            Err(SchedulerError::TemplateNotFound { .. })
        ));
    }
}
