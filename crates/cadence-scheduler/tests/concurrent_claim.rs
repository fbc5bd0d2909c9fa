use std::sync::{Arc, Barrier};
use std::thread;

use async_trait::async_trait;
use cadence_scheduler::{
    db, DispatchError, DispatchRequest, Dispatcher, EngineContext, ManualClock, NewSchedule,
    RoutingTable, RunFilter, RunLifecycleManager, ScheduleManager, ScheduleType, StaticCatalog,
    TriggerConfig, TriggerEngine,
};
use chrono::{Duration, TimeZone, Utc};

struct NullDispatcher;

#[async_trait]
impl Dispatcher for NullDispatcher {
    async fn submit(&self, request: DispatchRequest) -> Result<String, DispatchError> {
        Ok(format!("null-{}", request.run_id))
    }
}

fn engine(path: &std::path::Path, clock: Arc<ManualClock>) -> TriggerEngine {
    let runs = Arc::new(RunLifecycleManager::new(db::open(path).unwrap(), clock.clone()));
    let catalog = StaticCatalog::from_entries([("tpl-sync", "Inventory sync", "sync")]).unwrap();
    TriggerEngine::new(
        db::open(path).unwrap(),
        runs,
        EngineContext {
            clock,
            routing: RoutingTable::default(),
            templates: Arc::new(catalog),
            dispatcher: Arc::new(NullDispatcher),
        },
        TriggerConfig::default(),
    )
}

#[test]
fn racing_triggers_claim_each_due_schedule_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(t0));

    let schedules = ScheduleManager::new(db::open(&path).unwrap(), clock.clone());
    for i in 0..5 {
        schedules
            .create(
                NewSchedule::new(format!("sync-{i}"), "tpl-sync", ScheduleType::Interval)
                    .with_interval(10),
            )
            .unwrap();
    }
    clock.advance(Duration::minutes(10));

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine(&path, clock.clone());
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let (claimed, _) = engine.claim_due(None).unwrap();
                claimed.len()
            })
        })
        .collect();
    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 5);

    let runs = RunLifecycleManager::new(db::open(&path).unwrap(), clock.clone());
    let page = runs.list(&RunFilter::default(), Default::default()).unwrap();
    assert_eq!(page.total, 5);
    for schedule in schedules.list(&Default::default()).unwrap() {
        assert_eq!(runs.by_schedule(&schedule.id, 10).unwrap().len(), 1);
        assert_eq!(schedule.next_run, Some(t0 + Duration::minutes(20)));
    }
}
