use std::sync::Arc;

use cadence_scheduler::{
    db, ChannelDispatcher, CompletionListener, DispatchEvent, EngineContext, JobType,
    NewSchedule, Queue, RoutingTable, RunLifecycleManager, RunStatus, ScheduleManager,
    ScheduleType, StaticCatalog, TriggerConfig, TriggerEngine,
};
use cadence_scheduler::ManualClock;
use chrono::{Duration, TimeZone, Utc};

#[tokio::test]
async fn interval_schedule_runs_through_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(t0));

    let schedules = ScheduleManager::new(db::open(&path).unwrap(), clock.clone());
    let runs = Arc::new(RunLifecycleManager::new(db::open(&path).unwrap(), clock.clone()));
    let (dispatcher, mut lanes) =
        ChannelDispatcher::new(16, Duration::hours(1), clock.clone());
    let catalog =
        StaticCatalog::from_entries([("tpl-scan", "Subnet discovery", "scan")]).unwrap();
    let engine = TriggerEngine::new(
        db::open(&path).unwrap(),
        runs.clone(),
        EngineContext {
            clock: clock.clone(),
            routing: RoutingTable::default(),
            templates: Arc::new(catalog),
            dispatcher: Arc::new(dispatcher),
        },
        TriggerConfig::default(),
    );
    let listener = CompletionListener::new(runs.clone());

    let schedule = schedules
        .create(
            NewSchedule::new("lab-discovery", "tpl-scan", ScheduleType::Interval)
                .with_interval(5)
                .with_parameter("subnet", serde_json::json!("10.0.0.0/24")),
        )
        .unwrap();
    assert_eq!(schedule.next_run, Some(t0 + Duration::minutes(5)));

    clock.advance(Duration::minutes(5));
    let report = engine.tick().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.submitted, 1);

    let schedule = schedules.get(&schedule.id).unwrap().unwrap();
    assert_eq!(schedule.last_run, Some(t0 + Duration::minutes(5)));
    assert_eq!(schedule.next_run, Some(t0 + Duration::minutes(10)));

    let envelope = lanes.get_mut(&Queue::Network).unwrap().try_recv().unwrap();
    assert_eq!(envelope.request.job_type, JobType::Scan);
    assert_eq!(
        envelope.request.parameters.get("subnet"),
        Some(&serde_json::json!("10.0.0.0/24"))
    );

    let run_id = envelope.request.run_id.clone();
    let pending = runs.get(&run_id).unwrap().unwrap();
    assert_eq!(pending.status, RunStatus::Pending);
    assert_eq!(pending.queued_at, t0 + Duration::minutes(5));

    clock.advance(Duration::seconds(3));
    listener
        .apply(&DispatchEvent::Started {
            run_id: run_id.clone(),
            dispatch_id: envelope.dispatch_id.clone(),
        })
        .unwrap();
    clock.advance(Duration::seconds(42));
    listener
        .apply(&DispatchEvent::Completed {
            run_id: run_id.clone(),
            result: Some(serde_json::json!({"hosts_found": 17})),
        })
        .unwrap();

    let done = runs.get(&run_id).unwrap().unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.dispatch_id.as_deref(), Some(envelope.dispatch_id.as_str()));
    assert_eq!(done.duration(), Some(Duration::seconds(42)));

    // history survives schedule deletion with a dangling reference
    schedules.delete(&schedule.id).unwrap();
    let history = runs.by_schedule(&schedule.id, 10).unwrap();
    assert_eq!(history.len(), 1);
    let page = runs.list(&Default::default(), Default::default()).unwrap();
    assert_eq!(page.items[0].schedule_identifier, None);
}

#[tokio::test]
async fn duplicate_completion_events_are_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cadence.db");
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()));
    let runs = Arc::new(RunLifecycleManager::new(db::open(&path).unwrap(), clock.clone()));
    let listener = CompletionListener::new(runs.clone());

    let run = runs
        .create(cadence_scheduler::NewRun {
            schedule_id: None,
            template_ref: "tpl".into(),
            job_name: "Nightly render".into(),
            job_type: JobType::Render,
            queue: Some(Queue::Default),
            triggered_by: cadence_scheduler::TriggerSource::Api,
            target_scope: vec![],
        })
        .unwrap();

    let started = DispatchEvent::Started {
        run_id: run.id.clone(),
        dispatch_id: "w-1".into(),
    };
    let completed = DispatchEvent::Completed {
        run_id: run.id.clone(),
        result: None,
    };
    assert!(listener.apply(&started).unwrap());
    assert!(listener.apply(&completed).unwrap());
    assert!(!listener.apply(&started).unwrap());
    assert!(!listener.apply(&completed).unwrap());
    assert_eq!(runs.get(&run.id).unwrap().unwrap().status, RunStatus::Completed);
}
