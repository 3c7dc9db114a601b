//! Clustered fail-over: a surviving instance recovers a dead peer's work.

use std::sync::Arc;
use std::time::Duration;

use cadence::store::memory::MemoryJobStore;
use cadence::store::{JobStore, StoreContext};
use cadence::testing::RecordingJob;
use cadence::{
    JobDefinition, JobKey, JobRegistry, Schedule, Scheduler, SchedulerConfig, SchedulerEvent,
    SchedulerSignal, SimpleSchedule, SystemClock, Trigger, TriggerKey,
    RECOVERY_TRIGGER_GROUP,
};
use chrono::Utc;

/// A fire left in the executing state by a vanished peer is re-run exactly
/// once by a surviving clustered instance, with the original scheduled time
/// visible to the handler.
#[tokio::test]
async fn surviving_instance_recovers_dead_peers_fire() {
    let clock = Arc::new(SystemClock);
    let shared = MemoryJobStore::new(clock);

    // Node A claims and fires a recoverable job, then never checks in again.
    let node_a = shared.share();
    node_a
        .initialize(StoreContext {
            instance_id: "node-a".into(),
            signaler: Arc::new(SchedulerSignal::new()),
            misfire_threshold: chrono::Duration::seconds(60),
            check_in_interval: chrono::Duration::milliseconds(100),
            check_in_tolerance: chrono::Duration::milliseconds(100),
        })
        .await
        .unwrap();

    let mut job = JobDefinition::builder()
        .key(JobKey::named("payout"))
        .job_type("recording")
        .build();
    job.requests_recovery = true;
    job.durable = true;

    let scheduled_for = Utc::now();
    let mut trigger = Trigger::builder()
        .key(TriggerKey::named("payout-once"))
        .job_key(job.key.clone())
        .start_time(scheduled_for)
        .schedule(Schedule::Simple(SimpleSchedule::once()))
        .build();
    trigger.next_fire_time = Some(scheduled_for);

    node_a
        .store_job_and_trigger(job, trigger, false)
        .await
        .unwrap();
    node_a.check_in(Utc::now()).await.unwrap();
    let acquired = node_a
        .acquire_next_triggers(Utc::now(), 1, chrono::Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);
    node_a.triggers_fired(acquired).await.unwrap();
    assert_eq!(node_a.fired_triggers("node-a").await.unwrap().len(), 1);
    // Node A is now gone; its executing row stays behind.

    // Node B joins the cluster on the same store.
    let handler = Arc::new(RecordingJob::new());
    let mut registry = JobRegistry::new();
    registry.register("recording", Arc::clone(&handler) as Arc<dyn cadence::Job>);

    let mut config = SchedulerConfig::with_instance_id("node-b")
        .with_clustering(Duration::from_millis(100));
    config.idle_wait = Duration::from_millis(100);

    let node_b_store = Arc::new(shared.share());
    let scheduler = Scheduler::builder()
        .config(config)
        .store(node_b_store.clone())
        .registry(registry)
        .build()
        .await
        .unwrap();
    let mut events = scheduler.subscribe_events();
    scheduler.start().await.unwrap();

    // The cluster sweep must synthesize exactly one recovery trigger and the
    // loop must fire it.
    assert!(
        handler.wait_for_fires(1, Duration::from_secs(5)).await,
        "recovered fire never ran"
    );
    let fires = handler.fires();
    assert_eq!(fires.len(), 1);
    assert_eq!(
        fires[0].scheduled_fire_time, scheduled_for,
        "recovery must re-fire with the original scheduled time"
    );

    // The dead peer's rows and state record are gone.
    assert!(node_b_store
        .fired_triggers("node-a")
        .await
        .unwrap()
        .is_empty());

    let recovered_event = loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(SchedulerEvent::InstanceRecovered {
                instance_id,
                recovery_triggers,
            })) => break (instance_id, recovery_triggers),
            Ok(Ok(_)) => continue,
            other => panic!("no recovery event observed: {other:?}"),
        }
    };
    assert_eq!(recovered_event, ("node-a".to_string(), 1));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handler.fire_count(), 1, "recovery fired more than once");

    scheduler.shutdown(true).await.unwrap();
}

/// On start-up an instance recovers its own orphaned fires from a previous
/// run under the same instance id.
#[tokio::test]
async fn restarted_instance_recovers_its_own_orphans() {
    let clock = Arc::new(SystemClock);
    let shared = MemoryJobStore::new(clock);

    // Previous incarnation of "node-r" died mid-execution.
    let previous = shared.share();
    previous
        .initialize(StoreContext {
            instance_id: "node-r".into(),
            signaler: Arc::new(SchedulerSignal::new()),
            misfire_threshold: chrono::Duration::seconds(60),
            check_in_interval: chrono::Duration::seconds(15),
            check_in_tolerance: chrono::Duration::seconds(15),
        })
        .await
        .unwrap();

    let mut job = JobDefinition::builder()
        .key(JobKey::named("ledger"))
        .job_type("recording")
        .build();
    job.requests_recovery = true;
    job.durable = true;

    let scheduled_for = Utc::now();
    let mut trigger = Trigger::builder()
        .key(TriggerKey::named("ledger-once"))
        .job_key(job.key.clone())
        .start_time(scheduled_for)
        .schedule(Schedule::Simple(SimpleSchedule::once()))
        .build();
    trigger.next_fire_time = Some(scheduled_for);
    previous
        .store_job_and_trigger(job, trigger, false)
        .await
        .unwrap();
    let acquired = previous
        .acquire_next_triggers(Utc::now(), 1, chrono::Duration::zero())
        .await
        .unwrap();
    previous.triggers_fired(acquired).await.unwrap();

    // The restarted incarnation picks the orphan up during start().
    let handler = Arc::new(RecordingJob::new());
    let mut registry = JobRegistry::new();
    registry.register("recording", Arc::clone(&handler) as Arc<dyn cadence::Job>);

    let mut config = SchedulerConfig::with_instance_id("node-r");
    config.idle_wait = Duration::from_millis(100);

    let restarted = Arc::new(shared.share());
    let scheduler = Scheduler::builder()
        .config(config)
        .store(restarted.clone())
        .registry(registry)
        .build()
        .await
        .unwrap();
    scheduler.start().await.unwrap();

    assert!(
        handler.wait_for_fires(1, Duration::from_secs(5)).await,
        "orphaned fire never re-ran"
    );
    assert!(restarted.fired_triggers("node-r").await.unwrap().len() <= 1);

    let recovery_triggers = restarted
        .trigger_keys(&cadence::GroupMatcher::group_equals(RECOVERY_TRIGGER_GROUP))
        .await
        .unwrap();
    // The recovery trigger has already fired and been cleaned up, or is just
    // about to; either way no second one exists.
    assert!(recovery_triggers.len() <= 1);

    scheduler.shutdown(true).await.unwrap();
}
