//! Store-contract properties exercised against the in-memory store.
//!
//! Covers the acquisition ordering law, at-most-once acquisition under
//! concurrent callers, fired-row uniqueness, the recovery law, and the
//! storage round-trip.

use std::sync::Arc;

use cadence::store::memory::MemoryJobStore;
use cadence::store::{GroupMatcher, JobStore, StoreContext, TriggerFiredResult};
use cadence::testing::ManualClock;
use cadence::{
    Clock, JobDataMap, JobDefinition, JobKey, Schedule, SchedulerSignal, SimpleSchedule, Trigger,
    TriggerKey, TriggerState,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
}

fn context_for(instance_id: &str) -> StoreContext {
    StoreContext {
        instance_id: instance_id.to_string(),
        signaler: Arc::new(SchedulerSignal::new()),
        misfire_threshold: Duration::seconds(60),
        check_in_interval: Duration::seconds(15),
        check_in_tolerance: Duration::seconds(15),
    }
}

async fn store_for(instance_id: &str, clock: Arc<ManualClock>) -> MemoryJobStore {
    let store = MemoryJobStore::new(clock);
    store.initialize(context_for(instance_id)).await.unwrap();
    store
}

fn job(name: &str) -> JobDefinition {
    JobDefinition::builder()
        .key(JobKey::named(name))
        .job_type("noop")
        .build()
}

fn one_shot(name: &str, job_name: &str, fire_at: DateTime<Utc>, priority: i32) -> Trigger {
    let mut t = Trigger::builder()
        .key(TriggerKey::named(name))
        .job_key(JobKey::named(job_name))
        .start_time(fire_at)
        .priority(priority)
        .schedule(Schedule::Simple(SimpleSchedule::once()))
        .build();
    t.next_fire_time = Some(fire_at);
    t
}

#[tokio::test]
async fn acquire_batch_is_ordered_by_time_priority_name() {
    let clock = Arc::new(ManualClock::starting_at(base_time()));
    let store = store_for("node-a", clock).await;
    store.store_job(job("j"), false).await.unwrap();

    let later = base_time() + Duration::seconds(5);
    store
        .store_trigger(one_shot("slow", "j", later, 9), false)
        .await
        .unwrap();
    store
        .store_trigger(one_shot("low", "j", base_time(), 1), false)
        .await
        .unwrap();
    store
        .store_trigger(one_shot("high-b", "j", base_time(), 9), false)
        .await
        .unwrap();
    store
        .store_trigger(one_shot("high-a", "j", base_time(), 9), false)
        .await
        .unwrap();

    let acquired = store
        .acquire_next_triggers(base_time() + Duration::seconds(10), 10, Duration::zero())
        .await
        .unwrap();
    let names: Vec<&str> = acquired.iter().map(|t| t.key.name.as_str()).collect();

    // Same fire time: priority desc, then name asc. Later fire time last.
    assert_eq!(names, vec!["high-a", "high-b", "low", "slow"]);
}

#[tokio::test]
async fn concurrent_acquirers_split_triggers_without_overlap() {
    let clock = Arc::new(ManualClock::starting_at(base_time()));
    let store_a = store_for("node-a", Arc::clone(&clock)).await;
    let store_b = store_a.share();
    store_b.initialize(context_for("node-b")).await.unwrap();

    store_a.store_job(job("j"), false).await.unwrap();
    for i in 0..10 {
        store_a
            .store_trigger(one_shot(&format!("t{i}"), "j", base_time(), 5), false)
            .await
            .unwrap();
    }

    let horizon = base_time() + Duration::seconds(1);
    let (a, b) = tokio::join!(
        store_a.acquire_next_triggers(horizon, 10, Duration::zero()),
        store_b.acquire_next_triggers(horizon, 10, Duration::zero()),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    // Every trigger went to exactly one caller.
    assert_eq!(a.len() + b.len(), 10);
    for t in &a {
        assert!(!b.iter().any(|other| other.key == t.key));
    }
}

#[tokio::test]
async fn single_due_trigger_goes_to_exactly_one_instance() {
    let clock = Arc::new(ManualClock::starting_at(base_time()));
    let store_a = store_for("node-a", Arc::clone(&clock)).await;
    let store_b = store_a.share();
    store_b.initialize(context_for("node-b")).await.unwrap();

    store_a.store_job(job("j"), false).await.unwrap();
    store_a
        .store_trigger(one_shot("only", "j", base_time(), 5), false)
        .await
        .unwrap();

    let horizon = base_time() + Duration::seconds(1);
    let (a, b) = tokio::join!(
        store_a.acquire_next_triggers(horizon, 1, Duration::zero()),
        store_b.acquire_next_triggers(horizon, 1, Duration::zero()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.len() + b.len(), 1);
}

#[tokio::test]
async fn trigger_never_appears_in_two_fired_rows() {
    let clock = Arc::new(ManualClock::starting_at(base_time()));
    let store_a = store_for("node-a", Arc::clone(&clock)).await;
    let store_b = store_a.share();
    store_b.initialize(context_for("node-b")).await.unwrap();

    store_a.store_job(job("j"), false).await.unwrap();
    store_a
        .store_trigger(one_shot("t", "j", base_time(), 5), false)
        .await
        .unwrap();

    let horizon = base_time() + Duration::seconds(1);
    let _ = tokio::join!(
        store_a.acquire_next_triggers(horizon, 1, Duration::zero()),
        store_b.acquire_next_triggers(horizon, 1, Duration::zero()),
    );

    let mut rows = store_a.fired_triggers("node-a").await.unwrap();
    rows.extend(store_a.fired_triggers("node-b").await.unwrap());
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn stored_definition_round_trips() {
    let clock = Arc::new(ManualClock::starting_at(base_time()));
    let store = store_for("node-a", clock).await;

    let mut data = JobDataMap::new();
    data.put("endpoint", "https://example.org/hook");
    data.put("attempts", 3);
    let job = JobDefinition::builder()
        .key(JobKey::new("sync", "integrations"))
        .job_type("webhook:sync")
        .description("outbound webhook sync")
        .data(data)
        .durable(true)
        .persist_data_after_execution(true)
        .concurrent_execution_disallowed(true)
        .requests_recovery(true)
        .build();

    let mut trigger = Trigger::builder()
        .key(TriggerKey::new("sync-hourly", "integrations"))
        .job_key(job.key.clone())
        .description("hourly sync")
        .priority(7)
        .start_time(base_time())
        .end_time(base_time() + Duration::days(30))
        .schedule(Schedule::Simple(SimpleSchedule::every_with_repeats(
            std::time::Duration::from_secs(3600),
            100,
        )))
        .build();
    trigger.next_fire_time = Some(base_time());

    store
        .store_job_and_trigger(job.clone(), trigger.clone(), false)
        .await
        .unwrap();

    assert_eq!(store.retrieve_job(&job.key).await.unwrap(), Some(job));
    assert_eq!(
        store.retrieve_trigger(&trigger.key).await.unwrap(),
        Some(trigger)
    );
}

#[tokio::test]
async fn scheduled_fire_times_strictly_increase_across_fires() {
    let clock = Arc::new(ManualClock::starting_at(base_time()));
    let store = store_for("node-a", Arc::clone(&clock)).await;
    store.store_job(job("j"), false).await.unwrap();

    let mut trigger = Trigger::builder()
        .key(TriggerKey::named("tick"))
        .job_key(JobKey::named("j"))
        .start_time(base_time())
        .schedule(Schedule::Simple(SimpleSchedule::every(
            std::time::Duration::from_secs(10),
        )))
        .build();
    trigger.next_fire_time = Some(base_time());
    store.store_trigger(trigger, false).await.unwrap();

    let mut scheduled_times = Vec::new();
    for _ in 0..5 {
        let now = clock.now();
        let acquired = store
            .acquire_next_triggers(now + Duration::seconds(1), 1, Duration::zero())
            .await
            .unwrap();
        assert_eq!(acquired.len(), 1);
        let results = store.triggers_fired(acquired).await.unwrap();
        let TriggerFiredResult::Fired(bundle) = &results[0] else {
            panic!("expected a fired bundle");
        };
        scheduled_times.push(bundle.scheduled_fire_time);
        store
            .triggered_job_complete(
                &bundle.trigger,
                &bundle.job,
                cadence::CompletedExecutionInstruction::Noop,
            )
            .await
            .unwrap();
        clock.advance(Duration::seconds(10));
    }

    for pair in scheduled_times.windows(2) {
        assert!(pair[0] < pair[1], "scheduled fire times must increase");
    }
}

#[tokio::test]
async fn recovery_produces_exactly_one_trigger_per_recoverable_fire() {
    let clock = Arc::new(ManualClock::starting_at(base_time()));
    let store_a = store_for("node-a", Arc::clone(&clock)).await;
    let store_b = store_a.share();
    store_b.initialize(context_for("node-b")).await.unwrap();

    let mut recoverable = job("j");
    recoverable.requests_recovery = true;
    recoverable.durable = true;
    store_a.store_job(recoverable, false).await.unwrap();
    store_a
        .store_trigger(one_shot("t", "j", base_time(), 5), false)
        .await
        .unwrap();

    // Node A gets the fire in flight, then disappears.
    let acquired = store_a
        .acquire_next_triggers(base_time() + Duration::seconds(1), 1, Duration::zero())
        .await
        .unwrap();
    store_a.triggers_fired(acquired).await.unwrap();

    let report = store_b.recover_jobs("node-a").await.unwrap();
    assert_eq!(report.recovery_triggers, 1);

    let recovered = store_b
        .trigger_keys(&GroupMatcher::group_equals(
            cadence::RECOVERY_TRIGGER_GROUP,
        ))
        .await
        .unwrap();
    assert_eq!(recovered.len(), 1);

    // A second sweep finds nothing left to recover.
    let again = store_b.recover_jobs("node-a").await.unwrap();
    assert_eq!(again.recovery_triggers, 0);
}

#[tokio::test]
async fn paused_group_memory_applies_to_future_triggers() {
    let clock = Arc::new(ManualClock::starting_at(base_time()));
    let store = store_for("node-a", clock).await;
    store.store_job(job("j"), false).await.unwrap();

    store
        .pause_triggers(&GroupMatcher::group_starts_with("g"))
        .await
        .unwrap();

    let mut trigger = one_shot("later", "j", base_time(), 5);
    trigger.key = TriggerKey::new("later", "gX");
    store.store_trigger(trigger.clone(), false).await.unwrap();
    assert_eq!(
        store.trigger_state(&trigger.key).await.unwrap(),
        TriggerState::Paused
    );

    // Resuming the prefix forgets the matcher.
    store
        .resume_triggers(&GroupMatcher::group_starts_with("g"))
        .await
        .unwrap();
    assert_eq!(
        store.trigger_state(&trigger.key).await.unwrap(),
        TriggerState::Waiting
    );

    let mut fresh = one_shot("fresh", "j", base_time(), 5);
    fresh.key = TriggerKey::new("fresh", "gY");
    store.store_trigger(fresh.clone(), false).await.unwrap();
    assert_eq!(
        store.trigger_state(&fresh.key).await.unwrap(),
        TriggerState::Waiting
    );
}
