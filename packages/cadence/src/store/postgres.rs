//! PostgreSQL-backed job store.
//!
//! Layout: `cadence_jobs`, `cadence_triggers`, `cadence_fired_triggers`,
//! `cadence_calendars`, `cadence_paused_groups`, `cadence_scheduler_state`,
//! and a two-row `cadence_locks` table. Every scheduling write runs inside a
//! transaction that first locks the `TRIGGER_ACCESS` row with
//! `SELECT ... FOR UPDATE`; check-in locks `STATE_ACCESS` instead. A single
//! operation never takes both locks, and never releases and re-takes a lock
//! mid-transaction, so lock ordering across instances stays trivial.
//!
//! Schedules, data maps, and calendars persist as JSONB; timestamps are
//! `TIMESTAMPTZ` and always UTC.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::calendar::Calendar;
use crate::clock::{SharedClock, SystemClock};
use crate::error::{Result, SchedulerError};
use crate::job::{JobDataMap, JobDefinition, JobKey};
use crate::schedule::{MisfireInstruction, Schedule, SimpleSchedule};
use crate::trigger::{Trigger, TriggerKey, TriggerState};

use super::{
    resume_covers, CompletedExecutionInstruction, FiredState, FiredTrigger, GroupMatcher,
    JobStore, MisfireSweep, RecoveryReport, SchedulerStateRecord, StoreContext,
    TriggerFiredBundle, TriggerFiredResult, RECOVERY_ORIGINAL_FIRE_TIME,
    RECOVERY_ORIGINAL_SCHEDULED_FIRE_TIME, RECOVERY_ORIGINAL_TRIGGER_GROUP,
    RECOVERY_ORIGINAL_TRIGGER_NAME, RECOVERY_TRIGGER_GROUP,
};

const LOCK_TRIGGER_ACCESS: &str = "TRIGGER_ACCESS";
const LOCK_STATE_ACCESS: &str = "STATE_ACCESS";

const PAUSED_SCOPE_TRIGGER: &str = "trigger";
const PAUSED_SCOPE_JOB: &str = "job";

/// Relational implementation of the [`JobStore`] contract.
pub struct PostgresJobStore {
    pool: PgPool,
    clock: SharedClock,
    ctx: StdMutex<Option<StoreContext>>,
    recovery_seq: AtomicI64,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: SharedClock) -> Self {
        Self {
            pool,
            clock,
            ctx: StdMutex::new(None),
            recovery_seq: AtomicI64::new(0),
        }
    }

    /// Create the table set and seed the lock rows. Idempotent.
    pub async fn create_tables(&self) -> Result<()> {
        let statements = [
            r#"
CREATE TABLE IF NOT EXISTS cadence_locks
(
    name TEXT PRIMARY KEY
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS cadence_jobs
(
    job_name          TEXT    NOT NULL,
    job_group         TEXT    NOT NULL,
    job_type          TEXT    NOT NULL,
    description       TEXT,
    data              JSONB   NOT NULL,
    durable           BOOLEAN NOT NULL,
    persist_data      BOOLEAN NOT NULL,
    non_concurrent    BOOLEAN NOT NULL,
    requests_recovery BOOLEAN NOT NULL,
    PRIMARY KEY (job_name, job_group)
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS cadence_triggers
(
    trigger_name        TEXT        NOT NULL,
    trigger_group       TEXT        NOT NULL,
    job_name            TEXT        NOT NULL,
    job_group           TEXT        NOT NULL,
    description         TEXT,
    calendar_name       TEXT,
    priority            INT         NOT NULL,
    start_time          TIMESTAMPTZ NOT NULL,
    end_time            TIMESTAMPTZ,
    prev_fire_time      TIMESTAMPTZ,
    next_fire_time      TIMESTAMPTZ,
    misfire_instruction INT         NOT NULL,
    state               INT         NOT NULL,
    schedule            JSONB       NOT NULL,
    data                JSONB       NOT NULL,
    PRIMARY KEY (trigger_name, trigger_group)
);
            "#,
            r#"
CREATE INDEX IF NOT EXISTS cadence_triggers_state_next_fire_idx
    ON cadence_triggers (state, next_fire_time);
            "#,
            r#"
CREATE INDEX IF NOT EXISTS cadence_triggers_job_idx
    ON cadence_triggers (job_name, job_group);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS cadence_fired_triggers
(
    entry_id          UUID        PRIMARY KEY,
    trigger_name      TEXT        NOT NULL,
    trigger_group     TEXT        NOT NULL,
    job_name          TEXT,
    job_group         TEXT,
    instance_id       TEXT        NOT NULL,
    state             INT         NOT NULL,
    fired_at          TIMESTAMPTZ NOT NULL,
    scheduled_at      TIMESTAMPTZ NOT NULL,
    priority          INT         NOT NULL,
    non_concurrent    BOOLEAN     NOT NULL,
    requests_recovery BOOLEAN     NOT NULL
);
            "#,
            r#"
CREATE INDEX IF NOT EXISTS cadence_fired_triggers_instance_idx
    ON cadence_fired_triggers (instance_id);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS cadence_calendars
(
    calendar_name TEXT  PRIMARY KEY,
    body          JSONB NOT NULL
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS cadence_paused_groups
(
    scope TEXT NOT NULL,
    op    TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (scope, op, value)
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS cadence_scheduler_state
(
    instance_id          TEXT        PRIMARY KEY,
    last_check_in        TIMESTAMPTZ NOT NULL,
    check_in_interval_ms BIGINT      NOT NULL
);
            "#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        for lock in [LOCK_TRIGGER_ACCESS, LOCK_STATE_ACCESS] {
            sqlx::query("INSERT INTO cadence_locks (name) VALUES ($1) ON CONFLICT DO NOTHING")
                .bind(lock)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    fn ctx(&self) -> Result<StoreContext> {
        self.ctx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| SchedulerError::Operation("job store is not initialized".into()))
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Begin a transaction holding the named lock row for its duration.
    async fn lock_tx(&self, lock: &str) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT name FROM cadence_locks WHERE name = $1 FOR UPDATE")
            .bind(lock)
            .fetch_one(&mut *tx)
            .await?;
        Ok(tx)
    }

    fn next_recovery_seq(&self) -> i64 {
        if self.recovery_seq.load(Ordering::SeqCst) == 0 {
            let _ = self.recovery_seq.compare_exchange(
                0,
                self.now().timestamp_millis(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        self.recovery_seq.fetch_add(1, Ordering::SeqCst)
    }

    async fn select_job_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        key: &JobKey,
    ) -> Result<Option<JobDefinition>> {
        let row = sqlx::query(
            r#"
SELECT job_name, job_group, job_type, description, data, durable, persist_data,
       non_concurrent, requests_recovery
FROM cadence_jobs
WHERE job_name = $1 AND job_group = $2
            "#,
        )
        .bind(&key.name)
        .bind(&key.group)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn select_trigger_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        key: &TriggerKey,
    ) -> Result<Option<(Trigger, TriggerState)>> {
        let row = sqlx::query(
            r#"
SELECT trigger_name, trigger_group, job_name, job_group, description, calendar_name,
       priority, start_time, end_time, prev_fire_time, next_fire_time,
       misfire_instruction, state, schedule, data
FROM cadence_triggers
WHERE trigger_name = $1 AND trigger_group = $2
            "#,
        )
        .bind(&key.name)
        .bind(&key.group)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(|r| trigger_from_row(&r)).transpose()
    }

    async fn select_calendar_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        name: Option<&str>,
    ) -> Result<Option<Calendar>> {
        let Some(name) = name else {
            return Ok(None);
        };
        let row = sqlx::query("SELECT body FROM cadence_calendars WHERE calendar_name = $1")
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.map(|r| r.try_get::<Json<Calendar>, _>("body").map(|j| j.0)).transpose()?)
    }

    async fn paused_matchers_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        scope: &str,
    ) -> Result<Vec<GroupMatcher>> {
        let rows = sqlx::query("SELECT op, value FROM cadence_paused_groups WHERE scope = $1")
            .bind(scope)
            .fetch_all(&mut **tx)
            .await?;
        rows.iter().map(matcher_from_row).collect()
    }

    async fn job_is_executing_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        key: &JobKey,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
SELECT EXISTS (
    SELECT 1 FROM cadence_fired_triggers
    WHERE job_name = $1 AND job_group = $2 AND state = $3
) AS executing
            "#,
        )
        .bind(&key.name)
        .bind(&key.group)
        .bind(FiredState::Executing)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row.try_get("executing")?)
    }

    async fn upsert_job_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        job: &JobDefinition,
    ) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO cadence_jobs (job_name, job_group, job_type, description, data, durable,
                          persist_data, non_concurrent, requests_recovery)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
ON CONFLICT (job_name, job_group) DO UPDATE SET
    job_type = EXCLUDED.job_type,
    description = EXCLUDED.description,
    data = EXCLUDED.data,
    durable = EXCLUDED.durable,
    persist_data = EXCLUDED.persist_data,
    non_concurrent = EXCLUDED.non_concurrent,
    requests_recovery = EXCLUDED.requests_recovery
            "#,
        )
        .bind(&job.key.name)
        .bind(&job.key.group)
        .bind(&job.job_type)
        .bind(&job.description)
        .bind(Json(&job.data))
        .bind(job.durable)
        .bind(job.persist_data_after_execution)
        .bind(job.concurrent_execution_disallowed)
        .bind(job.requests_recovery)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn store_job_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        job: &JobDefinition,
        replace: bool,
    ) -> Result<()> {
        if !replace && self.select_job_in_tx(tx, &job.key).await?.is_some() {
            return Err(SchedulerError::JobAlreadyExists {
                key: job.key.clone(),
            });
        }
        self.upsert_job_in_tx(tx, job).await
    }

    async fn store_trigger_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        trigger: &Trigger,
        replace: bool,
    ) -> Result<()> {
        let Some(job) = self.select_job_in_tx(tx, &trigger.job_key).await? else {
            return Err(SchedulerError::JobNotFound {
                key: trigger.job_key.clone(),
            });
        };

        let existing = self.select_trigger_in_tx(tx, &trigger.key).await?;
        let state = match &existing {
            Some((_, state)) => {
                if !replace {
                    return Err(SchedulerError::TriggerAlreadyExists {
                        key: trigger.key.clone(),
                    });
                }
                *state
            }
            None => {
                let trigger_paused = self
                    .paused_matchers_in_tx(tx, PAUSED_SCOPE_TRIGGER)
                    .await?
                    .iter()
                    .any(|m| m.matches(&trigger.key.group));
                let job_paused = self
                    .paused_matchers_in_tx(tx, PAUSED_SCOPE_JOB)
                    .await?
                    .iter()
                    .any(|m| m.matches(&trigger.job_key.group));
                let blocked = job.concurrent_execution_disallowed
                    && self.job_is_executing_in_tx(tx, &job.key).await?;
                match (trigger_paused || job_paused, blocked) {
                    (true, true) => TriggerState::PausedBlocked,
                    (true, false) => TriggerState::Paused,
                    (false, true) => TriggerState::Blocked,
                    (false, false) => TriggerState::Waiting,
                }
            }
        };

        self.write_trigger_in_tx(tx, trigger, state).await
    }

    async fn write_trigger_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        trigger: &Trigger,
        state: TriggerState,
    ) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO cadence_triggers (trigger_name, trigger_group, job_name, job_group, description,
                              calendar_name, priority, start_time, end_time, prev_fire_time,
                              next_fire_time, misfire_instruction, state, schedule, data)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
ON CONFLICT (trigger_name, trigger_group) DO UPDATE SET
    job_name = EXCLUDED.job_name,
    job_group = EXCLUDED.job_group,
    description = EXCLUDED.description,
    calendar_name = EXCLUDED.calendar_name,
    priority = EXCLUDED.priority,
    start_time = EXCLUDED.start_time,
    end_time = EXCLUDED.end_time,
    prev_fire_time = EXCLUDED.prev_fire_time,
    next_fire_time = EXCLUDED.next_fire_time,
    misfire_instruction = EXCLUDED.misfire_instruction,
    state = EXCLUDED.state,
    schedule = EXCLUDED.schedule,
    data = EXCLUDED.data
            "#,
        )
        .bind(&trigger.key.name)
        .bind(&trigger.key.group)
        .bind(&trigger.job_key.name)
        .bind(&trigger.job_key.group)
        .bind(&trigger.description)
        .bind(&trigger.calendar_name)
        .bind(trigger.priority)
        .bind(trigger.start_time)
        .bind(trigger.end_time)
        .bind(trigger.previous_fire_time)
        .bind(trigger.next_fire_time)
        .bind(trigger.misfire_instruction)
        .bind(state)
        .bind(Json(&trigger.schedule))
        .bind(Json(&trigger.data))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Update the volatile columns of a trigger after a schedule advance or
    /// misfire reclassification.
    async fn update_trigger_schedule_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        trigger: &Trigger,
        state: TriggerState,
    ) -> Result<()> {
        sqlx::query(
            r#"
UPDATE cadence_triggers
SET start_time = $1, prev_fire_time = $2, next_fire_time = $3, schedule = $4, state = $5
WHERE trigger_name = $6 AND trigger_group = $7
            "#,
        )
        .bind(trigger.start_time)
        .bind(trigger.previous_fire_time)
        .bind(trigger.next_fire_time)
        .bind(Json(&trigger.schedule))
        .bind(state)
        .bind(&trigger.key.name)
        .bind(&trigger.key.group)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn set_trigger_state_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        key: &TriggerKey,
        from: &[TriggerState],
        to: TriggerState,
    ) -> Result<bool> {
        let mut updated = false;
        for from_state in from {
            let result = sqlx::query(
                r#"
UPDATE cadence_triggers SET state = $1
WHERE trigger_name = $2 AND trigger_group = $3 AND state = $4
                "#,
            )
            .bind(to)
            .bind(&key.name)
            .bind(&key.group)
            .bind(from_state)
            .execute(&mut **tx)
            .await?;
            updated |= result.rows_affected() > 0;
        }
        Ok(updated)
    }

    async fn block_peers_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        job: &JobKey,
        firing: &TriggerKey,
    ) -> Result<()> {
        sqlx::query(
            r#"
UPDATE cadence_triggers SET state = $1
WHERE job_name = $2 AND job_group = $3 AND state IN ($4, $5)
  AND NOT (trigger_name = $6 AND trigger_group = $7)
            "#,
        )
        .bind(TriggerState::Blocked)
        .bind(&job.name)
        .bind(&job.group)
        .bind(TriggerState::Waiting)
        .bind(TriggerState::Acquired)
        .bind(&firing.name)
        .bind(&firing.group)
        .execute(&mut **tx)
        .await?;
        sqlx::query(
            r#"
UPDATE cadence_triggers SET state = $1
WHERE job_name = $2 AND job_group = $3 AND state = $4
  AND NOT (trigger_name = $5 AND trigger_group = $6)
            "#,
        )
        .bind(TriggerState::PausedBlocked)
        .bind(&job.name)
        .bind(&job.group)
        .bind(TriggerState::Paused)
        .bind(&firing.name)
        .bind(&firing.group)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn release_blocked_peers_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        job: &JobKey,
    ) -> Result<()> {
        sqlx::query(
            r#"
UPDATE cadence_triggers SET state = $1
WHERE job_name = $2 AND job_group = $3 AND state = $4
            "#,
        )
        .bind(TriggerState::Waiting)
        .bind(&job.name)
        .bind(&job.group)
        .bind(TriggerState::Blocked)
        .execute(&mut **tx)
        .await?;
        sqlx::query(
            r#"
UPDATE cadence_triggers SET state = $1
WHERE job_name = $2 AND job_group = $3 AND state = $4
            "#,
        )
        .bind(TriggerState::Paused)
        .bind(&job.name)
        .bind(&job.group)
        .bind(TriggerState::PausedBlocked)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Delete a trigger row; when its job is non-durable with no triggers
    /// left, delete the job too. Returns the deleted job key if so.
    async fn delete_trigger_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        key: &TriggerKey,
        clean_up_job: bool,
    ) -> Result<(bool, Option<JobKey>)> {
        let Some((trigger, _)) = self.select_trigger_in_tx(tx, key).await? else {
            return Ok((false, None));
        };
        sqlx::query(
            "DELETE FROM cadence_triggers WHERE trigger_name = $1 AND trigger_group = $2",
        )
        .bind(&key.name)
        .bind(&key.group)
        .execute(&mut **tx)
        .await?;
        sqlx::query(
            r#"
DELETE FROM cadence_fired_triggers
WHERE trigger_name = $1 AND trigger_group = $2 AND state = $3
            "#,
        )
        .bind(&key.name)
        .bind(&key.group)
        .bind(FiredState::Acquired)
        .execute(&mut **tx)
        .await?;

        if !clean_up_job {
            return Ok((true, None));
        }
        let job_key = trigger.job_key;
        let remaining: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM cadence_triggers WHERE job_name = $1 AND job_group = $2",
        )
        .bind(&job_key.name)
        .bind(&job_key.group)
        .fetch_one(&mut **tx)
        .await?
        .try_get("n")?;
        if remaining > 0 {
            return Ok((true, None));
        }
        let durable = self
            .select_job_in_tx(tx, &job_key)
            .await?
            .is_some_and(|j| j.durable);
        if durable {
            return Ok((true, None));
        }
        let deleted = sqlx::query("DELETE FROM cadence_jobs WHERE job_name = $1 AND job_group = $2")
            .bind(&job_key.name)
            .bind(&job_key.group)
            .execute(&mut **tx)
            .await?
            .rows_affected()
            > 0;
        Ok((true, deleted.then_some(job_key)))
    }

    async fn trigger_keys_matching_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        matcher: &GroupMatcher,
    ) -> Result<Vec<TriggerKey>> {
        let rows = match matcher {
            GroupMatcher::Equals(group) => {
                sqlx::query(
                    "SELECT trigger_name, trigger_group FROM cadence_triggers WHERE trigger_group = $1",
                )
                .bind(group)
                .fetch_all(&mut **tx)
                .await?
            }
            GroupMatcher::Prefix(prefix) => {
                sqlx::query(
                    r#"
SELECT trigger_name, trigger_group FROM cadence_triggers
WHERE substr(trigger_group, 1, length($1)) = $1
                    "#,
                )
                .bind(prefix)
                .fetch_all(&mut **tx)
                .await?
            }
            GroupMatcher::Any => {
                sqlx::query("SELECT trigger_name, trigger_group FROM cadence_triggers")
                    .fetch_all(&mut **tx)
                    .await?
            }
        };
        rows.iter()
            .map(|r| {
                Ok(TriggerKey::new(
                    r.try_get::<String, _>("trigger_name")?,
                    r.try_get::<String, _>("trigger_group")?,
                ))
            })
            .collect()
    }

    async fn resume_trigger_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        key: &TriggerKey,
        now: DateTime<Utc>,
        misfire_threshold: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some((mut trigger, state)) = self.select_trigger_in_tx(tx, key).await? else {
            return Ok(None);
        };
        if !state.is_paused() {
            return Ok(None);
        }

        let non_concurrent = self
            .select_job_in_tx(tx, &trigger.job_key)
            .await?
            .is_some_and(|j| j.concurrent_execution_disallowed);
        let executing = non_concurrent && self.job_is_executing_in_tx(tx, &trigger.job_key).await?;
        let mut new_state = if executing {
            TriggerState::Blocked
        } else {
            TriggerState::Waiting
        };

        if new_state == TriggerState::Waiting && trigger.has_misfired(now, misfire_threshold) {
            let calendar = self
                .select_calendar_in_tx(tx, trigger.calendar_name.as_deref())
                .await?;
            if let Err(e) = trigger.update_after_misfire(now, calendar.as_ref()) {
                warn!(trigger = %key, error = %e, "misfire handling on resume failed");
                new_state = TriggerState::Error;
            } else if trigger.next_fire_time.is_none() {
                new_state = TriggerState::Complete;
            }
        }

        self.update_trigger_schedule_in_tx(tx, &trigger, new_state)
            .await?;
        Ok(match new_state {
            TriggerState::Waiting | TriggerState::Blocked => trigger.next_fire_time,
            _ => None,
        })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn initialize(&self, ctx: StoreContext) -> Result<()> {
        *self.ctx.lock().unwrap_or_else(|e| e.into_inner()) = Some(ctx);
        self.create_tables().await
    }

    async fn store_job(&self, job: JobDefinition, replace: bool) -> Result<()> {
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        self.store_job_in_tx(&mut tx, &job, replace).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<()> {
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        self.store_trigger_in_tx(&mut tx, &trigger, replace).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn store_job_and_trigger(
        &self,
        job: JobDefinition,
        trigger: Trigger,
        replace: bool,
    ) -> Result<()> {
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        self.store_job_in_tx(&mut tx, &job, replace).await?;
        self.store_trigger_in_tx(&mut tx, &trigger, replace).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDefinition>> {
        let row = sqlx::query(
            r#"
SELECT job_name, job_group, job_type, description, data, durable, persist_data,
       non_concurrent, requests_recovery
FROM cadence_jobs
WHERE job_name = $1 AND job_group = $2
            "#,
        )
        .bind(&key.name)
        .bind(&key.group)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        let row = sqlx::query(
            r#"
SELECT trigger_name, trigger_group, job_name, job_group, description, calendar_name,
       priority, start_time, end_time, prev_fire_time, next_fire_time,
       misfire_instruction, state, schedule, data
FROM cadence_triggers
WHERE trigger_name = $1 AND trigger_group = $2
            "#,
        )
        .bind(&key.name)
        .bind(&key.group)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| trigger_from_row(&r)).transpose()?.map(|(t, _)| t))
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let ctx = self.ctx()?;
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        let (removed, deleted_job) = self.delete_trigger_in_tx(&mut tx, key, true).await?;
        tx.commit().await?;
        if let Some(job) = deleted_job {
            ctx.signaler.notify_job_deleted(&job);
        }
        Ok(removed)
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool> {
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        sqlx::query("DELETE FROM cadence_triggers WHERE job_name = $1 AND job_group = $2")
            .bind(&key.name)
            .bind(&key.group)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM cadence_jobs WHERE job_name = $1 AND job_group = $2")
            .bind(&key.name)
            .bind(&key.group)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;
        tx.commit().await?;
        Ok(removed)
    }

    async fn replace_trigger(&self, key: &TriggerKey, new_trigger: Trigger) -> Result<bool> {
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        let Some((old, _)) = self.select_trigger_in_tx(&mut tx, key).await? else {
            return Ok(false);
        };
        if old.job_key != new_trigger.job_key {
            return Err(SchedulerError::InvalidTrigger {
                key: new_trigger.key.clone(),
                reason: "replacement trigger references a different job".into(),
            });
        }
        self.delete_trigger_in_tx(&mut tx, key, false).await?;
        self.store_trigger_in_tx(&mut tx, &new_trigger, false).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn trigger_state(&self, key: &TriggerKey) -> Result<TriggerState> {
        let row = sqlx::query(
            "SELECT state FROM cadence_triggers WHERE trigger_name = $1 AND trigger_group = $2",
        )
        .bind(&key.name)
        .bind(&key.group)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|r| r.try_get::<TriggerState, _>("state"))
            .transpose()?
            .unwrap_or(TriggerState::Deleted))
    }

    async fn triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
        let rows = sqlx::query(
            r#"
SELECT trigger_name, trigger_group, job_name, job_group, description, calendar_name,
       priority, start_time, end_time, prev_fire_time, next_fire_time,
       misfire_instruction, state, schedule, data
FROM cadence_triggers
WHERE job_name = $1 AND job_group = $2
            "#,
        )
        .bind(&key.name)
        .bind(&key.group)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| trigger_from_row(r).map(|(t, _)| t))
            .collect()
    }

    async fn job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>> {
        let rows = match matcher {
            GroupMatcher::Equals(group) => {
                sqlx::query("SELECT job_name, job_group FROM cadence_jobs WHERE job_group = $1 ORDER BY job_group, job_name")
                    .bind(group)
                    .fetch_all(&self.pool)
                    .await?
            }
            GroupMatcher::Prefix(prefix) => {
                sqlx::query(
                    r#"
SELECT job_name, job_group FROM cadence_jobs
WHERE substr(job_group, 1, length($1)) = $1
ORDER BY job_group, job_name
                    "#,
                )
                .bind(prefix)
                .fetch_all(&self.pool)
                .await?
            }
            GroupMatcher::Any => {
                sqlx::query("SELECT job_name, job_group FROM cadence_jobs ORDER BY job_group, job_name")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter()
            .map(|r| {
                Ok(JobKey::new(
                    r.try_get::<String, _>("job_name")?,
                    r.try_get::<String, _>("job_group")?,
                ))
            })
            .collect()
    }

    async fn trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>> {
        let mut tx = self.pool.begin().await?;
        let mut keys = self.trigger_keys_matching_in_tx(&mut tx, matcher).await?;
        tx.commit().await?;
        keys.sort();
        Ok(keys)
    }

    async fn store_calendar(&self, name: &str, calendar: Calendar, replace: bool) -> Result<()> {
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        if !replace {
            let exists = sqlx::query("SELECT 1 AS one FROM cadence_calendars WHERE calendar_name = $1")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            if exists {
                return Err(SchedulerError::CalendarAlreadyExists {
                    name: name.to_string(),
                });
            }
        }
        sqlx::query(
            r#"
INSERT INTO cadence_calendars (calendar_name, body) VALUES ($1, $2)
ON CONFLICT (calendar_name) DO UPDATE SET body = EXCLUDED.body
            "#,
        )
        .bind(name)
        .bind(Json(&calendar))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>> {
        let row = sqlx::query("SELECT body FROM cadence_calendars WHERE calendar_name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.try_get::<Json<Calendar>, _>("body").map(|j| j.0))
            .transpose()?)
    }

    async fn remove_calendar(&self, name: &str) -> Result<bool> {
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        let references: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM cadence_triggers WHERE calendar_name = $1",
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await?
        .try_get("n")?;
        if references > 0 {
            return Err(SchedulerError::CalendarInUse {
                name: name.to_string(),
                count: references as usize,
            });
        }
        let removed = sqlx::query("DELETE FROM cadence_calendars WHERE calendar_name = $1")
            .bind(name)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;
        tx.commit().await?;
        Ok(removed)
    }

    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Result<Vec<Trigger>> {
        let ctx = self.ctx()?;
        let now = self.now();
        let deadline = no_later_than + time_window;

        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        let rows = sqlx::query(
            r#"
SELECT t.trigger_name, t.trigger_group, t.job_name, t.job_group, t.description,
       t.calendar_name, t.priority, t.start_time, t.end_time, t.prev_fire_time,
       t.next_fire_time, t.misfire_instruction, t.state, t.schedule, t.data,
       j.non_concurrent, j.requests_recovery
FROM cadence_triggers t
JOIN cadence_jobs j ON j.job_name = t.job_name AND j.job_group = t.job_group
WHERE t.state = $1 AND t.next_fire_time IS NOT NULL AND t.next_fire_time <= $2
ORDER BY t.next_fire_time ASC, t.priority DESC, t.trigger_name ASC
LIMIT $3
FOR UPDATE OF t SKIP LOCKED
            "#,
        )
        .bind(TriggerState::Waiting)
        .bind(deadline)
        .bind(max_count as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut acquired = Vec::new();
        let mut non_concurrent_jobs = std::collections::HashSet::new();
        for row in &rows {
            let (trigger, _) = trigger_from_row(row)?;
            let non_concurrent: bool = row.try_get("non_concurrent")?;
            let requests_recovery: bool = row.try_get("requests_recovery")?;

            if non_concurrent && !non_concurrent_jobs.insert(trigger.job_key.clone()) {
                continue;
            }
            let Some(scheduled_at) = trigger.next_fire_time else {
                continue;
            };

            let claimed = self
                .set_trigger_state_in_tx(
                    &mut tx,
                    &trigger.key,
                    &[TriggerState::Waiting],
                    TriggerState::Acquired,
                )
                .await?;
            if !claimed {
                continue;
            }

            sqlx::query(
                r#"
INSERT INTO cadence_fired_triggers (entry_id, trigger_name, trigger_group, job_name, job_group,
                                    instance_id, state, fired_at, scheduled_at, priority,
                                    non_concurrent, requests_recovery)
VALUES ($1, $2, $3, NULL, NULL, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&trigger.key.name)
            .bind(&trigger.key.group)
            .bind(&ctx.instance_id)
            .bind(FiredState::Acquired)
            .bind(now)
            .bind(scheduled_at)
            .bind(trigger.priority)
            .bind(non_concurrent)
            .bind(requests_recovery)
            .execute(&mut *tx)
            .await?;

            acquired.push(trigger);
        }
        tx.commit().await?;
        Ok(acquired)
    }

    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<()> {
        let ctx = self.ctx()?;
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        self.set_trigger_state_in_tx(
            &mut tx,
            &trigger.key,
            &[TriggerState::Acquired],
            TriggerState::Waiting,
        )
        .await?;
        sqlx::query(
            r#"
DELETE FROM cadence_fired_triggers
WHERE trigger_name = $1 AND trigger_group = $2 AND instance_id = $3 AND state = $4
            "#,
        )
        .bind(&trigger.key.name)
        .bind(&trigger.key.group)
        .bind(&ctx.instance_id)
        .bind(FiredState::Acquired)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn triggers_fired(&self, triggers: Vec<Trigger>) -> Result<Vec<TriggerFiredResult>> {
        let ctx = self.ctx()?;
        let mut results = Vec::with_capacity(triggers.len());

        for fired in triggers {
            let key = fired.key.clone();
            let now = self.now();
            let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;

            let current = self.select_trigger_in_tx(&mut tx, &key).await?;
            let entry: Option<Uuid> = sqlx::query(
                r#"
SELECT entry_id FROM cadence_fired_triggers
WHERE trigger_name = $1 AND trigger_group = $2 AND instance_id = $3 AND state = $4
                "#,
            )
            .bind(&key.name)
            .bind(&key.group)
            .bind(&ctx.instance_id)
            .bind(FiredState::Acquired)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| r.try_get("entry_id"))
            .transpose()?;

            let (Some((mut trigger, state)), Some(entry_id)) = (current, entry) else {
                sqlx::query(
                    r#"
DELETE FROM cadence_fired_triggers
WHERE trigger_name = $1 AND trigger_group = $2 AND instance_id = $3 AND state = $4
                    "#,
                )
                .bind(&key.name)
                .bind(&key.group)
                .bind(&ctx.instance_id)
                .bind(FiredState::Acquired)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                results.push(TriggerFiredResult::Removed { key });
                continue;
            };

            let job = self.select_job_in_tx(&mut tx, &trigger.job_key).await?;
            let (Some(job), TriggerState::Acquired) = (job, state) else {
                sqlx::query("DELETE FROM cadence_fired_triggers WHERE entry_id = $1")
                    .bind(entry_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                results.push(TriggerFiredResult::Removed { key });
                continue;
            };

            let calendar = self
                .select_calendar_in_tx(&mut tx, trigger.calendar_name.as_deref())
                .await?;
            let previous_fire_time = trigger.previous_fire_time;
            let Some(scheduled_fire_time) = trigger.next_fire_time else {
                sqlx::query("DELETE FROM cadence_fired_triggers WHERE entry_id = $1")
                    .bind(entry_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                results.push(TriggerFiredResult::Removed { key });
                continue;
            };

            if let Err(e) = trigger.triggered(calendar.as_ref()) {
                warn!(trigger = %key, error = %e, "schedule advance failed, parking trigger in error state");
                self.update_trigger_schedule_in_tx(&mut tx, &trigger, TriggerState::Error)
                    .await?;
                sqlx::query("DELETE FROM cadence_fired_triggers WHERE entry_id = $1")
                    .bind(entry_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                results.push(TriggerFiredResult::Removed { key });
                continue;
            }

            let new_state = if trigger.next_fire_time.is_none() {
                TriggerState::Complete
            } else if job.concurrent_execution_disallowed {
                TriggerState::Blocked
            } else {
                TriggerState::Waiting
            };
            self.update_trigger_schedule_in_tx(&mut tx, &trigger, new_state)
                .await?;
            if job.concurrent_execution_disallowed {
                self.block_peers_in_tx(&mut tx, &job.key, &key).await?;
            }

            sqlx::query(
                r#"
UPDATE cadence_fired_triggers
SET state = $1, job_name = $2, job_group = $3, fired_at = $4
WHERE entry_id = $5
                "#,
            )
            .bind(FiredState::Executing)
            .bind(&job.key.name)
            .bind(&job.key.group)
            .bind(now)
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            results.push(TriggerFiredResult::Fired(Box::new(TriggerFiredBundle {
                fire_id: entry_id,
                next_fire_time: trigger.next_fire_time,
                trigger: trigger.clone(),
                job,
                calendar,
                fire_time: now,
                scheduled_fire_time,
                previous_fire_time,
            })));
        }
        Ok(results)
    }

    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDefinition,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        let ctx = self.ctx()?;
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;

        if job.persist_data_after_execution {
            sqlx::query(
                "UPDATE cadence_jobs SET data = $1 WHERE job_name = $2 AND job_group = $3",
            )
            .bind(Json(&job.data))
            .bind(&job.key.name)
            .bind(&job.key.group)
            .execute(&mut *tx)
            .await?;
        }

        if instruction == CompletedExecutionInstruction::ReExecuteJob {
            tx.commit().await?;
            return Ok(());
        }

        let mut released_peers = false;
        if job.concurrent_execution_disallowed {
            self.release_blocked_peers_in_tx(&mut tx, &job.key).await?;
            released_peers = true;
        }

        let mut finalized = Vec::new();
        let mut deleted_job = None;
        match instruction {
            CompletedExecutionInstruction::Noop
            | CompletedExecutionInstruction::ReExecuteJob => {}
            CompletedExecutionInstruction::SetTriggerComplete => {
                sqlx::query(
                    "UPDATE cadence_triggers SET state = $1 WHERE trigger_name = $2 AND trigger_group = $3",
                )
                .bind(TriggerState::Complete)
                .bind(&trigger.key.name)
                .bind(&trigger.key.group)
                .execute(&mut *tx)
                .await?;
                finalized.push(trigger.key.clone());
            }
            CompletedExecutionInstruction::DeleteTrigger => {
                let gone_for_good = self
                    .select_trigger_in_tx(&mut tx, &trigger.key)
                    .await?
                    .is_some_and(|(t, _)| t.next_fire_time.is_none());
                if gone_for_good {
                    let (_, job_deleted) = self
                        .delete_trigger_in_tx(&mut tx, &trigger.key, true)
                        .await?;
                    finalized.push(trigger.key.clone());
                    deleted_job = job_deleted;
                }
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                let keys: Vec<TriggerKey> = sqlx::query(
                    "SELECT trigger_name, trigger_group FROM cadence_triggers WHERE job_name = $1 AND job_group = $2",
                )
                .bind(&job.key.name)
                .bind(&job.key.group)
                .fetch_all(&mut *tx)
                .await?
                .iter()
                .map(|r| {
                    Ok::<_, SchedulerError>(TriggerKey::new(
                        r.try_get::<String, _>("trigger_name")?,
                        r.try_get::<String, _>("trigger_group")?,
                    ))
                })
                .collect::<Result<_>>()?;
                sqlx::query(
                    "UPDATE cadence_triggers SET state = $1 WHERE job_name = $2 AND job_group = $3",
                )
                .bind(TriggerState::Complete)
                .bind(&job.key.name)
                .bind(&job.key.group)
                .execute(&mut *tx)
                .await?;
                finalized.extend(keys);
            }
            CompletedExecutionInstruction::SetTriggerError => {
                sqlx::query(
                    "UPDATE cadence_triggers SET state = $1 WHERE trigger_name = $2 AND trigger_group = $3",
                )
                .bind(TriggerState::Error)
                .bind(&trigger.key.name)
                .bind(&trigger.key.group)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query(
            r#"
DELETE FROM cadence_fired_triggers
WHERE trigger_name = $1 AND trigger_group = $2 AND instance_id = $3
            "#,
        )
        .bind(&trigger.key.name)
        .bind(&trigger.key.group)
        .bind(&ctx.instance_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if released_peers {
            ctx.signaler.signal_scheduling_change(None);
        }
        for key in finalized {
            ctx.signaler.notify_finalized(&key);
        }
        if let Some(job_key) = deleted_job {
            ctx.signaler.notify_job_deleted(&job_key);
        }
        Ok(())
    }

    async fn get_misfired_triggers(
        &self,
        state: TriggerState,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriggerKey>> {
        let rows = sqlx::query(
            r#"
SELECT trigger_name, trigger_group FROM cadence_triggers
WHERE state = $1 AND next_fire_time IS NOT NULL AND next_fire_time < $2
  AND misfire_instruction <> $3
ORDER BY next_fire_time ASC, priority DESC, trigger_name ASC
LIMIT $4
            "#,
        )
        .bind(state)
        .bind(cutoff)
        .bind(MisfireInstruction::IgnoreMisfire)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(TriggerKey::new(
                    r.try_get::<String, _>("trigger_name")?,
                    r.try_get::<String, _>("trigger_group")?,
                ))
            })
            .collect()
    }

    async fn recover_misfires(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<MisfireSweep> {
        let ctx = self.ctx()?;
        let now = self.now();
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;

        let rows = sqlx::query(
            r#"
SELECT trigger_name, trigger_group, job_name, job_group, description, calendar_name,
       priority, start_time, end_time, prev_fire_time, next_fire_time,
       misfire_instruction, state, schedule, data
FROM cadence_triggers
WHERE state = $1 AND next_fire_time IS NOT NULL AND next_fire_time < $2
  AND misfire_instruction <> $3
ORDER BY next_fire_time ASC, priority DESC, trigger_name ASC
LIMIT $4
            "#,
        )
        .bind(TriggerState::Waiting)
        .bind(cutoff)
        .bind(MisfireInstruction::IgnoreMisfire)
        .bind((limit + 1) as i64)
        .fetch_all(&mut *tx)
        .await?;

        let has_more = rows.len() > limit;
        let mut sweep = MisfireSweep {
            has_more,
            ..Default::default()
        };
        let mut misfired = Vec::new();
        let mut completed = Vec::new();

        for row in rows.iter().take(limit) {
            let (mut trigger, _) = trigger_from_row(row)?;
            let key = trigger.key.clone();
            let calendar = self
                .select_calendar_in_tx(&mut tx, trigger.calendar_name.as_deref())
                .await?;

            misfired.push(key.clone());
            if let Err(e) = trigger.update_after_misfire(now, calendar.as_ref()) {
                warn!(trigger = %key, error = %e, "misfire handling failed, parking trigger in error state");
                self.update_trigger_schedule_in_tx(&mut tx, &trigger, TriggerState::Error)
                    .await?;
                continue;
            }
            match trigger.next_fire_time {
                None => {
                    self.update_trigger_schedule_in_tx(&mut tx, &trigger, TriggerState::Complete)
                        .await?;
                    completed.push(key);
                }
                Some(next) => {
                    self.update_trigger_schedule_in_tx(&mut tx, &trigger, TriggerState::Waiting)
                        .await?;
                    sweep.earliest_new_time = Some(match sweep.earliest_new_time {
                        Some(t) if t <= next => t,
                        _ => next,
                    });
                }
            }
            sweep.processed += 1;
        }
        tx.commit().await?;

        for key in misfired {
            ctx.signaler.notify_misfired(&key);
        }
        for key in completed {
            ctx.signaler.notify_finalized(&key);
        }
        Ok(sweep)
    }

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        self.set_trigger_state_in_tx(
            &mut tx,
            key,
            &[TriggerState::Waiting, TriggerState::Acquired],
            TriggerState::Paused,
        )
        .await?;
        self.set_trigger_state_in_tx(
            &mut tx,
            key,
            &[TriggerState::Blocked],
            TriggerState::PausedBlocked,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        let (op, value) = matcher_columns(matcher);
        sqlx::query(
            r#"
INSERT INTO cadence_paused_groups (scope, op, value) VALUES ($1, $2, $3)
ON CONFLICT DO NOTHING
            "#,
        )
        .bind(PAUSED_SCOPE_TRIGGER)
        .bind(op)
        .bind(value)
        .execute(&mut *tx)
        .await?;

        let keys = self.trigger_keys_matching_in_tx(&mut tx, matcher).await?;
        let mut groups: Vec<String> = keys.iter().map(|k| k.group.clone()).collect();
        groups.sort();
        groups.dedup();
        for key in &keys {
            self.set_trigger_state_in_tx(
                &mut tx,
                key,
                &[TriggerState::Waiting, TriggerState::Acquired],
                TriggerState::Paused,
            )
            .await?;
            self.set_trigger_state_in_tx(
                &mut tx,
                key,
                &[TriggerState::Blocked],
                TriggerState::PausedBlocked,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(groups)
    }

    async fn pause_job(&self, key: &JobKey) -> Result<()> {
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        let keys: Vec<TriggerKey> = sqlx::query(
            "SELECT trigger_name, trigger_group FROM cadence_triggers WHERE job_name = $1 AND job_group = $2",
        )
        .bind(&key.name)
        .bind(&key.group)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|r| {
            Ok::<_, SchedulerError>(TriggerKey::new(
                r.try_get::<String, _>("trigger_name")?,
                r.try_get::<String, _>("trigger_group")?,
            ))
        })
        .collect::<Result<_>>()?;
        for trigger_key in &keys {
            self.set_trigger_state_in_tx(
                &mut tx,
                trigger_key,
                &[TriggerState::Waiting, TriggerState::Acquired],
                TriggerState::Paused,
            )
            .await?;
            self.set_trigger_state_in_tx(
                &mut tx,
                trigger_key,
                &[TriggerState::Blocked],
                TriggerState::PausedBlocked,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        let (op, value) = matcher_columns(matcher);
        sqlx::query(
            r#"
INSERT INTO cadence_paused_groups (scope, op, value) VALUES ($1, $2, $3)
ON CONFLICT DO NOTHING
            "#,
        )
        .bind(PAUSED_SCOPE_JOB)
        .bind(op)
        .bind(value)
        .execute(&mut *tx)
        .await?;

        let rows = sqlx::query("SELECT trigger_name, trigger_group, job_group FROM cadence_triggers")
            .fetch_all(&mut *tx)
            .await?;
        let mut groups = Vec::new();
        for row in &rows {
            let job_group: String = row.try_get("job_group")?;
            if !matcher.matches(&job_group) {
                continue;
            }
            groups.push(job_group);
            let key = TriggerKey::new(
                row.try_get::<String, _>("trigger_name")?,
                row.try_get::<String, _>("trigger_group")?,
            );
            self.set_trigger_state_in_tx(
                &mut tx,
                &key,
                &[TriggerState::Waiting, TriggerState::Acquired],
                TriggerState::Paused,
            )
            .await?;
            self.set_trigger_state_in_tx(
                &mut tx,
                &key,
                &[TriggerState::Blocked],
                TriggerState::PausedBlocked,
            )
            .await?;
        }
        tx.commit().await?;
        groups.sort();
        groups.dedup();
        Ok(groups)
    }

    async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
        let ctx = self.ctx()?;
        let now = self.now();
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        let next = self
            .resume_trigger_in_tx(&mut tx, key, now, ctx.misfire_threshold)
            .await?;
        tx.commit().await?;
        if next.is_some() {
            ctx.signaler.signal_scheduling_change(next);
        }
        Ok(())
    }

    async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let ctx = self.ctx()?;
        let now = self.now();
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;

        let stored = self.paused_matchers_in_tx(&mut tx, PAUSED_SCOPE_TRIGGER).await?;
        for m in stored.iter().filter(|m| resume_covers(m, matcher)) {
            let (op, value) = matcher_columns(m);
            sqlx::query(
                "DELETE FROM cadence_paused_groups WHERE scope = $1 AND op = $2 AND value = $3",
            )
            .bind(PAUSED_SCOPE_TRIGGER)
            .bind(op)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        let keys = self.trigger_keys_matching_in_tx(&mut tx, matcher).await?;
        let mut groups: Vec<String> = keys.iter().map(|k| k.group.clone()).collect();
        groups.sort();
        groups.dedup();
        let mut earliest: Option<DateTime<Utc>> = None;
        for key in &keys {
            if let Some(next) = self
                .resume_trigger_in_tx(&mut tx, key, now, ctx.misfire_threshold)
                .await?
            {
                earliest = Some(match earliest {
                    Some(t) if t <= next => t,
                    _ => next,
                });
            }
        }
        tx.commit().await?;
        if earliest.is_some() {
            ctx.signaler.signal_scheduling_change(earliest);
        }
        Ok(groups)
    }

    async fn resume_job(&self, key: &JobKey) -> Result<()> {
        let ctx = self.ctx()?;
        let now = self.now();
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        let keys: Vec<TriggerKey> = sqlx::query(
            "SELECT trigger_name, trigger_group FROM cadence_triggers WHERE job_name = $1 AND job_group = $2",
        )
        .bind(&key.name)
        .bind(&key.group)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|r| {
            Ok::<_, SchedulerError>(TriggerKey::new(
                r.try_get::<String, _>("trigger_name")?,
                r.try_get::<String, _>("trigger_group")?,
            ))
        })
        .collect::<Result<_>>()?;
        for trigger_key in &keys {
            self.resume_trigger_in_tx(&mut tx, trigger_key, now, ctx.misfire_threshold)
                .await?;
        }
        tx.commit().await?;
        ctx.signaler.signal_scheduling_change(None);
        Ok(())
    }

    async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let ctx = self.ctx()?;
        let now = self.now();
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;

        let stored = self.paused_matchers_in_tx(&mut tx, PAUSED_SCOPE_JOB).await?;
        for m in stored.iter().filter(|m| resume_covers(m, matcher)) {
            let (op, value) = matcher_columns(m);
            sqlx::query(
                "DELETE FROM cadence_paused_groups WHERE scope = $1 AND op = $2 AND value = $3",
            )
            .bind(PAUSED_SCOPE_JOB)
            .bind(op)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        let rows = sqlx::query("SELECT trigger_name, trigger_group, job_group FROM cadence_triggers")
            .fetch_all(&mut *tx)
            .await?;
        let mut groups = Vec::new();
        for row in &rows {
            let job_group: String = row.try_get("job_group")?;
            if !matcher.matches(&job_group) {
                continue;
            }
            groups.push(job_group);
            let key = TriggerKey::new(
                row.try_get::<String, _>("trigger_name")?,
                row.try_get::<String, _>("trigger_group")?,
            );
            self.resume_trigger_in_tx(&mut tx, &key, now, ctx.misfire_threshold)
                .await?;
        }
        tx.commit().await?;
        ctx.signaler.signal_scheduling_change(None);
        groups.sort();
        groups.dedup();
        Ok(groups)
    }

    async fn pause_all(&self) -> Result<()> {
        self.pause_triggers(&GroupMatcher::Any).await?;
        Ok(())
    }

    async fn resume_all(&self) -> Result<()> {
        {
            let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
            sqlx::query("DELETE FROM cadence_paused_groups")
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        self.resume_triggers(&GroupMatcher::Any).await?;
        Ok(())
    }

    async fn paused_trigger_groups(&self) -> Result<Vec<GroupMatcher>> {
        let rows = sqlx::query("SELECT op, value FROM cadence_paused_groups WHERE scope = $1")
            .bind(PAUSED_SCOPE_TRIGGER)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(matcher_from_row).collect()
    }

    async fn check_in(&self, now: DateTime<Utc>) -> Result<()> {
        let ctx = self.ctx()?;
        let mut tx = self.lock_tx(LOCK_STATE_ACCESS).await?;
        sqlx::query(
            r#"
INSERT INTO cadence_scheduler_state (instance_id, last_check_in, check_in_interval_ms)
VALUES ($1, $2, $3)
ON CONFLICT (instance_id) DO UPDATE SET
    last_check_in = EXCLUDED.last_check_in,
    check_in_interval_ms = EXCLUDED.check_in_interval_ms
            "#,
        )
        .bind(&ctx.instance_id)
        .bind(now)
        .bind(ctx.check_in_interval.num_milliseconds())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_failed_instances(&self, now: DateTime<Utc>) -> Result<Vec<SchedulerStateRecord>> {
        let ctx = self.ctx()?;
        let rows = sqlx::query(
            "SELECT instance_id, last_check_in, check_in_interval_ms FROM cadence_scheduler_state",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut failed = Vec::new();
        for row in &rows {
            let record = SchedulerStateRecord {
                instance_id: row.try_get("instance_id")?,
                last_check_in: row.try_get("last_check_in")?,
                check_in_interval_ms: row.try_get("check_in_interval_ms")?,
            };
            if record.instance_id == ctx.instance_id {
                continue;
            }
            let allowance =
                Duration::milliseconds(record.check_in_interval_ms) + ctx.check_in_tolerance;
            if now - record.last_check_in > allowance {
                failed.push(record);
            }
        }
        Ok(failed)
    }

    async fn recover_jobs(&self, instance_id: &str) -> Result<RecoveryReport> {
        let ctx = self.ctx()?;
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;

        let rows = sqlx::query(
            r#"
SELECT entry_id, trigger_name, trigger_group, job_name, job_group, instance_id, state,
       fired_at, scheduled_at, priority, non_concurrent, requests_recovery
FROM cadence_fired_triggers
WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut report = RecoveryReport::default();
        for row in &rows {
            let fired = fired_from_row(row)?;

            if fired.state == FiredState::Executing && fired.requests_recovery {
                let job = match &fired.job_key {
                    Some(key) => self.select_job_in_tx(&mut tx, key).await?,
                    None => None,
                };
                if let Some(job) = job {
                    let seq = self.next_recovery_seq();
                    let mut data = job.data.clone();
                    data.put(
                        RECOVERY_ORIGINAL_TRIGGER_NAME,
                        fired.trigger_key.name.clone(),
                    );
                    data.put(
                        RECOVERY_ORIGINAL_TRIGGER_GROUP,
                        fired.trigger_key.group.clone(),
                    );
                    data.put(RECOVERY_ORIGINAL_FIRE_TIME, fired.fired_at.to_rfc3339());
                    data.put(
                        RECOVERY_ORIGINAL_SCHEDULED_FIRE_TIME,
                        fired.scheduled_at.to_rfc3339(),
                    );

                    let mut recovery = Trigger::builder()
                        .key(TriggerKey::new(
                            format!("recover_{instance_id}_{seq}"),
                            RECOVERY_TRIGGER_GROUP,
                        ))
                        .job_key(job.key.clone())
                        .priority(fired.priority)
                        .start_time(fired.scheduled_at)
                        .misfire_instruction(MisfireInstruction::IgnoreMisfire)
                        .schedule(Schedule::Simple(SimpleSchedule::once()))
                        .data(data)
                        .build();
                    recovery.next_fire_time = Some(fired.scheduled_at);

                    self.write_trigger_in_tx(&mut tx, &recovery, TriggerState::Waiting)
                        .await?;
                    report.recovery_triggers += 1;
                }
            }

            match fired.state {
                FiredState::Acquired => {
                    if self
                        .set_trigger_state_in_tx(
                            &mut tx,
                            &fired.trigger_key,
                            &[TriggerState::Acquired],
                            TriggerState::Waiting,
                        )
                        .await?
                    {
                        report.released_triggers += 1;
                    }
                }
                FiredState::Executing => {
                    if fired.non_concurrent {
                        if let Some(job_key) = &fired.job_key {
                            self.release_blocked_peers_in_tx(&mut tx, job_key).await?;
                        }
                    }
                    self.set_trigger_state_in_tx(
                        &mut tx,
                        &fired.trigger_key,
                        &[TriggerState::Blocked],
                        TriggerState::Waiting,
                    )
                    .await?;
                    self.set_trigger_state_in_tx(
                        &mut tx,
                        &fired.trigger_key,
                        &[TriggerState::PausedBlocked],
                        TriggerState::Paused,
                    )
                    .await?;
                    report.released_triggers += 1;
                }
            }
        }

        sqlx::query("DELETE FROM cadence_fired_triggers WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM cadence_scheduler_state WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if report.recovery_triggers > 0 || report.released_triggers > 0 {
            ctx.signaler.signal_scheduling_change(None);
        }
        Ok(report)
    }

    async fn fired_triggers(&self, instance_id: &str) -> Result<Vec<FiredTrigger>> {
        let rows = sqlx::query(
            r#"
SELECT entry_id, trigger_name, trigger_group, job_name, job_group, instance_id, state,
       fired_at, scheduled_at, priority, non_concurrent, requests_recovery
FROM cadence_fired_triggers
WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(fired_from_row).collect()
    }

    async fn clear_all_scheduling_data(&self) -> Result<()> {
        let mut tx = self.lock_tx(LOCK_TRIGGER_ACCESS).await?;
        for table in [
            "cadence_fired_triggers",
            "cadence_triggers",
            "cadence_jobs",
            "cadence_calendars",
            "cadence_paused_groups",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<JobDefinition> {
    Ok(JobDefinition {
        key: JobKey::new(
            row.try_get::<String, _>("job_name")?,
            row.try_get::<String, _>("job_group")?,
        ),
        job_type: row.try_get("job_type")?,
        description: row.try_get("description")?,
        data: row.try_get::<Json<JobDataMap>, _>("data")?.0,
        durable: row.try_get("durable")?,
        persist_data_after_execution: row.try_get("persist_data")?,
        concurrent_execution_disallowed: row.try_get("non_concurrent")?,
        requests_recovery: row.try_get("requests_recovery")?,
    })
}

fn trigger_from_row(row: &PgRow) -> Result<(Trigger, TriggerState)> {
    let trigger = Trigger {
        key: TriggerKey::new(
            row.try_get::<String, _>("trigger_name")?,
            row.try_get::<String, _>("trigger_group")?,
        ),
        job_key: JobKey::new(
            row.try_get::<String, _>("job_name")?,
            row.try_get::<String, _>("job_group")?,
        ),
        description: row.try_get("description")?,
        calendar_name: row.try_get("calendar_name")?,
        priority: row.try_get("priority")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        previous_fire_time: row.try_get("prev_fire_time")?,
        next_fire_time: row.try_get("next_fire_time")?,
        misfire_instruction: row.try_get("misfire_instruction")?,
        schedule: row.try_get::<Json<Schedule>, _>("schedule")?.0,
        data: row.try_get::<Json<JobDataMap>, _>("data")?.0,
    };
    let state: TriggerState = row.try_get("state")?;
    Ok((trigger, state))
}

fn fired_from_row(row: &PgRow) -> Result<FiredTrigger> {
    let job_name: Option<String> = row.try_get("job_name")?;
    let job_group: Option<String> = row.try_get("job_group")?;
    Ok(FiredTrigger {
        entry_id: row.try_get("entry_id")?,
        trigger_key: TriggerKey::new(
            row.try_get::<String, _>("trigger_name")?,
            row.try_get::<String, _>("trigger_group")?,
        ),
        job_key: match (job_name, job_group) {
            (Some(name), Some(group)) => Some(JobKey::new(name, group)),
            _ => None,
        },
        instance_id: row.try_get("instance_id")?,
        state: row.try_get("state")?,
        fired_at: row.try_get("fired_at")?,
        scheduled_at: row.try_get("scheduled_at")?,
        priority: row.try_get("priority")?,
        non_concurrent: row.try_get("non_concurrent")?,
        requests_recovery: row.try_get("requests_recovery")?,
    })
}

fn matcher_columns(matcher: &GroupMatcher) -> (&'static str, String) {
    match matcher {
        GroupMatcher::Equals(g) => ("equals", g.clone()),
        GroupMatcher::Prefix(p) => ("prefix", p.clone()),
        GroupMatcher::Any => ("any", String::new()),
    }
}

fn matcher_from_row(row: &PgRow) -> Result<GroupMatcher> {
    let op: String = row.try_get("op")?;
    let value: String = row.try_get("value")?;
    Ok(match op.as_str() {
        "equals" => GroupMatcher::Equals(value),
        "prefix" => GroupMatcher::Prefix(value),
        _ => GroupMatcher::Any,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matcher_columns_round_trip() {
        for matcher in [
            GroupMatcher::group_equals("batch"),
            GroupMatcher::group_starts_with("batch-"),
            GroupMatcher::Any,
        ] {
            let (op, value) = matcher_columns(&matcher);
            let back = match op {
                "equals" => GroupMatcher::Equals(value),
                "prefix" => GroupMatcher::Prefix(value),
                _ => GroupMatcher::Any,
            };
            assert_eq!(back, matcher);
        }
    }
}
