//! Scheduler persistence model (spec §3 `Job`, §4.5 dispatch policy).
//!
//! `JobRecord` is the internal, store-facing shape; `crate::model::Job` is
//! the public shape returned by `getJob`/`listJobs`. Kept distinct so the
//! dispatcher's own bookkeeping (`running`, `last_run_at`, `policy`, ...)
//! never leaks into the public contract spec §3 defines.

use serde::{Deserialize, Serialize};

use crate::model::{IntervalSpec, Job};

/// The first fire time for a recurring job: never before `run_at`, and
/// never before `now + interval` either, so `scheduleEvery`/
/// `rescheduleEvery` can never produce an immediate first firing (spec
/// §4.5: "the first firing is never immediate") even when the caller
/// passes a `run_at` that is already due. Falls back to `now` when the
/// interval can't be parsed (e.g. a cron expression, rejected elsewhere
/// before it reaches here).
pub fn first_fire_at(interval: &IntervalSpec, run_at: i64, now: i64) -> i64 {
    let earliest = match interval {
        IntervalSpec::Duration { raw } => super::parse_duration_ms(raw).map(|ms| now + ms),
        IntervalSpec::Cron { .. } => None,
    }
    .unwrap_or(now);
    run_at.max(earliest)
}

/// Per-job execution policy (spec §4.5's `defaultConcurrency`,
/// `maxConcurrency`, `lockLifetime`, plus the overlap/misfire handling
/// supplemented from the teacher's `scheduler::model::JobPolicy`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPolicy {
    #[serde(default)]
    pub overlap: OverlapPolicy,
    #[serde(default)]
    pub misfire: MisfirePolicy,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self { overlap: OverlapPolicy::default(), misfire: MisfirePolicy::default() }
    }
}

/// What to do when a job's previous run is still marked `running` and its
/// next fire time is already due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlapPolicy {
    /// Don't dispatch; the job stays due and is retried next tick.
    Skip,
    /// Same effect as `Skip` in a single-process dispatcher with no
    /// explicit wait queue — kept as a distinct variant because it is a
    /// distinct intent in the persisted record, not an implementation
    /// detail (see `DESIGN.md`).
    Queue,
    /// Dispatch anyway; only the concurrency semaphore gates it.
    Allow,
}

impl Default for OverlapPolicy {
    fn default() -> Self {
        OverlapPolicy::Skip
    }
}

/// What to do when a job's scheduled fire time has already passed (the
/// scheduler was stopped, or a tick was missed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MisfirePolicy {
    /// Fire once, at the next tick, as if it had been due then.
    Skip,
    /// Fire up to `n` times to approximate the missed occurrences.
    CatchUp(u32),
}

impl Default for MisfirePolicy {
    fn default() -> Self {
        MisfirePolicy::Skip
    }
}

/// The scheduler's persisted record for one job: the public `Job` fields
/// plus dispatch bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    pub run_at: i64,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<IntervalSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique: Option<serde_json::Value>,
    pub created_at: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<i64>,
    #[serde(default)]
    pub policy: JobPolicy,
}

fn default_true() -> bool {
    true
}

impl JobRecord {
    pub fn one_shot(id: String, name: String, run_at: i64, data: serde_json::Value, created_at: i64) -> Self {
        Self {
            id,
            name,
            run_at,
            data,
            interval: None,
            unique: None,
            created_at,
            enabled: true,
            running: false,
            last_run_at: None,
            next_run_at: None,
            policy: JobPolicy::default(),
        }
    }

    pub fn recurring(
        id: String,
        name: String,
        run_at: i64,
        interval: IntervalSpec,
        data: serde_json::Value,
        unique: Option<serde_json::Value>,
        created_at: i64,
    ) -> Self {
        let next_run_at = Some(first_fire_at(&interval, run_at, created_at));
        Self {
            id,
            name,
            run_at,
            data,
            interval: Some(interval),
            unique,
            created_at,
            enabled: true,
            running: false,
            last_run_at: None,
            next_run_at,
            policy: JobPolicy::default(),
        }
    }

    /// The fire time to compare against "now": `next_run_at` once set,
    /// else the original `run_at` (one-shot jobs never set `next_run_at`
    /// and are due exactly at `run_at`; recurring jobs always have
    /// `next_run_at` populated by `first_fire_at` at construction and
    /// reschedule time so their first firing is never immediate).
    pub fn due_at(&self) -> i64 {
        self.next_run_at.unwrap_or(self.run_at)
    }

    pub fn to_job(&self) -> Job {
        Job {
            id: self.id.clone(),
            name: self.name.clone(),
            run_at: self.run_at,
            data: self.data.clone(),
            interval: self.interval.clone(),
            unique: self.unique.clone(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fire_at_defers_a_past_due_run_at() {
        let next = first_fire_at(&IntervalSpec::duration("1h"), 0, 1_000);
        assert_eq!(next, 1_000 + 3_600_000);
    }

    #[test]
    fn first_fire_at_keeps_a_future_run_at() {
        let next = first_fire_at(&IntervalSpec::duration("1h"), 10_000_000, 1_000);
        assert_eq!(next, 10_000_000);
    }

    #[test]
    fn recurring_job_starts_with_a_deferred_next_run_at() {
        let record = JobRecord::recurring(
            "j1".to_string(),
            "digest".to_string(),
            0,
            IntervalSpec::duration("1h"),
            serde_json::json!({}),
            None,
            1_000,
        );
        assert_eq!(record.due_at(), 1_000 + 3_600_000);
    }
}
