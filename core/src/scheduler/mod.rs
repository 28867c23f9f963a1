//! Job Scheduler (spec §2 C8, §4.5): a persistent one-shot and recurring
//! job dispatcher backed by a shared document store.
//!
//! Grounded on the teacher's `scheduler::daemon::SchedulerDaemon` tick
//! loop and `scheduler::model` policy enums, generalized from the
//! teacher's fixed `JobAction` enum to a name-keyed handler registry (spec
//! §4.5 `start(handlers)`), and from its file-backed `JobStore` to the
//! core's `DocumentStore` abstraction (see `scheduler::store`).

pub mod model;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{EmaError, EmaResult};
use crate::model::{IntervalSpec, Job};
use model::{JobRecord, OverlapPolicy};
use store::SchedulerStore;

/// A registered handler for one job `name` (spec §4.5 `start(handlers)`).
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, data: serde_json::Value) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerStatus {
    Idle,
    Running,
    Stopping,
}

/// Dispatch tuning (spec §4.5 `defaultConcurrency`/`maxConcurrency`/
/// `lockLifetime`).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub default_concurrency: usize,
    pub max_concurrency: usize,
    pub lock_lifetime: Duration,
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 4,
            max_concurrency: 16,
            lock_lifetime: Duration::from_secs(300),
            tick_interval: Duration::from_secs(60),
        }
    }
}

pub struct JobScheduler {
    store: Arc<SchedulerStore>,
    handlers: Mutex<HashMap<String, Arc<dyn JobHandler>>>,
    status: Mutex<SchedulerStatus>,
    cancel: Mutex<Option<CancellationToken>>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    concurrency: Arc<Semaphore>,
    config: SchedulerConfig,
}

impl JobScheduler {
    pub fn new(store: SchedulerStore, config: SchedulerConfig) -> Arc<Self> {
        let permits = config.default_concurrency.clamp(1, config.max_concurrency.max(1));
        Arc::new(Self {
            store: Arc::new(store),
            handlers: Mutex::new(HashMap::new()),
            status: Mutex::new(SchedulerStatus::Idle),
            cancel: Mutex::new(None),
            tick_task: Mutex::new(None),
            concurrency: Arc::new(Semaphore::new(permits)),
            config,
        })
    }

    pub fn is_running(&self) -> bool {
        *self.status.lock() == SchedulerStatus::Running
    }

    /// `start` (spec §4.5): idempotent; registers handlers and begins
    /// dispatching due jobs. Runs one dispatch pass synchronously first so
    /// a store failure surfaces to the caller instead of only the
    /// background loop; on that failure the scheduler stays `idle`.
    pub async fn start(self: &Arc<Self>, handlers: HashMap<String, Arc<dyn JobHandler>>) -> EmaResult<()> {
        if self.is_running() {
            return Ok(());
        }

        *self.handlers.lock() = handlers;

        if let Err(e) = self.dispatch_due_jobs().await {
            error!(error = %e, "initial scheduler dispatch pass failed, staying idle");
            return Err(EmaError::scheduler(e.to_string()));
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());
        *self.status.lock() = SchedulerStatus::Running;

        let scheduler = self.clone();
        let handle = tokio::spawn(async move { scheduler.tick_loop(token).await });
        *self.tick_task.lock() = Some(handle);

        info!("job scheduler started");
        Ok(())
    }

    /// `stop` (spec §4.5): `running -> stopping -> idle`, draining the
    /// in-flight tick before declaring itself idle.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        *self.status.lock() = SchedulerStatus::Stopping;

        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        let handle = self.tick_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        *self.status.lock() = SchedulerStatus::Idle;
        info!("job scheduler stopped");
    }

    async fn tick_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch_due_jobs().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
    }

    async fn dispatch_due_jobs(&self) -> anyhow::Result<()> {
        let now = now_ms();
        let jobs = self.store.list(serde_json::json!({})).await?;
        for job in jobs {
            if !job.enabled || job.due_at() > now {
                continue;
            }
            self.try_dispatch(job, now).await;
        }
        Ok(())
    }

    async fn try_dispatch(&self, mut job: JobRecord, now: i64) {
        if job.running {
            let stale = job
                .last_run_at
                .map(|t| now.saturating_sub(t) as u64 > self.config.lock_lifetime.as_millis() as u64)
                .unwrap_or(false);
            if stale {
                warn!(job = %job.id, "reclaiming stale job lock past lockLifetime");
            } else {
                match job.policy.overlap {
                    OverlapPolicy::Allow => {}
                    OverlapPolicy::Skip | OverlapPolicy::Queue => return,
                }
            }
        }

        let handler = {
            let handlers = self.handlers.lock();
            handlers.get(&job.name).cloned()
        };
        let Some(handler) = handler else {
            warn!(job = %job.id, name = %job.name, "no handler registered, leaving job due");
            return;
        };

        let Ok(permit) = self.concurrency.clone().try_acquire_owned() else {
            return;
        };

        job.running = true;
        job.last_run_at = Some(now);
        if let Err(e) = self.store.save(&job).await {
            error!(job = %job.id, error = %e, "failed to mark job running");
            return;
        }

        let store = self.store.clone();
        let job_id = job.id.clone();
        let interval = job.interval.clone();
        let data = job.data.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handler.handle(data).await {
                error!(job = %job_id, error = %e, "job handler failed");
            } else {
                info!(job = %job_id, "job handler completed");
            }

            let loaded = match store.get(&job_id).await {
                Ok(Some(record)) => record,
                Ok(None) => return,
                Err(e) => {
                    error!(job = %job_id, error = %e, "failed to reload job after dispatch");
                    return;
                }
            };

            let mut record = loaded;
            record.running = false;
            record.last_run_at = Some(now_ms());

            match interval {
                Some(spec) => {
                    record.next_run_at = next_fire_time(&spec, record.last_run_at.unwrap());
                    if let Err(e) = store.save(&record).await {
                        error!(job = %job_id, error = %e, "failed to persist recurring job state");
                    }
                }
                None => {
                    if let Err(e) = store.delete(&job_id).await {
                        error!(job = %job_id, error = %e, "failed to delete completed one-shot job");
                    }
                }
            }
        });
    }

    /// `schedule` (spec §4.5): persist a one-shot job. May be called
    /// before `start`.
    pub async fn schedule(&self, name: impl Into<String>, run_at: i64, data: serde_json::Value) -> EmaResult<String> {
        let id = Uuid::new_v4().to_string();
        let record = JobRecord::one_shot(id.clone(), name.into(), run_at, data, now_ms());
        self.store.save(&record).await.map_err(|e| EmaError::scheduler(e.to_string()))?;
        Ok(id)
    }

    pub async fn reschedule(&self, id: &str, name: String, run_at: i64, data: serde_json::Value) -> EmaResult<bool> {
        let Some(mut record) = self.store.get(id).await.map_err(|e| EmaError::scheduler(e.to_string()))? else {
            return Ok(false);
        };
        if record.running {
            return Ok(false);
        }
        record.name = name;
        record.run_at = run_at;
        record.data = data;
        record.next_run_at = None;
        self.store.save(&record).await.map_err(|e| EmaError::scheduler(e.to_string()))?;
        Ok(true)
    }

    pub async fn cancel(&self, id: &str) -> EmaResult<bool> {
        let Some(record) = self.store.get(id).await.map_err(|e| EmaError::scheduler(e.to_string()))? else {
            return Ok(false);
        };
        if record.running {
            return Ok(false);
        }
        self.store.delete(id).await.map_err(|e| EmaError::scheduler(e.to_string()))?;
        Ok(true)
    }

    /// `scheduleEvery` (spec §4.5): persist a recurring job; collapses
    /// into the existing record when `unique` already matches one.
    pub async fn schedule_every(
        &self,
        name: impl Into<String>,
        run_at: i64,
        interval: IntervalSpec,
        data: serde_json::Value,
        unique: Option<serde_json::Value>,
    ) -> EmaResult<String> {
        reject_cron(&interval)?;

        if let Some(unique) = &unique {
            if let Some(existing) =
                self.store.find_by_unique(unique).await.map_err(|e| EmaError::scheduler(e.to_string()))?
            {
                return Ok(existing.id);
            }
        }

        let id = Uuid::new_v4().to_string();
        let record = JobRecord::recurring(id.clone(), name.into(), run_at, interval, data, unique, now_ms());
        self.store.save(&record).await.map_err(|e| EmaError::scheduler(e.to_string()))?;
        Ok(id)
    }

    pub async fn reschedule_every(
        &self,
        id: &str,
        run_at: i64,
        interval: IntervalSpec,
        data: serde_json::Value,
    ) -> EmaResult<bool> {
        reject_cron(&interval)?;
        let Some(mut record) = self.store.get(id).await.map_err(|e| EmaError::scheduler(e.to_string()))? else {
            return Ok(false);
        };
        if record.running {
            return Ok(false);
        }
        record.run_at = run_at;
        record.next_run_at = Some(model::first_fire_at(&interval, run_at, now_ms()));
        record.interval = Some(interval);
        record.data = data;
        self.store.save(&record).await.map_err(|e| EmaError::scheduler(e.to_string()))?;
        Ok(true)
    }

    pub async fn get_job(&self, id: &str) -> EmaResult<Option<Job>> {
        Ok(self.store.get(id).await.map_err(|e| EmaError::scheduler(e.to_string()))?.map(|r| r.to_job()))
    }

    pub async fn list_jobs(&self, filter: serde_json::Value) -> EmaResult<Vec<Job>> {
        let records = self.store.list(filter).await.map_err(|e| EmaError::scheduler(e.to_string()))?;
        Ok(records.iter().map(JobRecord::to_job).collect())
    }
}

/// Cron-like `interval` strings are accepted by the data model (spec §3)
/// but not evaluated by this dispatcher — rejected loudly here rather
/// than silently never firing, a deliberate refinement over the teacher's
/// silent `None` return (see `DESIGN.md`).
fn reject_cron(interval: &IntervalSpec) -> EmaResult<()> {
    match interval {
        IntervalSpec::Cron { .. } => {
            Err(EmaError::scheduler("cron interval expressions are not evaluated by this scheduler"))
        }
        IntervalSpec::Duration { .. } => Ok(()),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn next_fire_time(spec: &IntervalSpec, from: i64) -> Option<i64> {
    match spec {
        IntervalSpec::Duration { raw } => parse_duration_ms(raw).map(|ms| from + ms),
        IntervalSpec::Cron { .. } => None,
    }
}

/// Suffix-based duration parsing (`"5s"`, `"2m"`, `"3h"`, `"1d"`), grounded
/// on the teacher's `scheduler::daemon::SchedulerDaemon::parse_duration`.
pub(crate) fn parse_duration_ms(raw: &str) -> Option<i64> {
    if raw.len() < 2 {
        return None;
    }
    let (num_str, unit) = raw.split_at(raw.len() - 1);
    let num: i64 = num_str.parse().ok()?;
    let ms = match unit {
        "s" => num * 1_000,
        "m" => num * 60_000,
        "h" => num * 3_600_000,
        "d" => num * 86_400_000,
        _ => return None,
    };
    Some(ms)
}
