// Queue engine contract
//
// The durable queue lives outside this crate. Everything the coordination
// layer needs from it is expressed by `QueueEngine`; `MemoryQueueEngine`
// implements it in-process.

use crate::config::QueueConfig;
use crate::errors::QueueError;
use crate::models::{Backoff, BackoffKind, EventKind, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::time::Duration;
use tokio::sync::broadcast;

/// A job as the engine stores it
#[derive(Debug, Clone, PartialEq)]
pub struct EngineJob {
    pub id: String,
    pub queue: String,
    pub data: serde_json::Value,
    pub status: JobStatus,
    pub progress: Option<f64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub priority: i32,
    /// Insertion order within the queue; breaks timestamp ties
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub run_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl EngineJob {
    /// When the job reached its current state
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.failed_at)
    }
}

/// How long finished jobs are kept
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Retention {
    pub max_age: Duration,
    pub max_count: usize,
}

/// Queue registration
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDefinition {
    pub name: String,
    pub default_attempts: u32,
    pub backoff: Backoff,
    pub completed_retention: Retention,
    pub failed_retention: Retention,
    /// Active jobs without a heartbeat for this long are stalled
    pub stall_timeout: Option<Duration>,
}

impl QueueDefinition {
    /// Completed kept 1h/100, failed kept 24h/500, 3 attempts, exponential 1s
    pub fn named(name: impl Into<String>) -> Self {
        Self::from_config(name, &QueueConfig::default())
    }

    pub fn from_config(name: impl Into<String>, config: &QueueConfig) -> Self {
        Self {
            name: name.into(),
            default_attempts: config.default_attempts.max(1),
            backoff: Backoff {
                kind: BackoffKind::Exponential,
                delay_ms: config.backoff_delay_ms,
            },
            completed_retention: Retention {
                max_age: Duration::from_secs(config.completed_retention_seconds),
                max_count: config.completed_retention_count,
            },
            failed_retention: Retention {
                max_age: Duration::from_secs(config.failed_retention_seconds),
                max_count: config.failed_retention_count,
            },
            stall_timeout: Some(config.stall_timeout_seconds)
                .filter(|seconds| *seconds > 0)
                .map(Duration::from_secs),
        }
    }
}

/// Per-job overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub delay: Option<Duration>,
    /// Higher runs first
    pub priority: i32,
}

/// A job to enqueue under a caller-assigned id
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub id: String,
    pub data: serde_json::Value,
    pub options: JobOptions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed + self.paused
    }

    pub(crate) fn bump(&mut self, status: JobStatus) {
        match status {
            JobStatus::Waiting => self.waiting += 1,
            JobStatus::Active => self.active += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Delayed => self.delayed += 1,
            JobStatus::Paused => self.paused += 1,
        }
    }
}

/// Lifecycle notification carrying a full job snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub queue: String,
    pub kind: EventKind,
    pub job: EngineJob,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    /// Identity of one transition; replays share it
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.queue,
            self.job.id,
            self.kind.as_str(),
            self.job.attempts_made,
            self.job
                .progress
                .map(|p| p.to_string())
                .unwrap_or_default()
        )
    }
}

/// Native repeatable registration
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatOptions {
    /// Seconds-first cron expression
    pub cron: String,
    pub timezone: Tz,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

#[async_trait]
pub trait QueueEngine: Send + Sync {
    /// Create the queue if missing; re-registering keeps existing jobs
    async fn ensure_queue(&self, definition: &QueueDefinition) -> Result<(), QueueError>;

    async fn add_job(&self, queue: &str, job: NewJob) -> Result<EngineJob, QueueError>;

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<EngineJob>, QueueError>;

    /// Jobs in any of `statuses`, newest first
    async fn list_jobs(
        &self,
        queue: &str,
        statuses: &[JobStatus],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<EngineJob>, QueueError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError>;

    async fn pause(&self, queue: &str) -> Result<(), QueueError>;

    async fn resume(&self, queue: &str) -> Result<(), QueueError>;

    /// Claim the next runnable job, waiting up to `wait` for one to appear
    async fn fetch_next(&self, queue: &str, wait: Duration)
        -> Result<Option<EngineJob>, QueueError>;

    /// Move a waiting, delayed or paused job to active
    async fn move_to_active(&self, queue: &str, id: &str) -> Result<EngineJob, QueueError>;

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: f64,
    ) -> Result<EngineJob, QueueError>;

    async fn complete_job(
        &self,
        queue: &str,
        id: &str,
        result: serde_json::Value,
    ) -> Result<EngineJob, QueueError>;

    /// Record a failure. With `retry` and attempts left the job is delayed
    /// by its backoff instead of failing.
    async fn fail_job(
        &self,
        queue: &str,
        id: &str,
        error: String,
        retry: bool,
    ) -> Result<EngineJob, QueueError>;

    /// Refresh an active job's heartbeat; false when it is no longer active
    async fn extend_lock(&self, queue: &str, id: &str) -> Result<bool, QueueError>;

    async fn remove_job(&self, queue: &str, id: &str) -> Result<bool, QueueError>;

    /// Subscribe to lifecycle events of one queue
    async fn subscribe(&self, queue: &str) -> Result<broadcast::Receiver<EngineEvent>, QueueError>;

    /// Register a cron-driven job producer; returns an opaque removal handle
    async fn add_repeatable(
        &self,
        queue: &str,
        key: &str,
        data: serde_json::Value,
        repeat: RepeatOptions,
    ) -> Result<String, QueueError>;

    async fn remove_repeatable(&self, handle: &str) -> Result<bool, QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}
