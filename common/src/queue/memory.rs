// In-process queue engine
//
// Implements the full `QueueEngine` contract on top of tokio primitives:
// per-queue broadcast channels for events, a `Notify` to wake workers,
// timer tasks for delayed jobs, one producer task per repeatable and one
// stall sweeper per queue. Nothing survives a restart.

use super::engine::{
    EngineEvent, EngineJob, NewJob, QueueCounts, QueueDefinition, QueueEngine, RepeatOptions,
    Retention,
};
use crate::errors::QueueError;
use crate::models::{EventKind, JobStatus, RetryPolicy};
use crate::retry::strategy_for_policy;
use crate::schedule::{calculate_cron_next_execution, parse_cron_expression};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_EVENT_BUFFER: usize = 1_024;

pub const STALLED_ERROR: &str = "job stalled";

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

struct QueueState {
    definition: QueueDefinition,
    jobs: HashMap<String, EngineJob>,
    next_sequence: u64,
    paused: bool,
    events: broadcast::Sender<EngineEvent>,
    available: Arc<Notify>,
    /// Last sign of life of each active job
    heartbeats: HashMap<String, Instant>,
}

impl QueueState {
    fn emit(&self, kind: EventKind, job: &EngineJob) {
        // No receivers is not an error
        let _ = self.events.send(EngineEvent {
            queue: self.definition.name.clone(),
            kind,
            job: job.clone(),
            timestamp: Utc::now(),
        });
    }

    fn job_mut(&mut self, id: &str) -> Result<&mut EngineJob, QueueError> {
        let queue = self.definition.name.clone();
        self.jobs.get_mut(id).ok_or_else(|| QueueError::JobNotFound {
            queue,
            job_id: id.to_string(),
        })
    }

    /// Drop finished jobs older than the retention age or beyond its count
    fn prune(&mut self, status: JobStatus, retention: Retention, now: DateTime<Utc>) {
        let max_age = chrono::Duration::from_std(retention.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));

        let mut finished: Vec<(DateTime<Utc>, u64, String)> = self
            .jobs
            .values()
            .filter(|job| job.status == status)
            .map(|job| {
                (
                    job.finished_at().unwrap_or(job.created_at),
                    job.sequence,
                    job.id.clone(),
                )
            })
            .collect();
        finished.sort();

        let overflow = finished.len().saturating_sub(retention.max_count);
        for (index, (finished_at, _, id)) in finished.iter().enumerate() {
            if index < overflow || now - *finished_at > max_age {
                self.jobs.remove(id);
            }
        }
    }

    /// Requeue or fail active jobs whose heartbeat is older than `timeout`
    ///
    /// A stall counts as an attempt; a job out of attempts fails.
    fn sweep_stalled(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut stalled = Vec::new();
        for job in self.jobs.values().filter(|job| job.status == JobStatus::Active) {
            let beat = *self.heartbeats.entry(job.id.clone()).or_insert(now);
            if now.duration_since(beat) >= timeout {
                stalled.push(job.id.clone());
            }
        }

        let paused = self.paused;
        let retention = self.definition.failed_retention;
        for id in &stalled {
            self.heartbeats.remove(id);
            let Some(job) = self.jobs.get_mut(id) else {
                continue;
            };
            job.attempts_made += 1;
            job.error = Some(STALLED_ERROR.to_string());
            let stalled_job = job.clone();
            let failed = job.attempts_made >= job.max_attempts;
            let job = if failed {
                job.status = JobStatus::Failed;
                job.failed_at = Some(Utc::now());
                Some(job.clone())
            } else {
                job.status = if paused {
                    JobStatus::Paused
                } else {
                    JobStatus::Waiting
                };
                None
            };

            self.emit(EventKind::Stalled, &stalled_job);
            match job {
                Some(failed_job) => {
                    warn!(queue = %self.definition.name, job_id = %id, "Stalled job out of attempts, failed");
                    self.emit(EventKind::Failed, &failed_job);
                    self.prune(JobStatus::Failed, retention, Utc::now());
                }
                None => {
                    warn!(queue = %self.definition.name, job_id = %id, "Stalled job requeued");
                    if !paused {
                        self.available.notify_one();
                    }
                }
            }
        }
        stalled.len()
    }
}

struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    repeatables: Mutex<HashMap<String, JoinHandle<()>>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    event_buffer: usize,
}

impl Inner {
    async fn with_queue<R>(
        &self,
        queue: &str,
        f: impl FnOnce(&mut QueueState) -> Result<R, QueueError>,
    ) -> Result<R, QueueError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(QueueError::Closed);
        }
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;
        f(state)
    }

    async fn add_job(self: &Arc<Self>, queue: &str, new_job: NewJob) -> Result<EngineJob, QueueError> {
        let job = self
            .with_queue(queue, |state| {
                if state.jobs.contains_key(&new_job.id) {
                    return Err(QueueError::DuplicateJob(new_job.id.clone()));
                }

                let now = Utc::now();
                let delay = new_job.options.delay.filter(|d| !d.is_zero());
                let (status, run_at) = match delay {
                    Some(delay) => (JobStatus::Delayed, Some(now + to_chrono(delay))),
                    None if state.paused => (JobStatus::Paused, None),
                    None => (JobStatus::Waiting, None),
                };

                let sequence = state.next_sequence;
                state.next_sequence += 1;

                let job = EngineJob {
                    id: new_job.id.clone(),
                    queue: state.definition.name.clone(),
                    data: new_job.data,
                    status,
                    progress: None,
                    result: None,
                    error: None,
                    attempts_made: 0,
                    max_attempts: new_job
                        .options
                        .attempts
                        .unwrap_or(state.definition.default_attempts)
                        .max(1),
                    backoff: new_job
                        .options
                        .backoff
                        .unwrap_or_else(|| state.definition.backoff.clone()),
                    priority: new_job.options.priority,
                    sequence,
                    created_at: now,
                    run_at,
                    started_at: None,
                    completed_at: None,
                    failed_at: None,
                };

                state.jobs.insert(job.id.clone(), job.clone());
                state.emit(EventKind::Added, &job);
                if status == JobStatus::Waiting {
                    state.available.notify_one();
                }
                Ok(job)
            })
            .await?;

        if let Some(delay) = job.remaining_delay() {
            self.schedule_promotion(queue, &job.id, delay).await;
        }

        debug!(queue = queue, job_id = %job.id, status = %job.status, "Job added");
        Ok(job)
    }

    /// Move a delayed job back to waiting once its delay has elapsed
    async fn schedule_promotion(self: &Arc<Self>, queue: &str, id: &str, delay: Duration) {
        let inner = Arc::clone(self);
        let queue = queue.to_string();
        let id = id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let promoted = inner
                .with_queue(&queue, |state| {
                    let paused = state.paused;
                    let Some(job) = state.jobs.get_mut(&id) else {
                        return Ok(false);
                    };
                    if job.status != JobStatus::Delayed {
                        return Ok(false);
                    }
                    job.status = if paused {
                        JobStatus::Paused
                    } else {
                        JobStatus::Waiting
                    };
                    job.run_at = None;
                    if !paused {
                        state.available.notify_one();
                    }
                    Ok(true)
                })
                .await;
            if let Ok(true) = promoted {
                debug!(queue = %queue, job_id = %id, "Delayed job promoted");
            }
        });

        let mut timers = self.timers.lock().await;
        timers.retain(|timer| !timer.is_finished());
        timers.push(handle);
    }

    async fn fetch_next(&self, queue: &str, wait: Duration) -> Result<Option<EngineJob>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let (claimed, available) = self
                .with_queue(queue, |state| {
                    let available = Arc::clone(&state.available);
                    if state.paused {
                        return Ok((None, available));
                    }

                    let next_id = state
                        .jobs
                        .values()
                        .filter(|job| job.status == JobStatus::Waiting)
                        .max_by(|a, b| {
                            a.priority
                                .cmp(&b.priority)
                                .then_with(|| b.sequence.cmp(&a.sequence))
                        })
                        .map(|job| job.id.clone());

                    let Some(id) = next_id else {
                        return Ok((None, available));
                    };

                    let job = state.job_mut(&id)?;
                    job.status = JobStatus::Active;
                    job.started_at = Some(Utc::now());
                    let job = job.clone();
                    state.heartbeats.insert(id, Instant::now());
                    state.emit(EventKind::Active, &job);
                    Ok((Some(job), available))
                })
                .await?;

            if claimed.is_some() {
                return Ok(claimed);
            }

            if tokio::time::timeout_at(deadline, available.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn fail_job(
        self: &Arc<Self>,
        queue: &str,
        id: &str,
        error: String,
        retry: bool,
    ) -> Result<EngineJob, QueueError> {
        let (job, retry_delay) = self
            .with_queue(queue, |state| {
                state.heartbeats.remove(id);
                let job = state.job_mut(id)?;
                if job.status.is_terminal() {
                    return Err(QueueError::InvalidTransition {
                        job_id: id.to_string(),
                        reason: format!("job is already {}", job.status),
                    });
                }

                let now = Utc::now();
                job.attempts_made += 1;
                job.error = Some(error);

                if retry && job.attempts_made < job.max_attempts {
                    let policy = RetryPolicy {
                        attempts: job.max_attempts,
                        backoff: job.backoff.clone(),
                    };
                    let delay = strategy_for_policy(&policy)
                        .next_delay(job.attempts_made)
                        .unwrap_or_else(|| Duration::from_millis(job.backoff.delay_ms));
                    job.status = JobStatus::Delayed;
                    job.run_at = Some(now + to_chrono(delay));
                    return Ok((job.clone(), Some(delay)));
                }

                job.status = JobStatus::Failed;
                job.failed_at = Some(now);
                let job = job.clone();
                state.emit(EventKind::Failed, &job);
                let retention = state.definition.failed_retention;
                state.prune(JobStatus::Failed, retention, now);
                Ok((job, None))
            })
            .await?;

        if let Some(delay) = retry_delay {
            debug!(
                queue = queue,
                job_id = id,
                attempts_made = job.attempts_made,
                delay_ms = delay.as_millis() as u64,
                "Job failed, retry scheduled"
            );
            self.schedule_promotion(queue, id, delay).await;
        }
        Ok(job)
    }

    /// Sweep `queue` for stalled jobs every half timeout until it goes away
    fn spawn_stall_sweeper(self: &Arc<Self>, queue: String, timeout: Duration) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        let period = (timeout / 2).max(MIN_SWEEP_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = engine.upgrade() else {
                    break;
                };
                match inner
                    .with_queue(&queue, |state| Ok(state.sweep_stalled(timeout)))
                    .await
                {
                    Ok(0) => {}
                    Ok(stalled) => debug!(queue = %queue, stalled = stalled, "Stall sweep finished"),
                    Err(_) => break,
                }
            }
        })
    }

    /// Produce one job per cron occurrence until limit, end date or removal
    fn spawn_repeatable(
        self: &Arc<Self>,
        queue: String,
        key: String,
        handle: String,
        data: serde_json::Value,
        repeat: RepeatOptions,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            let mut produced: u64 = 0;
            let mut after = Utc::now();

            loop {
                if repeat.limit.is_some_and(|limit| produced >= limit) {
                    break;
                }
                let next = match calculate_cron_next_execution(
                    &repeat.cron,
                    repeat.timezone,
                    repeat.end_date,
                    after,
                ) {
                    Ok(Some(next)) => next,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(handle = %handle, error = %e, "Repeatable cron became invalid");
                        break;
                    }
                };

                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;

                let job = NewJob {
                    id: format!("{}:{}", key, next.timestamp_millis()),
                    data: data.clone(),
                    options: Default::default(),
                };
                match inner.add_job(&queue, job).await {
                    Ok(_) => produced += 1,
                    Err(QueueError::Closed) | Err(QueueError::QueueNotFound(_)) => break,
                    Err(e) => warn!(handle = %handle, error = %e, "Repeatable job not added"),
                }
                after = next;
            }

            debug!(handle = %handle, produced = produced, "Repeatable finished");
            inner.repeatables.lock().await.remove(&handle);
        })
    }
}

impl EngineJob {
    fn remaining_delay(&self) -> Option<Duration> {
        match (self.status, self.run_at) {
            (JobStatus::Delayed, Some(run_at)) => {
                Some((run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            }
            _ => None,
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// In-process `QueueEngine`
#[derive(Clone)]
pub struct MemoryQueueEngine {
    inner: Arc<Inner>,
}

impl Default for MemoryQueueEngine {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl MemoryQueueEngine {
    pub fn new(event_buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                repeatables: Mutex::new(HashMap::new()),
                timers: Mutex::new(Vec::new()),
                sweepers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                event_buffer: event_buffer.max(1),
            }),
        }
    }

    /// Number of live repeatable producers
    pub async fn repeatable_count(&self) -> usize {
        self.inner.repeatables.lock().await.len()
    }
}

#[async_trait]
impl QueueEngine for MemoryQueueEngine {
    #[instrument(skip(self, definition), fields(queue = %definition.name))]
    async fn ensure_queue(&self, definition: &QueueDefinition) -> Result<(), QueueError> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(QueueError::Closed);
        }
        let mut queues = self.inner.queues.lock().await;
        if !queues.contains_key(&definition.name) {
            let (events, _) = broadcast::channel(self.inner.event_buffer);
            queues.insert(
                definition.name.clone(),
                QueueState {
                    definition: definition.clone(),
                    jobs: HashMap::new(),
                    next_sequence: 0,
                    paused: false,
                    events,
                    available: Arc::new(Notify::new()),
                    heartbeats: HashMap::new(),
                },
            );
            if let Some(timeout) = definition.stall_timeout {
                let sweeper = self
                    .inner
                    .spawn_stall_sweeper(definition.name.clone(), timeout);
                self.inner.sweepers.lock().await.push(sweeper);
            }
            info!("Queue created");
        }
        Ok(())
    }

    async fn add_job(&self, queue: &str, job: NewJob) -> Result<EngineJob, QueueError> {
        self.inner.add_job(queue, job).await
    }

    async fn get_job(&self, queue: &str, id: &str) -> Result<Option<EngineJob>, QueueError> {
        self.inner
            .with_queue(queue, |state| Ok(state.jobs.get(id).cloned()))
            .await
    }

    async fn list_jobs(
        &self,
        queue: &str,
        statuses: &[JobStatus],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<EngineJob>, QueueError> {
        self.inner
            .with_queue(queue, |state| {
                let mut jobs: Vec<EngineJob> = state
                    .jobs
                    .values()
                    .filter(|job| statuses.contains(&job.status))
                    .cloned()
                    .collect();
                jobs.sort_by(|a, b| {
                    b.created_at
                        .cmp(&a.created_at)
                        .then_with(|| b.sequence.cmp(&a.sequence))
                });
                Ok(jobs.into_iter().skip(offset).take(limit).collect())
            })
            .await
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        self.inner
            .with_queue(queue, |state| {
                let mut counts = QueueCounts::default();
                for job in state.jobs.values() {
                    counts.bump(job.status);
                }
                Ok(counts)
            })
            .await
    }

    async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        self.inner
            .with_queue(queue, |state| {
                state.paused = true;
                for job in state.jobs.values_mut() {
                    if job.status == JobStatus::Waiting {
                        job.status = JobStatus::Paused;
                    }
                }
                Ok(())
            })
            .await
    }

    async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        self.inner
            .with_queue(queue, |state| {
                state.paused = false;
                for job in state.jobs.values_mut() {
                    if job.status == JobStatus::Paused {
                        job.status = JobStatus::Waiting;
                    }
                }
                state.available.notify_waiters();
                state.available.notify_one();
                Ok(())
            })
            .await
    }

    async fn fetch_next(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<EngineJob>, QueueError> {
        self.inner.fetch_next(queue, wait).await
    }

    async fn move_to_active(&self, queue: &str, id: &str) -> Result<EngineJob, QueueError> {
        self.inner
            .with_queue(queue, |state| {
                let job = state.job_mut(id)?;
                let already_active = match job.status {
                    JobStatus::Active => true,
                    status if status.is_terminal() => {
                        return Err(QueueError::InvalidTransition {
                            job_id: id.to_string(),
                            reason: format!("job is already {}", status),
                        })
                    }
                    _ => false,
                };
                if !already_active {
                    job.status = JobStatus::Active;
                    job.run_at = None;
                    job.started_at = Some(Utc::now());
                }
                let job = job.clone();
                state.heartbeats.insert(id.to_string(), Instant::now());
                if !already_active {
                    state.emit(EventKind::Active, &job);
                }
                Ok(job)
            })
            .await
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: f64,
    ) -> Result<EngineJob, QueueError> {
        self.inner
            .with_queue(queue, |state| {
                let job = state.job_mut(id)?;
                if job.status.is_terminal() {
                    return Err(QueueError::InvalidTransition {
                        job_id: id.to_string(),
                        reason: format!("cannot report progress on a {} job", job.status),
                    });
                }
                job.progress = Some(progress);
                let job = job.clone();
                if job.status == JobStatus::Active {
                    state.heartbeats.insert(id.to_string(), Instant::now());
                }
                state.emit(EventKind::Progress, &job);
                Ok(job)
            })
            .await
    }

    async fn complete_job(
        &self,
        queue: &str,
        id: &str,
        result: serde_json::Value,
    ) -> Result<EngineJob, QueueError> {
        self.inner
            .with_queue(queue, |state| {
                let job = state.job_mut(id)?;
                if job.status.is_terminal() {
                    return Err(QueueError::InvalidTransition {
                        job_id: id.to_string(),
                        reason: format!("job is already {}", job.status),
                    });
                }
                let now = Utc::now();
                job.status = JobStatus::Completed;
                job.attempts_made += 1;
                job.result = Some(result);
                job.error = None;
                job.run_at = None;
                job.completed_at = Some(now);
                job.started_at.get_or_insert(now);
                let job = job.clone();
                state.heartbeats.remove(id);
                state.emit(EventKind::Completed, &job);
                let retention = state.definition.completed_retention;
                state.prune(JobStatus::Completed, retention, now);
                Ok(job)
            })
            .await
    }

    async fn fail_job(
        &self,
        queue: &str,
        id: &str,
        error: String,
        retry: bool,
    ) -> Result<EngineJob, QueueError> {
        self.inner.fail_job(queue, id, error, retry).await
    }

    async fn extend_lock(&self, queue: &str, id: &str) -> Result<bool, QueueError> {
        self.inner
            .with_queue(queue, |state| {
                let active = state
                    .jobs
                    .get(id)
                    .is_some_and(|job| job.status == JobStatus::Active);
                if active {
                    state.heartbeats.insert(id.to_string(), Instant::now());
                }
                Ok(active)
            })
            .await
    }

    async fn remove_job(&self, queue: &str, id: &str) -> Result<bool, QueueError> {
        self.inner
            .with_queue(queue, |state| {
                state.heartbeats.remove(id);
                Ok(state.jobs.remove(id).is_some())
            })
            .await
    }

    async fn subscribe(
        &self,
        queue: &str,
    ) -> Result<broadcast::Receiver<EngineEvent>, QueueError> {
        self.inner
            .with_queue(queue, |state| Ok(state.events.subscribe()))
            .await
    }

    #[instrument(skip(self, data, repeat), fields(cron = %repeat.cron, timezone = %repeat.timezone))]
    async fn add_repeatable(
        &self,
        queue: &str,
        key: &str,
        data: serde_json::Value,
        repeat: RepeatOptions,
    ) -> Result<String, QueueError> {
        parse_cron_expression(&repeat.cron).map_err(|e| QueueError::Repeatable(e.to_string()))?;
        // Fails fast on an unknown queue
        self.inner.with_queue(queue, |_| Ok(())).await?;

        let handle = format!("repeat:{}:{}:{}", queue, key, Uuid::new_v4());
        // Held across the spawn so a producer that ends at once cannot
        // unregister before it is registered
        let mut repeatables = self.inner.repeatables.lock().await;
        let task = self.inner.spawn_repeatable(
            queue.to_string(),
            key.to_string(),
            handle.clone(),
            data,
            repeat,
        );
        repeatables.insert(handle.clone(), task);
        drop(repeatables);

        info!(handle = %handle, "Repeatable registered");
        Ok(handle)
    }

    async fn remove_repeatable(&self, handle: &str) -> Result<bool, QueueError> {
        match self.inner.repeatables.lock().await.remove(handle) {
            Some(task) => {
                task.abort();
                info!(handle = handle, "Repeatable removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[instrument(skip(self))]
    async fn close(&self) -> Result<(), QueueError> {
        if self.inner.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }

        for (_, task) in self.inner.repeatables.lock().await.drain() {
            task.abort();
        }
        for timer in self.inner.timers.lock().await.drain(..) {
            timer.abort();
        }
        for sweeper in self.inner.sweepers.lock().await.drain(..) {
            sweeper.abort();
        }
        // Dropping the senders ends every subscriber stream
        let mut queues = self.inner.queues.lock().await;
        for state in queues.values() {
            state.available.notify_waiters();
        }
        queues.clear();

        info!("Memory queue engine closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Backoff, BackoffKind};
    use crate::queue::engine::JobOptions;
    use serde_json::json;

    fn drain_kinds(events: &mut broadcast::Receiver<EngineEvent>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    async fn engine_with(queue: &str) -> MemoryQueueEngine {
        let engine = MemoryQueueEngine::default();
        engine
            .ensure_queue(&QueueDefinition::named(queue))
            .await
            .unwrap();
        engine
    }

    fn new_job(id: &str) -> NewJob {
        NewJob {
            id: id.to_string(),
            data: json!({"n": id}),
            options: JobOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_add_emits_added_and_rejects_duplicates() {
        let engine = engine_with("emails").await;
        let mut events = engine.subscribe("emails").await.unwrap();

        let job = engine.add_job("emails", new_job("a")).await.unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.max_attempts, 3);

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Added);
        assert_eq!(event.job.id, "a");

        assert!(matches!(
            engine.add_job("emails", new_job("a")).await,
            Err(QueueError::DuplicateJob(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_queue() {
        let engine = MemoryQueueEngine::default();
        assert!(matches!(
            engine.add_job("nope", new_job("a")).await,
            Err(QueueError::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_respects_priority_then_fifo() {
        let engine = engine_with("q").await;
        engine.add_job("q", new_job("first")).await.unwrap();
        engine.add_job("q", new_job("second")).await.unwrap();
        let mut urgent = new_job("urgent");
        urgent.options.priority = 10;
        engine.add_job("q", urgent).await.unwrap();

        let wait = Duration::from_millis(10);
        let order: Vec<String> = vec![
            engine.fetch_next("q", wait).await.unwrap().unwrap().id,
            engine.fetch_next("q", wait).await.unwrap().unwrap().id,
            engine.fetch_next("q", wait).await.unwrap().unwrap().id,
        ];
        assert_eq!(order, vec!["urgent", "first", "second"]);
        assert!(engine.fetch_next("q", wait).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_waits_for_new_job() {
        let engine = engine_with("q").await;
        let producer = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.add_job("q", new_job("late")).await.unwrap();
        });

        let job = engine
            .fetch_next("q", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(job.unwrap().id, "late");
    }

    #[tokio::test]
    async fn test_delayed_job_promoted() {
        let engine = engine_with("q").await;
        let mut delayed = new_job("later");
        delayed.options.delay = Some(Duration::from_millis(30));
        let job = engine.add_job("q", delayed).await.unwrap();
        assert_eq!(job.status, JobStatus::Delayed);

        assert!(engine
            .fetch_next("q", Duration::from_millis(1))
            .await
            .unwrap()
            .is_none());
        let fetched = engine
            .fetch_next("q", Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.id, "later");
    }

    #[tokio::test]
    async fn test_failure_retries_with_backoff_then_fails() {
        let engine = engine_with("q").await;
        let mut job = new_job("flaky");
        job.options.attempts = Some(2);
        job.options.backoff = Some(Backoff {
            kind: BackoffKind::Fixed,
            delay_ms: 10,
        });
        engine.add_job("q", job).await.unwrap();
        let mut events = engine.subscribe("q").await.unwrap();

        engine.fetch_next("q", Duration::from_millis(10)).await.unwrap();
        let retried = engine
            .fail_job("q", "flaky", "boom".to_string(), true)
            .await
            .unwrap();
        assert_eq!(retried.status, JobStatus::Delayed);
        assert_eq!(retried.attempts_made, 1);

        let again = engine
            .fetch_next("q", Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, "flaky");
        let failed = engine
            .fail_job("q", "flaky", "boom".to_string(), true)
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);

        let kinds = drain_kinds(&mut events);
        assert_eq!(
            kinds,
            vec![EventKind::Active, EventKind::Active, EventKind::Failed]
        );
    }

    #[tokio::test]
    async fn test_terminal_transitions_rejected() {
        let engine = engine_with("q").await;
        engine.add_job("q", new_job("a")).await.unwrap();
        engine.complete_job("q", "a", json!({"ok": true})).await.unwrap();

        assert!(matches!(
            engine.complete_job("q", "a", json!({})).await,
            Err(QueueError::InvalidTransition { .. })
        ));
        assert!(engine.update_progress("q", "a", 50.0).await.is_err());
        assert!(engine.move_to_active("q", "a").await.is_err());
    }

    #[tokio::test]
    async fn test_completed_retention_by_count() {
        let engine = MemoryQueueEngine::default();
        let mut def = QueueDefinition::named("q");
        def.completed_retention.max_count = 2;
        engine.ensure_queue(&def).await.unwrap();

        for id in ["a", "b", "c"] {
            engine.add_job("q", new_job(id)).await.unwrap();
            engine.complete_job("q", id, json!(null)).await.unwrap();
        }

        assert!(engine.get_job("q", "a").await.unwrap().is_none());
        assert_eq!(engine.counts("q").await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let engine = engine_with("q").await;
        engine.add_job("q", new_job("a")).await.unwrap();
        engine.pause("q").await.unwrap();

        assert_eq!(engine.counts("q").await.unwrap().paused, 1);
        assert!(engine
            .fetch_next("q", Duration::from_millis(5))
            .await
            .unwrap()
            .is_none());

        engine.resume("q").await.unwrap();
        assert!(engine
            .fetch_next("q", Duration::from_millis(5))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_list_newest_first_with_paging() {
        let engine = engine_with("q").await;
        for id in ["a", "b", "c", "d"] {
            engine.add_job("q", new_job(id)).await.unwrap();
        }
        let page: Vec<String> = engine
            .list_jobs("q", &JobStatus::ALL, 1, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(page, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_repeatable_register_and_remove() {
        let engine = engine_with("cron").await;
        let handle = engine
            .add_repeatable(
                "cron",
                "schedule-1",
                json!({}),
                RepeatOptions {
                    cron: "0 0 * * * *".to_string(),
                    timezone: chrono_tz::UTC,
                    end_date: None,
                    limit: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(engine.repeatable_count().await, 1);

        assert!(engine.remove_repeatable(&handle).await.unwrap());
        assert!(!engine.remove_repeatable(&handle).await.unwrap());
        assert_eq!(engine.repeatable_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_ends_subscribers() {
        let engine = engine_with("q").await;
        let mut events = engine.subscribe("q").await.unwrap();
        engine.close().await.unwrap();

        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(matches!(
            engine.add_job("q", new_job("a")).await,
            Err(QueueError::Closed)
        ));
    }

    async fn engine_with_stall_timeout(queue: &str, timeout: Duration) -> MemoryQueueEngine {
        let engine = MemoryQueueEngine::default();
        let mut definition = QueueDefinition::named(queue);
        definition.stall_timeout = Some(timeout);
        engine.ensure_queue(&definition).await.unwrap();
        engine
    }

    async fn wait_for_job_status(engine: &MemoryQueueEngine, id: &str, status: JobStatus) -> EngineJob {
        for _ in 0..200 {
            let job = engine.get_job("q", id).await.unwrap().unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_silent_active_job_is_requeued_as_stalled() {
        let engine = engine_with_stall_timeout("q", Duration::from_millis(60)).await;
        engine.add_job("q", new_job("slow")).await.unwrap();
        let mut events = engine.subscribe("q").await.unwrap();

        engine.fetch_next("q", Duration::from_millis(10)).await.unwrap();
        let requeued = wait_for_job_status(&engine, "slow", JobStatus::Waiting).await;
        assert_eq!(requeued.attempts_made, 1);
        assert_eq!(requeued.error.as_deref(), Some(STALLED_ERROR));
        assert_eq!(drain_kinds(&mut events), vec![EventKind::Active, EventKind::Stalled]);

        // A heartbeat keeps the second run alive past the timeout
        let again = engine
            .fetch_next("q", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, "slow");
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(engine.extend_lock("q", "slow").await.unwrap());
        }
        let job = engine.get_job("q", "slow").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.attempts_made, 1);

        engine.complete_job("q", "slow", json!({})).await.unwrap();
        assert!(!engine.extend_lock("q", "slow").await.unwrap());
    }

    #[tokio::test]
    async fn test_stalled_job_out_of_attempts_fails() {
        let engine = engine_with_stall_timeout("q", Duration::from_millis(40)).await;
        let mut job = new_job("stuck");
        job.options.attempts = Some(1);
        engine.add_job("q", job).await.unwrap();
        let mut events = engine.subscribe("q").await.unwrap();

        engine.move_to_active("q", "stuck").await.unwrap();
        let failed = wait_for_job_status(&engine, "stuck", JobStatus::Failed).await;
        assert_eq!(failed.attempts_made, 1);
        assert_eq!(failed.error.as_deref(), Some(STALLED_ERROR));
        assert!(failed.failed_at.is_some());
        assert_eq!(
            drain_kinds(&mut events),
            vec![EventKind::Active, EventKind::Stalled, EventKind::Failed]
        );
    }

    #[tokio::test]
    async fn test_active_job_within_timeout_is_left_alone() {
        let engine = engine_with("q").await;
        engine.add_job("q", new_job("long")).await.unwrap();
        engine.fetch_next("q", Duration::from_millis(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let job = engine.get_job("q", "long").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Active);
    }
}
