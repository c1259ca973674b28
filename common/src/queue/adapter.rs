// Queue adapter
//
// The single entry point the tracker and the scheduler use to reach the
// queue engine. Owns the spawned worker loops and event listeners so a
// process can shut them down in order.

use super::engine::{
    EngineEvent, EngineJob, JobOptions, NewJob, QueueCounts, QueueDefinition, QueueEngine,
    RepeatOptions,
};
use crate::config::QueueConfig;
use crate::errors::QueueError;
use crate::models::JobStatus;
use crate::telemetry;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Processes one claimed job; the returned value becomes the job result
pub type JobHandler = Arc<
    dyn Fn(EngineJob) -> BoxFuture<'static, Result<serde_json::Value, anyhow::Error>>
        + Send
        + Sync,
>;

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5);

/// Receives every lifecycle event of a queue
pub type EventHandler = Arc<dyn Fn(EngineEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// A registered queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueHandle {
    definition: QueueDefinition,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.definition
    }
}

pub struct QueueAdapter {
    engine: Arc<dyn QueueEngine>,
    config: QueueConfig,
    queues: RwLock<HashMap<String, QueueHandle>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    poll_interval: Duration,
}

impl QueueAdapter {
    pub fn new(engine: Arc<dyn QueueEngine>, config: QueueConfig) -> Self {
        Self {
            engine,
            config,
            queues: RwLock::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// How long an idle worker blocks on the engine before re-checking shutdown
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Definition carrying the configured defaults
    pub fn default_definition(&self, name: &str) -> QueueDefinition {
        QueueDefinition::from_config(name, &self.config)
    }

    /// Register a queue; a second registration returns the existing handle
    #[instrument(skip(self, definition), fields(queue = %definition.name))]
    pub async fn register_queue(
        &self,
        definition: QueueDefinition,
    ) -> Result<QueueHandle, QueueError> {
        if let Some(handle) = self.queues.read().await.get(&definition.name) {
            return Ok(handle.clone());
        }

        let mut queues = self.queues.write().await;
        if let Some(handle) = queues.get(&definition.name) {
            return Ok(handle.clone());
        }

        self.engine.ensure_queue(&definition).await?;
        let handle = QueueHandle { definition };
        queues.insert(handle.name().to_string(), handle.clone());

        info!("Queue registered");
        Ok(handle)
    }

    /// Register `name` with the configured defaults
    pub async fn register_default_queue(&self, name: &str) -> Result<QueueHandle, QueueError> {
        self.register_queue(self.default_definition(name)).await
    }

    pub async fn is_registered(&self, queue: &str) -> bool {
        self.queues.read().await.contains_key(queue)
    }

    /// Names of every registered queue, sorted
    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    #[instrument(skip(self, data, options), fields(queue = queue, job_id = id))]
    pub async fn add_job(
        &self,
        queue: &str,
        id: &str,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<EngineJob, QueueError> {
        let job = self
            .engine
            .add_job(
                queue,
                NewJob {
                    id: id.to_string(),
                    data,
                    options,
                },
            )
            .await?;
        debug!(status = %job.status, "Job enqueued");
        Ok(job)
    }

    pub async fn get_job(&self, queue: &str, id: &str) -> Result<Option<EngineJob>, QueueError> {
        self.engine.get_job(queue, id).await
    }

    pub async fn list_jobs(
        &self,
        queue: &str,
        statuses: &[JobStatus],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<EngineJob>, QueueError> {
        self.engine.list_jobs(queue, statuses, offset, limit).await
    }

    /// Per-status counts; also refreshes the queue size gauge
    pub async fn stats(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        let counts = self.engine.counts(queue).await?;
        telemetry::update_queue_size(queue, counts.waiting + counts.delayed);
        Ok(counts)
    }

    pub async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        self.engine.pause(queue).await
    }

    pub async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        self.engine.resume(queue).await
    }

    pub async fn move_to_active(&self, queue: &str, id: &str) -> Result<EngineJob, QueueError> {
        self.engine.move_to_active(queue, id).await
    }

    pub async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: f64,
    ) -> Result<EngineJob, QueueError> {
        self.engine.update_progress(queue, id, progress).await
    }

    pub async fn complete_job(
        &self,
        queue: &str,
        id: &str,
        result: serde_json::Value,
    ) -> Result<EngineJob, QueueError> {
        self.engine.complete_job(queue, id, result).await
    }

    /// Fail a job outright, skipping any remaining attempts
    pub async fn fail_job(
        &self,
        queue: &str,
        id: &str,
        error: String,
    ) -> Result<EngineJob, QueueError> {
        self.engine.fail_job(queue, id, error, false).await
    }

    pub async fn remove_job(&self, queue: &str, id: &str) -> Result<bool, QueueError> {
        self.engine.remove_job(queue, id).await
    }

    pub async fn add_repeatable(
        &self,
        queue: &str,
        key: &str,
        data: serde_json::Value,
        repeat: RepeatOptions,
    ) -> Result<String, QueueError> {
        self.engine.add_repeatable(queue, key, data, repeat).await
    }

    pub async fn remove_repeatable(&self, handle: &str) -> Result<bool, QueueError> {
        self.engine.remove_repeatable(handle).await
    }

    /// Spawn an event listener for `queue`
    ///
    /// A lagging listener logs the number of skipped events and keeps going.
    #[instrument(skip(self, handler))]
    pub async fn listen(&self, queue: &str, handler: EventHandler) -> Result<(), QueueError> {
        let mut events = self.engine.subscribe(queue).await?;
        let shutdown_flag = Arc::clone(&self.shutdown_flag);
        let shutdown_notify = Arc::clone(&self.shutdown_notify);
        let queue = queue.to_string();

        let listener = tokio::spawn(async move {
            info!(queue = %queue, "Event listener started");
            loop {
                if shutdown_flag.load(Ordering::Relaxed) {
                    break;
                }

                tokio::select! {
                    received = events.recv() => {
                        match received {
                            Ok(event) => {
                                telemetry::record_job_event(&event.queue, event.kind.as_str());
                                handler(event).await;
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(queue = %queue, skipped = skipped, "Event listener lagged, events skipped");
                            }
                            Err(RecvError::Closed) => {
                                warn!(queue = %queue, "Event stream closed");
                                break;
                            }
                        }
                    }
                    _ = shutdown_notify.notified() => {
                        break;
                    }
                }
            }
            info!(queue = %queue, "Event listener stopped");
        });

        self.listeners.lock().await.push(listener);
        Ok(())
    }

    /// Spawn `concurrency` worker loops for `queue`
    ///
    /// A handler error fails the attempt; the engine retries it while
    /// attempts remain.
    #[instrument(skip(self, handler))]
    pub async fn register_worker(
        &self,
        queue: &str,
        concurrency: usize,
        handler: JobHandler,
    ) -> Result<(), QueueError> {
        let heartbeat = match self.queues.read().await.get(queue) {
            Some(handle) => handle
                .definition
                .stall_timeout
                .map(|timeout| (timeout / 3).max(MIN_HEARTBEAT_INTERVAL)),
            None => return Err(QueueError::QueueNotFound(queue.to_string())),
        };

        let mut workers = self.workers.lock().await;
        for worker_index in 0..concurrency.max(1) {
            let engine = Arc::clone(&self.engine);
            let handler = Arc::clone(&handler);
            let shutdown_flag = Arc::clone(&self.shutdown_flag);
            let shutdown_notify = Arc::clone(&self.shutdown_notify);
            let poll_interval = self.poll_interval;
            let queue = queue.to_string();

            workers.push(tokio::spawn(async move {
                info!(queue = %queue, worker = worker_index, "Worker started");
                loop {
                    if shutdown_flag.load(Ordering::Relaxed) {
                        break;
                    }

                    tokio::select! {
                        fetched = engine.fetch_next(&queue, poll_interval) => {
                            match fetched {
                                Ok(Some(job)) => {
                                    process_job(engine.as_ref(), &handler, job, heartbeat).await;
                                }
                                Ok(None) => continue,
                                Err(QueueError::Closed) => break,
                                Err(e) => {
                                    error!(queue = %queue, error = %e, "Failed to fetch job");
                                    tokio::time::sleep(Duration::from_secs(1)).await;
                                }
                            }
                        }
                        _ = shutdown_notify.notified() => {
                            break;
                        }
                    }
                }
                info!(queue = %queue, worker = worker_index, "Worker stopped");
            }));
        }
        Ok(())
    }

    /// Stop workers, then listeners, then forget queues and close the engine
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        if self.shutdown_flag.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        info!("Shutting down queue adapter");
        self.shutdown_notify.notify_waiters();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }

        let listeners: Vec<JoinHandle<()>> = self.listeners.lock().await.drain(..).collect();
        for listener in listeners {
            if let Err(e) = listener.await {
                warn!(error = %e, "Listener task ended abnormally");
            }
        }

        self.queues.write().await.clear();
        self.engine.close().await?;

        info!("Queue adapter shut down");
        Ok(())
    }
}

/// Run the handler, keeping the job's heartbeat fresh while it works
async fn process_job(
    engine: &dyn QueueEngine,
    handler: &JobHandler,
    job: EngineJob,
    heartbeat: Option<Duration>,
) {
    let queue = job.queue.clone();
    let id = job.id.clone();

    let mut run = handler(job);
    let outcome = match heartbeat {
        None => run.await,
        Some(period) => {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    outcome = &mut run => break outcome,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.extend_lock(&queue, &id).await {
                            debug!(queue = %queue, job_id = %id, error = %e, "Heartbeat not recorded");
                        }
                    }
                }
            }
        }
    };

    match outcome {
        Ok(result) => {
            if let Err(e) = engine.complete_job(&queue, &id, result).await {
                warn!(queue = %queue, job_id = %id, error = %e, "Failed to mark job completed");
            }
        }
        Err(e) => {
            warn!(queue = %queue, job_id = %id, error = %e, "Job handler failed");
            if let Err(e) = engine.fail_job(&queue, &id, e.to_string(), true).await {
                warn!(queue = %queue, job_id = %id, error = %e, "Failed to mark job failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Backoff, BackoffKind, EventKind};
    use crate::queue::MemoryQueueEngine;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn adapter() -> QueueAdapter {
        QueueAdapter::new(
            Arc::new(MemoryQueueEngine::default()),
            QueueConfig::default(),
        )
        .with_poll_interval(Duration::from_millis(50))
    }

    async fn wait_for_status(adapter: &QueueAdapter, queue: &str, id: &str, status: JobStatus) {
        for _ in 0..200 {
            if let Some(job) = adapter.get_job(queue, id).await.unwrap() {
                if job.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_register_queue_is_idempotent() {
        let adapter = adapter();
        let first = adapter.register_default_queue("emails").await.unwrap();
        adapter
            .add_job("emails", "a", json!({}), JobOptions::default())
            .await
            .unwrap();

        let second = adapter.register_default_queue("emails").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(adapter.stats("emails").await.unwrap().waiting, 1);
        assert_eq!(adapter.queue_names().await, vec!["emails".to_string()]);
    }

    #[tokio::test]
    async fn test_worker_completes_job_with_handler_result() {
        let adapter = adapter();
        adapter.register_default_queue("emails").await.unwrap();

        let handler: JobHandler =
            Arc::new(|job: EngineJob| async move { Ok(json!({"echo": job.data})) }.boxed());
        adapter.register_worker("emails", 2, handler).await.unwrap();

        adapter
            .add_job("emails", "a", json!({"to": "x"}), JobOptions::default())
            .await
            .unwrap();
        wait_for_status(&adapter, "emails", "a", JobStatus::Completed).await;

        let job = adapter.get_job("emails", "a").await.unwrap().unwrap();
        assert_eq!(job.result, Some(json!({"echo": {"to": "x"}})));
        adapter.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_handler_exhausts_attempts() {
        let adapter = adapter();
        adapter.register_default_queue("emails").await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handler: JobHandler = Arc::new(move |_: EngineJob| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("smtp down")) }.boxed()
        });
        adapter.register_worker("emails", 1, handler).await.unwrap();

        let options = JobOptions {
            attempts: Some(2),
            backoff: Some(Backoff {
                kind: BackoffKind::Fixed,
                delay_ms: 10,
            }),
            ..Default::default()
        };
        adapter
            .add_job("emails", "a", json!({}), options)
            .await
            .unwrap();
        wait_for_status(&adapter, "emails", "a", JobStatus::Failed).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let job = adapter.get_job("emails", "a").await.unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some("smtp down"));
    }

    #[tokio::test]
    async fn test_listener_receives_events() {
        let adapter = adapter();
        adapter.register_default_queue("emails").await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: EventHandler = Arc::new(move |event: EngineEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.kind);
            }
            .boxed()
        });
        adapter.listen("emails", handler).await.unwrap();

        adapter
            .add_job("emails", "a", json!({}), JobOptions::default())
            .await
            .unwrap();
        adapter
            .complete_job("emails", "a", json!({"ok": true}))
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(EventKind::Added));
        assert_eq!(rx.recv().await, Some(EventKind::Completed));
    }

    #[tokio::test]
    async fn test_worker_heartbeat_outlives_stall_timeout() {
        let adapter = adapter();
        let mut definition = adapter.default_definition("slow");
        definition.stall_timeout = Some(Duration::from_millis(60));
        adapter.register_queue(definition).await.unwrap();

        let mut events = adapter.engine.subscribe("slow").await.unwrap();
        let handler: JobHandler = Arc::new(|_: EngineJob| {
            async {
                tokio::time::sleep(Duration::from_millis(250)).await;
                Ok(json!({"done": true}))
            }
            .boxed()
        });
        adapter.register_worker("slow", 1, handler).await.unwrap();
        adapter
            .add_job("slow", "a", json!({}), JobOptions::default())
            .await
            .unwrap();
        wait_for_status(&adapter, "slow", "a", JobStatus::Completed).await;

        let job = adapter.get_job("slow", "a").await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert!(!kinds.contains(&EventKind::Stalled), "{kinds:?}");

        adapter.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_requires_registered_queue() {
        let adapter = adapter();
        let handler: JobHandler = Arc::new(|_: EngineJob| async { Ok(json!(null)) }.boxed());
        assert!(matches!(
            adapter.register_worker("nope", 1, handler).await,
            Err(QueueError::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_engine() {
        let adapter = adapter();
        adapter.register_default_queue("emails").await.unwrap();
        let handler: JobHandler = Arc::new(|_: EngineJob| async { Ok(json!(null)) }.boxed());
        adapter.register_worker("emails", 1, handler).await.unwrap();

        adapter.shutdown().await.unwrap();
        assert!(adapter.queue_names().await.is_empty());
        assert!(matches!(
            adapter
                .add_job("emails", "a", json!({}), JobOptions::default())
                .await,
            Err(QueueError::Closed)
        ));
        // A second shutdown is a no-op
        adapter.shutdown().await.unwrap();
    }
}
