// Job tracker
//
// Submission, updates, status and listing for tenant jobs, plus the
// fan-out of every engine lifecycle event to per-job webhooks, tenant
// webhooks and subscriptions. The engine job data is the durable record;
// the tracker keeps a cache of routing data and update history.

use super::filter::{metadata_matches, JobListFilter};
use crate::config::WebhookConfig;
use crate::errors::{CoreError, DeliveryError, QueueError, TrackerError, ValidationError};
use crate::executor::validate_http_url;
use crate::models::{
    Application, EventKind, JobEnvelope, JobStatus, JobWebhooks, LifecycleEvent, Metadata,
    PayloadData, Tenant, WebhookPayload, WebhookRetryConfig, WebhookTrigger,
};
use crate::queue::{EngineEvent, EngineJob, EventHandler, JobOptions, QueueAdapter};
use crate::subscription::SubscriptionEngine;
use crate::tenant::TenantDirectory;
use crate::webhook::{
    deliver_with_retry, DeliveryGuard, DeliveryReceipt, DeliveryReport, DeliveryTarget,
    WebhookDeliverer, WebhookService,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Failed attempts after which a job's own webhooks stop firing
pub const JOB_WEBHOOK_FAILURE_LIMIT: u32 = 10;

const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Per-job webhooks carry no secret of their own
    pub job_signing_secret: String,
    pub job_webhook_retry: WebhookRetryConfig,
    /// Fingerprints remembered for duplicate event suppression
    pub dedup_capacity: usize,
}

impl TrackerConfig {
    pub fn from_webhook_config(config: &WebhookConfig) -> Self {
        Self {
            job_signing_secret: config.job_signing_secret.clone(),
            job_webhook_retry: WebhookRetryConfig::default(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubmitOptions {
    pub metadata: Metadata,
    /// Trigger key (`completed`, `*`, `custom:<name>`, ...) to callback URL
    pub webhooks: HashMap<String, String>,
    pub delay_ms: Option<u64>,
    pub attempts: Option<u32>,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedJob {
    pub job_id: String,
    pub queue: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub job_id: String,
    /// `active`, `progress`, `completed`, `failed` or `custom:<name>`
    pub status: String,
    pub progress: Option<f64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdateRecord {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Engine state merged with tracker data
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub queue: String,
    pub tenant_id: String,
    pub status: JobStatus,
    pub progress: Option<f64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub data: serde_json::Value,
    pub metadata: Metadata,
    pub webhooks: JobWebhooks,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub updates: Vec<JobUpdateRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPage {
    pub jobs: Vec<JobView>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Routing data and update history for a job the engine still holds
///
/// Entries go away once the engine prunes the job.
#[derive(Debug, Clone)]
struct TrackedJob {
    queue: String,
    updates: Vec<JobUpdateRecord>,
    /// Shared with in-flight deliveries so eviction does not reset the budget
    webhook_failures: Arc<AtomicU32>,
}

impl TrackedJob {
    fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            updates: Vec::new(),
            webhook_failures: Arc::new(AtomicU32::new(0)),
        }
    }
}

type JobCache = Arc<RwLock<HashMap<String, TrackedJob>>>;

/// Bounded set of recently handled event fingerprints
struct SeenEvents {
    fingerprints: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenEvents {
    fn new(capacity: usize) -> Self {
        Self {
            fingerprints: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// False when the fingerprint was already seen
    fn insert(&mut self, fingerprint: String) -> bool {
        if !self.fingerprints.insert(fingerprint.clone()) {
            return false;
        }
        self.order.push_back(fingerprint);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.fingerprints.remove(&oldest);
            }
        }
        true
    }
}

pub struct JobTracker {
    adapter: Arc<QueueAdapter>,
    tenants: Arc<dyn TenantDirectory>,
    webhooks: WebhookService,
    subscriptions: SubscriptionEngine,
    job_deliverer: WebhookDeliverer,
    config: TrackerConfig,
    jobs: JobCache,
    tracked_queues: Mutex<HashSet<String>>,
    seen: Mutex<SeenEvents>,
}

impl JobTracker {
    pub fn new(
        adapter: Arc<QueueAdapter>,
        tenants: Arc<dyn TenantDirectory>,
        webhooks: WebhookService,
        subscriptions: SubscriptionEngine,
        job_deliverer: WebhookDeliverer,
        config: TrackerConfig,
    ) -> Self {
        let seen = SeenEvents::new(config.dedup_capacity);
        Self {
            adapter,
            tenants,
            webhooks,
            subscriptions,
            job_deliverer,
            config,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            tracked_queues: Mutex::new(HashSet::new()),
            seen: Mutex::new(seen),
        }
    }

    /// Register `queue` and listen to its events; repeated calls are no-ops
    #[instrument(skip(self))]
    pub async fn track_queue(self: &Arc<Self>, queue: &str) -> Result<(), CoreError> {
        let mut tracked = self.tracked_queues.lock().await;
        if tracked.contains(queue) {
            return Ok(());
        }

        self.adapter.register_default_queue(queue).await?;

        let tracker = Arc::downgrade(self);
        let handler: EventHandler = Arc::new(move |event: EngineEvent| {
            let tracker = tracker.clone();
            async move {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.handle_engine_event(event).await;
                }
            }
            .boxed()
        });
        self.adapter.listen(queue, handler).await?;

        tracked.insert(queue.to_string());
        info!("Queue tracked");
        Ok(())
    }

    /// Enqueue a job for `tenant`
    ///
    /// The id is assigned before anything is written, so an enqueue failure
    /// still hands it back in `TrackerError::EnqueueFailed`.
    #[instrument(skip(self, tenant, data, options), fields(tenant_id = %tenant.id, queue = %queue))]
    pub async fn submit_job(
        self: &Arc<Self>,
        tenant: &Tenant,
        queue: &str,
        data: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<SubmittedJob, TrackerError> {
        if queue.trim().is_empty() {
            return Err(ValidationError::MissingField("queue".to_string()).into());
        }
        if !tenant.can_access_queue(queue) {
            return Err(CoreError::Forbidden(format!(
                "tenant {} may not use queue {}",
                tenant.id, queue
            ))
            .into());
        }
        if options.attempts == Some(0) {
            return Err(ValidationError::invalid("attempts", "must be at least 1").into());
        }
        let webhooks = parse_job_webhooks(&options.webhooks)?;

        let job_id = Uuid::new_v4().to_string();
        let envelope = JobEnvelope {
            tenant_id: tenant.id.clone(),
            payload: data,
            metadata: options.metadata,
            webhooks,
            submitted_at: Utc::now(),
        };
        let job_data = serde_json::to_value(&envelope).map_err(ValidationError::from)?;

        if let Err(e) = self.track_queue(queue).await {
            return Err(match e {
                CoreError::Queue(source) => {
                    error!(job_id = %job_id, error = %source, "Failed to register queue for job");
                    TrackerError::EnqueueFailed { job_id, source }
                }
                other => other.into(),
            });
        }

        let job_options = JobOptions {
            attempts: options.attempts,
            backoff: None,
            delay: options.delay_ms.map(Duration::from_millis),
            priority: options.priority,
        };

        match self
            .adapter
            .add_job(queue, &job_id, job_data, job_options)
            .await
        {
            Ok(job) => {
                // The worker may have hydrated the entry already
                self.jobs
                    .write()
                    .await
                    .entry(job_id.clone())
                    .or_insert_with(|| TrackedJob::new(queue));
                info!(job_id = %job_id, status = %job.status, "Job submitted");
                Ok(SubmittedJob {
                    job_id,
                    queue: queue.to_string(),
                    status: job.status,
                })
            }
            Err(source) => {
                error!(job_id = %job_id, error = %source, "Failed to enqueue job");
                Err(TrackerError::EnqueueFailed { job_id, source })
            }
        }
    }

    /// Report progress or a state change for a job
    #[instrument(skip(self, tenant, update), fields(tenant_id = %tenant.id, job_id = %update.job_id, status = %update.status))]
    pub async fn update_job(
        &self,
        tenant: &Tenant,
        update: JobUpdate,
    ) -> Result<JobView, TrackerError> {
        let trigger: WebhookTrigger = update
            .status
            .parse()
            .map_err(|_| ValidationError::invalid("status", unsupported_status(&update.status)))?;

        let (job, envelope) = self.locate(&update.job_id).await?;
        self.authorize(tenant, &envelope)?;
        self.hydrate(&job).await;

        let queue = job.queue.clone();
        let id = job.id.clone();
        let updated = match &trigger {
            WebhookTrigger::Event(EventKind::Progress) => {
                let progress = update
                    .progress
                    .ok_or_else(|| ValidationError::MissingField("progress".to_string()))?;
                if !progress.is_finite() || !(0.0..=100.0).contains(&progress) {
                    return Err(
                        ValidationError::invalid("progress", "must be between 0 and 100").into(),
                    );
                }
                self.adapter.update_progress(&queue, &id, progress).await
            }
            WebhookTrigger::Event(EventKind::Completed) => {
                let result = update
                    .result
                    .clone()
                    .ok_or_else(|| ValidationError::MissingField("result".to_string()))?;
                self.adapter.complete_job(&queue, &id, result).await
            }
            WebhookTrigger::Event(EventKind::Failed) => {
                let error = update
                    .error
                    .clone()
                    .filter(|e| !e.is_empty())
                    .ok_or_else(|| ValidationError::MissingField("error".to_string()))?;
                self.adapter.fail_job(&queue, &id, error).await
            }
            WebhookTrigger::Event(EventKind::Active) => self.adapter.move_to_active(&queue, &id).await,
            WebhookTrigger::Custom(name) => {
                self.fire_custom_webhook(&job, &envelope, name, &update).await;
                Ok(job.clone())
            }
            _ => {
                return Err(
                    ValidationError::invalid("status", unsupported_status(&update.status)).into(),
                )
            }
        };
        let job = updated.map_err(map_transition_error)?;

        let record = JobUpdateRecord {
            status: trigger.to_string(),
            progress: update.progress,
            result: update.result,
            error: update.error,
            at: Utc::now(),
        };
        let updates = {
            let mut jobs = self.jobs.write().await;
            match jobs.get_mut(&id) {
                Some(tracked) => {
                    tracked.updates.push(record);
                    tracked.updates.clone()
                }
                None => vec![record],
            }
        };

        debug!("Job updated");
        Ok(build_view(&job, envelope, updates))
    }

    /// Engine-authoritative status merged with tracker history
    pub async fn get_job_status(&self, tenant: &Tenant, id: &str) -> Result<JobView, CoreError> {
        let (job, envelope) = self.locate(id).await?;
        self.authorize(tenant, &envelope)?;
        self.hydrate(&job).await;

        let updates = self
            .jobs
            .read()
            .await
            .get(id)
            .map(|tracked| tracked.updates.clone())
            .unwrap_or_default();
        Ok(build_view(&job, envelope, updates))
    }

    /// Jobs visible to `tenant`, newest first
    ///
    /// Only the master tenant sees other tenants' jobs.
    #[instrument(skip(self, tenant, filter), fields(tenant_id = %tenant.id))]
    pub async fn list_jobs(
        &self,
        tenant: &Tenant,
        filter: &JobListFilter,
    ) -> Result<JobPage, CoreError> {
        let master = self.tenants.is_master(&tenant.id);
        let queues: Vec<String> = {
            let tracked = self.tracked_queues.lock().await;
            match &filter.queue {
                Some(queue) if tracked.contains(queue) => vec![queue.clone()],
                Some(_) => Vec::new(),
                None => {
                    let mut all: Vec<String> = tracked.iter().cloned().collect();
                    all.sort();
                    all
                }
            }
        };

        let statuses = filter.status.statuses();
        let mut matched: Vec<(EngineJob, JobEnvelope)> = Vec::new();
        for queue in queues {
            for job in self
                .adapter
                .list_jobs(&queue, &statuses, 0, usize::MAX)
                .await?
            {
                let Some(envelope) = decode_envelope(&job) else {
                    continue;
                };
                if !master && envelope.tenant_id != tenant.id {
                    continue;
                }
                if !metadata_matches(&envelope.metadata, &filter.metadata) {
                    continue;
                }
                matched.push((job, envelope));
            }
        }

        matched.sort_by(|(a, _), (b, _)| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });

        let total = matched.len();
        let limit = filter.page_size();
        let cache = self.jobs.read().await;
        let jobs = matched
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .map(|(job, envelope)| {
                let updates = cache
                    .get(&job.id)
                    .map(|tracked| tracked.updates.clone())
                    .unwrap_or_default();
                build_view(&job, envelope, updates)
            })
            .collect();

        Ok(JobPage {
            jobs,
            total,
            limit,
            offset: filter.offset,
        })
    }

    /// Fan one engine event out to per-job webhooks, tenant webhooks and
    /// subscriptions
    ///
    /// Replays of an already handled transition are ignored. Each fan-out
    /// runs on its own task; the handles are returned for callers that want
    /// to wait.
    #[instrument(skip(self, event), fields(queue = %event.queue, job_id = %event.job.id, kind = %event.kind))]
    pub async fn handle_engine_event(self: &Arc<Self>, event: EngineEvent) -> Vec<JoinHandle<()>> {
        if !self.seen.lock().await.insert(event.fingerprint()) {
            debug!("Duplicate engine event ignored");
            return Vec::new();
        }
        let Some(envelope) = decode_envelope(&event.job) else {
            debug!("Event for a job not submitted through the tracker");
            return Vec::new();
        };
        self.hydrate(&event.job).await;
        if event.job.status.is_terminal() {
            self.evict_forgotten(&event.queue).await;
        }

        let application = self.application_of(&envelope.tenant_id).await;
        let lifecycle = Arc::new(LifecycleEvent {
            application,
            queue: event.queue.clone(),
            job_id: event.job.id.clone(),
            kind: event.kind,
            job_status: event.job.status,
            progress: event.job.progress,
            result: match event.kind {
                EventKind::Completed => event.job.result.clone(),
                _ => None,
            },
            error: match event.kind {
                EventKind::Failed => event.job.error.clone(),
                _ => None,
            },
            metadata: envelope.metadata.clone(),
            timestamp: event.timestamp,
        });

        let mut handles = Vec::with_capacity(3);

        let tracker = Arc::clone(self);
        let job_event = Arc::clone(&lifecycle);
        let job_webhooks = envelope.webhooks;
        handles.push(tokio::spawn(async move {
            tracker.dispatch_job_webhooks(&job_event, &job_webhooks).await;
        }));

        let webhooks = self.webhooks.clone();
        let tenant_event = Arc::clone(&lifecycle);
        handles.push(tokio::spawn(async move {
            match webhooks.dispatch_event(&tenant_event).await {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        if let Err(e) = delivery.await {
                            warn!(error = %e, "Tenant webhook delivery task failed");
                        }
                    }
                }
                Err(e) => error!(error = %e, "Failed to dispatch tenant webhooks"),
            }
        }));

        let subscriptions = self.subscriptions.clone();
        let subscription_event = Arc::clone(&lifecycle);
        handles.push(tokio::spawn(async move {
            if let Err(e) = subscriptions.process_event(&subscription_event).await {
                error!(error = %e, "Failed to process subscriptions");
            }
        }));

        handles
    }

    /// Deliver to every per-job webhook registered for the event kind or `*`
    async fn dispatch_job_webhooks(&self, event: &LifecycleEvent, webhooks: &JobWebhooks) {
        let mut seen_urls = HashSet::new();
        let targets: Vec<String> = webhooks
            .iter()
            .filter(|(trigger, _)| match trigger {
                WebhookTrigger::Event(kind) => *kind == event.kind,
                WebhookTrigger::Any => true,
                WebhookTrigger::Custom(_) => false,
            })
            .filter(|(_, url)| seen_urls.insert((*url).clone()))
            .map(|(_, url)| url.clone())
            .collect();
        if targets.is_empty() {
            return;
        }

        debug!(count = targets.len(), "Dispatching per-job webhooks");
        let payload = event.to_payload();
        let reports = join_all(targets.into_iter().map(|url| {
            let payload = &payload;
            async move {
                let guard = self.job_guard(&event.job_id, url).await;
                deliver_with_retry(&self.job_deliverer, &guard, payload).await
            }
        }))
        .await;

        let failed = reports.iter().filter(|r| !r.is_delivered()).count();
        if failed > 0 {
            warn!(job_id = %event.job_id, failed = failed, "Per-job webhook deliveries failed");
        }
    }

    /// Fire the job's `custom:<name>` webhook, if it registered one
    async fn fire_custom_webhook(
        &self,
        job: &EngineJob,
        envelope: &JobEnvelope,
        name: &str,
        update: &JobUpdate,
    ) -> Option<JoinHandle<DeliveryReport>> {
        let trigger = WebhookTrigger::Custom(name.to_string());
        let Some(url) = envelope.webhooks.get(&trigger).cloned() else {
            debug!(custom = name, "No custom webhook registered for job");
            return None;
        };

        let payload = WebhookPayload {
            event: format!("job.custom.{}", name),
            timestamp: Utc::now(),
            data: PayloadData {
                job_id: Some(job.id.clone()),
                queue: Some(job.queue.clone()),
                status: Some(trigger.to_string()),
                result: update.result.clone(),
                error: update.error.clone(),
                progress: update.progress,
                application: self.application_of(&envelope.tenant_id).await,
                extra: serde_json::Map::new(),
            },
        };

        let guard = self.job_guard(&job.id, url).await;
        let deliverer = self.job_deliverer.clone();
        Some(tokio::spawn(async move {
            deliver_with_retry(&deliverer, &guard, &payload).await
        }))
    }

    async fn job_guard(&self, job_id: &str, url: String) -> JobWebhookGuard {
        let failures = self
            .jobs
            .read()
            .await
            .get(job_id)
            .map(|tracked| Arc::clone(&tracked.webhook_failures))
            .unwrap_or_default();
        JobWebhookGuard {
            failures,
            job_id: job_id.to_string(),
            url,
            secret: self.config.job_signing_secret.clone(),
            retry_config: self.config.job_webhook_retry.clone(),
        }
    }

    async fn application_of(&self, tenant_id: &str) -> Application {
        match self.tenants.get(tenant_id).await {
            Some(tenant) => tenant.application(),
            None => Application {
                id: tenant_id.to_string(),
                name: tenant_id.to_string(),
            },
        }
    }

    /// Find a job by id, trying its cached queue first
    ///
    /// A cache entry whose engine job is gone is dropped.
    async fn locate(&self, id: &str) -> Result<(EngineJob, JobEnvelope), CoreError> {
        let cached_queue = self.jobs.read().await.get(id).map(|t| t.queue.clone());
        let queues = match cached_queue {
            Some(queue) => vec![queue],
            None => {
                let tracked = self.tracked_queues.lock().await;
                tracked.iter().cloned().collect()
            }
        };

        for queue in queues {
            let Some(job) = self.adapter.get_job(&queue, id).await? else {
                continue;
            };
            if let Some(envelope) = decode_envelope(&job) {
                return Ok((job, envelope));
            }
        }

        self.jobs.write().await.remove(id);
        Err(CoreError::not_found("Job", id))
    }

    fn authorize(&self, tenant: &Tenant, envelope: &JobEnvelope) -> Result<(), CoreError> {
        if envelope.tenant_id == tenant.id || self.tenants.is_master(&tenant.id) {
            Ok(())
        } else {
            Err(CoreError::Forbidden(
                "job belongs to another tenant".to_string(),
            ))
        }
    }

    /// Rebuild the cache entry of a job known only to the engine
    async fn hydrate(&self, job: &EngineJob) {
        let mut jobs = self.jobs.write().await;
        jobs.entry(job.id.clone())
            .or_insert_with(|| TrackedJob::new(&job.queue));
    }

    /// Drop cache entries of `queue` whose engine job has been pruned
    async fn evict_forgotten(&self, queue: &str) -> usize {
        let candidates: Vec<String> = self
            .jobs
            .read()
            .await
            .iter()
            .filter(|(_, tracked)| tracked.queue == queue)
            .map(|(id, _)| id.clone())
            .collect();

        let mut forgotten = Vec::new();
        for id in candidates {
            match self.adapter.get_job(queue, &id).await {
                Ok(Some(_)) => {}
                Ok(None) => forgotten.push(id),
                Err(e) => {
                    warn!(queue = queue, error = %e, "Job cache sweep skipped");
                    return 0;
                }
            }
        }
        if forgotten.is_empty() {
            return 0;
        }

        let mut jobs = self.jobs.write().await;
        for id in &forgotten {
            jobs.remove(id);
        }
        debug!(queue = queue, evicted = forgotten.len(), "Pruned jobs evicted from cache");
        forgotten.len()
    }
}

/// Keeps a job's own webhooks alive until their failure budget is spent
struct JobWebhookGuard {
    failures: Arc<AtomicU32>,
    job_id: String,
    url: String,
    secret: String,
    retry_config: WebhookRetryConfig,
}

#[async_trait]
impl DeliveryGuard for JobWebhookGuard {
    async fn current_target(&self) -> Option<DeliveryTarget> {
        if self.failures.load(Ordering::Relaxed) >= JOB_WEBHOOK_FAILURE_LIMIT {
            return None;
        }
        Some(DeliveryTarget {
            url: self.url.clone(),
            secret: self.secret.clone(),
            headers: HashMap::new(),
            retry_config: self.retry_config.clone(),
        })
    }

    async fn on_success(&self, _receipt: &DeliveryReceipt) {}

    async fn on_failure(&self, _error: &DeliveryError, _attempt: u32) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures == JOB_WEBHOOK_FAILURE_LIMIT {
            warn!(
                job_id = %self.job_id,
                "Per-job webhooks disabled after repeated delivery failures"
            );
        }
    }
}

fn parse_job_webhooks(raw: &HashMap<String, String>) -> Result<JobWebhooks, ValidationError> {
    let mut webhooks = JobWebhooks::new();
    for (key, url) in raw {
        let trigger: WebhookTrigger = key.parse()?;
        validate_http_url(&format!("webhooks.{}", key), url)?;
        webhooks.insert(trigger, url.clone());
    }
    Ok(webhooks)
}

fn decode_envelope(job: &EngineJob) -> Option<JobEnvelope> {
    serde_json::from_value(job.data.clone()).ok()
}

fn map_transition_error(err: QueueError) -> CoreError {
    match err {
        QueueError::InvalidTransition { .. } => CoreError::Conflict(err.to_string()),
        QueueError::JobNotFound { job_id, .. } => CoreError::not_found("Job", job_id),
        other => CoreError::Queue(other),
    }
}

fn unsupported_status(status: &str) -> String {
    format!(
        "unsupported status '{}'; use active, progress, completed, failed or custom:<name>",
        status
    )
}

fn build_view(job: &EngineJob, envelope: JobEnvelope, updates: Vec<JobUpdateRecord>) -> JobView {
    JobView {
        id: job.id.clone(),
        queue: job.queue.clone(),
        tenant_id: envelope.tenant_id,
        status: job.status,
        progress: job.progress,
        result: job.result.clone(),
        error: job.error.clone(),
        data: envelope.payload,
        metadata: envelope.metadata,
        webhooks: envelope.webhooks,
        attempts_made: job.attempts_made,
        max_attempts: job.max_attempts,
        submitted_at: envelope.submitted_at,
        started_at: job.started_at,
        completed_at: job.completed_at,
        failed_at: job.failed_at,
        updates,
    }
}
