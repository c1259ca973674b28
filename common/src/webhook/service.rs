// Tenant webhook registrations and event dispatch

use super::delivery::{
    deliver_with_retry, DeliveryGuard, DeliveryReceipt, DeliveryReport, DeliveryTarget,
    WebhookDeliverer,
};
use super::{generate_webhook_secret, is_reserved_header};
use crate::db::WebhookRepository;
use crate::errors::{CoreError, DeliveryError, ValidationError};
use crate::executor::validate_http_url;
use crate::models::{
    Application, CreateWebhook, EventKind, LifecycleEvent, PayloadData, UpdateWebhook, Webhook,
    WebhookPayload, WebhookRetryConfig,
};
use crate::tenant::TenantDirectory;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Cumulative failed attempts after which a webhook is deactivated
pub const AUTO_DISABLE_THRESHOLD: u32 = 10;

pub const TEST_EVENT: &str = "webhook.test";

/// Outcome of a synchronous test delivery
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTestResult {
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Manages tenant webhooks and fans lifecycle events out to them
#[derive(Clone)]
pub struct WebhookService {
    repository: Arc<dyn WebhookRepository>,
    tenants: Arc<dyn TenantDirectory>,
    deliverer: WebhookDeliverer,
}

impl WebhookService {
    pub fn new(
        repository: Arc<dyn WebhookRepository>,
        tenants: Arc<dyn TenantDirectory>,
        deliverer: WebhookDeliverer,
    ) -> Self {
        Self {
            repository,
            tenants,
            deliverer,
        }
    }

    #[instrument(skip(self, request), fields(tenant_id = %tenant_id, url = %request.url))]
    pub async fn create_webhook(
        &self,
        tenant_id: &str,
        request: CreateWebhook,
    ) -> Result<Webhook, CoreError> {
        validate_http_url("url", &request.url)?;
        let events = parse_events(&request.events)?;
        validate_headers(&request.headers)?;
        let retry_config = request.retry_config.unwrap_or_default();
        validate_retry_config(&retry_config)?;
        let secret = match request.secret {
            Some(secret) if secret.is_empty() => {
                return Err(ValidationError::invalid("secret", "secret cannot be empty").into())
            }
            Some(secret) => secret,
            None => generate_webhook_secret(),
        };

        let now = Utc::now();
        let webhook = Webhook {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            url: request.url,
            secret,
            events,
            queues: request.queues,
            headers: request.headers,
            active: true,
            failure_count: 0,
            retry_config,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        };

        self.repository.create(&webhook).await?;

        info!(webhook_id = %webhook.id, "Webhook created");
        Ok(webhook)
    }

    /// Apply a partial update; reactivating resets the failure counter
    #[instrument(skip(self, request), fields(tenant_id = %tenant_id, webhook_id = %id))]
    pub async fn update_webhook(
        &self,
        tenant_id: &str,
        id: Uuid,
        request: UpdateWebhook,
    ) -> Result<Webhook, CoreError> {
        let mut webhook = self.owned(tenant_id, id).await?;

        if let Some(url) = request.url {
            validate_http_url("url", &url)?;
            webhook.url = url;
        }
        if let Some(secret) = request.secret {
            if secret.is_empty() {
                return Err(ValidationError::invalid("secret", "secret cannot be empty").into());
            }
            webhook.secret = secret;
        }
        if let Some(events) = request.events {
            webhook.events = parse_events(&events)?;
        }
        if let Some(queues) = request.queues {
            webhook.queues = queues;
        }
        if let Some(headers) = request.headers {
            validate_headers(&headers)?;
            webhook.headers = headers;
        }
        if let Some(retry_config) = request.retry_config {
            validate_retry_config(&retry_config)?;
            webhook.retry_config = retry_config;
        }
        let reactivated = request.active == Some(true) && !webhook.active;
        if let Some(active) = request.active {
            webhook.active = active;
        }
        webhook.updated_at = Utc::now();

        if !self.repository.save(&webhook).await? {
            return Err(CoreError::not_found("Webhook", id));
        }
        if reactivated {
            self.repository.reset_failures(id).await?;
            webhook.failure_count = 0;
        }

        info!(active = webhook.active, "Webhook updated");
        Ok(webhook)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, webhook_id = %id))]
    pub async fn delete_webhook(&self, tenant_id: &str, id: Uuid) -> Result<(), CoreError> {
        self.owned(tenant_id, id).await?;
        self.repository.delete(id).await?;
        info!("Webhook deleted");
        Ok(())
    }

    pub async fn get_webhook(&self, tenant_id: &str, id: Uuid) -> Result<Webhook, CoreError> {
        self.owned(tenant_id, id).await
    }

    pub async fn list_webhooks(&self, tenant_id: &str) -> Result<Vec<Webhook>, CoreError> {
        Ok(self.repository.list_by_tenant(tenant_id).await?)
    }

    /// Active webhooks of the event's tenant subscribed to its kind and queue
    pub async fn find_matching(&self, event: &LifecycleEvent) -> Result<Vec<Webhook>, CoreError> {
        Ok(self
            .repository
            .list_by_tenant(event.tenant_id())
            .await?
            .into_iter()
            .filter(|webhook| webhook.matches(event))
            .collect())
    }

    /// Spawn one retried delivery per matching webhook
    ///
    /// Returns immediately; each delivery runs on its own task so a slow or
    /// failing endpoint never delays the others.
    #[instrument(skip(self, event), fields(tenant_id = %event.tenant_id(), queue = %event.queue, job_id = %event.job_id, kind = %event.kind))]
    pub async fn dispatch_event(
        &self,
        event: &LifecycleEvent,
    ) -> Result<Vec<JoinHandle<DeliveryReport>>, CoreError> {
        let webhooks = self.find_matching(event).await?;
        if webhooks.is_empty() {
            return Ok(Vec::new());
        }

        info!(count = webhooks.len(), "Dispatching tenant webhooks");

        let payload = Arc::new(event.to_payload());
        let handles = webhooks
            .into_iter()
            .map(|webhook| {
                let guard = StoreGuard {
                    repository: Arc::clone(&self.repository),
                    webhook_id: webhook.id,
                    tenant_id: webhook.tenant_id,
                };
                let deliverer = self.deliverer.clone();
                let payload = Arc::clone(&payload);
                tokio::spawn(async move { deliver_with_retry(&deliverer, &guard, &payload).await })
            })
            .collect();

        Ok(handles)
    }

    /// Count one failed attempt, deactivating at the threshold
    ///
    /// Returns the new count, or None when the webhook no longer exists.
    pub async fn record_failure(&self, id: Uuid) -> Result<Option<u32>, CoreError> {
        Ok(record_failure(self.repository.as_ref(), id).await?)
    }

    /// Send a single signed `webhook.test` delivery and report the outcome
    ///
    /// Test deliveries ignore the active flag and never touch the failure
    /// counter.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, webhook_id = %id))]
    pub async fn test_webhook(
        &self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<WebhookTestResult, CoreError> {
        let webhook = self.owned(tenant_id, id).await?;
        let application = match self.tenants.get(&webhook.tenant_id).await {
            Some(tenant) => tenant.application(),
            None => Application {
                id: webhook.tenant_id.clone(),
                name: webhook.tenant_id.clone(),
            },
        };

        let mut extra = serde_json::Map::new();
        extra.insert("webhookId".to_string(), serde_json::json!(webhook.id));
        extra.insert(
            "message".to_string(),
            serde_json::json!("This is a test delivery"),
        );
        let payload = WebhookPayload {
            event: TEST_EVENT.to_string(),
            timestamp: Utc::now(),
            data: PayloadData {
                job_id: None,
                queue: None,
                status: None,
                result: None,
                error: None,
                progress: None,
                application,
                extra,
            },
        };

        let started = std::time::Instant::now();
        let result = self
            .deliverer
            .with_scope("test")
            .deliver(&target_of(&webhook), &payload, 1)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        Ok(match result {
            Ok(receipt) => WebhookTestResult {
                success: true,
                status_code: Some(receipt.status),
                error: None,
                duration_ms,
            },
            Err(e) => WebhookTestResult {
                success: false,
                status_code: e.status(),
                error: Some(e.to_string()),
                duration_ms,
            },
        })
    }

    /// Load a webhook the tenant may act on
    async fn owned(&self, tenant_id: &str, id: Uuid) -> Result<Webhook, CoreError> {
        let webhook = self
            .repository
            .find(id)
            .await?
            .ok_or_else(|| CoreError::not_found("Webhook", id))?;

        if webhook.tenant_id != tenant_id && !self.tenants.is_master(tenant_id) {
            return Err(CoreError::Forbidden(format!(
                "webhook {} belongs to another tenant",
                id
            )));
        }
        Ok(webhook)
    }
}

fn target_of(webhook: &Webhook) -> DeliveryTarget {
    DeliveryTarget {
        url: webhook.url.clone(),
        secret: webhook.secret.clone(),
        headers: webhook.headers.clone(),
        retry_config: webhook.retry_config.clone(),
    }
}

async fn record_failure(
    repository: &dyn WebhookRepository,
    id: Uuid,
) -> Result<Option<u32>, crate::errors::StorageError> {
    let Some(count) = repository.increment_failures(id).await? else {
        return Ok(None);
    };

    if count >= AUTO_DISABLE_THRESHOLD {
        if let Some(mut webhook) = repository.find(id).await? {
            if webhook.active {
                webhook.active = false;
                webhook.failure_count = count;
                webhook.updated_at = Utc::now();
                if !repository.save(&webhook).await? {
                    return Ok(Some(count));
                }
                warn!(
                    webhook_id = %id,
                    failure_count = count,
                    "Webhook deactivated after repeated delivery failures"
                );
            }
        }
    }
    Ok(Some(count))
}

/// Reads the live registration before every attempt and keeps its counters
struct StoreGuard {
    repository: Arc<dyn WebhookRepository>,
    webhook_id: Uuid,
    tenant_id: String,
}

#[async_trait]
impl DeliveryGuard for StoreGuard {
    async fn current_target(&self) -> Option<DeliveryTarget> {
        match self.repository.find(self.webhook_id).await {
            Ok(Some(webhook)) if webhook.active && webhook.tenant_id == self.tenant_id => {
                Some(target_of(&webhook))
            }
            Ok(_) => None,
            Err(e) => {
                error!(webhook_id = %self.webhook_id, error = %e, "Failed to load webhook");
                None
            }
        }
    }

    async fn on_success(&self, _receipt: &DeliveryReceipt) {
        if let Err(e) = self
            .repository
            .touch_triggered(self.webhook_id, Utc::now())
            .await
        {
            error!(webhook_id = %self.webhook_id, error = %e, "Failed to record webhook success");
        }
    }

    async fn on_failure(&self, _error: &DeliveryError, _attempt: u32) {
        if let Err(e) = record_failure(self.repository.as_ref(), self.webhook_id).await {
            error!(webhook_id = %self.webhook_id, error = %e, "Failed to record webhook failure");
        }
    }
}

fn parse_events(events: &[String]) -> Result<HashSet<EventKind>, ValidationError> {
    if events.is_empty() {
        return Err(ValidationError::MissingField("events".to_string()));
    }
    events.iter().map(|e| e.parse::<EventKind>()).collect()
}

fn validate_headers(headers: &HashMap<String, String>) -> Result<(), ValidationError> {
    match headers.keys().find(|name| is_reserved_header(name)) {
        Some(name) => Err(ValidationError::invalid(
            "headers",
            format!("header '{}' is set by the delivery system", name),
        )),
        None => Ok(()),
    }
}

fn validate_retry_config(config: &WebhookRetryConfig) -> Result<(), ValidationError> {
    if config.max_attempts == 0 {
        return Err(ValidationError::invalid(
            "retryConfig.maxAttempts",
            "must be at least 1",
        ));
    }
    if !config.backoff_multiplier.is_finite() || config.backoff_multiplier < 1.0 {
        return Err(ValidationError::invalid(
            "retryConfig.backoffMultiplier",
            "must be a finite number >= 1",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryWebhookRepository;
    use crate::models::{JobStatus, Metadata, QueueFilter, Tenant};
    use crate::tenant::StaticTenantDirectory;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service() -> WebhookService {
        let tenants = StaticTenantDirectory::new(
            vec![Tenant {
                id: "acme".to_string(),
                name: "Acme".to_string(),
                api_key: "k".to_string(),
                allowed_queues: vec!["*".to_string()],
            }],
            Some("root".to_string()),
        );
        WebhookService::new(
            Arc::new(InMemoryWebhookRepository::new()),
            Arc::new(tenants),
            WebhookDeliverer::new(5, "test-agent", "tenant").unwrap(),
        )
    }

    fn create(url: &str) -> CreateWebhook {
        CreateWebhook {
            url: url.to_string(),
            secret: Some("s3cret".to_string()),
            events: vec!["completed".to_string()],
            queues: QueueFilter::Only(["emails".to_string()].into_iter().collect()),
            headers: HashMap::new(),
            retry_config: Some(WebhookRetryConfig {
                max_attempts: 1,
                initial_delay_ms: 10,
                backoff_multiplier: 2.0,
            }),
        }
    }

    fn event(queue: &str, kind: EventKind) -> LifecycleEvent {
        LifecycleEvent {
            application: Application {
                id: "acme".to_string(),
                name: "Acme".to_string(),
            },
            queue: queue.to_string(),
            job_id: "job-1".to_string(),
            kind,
            job_status: JobStatus::Completed,
            progress: None,
            result: Some(serde_json::json!({"sent": true})),
            error: None,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_event_and_reserved_header() {
        let svc = service();

        let mut bad_event = create("https://example.com/hook");
        bad_event.events = vec!["complete".to_string()];
        assert!(matches!(
            svc.create_webhook("acme", bad_event).await,
            Err(CoreError::Validation(_))
        ));

        let mut bad_header = create("https://example.com/hook");
        bad_header
            .headers
            .insert("X-Webhook-Signature".to_string(), "x".to_string());
        assert!(svc.create_webhook("acme", bad_header).await.is_err());

        assert!(svc.create_webhook("acme", create("/relative")).await.is_err());
    }

    #[tokio::test]
    async fn test_generated_secret_when_omitted() {
        let svc = service();
        let mut request = create("https://example.com/hook");
        request.secret = None;
        let webhook = svc.create_webhook("acme", request).await.unwrap();
        assert_eq!(webhook.secret.len(), 64);
    }

    #[tokio::test]
    async fn test_ownership_enforced() {
        let svc = service();
        let webhook = svc
            .create_webhook("acme", create("https://example.com/hook"))
            .await
            .unwrap();

        assert!(matches!(
            svc.delete_webhook("intruder", webhook.id).await,
            Err(CoreError::Forbidden(_))
        ));
        assert!(matches!(
            svc.get_webhook("acme", Uuid::new_v4()).await,
            Err(CoreError::NotFound { .. })
        ));
        // Master tenant may act on any webhook
        assert!(svc.get_webhook("root", webhook.id).await.is_ok());
        svc.delete_webhook("acme", webhook.id).await.unwrap();
        assert!(svc.list_webhooks("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_disable_exactly_at_threshold() {
        let svc = service();
        let webhook = svc
            .create_webhook("acme", create("https://example.com/hook"))
            .await
            .unwrap();

        for expected in 1..AUTO_DISABLE_THRESHOLD {
            assert_eq!(svc.record_failure(webhook.id).await.unwrap(), Some(expected));
        }
        let at_nine = svc.get_webhook("acme", webhook.id).await.unwrap();
        assert_eq!(at_nine.failure_count, 9);
        assert!(at_nine.active);

        assert_eq!(svc.record_failure(webhook.id).await.unwrap(), Some(10));
        let at_ten = svc.get_webhook("acme", webhook.id).await.unwrap();
        assert!(!at_ten.active);

        // Reactivation resets the counter
        let reactivated = svc
            .update_webhook(
                "acme",
                webhook.id,
                UpdateWebhook {
                    active: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(reactivated.active);
        assert_eq!(reactivated.failure_count, 0);
        let stored = svc.get_webhook("acme", webhook.id).await.unwrap();
        assert_eq!(stored.failure_count, 0);
        assert!(stored.active);
    }

    #[tokio::test]
    async fn test_update_keeps_failure_count() {
        let svc = service();
        let webhook = svc
            .create_webhook("acme", create("https://example.com/hook"))
            .await
            .unwrap();
        for _ in 0..3 {
            svc.record_failure(webhook.id).await.unwrap();
        }

        let updated = svc
            .update_webhook(
                "acme",
                webhook.id,
                UpdateWebhook {
                    url: Some("https://example.com/moved".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.url, "https://example.com/moved");

        let stored = svc.get_webhook("acme", webhook.id).await.unwrap();
        assert_eq!(stored.url, "https://example.com/moved");
        assert_eq!(stored.failure_count, 3);
        assert_eq!(svc.record_failure(webhook.id).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_dispatch_respects_queue_filter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "event": "job.completed",
                "data": {"status": "completed", "queue": "emails"}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let svc = service();
        svc.create_webhook("acme", create(&server.uri()))
            .await
            .unwrap();

        let sms = svc
            .dispatch_event(&event("sms", EventKind::Completed))
            .await
            .unwrap();
        assert!(sms.is_empty());

        let active = svc
            .dispatch_event(&event("emails", EventKind::Active))
            .await
            .unwrap();
        assert!(active.is_empty());

        let emails = svc
            .dispatch_event(&event("emails", EventKind::Completed))
            .await
            .unwrap();
        assert_eq!(emails.len(), 1);
        for handle in emails {
            assert!(handle.await.unwrap().is_delivered());
        }
    }

    #[tokio::test]
    async fn test_failed_dispatch_counts_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(410))
            .expect(1)
            .mount(&server)
            .await;

        let svc = service();
        let webhook = svc
            .create_webhook("acme", create(&server.uri()))
            .await
            .unwrap();

        for handle in svc
            .dispatch_event(&event("emails", EventKind::Completed))
            .await
            .unwrap()
        {
            handle.await.unwrap();
        }

        let stored = svc.get_webhook("acme", webhook.id).await.unwrap();
        assert_eq!(stored.failure_count, 1);
        assert!(stored.last_triggered_at.is_none());
    }

    #[tokio::test]
    async fn test_test_webhook_reports_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "event": "webhook.test",
                "data": {"application": {"id": "acme", "name": "Acme"}}
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let svc = service();
        let webhook = svc
            .create_webhook("acme", create(&server.uri()))
            .await
            .unwrap();

        let result = svc.test_webhook("acme", webhook.id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.status_code, Some(204));
        assert_eq!(
            svc.get_webhook("acme", webhook.id)
                .await
                .unwrap()
                .failure_count,
            0
        );
    }
}
