// Subscription engine: tenant-scoped CRUD and event-driven triggering

use super::matcher::subscription_matches;
use crate::db::SubscriptionRepository;
use crate::errors::{CoreError, DeliveryError, ValidationError};
use crate::executor::{validate_http_url, HttpExecutor, OutboundRequest};
use crate::models::{
    CreateSubscription, EventKind, HttpMethod, LifecycleEvent, Subscription,
    SubscriptionRetryConfig, UpdateSubscription, WebhookPayload,
};
use crate::retry::{LinearBackoff, RetryStrategy};
use crate::telemetry;
use crate::tenant::TenantDirectory;
use crate::webhook::{
    is_reserved_header, sign_payload, ATTEMPT_HEADER, EVENT_HEADER, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Result of triggering one subscription
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerOutcome {
    pub subscription_id: Uuid,
    pub success: bool,
    pub attempts: u32,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct SubscriptionEngine {
    repository: Arc<dyn SubscriptionRepository>,
    tenants: Arc<dyn TenantDirectory>,
    executor: HttpExecutor,
}

impl SubscriptionEngine {
    pub fn new(
        repository: Arc<dyn SubscriptionRepository>,
        tenants: Arc<dyn TenantDirectory>,
        executor: HttpExecutor,
    ) -> Self {
        Self {
            repository,
            tenants,
            executor,
        }
    }

    #[instrument(skip(self, request), fields(tenant_id = %tenant_id, endpoint = %request.endpoint))]
    pub async fn create_subscription(
        &self,
        tenant_id: &str,
        request: CreateSubscription,
    ) -> Result<Subscription, CoreError> {
        validate_http_url("endpoint", &request.endpoint)?;
        let method = parse_method(request.method.as_deref())?;
        let events = parse_events(&request.events)?;
        validate_headers(&request.headers)?;
        let retry_config = request.retry_config.unwrap_or_default();
        validate_retry_config(&retry_config)?;
        validate_secret(request.secret.as_deref())?;

        let now = Utc::now();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            endpoint: request.endpoint,
            method,
            headers: request.headers,
            secret: request.secret,
            events,
            filters: request.filters,
            retry_config,
            active: true,
            trigger_count: 0,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        };

        self.repository.create(&subscription).await?;

        info!(subscription_id = %subscription.id, "Subscription created");
        Ok(subscription)
    }

    /// Apply a partial update; `secret: Some(None)` removes the secret
    #[instrument(skip(self, request), fields(tenant_id = %tenant_id, subscription_id = %id))]
    pub async fn update_subscription(
        &self,
        tenant_id: &str,
        id: Uuid,
        request: UpdateSubscription,
    ) -> Result<Subscription, CoreError> {
        let mut subscription = self.owned(tenant_id, id).await?;

        if let Some(endpoint) = request.endpoint {
            validate_http_url("endpoint", &endpoint)?;
            subscription.endpoint = endpoint;
        }
        if let Some(method) = request.method {
            subscription.method = parse_method(Some(&method))?;
        }
        if let Some(headers) = request.headers {
            validate_headers(&headers)?;
            subscription.headers = headers;
        }
        if let Some(secret) = request.secret {
            validate_secret(secret.as_deref())?;
            subscription.secret = secret;
        }
        if let Some(events) = request.events {
            subscription.events = parse_events(&events)?;
        }
        if let Some(filters) = request.filters {
            subscription.filters = filters;
        }
        if let Some(retry_config) = request.retry_config {
            validate_retry_config(&retry_config)?;
            subscription.retry_config = retry_config;
        }
        if let Some(active) = request.active {
            subscription.active = active;
        }
        subscription.updated_at = Utc::now();

        if !self.repository.save(&subscription).await? {
            return Err(CoreError::not_found("Subscription", id));
        }

        info!(active = subscription.active, "Subscription updated");
        Ok(subscription)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %id))]
    pub async fn delete_subscription(&self, tenant_id: &str, id: Uuid) -> Result<(), CoreError> {
        self.owned(tenant_id, id).await?;
        self.repository.delete(id).await?;
        info!("Subscription deleted");
        Ok(())
    }

    pub async fn get_subscription(
        &self,
        tenant_id: &str,
        id: Uuid,
    ) -> Result<Subscription, CoreError> {
        self.owned(tenant_id, id).await
    }

    pub async fn list_subscriptions(&self, tenant_id: &str) -> Result<Vec<Subscription>, CoreError> {
        Ok(self.repository.list_by_tenant(tenant_id).await?)
    }

    /// Active subscriptions of the event's tenant whose rules accept it
    pub async fn find_matching_subscriptions(
        &self,
        event: &LifecycleEvent,
    ) -> Result<Vec<Subscription>, CoreError> {
        Ok(self
            .repository
            .list_by_tenant(event.tenant_id())
            .await?
            .into_iter()
            .filter(|subscription| subscription_matches(subscription, event))
            .collect())
    }

    /// Call the subscription endpoint, retrying with linear backoff
    ///
    /// The subscription is reloaded before every attempt; a deleted or
    /// deactivated subscription stops the retries. 4xx responses are not
    /// retried. Exhaustion is logged and reported, never escalated.
    #[instrument(skip(self, subscription, payload), fields(subscription_id = %subscription.id, event = %payload.event))]
    pub async fn trigger_subscription(
        &self,
        subscription: &Subscription,
        payload: &WebhookPayload,
    ) -> TriggerOutcome {
        let strategy = LinearBackoff::from(&subscription.retry_config);
        let mut attempt: u32 = 1;
        let mut outcome = TriggerOutcome {
            subscription_id: subscription.id,
            success: false,
            attempts: 0,
            status_code: None,
            error: None,
        };

        loop {
            let current = match self.repository.find(subscription.id).await {
                Ok(Some(current)) if current.active => current,
                Ok(_) => {
                    info!(attempts = outcome.attempts, "Subscription gone or inactive, stopping");
                    telemetry::record_subscription_trigger("cancelled");
                    outcome.error = Some("subscription deleted or inactive".to_string());
                    return outcome;
                }
                Err(e) => {
                    error!(error = %e, "Failed to reload subscription");
                    telemetry::record_subscription_trigger("failure");
                    outcome.error = Some(e.to_string());
                    return outcome;
                }
            };

            outcome.attempts = attempt;
            let result = match build_request(&current, payload, attempt) {
                Ok(request) => self.executor.send(request).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(response) => {
                    if let Err(e) = self.repository.record_trigger(current.id, Utc::now()).await {
                        error!(error = %e, "Failed to record subscription trigger");
                    }
                    telemetry::record_subscription_trigger("success");
                    debug!(status = response.status, attempt = attempt, "Subscription triggered");
                    outcome.success = true;
                    outcome.status_code = Some(response.status);
                    outcome.error = None;
                    return outcome;
                }
                Err(e) => {
                    outcome.status_code = e.status();
                    outcome.error = Some(e.to_string());

                    let delay = if e.is_retryable() {
                        strategy.next_delay(attempt)
                    } else {
                        None
                    };
                    match delay {
                        Some(delay) => {
                            warn!(
                                attempt = attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Subscription trigger failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => {
                            error!(
                                endpoint = %current.endpoint,
                                attempts = attempt,
                                error = %e,
                                "Subscription trigger failed"
                            );
                            telemetry::record_subscription_trigger("failure");
                            return outcome;
                        }
                    }
                }
            }
        }
    }

    /// Trigger every matching subscription concurrently
    #[instrument(skip(self, event), fields(tenant_id = %event.tenant_id(), queue = %event.queue, job_id = %event.job_id, kind = %event.kind))]
    pub async fn process_event(
        &self,
        event: &LifecycleEvent,
    ) -> Result<Vec<TriggerOutcome>, CoreError> {
        let matches = self.find_matching_subscriptions(event).await?;
        if matches.is_empty() {
            return Ok(Vec::new());
        }

        info!(count = matches.len(), "Triggering subscriptions");
        let payload = event.to_payload();
        Ok(join_all(
            matches
                .iter()
                .map(|subscription| self.trigger_subscription(subscription, &payload)),
        )
        .await)
    }

    /// Load a subscription the tenant may act on
    async fn owned(&self, tenant_id: &str, id: Uuid) -> Result<Subscription, CoreError> {
        let subscription = self
            .repository
            .find(id)
            .await?
            .ok_or_else(|| CoreError::not_found("Subscription", id))?;

        if subscription.tenant_id != tenant_id && !self.tenants.is_master(tenant_id) {
            return Err(CoreError::Forbidden(format!(
                "subscription {} belongs to another tenant",
                id
            )));
        }
        Ok(subscription)
    }
}

/// Build one attempt; GET carries no body, the signature needs a secret
fn build_request(
    subscription: &Subscription,
    payload: &WebhookPayload,
    attempt: u32,
) -> Result<OutboundRequest, DeliveryError> {
    let body = serde_json::to_vec(payload)
        .map_err(|e| DeliveryError::InvalidRequest(format!("Unserializable payload: {}", e)))?;

    let mut request = OutboundRequest::new(subscription.method, subscription.endpoint.clone());

    let mut custom: Vec<(&String, &String)> = subscription.headers.iter().collect();
    custom.sort();
    for (name, value) in custom {
        if !is_reserved_header(name) {
            request = request.header(name.clone(), value.clone());
        }
    }

    request = request
        .header(EVENT_HEADER, payload.event.clone())
        .header(TIMESTAMP_HEADER, payload.timestamp.to_rfc3339())
        .header(ATTEMPT_HEADER, attempt.to_string());

    if let Some(secret) = subscription.secret.as_deref() {
        let signature = sign_payload(&body, secret)
            .map_err(|e| DeliveryError::InvalidRequest(e.to_string()))?;
        request = request.header(SIGNATURE_HEADER, signature);
    }

    if subscription.method != HttpMethod::Get {
        request = request.header("Content-Type", "application/json").body(body);
    }
    Ok(request)
}

fn parse_method(method: Option<&str>) -> Result<HttpMethod, ValidationError> {
    match method {
        None => Ok(HttpMethod::Post),
        Some(method) => method.parse(),
    }
}

fn parse_events(events: &[String]) -> Result<Vec<EventKind>, ValidationError> {
    if events.is_empty() {
        return Err(ValidationError::MissingField("events".to_string()));
    }
    let mut parsed: Vec<EventKind> = events
        .iter()
        .map(|e| e.parse::<EventKind>())
        .collect::<Result<_, _>>()?;
    parsed.sort();
    parsed.dedup();
    Ok(parsed)
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

fn validate_secret(secret: Option<&str>) -> Result<(), ValidationError> {
    match secret {
        Some("") => Err(ValidationError::invalid("secret", "secret cannot be empty")),
        _ => Ok(()),
    }
}

fn validate_retry_config(config: &SubscriptionRetryConfig) -> Result<(), ValidationError> {
    if config.max_attempts == 0 {
        return Err(ValidationError::invalid(
            "retryConfig.maxAttempts",
            "must be at least 1",
        ));
    }
    Ok(())
}
