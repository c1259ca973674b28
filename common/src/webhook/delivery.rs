// Signed webhook delivery with retry
//
// The body is serialized once and the signature is computed over exactly
// those bytes. Caller headers are applied first and can never replace the
// security headers.

use super::{
    is_reserved_header, sign_payload, ATTEMPT_HEADER, EVENT_HEADER, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
use crate::errors::DeliveryError;
use crate::executor::{HttpExecutor, OutboundRequest};
use crate::models::{HttpMethod, WebhookPayload, WebhookRetryConfig};
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::telemetry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default per-request timeout for webhook deliveries
pub const DEFAULT_DELIVERY_TIMEOUT_SECS: u64 = 30;

/// Everything needed to sign and send one webhook
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryTarget {
    pub url: String,
    pub secret: String,
    pub headers: HashMap<String, String>,
    pub retry_config: WebhookRetryConfig,
}

/// Successful delivery
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub status: u16,
    pub attempt: u32,
    pub duration_ms: u64,
}

/// Final result of a delivery with retries
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryReport {
    Delivered(DeliveryReceipt),
    Failed { attempts: u32, error: DeliveryError },
    /// The target was removed or deactivated between attempts
    Cancelled { attempts: u32 },
}

impl DeliveryReport {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryReport::Delivered(_))
    }
}

/// Source of truth consulted around every attempt of a retried delivery
#[async_trait]
pub trait DeliveryGuard: Send + Sync {
    /// Current target, or None when it no longer exists or is inactive
    async fn current_target(&self) -> Option<DeliveryTarget>;

    async fn on_success(&self, receipt: &DeliveryReceipt);

    async fn on_failure(&self, error: &DeliveryError, attempt: u32);
}

/// Signs and posts webhook payloads
#[derive(Clone)]
pub struct WebhookDeliverer {
    executor: HttpExecutor,
    user_agent: String,
    /// Metric label: tenant, job or test
    scope: &'static str,
}

impl WebhookDeliverer {
    pub fn new(
        timeout_seconds: u64,
        user_agent: impl Into<String>,
        scope: &'static str,
    ) -> Result<Self, DeliveryError> {
        let user_agent = user_agent.into();
        let executor = HttpExecutor::new(timeout_seconds, &user_agent)?;
        Ok(Self {
            executor,
            user_agent,
            scope,
        })
    }

    /// Same transport, different metric scope
    pub fn with_scope(&self, scope: &'static str) -> Self {
        Self {
            executor: self.executor.clone(),
            user_agent: self.user_agent.clone(),
            scope,
        }
    }

    /// Build the signed request for one attempt
    pub fn build_request(
        &self,
        target: &DeliveryTarget,
        payload: &WebhookPayload,
        attempt: u32,
    ) -> Result<OutboundRequest, DeliveryError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| DeliveryError::InvalidRequest(format!("Unserializable payload: {}", e)))?;
        let signature = sign_payload(&body, &target.secret)
            .map_err(|e| DeliveryError::InvalidRequest(e.to_string()))?;

        let mut request = OutboundRequest::new(HttpMethod::Post, target.url.clone());

        let mut custom: Vec<(&String, &String)> = target.headers.iter().collect();
        custom.sort();
        for (name, value) in custom {
            if is_reserved_header(name) {
                debug!(header = %name, "Ignoring reserved webhook header");
                continue;
            }
            request = request.header(name.clone(), value.clone());
        }

        Ok(request
            .header("Content-Type", "application/json")
            .header("User-Agent", self.user_agent.clone())
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, payload.event.clone())
            .header(TIMESTAMP_HEADER, payload.timestamp.to_rfc3339())
            .header(ATTEMPT_HEADER, attempt.to_string())
            .body(body))
    }

    /// Deliver a payload once
    #[tracing::instrument(skip(self, target, payload), fields(url = %target.url, event = %payload.event))]
    pub async fn deliver(
        &self,
        target: &DeliveryTarget,
        payload: &WebhookPayload,
        attempt: u32,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let started = Instant::now();
        let result = match self.build_request(target, payload, attempt) {
            Ok(request) => self.executor.send(request).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => {
                telemetry::record_webhook_delivery(self.scope, "success");
                Ok(DeliveryReceipt {
                    status: response.status,
                    attempt,
                    duration_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(e) => {
                let outcome = match &e {
                    DeliveryError::Transient { .. } => "transient",
                    DeliveryError::Terminal { .. } => "terminal",
                    DeliveryError::InvalidRequest(_) => "invalid",
                };
                telemetry::record_webhook_delivery(self.scope, outcome);
                Err(e)
            }
        }
    }
}

/// Deliver with retry and exponential backoff
///
/// The guard is consulted before every attempt so that a deleted or
/// deactivated target stops receiving retries. Retry configuration is read
/// from the freshest target. Terminal failures are never retried. Callers
/// spawn this so the triggering task is not blocked.
pub async fn deliver_with_retry(
    deliverer: &WebhookDeliverer,
    guard: &dyn DeliveryGuard,
    payload: &WebhookPayload,
) -> DeliveryReport {
    let mut attempt: u32 = 1;

    loop {
        let Some(target) = guard.current_target().await else {
            info!(
                event = %payload.event,
                attempts = attempt - 1,
                "Webhook target gone or inactive, cancelling delivery"
            );
            return DeliveryReport::Cancelled {
                attempts: attempt - 1,
            };
        };

        match deliverer.deliver(&target, payload, attempt).await {
            Ok(receipt) => {
                info!(
                    url = %target.url,
                    event = %payload.event,
                    attempt = attempt,
                    status = receipt.status,
                    "Webhook delivered"
                );
                guard.on_success(&receipt).await;
                return DeliveryReport::Delivered(receipt);
            }
            Err(error) => {
                guard.on_failure(&error, attempt).await;

                let strategy = ExponentialBackoff::from(&target.retry_config);
                let delay: Option<Duration> = if error.is_retryable() {
                    strategy.next_delay(attempt)
                } else {
                    None
                };

                match delay {
                    Some(delay) => {
                        warn!(
                            url = %target.url,
                            event = %payload.event,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Webhook delivery failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        warn!(
                            url = %target.url,
                            event = %payload.event,
                            attempts = attempt,
                            error = %error,
                            "Webhook delivery failed permanently"
                        );
                        return DeliveryReport::Failed {
                            attempts: attempt,
                            error,
                        };
                    }
                }
            }
        }
    }
}
