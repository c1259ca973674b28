// Schedule HTTP execution
//
// One firing of a schedule: the configured HTTP call, retried per the
// schedule's retry policy. Failures are reported in the outcome, never
// returned as errors.

use crate::executor::{HttpExecutor, OutboundRequest};
use crate::models::{ExecutionOutcome, ExecutionStatus, HttpMethod, RetryPolicy, ScheduleEndpoint};
use crate::retry::strategy_for_policy;
use crate::telemetry;
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

#[derive(Clone)]
pub struct ScheduleExecutor {
    http: HttpExecutor,
}

impl ScheduleExecutor {
    pub fn new(http: HttpExecutor) -> Self {
        Self { http }
    }

    /// Call `endpoint` until it answers 2xx, a 4xx ends the run or the
    /// policy's attempts are used up
    #[instrument(skip(self, endpoint, policy), fields(url = %endpoint.url, method = ?endpoint.method, attempts = policy.attempts))]
    pub async fn execute_http_call(
        &self,
        endpoint: &ScheduleEndpoint,
        policy: &RetryPolicy,
    ) -> ExecutionOutcome {
        let strategy = strategy_for_policy(policy);
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut attempt: u32 = 1;

        let (status, http_status, error, response_body) = loop {
            debug!(attempt = attempt, "Executing scheduled HTTP call");
            match self.http.send(build_request(endpoint)).await {
                Ok(response) => {
                    info!(attempt = attempt, status = response.status, "Scheduled call succeeded");
                    break (
                        ExecutionStatus::Success,
                        Some(response.status),
                        None,
                        Some(response.body),
                    );
                }
                Err(e) => {
                    let retry_delay = if e.is_retryable() {
                        strategy.next_delay(attempt)
                    } else {
                        None
                    };
                    match retry_delay {
                        Some(delay) => {
                            warn!(
                                attempt = attempt,
                                error = %e,
                                delay_ms = delay.as_millis() as u64,
                                "Scheduled call failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => {
                            warn!(attempt = attempt, error = %e, "Scheduled call failed");
                            break (ExecutionStatus::Failed, e.status(), Some(e.to_string()), None);
                        }
                    }
                }
            }
        };

        let label = match status {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        };
        telemetry::record_schedule_execution(label, clock.elapsed().as_secs_f64());

        ExecutionOutcome {
            status,
            attempts: attempt,
            http_status,
            error,
            response_body,
            started_at,
            completed_at: Utc::now(),
        }
    }
}

fn build_request(endpoint: &ScheduleEndpoint) -> OutboundRequest {
    let mut request = OutboundRequest::new(endpoint.method, endpoint.url.as_str())
        .timeout(Duration::from_millis(endpoint.timeout_ms));

    for (name, value) in &endpoint.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    if endpoint.method != HttpMethod::Get {
        if let Some(body) = &endpoint.body {
            request = request
                .header("Content-Type", "application/json")
                .body(body.to_string().into_bytes());
        }
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Backoff, BackoffKind};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn executor() -> ScheduleExecutor {
        ScheduleExecutor::new(HttpExecutor::new(5, "scheduler-test").unwrap())
    }

    fn endpoint(url: String, method: HttpMethod) -> ScheduleEndpoint {
        ScheduleEndpoint {
            url,
            method,
            headers: HashMap::new(),
            body: None,
            timeout_ms: 5_000,
        }
    }

    fn policy(attempts: u32, kind: BackoffKind, delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Backoff { kind, delay_ms },
        }
    }

    #[tokio::test]
    async fn test_success_sends_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/report"))
            .and(body_json(json!({"kind": "daily"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let mut target = endpoint(format!("{}/report", server.uri()), HttpMethod::Post);
        target.body = Some(json!({"kind": "daily"}));
        target
            .headers
            .insert("X-Source".to_string(), "scheduler".to_string());

        let outcome = executor()
            .execute_http_call(&target, &policy(3, BackoffKind::Fixed, 10))
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.http_status, Some(200));
        assert_eq!(outcome.response_body, Some(json!({"ok": true})));

        let requests = server.received_requests().await.unwrap();
        assert_eq!(
            requests[0].headers.get("x-source").unwrap().to_str().unwrap(),
            "scheduler"
        );
    }

    #[tokio::test]
    async fn test_server_errors_retry_with_growing_delays() {
        let server = MockServer::start().await;
        let seen: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        Mock::given(method("POST"))
            .respond_with(move |_: &Request| {
                recorder.lock().unwrap().push(Instant::now());
                ResponseTemplate::new(500)
            })
            .expect(3)
            .mount(&server)
            .await;

        let outcome = executor()
            .execute_http_call(
                &endpoint(server.uri(), HttpMethod::Post),
                &policy(3, BackoffKind::Exponential, 100),
            )
            .await;

        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.http_status, Some(500));
        assert!(outcome.error.is_some());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        let first_gap = seen[1] - seen[0];
        let second_gap = seen[2] - seen[1];
        assert!(first_gap >= Duration::from_millis(100));
        assert!(second_gap >= Duration::from_millis(200));
        assert!(second_gap > first_gap);
    }

    #[tokio::test]
    async fn test_client_error_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = executor()
            .execute_http_call(
                &endpoint(server.uri(), HttpMethod::Delete),
                &policy(5, BackoffKind::Fixed, 10),
            )
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.http_status, Some(404));
    }

    #[tokio::test]
    async fn test_get_never_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let mut target = endpoint(server.uri(), HttpMethod::Get);
        target.body = Some(json!({"ignored": true}));
        let outcome = executor()
            .execute_http_call(&target, &RetryPolicy::default())
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Success);

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].body.is_empty());
    }
}
