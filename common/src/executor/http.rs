// HTTP executor for outbound deliveries
// Redirects are never followed: a signed request must reach the URL it was signed for.

use crate::errors::{DeliveryError, ValidationError};
use crate::models::HttpMethod;
use reqwest::{redirect, Client, Method, Url};
use serde_json::json;
use std::time::Duration;

/// One outbound HTTP request
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: String,
    /// Applied in order; later entries win for the same name
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Overrides the client-wide timeout
    pub timeout: Option<Duration>,
}

impl OutboundRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A 2xx response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Parsed as JSON when possible, otherwise the raw text
    pub body: serde_json::Value,
}

/// HttpExecutor sends outbound requests and classifies the outcome
#[derive(Clone)]
pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    /// Create a new HttpExecutor with the specified timeout
    pub fn new(timeout_seconds: u64, user_agent: &str) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .user_agent(user_agent.to_string())
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| {
                DeliveryError::InvalidRequest(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { client })
    }

    /// Convert HttpMethod to reqwest Method
    fn convert_method(method: &HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
            HttpMethod::Patch => Method::PATCH,
        }
    }

    /// Send a request
    ///
    /// Only 2xx is success. 4xx (and unfollowed 3xx) responses are terminal;
    /// 5xx, timeouts and connection errors are transient.
    #[tracing::instrument(skip(self, request), fields(method = ?request.method, url = %request.url))]
    pub async fn send(&self, request: OutboundRequest) -> Result<HttpResponse, DeliveryError> {
        let reqwest_method = Self::convert_method(&request.method);
        let mut builder = self.client.request(reqwest_method, request.url.as_str());

        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(body) = request.body {
            tracing::debug!("Adding request body ({} bytes)", body.len());
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                DeliveryError::InvalidRequest(e.to_string())
            } else if e.is_timeout() {
                DeliveryError::Transient {
                    status: None,
                    reason: format!("Request timed out: {}", e),
                }
            } else {
                DeliveryError::Transient {
                    status: None,
                    reason: format!("HTTP request failed: {}", e),
                }
            }
        })?;

        let status = response.status();
        let status_code = status.as_u16();
        tracing::debug!(status = status_code, "HTTP response received");

        let response_body = response.text().await.unwrap_or_default();

        if status.is_success() {
            let body = serde_json::from_str::<serde_json::Value>(&response_body)
                .unwrap_or_else(|_| json!(response_body));
            return Ok(HttpResponse {
                status: status_code,
                body,
            });
        }

        let reason = format!(
            "HTTP {} {}: {}",
            status_code,
            status.canonical_reason().unwrap_or("Unknown"),
            truncate(&response_body, 512)
        );

        if status.is_server_error() {
            Err(DeliveryError::Transient {
                status: Some(status_code),
                reason,
            })
        } else {
            Err(DeliveryError::Terminal {
                status: status_code,
                reason,
            })
        }
    }
}

/// Require an absolute http(s) URL with a host
pub fn validate_http_url(field: &str, url: &str) -> Result<(), ValidationError> {
    let parsed =
        Url::parse(url).map_err(|e| ValidationError::invalid(field, format!("invalid URL: {}", e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::invalid(
            field,
            format!("unsupported URL scheme '{}'", parsed.scheme()),
        ));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::invalid(field, "URL must include a host"));
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
