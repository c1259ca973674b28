use crate::errors::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Free-form job metadata; filters compare values by exact equality
pub type Metadata = HashMap<String, serde_json::Value>;

// ============================================================================
// Job lifecycle
// ============================================================================

/// Engine-native job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Delayed,
        JobStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
            JobStatus::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError::invalid("status", format!("unknown job status '{}'", s)))
    }
}

/// Lifecycle notification kinds emitted by the queue engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Added,
    Active,
    Progress,
    Completed,
    Failed,
    Stalled,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Added,
        EventKind::Active,
        EventKind::Progress,
        EventKind::Completed,
        EventKind::Failed,
        EventKind::Stalled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Active => "active",
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Stalled => "stalled",
        }
    }

    /// Name used in the `event` field of outbound payloads
    pub fn event_name(&self) -> String {
        format!("job.{}", self.as_str())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ValidationError::invalid("event", format!("unknown event '{}'", s)))
    }
}

/// Prefix that marks a user-defined per-job webhook key
pub const CUSTOM_TRIGGER_PREFIX: &str = "custom:";

/// Key of a per-job webhook registration
///
/// Engine events are a closed set; user-defined keys must carry the
/// `custom:` prefix so a typo in a known status is rejected instead of
/// silently never firing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WebhookTrigger {
    Event(EventKind),
    Any,
    Custom(String),
}

impl WebhookTrigger {
    pub fn custom_name(&self) -> Option<&str> {
        match self {
            WebhookTrigger::Custom(name) => Some(name),
            _ => None,
        }
    }
}

impl PartialOrd for EventKind {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventKind {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl FromStr for WebhookTrigger {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(WebhookTrigger::Any);
        }
        if let Some(name) = s.strip_prefix(CUSTOM_TRIGGER_PREFIX) {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.') {
                return Err(ValidationError::invalid(
                    "webhooks",
                    format!("invalid custom webhook key '{}'", s),
                ));
            }
            return Ok(WebhookTrigger::Custom(name.to_string()));
        }
        s.parse::<EventKind>().map(WebhookTrigger::Event).map_err(|_| {
            ValidationError::invalid(
                "webhooks",
                format!(
                    "unknown webhook key '{}'; use an event name, '*' or '{}<name>'",
                    s, CUSTOM_TRIGGER_PREFIX
                ),
            )
        })
    }
}

impl TryFrom<String> for WebhookTrigger {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WebhookTrigger> for String {
    fn from(trigger: WebhookTrigger) -> Self {
        trigger.to_string()
    }
}

impl fmt::Display for WebhookTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebhookTrigger::Event(kind) => f.write_str(kind.as_str()),
            WebhookTrigger::Any => f.write_str("*"),
            WebhookTrigger::Custom(name) => write!(f, "{}{}", CUSTOM_TRIGGER_PREFIX, name),
        }
    }
}

/// Per-job webhook map: trigger key to callback URL
pub type JobWebhooks = BTreeMap<WebhookTrigger, String>;

/// Tracker data stored inside the engine job, the durable job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub tenant_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub webhooks: JobWebhooks,
    pub submitted_at: DateTime<Utc>,
}

// ============================================================================
// Tenants
// ============================================================================

/// Authenticated owner of queues, webhooks, subscriptions and schedules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default)]
    pub allowed_queues: Vec<String>,
}

impl Tenant {
    pub fn can_access_queue(&self, queue: &str) -> bool {
        self.allowed_queues.iter().any(|q| q == "*" || q == queue)
    }

    pub fn application(&self) -> Application {
        Application {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Tenant identity as exposed in outbound payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
}

// ============================================================================
// Lifecycle events and outbound payloads
// ============================================================================

/// A complete, self-describing snapshot of one job transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub application: Application,
    pub queue: String,
    pub job_id: String,
    pub kind: EventKind,
    pub job_status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn tenant_id(&self) -> &str {
        &self.application.id
    }

    pub fn to_payload(&self) -> WebhookPayload {
        WebhookPayload {
            event: self.kind.event_name(),
            timestamp: self.timestamp,
            data: PayloadData {
                job_id: Some(self.job_id.clone()),
                queue: Some(self.queue.clone()),
                status: Some(self.kind.as_str().to_string()),
                result: self.result.clone(),
                error: self.error.clone(),
                progress: self.progress,
                application: self.application.clone(),
                extra: serde_json::Map::new(),
            },
        }
    }
}

/// Outbound webhook/subscription body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub data: PayloadData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    pub application: Application,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ============================================================================
// HTTP
// ============================================================================

/// HttpMethod represents outbound HTTP request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Delete,
    Patch,
}

impl FromStr for HttpMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            other => Err(ValidationError::invalid(
                "method",
                format!("unsupported HTTP method '{}'", other),
            )),
        }
    }
}

// ============================================================================
// Tenant webhooks
// ============================================================================

/// Queue scope of a tenant webhook: `"*"` or an explicit list
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QueueFilter {
    #[default]
    All,
    Only(HashSet<String>),
}

impl QueueFilter {
    pub fn matches(&self, queue: &str) -> bool {
        match self {
            QueueFilter::All => true,
            QueueFilter::Only(queues) => queues.contains(queue),
        }
    }
}

impl Serialize for QueueFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            QueueFilter::All => serializer.serialize_str("*"),
            QueueFilter::Only(queues) => {
                let mut sorted: Vec<&String> = queues.iter().collect();
                sorted.sort();
                sorted.serialize(serializer)
            }
        }
    }
}

impl<'de> Deserialize<'de> for QueueFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Wildcard(String),
            List(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Wildcard(s) if s == "*" => Ok(QueueFilter::All),
            Raw::Wildcard(s) => Err(serde::de::Error::custom(format!(
                "expected '*' or a list of queues, got '{}'",
                s
            ))),
            Raw::List(list) if list.iter().any(|q| q == "*") => Ok(QueueFilter::All),
            Raw::List(list) => Ok(QueueFilter::Only(list.into_iter().collect())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for WebhookRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Tenant-level webhook registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: Uuid,
    pub tenant_id: String,
    pub url: String,
    pub secret: String,
    pub events: HashSet<EventKind>,
    #[serde(default)]
    pub queues: QueueFilter,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub active: bool,
    pub failure_count: u32,
    pub retry_config: WebhookRetryConfig,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    pub fn matches(&self, event: &LifecycleEvent) -> bool {
        self.active
            && self.tenant_id == event.tenant_id()
            && self.events.contains(&event.kind)
            && self.queues.matches(&event.queue)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebhook {
    pub url: String,
    /// Generated when omitted
    pub secret: Option<String>,
    pub events: Vec<String>,
    #[serde(default)]
    pub queues: QueueFilter,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub retry_config: Option<WebhookRetryConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWebhook {
    pub url: Option<String>,
    pub secret: Option<String>,
    pub events: Option<Vec<String>>,
    pub queues: Option<QueueFilter>,
    pub headers: Option<HashMap<String, String>>,
    pub active: Option<bool>,
    pub retry_config: Option<WebhookRetryConfig>,
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionFilters {
    #[serde(default)]
    pub queues: Vec<String>,
    /// Engine state of the job when the event fired, e.g. `waiting` for
    /// progress reported before a worker claimed the job
    #[serde(default)]
    pub statuses: Vec<JobStatus>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for SubscriptionRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1_000,
        }
    }
}

/// Persistent tenant-level rule matched against lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: String,
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub events: Vec<EventKind>,
    #[serde(default)]
    pub filters: SubscriptionFilters,
    pub retry_config: SubscriptionRetryConfig,
    pub active: bool,
    pub trigger_count: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscription {
    pub endpoint: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub secret: Option<String>,
    pub events: Vec<String>,
    #[serde(default)]
    pub filters: SubscriptionFilters,
    pub retry_config: Option<SubscriptionRetryConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSubscription {
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub secret: Option<Option<String>>,
    pub events: Option<Vec<String>>,
    pub filters: Option<SubscriptionFilters>,
    pub retry_config: Option<SubscriptionRetryConfig>,
    pub active: Option<bool>,
}

// ============================================================================
// Schedules
// ============================================================================

/// When a schedule fires: exactly one of `cron` / `at`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl ScheduleSpec {
    pub fn is_one_shot(&self) -> bool {
        self.at.is_some()
    }
}

pub fn default_endpoint_timeout_ms() -> u64 {
    30_000
}

/// HTTP call performed when a schedule fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEndpoint {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default = "default_endpoint_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff {
                kind: BackoffKind::Exponential,
                delay_ms: 1_000,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// Declarative cron/one-shot HTTP trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub spec: ScheduleSpec,
    pub endpoint: ScheduleEndpoint,
    pub retry_policy: RetryPolicy,
    pub enabled: bool,
    /// Opaque engine registration; only the engine can interpret it
    pub engine_handle: Option<String>,
    pub execution_count: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub last_execution_status: Option<ExecutionStatus>,
    pub last_execution_error: Option<String>,
    pub next_execution_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSchedule {
    pub name: String,
    pub spec: ScheduleSpec,
    pub endpoint: ScheduleEndpoint,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSchedule {
    pub name: Option<String>,
    pub spec: Option<ScheduleSpec>,
    pub endpoint: Option<ScheduleEndpoint>,
    pub retry_policy: Option<RetryPolicy>,
    pub enabled: Option<bool>,
}

/// Result of one schedule HTTP call including its retries
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub attempts: u32,
    pub http_status: Option<u16>,
    pub error: Option<String>,
    pub response_body: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_trigger_parsing() {
        assert_eq!(
            "completed".parse::<WebhookTrigger>().unwrap(),
            WebhookTrigger::Event(EventKind::Completed)
        );
        assert_eq!("*".parse::<WebhookTrigger>().unwrap(), WebhookTrigger::Any);
        assert_eq!(
            "custom:invoice-sent".parse::<WebhookTrigger>().unwrap(),
            WebhookTrigger::Custom("invoice-sent".to_string())
        );
        // Typos in known statuses are rejected rather than silently ignored
        assert!("complete".parse::<WebhookTrigger>().is_err());
        assert!("custom:".parse::<WebhookTrigger>().is_err());
    }

    #[test]
    fn test_job_webhooks_serialize_as_string_keys() {
        let mut hooks = JobWebhooks::new();
        hooks.insert(WebhookTrigger::Any, "https://example.com/all".to_string());
        hooks.insert(
            WebhookTrigger::Custom("done".to_string()),
            "https://example.com/custom".to_string(),
        );

        let json = serde_json::to_value(&hooks).unwrap();
        assert_eq!(json["*"], "https://example.com/all");
        assert_eq!(json["custom:done"], "https://example.com/custom");

        let back: JobWebhooks = serde_json::from_value(json).unwrap();
        assert_eq!(back, hooks);
    }

    #[test]
    fn test_queue_filter_serde() {
        let all: QueueFilter = serde_json::from_str("\"*\"").unwrap();
        assert_eq!(all, QueueFilter::All);

        let only: QueueFilter = serde_json::from_str("[\"emails\"]").unwrap();
        assert!(only.matches("emails"));
        assert!(!only.matches("sms"));

        assert_eq!(serde_json::to_string(&QueueFilter::All).unwrap(), "\"*\"");
    }

    #[test]
    fn test_tenant_queue_access() {
        let tenant = Tenant {
            id: "acme".to_string(),
            name: "Acme".to_string(),
            api_key: String::new(),
            allowed_queues: vec!["emails".to_string()],
        };
        assert!(tenant.can_access_queue("emails"));
        assert!(!tenant.can_access_queue("sms"));
    }

    #[test]
    fn test_payload_wire_format() {
        let event = LifecycleEvent {
            application: Application {
                id: "acme".to_string(),
                name: "Acme".to_string(),
            },
            queue: "emails".to_string(),
            job_id: "job-1".to_string(),
            kind: EventKind::Completed,
            job_status: JobStatus::Completed,
            progress: None,
            result: Some(serde_json::json!({"sent": true})),
            error: None,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(event.to_payload()).unwrap();
        assert_eq!(json["event"], "job.completed");
        assert_eq!(json["data"]["jobId"], "job-1");
        assert_eq!(json["data"]["status"], "completed");
        assert_eq!(json["data"]["result"]["sent"], true);
        assert_eq!(json["data"]["application"]["name"], "Acme");
        assert!(json["data"].get("error").is_none());
    }

    #[test]
    fn test_http_method_parse() {
        assert_eq!("patch".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert!("HEAD".parse::<HttpMethod>().is_err());
    }
}
