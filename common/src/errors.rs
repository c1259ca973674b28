// Error handling framework for the coordination layer

use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid schedule configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No next execution time available for {schedule_type} schedule")]
    NoNextExecution { schedule_type: String },
}

/// Validation errors raised synchronously on bad input; never retried
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidFieldValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Storage errors for the webhook/subscription/schedule stores
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Redis error: {0}")]
    RedisError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
}

/// Queue engine errors
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Failed to connect to queue engine: {0}")]
    Connection(String),

    #[error("Queue not registered: {0}")]
    QueueNotFound(String),

    #[error("Job not found: {queue}/{job_id}")]
    JobNotFound { queue: String, job_id: String },

    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),

    #[error("Invalid state transition for job {job_id}: {reason}")]
    InvalidTransition { job_id: String, reason: String },

    #[error("Repeatable job registration failed: {0}")]
    Repeatable(String),

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Queue engine closed")]
    Closed,
}

/// Outcome of a failed outbound delivery (webhook, subscription, schedule)
///
/// Delivery runs asynchronously, so these are recorded and logged rather
/// than surfaced to the caller that triggered the event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    /// Network error, timeout or 5xx; retried per policy
    #[error("Transient delivery failure{}: {reason}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transient { status: Option<u16>, reason: String },

    /// 4xx response; recorded and never retried
    #[error("Terminal delivery failure (HTTP {status}): {reason}")]
    Terminal { status: u16, reason: String },

    /// The request could not be built (bad URL, header or signing key)
    #[error("Invalid delivery request: {0}")]
    InvalidRequest(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Transient { status, .. } => *status,
            DeliveryError::Terminal { status, .. } => Some(*status),
            DeliveryError::InvalidRequest(_) => None,
        }
    }
}

/// Errors returned by the management surface (CRUD, submit, schedule ops)
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<ScheduleError> for CoreError {
    fn from(err: ScheduleError) -> Self {
        CoreError::Validation(ValidationError::Schedule(err))
    }
}

/// Job tracker errors
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Enqueue failed after the id was assigned; the id stays valid as a handle
    #[error("Failed to enqueue job {job_id}: {source}")]
    EnqueueFailed {
        job_id: String,
        #[source]
        source: QueueError,
    },
}

impl From<ValidationError> for TrackerError {
    fn from(err: ValidationError) -> Self {
        TrackerError::Core(CoreError::Validation(err))
    }
}

impl From<QueueError> for TrackerError {
    fn from(err: QueueError) -> Self {
        TrackerError::Core(CoreError::Queue(err))
    }
}

/// API response error type for the HTTP layer
#[derive(Debug, serde::Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::new("VALIDATION_ERROR", err.to_string())
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let code = match &err {
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::Forbidden(_) => "FORBIDDEN",
            CoreError::Queue(_) => "QUEUE_ERROR",
            CoreError::Storage(_) => "STORAGE_ERROR",
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::Core(core) => core.into(),
            TrackerError::EnqueueFailed { job_id, source } => {
                ApiError::new("QUEUE_ERROR", format!("Failed to enqueue job: {}", source))
                    .with_details(serde_json::json!({ "jobId": job_id }))
            }
        }
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::RedisError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::InvalidJson(err.to_string())
    }
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        ValidationError::InvalidJson(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidCronExpression {
            expression: "* * * *".to_string(),
            reason: "invalid format".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron expression"));
    }

    #[test]
    fn test_delivery_error_retryable() {
        let transient = DeliveryError::Transient {
            status: Some(503),
            reason: "unavailable".to_string(),
        };
        let terminal = DeliveryError::Terminal {
            status: 404,
            reason: "not found".to_string(),
        };
        assert!(transient.is_retryable());
        assert!(!terminal.is_retryable());
        assert_eq!(terminal.status(), Some(404));
        assert!(transient.to_string().contains("HTTP 503"));
    }

    #[test]
    fn test_core_error_to_api_error() {
        let api_err: ApiError = CoreError::not_found("Webhook", "abc").into();
        assert_eq!(api_err.code, "NOT_FOUND");

        let api_err: ApiError = CoreError::Conflict("name taken".to_string()).into();
        assert_eq!(api_err.code, "CONFLICT");
    }

    #[test]
    fn test_enqueue_failure_keeps_job_id() {
        let err = TrackerError::EnqueueFailed {
            job_id: "job-1".to_string(),
            source: QueueError::Closed,
        };
        let api_err: ApiError = err.into();
        assert_eq!(api_err.code, "QUEUE_ERROR");
        assert_eq!(api_err.details.unwrap()["jobId"], "job-1");
    }

    #[test]
    fn test_api_error_with_details() {
        let err = ApiError::new("TEST_ERROR", "Test message")
            .with_details(serde_json::json!({"field": "value"}));
        assert!(err.details.is_some());
    }
}
