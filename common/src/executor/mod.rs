// Executor module for outbound HTTP calls
// Shared transport for webhook, subscription and schedule deliveries

pub mod http;

pub use http::{validate_http_url, HttpExecutor, HttpResponse, OutboundRequest};
