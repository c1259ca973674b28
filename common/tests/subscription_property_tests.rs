// Property-based tests for subscription matching

use chrono::Utc;
use common::models::{
    Application, EventKind, HttpMethod, JobStatus, LifecycleEvent, Metadata, Subscription,
    SubscriptionFilters, SubscriptionRetryConfig,
};
use common::subscription::{filters_match, subscription_matches};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

fn event(tenant: &str, queue: &str, kind: EventKind, metadata: Metadata) -> LifecycleEvent {
    LifecycleEvent {
        application: Application {
            id: tenant.to_string(),
            name: tenant.to_string(),
        },
        queue: queue.to_string(),
        job_id: Uuid::new_v4().to_string(),
        kind,
        job_status: JobStatus::Completed,
        progress: None,
        result: None,
        error: None,
        metadata,
        timestamp: Utc::now(),
    }
}

fn subscription(tenant: &str, events: Vec<EventKind>, filters: SubscriptionFilters) -> Subscription {
    let now = Utc::now();
    Subscription {
        id: Uuid::new_v4(),
        tenant_id: tenant.to_string(),
        endpoint: "https://example.com/hook".to_string(),
        method: HttpMethod::Post,
        headers: HashMap::new(),
        secret: None,
        events,
        filters,
        retry_config: SubscriptionRetryConfig::default(),
        active: true,
        trigger_count: 0,
        last_triggered_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn env(value: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("env".to_string(), json!(value));
    metadata
}

fn event_kind() -> impl Strategy<Value = EventKind> {
    prop::sample::select(EventKind::ALL.to_vec())
}

#[test]
fn queue_and_metadata_filters_are_conjunctive() {
    let filters = SubscriptionFilters {
        queues: vec!["q1".to_string()],
        statuses: Vec::new(),
        metadata: env("prod"),
    };

    let matching = event("acme", "q1", EventKind::Completed, env("prod"));
    let wrong_queue = event("acme", "q2", EventKind::Completed, env("prod"));
    let wrong_env = event("acme", "q1", EventKind::Completed, env("dev"));

    assert!(filters_match(&filters, &matching));
    assert!(!filters_match(&filters, &wrong_queue));
    assert!(!filters_match(&filters, &wrong_env));
}

// Empty filter dimensions match every queue, kind and metadata set.
#[test]
fn property_empty_filters_match_everything() {
    proptest!(|(
        queue in "[a-z]{1,12}",
        kind in event_kind(),
        key in "[a-z]{1,8}",
        value in "[a-z0-9]{0,8}",
    )| {
        let mut metadata = Metadata::new();
        metadata.insert(key, json!(value));
        prop_assert!(filters_match(
            &SubscriptionFilters::default(),
            &event("acme", &queue, kind, metadata)
        ));
    });
}

// A queue outside the filter never matches, whatever else lines up.
#[test]
fn property_queue_filter_excludes_other_queues() {
    proptest!(|(
        listed in proptest::collection::hash_set("[a-m]{1,6}", 1..5),
        queue in "[n-z]{1,6}",
        kind in event_kind(),
    )| {
        let filters = SubscriptionFilters {
            queues: listed.into_iter().collect(),
            ..Default::default()
        };
        prop_assert!(!filters_match(&filters, &event("acme", &queue, kind, Metadata::new())));
    });
}

// A metadata key the event does not carry is a non-match.
#[test]
fn property_missing_metadata_key_never_matches() {
    proptest!(|(
        key in "[a-z]{1,8}",
        other_key in "[A-Z]{1,8}",
        value in "[a-z0-9]{1,8}",
    )| {
        let mut wanted = Metadata::new();
        wanted.insert(key, json!(value.clone()));
        let mut carried = Metadata::new();
        carried.insert(other_key, json!(value));

        let filters = SubscriptionFilters {
            metadata: wanted,
            ..Default::default()
        };
        prop_assert!(!filters_match(&filters, &event("acme", "q1", EventKind::Completed, carried)));
    });
}

// Subscriptions only ever see their own tenant's events of listed kinds.
#[test]
fn property_subscription_scoped_to_tenant_and_events() {
    proptest!(|(
        subscribed in event_kind(),
        fired in event_kind(),
        same_tenant in any::<bool>(),
        active in any::<bool>(),
    )| {
        let mut sub = subscription("acme", vec![subscribed], SubscriptionFilters::default());
        sub.active = active;
        let tenant = if same_tenant { "acme" } else { "globex" };

        let matched = subscription_matches(&sub, &event(tenant, "q1", fired, Metadata::new()));
        prop_assert_eq!(matched, active && same_tenant && subscribed == fired);
    });
}
