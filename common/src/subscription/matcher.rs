// Subscription matching rules

use crate::models::{LifecycleEvent, Subscription, SubscriptionFilters};

/// Whether `subscription` should fire for `event`
///
/// The subscription must be active, owned by the event's tenant and list the
/// event kind; its filters then narrow the match further.
pub fn subscription_matches(subscription: &Subscription, event: &LifecycleEvent) -> bool {
    subscription.active
        && subscription.tenant_id == event.tenant_id()
        && subscription.events.contains(&event.kind)
        && filters_match(&subscription.filters, event)
}

/// An empty dimension matches everything. Every metadata key must be
/// present on the event with an equal value.
pub fn filters_match(filters: &SubscriptionFilters, event: &LifecycleEvent) -> bool {
    let queue_ok = filters.queues.is_empty() || filters.queues.iter().any(|q| *q == event.queue);
    let status_ok = filters.statuses.is_empty() || filters.statuses.contains(&event.job_status);
    let metadata_ok = filters
        .metadata
        .iter()
        .all(|(key, expected)| event.metadata.get(key) == Some(expected));

    queue_ok && status_ok && metadata_ok
}
