// Subscription matching engine
//
// Subscriptions are persistent tenant rules: when a lifecycle event passes
// a subscription's event list and filters, its endpoint is called.

pub mod engine;
pub mod matcher;

pub use engine::{SubscriptionEngine, TriggerOutcome};
pub use matcher::{filters_match, subscription_matches};
