// Repository layer
//
// Each entity has one trait with an in-memory and a Redis implementation.
// Counters that are bumped concurrently by deliveries (webhook failures,
// subscription triggers) are stored beside the document and updated
// atomically so they never lose increments to a document rewrite.

pub mod schedule;
pub mod subscription;
pub mod webhook;

pub use schedule::{InMemoryScheduleRepository, RedisScheduleRepository, ScheduleRepository};
pub use subscription::{
    InMemorySubscriptionRepository, RedisSubscriptionRepository, SubscriptionRepository,
};
pub use webhook::{InMemoryWebhookRepository, RedisWebhookRepository, WebhookRepository};

/// Set a hash field only when the hash exists; returns -1 when it does not
pub(crate) const HSET_IF_EXISTS: &str = r#"
    if redis.call("exists", KEYS[1]) == 1 then
        redis.call("hset", KEYS[1], ARGV[1], ARGV[2])
        return 1
    else
        return -1
    end
"#;

/// Increment a hash field only when the hash exists; returns -1 when it does not
pub(crate) const HINCR_IF_EXISTS: &str = r#"
    if redis.call("exists", KEYS[1]) == 1 then
        return redis.call("hincrby", KEYS[1], ARGV[1], 1)
    else
        return -1
    end
"#;
