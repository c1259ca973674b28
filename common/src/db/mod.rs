// Persistence for webhook, subscription and schedule definitions

pub mod redis;
pub mod repositories;

pub use redis::RedisPool;
pub use repositories::{
    InMemoryScheduleRepository, InMemorySubscriptionRepository, InMemoryWebhookRepository,
    RedisScheduleRepository, RedisSubscriptionRepository, RedisWebhookRepository,
    ScheduleRepository, SubscriptionRepository, WebhookRepository,
};
