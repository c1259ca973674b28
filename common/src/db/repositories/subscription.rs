use super::{HINCR_IF_EXISTS, HSET_IF_EXISTS};
use crate::db::RedisPool;
use crate::errors::StorageError;
use crate::models::Subscription;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Storage for tenant subscriptions
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn create(&self, subscription: &Subscription) -> Result<(), StorageError>;

    /// Replace the definition, keeping the trigger counters; false when gone
    async fn save(&self, subscription: &Subscription) -> Result<bool, StorageError>;

    async fn delete(&self, id: Uuid) -> Result<bool, StorageError>;

    async fn find(&self, id: Uuid) -> Result<Option<Subscription>, StorageError>;

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Subscription>, StorageError>;

    /// Count one successful trigger; false when the subscription is gone
    async fn record_trigger(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StorageError>;
}

#[derive(Default)]
pub struct InMemorySubscriptionRepository {
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
}

impl InMemorySubscriptionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    async fn create(&self, subscription: &Subscription) -> Result<(), StorageError> {
        self.subscriptions
            .write()
            .await
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn save(&self, subscription: &Subscription) -> Result<bool, StorageError> {
        let mut subscriptions = self.subscriptions.write().await;
        let Some(stored) = subscriptions.get_mut(&subscription.id) else {
            return Ok(false);
        };
        let trigger_count = stored.trigger_count;
        let last_triggered_at = stored.last_triggered_at;
        *stored = subscription.clone();
        stored.trigger_count = trigger_count;
        stored.last_triggered_at = last_triggered_at;
        Ok(true)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StorageError> {
        Ok(self.subscriptions.write().await.remove(&id).is_some())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Subscription>, StorageError> {
        Ok(self.subscriptions.read().await.get(&id).cloned())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Subscription>, StorageError> {
        let mut subscriptions: Vec<Subscription> = self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| s.created_at);
        Ok(subscriptions)
    }

    async fn record_trigger(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut subscriptions = self.subscriptions.write().await;
        match subscriptions.get_mut(&id) {
            Some(subscription) => {
                subscription.trigger_count += 1;
                subscription.last_triggered_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Redis-backed subscription store
///
/// Layout: hash `<prefix>:subscription:<id>` with fields `doc`, `triggers`
/// and `last_triggered`; set `<prefix>:subscriptions:tenant:<tenant>`.
#[derive(Clone)]
pub struct RedisSubscriptionRepository {
    pool: RedisPool,
}

impl RedisSubscriptionRepository {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn subscription_key(&self, id: Uuid) -> String {
        self.pool.key(&["subscription", &id.to_string()])
    }

    fn tenant_key(&self, tenant_id: &str) -> String {
        self.pool.key(&["subscriptions", "tenant", tenant_id])
    }

    fn hydrate(
        doc: String,
        triggers: Option<u64>,
        last_triggered: Option<String>,
    ) -> Result<Subscription, StorageError> {
        let mut subscription: Subscription = serde_json::from_str(&doc)?;
        if let Some(triggers) = triggers {
            subscription.trigger_count = triggers;
        }
        if let Some(at) = last_triggered.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()) {
            subscription.last_triggered_at = Some(at.with_timezone(&Utc));
        }
        Ok(subscription)
    }
}

#[async_trait]
impl SubscriptionRepository for RedisSubscriptionRepository {
    #[tracing::instrument(skip(self, subscription), fields(subscription_id = %subscription.id))]
    async fn create(&self, subscription: &Subscription) -> Result<(), StorageError> {
        let mut conn = self.pool.get_connection();
        let doc = serde_json::to_string(subscription)?;
        let key = self.subscription_key(subscription.id);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&key, "doc", doc)
            .ignore()
            .hset(&key, "triggers", subscription.trigger_count)
            .ignore();
        match subscription.last_triggered_at {
            Some(at) => pipe.hset(&key, "last_triggered", at.to_rfc3339()).ignore(),
            None => pipe.hdel(&key, "last_triggered").ignore(),
        };
        pipe.sadd(
            self.tenant_key(&subscription.tenant_id),
            subscription.id.to_string(),
        )
        .ignore();

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, subscription), fields(subscription_id = %subscription.id))]
    async fn save(&self, subscription: &Subscription) -> Result<bool, StorageError> {
        let mut conn = self.pool.get_connection();
        let doc = serde_json::to_string(subscription)?;
        let written: i64 = redis::Script::new(HSET_IF_EXISTS)
            .key(self.subscription_key(subscription.id))
            .arg("doc")
            .arg(doc)
            .invoke_async(&mut conn)
            .await?;
        Ok(written > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<bool, StorageError> {
        let Some(existing) = self.find(id).await? else {
            return Ok(false);
        };

        let mut conn = self.pool.get_connection();
        let _: () = redis::pipe()
            .atomic()
            .del(self.subscription_key(id))
            .ignore()
            .srem(self.tenant_key(&existing.tenant_id), id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(true)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Subscription>, StorageError> {
        let mut conn = self.pool.get_connection();
        let (doc, triggers, last_triggered): (Option<String>, Option<u64>, Option<String>) =
            redis::cmd("HMGET")
                .arg(self.subscription_key(id))
                .arg("doc")
                .arg("triggers")
                .arg("last_triggered")
                .query_async(&mut conn)
                .await?;

        doc.map(|doc| Self::hydrate(doc, triggers, last_triggered))
            .transpose()
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Subscription>, StorageError> {
        let mut conn = self.pool.get_connection();
        let ids: Vec<String> = conn.smembers(self.tenant_key(tenant_id)).await?;

        let mut subscriptions = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(id) = Uuid::parse_str(&id) else {
                continue;
            };
            if let Some(subscription) = self.find(id).await? {
                subscriptions.push(subscription);
            }
        }
        subscriptions.sort_by_key(|s| s.created_at);
        Ok(subscriptions)
    }

    async fn record_trigger(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut conn = self.pool.get_connection();
        let key = self.subscription_key(id);

        let count: i64 = redis::Script::new(HINCR_IF_EXISTS)
            .key(&key)
            .arg("triggers")
            .invoke_async(&mut conn)
            .await?;
        if count < 0 {
            return Ok(false);
        }

        let _: i64 = redis::Script::new(HSET_IF_EXISTS)
            .key(&key)
            .arg("last_triggered")
            .arg(at.to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Ok(true)
    }
}
