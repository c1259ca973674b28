use super::{HINCR_IF_EXISTS, HSET_IF_EXISTS};
use crate::db::RedisPool;
use crate::errors::StorageError;
use crate::models::Webhook;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Storage for tenant-level webhook registrations
#[async_trait]
pub trait WebhookRepository: Send + Sync {
    /// Store a new webhook together with its counters
    async fn create(&self, webhook: &Webhook) -> Result<(), StorageError>;

    /// Replace the definition of an existing webhook
    ///
    /// The failure counter and last delivery time are left alone. Returns
    /// false, writing nothing, when the webhook is gone.
    async fn save(&self, webhook: &Webhook) -> Result<bool, StorageError>;

    /// Zero the failure counter; false when the webhook is gone
    async fn reset_failures(&self, id: Uuid) -> Result<bool, StorageError>;

    /// Returns false when the webhook did not exist
    async fn delete(&self, id: Uuid) -> Result<bool, StorageError>;

    async fn find(&self, id: Uuid) -> Result<Option<Webhook>, StorageError>;

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Webhook>, StorageError>;

    /// Atomically count one failed attempt; None when the webhook is gone
    async fn increment_failures(&self, id: Uuid) -> Result<Option<u32>, StorageError>;

    /// Record a successful delivery time; no-op when the webhook is gone
    async fn touch_triggered(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StorageError>;
}

/// Process-local webhook store
#[derive(Default)]
pub struct InMemoryWebhookRepository {
    webhooks: RwLock<HashMap<Uuid, Webhook>>,
}

impl InMemoryWebhookRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookRepository for InMemoryWebhookRepository {
    async fn create(&self, webhook: &Webhook) -> Result<(), StorageError> {
        self.webhooks
            .write()
            .await
            .insert(webhook.id, webhook.clone());
        Ok(())
    }

    async fn save(&self, webhook: &Webhook) -> Result<bool, StorageError> {
        let mut webhooks = self.webhooks.write().await;
        let Some(stored) = webhooks.get_mut(&webhook.id) else {
            return Ok(false);
        };
        let failure_count = stored.failure_count;
        let last_triggered_at = stored.last_triggered_at;
        *stored = webhook.clone();
        stored.failure_count = failure_count;
        stored.last_triggered_at = last_triggered_at;
        Ok(true)
    }

    async fn reset_failures(&self, id: Uuid) -> Result<bool, StorageError> {
        Ok(match self.webhooks.write().await.get_mut(&id) {
            Some(webhook) => {
                webhook.failure_count = 0;
                true
            }
            None => false,
        })
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StorageError> {
        Ok(self.webhooks.write().await.remove(&id).is_some())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Webhook>, StorageError> {
        Ok(self.webhooks.read().await.get(&id).cloned())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Webhook>, StorageError> {
        let mut webhooks: Vec<Webhook> = self
            .webhooks
            .read()
            .await
            .values()
            .filter(|w| w.tenant_id == tenant_id)
            .cloned()
            .collect();
        webhooks.sort_by_key(|w| w.created_at);
        Ok(webhooks)
    }

    async fn increment_failures(&self, id: Uuid) -> Result<Option<u32>, StorageError> {
        let mut webhooks = self.webhooks.write().await;
        Ok(webhooks.get_mut(&id).map(|w| {
            w.failure_count += 1;
            w.failure_count
        }))
    }

    async fn touch_triggered(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StorageError> {
        if let Some(webhook) = self.webhooks.write().await.get_mut(&id) {
            webhook.last_triggered_at = Some(at);
        }
        Ok(())
    }
}

/// Redis-backed webhook store
///
/// Layout: hash `<prefix>:webhook:<id>` with fields `doc` (JSON),
/// `failures` and `last_triggered`; set `<prefix>:webhooks:tenant:<tenant>`
/// indexes ids per tenant.
#[derive(Clone)]
pub struct RedisWebhookRepository {
    pool: RedisPool,
}

impl RedisWebhookRepository {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn webhook_key(&self, id: Uuid) -> String {
        self.pool.key(&["webhook", &id.to_string()])
    }

    fn tenant_key(&self, tenant_id: &str) -> String {
        self.pool.key(&["webhooks", "tenant", tenant_id])
    }

    fn hydrate(
        doc: String,
        failures: Option<u32>,
        last_triggered: Option<String>,
    ) -> Result<Webhook, StorageError> {
        let mut webhook: Webhook = serde_json::from_str(&doc)?;
        if let Some(failures) = failures {
            webhook.failure_count = failures;
        }
        if let Some(at) = last_triggered.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()) {
            webhook.last_triggered_at = Some(at.with_timezone(&Utc));
        }
        Ok(webhook)
    }
}

#[async_trait]
impl WebhookRepository for RedisWebhookRepository {
    #[tracing::instrument(skip(self, webhook), fields(webhook_id = %webhook.id))]
    async fn create(&self, webhook: &Webhook) -> Result<(), StorageError> {
        let mut conn = self.pool.get_connection();
        let doc = serde_json::to_string(webhook)?;
        let key = self.webhook_key(webhook.id);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&key, "doc", doc)
            .ignore()
            .hset(&key, "failures", webhook.failure_count)
            .ignore();
        match webhook.last_triggered_at {
            Some(at) => pipe.hset(&key, "last_triggered", at.to_rfc3339()).ignore(),
            None => pipe.hdel(&key, "last_triggered").ignore(),
        };
        pipe.sadd(self.tenant_key(&webhook.tenant_id), webhook.id.to_string())
            .ignore();

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, webhook), fields(webhook_id = %webhook.id))]
    async fn save(&self, webhook: &Webhook) -> Result<bool, StorageError> {
        let mut conn = self.pool.get_connection();
        let doc = serde_json::to_string(webhook)?;
        let written: i64 = redis::Script::new(HSET_IF_EXISTS)
            .key(self.webhook_key(webhook.id))
            .arg("doc")
            .arg(doc)
            .invoke_async(&mut conn)
            .await?;
        Ok(written > 0)
    }

    async fn reset_failures(&self, id: Uuid) -> Result<bool, StorageError> {
        let mut conn = self.pool.get_connection();
        let written: i64 = redis::Script::new(HSET_IF_EXISTS)
            .key(self.webhook_key(id))
            .arg("failures")
            .arg(0)
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
            .del(self.webhook_key(id))
            .ignore()
            .srem(self.tenant_key(&existing.tenant_id), id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(true)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Webhook>, StorageError> {
        let mut conn = self.pool.get_connection();
        let (doc, failures, last_triggered): (Option<String>, Option<u32>, Option<String>) =
            redis::cmd("HMGET")
                .arg(self.webhook_key(id))
                .arg("doc")
                .arg("failures")
                .arg("last_triggered")
                .query_async(&mut conn)
                .await?;

        doc.map(|doc| Self::hydrate(doc, failures, last_triggered))
            .transpose()
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Webhook>, StorageError> {
        let mut conn = self.pool.get_connection();
        let ids: Vec<String> = conn.smembers(self.tenant_key(tenant_id)).await?;

        let mut webhooks = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(id) = Uuid::parse_str(&id) else {
                continue;
            };
            if let Some(webhook) = self.find(id).await? {
                webhooks.push(webhook);
            }
        }
        webhooks.sort_by_key(|w| w.created_at);
        Ok(webhooks)
    }

    async fn increment_failures(&self, id: Uuid) -> Result<Option<u32>, StorageError> {
        let mut conn = self.pool.get_connection();
        let count: i64 = redis::Script::new(HINCR_IF_EXISTS)
            .key(self.webhook_key(id))
            .arg("failures")
            .invoke_async(&mut conn)
            .await?;

        Ok(u32::try_from(count).ok())
    }

    async fn touch_triggered(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StorageError> {
        let mut conn = self.pool.get_connection();
        let _: i64 = redis::Script::new(HSET_IF_EXISTS)
            .key(self.webhook_key(id))
            .arg("last_triggered")
            .arg(at.to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
