// Bootstrap utilities for binary initialization
// Builds the coordination layer from settings: storage, queue adapter and the
// services wired on top of it.

use crate::config::{Settings, StorageBackend};
use crate::db::{
    InMemoryScheduleRepository, InMemorySubscriptionRepository, InMemoryWebhookRepository,
    RedisPool, RedisScheduleRepository, RedisSubscriptionRepository, RedisWebhookRepository,
    ScheduleRepository, SubscriptionRepository, WebhookRepository,
};
use crate::executor::HttpExecutor;
use crate::queue::{MemoryQueueEngine, QueueAdapter, QueueEngine};
use crate::scheduler::{ScheduleExecutor, Scheduler, SchedulerEngine};
use crate::subscription::SubscriptionEngine;
use crate::tenant::{StaticTenantDirectory, TenantDirectory};
use crate::tracker::{JobTracker, TrackerConfig};
use crate::webhook::{WebhookDeliverer, WebhookService};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Definition stores for the configured backend
pub struct Repositories {
    pub webhooks: Arc<dyn WebhookRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub schedules: Arc<dyn ScheduleRepository>,
}

/// Every service of one process, sharing a single queue adapter
pub struct Coordinator {
    pub tenants: Arc<dyn TenantDirectory>,
    pub adapter: Arc<QueueAdapter>,
    pub tracker: Arc<JobTracker>,
    pub webhooks: WebhookService,
    pub subscriptions: SubscriptionEngine,
    pub scheduler: Arc<SchedulerEngine>,
}

/// Initialize the Redis pool backing definition storage
///
/// # Errors
/// Returns error if the Redis client cannot be created or the first
/// connection fails
#[tracing::instrument(skip(settings))]
pub async fn init_redis_pool(settings: &Settings) -> Result<RedisPool> {
    info!("Initializing Redis pool");

    let redis_pool = RedisPool::new(&settings.redis)
        .await
        .context("Failed to initialize Redis pool")?;
    redis_pool
        .health_check()
        .await
        .context("Redis health check failed")?;

    info!("Redis pool initialized");
    Ok(redis_pool)
}

/// Build the repositories for `storage.backend`
#[tracing::instrument(skip(settings), fields(backend = ?settings.storage.backend))]
pub async fn init_repositories(settings: &Settings) -> Result<Repositories> {
    let repositories = match settings.storage.backend {
        StorageBackend::Memory => Repositories {
            webhooks: Arc::new(InMemoryWebhookRepository::new()),
            subscriptions: Arc::new(InMemorySubscriptionRepository::new()),
            schedules: Arc::new(InMemoryScheduleRepository::new()),
        },
        StorageBackend::Redis => {
            let pool = init_redis_pool(settings).await?;
            Repositories {
                webhooks: Arc::new(RedisWebhookRepository::new(pool.clone())),
                subscriptions: Arc::new(RedisSubscriptionRepository::new(pool.clone())),
                schedules: Arc::new(RedisScheduleRepository::new(pool)),
            }
        }
    };
    info!("Repositories initialized");
    Ok(repositories)
}

/// The in-process queue engine
pub fn init_queue_engine(settings: &Settings) -> Arc<dyn QueueEngine> {
    Arc::new(MemoryQueueEngine::new(settings.queue.event_buffer))
}

/// Wire every service on top of `engine` and `repositories`
///
/// # Errors
/// Returns error if an HTTP client cannot be built or the scheduler's default
/// timezone is invalid
pub fn build_coordinator(
    settings: &Settings,
    engine: Arc<dyn QueueEngine>,
    repositories: Repositories,
) -> Result<Coordinator> {
    let tenants: Arc<dyn TenantDirectory> =
        Arc::new(StaticTenantDirectory::from_config(&settings.tenancy));
    let adapter = Arc::new(QueueAdapter::new(engine, settings.queue.clone()));

    let deliverer = WebhookDeliverer::new(
        settings.webhooks.timeout_seconds,
        settings.webhooks.user_agent.as_str(),
        "tenant",
    )
    .context("Failed to create webhook HTTP client")?;
    let webhooks = WebhookService::new(
        repositories.webhooks,
        Arc::clone(&tenants),
        deliverer.clone(),
    );

    let subscription_http = HttpExecutor::new(
        settings.subscriptions.timeout_seconds,
        &settings.webhooks.user_agent,
    )
    .context("Failed to create subscription HTTP client")?;
    let subscriptions = SubscriptionEngine::new(
        repositories.subscriptions,
        Arc::clone(&tenants),
        subscription_http.clone(),
    );

    let tracker = Arc::new(JobTracker::new(
        Arc::clone(&adapter),
        Arc::clone(&tenants),
        webhooks.clone(),
        subscriptions.clone(),
        deliverer.with_scope("job"),
        TrackerConfig::from_webhook_config(&settings.webhooks),
    ));

    let scheduler = SchedulerEngine::new(
        repositories.schedules,
        Arc::clone(&tenants),
        Arc::clone(&adapter),
        ScheduleExecutor::new(subscription_http),
        &settings.scheduler,
    )
    .context("Failed to create scheduler")?;

    info!("Coordinator built");
    Ok(Coordinator {
        tenants,
        adapter,
        tracker,
        webhooks,
        subscriptions,
        scheduler: Arc::new(scheduler),
    })
}

impl Coordinator {
    /// Start the scheduler worker and re-arm persisted schedules
    pub async fn start(&self) -> Result<usize> {
        let restored = Arc::clone(&self.scheduler)
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!(restored = restored, "Coordinator started");
        Ok(restored)
    }

    /// Stop the scheduler, then the adapter's workers, listeners and engine
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.stop().await;
        self.adapter
            .shutdown()
            .await
            .context("Failed to shut down queue adapter")?;
        info!("Coordinator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tenant;
    use crate::tracker::SubmitOptions;
    use serde_json::json;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.tenancy.tenants = vec![Tenant {
            id: "acme".to_string(),
            name: "Acme".to_string(),
            api_key: "acme-key".to_string(),
            allowed_queues: vec!["*".to_string()],
        }];
        settings
    }

    #[tokio::test]
    async fn test_memory_coordinator_round_trip() {
        let settings = settings();
        let repositories = init_repositories(&settings).await.unwrap();
        let coordinator =
            build_coordinator(&settings, init_queue_engine(&settings), repositories).unwrap();
        assert_eq!(coordinator.start().await.unwrap(), 0);

        let tenant = coordinator
            .tenants
            .resolve_api_key("acme-key")
            .await
            .unwrap();
        let submitted = coordinator
            .tracker
            .submit_job(&tenant, "emails", json!({}), SubmitOptions::default())
            .await
            .unwrap();
        assert!(coordinator
            .adapter
            .is_registered(&settings.scheduler.queue_name)
            .await);
        assert!(coordinator
            .tracker
            .get_job_status(&tenant, &submitted.job_id)
            .await
            .is_ok());

        coordinator.shutdown().await.unwrap();
        // A second shutdown is a no-op
        coordinator.shutdown().await.unwrap();
    }
}
