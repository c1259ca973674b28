// Integration tests for the job-queue coordinator
// End-to-end flows through a coordinator built exactly as the binary builds
// it, on the in-process queue engine and in-memory stores.

use chrono::Utc;
use common::bootstrap::{build_coordinator, init_queue_engine, init_repositories, Coordinator};
use common::config::Settings;
use common::models::{
    CreateSubscription, CreateWebhook, JobStatus, QueueFilter, SubscriptionFilters, Tenant,
};
use common::queue::{EngineEvent, EngineJob, JobHandler};
use common::tracker::{JobListFilter, JobUpdate, SubmitOptions};
use futures::FutureExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn tenant(id: &str, queues: &[&str]) -> Tenant {
    Tenant {
        id: id.to_string(),
        name: format!("{} Inc", id),
        api_key: format!("{}-key", id),
        allowed_queues: queues.iter().map(|q| q.to_string()).collect(),
    }
}

/// Coordinator with tenants `acme`, `other-tenant` and master `root`
async fn setup() -> Coordinator {
    let mut settings = Settings::default();
    settings.tenancy.master_tenant_id = Some("root".to_string());
    settings.tenancy.tenants = vec![
        tenant("acme", &["emails", "sms"]),
        tenant("other-tenant", &["*"]),
        tenant("root", &["*"]),
    ];
    settings.webhooks.job_signing_secret = "integration-secret".to_string();

    let repositories = init_repositories(&settings)
        .await
        .expect("Failed to build repositories");
    let coordinator = build_coordinator(&settings, init_queue_engine(&settings), repositories)
        .expect("Failed to build coordinator");
    coordinator.start().await.expect("Failed to start coordinator");
    coordinator
}

async fn resolve(coordinator: &Coordinator, id: &str) -> Tenant {
    coordinator
        .tenants
        .get(id)
        .await
        .unwrap_or_else(|| panic!("unknown tenant {}", id))
}

/// Wait until `server` has seen `count` requests, then a little longer so
/// any extra request would show up too
async fn settled_requests(server: &MockServer, count: usize) -> Vec<Request> {
    for _ in 0..200 {
        let requests = server.received_requests().await.unwrap_or_default();
        if requests.len() >= count {
            sleep(Duration::from_millis(100)).await;
            return server.received_requests().await.unwrap_or_default();
        }
        sleep(Duration::from_millis(10)).await;
    }
    server.received_requests().await.unwrap_or_default()
}

fn completed(job_id: &str, result: serde_json::Value) -> JobUpdate {
    JobUpdate {
        job_id: job_id.to_string(),
        status: "completed".to_string(),
        result: Some(result),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_status_right_after_submit_is_pending() {
    let coordinator = setup().await;
    let acme = resolve(&coordinator, "acme").await;

    for _ in 0..5 {
        let submitted = coordinator
            .tracker
            .submit_job(&acme, "emails", json!({"to": "a@example.com"}), SubmitOptions::default())
            .await
            .unwrap();
        let view = coordinator
            .tracker
            .get_job_status(&acme, &submitted.job_id)
            .await
            .unwrap();
        assert!(
            matches!(view.status, JobStatus::Waiting | JobStatus::Active),
            "unexpected status {:?}",
            view.status
        );
    }

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_email_job_lifecycle_and_tenant_isolation() {
    let coordinator = setup().await;
    let acme = resolve(&coordinator, "acme").await;
    let other = resolve(&coordinator, "other-tenant").await;

    let mut options = SubmitOptions::default();
    options.metadata.insert("tenant".to_string(), json!("acme"));
    let submitted = coordinator
        .tracker
        .submit_job(&acme, "emails", json!({"to": "a@example.com"}), options)
        .await
        .unwrap();

    let handler: JobHandler =
        Arc::new(|_job: EngineJob| async move { Ok::<_, anyhow::Error>(json!({"sent": true})) }.boxed());
    coordinator
        .adapter
        .register_worker("emails", 1, handler)
        .await
        .unwrap();

    let mut view = None;
    for _ in 0..200 {
        let current = coordinator
            .tracker
            .get_job_status(&acme, &submitted.job_id)
            .await
            .unwrap();
        if current.status == JobStatus::Completed {
            view = Some(current);
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    let view = view.expect("job never completed");
    assert_eq!(view.result, Some(json!({"sent": true})));
    assert!(view.started_at.is_some());
    assert!(view.completed_at.is_some());

    let mut filter = JobListFilter::default();
    filter.metadata.insert("tenant".to_string(), json!("acme"));

    let mine = coordinator.tracker.list_jobs(&acme, &filter).await.unwrap();
    assert_eq!(mine.total, 1);
    assert_eq!(mine.jobs[0].id, submitted.job_id);

    let theirs = coordinator.tracker.list_jobs(&other, &filter).await.unwrap();
    assert_eq!(theirs.total, 0);
    assert!(theirs.jobs.is_empty());

    let root = resolve(&coordinator, "root").await;
    let everything = coordinator.tracker.list_jobs(&root, &filter).await.unwrap();
    assert_eq!(everything.total, 1);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_webhook_queue_filter_fires_exactly_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tenant-hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let coordinator = setup().await;
    let acme = resolve(&coordinator, "acme").await;

    coordinator
        .webhooks
        .create_webhook(
            &acme.id,
            CreateWebhook {
                url: format!("{}/tenant-hook", server.uri()),
                events: vec!["completed".to_string()],
                queues: QueueFilter::Only(["emails".to_string()].into_iter().collect()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let sms = coordinator
        .tracker
        .submit_job(&acme, "sms", json!({}), SubmitOptions::default())
        .await
        .unwrap();
    coordinator
        .tracker
        .update_job(&acme, completed(&sms.job_id, json!({"sent": true})))
        .await
        .unwrap();

    let email = coordinator
        .tracker
        .submit_job(&acme, "emails", json!({}), SubmitOptions::default())
        .await
        .unwrap();
    coordinator
        .tracker
        .update_job(&acme, completed(&email.job_id, json!({"sent": true})))
        .await
        .unwrap();

    let requests = settled_requests(&server, 1).await;
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["event"], "job.completed");
    assert_eq!(body["data"]["status"], "completed");
    assert_eq!(body["data"]["jobId"], json!(email.job_id));
    assert_eq!(body["data"]["queue"], "emails");

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_replayed_completed_event_is_idempotent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let coordinator = setup().await;
    let acme = resolve(&coordinator, "acme").await;

    let mut options = SubmitOptions::default();
    options
        .webhooks
        .insert("completed".to_string(), format!("{}/job-hook", server.uri()));
    let submitted = coordinator
        .tracker
        .submit_job(&acme, "emails", json!({}), options)
        .await
        .unwrap();
    coordinator
        .tracker
        .update_job(&acme, completed(&submitted.job_id, json!({"sent": true})))
        .await
        .unwrap();
    assert_eq!(settled_requests(&server, 1).await.len(), 1);

    let job = coordinator
        .adapter
        .get_job("emails", &submitted.job_id)
        .await
        .unwrap()
        .unwrap();
    let replay = EngineEvent {
        queue: "emails".to_string(),
        kind: common::models::EventKind::Completed,
        job,
        timestamp: Utc::now(),
    };
    for _ in 0..2 {
        let fan_outs = coordinator.tracker.handle_engine_event(replay.clone()).await;
        assert!(fan_outs.is_empty());
    }

    let view = coordinator
        .tracker
        .get_job_status(&acme, &submitted.job_id)
        .await
        .unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.result, Some(json!({"sent": true})));
    assert_eq!(settled_requests(&server, 1).await.len(), 1);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_subscription_and_job_webhook_fan_out_independently() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/job-hook"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/subscription"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let coordinator = setup().await;
    let acme = resolve(&coordinator, "acme").await;

    let mut filters = SubscriptionFilters::default();
    filters.metadata.insert("env".to_string(), json!("prod"));
    let subscription = coordinator
        .subscriptions
        .create_subscription(
            &acme.id,
            CreateSubscription {
                endpoint: format!("{}/subscription", server.uri()),
                method: Some("PUT".to_string()),
                events: vec!["failed".to_string()],
                filters,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut options = SubmitOptions::default();
    options.metadata.insert("env".to_string(), json!("prod"));
    options
        .webhooks
        .insert("failed".to_string(), format!("{}/job-hook", server.uri()));
    let submitted = coordinator
        .tracker
        .submit_job(&acme, "emails", json!({}), options)
        .await
        .unwrap();
    coordinator
        .tracker
        .update_job(
            &acme,
            JobUpdate {
                job_id: submitted.job_id.clone(),
                status: "failed".to_string(),
                error: Some("smtp unreachable".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The failing job webhook must not hold back the subscription
    let mut delivered = false;
    for _ in 0..200 {
        let current = coordinator
            .subscriptions
            .get_subscription(&acme.id, subscription.id)
            .await
            .unwrap();
        if current.trigger_count == 1 {
            delivered = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(delivered, "subscription was never triggered");

    let requests = server.received_requests().await.unwrap();
    let subscription_request = requests
        .iter()
        .find(|r| r.url.path() == "/subscription")
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&subscription_request.body).unwrap();
    assert_eq!(body["event"], "job.failed");
    assert_eq!(body["data"]["error"], "smtp unreachable");

    coordinator.shutdown().await.unwrap();
}
