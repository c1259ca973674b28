// Scheduler engine
//
// Turns schedule definitions into queue engine registrations (a native
// repeatable for cron, a delayed job for one-shots) and performs the HTTP
// call when one fires.

use super::executor::ScheduleExecutor;
use crate::config::SchedulerConfig;
use crate::db::ScheduleRepository;
use crate::errors::{CoreError, StorageError, ValidationError};
use crate::executor::validate_http_url;
use crate::models::{
    CreateSchedule, ExecutionOutcome, RetryPolicy, Schedule, ScheduleEndpoint, Tenant,
    UpdateSchedule,
};
use crate::queue::{EngineJob, JobHandler, JobOptions, QueueAdapter, RepeatOptions};
use crate::schedule::{normalize_cron_expression, parse_timezone, validate_spec, ScheduleTrigger};
use crate::tenant::TenantDirectory;
use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use futures::FutureExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Lifecycle of the scheduler worker
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register the fire worker and re-arm persisted schedules
    async fn start(self: Arc<Self>) -> Result<usize, CoreError>;

    /// Stop acting on fires; registrations stay in place
    async fn stop(&self);
}

pub struct SchedulerEngine {
    repository: Arc<dyn ScheduleRepository>,
    tenants: Arc<dyn TenantDirectory>,
    adapter: Arc<QueueAdapter>,
    executor: ScheduleExecutor,
    queue: String,
    concurrency: usize,
    default_timezone: Tz,
    running: AtomicBool,
    /// Serializes post-fire bookkeeping with lifecycle changes so neither loses a write
    bookkeeping: Mutex<()>,
}

impl SchedulerEngine {
    pub fn new(
        repository: Arc<dyn ScheduleRepository>,
        tenants: Arc<dyn TenantDirectory>,
        adapter: Arc<QueueAdapter>,
        executor: ScheduleExecutor,
        config: &SchedulerConfig,
    ) -> Result<Self, CoreError> {
        let default_timezone = parse_timezone(Some(config.default_timezone.as_str()), chrono_tz::UTC)?;
        Ok(Self {
            repository,
            tenants,
            adapter,
            executor,
            queue: config.queue_name.clone(),
            concurrency: config.concurrency.max(1),
            default_timezone,
            running: AtomicBool::new(false),
            bookkeeping: Mutex::new(()),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    #[instrument(skip(self, tenant, request), fields(tenant_id = %tenant.id, name = %request.name))]
    pub async fn create_schedule(
        &self,
        tenant: &Tenant,
        request: CreateSchedule,
    ) -> Result<Schedule, CoreError> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::MissingField("name".to_string()).into());
        }
        validate_spec(&request.spec, self.default_timezone, Utc::now())?;
        validate_endpoint(&request.endpoint)?;
        let retry_policy = request.retry_policy.unwrap_or_default();
        validate_retry_policy(&retry_policy)?;

        if self.repository.find_by_name(&name).await?.is_some() {
            return Err(name_conflict(&name));
        }

        let now = Utc::now();
        let mut schedule = Schedule {
            id: Uuid::new_v4(),
            tenant_id: tenant.id.clone(),
            name,
            spec: request.spec,
            endpoint: request.endpoint,
            retry_policy,
            enabled: false,
            engine_handle: None,
            execution_count: 0,
            last_executed_at: None,
            last_execution_status: None,
            last_execution_error: None,
            next_execution_at: None,
            created_at: now,
            updated_at: now,
        };

        if request.enabled {
            self.arm(&mut schedule).await?;
        }
        if let Err(e) = self.repository.save(&schedule).await {
            self.disarm(&mut schedule).await;
            return Err(storage_error(e, &schedule.name));
        }

        info!(schedule_id = %schedule.id, enabled = schedule.enabled, "Schedule created");
        Ok(schedule)
    }

    /// Apply changes; an armed schedule is re-armed with the new definition
    #[instrument(skip(self, tenant, update), fields(tenant_id = %tenant.id, schedule_id = %id))]
    pub async fn update_schedule(
        &self,
        tenant: &Tenant,
        id: Uuid,
        update: UpdateSchedule,
    ) -> Result<Schedule, CoreError> {
        let _guard = self.bookkeeping.lock().await;
        let current = self.owned(tenant, id).await?;
        let mut schedule = current.clone();

        if let Some(name) = update.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(ValidationError::MissingField("name".to_string()).into());
            }
            if let Some(other) = self.repository.find_by_name(&name).await? {
                if other.id != id {
                    return Err(name_conflict(&name));
                }
            }
            schedule.name = name;
        }
        if let Some(spec) = update.spec {
            validate_spec(&spec, self.default_timezone, Utc::now())?;
            schedule.spec = spec;
            schedule.execution_count = 0;
        }
        if let Some(endpoint) = update.endpoint {
            validate_endpoint(&endpoint)?;
            schedule.endpoint = endpoint;
        }
        if let Some(policy) = update.retry_policy {
            validate_retry_policy(&policy)?;
            schedule.retry_policy = policy;
        }
        let enable = update.enabled.unwrap_or(current.enabled);

        // The handle belongs to the old definition
        self.disarm(&mut schedule).await;
        schedule.enabled = false;
        if enable {
            self.arm(&mut schedule).await?;
        }
        schedule.updated_at = Utc::now();

        if let Err(e) = self.repository.save(&schedule).await {
            self.disarm(&mut schedule).await;
            return Err(storage_error(e, &schedule.name));
        }
        info!(enabled = schedule.enabled, "Schedule updated");
        Ok(schedule)
    }

    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.id, schedule_id = %id))]
    pub async fn delete_schedule(&self, tenant: &Tenant, id: Uuid) -> Result<(), CoreError> {
        let _guard = self.bookkeeping.lock().await;
        let mut schedule = self.owned(tenant, id).await?;
        self.disarm(&mut schedule).await;
        self.repository.delete(id).await?;
        info!("Schedule deleted");
        Ok(())
    }

    pub async fn enable_schedule(&self, tenant: &Tenant, id: Uuid) -> Result<Schedule, CoreError> {
        let _guard = self.bookkeeping.lock().await;
        let mut schedule = self.owned(tenant, id).await?;
        if schedule.enabled {
            return Ok(schedule);
        }
        self.arm(&mut schedule).await?;
        schedule.updated_at = Utc::now();
        self.repository.save(&schedule).await?;
        info!(schedule_id = %id, next = ?schedule.next_execution_at, "Schedule enabled");
        Ok(schedule)
    }

    pub async fn disable_schedule(&self, tenant: &Tenant, id: Uuid) -> Result<Schedule, CoreError> {
        let _guard = self.bookkeeping.lock().await;
        let mut schedule = self.owned(tenant, id).await?;
        self.disarm(&mut schedule).await;
        schedule.enabled = false;
        schedule.updated_at = Utc::now();
        self.repository.save(&schedule).await?;
        info!(schedule_id = %id, "Schedule disabled");
        Ok(schedule)
    }

    pub async fn get_schedule(&self, tenant: &Tenant, id: Uuid) -> Result<Schedule, CoreError> {
        self.owned(tenant, id).await
    }

    /// The tenant's schedules; the master tenant sees all of them
    pub async fn list_schedules(&self, tenant: &Tenant) -> Result<Vec<Schedule>, CoreError> {
        let mut schedules = if self.tenants.is_master(&tenant.id) {
            self.repository.list_all().await?
        } else {
            self.repository.list_by_tenant(&tenant.id).await?
        };
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schedules)
    }

    /// Run the schedule's call once, outside its timing and counters
    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.id, schedule_id = %id))]
    pub async fn execute_now(&self, tenant: &Tenant, id: Uuid) -> Result<ExecutionOutcome, CoreError> {
        let schedule = self.owned(tenant, id).await?;
        Ok(self
            .executor
            .execute_http_call(&schedule.endpoint, &schedule.retry_policy)
            .await)
    }

    /// One engine fire of schedule `id`
    ///
    /// A fire for a schedule that is gone or disabled does nothing.
    #[instrument(skip(self), fields(schedule_id = %id))]
    pub async fn handle_fire(&self, id: Uuid) -> Result<Option<ExecutionOutcome>, CoreError> {
        let Some(schedule) = self.repository.find(id).await? else {
            debug!("Fire for a deleted schedule ignored");
            return Ok(None);
        };
        if !schedule.enabled {
            debug!("Fire for a disabled schedule ignored");
            return Ok(None);
        }

        let outcome = self
            .executor
            .execute_http_call(&schedule.endpoint, &schedule.retry_policy)
            .await;

        let _guard = self.bookkeeping.lock().await;
        let Some(mut schedule) = self.repository.find(id).await? else {
            return Ok(Some(outcome));
        };

        schedule.last_executed_at = Some(outcome.started_at);
        schedule.last_execution_status = Some(outcome.status);
        schedule.last_execution_error = outcome.error.clone();

        let now = Utc::now();
        if !schedule.enabled {
            // Disabled while the call was in flight; the fire is not counted
            schedule.updated_at = now;
            self.repository.save(&schedule).await?;
            debug!("Schedule disabled during fire, outcome recorded only");
            return Ok(Some(outcome));
        }

        schedule.execution_count += 1;
        if schedule.spec.is_complete(schedule.execution_count, now) {
            // A one-shot's handle names the job being processed right now
            if schedule.spec.is_one_shot() {
                schedule.engine_handle = None;
            } else {
                self.disarm(&mut schedule).await;
            }
            schedule.enabled = false;
            schedule.next_execution_at = None;
            info!(executions = schedule.execution_count, "Schedule finished, disabled");
        } else {
            schedule.next_execution_at = schedule.spec.next_execution_time(
                now,
                schedule.execution_count,
                self.default_timezone,
            )?;
        }
        schedule.updated_at = now;
        self.repository.save(&schedule).await?;

        Ok(Some(outcome))
    }

    /// Re-arm every enabled schedule after a restart
    ///
    /// Schedules that ran out while the process was down are disabled.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<usize, CoreError> {
        let mut restored = 0;
        for mut schedule in self.repository.list_all().await? {
            if !schedule.enabled {
                continue;
            }
            self.disarm(&mut schedule).await;
            match self.arm(&mut schedule).await {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "Schedule could not be re-armed, disabling");
                    schedule.enabled = false;
                    schedule.next_execution_at = None;
                }
            }
            self.repository.save(&schedule).await?;
        }
        info!(restored = restored, "Schedules restored");
        Ok(restored)
    }

    /// Register the schedule with the engine and mark it enabled
    async fn arm(&self, schedule: &mut Schedule) -> Result<(), CoreError> {
        // Schedules may be created before start(); the queue must exist either way
        self.adapter.register_default_queue(&self.queue).await?;

        let now = Utc::now();
        let next = schedule
            .spec
            .next_execution_time(now, schedule.execution_count, self.default_timezone)?
            .ok_or_else(|| ValidationError::invalid("spec", "schedule has no future execution"))?;

        let data = json!({ "scheduleId": schedule.id });
        let handle = match (&schedule.spec.cron, schedule.spec.at) {
            (_, Some(at)) => {
                let job_id = format!("schedule-{}-{}", schedule.id, Uuid::new_v4());
                let options = JobOptions {
                    attempts: Some(1),
                    delay: Some((at - now).to_std().unwrap_or_default()),
                    ..Default::default()
                };
                self.adapter
                    .add_job(&self.queue, &job_id, data, options)
                    .await?;
                job_id
            }
            (Some(cron), None) => {
                let repeat = RepeatOptions {
                    cron: normalize_cron_expression(cron),
                    timezone: parse_timezone(schedule.spec.timezone.as_deref(), self.default_timezone)?,
                    end_date: schedule.spec.end_date,
                    limit: schedule
                        .spec
                        .limit
                        .map(|limit| limit.saturating_sub(schedule.execution_count)),
                };
                self.adapter
                    .add_repeatable(&self.queue, &schedule.id.to_string(), data, repeat)
                    .await?
            }
            (None, None) => {
                return Err(ValidationError::MissingField("spec.cron".to_string()).into())
            }
        };

        debug!(schedule_id = %schedule.id, handle = %handle, next = %next, "Schedule armed");
        schedule.engine_handle = Some(handle);
        schedule.next_execution_at = Some(next);
        schedule.enabled = true;
        Ok(())
    }

    /// Remove the engine registration; failures are logged, not returned
    async fn disarm(&self, schedule: &mut Schedule) {
        schedule.next_execution_at = None;
        let Some(handle) = schedule.engine_handle.take() else {
            return;
        };
        let removed = if schedule.spec.is_one_shot() {
            self.adapter.remove_job(&self.queue, &handle).await
        } else {
            self.adapter.remove_repeatable(&handle).await
        };
        match removed {
            Ok(true) => debug!(schedule_id = %schedule.id, "Schedule disarmed"),
            Ok(false) => debug!(schedule_id = %schedule.id, "Engine registration already gone"),
            Err(e) => warn!(schedule_id = %schedule.id, error = %e, "Failed to remove engine registration"),
        }
    }

    async fn owned(&self, tenant: &Tenant, id: Uuid) -> Result<Schedule, CoreError> {
        let schedule = self
            .repository
            .find(id)
            .await?
            .ok_or_else(|| CoreError::not_found("Schedule", id))?;
        if schedule.tenant_id != tenant.id && !self.tenants.is_master(&tenant.id) {
            return Err(CoreError::Forbidden(
                "schedule belongs to another tenant".to_string(),
            ));
        }
        Ok(schedule)
    }

    async fn process_fire(&self, job: EngineJob) -> Result<serde_json::Value, anyhow::Error> {
        if !self.running.load(Ordering::Relaxed) {
            return Ok(serde_json::Value::Null);
        }
        let id: Uuid = job
            .data
            .get("scheduleId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("job {} carries no scheduleId", job.id))?
            .parse()?;

        match self.handle_fire(id).await? {
            Some(outcome) => Ok(serde_json::to_value(outcome)?),
            None => Ok(serde_json::Value::Null),
        }
    }
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    #[instrument(skip(self))]
    async fn start(self: Arc<Self>) -> Result<usize, CoreError> {
        self.adapter.register_default_queue(&self.queue).await?;

        let scheduler = Arc::downgrade(&self);
        let handler: JobHandler = Arc::new(move |job: EngineJob| {
            let scheduler = scheduler.clone();
            async move {
                match scheduler.upgrade() {
                    Some(scheduler) => scheduler.process_fire(job).await,
                    None => Ok(serde_json::Value::Null),
                }
            }
            .boxed()
        });

        self.running.store(true, Ordering::Relaxed);
        self.adapter
            .register_worker(&self.queue, self.concurrency, handler)
            .await?;
        info!(queue = %self.queue, concurrency = self.concurrency, "Scheduler started");

        match self.restore().await {
            Ok(restored) => Ok(restored),
            Err(e) => {
                error!(error = %e, "Failed to restore schedules");
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        info!("Scheduler stopped");
    }
}

fn validate_endpoint(endpoint: &ScheduleEndpoint) -> Result<(), ValidationError> {
    validate_http_url("endpoint.url", &endpoint.url)?;
    if endpoint.timeout_ms == 0 {
        return Err(ValidationError::invalid(
            "endpoint.timeoutMs",
            "must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_retry_policy(policy: &RetryPolicy) -> Result<(), ValidationError> {
    if policy.attempts == 0 {
        return Err(ValidationError::invalid(
            "retryPolicy.attempts",
            "must be at least 1",
        ));
    }
    Ok(())
}

fn name_conflict(name: &str) -> CoreError {
    CoreError::Conflict(format!("schedule name '{}' is already in use", name))
}

fn storage_error(err: StorageError, name: &str) -> CoreError {
    match err {
        StorageError::DuplicateKey(_) => name_conflict(name),
        other => CoreError::Storage(other),
    }
}
