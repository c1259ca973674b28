use crate::db::RedisPool;
use crate::errors::StorageError;
use crate::models::Schedule;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Storage for schedule definitions
///
/// Schedule names are unique across the store; `save` fails with
/// `StorageError::DuplicateKey` when another schedule owns the name.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    /// Insert or replace, claiming the schedule's name
    async fn save(&self, schedule: &Schedule) -> Result<(), StorageError>;

    async fn delete(&self, id: Uuid) -> Result<bool, StorageError>;

    async fn find(&self, id: Uuid) -> Result<Option<Schedule>, StorageError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<Schedule>, StorageError>;

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Schedule>, StorageError>;

    async fn list_all(&self) -> Result<Vec<Schedule>, StorageError>;
}

#[derive(Default)]
struct ScheduleTable {
    schedules: HashMap<Uuid, Schedule>,
    names: HashMap<String, Uuid>,
}

#[derive(Default)]
pub struct InMemoryScheduleRepository {
    table: RwLock<ScheduleTable>,
}

impl InMemoryScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn save(&self, schedule: &Schedule) -> Result<(), StorageError> {
        let mut table = self.table.write().await;

        if let Some(owner) = table.names.get(&schedule.name) {
            if *owner != schedule.id {
                return Err(StorageError::DuplicateKey(schedule.name.clone()));
            }
        }

        let previous_name = table
            .schedules
            .get(&schedule.id)
            .map(|existing| existing.name.clone());
        if let Some(previous) = previous_name {
            if previous != schedule.name {
                table.names.remove(&previous);
            }
        }

        table.names.insert(schedule.name.clone(), schedule.id);
        table.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StorageError> {
        let mut table = self.table.write().await;
        match table.schedules.remove(&id) {
            Some(schedule) => {
                table.names.remove(&schedule.name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find(&self, id: Uuid) -> Result<Option<Schedule>, StorageError> {
        Ok(self.table.read().await.schedules.get(&id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Schedule>, StorageError> {
        let table = self.table.read().await;
        Ok(table
            .names
            .get(name)
            .and_then(|id| table.schedules.get(id))
            .cloned())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Schedule>, StorageError> {
        let mut schedules: Vec<Schedule> = self
            .table
            .read()
            .await
            .schedules
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }

    async fn list_all(&self) -> Result<Vec<Schedule>, StorageError> {
        let mut schedules: Vec<Schedule> =
            self.table.read().await.schedules.values().cloned().collect();
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }
}

/// Claim the name, release a previous name, store the document and index it.
/// KEYS: schedule hash, names hash, all-ids set, tenant set.
/// ARGV: id, name, doc. Returns 0 when the name belongs to another id.
const UPSERT_SCHEDULE: &str = r#"
    local owner = redis.call("hget", KEYS[2], ARGV[2])
    if owner and owner ~= ARGV[1] then
        return 0
    end
    local previous = redis.call("hget", KEYS[1], "name")
    if previous and previous ~= ARGV[2] then
        redis.call("hdel", KEYS[2], previous)
    end
    redis.call("hset", KEYS[2], ARGV[2], ARGV[1])
    redis.call("hset", KEYS[1], "doc", ARGV[3], "name", ARGV[2])
    redis.call("sadd", KEYS[3], ARGV[1])
    redis.call("sadd", KEYS[4], ARGV[1])
    return 1
"#;

/// Redis-backed schedule store
///
/// Layout: hash `<prefix>:schedule:<id>` (`doc`, `name`), hash
/// `<prefix>:schedule-names` (name to id), sets `<prefix>:schedules` and
/// `<prefix>:schedules:tenant:<tenant>`.
#[derive(Clone)]
pub struct RedisScheduleRepository {
    pool: RedisPool,
}

impl RedisScheduleRepository {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn schedule_key(&self, id: Uuid) -> String {
        self.pool.key(&["schedule", &id.to_string()])
    }

    fn names_key(&self) -> String {
        self.pool.key(&["schedule-names"])
    }

    fn all_key(&self) -> String {
        self.pool.key(&["schedules"])
    }

    fn tenant_key(&self, tenant_id: &str) -> String {
        self.pool.key(&["schedules", "tenant", tenant_id])
    }

    async fn load_ids(&self, ids: Vec<String>) -> Result<Vec<Schedule>, StorageError> {
        let mut schedules = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(id) = Uuid::parse_str(&id) else {
                continue;
            };
            if let Some(schedule) = self.find(id).await? {
                schedules.push(schedule);
            }
        }
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }
}

#[async_trait]
impl ScheduleRepository for RedisScheduleRepository {
    #[tracing::instrument(skip(self, schedule), fields(schedule_id = %schedule.id, name = %schedule.name))]
    async fn save(&self, schedule: &Schedule) -> Result<(), StorageError> {
        let mut conn = self.pool.get_connection();
        let doc = serde_json::to_string(schedule)?;

        let claimed: i64 = redis::Script::new(UPSERT_SCHEDULE)
            .key(self.schedule_key(schedule.id))
            .key(self.names_key())
            .key(self.all_key())
            .key(self.tenant_key(&schedule.tenant_id))
            .arg(schedule.id.to_string())
            .arg(&schedule.name)
            .arg(doc)
            .invoke_async(&mut conn)
            .await?;

        if claimed == 0 {
            return Err(StorageError::DuplicateKey(schedule.name.clone()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<bool, StorageError> {
        let Some(existing) = self.find(id).await? else {
            return Ok(false);
        };

        let mut conn = self.pool.get_connection();
        let _: () = redis::pipe()
            .atomic()
            .del(self.schedule_key(id))
            .ignore()
            .hdel(self.names_key(), &existing.name)
            .ignore()
            .srem(self.all_key(), id.to_string())
            .ignore()
            .srem(self.tenant_key(&existing.tenant_id), id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(true)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Schedule>, StorageError> {
        let mut conn = self.pool.get_connection();
        let doc: Option<String> = conn.hget(self.schedule_key(id), "doc").await?;
        doc.map(|doc| serde_json::from_str(&doc).map_err(StorageError::from))
            .transpose()
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Schedule>, StorageError> {
        let mut conn = self.pool.get_connection();
        let id: Option<String> = conn.hget(self.names_key(), name).await?;
        match id.and_then(|id| Uuid::parse_str(&id).ok()) {
            Some(id) => self.find(id).await,
            None => Ok(None),
        }
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Schedule>, StorageError> {
        let mut conn = self.pool.get_connection();
        let ids: Vec<String> = conn.smembers(self.tenant_key(tenant_id)).await?;
        self.load_ids(ids).await
    }

    async fn list_all(&self) -> Result<Vec<Schedule>, StorageError> {
        let mut conn = self.pool.get_connection();
        let ids: Vec<String> = conn.smembers(self.all_key()).await?;
        self.load_ids(ids).await
    }
}
