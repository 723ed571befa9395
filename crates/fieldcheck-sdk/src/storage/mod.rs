//! 存储模块 - 离线缓存与待同步队列
//!
//! - LocalStore: 统一的本地存储入口（缓存实体 + outbox）
//! - Store: 通用异步键值接口（sled / 内存两种实现）
//! - migrate: 启动时执行一次的 schema 迁移
//!
//! 本地存储初始化失败时 LocalStore 进入不可用状态，所有操作降级为空操作，
//! 应用仍可在线使用。

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{FieldcheckError, Result};

pub mod entities;
pub mod kv;
pub mod migrate;
pub mod store;

pub use entities::*;
pub use kv::KvStore;
pub use store::{MemoryStore, SledStore, Store, StoreKey, StoreValue};

/// KV 存储统计信息
#[derive(Debug, Clone)]
pub struct KvStats {
    pub tree_name: String,
    pub key_count: u64,
    pub size_on_disk: u64,
}

type EntityStore = Arc<dyn Store<String, CachedEntity>>;
type OutboxStore = Arc<dyn Store<u64, PendingOperation>>;

/// outbox ID 生成器
enum IdGenerator {
    Sled(KvStore),
    Memory(AtomicU64),
}

impl IdGenerator {
    fn next(&self) -> Result<u64> {
        match self {
            IdGenerator::Sled(kv) => kv.generate_id(),
            IdGenerator::Memory(counter) => Ok(counter.fetch_add(1, Ordering::SeqCst) + 1),
        }
    }
}

struct StoreBackend {
    entities: HashMap<EntityKind, EntityStore>,
    outbox: OutboxStore,
    ids: IdGenerator,
    kv: Option<KvStore>,
}

impl StoreBackend {
    fn entity_store(&self, kind: EntityKind) -> Result<&EntityStore> {
        self.entities
            .get(&kind)
            .ok_or_else(|| FieldcheckError::KvStore(format!("缺少实体存储: {}", kind)))
    }
}

/// 本地存储
#[derive(Clone)]
pub struct LocalStore {
    backend: Option<Arc<StoreBackend>>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("available", &self.is_available())
            .finish()
    }
}

impl LocalStore {
    /// 打开 sled 持久化存储并执行迁移
    pub async fn try_open(data_dir: &Path) -> Result<Self> {
        let kv = KvStore::open(data_dir).await?;
        let version = migrate::migrate(kv.db())?;
        info!("本地存储 schema 版本: {}", version);

        let mut entities: HashMap<EntityKind, EntityStore> = HashMap::new();
        for kind in EntityKind::ALL {
            entities.insert(kind, Arc::new(SledStore::new(kv.tree(kind.tree_name())?)));
        }
        let outbox: OutboxStore = Arc::new(SledStore::new(kv.tree(migrate::OUTBOX_TREE)?));

        Ok(Self {
            backend: Some(Arc::new(StoreBackend {
                entities,
                outbox,
                ids: IdGenerator::Sled(kv.clone()),
                kv: Some(kv),
            })),
        })
    }

    /// 打开存储；失败时记录警告并返回不可用的存储（降级为纯在线模式）
    pub async fn open(data_dir: &Path) -> Self {
        match Self::try_open(data_dir).await {
            Ok(store) => store,
            Err(e) => {
                warn!("⚠️ 本地存储初始化失败，离线功能不可用: {}", e);
                Self::unavailable()
            }
        }
    }

    /// 纯内存存储（进程退出即丢失）
    pub fn in_memory() -> Self {
        let mut entities: HashMap<EntityKind, EntityStore> = HashMap::new();
        for kind in EntityKind::ALL {
            entities.insert(kind, Arc::new(MemoryStore::<String, CachedEntity>::new()));
        }
        Self {
            backend: Some(Arc::new(StoreBackend {
                entities,
                outbox: Arc::new(MemoryStore::<u64, PendingOperation>::new()),
                ids: IdGenerator::Memory(AtomicU64::new(0)),
                kv: None,
            })),
        }
    }

    /// 不可用的存储：所有操作均为空操作
    pub fn unavailable() -> Self {
        Self { backend: None }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    /// 缓存一条服务端记录（按 id 插入或覆盖），记录必须包含 `id` 字段
    pub async fn put(&self, kind: EntityKind, record: Value) -> Result<()> {
        let id = extract_id(&record)?;
        self.put_cached(CachedEntity {
            id,
            kind,
            payload: record,
            cached_at: Utc::now(),
            offline_available: true,
        })
        .await
    }

    /// 批量缓存，返回写入条数
    pub async fn put_many(&self, kind: EntityKind, records: Vec<Value>) -> Result<usize> {
        let mut written = 0;
        for record in records {
            self.put(kind, record).await?;
            written += 1;
        }
        Ok(written)
    }

    /// 写入完整的缓存实体（保留调用方给定的 cached_at）
    pub async fn put_cached(&self, entity: CachedEntity) -> Result<()> {
        let Some(backend) = &self.backend else {
            debug!("本地存储不可用，忽略缓存写入: {}/{}", entity.kind, entity.id);
            return Ok(());
        };
        backend
            .entity_store(entity.kind)?
            .put(&entity.id, &entity)
            .await
    }

    /// 读取某类实体的所有离线可用记录
    pub async fn get_all(&self, kind: EntityKind) -> Vec<CachedEntity> {
        let Some(backend) = &self.backend else {
            return Vec::new();
        };
        let result = match backend.entity_store(kind) {
            Ok(store) => store.scan().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(items) => items
                .into_iter()
                .map(|(_, entity)| entity)
                .filter(|entity| entity.offline_available)
                .collect(),
            Err(e) => {
                warn!("读取缓存失败 {}: {}", kind, e);
                Vec::new()
            }
        }
    }

    /// 按 id 读取离线可用记录
    pub async fn get_by_id(&self, kind: EntityKind, id: &str) -> Option<CachedEntity> {
        let backend = self.backend.as_ref()?;
        let result = match backend.entity_store(kind) {
            Ok(store) => store.get(&id.to_string()).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(entity) => entity.filter(|e| e.offline_available),
            Err(e) => {
                warn!("读取缓存失败 {}/{}: {}", kind, id, e);
                None
            }
        }
    }

    /// 追加一条待同步操作，存储不可用时返回 None
    pub async fn enqueue_operation(
        &self,
        op_type: OperationType,
        action: OperationAction,
        payload: Value,
    ) -> Result<Option<PendingOperation>> {
        self.enqueue_operation_for(op_type, action, payload, None, None).await
    }

    /// 追加一条针对特定实体的待同步操作（携带冲突检测所需的基线版本）
    pub async fn enqueue_operation_for(
        &self,
        op_type: OperationType,
        action: OperationAction,
        payload: Value,
        entity_id: Option<String>,
        base_version: Option<i64>,
    ) -> Result<Option<PendingOperation>> {
        let Some(backend) = &self.backend else {
            debug!("本地存储不可用，无法入队 {} 操作", op_type);
            return Ok(None);
        };

        let operation = PendingOperation {
            id: backend.ids.next()?,
            op_type,
            action,
            payload,
            timestamp: Utc::now(),
            entity_id,
            base_version,
        };
        backend.outbox.put(&operation.id, &operation).await?;
        info!("📥 操作已入队: id={}, type={}", operation.id, operation.op_type);
        Ok(Some(operation))
    }

    /// 覆盖一条已有的待同步操作（冲突合并后改写 payload / 基线版本）
    pub async fn update_operation(&self, operation: &PendingOperation) -> Result<()> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        if backend.outbox.get(&operation.id).await?.is_none() {
            return Err(FieldcheckError::NotFound(format!("待同步操作 {}", operation.id)));
        }
        backend.outbox.put(&operation.id, operation).await
    }

    /// 移除重放成功的操作，返回是否存在
    pub async fn dequeue_operation(&self, id: u64) -> Result<bool> {
        let Some(backend) = &self.backend else {
            return Ok(false);
        };
        let removed = backend.outbox.delete(&id).await?;
        debug!("操作出队: id={}, existed={}", id, removed);
        Ok(removed)
    }

    /// 按插入顺序返回所有待同步操作
    pub async fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        let Some(backend) = &self.backend else {
            return Ok(Vec::new());
        };
        Ok(backend
            .outbox
            .scan()
            .await?
            .into_iter()
            .map(|(_, op)| op)
            .collect())
    }

    /// 把 outbox 中无法反序列化的记录移入隔离 Tree，返回其操作 id
    ///
    /// 这些记录不会出现在 `pending_operations` 中，却仍计入 `pending_count`，
    /// 隔离后两者重新一致。内存存储中的值总是可解析的。
    pub async fn quarantine_undecodable_operations(&self) -> Result<Vec<u64>> {
        let Some(kv) = self.backend.as_ref().and_then(|b| b.kv.as_ref()) else {
            return Ok(Vec::new());
        };
        let outbox = kv.tree(migrate::OUTBOX_TREE)?;
        let quarantine = kv.tree(migrate::OUTBOX_QUARANTINE_TREE)?;

        let mut ids = Vec::new();
        for item in outbox.iter() {
            let (key, bytes) = item?;
            if serde_json::from_slice::<PendingOperation>(&bytes).is_ok() {
                continue;
            }
            let id = u64::decode(&key)?;
            // 先写隔离区再删除，中途失败时记录仍留在 outbox
            quarantine.insert(&key, bytes)?;
            outbox.remove(&key)?;
            warn!("outbox 记录 {} 无法解析，已移入隔离区", id);
            ids.push(id);
        }
        Ok(ids)
    }

    /// 隔离区中的原始记录（按 id 排序）
    pub async fn quarantined_operations(&self) -> Result<Vec<(u64, Vec<u8>)>> {
        let Some(kv) = self.backend.as_ref().and_then(|b| b.kv.as_ref()) else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for item in kv.tree(migrate::OUTBOX_QUARANTINE_TREE)?.iter() {
            let (key, bytes) = item?;
            records.push((u64::decode(&key)?, bytes.to_vec()));
        }
        Ok(records)
    }

    #[cfg(test)]
    pub(crate) fn insert_raw_operation(&self, id: u64, bytes: &[u8]) -> Result<()> {
        let kv = self
            .backend
            .as_ref()
            .and_then(|b| b.kv.as_ref())
            .ok_or_else(|| FieldcheckError::KvStore("需要 sled 存储".to_string()))?;
        kv.tree(migrate::OUTBOX_TREE)?.insert(id.to_be_bytes(), bytes)?;
        Ok(())
    }

    pub async fn get_operation(&self, id: u64) -> Result<Option<PendingOperation>> {
        let Some(backend) = &self.backend else {
            return Ok(None);
        };
        backend.outbox.get(&id).await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };
        backend.outbox.len().await
    }

    /// 删除 cached_at 早于 now - days 的缓存实体，不触碰 outbox
    ///
    /// 截止时间超出可表示范围时不删除任何记录。
    pub async fn evict_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = ChronoDuration::try_days(i64::from(days))
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.evict_before(cutoff).await
    }

    /// 删除 cached_at 早于 cutoff 的缓存实体
    pub async fn evict_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };

        let mut removed = 0;
        for kind in EntityKind::ALL {
            let store = backend.entity_store(kind)?;
            for (id, entity) in store.scan().await? {
                if entity.cached_at < cutoff && store.delete(&id).await? {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!("🧹 清理过期缓存: 移除了 {} 条记录 (cutoff={})", removed, cutoff);
        }
        Ok(removed)
    }

    /// 持久化存储刷盘，内存/不可用存储为空操作
    pub async fn flush(&self) -> Result<()> {
        match self.backend.as_ref().and_then(|b| b.kv.as_ref()) {
            Some(kv) => kv.flush().await,
            None => Ok(()),
        }
    }
}

/// 从服务端记录中提取 id（字符串或数字）
fn extract_id(record: &Value) -> Result<String> {
    match record.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(FieldcheckError::InvalidData("缓存记录缺少 id 字段".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let store = LocalStore::in_memory();
        store
            .put(EntityKind::Mission, json!({"id": 12, "address": "3 rue des Lilas", "status": "planned"}))
            .await
            .unwrap();

        let entity = store.get_by_id(EntityKind::Mission, "12").await.unwrap();
        assert!(entity.offline_available);
        assert_eq!(entity.payload["address"], "3 rue des Lilas");
        assert_eq!(entity.payload["status"], "planned");
        assert_eq!(store.get_all(EntityKind::Mission).await.len(), 1);
        assert!(store.get_all(EntityKind::Photo).await.is_empty());
    }

    #[tokio::test]
    async fn test_put_overwrites_by_id() {
        let store = LocalStore::in_memory();
        store.put(EntityKind::Checklist, json!({"id": "c1", "score": 1})).await.unwrap();
        store.put(EntityKind::Checklist, json!({"id": "c1", "score": 2})).await.unwrap();

        let all = store.get_all(EntityKind::Checklist).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload["score"], 2);
    }

    #[tokio::test]
    async fn test_put_requires_id() {
        let store = LocalStore::in_memory();
        let result = store.put(EntityKind::Mission, json!({"title": "no id"})).await;
        assert!(matches!(result, Err(FieldcheckError::InvalidData(_))));
    }

    #[tokio::test]
    async fn test_reads_skip_records_not_available_offline() {
        let store = LocalStore::in_memory();
        store
            .put_cached(CachedEntity {
                id: "p1".to_string(),
                kind: EntityKind::Photo,
                payload: json!({"id": "p1"}),
                cached_at: Utc::now(),
                offline_available: false,
            })
            .await
            .unwrap();

        assert!(store.get_by_id(EntityKind::Photo, "p1").await.is_none());
        assert!(store.get_all(EntityKind::Photo).await.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_respects_retention() {
        let store = LocalStore::in_memory();
        let now = Utc::now();
        for (id, age_days) in [("old", 8), ("recent", 6)] {
            store
                .put_cached(CachedEntity {
                    id: id.to_string(),
                    kind: EntityKind::Mission,
                    payload: json!({"id": id}),
                    cached_at: now - ChronoDuration::days(age_days),
                    offline_available: true,
                })
                .await
                .unwrap();
        }
        store
            .enqueue_operation(OperationType::Checklist, OperationAction::Create, json!({"a": 1}))
            .await
            .unwrap();

        let removed = store.evict_older_than(7).await.unwrap();

        assert_eq!(removed, 1);
        assert!(store.get_by_id(EntityKind::Mission, "old").await.is_none());
        assert!(store.get_by_id(EntityKind::Mission, "recent").await.is_some());
        // outbox 不受影响
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_eviction_with_huge_retention_keeps_everything() {
        let store = LocalStore::in_memory();
        store
            .put_cached(CachedEntity {
                id: "ancient".to_string(),
                kind: EntityKind::Mission,
                payload: json!({"id": "ancient"}),
                cached_at: Utc::now() - ChronoDuration::days(3650),
                offline_available: true,
            })
            .await
            .unwrap();

        assert_eq!(store.evict_older_than(200_000_000).await.unwrap(), 0);
        assert_eq!(store.evict_older_than(u32::MAX).await.unwrap(), 0);
        assert!(store.get_by_id(EntityKind::Mission, "ancient").await.is_some());
    }

    #[tokio::test]
    async fn test_undecodable_outbox_rows_are_quarantined() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::try_open(temp_dir.path()).await.unwrap();
        store
            .enqueue_operation(OperationType::Checklist, OperationAction::Create, json!({"seq": 1}))
            .await
            .unwrap();
        store.insert_raw_operation(u64::MAX, b"{not json").unwrap();

        assert_eq!(store.pending_count().await.unwrap(), 2);
        assert_eq!(store.pending_operations().await.unwrap().len(), 1);

        assert_eq!(store.quarantine_undecodable_operations().await.unwrap(), vec![u64::MAX]);
        assert_eq!(store.pending_count().await.unwrap(), 1);
        assert_eq!(
            store.quarantined_operations().await.unwrap(),
            vec![(u64::MAX, b"{not json".to_vec())]
        );
        assert!(store.quarantine_undecodable_operations().await.unwrap().is_empty());

        assert!(LocalStore::in_memory()
            .quarantine_undecodable_operations()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_outbox_preserves_insertion_order() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::try_open(temp_dir.path()).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..20 {
            let op_type = if i % 3 == 0 { OperationType::Photo } else { OperationType::Checklist };
            let op = store
                .enqueue_operation(op_type, OperationAction::Create, json!({"seq": i}))
                .await
                .unwrap()
                .unwrap();
            ids.push(op.id);
        }

        let pending = store.pending_operations().await.unwrap();
        let seqs: Vec<i64> = pending.iter().map(|op| op.payload["seq"].as_i64().unwrap()).collect();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());
        assert_eq!(pending.iter().map(|op| op.id).collect::<Vec<_>>(), ids);

        assert!(store.dequeue_operation(ids[0]).await.unwrap());
        assert!(!store.dequeue_operation(ids[0]).await.unwrap());
        assert_eq!(store.pending_count().await.unwrap(), 19);
    }

    #[tokio::test]
    async fn test_outbox_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = LocalStore::try_open(temp_dir.path()).await.unwrap();
            store
                .enqueue_operation(OperationType::Checklist, OperationAction::Create, json!({"mission": 5}))
                .await
                .unwrap();
            store.flush().await.unwrap();
        }

        let store = LocalStore::try_open(temp_dir.path()).await.unwrap();
        let pending = store.pending_operations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["mission"], 5);
    }

    #[tokio::test]
    async fn test_unavailable_store_is_noop() {
        let store = LocalStore::unavailable();
        assert!(!store.is_available());
        assert!(store.put(EntityKind::Mission, json!({"id": 1})).await.is_ok());
        assert!(store.get_all(EntityKind::Mission).await.is_empty());
        assert!(store.get_by_id(EntityKind::Mission, "1").await.is_none());
        let queued = store
            .enqueue_operation(OperationType::Checklist, OperationAction::Create, json!({}))
            .await
            .unwrap();
        assert!(queued.is_none());
        assert!(!store.dequeue_operation(1).await.unwrap());
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert_eq!(store.evict_older_than(7).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_degrades_when_path_is_unusable() {
        let temp_dir = TempDir::new().unwrap();
        // 数据目录被同名文件占用，create_dir_all 失败
        let blocked = temp_dir.path().join("blocked");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let store = LocalStore::open(&blocked).await;
        assert!(!store.is_available());
    }
}
