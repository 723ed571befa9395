/// 同步协调器
///
/// 一次同步（pass）读取全部待同步操作并按插入顺序逐条处理：
/// - 成功 → 出队
/// - 冲突 → 不重放，登记冲突并发布 `sync-conflict`
/// - 网络/超时失败 → 结束本次同步（设备实际已离线）
/// - 其它失败 → 保留，跳过同一实体的后续操作，继续处理其它实体
///
/// 同一时间只允许一个 pass 运行。
use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::conflict::{ConflictRecord, ConflictRegistry, ConflictResolution};
use super::{SyncOutcome, SyncReport};
use crate::api::{PhotoUpload, RemoteApi, ReplayMode};
use crate::error::{FieldcheckError, Result};
use crate::events::{AppEvent, EventBus};
use crate::retry::{classify, ApiErrorReport};
use crate::storage::{LocalStore, OperationType, PendingOperation};

const SYNC_CONTEXT: &str = "sync";

/// 单条操作的处理结果
enum Step {
    Replayed,
    Conflict,
    Skipped,
    Failed { stop: bool },
}

pub struct SyncCoordinator {
    store: LocalStore,
    api: Arc<dyn RemoteApi>,
    events: Arc<EventBus>,
    conflicts: ConflictRegistry,
    /// 同步锁（防止 pass 重叠，冲突解决同样需要持有）
    pass_lock: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(store: LocalStore, api: Arc<dyn RemoteApi>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            api,
            events,
            conflicts: ConflictRegistry::default(),
            pass_lock: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub(crate) async fn hold_pass(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.pass_lock.lock().await
    }

    pub fn is_running(&self) -> bool {
        self.pass_lock.try_lock().is_err()
    }

    /// 未解决的冲突（按操作 id 排序）
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.all()
    }

    pub fn conflict(&self, operation_id: u64) -> Option<ConflictRecord> {
        self.conflicts.get(operation_id)
    }

    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    /// 读取 outbox 数量并发布 `pending-changes`
    pub async fn publish_pending(&self) -> Result<usize> {
        let count = self.store.pending_count().await?;
        self.events.emit(AppEvent::PendingChanges { count });
        Ok(count)
    }

    /// 执行一次同步；已有同步在运行时立即返回 `AlreadyRunning`
    pub async fn run(&self) -> Result<SyncOutcome> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            debug!("同步已在进行，忽略本次触发");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        let quarantined = self.store.quarantine_undecodable_operations().await?;
        if !quarantined.is_empty() {
            error!("outbox 中 {} 条记录无法解析，已隔离: {:?}", quarantined.len(), quarantined);
            self.events.emit(AppEvent::OutboxCorrupted {
                operation_ids: quarantined,
            });
            self.publish_pending().await?;
        }

        let operations = self.store.pending_operations().await?;
        let mut report = SyncReport {
            total: operations.len(),
            ..Default::default()
        };
        if operations.is_empty() {
            debug!("outbox 为空，无需同步");
            return Ok(SyncOutcome::Completed(report));
        }

        info!("开始同步: pending={}", report.total);
        self.events.emit(AppEvent::SyncStarted { pending: report.total });

        // 前序操作未完成的实体
        let mut blocked: HashSet<String> = HashSet::new();

        for (index, operation) in operations.iter().enumerate() {
            let key = operation.entity_key();
            let step = if self.conflicts.contains(operation.id) {
                Step::Conflict
            } else if blocked.contains(&key) {
                Step::Skipped
            } else {
                self.process(operation).await
            };

            match step {
                Step::Replayed => report.replayed += 1,
                Step::Conflict => {
                    report.conflicts += 1;
                    blocked.insert(key);
                }
                Step::Skipped => {
                    debug!("跳过操作 {}: 实体 {} 有未完成的前序操作", operation.id, key);
                    report.skipped += 1;
                }
                Step::Failed { stop } => {
                    report.failed += 1;
                    blocked.insert(key);
                    if stop {
                        warn!("网络不可用，中止本次同步: 已处理 {}/{}", index + 1, report.total);
                        report.interrupted = true;
                        break;
                    }
                }
            }

            self.events.emit(AppEvent::SyncProgress {
                processed: index + 1,
                total: report.total,
                operation_id: operation.id,
            });
        }

        report.remaining = self.publish_pending().await?;
        info!(
            "同步完成: replayed={}, failed={}, conflicts={}, skipped={}, remaining={}",
            report.replayed, report.failed, report.conflicts, report.skipped, report.remaining
        );
        self.events.emit(AppEvent::SyncCompleted { report: report.clone() });
        Ok(SyncOutcome::Completed(report))
    }

    async fn process(&self, operation: &PendingOperation) -> Step {
        match self.detect_conflict(operation).await {
            Ok(Some(record)) => {
                warn!(
                    "检测到冲突: op={}, entity={}, base_version={:?}, server_version={}",
                    operation.id,
                    operation.entity_key(),
                    operation.base_version,
                    record.server.version
                );
                self.conflicts.insert(record.clone());
                self.events.emit(AppEvent::SyncConflict { conflict: record });
                return Step::Conflict;
            }
            Ok(None) => {}
            Err(e) => return self.fail(operation, e),
        }

        match self.replay(operation, ReplayMode::Normal).await {
            Ok(()) => Step::Replayed,
            Err(e) => self.fail(operation, e),
        }
    }

    fn fail(&self, operation: &PendingOperation, error: FieldcheckError) -> Step {
        let stop = error.is_transport_failure();
        let report = ApiErrorReport::from_classification(
            SYNC_CONTEXT,
            operation.op_type.as_str(),
            classify(&error),
            0,
        );
        warn!("操作重放失败，保留在 outbox: op={}, error={}", operation.id, error);
        self.events.emit(AppEvent::SyncFailed {
            operation_id: Some(operation.id),
            report,
        });
        Step::Failed { stop }
    }

    /// 服务端版本比本地基线新时返回冲突
    async fn detect_conflict(&self, operation: &PendingOperation) -> Result<Option<ConflictRecord>> {
        let (Some(entity_id), Some(base_version)) = (&operation.entity_id, operation.base_version) else {
            return Ok(None);
        };
        let remote = self.api.fetch_remote(operation.op_type, entity_id).await?;
        Ok(remote
            .filter(|snapshot| snapshot.version > base_version)
            .map(|server| ConflictRecord {
                operation: operation.clone(),
                server,
                detected_at: Utc::now(),
            }))
    }

    /// 发送到服务端，成功后出队并缓存服务端返回的记录
    async fn replay(&self, operation: &PendingOperation, mode: ReplayMode) -> Result<()> {
        let response = match operation.op_type {
            OperationType::Checklist => self.api.submit_checklist(&operation.payload, mode).await?,
            OperationType::Photo => {
                let upload = PhotoUpload::from_payload(&operation.payload)?;
                self.api.upload_photo(upload, mode).await?
            }
        };

        if let Err(e) = self.store.dequeue_operation(operation.id).await {
            // 服务端已接受，出队失败会导致下次重复提交
            error!("操作 {} 已重放但出队失败: {}", operation.id, e);
            return Err(e);
        }
        debug!("操作已重放: id={}, type={}", operation.id, operation.op_type);

        if response.get("id").is_some() {
            if let Err(e) = self.store.put(operation.op_type.entity_kind(), response).await {
                warn!("缓存服务端响应失败: {}", e);
            }
        }
        Ok(())
    }

    /// 按用户选择的策略解决冲突
    pub async fn resolve_conflict(&self, operation_id: u64, resolution: ConflictResolution) -> Result<()> {
        let _guard = self.pass_lock.lock().await;
        let record = self
            .conflicts
            .get(operation_id)
            .ok_or_else(|| FieldcheckError::NotFound(format!("冲突记录 {}", operation_id)))?;

        info!("解决冲突: op={}, strategy={}", operation_id, resolution.as_str());
        match resolution {
            ConflictResolution::ResolveLater => return Ok(()),
            ConflictResolution::KeepLocal => {
                self.replay(&record.operation, ReplayMode::Force).await?;
                self.conflicts.remove(operation_id);
            }
            ConflictResolution::KeepServer => {
                self.store.dequeue_operation(operation_id).await?;
                self.conflicts.remove(operation_id);
                self.cache_server_copy(&record).await;
            }
            ConflictResolution::Merge(merge) => {
                let mut operation = record.operation.clone();
                operation.payload = merge(&record.operation.payload, &record.server.payload);
                operation.base_version = Some(record.server.version);
                self.store.update_operation(&operation).await?;
                // 已重新基于服务端版本，重放失败时按普通操作在下次同步中处理
                self.conflicts.remove(operation_id);
                self.replay(&operation, ReplayMode::Normal).await?;
            }
        }

        self.publish_pending().await?;
        Ok(())
    }

    async fn cache_server_copy(&self, record: &ConflictRecord) {
        let Value::Object(mut payload) = record.server.payload.clone() else {
            return;
        };
        if !payload.contains_key("id") {
            if let Some(entity_id) = &record.operation.entity_id {
                payload.insert("id".to_string(), Value::String(entity_id.clone()));
            }
        }
        if let Err(e) = self
            .store
            .put(record.operation.op_type.entity_kind(), Value::Object(payload))
            .await
        {
            warn!("缓存服务端版本失败: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_helpers::MockRemoteApi;
    use crate::storage::{EntityKind, OperationAction, RemoteSnapshot};
    use crate::sync::shallow_union;
    use base64::Engine;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;

    struct Fixture {
        store: LocalStore,
        api: Arc<MockRemoteApi>,
        events: Arc<EventBus>,
        coordinator: SyncCoordinator,
    }

    fn fixture() -> Fixture {
        let store = LocalStore::in_memory();
        let api = Arc::new(MockRemoteApi::default());
        let events = Arc::new(EventBus::new(64));
        let coordinator = SyncCoordinator::new(store.clone(), api.clone(), events.clone());
        Fixture {
            store,
            api,
            events,
            coordinator,
        }
    }

    async fn enqueue(store: &LocalStore, payload: Value, entity: Option<&str>, base: Option<i64>) -> u64 {
        store
            .enqueue_operation_for(
                OperationType::Checklist,
                OperationAction::Create,
                payload,
                entity.map(str::to_string),
                base,
            )
            .await
            .unwrap()
            .unwrap()
            .id
    }

    fn completed(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Completed(report) => report,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replays_in_insertion_order() {
        let f = fixture();
        let photo = base64::engine::general_purpose::STANDARD.encode(b"img");
        for seq in 0..4 {
            if seq % 2 == 0 {
                enqueue(&f.store, json!({"seq": seq}), None, None).await;
            } else {
                f.store
                    .enqueue_operation(
                        OperationType::Photo,
                        OperationAction::Create,
                        json!({"seq": seq, "photo_data": format!("data:image/jpeg;base64,{}", photo)}),
                    )
                    .await
                    .unwrap();
            }
        }

        let report = completed(f.coordinator.run().await.unwrap());

        assert_eq!(report.replayed, 4);
        assert_eq!(report.remaining, 0);
        let order: Vec<String> = f
            .api
            .writes
            .lock()
            .iter()
            .map(|(op_type, payload)| {
                let seq = match &payload["seq"] {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("{}:{}", op_type.as_str(), seq)
            })
            .collect();
        assert_eq!(order, vec!["checklist:0", "photo:1", "checklist:2", "photo:3"]);
        assert_eq!(f.api.photos.lock()[0].0.data, b"img".to_vec());
        assert_eq!(f.store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_blocks_same_entity_only() {
        let f = fixture();
        let a1 = enqueue(&f.store, json!({"n": "a1"}), Some("a"), None).await;
        enqueue(&f.store, json!({"n": "b1"}), Some("b"), None).await;
        let a2 = enqueue(&f.store, json!({"n": "a2"}), Some("a"), None).await;
        f.api.script_writes(vec![Some(FieldcheckError::Http {
            status: 500,
            message: "boom".into(),
            body: None,
        })]);

        let report = completed(f.coordinator.run().await.unwrap());

        assert_eq!(report.failed, 1);
        assert_eq!(report.replayed, 1);
        assert_eq!(report.skipped, 1);
        assert!(!report.interrupted);
        let remaining: Vec<u64> = f.store.pending_operations().await.unwrap().iter().map(|op| op.id).collect();
        assert_eq!(remaining, vec![a1, a2]);

        // 下次同步时按原顺序重放
        let report = completed(f.coordinator.run().await.unwrap());
        assert_eq!(report.replayed, 2);
        let names: Vec<String> = f
            .api
            .submitted
            .lock()
            .iter()
            .map(|(p, _)| p["n"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["b1", "a1", "a2"]);
    }

    #[tokio::test]
    async fn test_network_failure_stops_pass() {
        let f = fixture();
        for seq in 0..3 {
            enqueue(&f.store, json!({"seq": seq}), None, None).await;
        }
        f.api.script_writes(vec![None, Some(FieldcheckError::Network("unreachable".into()))]);
        let failures = Arc::new(SyncMutex::new(Vec::new()));
        let sink = failures.clone();
        let _sub = f.events.subscribe("sync-failed", move |event| {
            if let AppEvent::SyncFailed { operation_id, .. } = event {
                sink.lock().push(*operation_id);
            }
        });

        let report = completed(f.coordinator.run().await.unwrap());

        assert!(report.interrupted);
        assert_eq!(report.replayed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 2);
        assert_eq!(failures.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_is_surfaced_without_touching_server() {
        let f = fixture();
        let op = enqueue(&f.store, json!({"id": "c1", "score": 4}), Some("c1"), Some(2)).await;
        let later = enqueue(&f.store, json!({"id": "c1", "score": 5}), Some("c1"), None).await;
        f.api.set_snapshot(
            OperationType::Checklist,
            "c1",
            RemoteSnapshot {
                version: 3,
                payload: json!({"id": "c1", "score": 1, "version": 3}),
            },
        );
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = f.events.subscribe("sync-conflict", move |event| {
            if let AppEvent::SyncConflict { conflict } = event {
                sink.lock().push(conflict.operation_id());
            }
        });

        let report = completed(f.coordinator.run().await.unwrap());

        assert_eq!(report.conflicts, 1);
        assert_eq!(report.skipped, 1);
        assert!(f.api.submitted.lock().is_empty());
        assert_eq!(seen.lock().clone(), vec![op]);
        assert_eq!(f.coordinator.conflict(op).unwrap().server.version, 3);

        // 未解决的冲突不重复检测，也不重复发布事件
        let report = completed(f.coordinator.run().await.unwrap());
        assert_eq!(report.conflicts, 1);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(f.store.pending_count().await.unwrap(), 2);
        assert!(f.store.get_operation(later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_no_conflict_when_server_not_newer() {
        let f = fixture();
        enqueue(&f.store, json!({"id": "c1"}), Some("c1"), Some(3)).await;
        f.api.set_snapshot(
            OperationType::Checklist,
            "c1",
            RemoteSnapshot {
                version: 3,
                payload: json!({"id": "c1"}),
            },
        );

        let report = completed(f.coordinator.run().await.unwrap());
        assert_eq!(report.replayed, 1);
        assert_eq!(f.coordinator.conflict_count(), 0);
        // 服务端返回的记录进入缓存
        assert!(f.store.get_by_id(EntityKind::Checklist, "c1").await.is_some());
    }

    async fn conflicted(f: &Fixture) -> u64 {
        let op = enqueue(&f.store, json!({"id": "c1", "score": 4}), Some("c1"), Some(1)).await;
        f.api.set_snapshot(
            OperationType::Checklist,
            "c1",
            RemoteSnapshot {
                version: 2,
                payload: json!({"id": "c1", "score": 1, "inspector": "lee"}),
            },
        );
        f.coordinator.run().await.unwrap();
        assert!(f.coordinator.conflict(op).is_some());
        op
    }

    #[tokio::test]
    async fn test_keep_local_forces_replay() {
        let f = fixture();
        let op = conflicted(&f).await;

        f.coordinator.resolve_conflict(op, ConflictResolution::KeepLocal).await.unwrap();

        let submitted = f.api.submitted.lock().clone();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].1, ReplayMode::Force);
        assert_eq!(submitted[0].0["score"], 4);
        assert_eq!(f.store.pending_count().await.unwrap(), 0);
        assert_eq!(f.coordinator.conflict_count(), 0);
    }

    #[tokio::test]
    async fn test_keep_server_discards_local() {
        let f = fixture();
        let op = conflicted(&f).await;

        f.coordinator.resolve_conflict(op, ConflictResolution::KeepServer).await.unwrap();

        assert!(f.api.submitted.lock().is_empty());
        assert_eq!(f.store.pending_count().await.unwrap(), 0);
        let cached = f.store.get_by_id(EntityKind::Checklist, "c1").await.unwrap();
        assert_eq!(cached.payload["inspector"], "lee");
    }

    #[tokio::test]
    async fn test_merge_uses_caller_function() {
        let f = fixture();
        let op = conflicted(&f).await;

        f.coordinator
            .resolve_conflict(op, ConflictResolution::merge(shallow_union))
            .await
            .unwrap();

        let submitted = f.api.submitted.lock().clone();
        assert_eq!(submitted[0].0, json!({"id": "c1", "score": 4, "inspector": "lee"}));
        assert_eq!(submitted[0].1, ReplayMode::Normal);
        assert_eq!(f.store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resolve_later_keeps_everything() {
        let f = fixture();
        let op = conflicted(&f).await;

        f.coordinator.resolve_conflict(op, ConflictResolution::ResolveLater).await.unwrap();

        assert!(f.coordinator.conflict(op).is_some());
        assert_eq!(f.store.pending_count().await.unwrap(), 1);
        assert!(f.coordinator.resolve_conflict(999, ConflictResolution::KeepLocal).await.is_err());
    }

    #[tokio::test]
    async fn test_passes_never_overlap() {
        let f = fixture();
        let _held = f.coordinator.pass_lock.lock().await;
        assert!(f.coordinator.is_running());
        assert_eq!(f.coordinator.run().await.unwrap(), SyncOutcome::AlreadyRunning);
    }

    #[tokio::test]
    async fn test_undecodable_operation_is_reported_and_not_counted() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = LocalStore::try_open(temp_dir.path()).await.unwrap();
        let api = Arc::new(MockRemoteApi::default());
        let events = Arc::new(EventBus::new(64));
        let coordinator = SyncCoordinator::new(store.clone(), api.clone(), events.clone());
        store
            .enqueue_operation(OperationType::Checklist, OperationAction::Create, json!({"seq": 1}))
            .await
            .unwrap();
        store.insert_raw_operation(u64::MAX, b"\x00garbage").unwrap();
        let reported = Arc::new(SyncMutex::new(Vec::new()));
        let sink = reported.clone();
        let _sub = events.subscribe("outbox-corrupted", move |event| {
            if let AppEvent::OutboxCorrupted { operation_ids } = event {
                sink.lock().extend(operation_ids.iter().copied());
            }
        });

        let report = completed(coordinator.run().await.unwrap());

        assert_eq!(reported.lock().clone(), vec![u64::MAX]);
        assert_eq!(report.total, 1);
        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert_eq!(store.quarantined_operations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_events_for_a_pass() {
        let f = fixture();
        enqueue(&f.store, json!({"seq": 1}), None, None).await;
        enqueue(&f.store, json!({"seq": 2}), None, None).await;
        let names = Arc::new(SyncMutex::new(Vec::new()));
        let sink = names.clone();
        let _sub = f.events.subscribe(crate::events::ALL_EVENTS, move |event| {
            sink.lock().push(event.name());
        });

        f.coordinator.run().await.unwrap();

        assert_eq!(
            names.lock().clone(),
            vec!["sync-started", "sync-progress", "sync-progress", "pending-changes", "sync-completed"]
        );
    }
}
