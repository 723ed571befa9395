//! 同步冲突
//!
//! 冲突记录只保存在内存中，重启后丢失；对应的 outbox 操作保留，
//! 下次同步时会重新检测。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::storage::{PendingOperation, RemoteSnapshot};

/// 一条等待用户决定的冲突
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictRecord {
    /// 本地快照（未重放的操作）
    pub operation: PendingOperation,
    /// 服务端当前版本
    pub server: RemoteSnapshot,
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn operation_id(&self) -> u64 {
        self.operation.id
    }
}

/// 字段级合并函数：(本地 payload, 服务端 payload) -> 合并结果
pub type MergeFn = Box<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// 冲突解决策略
pub enum ConflictResolution {
    /// 以本地为准，强制覆盖服务端
    KeepLocal,
    /// 以服务端为准，丢弃本地操作
    KeepServer,
    /// 由调用方提供合并函数
    Merge(MergeFn),
    /// 暂不处理，操作继续保留
    ResolveLater,
}

impl ConflictResolution {
    pub fn merge<F>(f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        ConflictResolution::Merge(Box::new(f))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::KeepLocal => "keep_local",
            ConflictResolution::KeepServer => "keep_server",
            ConflictResolution::Merge(_) => "merge",
            ConflictResolution::ResolveLater => "resolve_later",
        }
    }
}

impl fmt::Debug for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 浅层字段合并：以服务端对象为底，本地字段覆盖
///
/// 可直接用作 `ConflictResolution::merge(shallow_union)`；非对象 payload 取本地值。
pub fn shallow_union(local: &Value, server: &Value) -> Value {
    match (local, server) {
        (Value::Object(local), Value::Object(server)) => {
            let mut merged = server.clone();
            for (key, value) in local {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => local.clone(),
    }
}

/// 未解决冲突表，按操作 id 排序
#[derive(Debug, Default)]
pub(crate) struct ConflictRegistry {
    records: RwLock<BTreeMap<u64, ConflictRecord>>,
}

impl ConflictRegistry {
    pub fn insert(&self, record: ConflictRecord) {
        self.records.write().insert(record.operation.id, record);
    }

    pub fn get(&self, operation_id: u64) -> Option<ConflictRecord> {
        self.records.read().get(&operation_id).cloned()
    }

    pub fn contains(&self, operation_id: u64) -> bool {
        self.records.read().contains_key(&operation_id)
    }

    pub fn remove(&self, operation_id: u64) -> Option<ConflictRecord> {
        self.records.write().remove(&operation_id)
    }

    pub fn all(&self) -> Vec<ConflictRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }
}
