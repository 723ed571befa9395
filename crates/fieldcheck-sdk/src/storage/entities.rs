//! 数据实体定义 - 对应本地存储中的各个 Tree
//!
//! - 缓存实体：任务（mission）、检查单（checklist）、照片（photo）
//! - 待同步操作（outbox）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 缓存实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Mission,
    Checklist,
    Photo,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Mission, EntityKind::Checklist, EntityKind::Photo];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Mission => "mission",
            EntityKind::Checklist => "checklist",
            EntityKind::Photo => "photo",
        }
    }

    /// 对应的 sled Tree 名称
    pub fn tree_name(&self) -> &'static str {
        match self {
            EntityKind::Mission => "missions",
            EntityKind::Checklist => "checklists",
            EntityKind::Photo => "photos",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 缓存实体
///
/// 每次缓存服务端响应时创建或覆盖；只会被定期过期清理删除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity {
    pub id: String,
    pub kind: EntityKind,
    /// 领域数据（服务端原始 JSON）
    pub payload: serde_json::Value,
    pub cached_at: DateTime<Utc>,
    pub offline_available: bool,
}

/// 待同步操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Checklist,
    Photo,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Checklist => "checklist",
            OperationType::Photo => "photo",
        }
    }

    /// 服务端确认后应写入的缓存类型
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            OperationType::Checklist => EntityKind::Checklist,
            OperationType::Photo => EntityKind::Photo,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 待同步操作动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationAction {
    Create,
}

/// 待同步操作（outbox 记录）
///
/// 离线写入时创建；仅在远端重放成功（或冲突选择保留服务端版本）后删除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// 本地自增 ID，与服务端无关，决定重放顺序
    pub id: u64,
    pub op_type: OperationType,
    pub action: OperationAction,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// 写入针对的逻辑实体（用于冲突检测与同实体 FIFO）
    #[serde(default)]
    pub entity_id: Option<String>,
    /// 本地快照所基于的服务端版本
    #[serde(default)]
    pub base_version: Option<i64>,
}

impl PendingOperation {
    /// 同实体排序键：没有 entity_id 的操作各自独立
    pub fn entity_key(&self) -> String {
        match &self.entity_id {
            Some(entity_id) => format!("{}:{}", self.op_type, entity_id),
            None => format!("{}:#{}", self.op_type, self.id),
        }
    }
}

/// 服务端当前版本快照（用于冲突检测与解决）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub version: i64,
    pub payload: serde_json::Value,
}
