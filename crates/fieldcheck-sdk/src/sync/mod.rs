/// outbox 同步模块
///
/// 职责：
/// - 按插入顺序重放待同步操作（检查单 JSON / 照片 multipart）
/// - 保持同一实体内的 FIFO：失败或冲突的操作阻塞同实体的后续操作
/// - 检测冲突并交给用户决定（保留本地 / 保留服务端 / 合并）

pub mod conflict;
pub mod coordinator;

pub use conflict::{shallow_union, ConflictRecord, ConflictResolution, MergeFn};
pub use coordinator::SyncCoordinator;

use serde::{Deserialize, Serialize};

/// 单次同步的结果统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// 本次开始时的待同步操作数
    pub total: usize,
    /// 成功重放并出队
    pub replayed: usize,
    /// 重放失败（保留在 outbox）
    pub failed: usize,
    /// 处于冲突状态（新检测到的和此前未解决的）
    pub conflicts: usize,
    /// 因同实体的前序操作未完成而跳过
    pub skipped: usize,
    /// 同步结束后仍在 outbox 中的操作数
    pub remaining: usize,
    /// 因网络失败提前结束
    pub interrupted: bool,
}

/// 触发同步的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// 已有同步在进行，本次触发被忽略
    AlreadyRunning,
    /// 设备离线，未发起同步
    Offline,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}
