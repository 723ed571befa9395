//! 事件系统模块 - 向 UI 层发布同步、连接与通知相关事件
//!
//! 功能包括：
//! - 类型化事件 `AppEvent`，每个变体对应一个固定事件名
//! - 按事件名订阅回调，返回 `Subscription` 句柄，显式 dispose（或 drop）即退订
//! - 广播通道订阅（异步消费）
//! - 事件统计

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::network::ConnectivityState;
use crate::notifications::NotificationRecord;
use crate::retry::ApiErrorReport;
use crate::sync::{ConflictRecord, SyncReport};

/// 通配订阅名
pub const ALL_EVENTS: &str = "*";

/// SDK 事件
#[derive(Debug, Clone, Serialize)]
pub enum AppEvent {
    /// 通知列表已更新
    NotificationsUpdated {
        notifications: Vec<NotificationRecord>,
        new_count: usize,
    },
    /// 通知拉取最终失败
    NotificationsError { report: ApiErrorReport },
    /// 用户点击了某条通知
    NotificationClicked { notification: NotificationRecord },
    /// 通知已标记为处理
    NotificationHandled { notification_id: String },
    /// 检测到同步冲突，需要用户决定
    SyncConflict { conflict: ConflictRecord },
    SyncStarted { pending: usize },
    SyncProgress {
        processed: usize,
        total: usize,
        operation_id: u64,
    },
    SyncCompleted { report: SyncReport },
    /// 单条操作重放失败（保留在 outbox 中等待下次触发）
    SyncFailed {
        operation_id: Option<u64>,
        report: ApiErrorReport,
    },
    /// outbox 中待同步操作数量变化
    PendingChanges { count: usize },
    /// outbox 中有记录无法解析，已移入隔离区，不会再被重放
    OutboxCorrupted { operation_ids: Vec<u64> },
    ConnectivityChanged {
        old_state: ConnectivityState,
        new_state: ConnectivityState,
    },
}

impl AppEvent {
    /// 事件名
    pub fn name(&self) -> &'static str {
        match self {
            AppEvent::NotificationsUpdated { .. } => "notifications:updated",
            AppEvent::NotificationsError { .. } => "notifications:error",
            AppEvent::NotificationClicked { .. } => "notification:clicked",
            AppEvent::NotificationHandled { .. } => "notification:handled",
            AppEvent::SyncConflict { .. } => "sync-conflict",
            AppEvent::SyncStarted { .. } => "sync-started",
            AppEvent::SyncProgress { .. } => "sync-progress",
            AppEvent::SyncCompleted { .. } => "sync-completed",
            AppEvent::SyncFailed { .. } => "sync-failed",
            AppEvent::PendingChanges { .. } => "pending-changes",
            AppEvent::OutboxCorrupted { .. } => "outbox-corrupted",
            AppEvent::ConnectivityChanged { .. } => "connectivity-changed",
        }
    }
}

/// 事件监听器类型
pub type EventListener = Arc<dyn Fn(&AppEvent) + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    listeners: HashMap<u64, (String, EventListener)>,
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
}

/// 订阅句柄；dispose 或 drop 时退订
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    event_name: String,
    registry: Weak<RwLock<ListenerRegistry>>,
}

impl Subscription {
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// 监听器是否仍在注册表中
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .map(|r| r.read().listeners.contains_key(&self.id))
            .unwrap_or(false)
    }

    /// 显式退订
    pub fn dispose(self) {
        // Drop 中完成移除
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.write().listeners.remove(&self.id).is_some() {
                debug!("Removed listener #{} for {}", self.id, self.event_name);
            }
        }
    }
}

/// 事件总线
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
    registry: Arc<RwLock<ListenerRegistry>>,
    stats: RwLock<EventStats>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            registry: Arc::new(RwLock::new(ListenerRegistry::default())),
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: AppEvent) {
        let name = event.name();
        debug!("Emitting event: {}", name);

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_type.entry(name.to_string()).or_insert(0) += 1;
        }

        // 先拷出监听器再调用，回调中可以安全地订阅/退订
        let listeners: Vec<EventListener> = self
            .registry
            .read()
            .listeners
            .values()
            .filter(|(event_name, _)| event_name == name || event_name == ALL_EVENTS)
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(&event);
        }

        // 无订阅者时 send 失败属正常场景
        if let Err(e) = self.sender.send(event) {
            debug!("No active receivers for {}: {}", name, e);
        }
    }

    /// 按事件名订阅（`"*"` 订阅全部）
    pub fn subscribe<F>(&self, event_name: &str, listener: F) -> Subscription
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.registry.write();
            registry.next_id += 1;
            let id = registry.next_id;
            registry
                .listeners
                .insert(id, (event_name.to_string(), Arc::new(listener)));
            id
        };
        debug!("Added listener #{} for event: {}", id, event_name);
        Subscription {
            id,
            event_name: event_name.to_string(),
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// 广播订阅（异步消费全部事件）
    pub fn receiver(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.registry.read().listeners.len()
    }

    pub fn stats(&self) -> EventStats {
        let mut stats = self.stats.read().clone();
        stats.listener_count = self.listener_count();
        stats
    }
}
