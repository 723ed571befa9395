//! 通知轮询器
//!
//! 单一定时器：前台每 30 秒、后台每 60 秒拉取一次 `since` 上次拉取时间之后的通知；
//! 回到前台时立即拉取。上一次拉取未完成时下一次照常发起，合并按 id 幂等。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::device::{DeviceNotification, DeviceNotifier, NotificationPermission};
use super::{NotificationList, NotificationRecord};
use crate::api::RemoteApi;
use crate::config::PollerConfig;
use crate::error::Result;
use crate::events::{AppEvent, EventBus};
use crate::lifecycle::LifecycleHook;
use crate::retry::{ApiErrorReport, RetryService};

const RETRY_CONTEXT: &str = "notifications";

pub struct NotificationPoller {
    api: Arc<dyn RemoteApi>,
    retry: Arc<RetryService>,
    events: Arc<EventBus>,
    notifier: Arc<dyn DeviceNotifier>,
    config: PollerConfig,
    list: RwLock<NotificationList>,
    read: Mutex<HashSet<String>>,
    last_fetch: Mutex<Option<DateTime<Utc>>>,
    visible: AtomicBool,
    wake: Notify,
    /// 设备通知权限只在第一次需要时询问
    permission: tokio::sync::Mutex<Option<NotificationPermission>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationPoller {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        retry: Arc<RetryService>,
        events: Arc<EventBus>,
        notifier: Arc<dyn DeviceNotifier>,
        config: PollerConfig,
    ) -> Self {
        Self {
            api,
            retry,
            events,
            notifier,
            config,
            list: RwLock::new(NotificationList::new()),
            read: Mutex::new(HashSet::new()),
            last_fetch: Mutex::new(None),
            visible: AtomicBool::new(true),
            wake: Notify::new(),
            permission: tokio::sync::Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// 当前轮询间隔
    pub fn interval(&self) -> Duration {
        if self.visible.load(Ordering::SeqCst) {
            self.config.visible_interval()
        } else {
            self.config.hidden_interval()
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// 启动定时轮询（立即拉取一次）
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("通知轮询已禁用");
            return;
        }
        let mut task = self.task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            debug!("通知轮询已在运行");
            return;
        }

        let poller = self.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                let fetcher = poller.clone();
                tokio::spawn(async move {
                    // 失败已通过事件上报
                    let _ = fetcher.fetch_now().await;
                });

                let interval = poller.interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = poller.wake.notified() => {
                        debug!("页面重新可见，立即拉取通知");
                    }
                }
            }
        }));
        info!("🔔 通知轮询已启动 (间隔 {:?})", self.interval());
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("通知轮询已停止");
        }
    }

    /// 页面可见性变化；重新可见时恢复前台间隔并立即拉取
    pub fn set_visible(&self, visible: bool) {
        let was_visible = self.visible.swap(visible, Ordering::SeqCst);
        if visible && !was_visible {
            self.wake.notify_one();
        }
        debug!("页面可见性: {} → {}", was_visible, visible);
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    /// 拉取一次并合并，返回新增条数
    pub async fn fetch_now(&self) -> std::result::Result<usize, ApiErrorReport> {
        let since = *self.last_fetch.lock();
        let started_at = Utc::now();

        let result = self
            .retry
            .execute(RETRY_CONTEXT, "fetch", || self.api.fetch_pending_notifications(since))
            .await;

        let incoming = match result {
            Ok(items) => items,
            Err(report) => {
                warn!("拉取通知失败: {}", report);
                self.events.emit(AppEvent::NotificationsError { report: report.clone() });
                return Err(report);
            }
        };

        {
            let mut last = self.last_fetch.lock();
            if last.map(|t| t < started_at).unwrap_or(true) {
                *last = Some(started_at);
            }
        }

        let (fresh, snapshot) = {
            let mut list = self.list.write();
            let fresh = list.merge(incoming);
            (fresh, list.items().to_vec())
        };
        if fresh.is_empty() {
            return Ok(0);
        }

        info!("🔔 收到 {} 条新通知", fresh.len());
        self.events.emit(AppEvent::NotificationsUpdated {
            notifications: snapshot,
            new_count: fresh.len(),
        });

        if self.config.device_notifications {
            for notification in &fresh {
                self.raise_device_notification(notification).await;
            }
        }
        Ok(fresh.len())
    }

    async fn raise_device_notification(&self, notification: &NotificationRecord) {
        let permission = {
            let mut cached = self.permission.lock().await;
            match *cached {
                Some(p) => p,
                None => {
                    let mut p = self.notifier.permission().await;
                    if p == NotificationPermission::Prompt {
                        p = self.notifier.request_permission().await;
                    }
                    *cached = Some(p);
                    p
                }
            }
        };
        if permission != NotificationPermission::Granted {
            return;
        }

        let require_interaction = notification.notification_type.requires_interaction();
        let device = DeviceNotification {
            tag: notification.id.clone(),
            title: notification.title.clone(),
            body: notification.message.clone(),
            require_interaction,
            auto_dismiss: if require_interaction {
                None
            } else {
                Some(Duration::from_secs(self.config.auto_dismiss_secs))
            },
        };
        if let Err(e) = self.notifier.show(device).await {
            warn!("显示设备通知失败 {}: {}", notification.id, e);
        }
    }

    /// 标记为已处理：通知服务端并从本地列表移除
    pub async fn mark_handled(&self, id: &str) -> std::result::Result<(), ApiErrorReport> {
        self.retry
            .execute(RETRY_CONTEXT, "mark_handled", || self.api.mark_notification_handled(id))
            .await?;

        self.list.write().remove(id);
        self.read.lock().remove(id);
        self.events.emit(AppEvent::NotificationHandled {
            notification_id: id.to_string(),
        });
        Ok(())
    }

    /// 对通知执行服务端操作（如确认、指派）
    pub async fn perform_action(
        &self,
        id: &str,
        action: &str,
        data: Option<Value>,
    ) -> std::result::Result<Value, ApiErrorReport> {
        self.retry
            .execute(RETRY_CONTEXT, "action", || {
                self.api.notification_action(id, action, data.clone())
            })
            .await
    }

    /// 用户点击通知：标记已读并发布事件
    pub fn click(&self, id: &str) -> Option<NotificationRecord> {
        let notification = self.list.read().get(id).cloned()?;
        self.read.lock().insert(id.to_string());
        self.events.emit(AppEvent::NotificationClicked {
            notification: notification.clone(),
        });
        Some(notification)
    }

    pub fn unread_count(&self) -> usize {
        let read = self.read.lock();
        self.list
            .read()
            .items()
            .iter()
            .filter(|n| !read.contains(&n.id))
            .count()
    }

    /// 当前通知列表快照（已排序）
    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.list.read().items().to_vec()
    }

    pub fn last_fetch(&self) -> Option<DateTime<Utc>> {
        *self.last_fetch.lock()
    }
}

#[async_trait]
impl LifecycleHook for NotificationPoller {
    async fn on_background(&self) -> Result<()> {
        self.set_visible(false);
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        self.set_visible(true);
        Ok(())
    }
}

impl Drop for NotificationPoller {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
