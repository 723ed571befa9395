use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::RemoteApi;
use crate::error::Result;
use crate::events::{AppEvent, EventBus};
use crate::storage::LocalStore;
use crate::sync::{SyncCoordinator, SyncOutcome};

/// 平台上报的网络状态（与浏览器 online / offline 事件一一对应）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
}

impl NetworkStatus {
    /// 是否可以尝试访问服务端
    pub fn is_reachable(&self) -> bool {
        matches!(self, NetworkStatus::Online)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: u64,
}

/// 网络状态监听器trait（由平台层实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 默认监听器：始终报告在线，不产生状态变化
///
/// 平台层应提供真实实现；否则监控永远不会进入 Offline，同步失败的操作停留在 Pending。
#[derive(Debug, Default)]
pub struct DefaultNetworkStatusListener {
    sender: Mutex<Option<broadcast::Sender<NetworkStatusEvent>>>,
}

#[async_trait]
impl NetworkStatusListener for DefaultNetworkStatusListener {
    async fn get_current_status(&self) -> NetworkStatus {
        NetworkStatus::Online
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        let (tx, rx) = broadcast::channel(1);
        *self.sender.lock() = Some(tx);
        Ok(rx)
    }

    async fn stop_monitoring(&self) {
        self.sender.lock().take();
    }
}

/// 连接状态（供 UI 状态指示使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
    /// 正在重放 outbox
    Syncing,
    /// 在线但 outbox 非空
    Pending,
}

/// 连接监控
///
/// 离线 → 在线：进入 Syncing 并执行一次同步，结束后 outbox 为空则 Online，否则 Pending。
/// 在线 → 离线：无论是否有同步在进行，立即进入 Offline。
/// 只有平台的离线事件会进入 Offline；同步因网络失败中断后停留在 Pending。
pub struct ConnectivityMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    coordinator: Arc<SyncCoordinator>,
    store: LocalStore,
    api: Arc<dyn RemoteApi>,
    events: Arc<EventBus>,
    state: RwLock<ConnectivityState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    pub fn new(
        listener: Arc<dyn NetworkStatusListener>,
        coordinator: Arc<SyncCoordinator>,
        store: LocalStore,
        api: Arc<dyn RemoteApi>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            listener,
            coordinator,
            store,
            api,
            events,
            state: RwLock::new(ConnectivityState::Offline),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.read()
    }

    pub fn is_online(&self) -> bool {
        self.state() != ConnectivityState::Offline
    }

    fn set_state(&self, new_state: ConnectivityState) {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);
        if old_state != new_state {
            info!("🌐 连接状态: {:?} → {:?}", old_state, new_state);
            self.events.emit(AppEvent::ConnectivityChanged { old_state, new_state });
        }
    }

    /// 按平台当前状态确定初始状态
    pub async fn initialize(&self) -> ConnectivityState {
        let status = self.listener.get_current_status().await;
        let state = if status.is_reachable() {
            self.online_resting_state().await
        } else {
            ConnectivityState::Offline
        };
        self.set_state(state);
        state
    }

    async fn online_resting_state(&self) -> ConnectivityState {
        match self.store.pending_count().await {
            Ok(0) => ConnectivityState::Online,
            Ok(_) => ConnectivityState::Pending,
            Err(e) => {
                warn!("读取 outbox 数量失败: {}", e);
                ConnectivityState::Pending
            }
        }
    }

    /// 启动监听（平台状态变化驱动状态机）
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.initialize().await;
        let mut receiver = self.listener.start_monitoring().await?;
        let monitor = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if event.new_status.is_reachable() {
                            // 同步在独立任务中进行，期间的离线事件可以立即处理
                            let monitor = monitor.clone();
                            tokio::spawn(async move { monitor.handle_status_change(event).await });
                        } else {
                            monitor.handle_status_change(event).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("网络状态事件积压，跳过 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("网络状态监听结束");
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.listener.stop_monitoring().await;
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// 处理一次平台网络状态变化
    pub async fn handle_status_change(&self, event: NetworkStatusEvent) {
        debug!("网络状态变化: {:?} → {:?}", event.old_status, event.new_status);
        if event.new_status.is_reachable() {
            if self.state() == ConnectivityState::Offline {
                // 失败已在 sync_now 中记录
                let _ = self.sync_now().await;
            }
        } else {
            self.set_state(ConnectivityState::Offline);
        }
    }

    /// 手动触发同步
    ///
    /// 处于 Offline 时先询问平台当前状态，平台报告在线则照常同步
    /// （在线事件可能已丢失）。
    pub async fn trigger_sync(&self) -> Result<SyncOutcome> {
        if self.state() == ConnectivityState::Offline && !self.listener.get_current_status().await.is_reachable() {
            debug!("离线状态，不触发同步");
            return Ok(SyncOutcome::Offline);
        }
        self.sync_now().await
    }

    async fn sync_now(&self) -> Result<SyncOutcome> {
        let previous = std::mem::replace(&mut *self.state.write(), ConnectivityState::Syncing);
        if previous != ConnectivityState::Syncing {
            info!("🌐 连接状态: {:?} → {:?}", previous, ConnectivityState::Syncing);
            self.events.emit(AppEvent::ConnectivityChanged {
                old_state: previous,
                new_state: ConnectivityState::Syncing,
            });
        }

        let outcome = self.coordinator.run().await;
        match &outcome {
            Ok(SyncOutcome::AlreadyRunning) => {
                // 正在运行的那次同步负责结束 Syncing；本次只撤销自己的切换
                if previous != ConnectivityState::Syncing && self.state() == ConnectivityState::Syncing {
                    self.set_state(previous);
                }
                return outcome;
            }
            Ok(SyncOutcome::Completed(report)) if report.interrupted => {
                info!("同步因网络失败中断，剩余 {} 条等待下次触发", report.remaining);
            }
            Ok(_) => {}
            Err(e) => warn!("同步失败: {}", e),
        }

        // 同步期间已离线则保持离线
        if self.state() == ConnectivityState::Syncing {
            let resting = self.online_resting_state().await;
            self.set_state(resting);
        }
        outcome
    }

    /// 请求 `/api/health` 确认服务端可达
    ///
    /// 成功且当前为 Offline 时恢复在线并同步；失败只返回 false，不改变状态。
    pub async fn check_connectivity(&self) -> bool {
        match self.api.health().await {
            Ok(()) => {
                if self.state() == ConnectivityState::Offline {
                    info!("健康检查成功，恢复在线");
                    if let Err(e) = self.sync_now().await {
                        warn!("恢复在线后同步失败: {}", e);
                    }
                }
                true
            }
            Err(e) if e.is_transport_failure() => {
                debug!("健康检查失败，服务端不可达: {}", e);
                false
            }
            Err(e) => {
                warn!("健康检查返回错误: {}", e);
                false
            }
        }
    }

    /// outbox 变化后刷新 Online / Pending
    pub async fn refresh_pending(&self) {
        if matches!(self.state(), ConnectivityState::Online | ConnectivityState::Pending) {
            let resting = self.online_resting_state().await;
            self.set_state(resting);
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}


#[cfg(test)]
pub use test_helpers::DummyNetworkStatusListener;
