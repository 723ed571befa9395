//! SDK 应用上下文
//!
//! `FieldcheckSdk::initialize` 按依赖顺序显式构造所有服务：
//! 本地存储 → 远端 API → 重试服务 → 事件总线 → 同步协调器 → 连接监控 → 通知轮询 → 生命周期。
//! 不使用全局单例，UI 层通过此上下文访问各服务。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{PhotoUpload, RemoteApi, ReplayMode};
use crate::config::FieldcheckConfig;
use crate::error::Result;
use crate::events::{AppEvent, EventBus, Subscription};
use crate::http_client::HttpRemoteApi;
use crate::lifecycle::LifecycleManager;
use crate::network::{ConnectivityMonitor, ConnectivityState, DefaultNetworkStatusListener, NetworkStatusListener};
use crate::notifications::{DeviceNotifier, NoopDeviceNotifier, NotificationPoller};
use crate::retry::{RetryPolicy, RetryService};
use crate::storage::{CachedEntity, EntityKind, LocalStore, OperationAction, OperationType};
use crate::sync::{ConflictRecord, ConflictResolution, SyncCoordinator, SyncOutcome};

/// 由宿主平台提供的能力
pub struct PlatformServices {
    pub network_listener: Arc<dyn NetworkStatusListener>,
    pub notifier: Arc<dyn DeviceNotifier>,
    /// 为 None 时使用基于 reqwest 的 HttpRemoteApi
    pub api: Option<Arc<dyn RemoteApi>>,
}

impl Default for PlatformServices {
    fn default() -> Self {
        Self {
            network_listener: Arc::new(DefaultNetworkStatusListener::default()),
            notifier: Arc::new(NoopDeviceNotifier),
            api: None,
        }
    }
}

/// 提交一次写入的结果
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// 已写入 outbox，等待同步
    Queued { operation_id: u64 },
    /// 已写入 outbox 并在本次调用中同步完成
    Synced { operation_id: u64 },
    /// 本地存储不可用，直接提交到服务端
    SentDirectly(Value),
}

pub struct FieldcheckSdk {
    config: FieldcheckConfig,
    store: LocalStore,
    api: Arc<dyn RemoteApi>,
    retry: Arc<RetryService>,
    events: Arc<EventBus>,
    coordinator: Arc<SyncCoordinator>,
    monitor: Arc<ConnectivityMonitor>,
    poller: Arc<NotificationPoller>,
    lifecycle: LifecycleManager,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl FieldcheckSdk {
    /// 使用默认平台能力初始化
    pub async fn initialize(config: FieldcheckConfig) -> Result<Arc<Self>> {
        Self::initialize_with(config, PlatformServices::default()).await
    }

    pub async fn initialize_with(config: FieldcheckConfig, platform: PlatformServices) -> Result<Arc<Self>> {
        config.validate()?;
        if config.debug_mode {
            // 宿主已安装 subscriber 时沿用宿主的
            if let Err(e) = crate::logging::init_tracing(true) {
                debug!("沿用已安装的 tracing subscriber: {}", e);
            }
        }
        info!("正在初始化 FieldcheckSdk v{}...", crate::version::SDK_VERSION);

        // === 第1层：本地存储（失败时降级为纯在线）===
        let store = LocalStore::open(&config.data_dir).await;

        // === 第2层：远端 API ===
        let api: Arc<dyn RemoteApi> = match platform.api {
            Some(api) => api,
            None => Arc::new(HttpRemoteApi::new(&config)?),
        };

        // === 第3层：重试服务与事件总线 ===
        let retry = Arc::new(RetryService::new(RetryPolicy::from(&config.retry)));
        let events = Arc::new(EventBus::new(config.event_config.buffer_size));

        // === 第4层：同步协调器与连接监控 ===
        let coordinator = Arc::new(SyncCoordinator::new(store.clone(), api.clone(), events.clone()));
        let monitor = Arc::new(ConnectivityMonitor::new(
            platform.network_listener,
            coordinator.clone(),
            store.clone(),
            api.clone(),
            events.clone(),
        ));

        // === 第5层：通知轮询 ===
        let poller = Arc::new(NotificationPoller::new(
            api.clone(),
            retry.clone(),
            events.clone(),
            platform.notifier,
            config.poller.clone(),
        ));

        // === 第6层：生命周期 ===
        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(poller.clone());

        info!("✅ FieldcheckSdk 初始化完成 (离线存储可用: {})", store.is_available());
        Ok(Arc::new(Self {
            config,
            store,
            api,
            retry,
            events,
            coordinator,
            monitor,
            poller,
            lifecycle,
            sweep_task: Mutex::new(None),
            started: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &FieldcheckConfig {
        &self.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn poller(&self) -> &Arc<NotificationPoller> {
        &self.poller
    }

    pub fn retry(&self) -> &Arc<RetryService> {
        &self.retry
    }

    /// 订阅事件（`"*"` 订阅全部）
    pub fn subscribe<F>(&self, event_name: &str, listener: F) -> Subscription
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(event_name, listener)
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.monitor.state()
    }

    /// 启动连接监控、通知轮询和过期缓存清理
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("SDK 已启动");
            return Ok(());
        }

        self.monitor.start().await?;
        if self.monitor.state() == ConnectivityState::Pending {
            let monitor = self.monitor.clone();
            tokio::spawn(async move {
                if let Err(e) = monitor.trigger_sync().await {
                    warn!("启动时同步失败: {}", e);
                }
            });
        }

        self.poller.start();
        self.start_eviction_sweep();
        info!("🚀 FieldcheckSdk 已启动");
        Ok(())
    }

    fn start_eviction_sweep(&self) {
        let store = self.store.clone();
        let retention_days = self.config.storage.retention_days;
        let interval = Duration::from_secs(self.config.storage.eviction_interval_secs.max(1));

        let handle = tokio::spawn(async move {
            loop {
                match store.evict_older_than(retention_days).await {
                    Ok(removed) => debug!("过期缓存清理完成: removed={}", removed),
                    Err(e) => warn!("过期缓存清理失败: {}", e),
                }
                tokio::time::sleep(interval).await;
            }
        });
        if let Some(previous) = self.sweep_task.lock().replace(handle) {
            previous.abort();
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("正在关闭 FieldcheckSdk...");
        self.poller.stop();
        self.monitor.stop().await;
        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }
        self.store.flush().await?;
        self.started.store(false, Ordering::SeqCst);
        info!("FieldcheckSdk 关闭完成");
        Ok(())
    }

    /// 页面可见性变化
    pub async fn set_visible(&self, visible: bool) -> Result<()> {
        if visible {
            self.lifecycle.notify_foreground().await
        } else {
            self.lifecycle.notify_background().await
        }
    }

    /// 提交检查单
    pub async fn submit_checklist(&self, payload: Value) -> Result<SubmitOutcome> {
        self.submit(OperationType::Checklist, payload, None, None).await
    }

    /// 提交照片（payload 中的图片为 data URL 或 base64）
    pub async fn submit_photo(&self, payload: Value) -> Result<SubmitOutcome> {
        self.submit(OperationType::Photo, payload, None, None).await
    }

    /// 提交对已有实体的修改，附带本地快照所基于的服务端版本用于冲突检测
    pub async fn submit_update(
        &self,
        op_type: OperationType,
        entity_id: &str,
        base_version: i64,
        payload: Value,
    ) -> Result<SubmitOutcome> {
        self.submit(op_type, payload, Some(entity_id.to_string()), Some(base_version))
            .await
    }

    /// 先写 outbox，在线时立即同步
    async fn submit(
        &self,
        op_type: OperationType,
        payload: Value,
        entity_id: Option<String>,
        base_version: Option<i64>,
    ) -> Result<SubmitOutcome> {
        let queued = self
            .store
            .enqueue_operation_for(op_type, OperationAction::Create, payload.clone(), entity_id, base_version)
            .await?;

        let Some(operation) = queued else {
            info!("离线存储不可用，直接提交 {}", op_type);
            let response = match op_type {
                OperationType::Checklist => self.api.submit_checklist(&payload, ReplayMode::Normal).await?,
                OperationType::Photo => {
                    self.api
                        .upload_photo(PhotoUpload::from_payload(&payload)?, ReplayMode::Normal)
                        .await?
                }
            };
            return Ok(SubmitOutcome::SentDirectly(response));
        };

        self.coordinator.publish_pending().await?;
        self.monitor.refresh_pending().await;

        match self.monitor.trigger_sync().await {
            Ok(SyncOutcome::Completed(_)) | Ok(SyncOutcome::AlreadyRunning) => {}
            Ok(SyncOutcome::Offline) => debug!("离线，操作 {} 等待同步", operation.id),
            Err(e) => warn!("提交后同步失败: {}", e),
        }

        let still_pending = self.store.get_operation(operation.id).await?.is_some();
        Ok(if still_pending {
            SubmitOutcome::Queued {
                operation_id: operation.id,
            }
        } else {
            SubmitOutcome::Synced {
                operation_id: operation.id,
            }
        })
    }

    /// 缓存服务端返回的列表
    pub async fn cache_entities(&self, kind: EntityKind, records: Vec<Value>) -> Result<usize> {
        self.store.put_many(kind, records).await
    }

    pub async fn cached(&self, kind: EntityKind) -> Vec<CachedEntity> {
        self.store.get_all(kind).await
    }

    pub async fn cached_by_id(&self, kind: EntityKind, id: &str) -> Option<CachedEntity> {
        self.store.get_by_id(kind, id).await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.store.pending_count().await
    }

    pub async fn trigger_sync(&self) -> Result<SyncOutcome> {
        self.monitor.trigger_sync().await
    }

    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.coordinator.conflicts()
    }

    pub async fn resolve_conflict(&self, operation_id: u64, resolution: ConflictResolution) -> Result<()> {
        self.coordinator.resolve_conflict(operation_id, resolution).await?;
        self.monitor.refresh_pending().await;
        Ok(())
    }
}

impl Drop for FieldcheckSdk {
    fn drop(&mut self) {
        if let Some(task) = self.sweep_task.get_mut().take() {
            task.abort();
        }
    }
}
