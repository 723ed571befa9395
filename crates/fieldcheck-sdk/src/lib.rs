//! Fieldcheck SDK - 现场检查应用的离线缓存与同步客户端
//!
//! 本 SDK 提供：
//! - 💾 离线缓存：任务、检查单、照片的本地 KV 存储，按保留期自动清理
//! - 📤 outbox：离线写入先入队，恢复在线后按顺序重放，冲突交给用户决定
//! - 📡 连接监控：在线 / 离线 / 同步中 / 待同步 状态机
//! - 🔔 通知轮询：定时拉取、按优先级排序、设备通知
//! - 🔁 错误分类与指数退避重试
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use fieldcheck_sdk::{FieldcheckConfig, FieldcheckSdk};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FieldcheckConfig::builder()
//!         .data_dir("/path/to/data")
//!         .api_base_url("https://inspect.example.com")
//!         .csrf_token("token-from-page")
//!         .build();
//!
//!     let sdk = FieldcheckSdk::initialize(config).await?;
//!     let _sub = sdk.subscribe("sync-completed", |event| {
//!         println!("同步完成: {:?}", event);
//!     });
//!     sdk.start().await?;
//!
//!     // 离线时写入 outbox，在线时立即同步
//!     sdk.submit_checklist(json!({"mission_id": 12, "items": []})).await?;
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod http_client;
pub mod lifecycle;
pub mod logging;
pub mod network;
pub mod notifications;
pub mod retry;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod version;

// 重新导出核心类型，方便使用
pub use api::{PhotoUpload, RemoteApi, ReplayMode};
pub use config::{
    EventConfig, FieldcheckConfig, FieldcheckConfigBuilder, HttpClientConfig, PollerConfig, RetryConfig,
    StorageConfig,
};
pub use error::{FieldcheckError, Result};
pub use events::{AppEvent, EventBus, Subscription, ALL_EVENTS};
pub use http_client::HttpRemoteApi;
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use network::{
    ConnectivityMonitor, ConnectivityState, DefaultNetworkStatusListener, NetworkStatus, NetworkStatusEvent,
    NetworkStatusListener,
};
pub use notifications::{
    DeviceNotification, DeviceNotifier, NotificationList, NotificationPermission, NotificationPoller,
    NotificationRecord, NotificationType,
};
pub use retry::{classify, ApiErrorReport, ErrorCategory, RetryPolicy, RetryService};
pub use sdk::{FieldcheckSdk, PlatformServices, SubmitOutcome};
pub use storage::{CachedEntity, EntityKind, LocalStore, OperationAction, OperationType, PendingOperation};
pub use sync::{ConflictRecord, ConflictResolution, SyncCoordinator, SyncOutcome, SyncReport};
pub use version::SDK_VERSION;
