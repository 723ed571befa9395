//! 设备通知接口（由平台层实现）

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// 设备通知权限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationPermission {
    /// 尚未询问用户
    Prompt,
    Granted,
    Denied,
}

/// 交给平台显示的设备通知
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceNotification {
    /// 同一 tag 的通知会替换旧通知
    pub tag: String,
    pub title: String,
    pub body: String,
    pub require_interaction: bool,
    /// 自动关闭时间；None 表示需用户手动关闭
    pub auto_dismiss: Option<Duration>,
}

#[async_trait]
pub trait DeviceNotifier: Send + Sync {
    /// 当前权限状态
    async fn permission(&self) -> NotificationPermission;

    /// 向用户请求权限
    async fn request_permission(&self) -> NotificationPermission;

    async fn show(&self, notification: DeviceNotification) -> Result<()>;
}

/// 无设备通知能力的平台
#[derive(Debug, Default)]
pub struct NoopDeviceNotifier;

#[async_trait]
impl DeviceNotifier for NoopDeviceNotifier {
    async fn permission(&self) -> NotificationPermission {
        NotificationPermission::Denied
    }

    async fn request_permission(&self) -> NotificationPermission {
        NotificationPermission::Denied
    }

    async fn show(&self, notification: DeviceNotification) -> Result<()> {
        debug!("设备通知不可用，忽略: {}", notification.tag);
        Ok(())
    }
}
