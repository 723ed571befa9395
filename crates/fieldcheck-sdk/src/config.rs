//! SDK 配置
//!
//! 所有服务在 `FieldcheckSdk::initialize` 时根据此配置显式构造。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FieldcheckError, Result};

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）；None 表示沿用 reqwest 默认行为
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(30),
            request_timeout_secs: Some(120), // 照片上传可能需要较长时间
        }
    }
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 每个操作键的最大重试次数
    pub max_retries: u32,
    /// 基础延迟（毫秒），第 n 次重试延迟为 base * 2^n
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 随机抖动因子 (0.0-1.0)，默认不抖动
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_factor: 0.0,
        }
    }
}

/// 缓存保留天数上限
pub const MAX_RETENTION_DAYS: u32 = 3650;

/// 本地存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 缓存实体保留天数
    pub retention_days: u32,
    /// 过期清理周期（秒）
    pub eviction_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            eviction_interval_secs: 6 * 3600,
        }
    }
}

/// 通知轮询配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// 是否启用轮询
    pub enabled: bool,
    /// 前台轮询间隔（秒）
    pub visible_interval_secs: u64,
    /// 后台（页面隐藏）轮询间隔（秒）
    pub hidden_interval_secs: u64,
    /// 新通知是否弹出设备级通知
    pub device_notifications: bool,
    /// 设备通知自动关闭时间（秒），最高优先级类型除外
    pub auto_dismiss_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            visible_interval_secs: 30,
            hidden_interval_secs: 60,
            device_notifications: true,
            auto_dismiss_secs: 5,
        }
    }
}

impl PollerConfig {
    pub fn visible_interval(&self) -> Duration {
        Duration::from_secs(self.visible_interval_secs)
    }

    pub fn hidden_interval(&self) -> Duration {
        Duration::from_secs(self.hidden_interval_secs)
    }
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 广播通道容量
    pub buffer_size: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

/// Fieldcheck SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldcheckConfig {
    /// 数据存储目录（sled 数据库位于 {data_dir}/store）
    pub data_dir: PathBuf,
    /// 远端 API 基础 URL，例如 https://app.example.com
    pub api_base_url: String,
    /// CSRF token（由页面 meta 标签或登录流程获取）
    pub csrf_token: Option<String>,
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub poller: PollerConfig,
    pub http_client_config: HttpClientConfig,
    pub event_config: EventConfig,
    /// 调试模式：初始化时安装 debug 级别的 tracing subscriber（宿主未安装时）
    pub debug_mode: bool,
}

impl Default for FieldcheckConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./fieldcheck_data"),
            api_base_url: "http://localhost:8000".to_string(),
            csrf_token: None,
            storage: StorageConfig::default(),
            retry: RetryConfig::default(),
            poller: PollerConfig::default(),
            http_client_config: HttpClientConfig::default(),
            event_config: EventConfig::default(),
            debug_mode: false,
        }
    }
}

impl FieldcheckConfig {
    pub fn builder() -> FieldcheckConfigBuilder {
        FieldcheckConfigBuilder::new()
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(FieldcheckError::Config("api_base_url 不能为空".to_string()));
        }
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(FieldcheckError::Config(format!(
                "api_base_url 必须以 http:// 或 https:// 开头: {}",
                self.api_base_url
            )));
        }
        if self.storage.retention_days == 0 || self.storage.retention_days > MAX_RETENTION_DAYS {
            return Err(FieldcheckError::Config(format!(
                "retention_days 必须在 1-{} 之间: {}",
                MAX_RETENTION_DAYS, self.storage.retention_days
            )));
        }
        if self.poller.visible_interval_secs == 0 || self.poller.hidden_interval_secs == 0 {
            return Err(FieldcheckError::Config("轮询间隔必须大于 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(FieldcheckError::Config("jitter_factor 必须在 0.0-1.0 之间".to_string()));
        }
        Ok(())
    }
}

pub struct FieldcheckConfigBuilder {
    config: FieldcheckConfig,
}

impl FieldcheckConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FieldcheckConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn csrf_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.csrf_token = Some(token.into());
        self
    }

    pub fn retention_days(mut self, days: u32) -> Self {
        self.config.storage.retention_days = days;
        self
    }

    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn poller_config(mut self, poller: PollerConfig) -> Self {
        self.config.poller = poller;
        self
    }

    pub fn http_client_config(mut self, http: HttpClientConfig) -> Self {
        self.config.http_client_config = http;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_config.buffer_size = size;
        self
    }

    pub fn debug_mode(mut self, debug: bool) -> Self {
        self.config.debug_mode = debug;
        self
    }

    pub fn build(self) -> FieldcheckConfig {
        self.config
    }
}

impl Default for FieldcheckConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = FieldcheckConfig::builder()
            .api_base_url("https://inspect.example.com/")
            .csrf_token("token")
            .build();

        assert_eq!(config.api_base_url, "https://inspect.example.com");
        assert_eq!(config.storage.retention_days, 7);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.poller.visible_interval(), Duration::from_secs(30));
        assert_eq!(config.poller.hidden_interval(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let config = FieldcheckConfig::builder().api_base_url("ftp://nope").build();
        assert!(matches!(config.validate(), Err(FieldcheckError::Config(_))));

        let config = FieldcheckConfig::builder().retention_days(0).build();
        assert!(config.validate().is_err());

        let config = FieldcheckConfig::builder().retention_days(MAX_RETENTION_DAYS + 1).build();
        assert!(matches!(config.validate(), Err(FieldcheckError::Config(_))));
        let config = FieldcheckConfig::builder().retention_days(MAX_RETENTION_DAYS).build();
        assert!(config.validate().is_ok());
    }
}
