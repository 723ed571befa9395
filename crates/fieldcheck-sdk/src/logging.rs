//! 日志初始化
//!
//! 宿主应用可以自行安装 tracing subscriber；未安装时调用 `init_tracing`。
//! 过滤规则优先取 `RUST_LOG`，否则按 debug_mode 选择 debug / info。

use tracing_subscriber::EnvFilter;

use crate::error::{FieldcheckError, Result};

/// 安装全局 fmt subscriber，重复安装返回错误
pub fn init_tracing(debug_mode: bool) -> Result<()> {
    let default_level = if debug_mode { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fieldcheck_sdk={},warn", default_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| FieldcheckError::Config(format!("初始化日志失败: {}", e)))
}
