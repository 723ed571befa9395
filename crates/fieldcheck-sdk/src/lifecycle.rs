//! SDK 生命周期管理
//!
//! 管理页面可见性（前台 / 后台）切换，统一触发各模块的状态切换。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Result;

/// 生命周期回调 Hook
///
/// 各模块通过实现此 trait 来响应可见性变化
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// 页面隐藏 / App 切换到后台时调用
    async fn on_background(&self) -> Result<()>;

    /// 页面重新可见 / App 切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;
}

/// 生命周期管理器
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
    foreground: AtomicBool,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            hooks: Vec::new(),
            foreground: AtomicBool::new(true),
        }
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    /// 注册生命周期回调 Hook
    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 通知所有 Hook：切换到后台
    ///
    /// 按注册顺序执行，某个 Hook 失败时记录错误并继续执行其他 Hook，最后返回第一个错误
    pub async fn notify_background(&self) -> Result<()> {
        if !self.foreground.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("🔄 通知所有模块：切换到后台");

        let mut first_error = None;
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_background().await {
                warn!("⚠️ Hook #{} 后台切换失败: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// 通知所有 Hook：切换到前台
    pub async fn notify_foreground(&self) -> Result<()> {
        if self.foreground.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("🔄 通知所有模块：切换到前台");

        let mut first_error = None;
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_foreground().await {
                warn!("⚠️ Hook #{} 前台切换失败: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FieldcheckError;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl LifecycleHook for Recorder {
        async fn on_background(&self) -> Result<()> {
            self.log.lock().push(format!("{}:bg", self.name));
            if self.fail {
                return Err(FieldcheckError::Other("hook failed".into()));
            }
            Ok(())
        }

        async fn on_foreground(&self) -> Result<()> {
            self.log.lock().push(format!("{}:fg", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hooks_run_in_order_despite_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = LifecycleManager::new();
        for (name, fail) in [("a", true), ("b", false)] {
            manager.register_hook(Arc::new(Recorder {
                name,
                log: log.clone(),
                fail,
            }));
        }

        assert!(manager.notify_background().await.is_err());
        assert!(!manager.is_foreground());
        // 重复的后台通知被忽略
        assert!(manager.notify_background().await.is_ok());
        manager.notify_foreground().await.unwrap();

        assert_eq!(log.lock().clone(), vec!["a:bg", "b:bg", "a:fg", "b:fg"]);
        assert_eq!(manager.hook_count(), 2);
    }
}
