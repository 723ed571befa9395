//! 错误分类与重试服务
//!
//! 分类规则（按顺序，第一个匹配生效）：
//! 1. 网络错误 → 可重试
//! 2. 超时 → 可重试
//! 3. HTTP 5xx / 408 / 429 → 可重试
//! 4. HTTP 401 / 403 / 404 / 422 → 不可重试，给出具体提示
//! 5. 其它 → 可重试（未知错误）
//!
//! 重试：每个操作键（`{context}_{operation}`）最多 `max_retries` 次，
//! 延迟 `base * 2^attempt`；成功或耗尽后清零计数。

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::FieldcheckError;

/// 失败类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    Authorization,
    NotFound,
    Validation,
    RateLimit,
    ServerError,
    NetworkError,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Validation => "validation",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// 面向用户的固定提示
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCategory::Authentication => "Your session has expired. Please sign in again.",
            ErrorCategory::Authorization => "You do not have permission to perform this action.",
            ErrorCategory::NotFound => "The requested resource could not be found.",
            ErrorCategory::Validation => "Some fields are invalid. Please check your input.",
            ErrorCategory::RateLimit => "Too many requests. Please wait a moment.",
            ErrorCategory::ServerError => "The server encountered an error. Please try again later.",
            ErrorCategory::NetworkError => "Connection problem. Check your network and try again.",
            ErrorCategory::Timeout => "The request took too long. Please try again.",
            ErrorCategory::Unknown => "An unexpected error occurred.",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorCategory::Authentication
                | ErrorCategory::Authorization
                | ErrorCategory::NotFound
                | ErrorCategory::Validation
        )
    }
}

/// 单次失败的分类结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub status: Option<u16>,
    /// 校验错误的字段级提示（仅 validation）
    pub field_errors: HashMap<String, Vec<String>>,
    /// 原始错误描述（用于日志）
    pub detail: String,
}

impl ErrorClassification {
    fn new(category: ErrorCategory, status: Option<u16>, detail: String) -> Self {
        Self {
            category,
            retryable: category.is_retryable(),
            status,
            field_errors: HashMap::new(),
            detail,
        }
    }
}

/// 对失败的 API 调用分类
pub fn classify(error: &FieldcheckError) -> ErrorClassification {
    let detail = error.to_string();
    match error {
        FieldcheckError::Network(_) => ErrorClassification::new(ErrorCategory::NetworkError, None, detail),
        FieldcheckError::Timeout(_) => ErrorClassification::new(ErrorCategory::Timeout, None, detail),
        FieldcheckError::Http { status, body, .. } => {
            let status = *status;
            match status {
                500..=599 => ErrorClassification::new(ErrorCategory::ServerError, Some(status), detail),
                408 => ErrorClassification::new(ErrorCategory::Timeout, Some(status), detail),
                429 => ErrorClassification::new(ErrorCategory::RateLimit, Some(status), detail),
                401 => ErrorClassification::new(ErrorCategory::Authentication, Some(status), detail),
                403 => ErrorClassification::new(ErrorCategory::Authorization, Some(status), detail),
                404 => ErrorClassification::new(ErrorCategory::NotFound, Some(status), detail),
                422 => {
                    let mut c = ErrorClassification::new(ErrorCategory::Validation, Some(status), detail);
                    if let Some(body) = body {
                        c.field_errors = parse_field_errors(body);
                    }
                    c
                }
                _ => ErrorClassification::new(ErrorCategory::Unknown, Some(status), detail),
            }
        }
        _ => ErrorClassification::new(ErrorCategory::Unknown, None, detail),
    }
}

/// 解析 `{"errors": {"field": ["msg"]}}` 或 `{"field": ["msg"]}` 形式的校验错误
fn parse_field_errors(body: &serde_json::Value) -> HashMap<String, Vec<String>> {
    let source = match body.get("errors") {
        Some(errors) if errors.is_object() => errors,
        _ => body,
    };
    let mut fields = HashMap::new();
    if let Some(obj) = source.as_object() {
        for (field, value) in obj {
            let messages: Vec<String> = match value {
                serde_json::Value::String(s) => vec![s.clone()],
                serde_json::Value::Array(items) => items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect(),
                _ => continue,
            };
            if !messages.is_empty() {
                fields.insert(field.clone(), messages);
            }
        }
    }
    fields
}

/// 最终失败时交给调用方（及 UI）的错误信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorReport {
    pub context: String,
    pub operation: String,
    pub category: ErrorCategory,
    pub message: String,
    pub can_retry: bool,
    /// 放弃前已执行的重试次数
    pub retries: u32,
    pub status: Option<u16>,
    pub field_errors: HashMap<String, Vec<String>>,
}

impl ApiErrorReport {
    pub fn from_classification(
        context: &str,
        operation: &str,
        classification: ErrorClassification,
        retries: u32,
    ) -> Self {
        Self {
            context: context.to_string(),
            operation: operation.to_string(),
            category: classification.category,
            message: classification.category.user_message().to_string(),
            can_retry: classification.retryable,
            retries,
            status: classification.status,
            field_errors: classification.field_errors,
        }
    }
}

impl std::fmt::Display for ApiErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{} failed ({}): {}",
            self.context,
            self.operation,
            self.category.as_str(),
            self.message
        )
    }
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_factor: config.jitter_factor,
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次重试（从 0 开始）前的等待时间：base * 2^attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let jitter = delay.as_secs_f64() * self.jitter_factor * (rand::random::<f64>() - 0.5);
        Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
    }
}

/// 单个操作键的重试状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Retrying(u32),
    Succeeded,
    Failed,
}

/// 重试服务
///
/// 以显式循环执行调用，尝试计数按 `{context}_{operation}` 记录。
#[derive(Debug)]
pub struct RetryService {
    policy: RetryPolicy,
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryService {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn key(context: &str, operation: &str) -> String {
        format!("{}_{}", context, operation)
    }

    /// 当前操作键的状态（进行中的重试次数）
    pub fn state(&self, context: &str, operation: &str) -> RetryState {
        match self.attempts.lock().get(&Self::key(context, operation)) {
            Some(n) => RetryState::Retrying(*n),
            None => RetryState::Idle,
        }
    }

    /// 执行调用，可重试的失败按退避重试，直到成功、遇到不可重试错误或次数耗尽
    pub async fn execute<T, F, Fut>(
        &self,
        context: &str,
        operation: &str,
        mut call: F,
    ) -> std::result::Result<T, ApiErrorReport>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        let key = Self::key(context, operation);
        let mut state = RetryState::Idle;

        loop {
            let error = match call().await {
                Ok(value) => {
                    if let RetryState::Retrying(n) = state {
                        info!("✅ {} 在第 {} 次重试后成功", key, n);
                    }
                    self.attempts.lock().remove(&key);
                    return Ok(value);
                }
                Err(e) => e,
            };

            let classification = classify(&error);
            let retries = match state {
                RetryState::Retrying(n) => n,
                _ => 0,
            };

            if !classification.retryable {
                warn!("❌ {} 失败且不可重试 ({}): {}", key, classification.category.as_str(), error);
                self.attempts.lock().remove(&key);
                return Err(ApiErrorReport::from_classification(context, operation, classification, retries));
            }

            let attempt = {
                let mut attempts = self.attempts.lock();
                let counter = attempts.entry(key.clone()).or_insert(0);
                if *counter >= self.policy.max_retries {
                    attempts.remove(&key);
                    None
                } else {
                    let current = *counter;
                    *counter += 1;
                    Some(current)
                }
            };

            let Some(attempt) = attempt else {
                warn!("❌ {} 重试 {} 次后仍失败: {}", key, self.policy.max_retries, error);
                return Err(ApiErrorReport::from_classification(context, operation, classification, retries));
            };

            let delay = self.policy.delay_for(attempt);
            state = RetryState::Retrying(attempt + 1);
            debug!(
                "🔄 {} 失败 ({})，{:?} 后第 {} 次重试",
                key,
                classification.category.as_str(),
                delay,
                attempt + 1
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryService {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
