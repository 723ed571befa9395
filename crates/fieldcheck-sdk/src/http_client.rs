//! HTTP 客户端模块 - RemoteApi 的 reqwest 实现
//!
//! 所有请求携带 CSRF token（`X-CSRFToken`）；非 2xx 响应统一转换为
//! `FieldcheckError::Http`，响应体若为 JSON 一并保留（用于校验错误的字段提示）。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{multipart, Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::api::{PhotoUpload, RemoteApi, ReplayMode};
use crate::config::FieldcheckConfig;
use crate::error::{FieldcheckError, Result};
use crate::notifications::NotificationRecord;
use crate::storage::{OperationType, RemoteSnapshot};

const CSRF_HEADER: HeaderName = HeaderName::from_static("x-csrftoken");
const FORCE_HEADER: HeaderName = HeaderName::from_static("x-force-overwrite");

/// 基于 reqwest 的远端 API 客户端
#[derive(Debug, Clone)]
pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
}

impl HttpRemoteApi {
    /// 创建新的 HTTP 客户端
    pub fn new(config: &FieldcheckConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-requested-with"),
            HeaderValue::from_static("XMLHttpRequest"),
        );
        if let Some(token) = &config.csrf_token {
            let value = HeaderValue::from_str(token)
                .map_err(|e| FieldcheckError::Config(format!("CSRF token 不是合法的 header 值: {}", e)))?;
            headers.insert(CSRF_HEADER, value);
        }

        let mut builder = Client::builder().default_headers(headers);
        if let Some(timeout) = config.http_client_config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.http_client_config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| FieldcheckError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ HTTP 客户端已创建 (base_url: {})", config.api_base_url);

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn snapshot_path(op_type: OperationType, entity_id: &str) -> String {
        match op_type {
            OperationType::Checklist => format!("/api/checklists/{}", entity_id),
            OperationType::Photo => format!("/api/checklist-photos/{}", entity_id),
        }
    }
}

/// 非 2xx 响应转换为 Http 错误
async fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str::<Value>(&text).ok();
    let message = body
        .as_ref()
        .and_then(|b| ["detail", "message", "error"].iter().find_map(|k| b.get(*k)?.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

    error!("❌ {} 失败，HTTP 状态码: {}, 错误: {}", what, status, message);
    Err(FieldcheckError::Http {
        status: status.as_u16(),
        message,
        body,
    })
}

/// 读取 JSON 响应体；空响应体返回 Null
async fn read_json(response: Response) -> Result<Value> {
    let bytes = response.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn submit_checklist(&self, payload: &Value, mode: ReplayMode) -> Result<Value> {
        let mut request = self.client.post(self.url("/api/checklists")).json(payload);
        if mode == ReplayMode::Force {
            request = request.header(FORCE_HEADER, "true");
        }
        let response = check_status(request.send().await?, "提交检查单").await?;
        debug!("📤 检查单已提交");
        read_json(response).await
    }

    async fn upload_photo(&self, upload: PhotoUpload, mode: ReplayMode) -> Result<Value> {
        let size = upload.data.len();
        let part = multipart::Part::bytes(upload.data)
            .file_name(upload.filename.clone())
            .mime_str(&upload.mime_type)
            .map_err(|e| FieldcheckError::InvalidData(format!("创建 multipart part 失败: {}", e)))?;

        let mut form = multipart::Form::new().part("photo", part);
        for (name, value) in upload.fields {
            form = form.text(name, value);
        }

        info!("📤 开始上传照片: {} ({} bytes)", upload.filename, size);
        let mut request = self.client.post(self.url("/api/checklist-photos")).multipart(form);
        if mode == ReplayMode::Force {
            request = request.header(FORCE_HEADER, "true");
        }
        let response = check_status(request.send().await?, "上传照片").await?;
        info!("✅ 照片上传成功: {}", upload.filename);
        read_json(response).await
    }

    async fn fetch_remote(&self, op_type: OperationType, entity_id: &str) -> Result<Option<RemoteSnapshot>> {
        let response = self
            .client
            .get(self.url(&Self::snapshot_path(op_type, entity_id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let payload = read_json(check_status(response, "读取服务端版本").await?).await?;
        // 未携带版本号的实体视为初始版本
        let version = payload.get("version").and_then(Value::as_i64).unwrap_or(0);
        Ok(Some(RemoteSnapshot { version, payload }))
    }

    async fn fetch_pending_notifications(&self, since: Option<DateTime<Utc>>) -> Result<Vec<NotificationRecord>> {
        let mut request = self.client.get(self.url("/ops/api/notifications/pending"));
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339_opts(SecondsFormat::Millis, true))]);
        }
        let body = read_json(check_status(request.send().await?, "拉取通知").await?).await?;

        // 服务端返回数组或 {"notifications": [...]}
        let items = match body {
            Value::Array(_) => body,
            Value::Object(mut obj) => obj.remove("notifications").unwrap_or(Value::Array(Vec::new())),
            Value::Null => Value::Array(Vec::new()),
            other => {
                return Err(FieldcheckError::InvalidData(format!("通知响应格式错误: {}", other)));
            }
        };
        Ok(serde_json::from_value(items)?)
    }

    async fn mark_notification_handled(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/ops/notifications/{}/mark-handled", id)))
            .send()
            .await?;
        check_status(response, "标记通知已处理").await?;
        Ok(())
    }

    async fn notification_action(&self, id: &str, action: &str, data: Option<Value>) -> Result<Value> {
        let mut body = serde_json::json!({ "action": action });
        if let Some(data) = data {
            body["data"] = data;
        }
        let response = self
            .client
            .post(self.url(&format!("/ops/notifications/{}/action", id)))
            .json(&body)
            .send()
            .await?;
        read_json(check_status(response, "执行通知操作").await?).await
    }

    async fn health(&self) -> Result<()> {
        let response = self.client.get(self.url("/api/health")).send().await?;
        check_status(response, "健康检查").await?;
        Ok(())
    }
}
