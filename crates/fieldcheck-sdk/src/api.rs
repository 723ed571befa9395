//! 远端 API 接口
//!
//! `RemoteApi` 是同步协调器、连接监控和通知轮询访问服务端的唯一入口，
//! 默认实现见 `http_client::HttpRemoteApi`，测试中以内存实现替换。

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{FieldcheckError, Result};
use crate::notifications::NotificationRecord;
use crate::storage::{OperationType, RemoteSnapshot};

/// 重放模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    Normal,
    /// 冲突时选择保留本地版本：强制覆盖服务端
    Force,
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// POST /api/checklists
    async fn submit_checklist(&self, payload: &Value, mode: ReplayMode) -> Result<Value>;

    /// POST /api/checklist-photos（multipart）
    async fn upload_photo(&self, upload: PhotoUpload, mode: ReplayMode) -> Result<Value>;

    /// 读取实体在服务端的当前版本，不存在返回 None
    async fn fetch_remote(&self, op_type: OperationType, entity_id: &str) -> Result<Option<RemoteSnapshot>>;

    /// GET /ops/api/notifications/pending?since=<ISO8601>
    async fn fetch_pending_notifications(&self, since: Option<DateTime<Utc>>) -> Result<Vec<NotificationRecord>>;

    /// POST /ops/notifications/{id}/mark-handled
    async fn mark_notification_handled(&self, id: &str) -> Result<()>;

    /// POST /ops/notifications/{id}/action
    async fn notification_action(&self, id: &str, action: &str, data: Option<Value>) -> Result<Value>;

    /// GET /api/health
    async fn health(&self) -> Result<()>;
}

/// 照片上传内容（由 outbox payload 转换而来）
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoUpload {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    /// 其余表单字段
    pub fields: Vec<(String, String)>,
}

/// payload 中存放图片数据的字段名（按优先级）
const PHOTO_DATA_KEYS: [&str; 3] = ["photo_data", "photo", "blob"];

impl PhotoUpload {
    /// 把离线保存的照片 payload 转成 multipart 内容
    ///
    /// 图片数据可以是 data URL（`data:image/jpeg;base64,...`）或裸 base64；
    /// 其它非空字段作为文本字段提交，对象/数组序列化为 JSON 字符串。
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let obj = payload
            .as_object()
            .ok_or_else(|| FieldcheckError::InvalidData("照片 payload 必须是对象".to_string()))?;

        let (data_key, raw) = PHOTO_DATA_KEYS
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str).map(|s| (*key, s)))
            .ok_or_else(|| FieldcheckError::InvalidData("照片 payload 缺少图片数据".to_string()))?;

        let (mime_type, encoded) = split_data_url(raw);
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| FieldcheckError::InvalidData(format!("照片 base64 解码失败: {}", e)))?;

        let filename = obj
            .get("filename")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("photo.{}", extension_for(&mime_type)));

        let fields = obj
            .iter()
            .filter(|(key, _)| key.as_str() != data_key && key.as_str() != "filename")
            .filter_map(|(key, value)| {
                let text = match value {
                    Value::Null => return None,
                    Value::String(s) => s.clone(),
                    Value::Bool(_) | Value::Number(_) => value.to_string(),
                    Value::Array(_) | Value::Object(_) => value.to_string(),
                };
                Some((key.clone(), text))
            })
            .collect();

        Ok(Self {
            filename,
            mime_type,
            data,
            fields,
        })
    }
}

/// 拆分 data URL，返回 (mime, base64 部分)；非 data URL 视为 JPEG 裸 base64
fn split_data_url(raw: &str) -> (String, &str) {
    if let Some(rest) = raw.strip_prefix("data:") {
        if let Some((meta, encoded)) = rest.split_once(',') {
            let mime = meta.split(';').next().filter(|m| !m.is_empty()).unwrap_or("image/jpeg");
            return (mime.to_string(), encoded);
        }
    }
    ("image/jpeg".to_string(), raw)
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/heic" => "heic",
        _ => "jpg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_photo_from_data_url() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"\x89PNG fake");
        let payload = json!({
            "checklist_id": 12,
            "item_id": "kitchen-walls",
            "caption": "Crack near window",
            "photo_data": format!("data:image/png;base64,{}", encoded),
            "meta": {"w": 640},
            "ignored": null
        });

        let upload = PhotoUpload::from_payload(&payload).unwrap();
        assert_eq!(upload.mime_type, "image/png");
        assert_eq!(upload.filename, "photo.png");
        assert_eq!(upload.data, b"\x89PNG fake".to_vec());
        assert!(upload.fields.contains(&("checklist_id".to_string(), "12".to_string())));
        assert!(upload.fields.contains(&("item_id".to_string(), "kitchen-walls".to_string())));
        assert!(upload.fields.contains(&("meta".to_string(), "{\"w\":640}".to_string())));
        assert!(!upload.fields.iter().any(|(k, _)| k == "photo_data" || k == "ignored"));
    }

    #[test]
    fn test_photo_from_bare_base64_keeps_filename() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"jpeg bytes");
        let payload = json!({"photo": encoded, "filename": "facade.jpg"});
        let upload = PhotoUpload::from_payload(&payload).unwrap();
        assert_eq!(upload.mime_type, "image/jpeg");
        assert_eq!(upload.filename, "facade.jpg");
        assert!(upload.fields.is_empty());
    }

    #[test]
    fn test_photo_without_data_is_rejected() {
        assert!(PhotoUpload::from_payload(&json!({"checklist_id": 1})).is_err());
        assert!(PhotoUpload::from_payload(&json!({"photo_data": "data:image/png;base64,@@@"})).is_err());
        assert!(PhotoUpload::from_payload(&json!("not an object")).is_err());
    }
}
