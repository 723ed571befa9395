//! 通知模块
//!
//! - NotificationRecord / NotificationList: 内存中的通知列表，按 id 去重合并
//! - DeviceNotifier: 平台层实现的设备通知接口
//! - NotificationPoller: 定时拉取服务端通知

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub mod device;
pub mod poller;

pub use device::{DeviceNotification, DeviceNotifier, NoopDeviceNotifier, NotificationPermission};
pub use poller::NotificationPoller;

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    IncidentAlert,
    MissionAssigned,
    MissionUpdated,
    ChecklistSubmitted,
    ReportReady,
    SystemMessage,
    #[serde(other)]
    Unknown,
}

impl NotificationType {
    /// 优先级，数值越小越靠前
    pub fn priority(&self) -> u8 {
        match self {
            NotificationType::IncidentAlert => 0,
            NotificationType::MissionAssigned => 1,
            NotificationType::MissionUpdated => 2,
            NotificationType::ChecklistSubmitted => 3,
            NotificationType::ReportReady => 4,
            NotificationType::SystemMessage => 5,
            NotificationType::Unknown => 6,
        }
    }

    /// 设备通知是否需要用户手动关闭
    pub fn requires_interaction(&self) -> bool {
        matches!(self, NotificationType::IncidentAlert)
    }
}

/// 服务端下发的通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: Value,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid notification id: {}", other))),
    }
}

/// 排序规则：类型优先级升序，同级按创建时间倒序
fn display_order(a: &NotificationRecord, b: &NotificationRecord) -> Ordering {
    a.notification_type
        .priority()
        .cmp(&b.notification_type.priority())
        .then_with(|| b.created_at.cmp(&a.created_at))
}

/// 有序通知列表
#[derive(Debug, Clone, Default)]
pub struct NotificationList {
    items: Vec<NotificationRecord>,
}

impl NotificationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// 合并一批通知：过滤已存在的 id，新项前插后重新排序，返回真正新增的通知
    ///
    /// 同一批次内重复的 id 只保留第一条，因此重复合并不会产生重复项。
    pub fn merge(&mut self, incoming: Vec<NotificationRecord>) -> Vec<NotificationRecord> {
        let mut seen: HashSet<String> = self.items.iter().map(|n| n.id.clone()).collect();
        let fresh: Vec<NotificationRecord> = incoming
            .into_iter()
            .filter(|n| seen.insert(n.id.clone()))
            .collect();

        if !fresh.is_empty() {
            let mut merged = fresh.clone();
            merged.append(&mut self.items);
            merged.sort_by(display_order);
            self.items = merged;
        }
        fresh
    }

    pub fn remove(&mut self, id: &str) -> Option<NotificationRecord> {
        let index = self.items.iter().position(|n| n.id == id)?;
        Some(self.items.remove(index))
    }

    pub fn get(&self, id: &str) -> Option<&NotificationRecord> {
        self.items.iter().find(|n| n.id == id)
    }

    pub fn items(&self) -> &[NotificationRecord] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn sample(id: &str, notification_type: NotificationType, minutes_ago: i64) -> NotificationRecord {
    NotificationRecord {
        id: id.to_string(),
        notification_type,
        created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        title: format!("title {}", id),
        message: String::new(),
        payload: Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_is_idempotent_by_id() {
        let mut list = NotificationList::new();
        let batch = vec![
            sample("a", NotificationType::MissionAssigned, 5),
            sample("b", NotificationType::SystemMessage, 1),
        ];

        assert_eq!(list.merge(batch.clone()).len(), 2);
        assert!(list.merge(batch).is_empty());
        assert_eq!(list.len(), 2);

        // 同一批次中的重复 id
        let fresh = list.merge(vec![
            sample("c", NotificationType::ReportReady, 0),
            sample("c", NotificationType::ReportReady, 0),
        ]);
        assert_eq!(fresh.len(), 1);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_sorted_by_priority_then_recency() {
        let mut list = NotificationList::new();
        list.merge(vec![
            sample("old-mission", NotificationType::MissionAssigned, 30),
            sample("system", NotificationType::SystemMessage, 0),
        ]);
        list.merge(vec![
            sample("new-mission", NotificationType::MissionAssigned, 2),
            sample("incident", NotificationType::IncidentAlert, 60),
        ]);

        let ids: Vec<&str> = list.items().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["incident", "new-mission", "old-mission", "system"]);
    }

    #[test]
    fn test_remove_and_get() {
        let mut list = NotificationList::new();
        list.merge(vec![sample("a", NotificationType::SystemMessage, 0)]);
        assert!(list.get("a").is_some());
        assert_eq!(list.remove("a").map(|n| n.id), Some("a".to_string()));
        assert!(list.remove("a").is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_deserialize_server_record() {
        let record: NotificationRecord = serde_json::from_value(json!({
            "id": 42,
            "type": "incident_alert",
            "created_at": "2026-05-02T10:00:00Z",
            "title": "Gas smell reported",
            "payload": {"mission_id": 3}
        }))
        .unwrap();
        assert_eq!(record.id, "42");
        assert_eq!(record.notification_type, NotificationType::IncidentAlert);
        assert!(record.notification_type.requires_interaction());
        assert_eq!(record.payload["mission_id"], 3);

        let unknown: NotificationRecord = serde_json::from_value(json!({
            "id": "x", "type": "brand_new_kind", "created_at": "2026-05-02T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(unknown.notification_type, NotificationType::Unknown);
        assert_eq!(unknown.notification_type.priority(), 6);
    }
}
