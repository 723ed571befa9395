//! 本地存储 schema 迁移
//!
//! 启动时显式调用一次 `migrate`：
//! - 读取 meta Tree 中记录的 schema 版本
//! - 按顺序执行所有未执行的迁移步骤
//! - 拒绝打开由更高版本 SDK 写入的存储（防 downgrade）

use sled::Db;

use crate::error::{FieldcheckError, Result};
use crate::storage::entities::EntityKind;
use crate::version::STORE_SCHEMA_VERSION;

/// meta Tree 名称
pub const META_TREE: &str = "__meta";
/// outbox Tree 名称
pub const OUTBOX_TREE: &str = "outbox";
/// 无法解析的 outbox 记录移入此 Tree，保留原始字节
pub const OUTBOX_QUARANTINE_TREE: &str = "outbox_quarantine";

const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

type MigrationStep = fn(&Db) -> Result<()>;

/// 迁移步骤，版本号即下标 + 1
const MIGRATIONS: &[(u32, &str, MigrationStep)] = &[
    (1, "create_trees", v1_create_trees),
    (2, "backfill_offline_available", v2_backfill_offline_available),
];

/// V1：创建实体 Tree 与 outbox Tree
fn v1_create_trees(db: &Db) -> Result<()> {
    for kind in EntityKind::ALL {
        db.open_tree(kind.tree_name())?;
    }
    db.open_tree(OUTBOX_TREE)?;
    Ok(())
}

/// V2：早期版本写入的缓存实体没有 offline_available 字段，统一补为 true
fn v2_backfill_offline_available(db: &Db) -> Result<()> {
    for kind in EntityKind::ALL {
        let tree = db.open_tree(kind.tree_name())?;
        for item in tree.iter() {
            let (key, value) = item?;
            let mut record: serde_json::Value = match serde_json::from_slice(&value) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("跳过无法解析的缓存记录 {}: {}", kind, e);
                    continue;
                }
            };
            if let Some(obj) = record.as_object_mut() {
                if !obj.contains_key("offline_available") {
                    obj.insert("offline_available".to_string(), serde_json::Value::Bool(true));
                    tree.insert(key, serde_json::to_vec(&record)?)?;
                }
            }
        }
    }
    Ok(())
}

/// 读取当前存储的 schema 版本；新库返回 0
pub fn current_version(db: &Db) -> Result<u32> {
    let meta = db.open_tree(META_TREE)?;
    match meta.get(SCHEMA_VERSION_KEY)? {
        Some(bytes) => {
            let arr: [u8; 4] = bytes[..]
                .try_into()
                .map_err(|_| FieldcheckError::Migration("schema_version 格式错误".to_string()))?;
            Ok(u32::from_be_bytes(arr))
        }
        None => Ok(0),
    }
}

fn set_version(db: &Db, version: u32) -> Result<()> {
    let meta = db.open_tree(META_TREE)?;
    meta.insert(SCHEMA_VERSION_KEY, version.to_be_bytes().to_vec())?;
    Ok(())
}

/// 统一迁移入口，返回迁移后的版本
pub fn migrate(db: &Db) -> Result<u32> {
    let version = current_version(db)?;
    if version > STORE_SCHEMA_VERSION {
        return Err(FieldcheckError::Migration(format!(
            "本地存储版本 {} 高于当前 SDK 支持的最高版本 {}，请升级 SDK 后再打开",
            version, STORE_SCHEMA_VERSION
        )));
    }

    for (target, name, step) in MIGRATIONS {
        if *target <= version {
            continue;
        }
        tracing::info!("执行存储迁移 V{}__{}", target, name);
        step(db).map_err(|e| FieldcheckError::Migration(format!("V{}__{} 失败: {}", target, name, e)))?;
        set_version(db, *target)?;
    }

    Ok(current_version(db)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_db() -> Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    #[test]
    fn test_fresh_store_migrates_to_latest() {
        let db = temp_db();
        assert_eq!(current_version(&db).unwrap(), 0);
        assert_eq!(migrate(&db).unwrap(), STORE_SCHEMA_VERSION);
        assert!(db.tree_names().iter().any(|n| &n[..] == OUTBOX_TREE.as_bytes()));

        // 再次执行是幂等的
        assert_eq!(migrate(&db).unwrap(), STORE_SCHEMA_VERSION);
    }

    #[test]
    fn test_backfill_offline_available() {
        let db = temp_db();
        set_version(&db, 1).unwrap();
        let tree = db.open_tree("missions").unwrap();
        let legacy = json!({
            "id": "m1",
            "kind": "mission",
            "payload": {"title": "Visite"},
            "cached_at": "2026-01-01T00:00:00Z"
        });
        tree.insert("m1", serde_json::to_vec(&legacy).unwrap()).unwrap();

        migrate(&db).unwrap();

        let stored: serde_json::Value = serde_json::from_slice(&tree.get("m1").unwrap().unwrap()).unwrap();
        assert_eq!(stored["offline_available"], json!(true));
    }

    #[test]
    fn test_refuses_newer_schema() {
        let db = temp_db();
        set_version(&db, STORE_SCHEMA_VERSION + 1).unwrap();
        assert!(matches!(migrate(&db), Err(FieldcheckError::Migration(_))));
    }
}
