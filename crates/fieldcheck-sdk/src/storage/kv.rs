//! KV 存储模块 - 基于 sled 的本地持久化
//!
//! 本模块提供：
//! - sled 数据库的打开（带锁冲突退避重试）
//! - 按名称获取 Tree（每类缓存实体一个 Tree，outbox 一个 Tree）
//! - 与服务端无关的单调自增 ID

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sled::{Db, Tree};

use crate::error::{FieldcheckError, Result};
use crate::storage::KvStats;

/// KV 存储组件
#[derive(Debug, Clone)]
pub struct KvStore {
    base_path: PathBuf,
    db: Arc<Db>,
}

impl KvStore {
    /// 打开 {base_path}/store 下的 sled 数据库
    pub async fn open(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("store");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| FieldcheckError::IO(format!("创建本地存储目录失败: {}", e)))?;

        // 上一个实例可能刚释放文件锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 200;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => {
                    tracing::info!("本地存储已打开: {}", kv_path.display());
                    return Ok(Self {
                        base_path,
                        db: Arc::new(db),
                    });
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }

        Err(FieldcheckError::KvStore(
            last_err
                .map(|e| format!("打开 sled 数据库失败: {}", e))
                .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
        ))
    }

    /// 临时内存数据库（测试与无磁盘环境）
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| FieldcheckError::KvStore(format!("打开临时数据库失败: {}", e)))?;
        Ok(Self {
            base_path: PathBuf::new(),
            db: Arc::new(db),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    /// 打开（不存在则创建）指定名称的 Tree
    pub fn tree(&self, name: &str) -> Result<Tree> {
        self.db
            .open_tree(name)
            .map_err(|e| FieldcheckError::KvStore(format!("打开 Tree {} 失败: {}", name, e)))
    }

    /// 单调递增 ID，跨重启持久
    pub fn generate_id(&self) -> Result<u64> {
        self.db
            .generate_id()
            .map_err(|e| FieldcheckError::KvStore(format!("生成自增 ID 失败: {}", e)))
    }

    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| FieldcheckError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }

    /// 获取指定 Tree 的统计信息
    pub fn stats(&self, name: &str) -> Result<KvStats> {
        let tree = self.tree(name)?;
        Ok(KvStats {
            tree_name: name.to_string(),
            key_count: tree.len() as u64,
            size_on_disk: self.db.size_on_disk().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = KvStore::open(temp_dir.path()).await.unwrap();
            let tree = store.tree("missions").unwrap();
            tree.insert("m1", b"hello".to_vec()).unwrap();
            store.flush().await.unwrap();
        }

        let store = KvStore::open(temp_dir.path()).await.unwrap();
        let tree = store.tree("missions").unwrap();
        assert_eq!(tree.get("m1").unwrap().unwrap().as_ref(), b"hello");
        assert_eq!(store.stats("missions").unwrap().key_count, 1);
    }

    #[tokio::test]
    async fn test_generate_id_is_monotonic() {
        let store = KvStore::temporary().unwrap();
        let a = store.generate_id().unwrap();
        let b = store.generate_id().unwrap();
        let c = store.generate_id().unwrap();
        assert!(a < b && b < c);
    }
}
