//! 通用键值存储接口
//!
//! `Store<K, V>` 是本地存储的最小抽象：异步 get/put/delete/scan。
//! - `SledStore`：基于 sled Tree 的持久化实现
//! - `MemoryStore`：基于 BTreeMap 的内存实现
//!
//! scan 按键的字节序返回，u64 键以大端编码，因此自增 ID 的扫描顺序即插入顺序。

use std::collections::BTreeMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Tree;
use tokio::sync::RwLock;

use crate::error::{FieldcheckError, Result};

/// 存储键编码
pub trait StoreKey: Clone + Ord + Send + Sync + 'static {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self>;
}

impl StoreKey for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| FieldcheckError::InvalidData(format!("键不是合法 UTF-8: {}", e)))
    }
}

impl StoreKey for u64 {
    fn encode(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| FieldcheckError::InvalidData(format!("u64 键长度错误: {}", bytes.len())))?;
        Ok(u64::from_be_bytes(arr))
    }
}

/// 存储值约束
pub trait StoreValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

#[async_trait]
pub trait Store<K, V>: Send + Sync
where
    K: StoreKey,
    V: StoreValue,
{
    async fn get(&self, key: &K) -> Result<Option<V>>;

    /// 插入或覆盖
    async fn put(&self, key: &K, value: &V) -> Result<()>;

    /// 删除，返回键是否存在
    async fn delete(&self, key: &K) -> Result<bool>;

    /// 按键序全量扫描
    async fn scan(&self) -> Result<Vec<(K, V)>>;

    async fn len(&self) -> Result<usize> {
        Ok(self.scan().await?.len())
    }
}

/// 基于 sled Tree 的持久化存储
pub struct SledStore<K, V> {
    tree: Tree,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> SledStore<K, V> {
    pub fn new(tree: Tree) -> Self {
        Self {
            tree,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<K, V> Store<K, V> for SledStore<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    async fn get(&self, key: &K) -> Result<Option<V>> {
        match self.tree.get(key.encode())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &K, value: &V) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.tree.insert(key.encode(), bytes)?;
        Ok(())
    }

    async fn delete(&self, key: &K) -> Result<bool> {
        Ok(self.tree.remove(key.encode())?.is_some())
    }

    async fn scan(&self) -> Result<Vec<(K, V)>> {
        let mut results = Vec::with_capacity(self.tree.len());
        for item in self.tree.iter() {
            let (key, bytes) = item?;
            let key = K::decode(&key)?;
            match serde_json::from_slice::<V>(&bytes) {
                Ok(value) => results.push((key, value)),
                Err(e) => {
                    // 单条损坏不影响其它记录
                    tracing::warn!("跳过无法反序列化的记录: {}", e);
                }
            }
        }
        Ok(results)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.tree.len())
    }
}

/// 内存存储
pub struct MemoryStore<K, V> {
    entries: RwLock<BTreeMap<K, V>>,
}

impl<K: StoreKey, V: StoreValue> MemoryStore<K, V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<K: StoreKey, V: StoreValue> Default for MemoryStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V> Store<K, V> for MemoryStore<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    async fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &K, value: &V) -> Result<()> {
        self.entries.write().await.insert(key.clone(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &K) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn scan(&self) -> Result<Vec<(K, V)>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}
