//! 会话存储抽象层
//!
//! 按对话方持久化会话上下文标识（线程 ID 等）：派发前读取，成功解析后写回。
//! 支持内存和文件两种实现。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::core::RelayError;

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 读取对话方的上下文标识
    async fn load(&self, conversant_id: &str) -> Option<String>;

    /// 写入对话方的上下文标识
    async fn save(&self, conversant_id: &str, context: &str) -> Result<(), RelayError>;
}

/// 内存会话存储
#[derive(Default)]
pub struct MemorySessionStore {
    contexts: RwLock<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, conversant_id: &str) -> Option<String> {
        self.contexts.read().await.get(conversant_id).cloned()
    }

    async fn save(&self, conversant_id: &str, context: &str) -> Result<(), RelayError> {
        self.contexts
            .write()
            .await
            .insert(conversant_id.to_string(), context.to_string());
        Ok(())
    }
}

/// 文件会话存储：一个 JSON 文档（conversant_id -> context），先写临时文件再 rename
pub struct FileSessionStore {
    path: PathBuf,
    cache: RwLock<HashMap<String, String>>,
    /// 串行化落盘，保证文件内容与最后一次写入一致
    write_gate: Mutex<()>,
}

impl FileSessionStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref().to_path_buf();
        let cache = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => HashMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            cache: RwLock::new(cache),
            write_gate: Mutex::new(()),
        })
    }

    async fn persist(&self) -> Result<(), RelayError> {
        let _gate = self.write_gate.lock().await;
        let snapshot = serde_json::to_vec_pretty(&*self.cache.read().await)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &snapshot).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, conversant_id: &str) -> Option<String> {
        self.cache.read().await.get(conversant_id).cloned()
    }

    async fn save(&self, conversant_id: &str, context: &str) -> Result<(), RelayError> {
        self.cache
            .write()
            .await
            .insert(conversant_id.to_string(), context.to_string());
        self.persist().await
    }
}

/// 创建会话存储
///
/// 提供 path 时使用文件存储；打开失败则退回内存存储
pub async fn create_session_store(path: Option<&Path>) -> Arc<dyn SessionStore> {
    if let Some(path) = path {
        match FileSessionStore::open(path).await {
            Ok(store) => {
                tracing::info!("Using file session store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open file session store, falling back to memory: {}", e);
            }
        }
    }

    tracing::info!("Using in-memory session store");
    Arc::new(MemorySessionStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemorySessionStore::new();
        assert!(store.load("c1").await.is_none());
        store.save("c1", "thread_abc").await.unwrap();
        assert_eq!(store.load("c1").await.as_deref(), Some("thread_abc"));
        store.save("c1", "thread_def").await.unwrap();
        assert_eq!(store.load("c1").await.as_deref(), Some("thread_def"));
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions").join("contexts.json");

        let store = FileSessionStore::open(&path).await.unwrap();
        store.save("c1", "thread_1").await.unwrap();
        store.save("c2", "thread_2").await.unwrap();
        store.save("c2", "thread_3").await.unwrap();
        drop(store);

        let reopened = FileSessionStore::open(&path).await.unwrap();
        assert_eq!(reopened.load("c1").await.as_deref(), Some("thread_1"));
        assert_eq!(reopened.load("c2").await.as_deref(), Some("thread_3"));
    }

    #[tokio::test]
    async fn test_corrupt_file_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contexts.json");
        std::fs::write(&path, b"not json").unwrap();

        assert!(FileSessionStore::open(&path).await.is_err());
        let store = create_session_store(Some(&path)).await;
        store.save("c1", "ctx").await.unwrap();
        assert_eq!(store.load("c1").await.as_deref(), Some("ctx"));
    }
}
