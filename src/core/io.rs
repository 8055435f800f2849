use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[cfg(target_arch = "wasm32")]
pub trait StorageBounds {}
#[cfg(target_arch = "wasm32")]
impl<T> StorageBounds for T {}

#[cfg(not(target_arch = "wasm32"))]
pub trait StorageBounds: Send + Sync {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Send + Sync> StorageBounds for T {}

/// Session-scoped key/value store the session is persisted to.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Storage: StorageBounds {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

// --- In-memory Implementation ---

/// Lives as long as the process; the native counterpart of a browser session.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Storage for MemoryStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.entries()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("File not found: {}", path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        self.entries().insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.entries().remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.entries().contains_key(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// --- Native Implementation ---

#[cfg(not(target_arch = "wasm32"))]
pub struct NativeStorage;

#[cfg(not(target_arch = "wasm32"))]
impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl Default for NativeStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = std::path::Path::new(prefix);
        let mut entries = Vec::new();

        if path.is_dir() {
            let mut dir = tokio::fs::read_dir(path).await?;
            while let Some(entry) = dir.next_entry().await? {
                entries.push(entry.path().to_string_lossy().to_string());
            }
        } else if path.exists() {
            entries.push(prefix.to_string());
        }

        entries.sort();
        Ok(entries)
    }
}

// --- Web Implementation ---

/// Browser `sessionStorage`; values are stored as JSON text.
#[cfg(target_arch = "wasm32")]
pub struct WebSessionStorage {
    storage: web_sys::Storage,
}

#[cfg(target_arch = "wasm32")]
impl WebSessionStorage {
    pub fn new() -> Result<Self> {
        let window = web_sys::window().ok_or_else(|| anyhow!("No window available"))?;
        let storage = window
            .session_storage()
            .map_err(|e| anyhow!("sessionStorage unavailable: {:?}", e))?
            .ok_or_else(|| anyhow!("sessionStorage unavailable"))?;
        Ok(Self { storage })
    }
}

#[cfg(target_arch = "wasm32")]
#[async_trait(?Send)]
impl Storage for WebSessionStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let value = self
            .storage
            .get_item(path)
            .map_err(|e| anyhow!("Get error: {:?}", e))?;
        value
            .map(String::into_bytes)
            .ok_or_else(|| anyhow!("File not found: {}", path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(content)?;
        self.storage
            .set_item(path, text)
            .map_err(|e| anyhow!("Set error (quota?): {:?}", e))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.storage
            .remove_item(path)
            .map_err(|e| anyhow!("Remove error: {:?}", e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let value = self
            .storage
            .get_item(path)
            .map_err(|e| anyhow!("Get error: {:?}", e))?;
        Ok(value.is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let len = self
            .storage
            .length()
            .map_err(|e| anyhow!("Length error: {:?}", e))?;
        let mut results = Vec::new();
        for i in 0..len {
            if let Ok(Some(key)) = self.storage.key(i) {
                if key.starts_with(prefix) {
                    results.push(key);
                }
            }
        }
        Ok(results)
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_native_storage_round_trip() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("session").join("chat-history.json");
        let path_str = path.to_str().unwrap();

        let storage = NativeStorage::new();
        assert!(!storage.exists(path_str).await?);

        storage.write(path_str, b"[]").await?;
        assert!(storage.exists(path_str).await?);
        assert_eq!(storage.read(path_str).await?, b"[]");

        let listed = storage
            .list(temp_dir.path().join("session").to_str().unwrap())
            .await?;
        assert_eq!(listed.len(), 1);

        storage.delete(path_str).await?;
        assert!(!storage.exists(path_str).await?);
        // Deleting again is fine.
        storage.delete(path_str).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_storage_list_by_prefix() -> Result<()> {
        let storage = MemoryStorage::new();
        storage.write("session/a.json", b"1").await?;
        storage.write("session/b.json", b"2").await?;
        storage.write("other/c.json", b"3").await?;

        let listed = storage.list("session/").await?;
        assert_eq!(listed, vec!["session/a.json", "session/b.json"]);
        assert!(storage.read("missing").await.is_err());
        Ok(())
    }
}
