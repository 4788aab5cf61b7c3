//! Persistent storage backends for replica values.

use std::marker::PhantomData;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::StorageError;

/// Where a replica persists its committed value.
#[async_trait]
pub trait Storage<T>: Send + Sync {
    async fn write(&self, value: &T) -> Result<(), StorageError>;

    /// Returns `Ok(None)` when nothing has been stored.
    async fn read(&self) -> Result<Option<T>, StorageError>;

    async fn remove(&self) -> Result<(), StorageError>;
}

/// In-process storage. Survives replica clears but not process restarts.
#[derive(Debug)]
pub struct MemoryStorage<T> {
    value: RwLock<Option<T>>,
}

impl<T> Default for MemoryStorage<T> {
    fn default() -> Self {
        Self {
            value: RwLock::new(None),
        }
    }
}

impl<T> MemoryStorage<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: T) -> Self {
        Self {
            value: RwLock::new(Some(value)),
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> Storage<T> for MemoryStorage<T> {
    async fn write(&self, value: &T) -> Result<(), StorageError> {
        *self.value.write().await = Some(value.clone());
        Ok(())
    }

    async fn read(&self) -> Result<Option<T>, StorageError> {
        Ok(self.value.read().await.clone())
    }

    async fn remove(&self) -> Result<(), StorageError> {
        *self.value.write().await = None;
        Ok(())
    }
}

/// Stores the value as a JSON document in a single file.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-write leaves the previous value intact. A missing file reads as
/// no data.
#[derive(Debug)]
pub struct JsonFileStorage<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStorage<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl<T> Storage<T> for JsonFileStorage<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn write(&self, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, &bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        trace!(path = %self.path.display(), size = bytes.len(), "wrote storage file");
        Ok(())
    }

    async fn read(&self) -> Result<Option<T>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self) -> Result<(), StorageError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed storage file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        followers: u32,
    }

    #[tokio::test]
    async fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.read().await.unwrap(), None);

        storage.write(&"hello".to_string()).await.unwrap();
        assert_eq!(storage.read().await.unwrap(), Some("hello".to_string()));

        storage.remove().await.unwrap();
        assert_eq!(storage.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_file_storage_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage: JsonFileStorage<Profile> = JsonFileStorage::new(dir.path().join("p.json"));
        assert_eq!(storage.read().await.unwrap(), None);
        storage.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_json_file_storage_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("profile.json");
        let profile = Profile {
            name: "alice".to_string(),
            followers: 42,
        };

        JsonFileStorage::new(&path).write(&profile).await.unwrap();

        let reopened: JsonFileStorage<Profile> = JsonFileStorage::new(&path);
        assert_eq!(reopened.read().await.unwrap(), Some(profile));
        assert!(!reopened.temp_path().exists());
    }

    #[tokio::test]
    async fn test_json_file_storage_corrupt_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let storage: JsonFileStorage<Profile> = JsonFileStorage::new(&path);
        assert!(matches!(storage.read().await, Err(StorageError::Json(_))));
    }
}
