//! Chart artifact storage. Rendered chart specs are written here and served
//! back to the chat front-end by key.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, io::AsyncWriteExt};

use crate::infrastructure::config::StorageConfig;

#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    async fn url_for(&self, key: &str) -> anyhow::Result<Option<String>>;
}

pub fn build_storage(config: &StorageConfig) -> anyhow::Result<Arc<dyn ArtifactStorage>> {
    match config.provider.as_str() {
        "local" => Ok(Arc::new(LocalArtifacts::new(config.local_path.clone())?)),
        "memory" => Ok(Arc::new(MemoryArtifacts::default())),
        other => anyhow::bail!("unsupported storage provider: {other}"),
    }
}

fn local_storage_root(path: Option<&str>) -> PathBuf {
    PathBuf::from(path.unwrap_or("./artifacts"))
}

struct LocalArtifacts {
    root: PathBuf,
}

impl LocalArtifacts {
    fn new(path: Option<String>) -> anyhow::Result<Self> {
        let root = local_storage_root(path.as_deref());
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn validate_key(&self, key: &str) -> anyhow::Result<PathBuf> {
        if key.trim().is_empty() {
            anyhow::bail!("invalid artifact key: {key}");
        }

        let path = Path::new(key);
        if path.is_absolute() {
            anyhow::bail!("invalid artifact key: {key}");
        }

        let mut sanitized = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => sanitized.push(part),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    anyhow::bail!("invalid artifact key: {key}")
                }
            }
        }

        if sanitized.as_os_str().is_empty() {
            anyhow::bail!("invalid artifact key: {key}");
        }

        Ok(sanitized)
    }
}

#[async_trait]
impl ArtifactStorage for LocalArtifacts {
    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> anyhow::Result<()> {
        let sanitized = self.validate_key(key)?;
        let path = self.root.join(sanitized);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(path).await?;
        file.write_all(&data).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let sanitized = self.validate_key(key)?;
        let path = self.root.join(sanitized);
        if fs::try_exists(&path).await? {
            fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn url_for(&self, key: &str) -> anyhow::Result<Option<String>> {
        let sanitized = self.validate_key(key)?;
        let mut path = PathBuf::from("/artifacts");
        path.push(sanitized);
        Ok(Some(path.to_string_lossy().to_string()))
    }
}

#[derive(Default)]
struct MemoryArtifacts {
    objects: RwLock<HashMap<String, Bytes>>,
}

#[async_trait]
impl ArtifactStorage for MemoryArtifacts {
    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> anyhow::Result<()> {
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    async fn url_for(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(Some(format!("memory://{key}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_key_accepts_relative_paths() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let storage = LocalArtifacts {
            root: tmp_dir.path().to_path_buf(),
        };

        let sanitized = storage.validate_key("charts/req-1.json").unwrap();
        assert_eq!(sanitized, PathBuf::from("charts/req-1.json"));
    }

    #[test]
    fn validate_key_rejects_parent_directory_components() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let storage = LocalArtifacts {
            root: tmp_dir.path().to_path_buf(),
        };

        assert!(storage.validate_key("../secrets.txt").is_err());
        assert!(storage.validate_key("charts/../../secrets.txt").is_err());
    }

    #[test]
    fn validate_key_rejects_absolute_paths() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let storage = LocalArtifacts {
            root: tmp_dir.path().to_path_buf(),
        };

        assert!(storage.validate_key("/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn memory_storage_round_trips() {
        let storage = MemoryArtifacts::default();
        storage
            .put("charts/a.json", Bytes::from_static(b"{}"), "application/json")
            .await
            .unwrap();

        let url = storage.url_for("charts/a.json").await.unwrap();
        assert_eq!(url.as_deref(), Some("memory://charts/a.json"));
    }
}
