use crate::AdapterError;
use async_trait::async_trait;
use onboard_core::{BlobStorage, OnboardError};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Blob storage on the local filesystem, served elsewhere under `base_url`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Resolve `path` under the root, refusing anything that could escape it.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AdapterError> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(AdapterError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>, OnboardError> {
        let file = self.resolve(path)?;
        tokio::fs::read(&file).await.map_err(|source| {
            AdapterError::Io {
                path: path.to_string(),
                source,
            }
            .into()
        })
    }
}

#[async_trait]
impl BlobStorage for FsBlobStore {
    fn backend_label(&self) -> &'static str {
        "filesystem"
    }

    async fn put(
        &self,
        bytes: Vec<u8>,
        path: &str,
        content_type: &str,
    ) -> Result<String, OnboardError> {
        let file = self.resolve(path)?;
        let io_err = |source| AdapterError::Io {
            path: path.to_string(),
            source,
        };
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let size = bytes.len();
        tokio::fs::write(&file, bytes).await.map_err(io_err)?;

        info!(path, size, content_type, "blob stored");
        Ok(self.url_for(path))
    }

    async fn delete(&self, path: &str) -> Result<(), OnboardError> {
        let file = self.resolve(path)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {
                debug!(path, "blob deleted");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(AdapterError::Io {
                path: path.to_string(),
                source,
            }
            .into()),
        }
    }
}
