// Artifact retrieval used while staging workspace files.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use crate::job::Job;

/// Read-only access to artifacts stored on behalf of jobs.
#[async_trait]
pub trait Store: Send + Sync {
    async fn exists(&self, job: &Job, bucket: &str, key: &str) -> Result<bool>;
    async fn get(&self, job: &Job, bucket: &str, key: &str) -> Result<Vec<u8>>;
}

/// Artifacts laid out as `<root>/<bucket>/<key>` on local disk.
#[derive(Debug, Clone)]
pub struct LocalFilesStore {
    root: PathBuf,
}

impl LocalFilesStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(bucket).join(key);
        if !is_contained(&relative) {
            anyhow::bail!("artifact path {relative:?} escapes the store");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Store for LocalFilesStore {
    async fn exists(&self, _job: &Job, bucket: &str, key: &str) -> Result<bool> {
        let path = self.object_path(bucket, key)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn get(&self, _job: &Job, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read artifact {bucket}/{key}"))
    }
}

/// Whether `path` is relative and never climbs above its starting point.
pub(crate) fn is_contained(path: &Path) -> bool {
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}
