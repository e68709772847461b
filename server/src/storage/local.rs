use crate::catalog::Segment;
use crate::errors::ServerError;
use crate::storage::{Locator, StorageProvider};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Serves segments straight from the HLS tree.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Removes a file under `root`, treating a missing file as already purged.
pub(crate) async fn remove_local(root: &Path, key: &str) {
    let path = root.join(key);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => debug!(path = %path.display(), "purged"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "purge: {}", e),
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    async fn offload(&self, segment: &Segment) -> Result<Locator, ServerError> {
        tokio::fs::metadata(&segment.path).await.map_err(|e| {
            ServerError::OffloadFailure(format!("{}: {}", segment.path.display(), e))
        })?;
        Ok(Locator::Local(segment.key()))
    }

    async fn purge(&self, locator: &Locator) {
        match locator {
            Locator::Local(key) => remove_local(&self.root, key).await,
            Locator::Remote(key) => warn!(key, "local storage cannot purge a remote object"),
        }
    }

    fn resolve_serving_url(&self, locator: &Locator) -> String {
        format!("/hls/{}", locator.key())
    }
}
