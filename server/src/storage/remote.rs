use crate::catalog::Segment;
use crate::config::Remote;
use crate::errors::ServerError;
use crate::storage::local::remove_local;
use crate::storage::{Locator, StorageProvider};
use async_trait::async_trait;
use bytes::Bytes;
use opendal::layers::TimeoutLayer;
use opendal::services::S3;
use opendal::Operator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// S3 compatible object storage (AWS S3, MinIO, R2 and the like).
pub struct RemoteStorage {
    operator: Operator,
    public_url: String,
    /// Local HLS root, for purging local copies.
    local_root: PathBuf,
    /// Uploads in flight, one cell per key so concurrent offloads of a
    /// segment share one upload. Finished locators live in the archive.
    uploads: Mutex<HashMap<String, Arc<OnceCell<Locator>>>>,
    uploaded: AtomicUsize,
}

impl RemoteStorage {
    pub fn new(settings: &Remote, local_root: impl Into<PathBuf>) -> Result<Self, ServerError> {
        let mut builder = S3::default()
            .endpoint(&settings.endpoint)
            .bucket(&settings.bucket)
            .region(&settings.region)
            .root(&settings.root);
        if let Some(key) = &settings.access_key_id {
            builder = builder.access_key_id(key);
        }
        if let Some(secret) = &settings.secret_access_key {
            builder = builder.secret_access_key(secret);
        }

        let operator = Operator::new(builder)
            .map_err(|e| ServerError::ConfigError(format!("storage.remote: {}", e)))?
            .layer(TimeoutLayer::new().with_timeout(settings.timeout))
            .finish();

        info!(
            bucket = %settings.bucket,
            endpoint = %settings.endpoint,
            "remote storage ready"
        );
        Ok(Self::with_operator(operator, settings.serving_base(), local_root))
    }

    pub fn with_operator(
        operator: Operator,
        public_url: String,
        local_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            operator,
            public_url: public_url.trim_end_matches('/').to_string(),
            local_root: local_root.into(),
            uploads: Mutex::new(HashMap::new()),
            uploaded: AtomicUsize::new(0),
        }
    }

    /// Number of physical uploads performed.
    pub fn uploaded(&self) -> usize {
        self.uploaded.load(Ordering::Relaxed)
    }

    async fn upload(&self, segment: &Segment) -> Result<Locator, ServerError> {
        let key = segment.key();

        // Already there from an earlier offload of the same segment.
        if let Ok(meta) = self.operator.stat(&key).await {
            if meta.content_length() == segment.size {
                debug!(key, "segment already offloaded");
                return Ok(Locator::Remote(key));
            }
        }

        let data = tokio::fs::read(&segment.path).await.map_err(|e| {
            ServerError::OffloadFailure(format!("read {}: {}", segment.path.display(), e))
        })?;

        self.operator
            .write(&key, Bytes::from(data))
            .await
            .map_err(|e| ServerError::OffloadFailure(format!("{}: {}", key, e)))?;

        self.uploaded.fetch_add(1, Ordering::Relaxed);
        info!(key, size = segment.size, "segment offloaded");
        Ok(Locator::Remote(key))
    }
}

#[async_trait]
impl StorageProvider for RemoteStorage {
    async fn offload(&self, segment: &Segment) -> Result<Locator, ServerError> {
        let key = segment.key();
        let cell = {
            let mut uploads = self.uploads.lock();
            Arc::clone(uploads.entry(key.clone()).or_default())
        };

        // A failed upload leaves the cell empty so a later call can retry.
        let result = cell.get_or_try_init(|| self.upload(segment)).await.cloned();

        let mut uploads = self.uploads.lock();
        if uploads.get(&key).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            uploads.remove(&key);
        }
        result
    }

    async fn purge(&self, locator: &Locator) {
        match locator {
            Locator::Local(key) => remove_local(&self.local_root, key).await,
            Locator::Remote(key) => {
                if let Err(e) = self.operator.delete(key).await {
                    warn!(key, "purge: {}", e);
                }
            }
        }
    }

    fn resolve_serving_url(&self, locator: &Locator) -> String {
        match locator {
            Locator::Local(key) => format!("/hls/{}", key),
            Locator::Remote(key) => join_url(&self.public_url, key),
        }
    }
}

/// Joins a base url and a relative key with exactly one slash.
pub fn join_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/'))
}
