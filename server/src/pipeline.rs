use crate::catalog::watcher::OutputWatcher;
use crate::catalog::{CatalogOptions, SegmentCatalog};
use crate::config::{Backend, Setting};
use crate::errors::ServerError;
use crate::notify::webhook::WebhookDelivery;
use crate::notify::{DispatchSettings, EventDelivery, NotificationDispatcher};
use crate::offline::{OfflineContentSupplier, OfflineSettings};
use crate::session::{SessionSettings, StreamSessionManager};
use crate::storage::local::LocalStorage;
use crate::storage::offload::OffloadPool;
use crate::storage::remote::RemoteStorage;
use crate::storage::{ArchiveIndex, StorageProvider};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};
use transcoder::{FfmpegTranscoder, HlsLayout, Transcoder};

/// Every long-lived component, wired together.
pub struct Pipeline {
    pub sessions: Arc<StreamSessionManager>,
    pub catalog: Arc<SegmentCatalog>,
    pub storage: Arc<dyn StorageProvider>,
    pub notifier: Arc<NotificationDispatcher>,
    pub offline: Arc<OfflineContentSupplier>,
    offload: Option<(Arc<OffloadPool>, usize)>,
    poll_interval: Duration,
    drain_timeout: Duration,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinSet<()>>>,
}

impl Pipeline {
    /// Wires the ffmpeg transcoder and the configured webhooks.
    pub fn build(setting: &Setting) -> Result<Self, ServerError> {
        let layout = HlsLayout::new(&setting.hls.root);
        let transcoder = Arc::new(FfmpegTranscoder::new(setting.transcoder.clone(), layout));

        let mut deliveries: Vec<Arc<dyn EventDelivery>> = Vec::new();
        for url in setting.notifications.webhooks.iter() {
            let webhook = WebhookDelivery::new(url, setting.notifications.timeout)?;
            deliveries.push(Arc::new(webhook));
        }

        Self::assemble(setting, transcoder, deliveries)
    }

    pub fn assemble(
        setting: &Setting,
        transcoder: Arc<dyn Transcoder>,
        deliveries: Vec<Arc<dyn EventDelivery>>,
    ) -> Result<Self, ServerError> {
        let layout = HlsLayout::new(&setting.hls.root);
        let storage: Arc<dyn StorageProvider> = match (&setting.storage.backend, &setting.storage.remote) {
            (Backend::Remote, Some(remote)) => {
                info!(endpoint = %remote.endpoint, "storage: remote");
                Arc::new(RemoteStorage::new(remote, layout.root())?)
            }
            _ => {
                info!(root = %layout.root().display(), "storage: local");
                Arc::new(LocalStorage::new(layout.root()))
            }
        };

        let archive = Arc::new(ArchiveIndex::with_capacity(setting.retention.archive_entries));
        let offload = setting.storage.offload.then(|| {
            let pool = Arc::new(OffloadPool::new(
                Arc::clone(&storage),
                Arc::clone(&archive),
                setting.storage.queue,
                setting.storage.retain_local,
                setting.retention.purge_archive,
            ));
            (pool, setting.storage.workers)
        });

        let catalog = Arc::new(SegmentCatalog::new(
            &setting.renditions,
            layout,
            Arc::clone(&storage),
            offload.as_ref().map(|(pool, _)| Arc::clone(pool)),
            archive,
            CatalogOptions {
                persist_manifests: setting.hls.persist_manifests,
                session_grace: setting.retention.session_grace,
                purge_archive: setting.retention.purge_archive,
            },
        ));

        let offline = Arc::new(OfflineContentSupplier::new(
            Arc::clone(&transcoder),
            Arc::clone(&catalog),
            &setting.renditions,
            OfflineSettings {
                logo: setting.offline.logo.clone(),
                clip: setting.offline.clip.clone(),
                rendered_clip: setting.offline.rendered_clip.clone(),
                placeholder: setting
                    .offline
                    .placeholder
                    .clone()
                    .with_ffmpeg(&setting.transcoder.ffmpeg),
                restart: setting.offline.restart.clone(),
                stable_after: setting.offline.stable_after,
                webroot: setting.http.webroot.clone(),
            },
        ));

        let notifications = &setting.notifications;
        let notifier = Arc::new(NotificationDispatcher::new(
            DispatchSettings {
                workers: notifications.workers,
                queue: notifications.queue,
                max_attempts: notifications.max_attempts,
                backoff: notifications.backoff.clone(),
            },
            deliveries,
        ));

        let sessions = Arc::new(StreamSessionManager::new(
            SessionSettings {
                stream_key: setting.ingest.stream_key.clone(),
                liveness_timeout: setting.session.liveness_timeout,
            },
            setting.renditions.clone(),
            transcoder,
            Arc::clone(&catalog),
            Arc::clone(&offline),
            Arc::clone(&notifier),
        ));

        Ok(Self {
            sessions,
            catalog,
            storage,
            notifier,
            offline,
            offload,
            poll_interval: setting.hls.poll_interval,
            drain_timeout: setting.http.shutdown_timeout,
            shutdown: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the background workers and brings up the offline stream.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.catalog.prepare().await?;

        let mut tasks = Vec::new();
        if let Some((pool, workers)) = &self.offload {
            tasks.push(pool.start(*workers, self.shutdown.subscribe()));
        }

        let mut watcher = JoinSet::new();
        watcher.spawn(
            OutputWatcher::new(Arc::clone(&self.catalog), self.poll_interval)
                .run(self.shutdown.subscribe()),
        );
        tasks.push(watcher);
        tasks.push(self.notifier.start());
        self.tasks.lock().extend(tasks);

        self.sessions.start();
        info!("pipeline started");
        Ok(())
    }

    /// Ends the live session, stops the offline stream and drains the workers.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
        self.shutdown.send_replace(true);
        self.notifier.close();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let drain = async {
            for mut set in tasks {
                while set.join_next().await.is_some() {}
            }
        };
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!("pipeline: workers did not finish within {:?}", self.drain_timeout);
        }
        info!("pipeline stopped");
    }
}
