use crate::catalog::Segment;
use crate::storage::{ArchiveIndex, Locator, StorageProvider};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Bounded queue of evicted segments drained by a fixed set of workers.
/// Submitting never blocks: a full queue drops its oldest request.
pub struct OffloadPool {
    provider: Arc<dyn StorageProvider>,
    archive: Arc<ArchiveIndex>,
    queue: Mutex<VecDeque<Arc<Segment>>>,
    capacity: usize,
    retain_local: bool,
    purge_archive: bool,
    wakeup: Notify,
    offloaded: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl OffloadPool {
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        archive: Arc<ArchiveIndex>,
        capacity: usize,
        retain_local: bool,
        purge_archive: bool,
    ) -> Self {
        Self {
            provider,
            archive,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            retain_local,
            purge_archive,
            wakeup: Notify::new(),
            offloaded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn submit(&self, segment: Arc<Segment>) {
        let dropped = {
            let mut queue = self.queue.lock();
            queue.push_back(segment);
            if queue.len() > self.capacity {
                queue.pop_front()
            } else {
                None
            }
        };

        if let Some(dropped) = dropped {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                rendition = %dropped.rendition,
                dropped = total,
                "offload queue full, keeping {} local",
                dropped.file_name
            );
            // Served from disk until the session is cleaned up.
            self.archive(dropped.key(), Locator::Local(dropped.key()));
        }
        self.wakeup.notify_one();
    }

    /// Spawns the workers. They exit once `shutdown` turns true.
    pub fn start(self: &Arc<Self>, workers: usize, shutdown: watch::Receiver<bool>) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for worker in 0..workers.max(1) {
            let pool = Arc::clone(self);
            let shutdown = shutdown.clone();
            set.spawn(async move { pool.work(worker, shutdown).await });
        }
        set
    }

    async fn work(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = self.queue.lock().pop_front();
            match next {
                Some(segment) => self.offload(&segment).await,
                None => {
                    tokio::select! {
                        _ = self.wakeup.notified() => {},
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        },
                    }
                }
            }
        }
        debug!(worker, "offload worker stopped");
    }

    async fn offload(&self, segment: &Segment) {
        match self.provider.offload(segment).await {
            Ok(locator) => {
                if locator.is_remote() && !self.retain_local {
                    self.provider
                        .purge(&Locator::Local(segment.key()))
                        .await;
                }
                self.archive(segment.key(), locator);
                self.offloaded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(rendition = %segment.rendition, "{}", e);
            }
        }
    }

    fn archive(&self, key: String, locator: Locator) {
        let Some(evicted) = self.archive.insert(key, locator) else {
            return;
        };
        debug!(locator = %evicted, "archive full, forgetting the oldest segment");
        if !evicted.is_remote() || self.purge_archive {
            let provider = Arc::clone(&self.provider);
            tokio::spawn(async move { provider.purge(&evicted).await });
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn offloaded(&self) -> u64 {
        self.offloaded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
