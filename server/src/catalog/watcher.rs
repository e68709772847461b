use crate::catalog::{parse_producer_playlist, SegmentCatalog, SegmentMeta};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use transcoder::HlsLayout;

#[derive(Debug)]
struct Cursor {
    identifier: String,
    modified: Option<SystemTime>,
    last: Option<u64>,
}

impl Cursor {
    fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            modified: None,
            last: None,
        }
    }
}

/// Polls the producer playlists of the active session and announces new
/// segments to the catalog. Bursts of encoder writes coalesce into at most
/// one pass per rendition per cycle.
pub struct OutputWatcher {
    catalog: Arc<SegmentCatalog>,
    layout: HlsLayout,
    renditions: Vec<String>,
    interval: Duration,
    current: Option<String>,
    cursors: HashMap<String, Cursor>,
}

impl OutputWatcher {
    pub fn new(catalog: Arc<SegmentCatalog>, interval: Duration) -> Self {
        let layout = catalog.layout().clone();
        let mut renditions = catalog.rendition_names();
        renditions.sort();
        Self {
            catalog,
            layout,
            renditions,
            interval,
            current: None,
            cursors: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("output watcher: polling every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.cycle().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Whatever the encoders flushed while stopping.
        self.cycle().await;
        info!("output watcher: stopped");
    }

    pub async fn cycle(&mut self) {
        // Sessions that began and ended since the last cycle still get one
        // pass, in the order they ran.
        let active = self.catalog.active_session();
        let mut finished: Vec<String> = self.current.take().into_iter().collect();
        for identifier in self.catalog.take_begun_sessions() {
            if !finished.contains(&identifier) {
                finished.push(identifier);
            }
        }

        for identifier in finished {
            if active.as_ref() == Some(&identifier) {
                continue;
            }
            debug!(identifier, "final pass over ended session");
            self.scan(&identifier).await;
        }

        self.current = active;
        if let Some(identifier) = self.current.clone() {
            self.scan(&identifier).await;
        }
    }

    async fn scan(&mut self, identifier: &str) {
        for i in 0..self.renditions.len() {
            let rendition = self.renditions[i].clone();
            self.scan_rendition(&rendition, identifier).await;
        }
    }

    async fn scan_rendition(&mut self, rendition: &str, identifier: &str) {
        let path = self.layout.producer_playlist(rendition, identifier);
        let modified = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata.modified().ok(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(rendition, "stat {}: {}", path.display(), e);
                return;
            }
        };

        let cursor = self
            .cursors
            .entry(rendition.to_string())
            .or_insert_with(|| Cursor::new(identifier));
        if cursor.identifier != identifier {
            *cursor = Cursor::new(identifier);
        }
        if modified.is_some() && cursor.modified == modified {
            return;
        }

        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) => {
                debug!(rendition, "read {}: {}", path.display(), e);
                return;
            }
        };

        let mut complete = true;
        for (duration, file_name) in parse_producer_playlist(&data) {
            let Some(source_sequence) = HlsLayout::parse_segment_file_name(identifier, &file_name)
            else {
                continue;
            };
            if cursor.last.is_some_and(|last| source_sequence <= last) {
                continue;
            }

            let size = match tokio::fs::metadata(self.layout.segment_path(rendition, &file_name)).await {
                Ok(metadata) => metadata.len(),
                Err(_) => {
                    // Listed before it is visible; pick it up next cycle.
                    complete = false;
                    break;
                }
            };

            let meta = SegmentMeta {
                identifier: identifier.to_string(),
                source_sequence,
                duration,
                size,
                file_name,
            };
            if let Err(e) = self.catalog.notify_new_segment(rendition, meta).await {
                debug!(rendition, "segment skipped: {}", e);
            }
            cursor.last = Some(source_sequence);
        }

        if complete {
            cursor.modified = modified;
        }
    }
}
