use crate::errors::ServerError;
use crate::storage::offload::OffloadPool;
use crate::storage::{segment_key, ArchiveIndex, Locator, StorageProvider};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use transcoder::{HlsLayout, RenditionProfile};

mod playlist;
pub mod watcher;

pub use playlist::{parse_producer_playlist, render_master, Playlist, Segment, SegmentMeta};

#[derive(Debug, Clone)]
pub struct CatalogOptions {
    /// Mirror every published playlist to `<rendition>/stream.m3u8`.
    pub persist_manifests: bool,
    pub session_grace: Duration,
    pub purge_archive: bool,
}

struct Rendition {
    profile: RenditionProfile,
    writer: Mutex<Writer>,
    published: RwLock<Option<Arc<Playlist>>>,
}

#[derive(Default)]
struct Writer {
    window: VecDeque<Arc<Segment>>,
    next_sequence: u64,
    discontinuity_sequence: u64,
    /// Producer session and source sequence of the newest segment.
    tail: Option<(String, u64)>,
}

/// Per-rendition sliding window playlists over the encoder output.
///
/// Readers get immutable snapshots. A snapshot is replaced before any
/// segment it drops is handed to storage, so a published playlist never
/// references a purged segment.
pub struct SegmentCatalog {
    layout: HlsLayout,
    renditions: HashMap<String, Rendition>,
    master: String,
    storage: Arc<dyn StorageProvider>,
    offload: Option<Arc<OffloadPool>>,
    archive: Arc<ArchiveIndex>,
    options: CatalogOptions,
    active: RwLock<Option<String>>,
    /// Sessions begun since the watcher last looked.
    begun: parking_lot::Mutex<Vec<String>>,
    /// Most recently cleaned up sessions.
    cleaned: parking_lot::Mutex<VecDeque<String>>,
}

const CLEANED_HISTORY: usize = 16;

impl SegmentCatalog {
    pub fn new(
        profiles: &[RenditionProfile],
        layout: HlsLayout,
        storage: Arc<dyn StorageProvider>,
        offload: Option<Arc<OffloadPool>>,
        archive: Arc<ArchiveIndex>,
        options: CatalogOptions,
    ) -> Self {
        let renditions = profiles
            .iter()
            .map(|profile| {
                let rendition = Rendition {
                    profile: profile.clone(),
                    writer: Mutex::new(Writer::default()),
                    published: RwLock::new(None),
                };
                (profile.name.clone(), rendition)
            })
            .collect();

        Self {
            layout,
            renditions,
            master: render_master(profiles),
            storage,
            offload,
            archive,
            options,
            active: RwLock::new(None),
            begun: parking_lot::Mutex::new(Vec::new()),
            cleaned: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// Empties the rendition directories left by an earlier run, then
    /// recreates them and writes the master playlist.
    pub async fn prepare(&self) -> Result<(), ServerError> {
        for name in self.renditions.keys() {
            let dir = self.layout.rendition_dir(name);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => info!(rendition = %name, "cleared output of a previous run"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ServerError::StorageError(format!(
                        "clear {}: {}",
                        dir.display(),
                        e
                    )))
                }
            }
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                ServerError::StorageError(format!("create {}: {}", dir.display(), e))
            })?;
        }

        if self.options.persist_manifests {
            write_atomic(&self.layout.master_manifest_path(), &self.master)
                .await
                .map_err(|e| ServerError::StorageError(format!("write master playlist: {}", e)))?;
        }
        Ok(())
    }

    pub fn layout(&self) -> &HlsLayout {
        &self.layout
    }

    pub fn rendition_names(&self) -> Vec<String> {
        self.renditions.keys().cloned().collect()
    }

    pub fn master_manifest(&self) -> &str {
        &self.master
    }

    pub fn current_playlist(&self, rendition: &str) -> Option<Arc<Playlist>> {
        self.renditions
            .get(rendition)
            .and_then(|r| r.published.read().clone())
    }

    /// Location of an evicted segment that storage kept.
    pub fn archived_locator(&self, key: &str) -> Option<Locator> {
        self.archive.get(key)
    }

    pub fn begin_session(&self, identifier: &str) {
        info!(identifier, "producer session started");
        *self.active.write() = Some(identifier.to_string());
        self.begun.lock().push(identifier.to_string());
    }

    /// Sessions begun since the previous call, oldest first.
    pub fn take_begun_sessions(&self) -> Vec<String> {
        std::mem::take(&mut *self.begun.lock())
    }

    pub fn active_session(&self) -> Option<String> {
        self.active.read().clone()
    }

    /// Schedules cleanup of the session's leftovers once the grace period is over.
    pub fn end_session(self: &Arc<Self>, identifier: &str) {
        {
            let mut active = self.active.write();
            if active.as_deref() == Some(identifier) {
                *active = None;
            }
        }

        let catalog = Arc::clone(self);
        let identifier = identifier.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(catalog.options.session_grace).await;
            catalog.cleanup_session(&identifier).await;
        });
    }

    pub async fn notify_new_segment(
        &self,
        rendition: &str,
        meta: SegmentMeta,
    ) -> Result<Arc<Segment>, ServerError> {
        let entry = self
            .renditions
            .get(rendition)
            .ok_or_else(|| ServerError::UnknownRendition(rendition.to_string()))?;

        let mut writer = entry.writer.lock().await;
        if let Some((identifier, tail)) = &writer.tail {
            if *identifier == meta.identifier && meta.source_sequence <= *tail {
                let err = ServerError::SegmentOrderingViolation {
                    rendition: rendition.to_string(),
                    sequence: meta.source_sequence,
                    tail: *tail,
                };
                warn!(rendition, identifier = %meta.identifier, "{}", err);
                return Err(err);
            }
        }

        let discontinuity = writer
            .tail
            .as_ref()
            .is_some_and(|(identifier, _)| *identifier != meta.identifier);
        let key = segment_key(rendition, &meta.file_name);
        let segment = Arc::new(Segment {
            sequence: writer.next_sequence,
            source_sequence: meta.source_sequence,
            duration: meta.duration,
            size: meta.size,
            path: self.layout.segment_path(rendition, &meta.file_name),
            rendition: rendition.to_string(),
            created_at: Utc::now(),
            discontinuity,
            locator: Locator::Local(key),
            file_name: meta.file_name,
            identifier: meta.identifier.clone(),
        });

        writer.next_sequence += 1;
        writer.tail = Some((meta.identifier, meta.source_sequence));
        writer.window.push_back(Arc::clone(&segment));

        let window = entry.profile.window_size();
        let mut evicted = Vec::new();
        while writer.window.len() > window {
            if let Some(old) = writer.window.pop_front() {
                if old.discontinuity {
                    writer.discontinuity_sequence += 1;
                }
                evicted.push(old);
            }
        }

        let playlist = Arc::new(Playlist::new(
            rendition.to_string(),
            entry.profile.latency_level.segment_seconds() as u64,
            writer.discontinuity_sequence,
            writer.window.iter().cloned().collect(),
            self.storage.as_ref(),
        ));
        *entry.published.write() = Some(Arc::clone(&playlist));

        if self.options.persist_manifests {
            let path = self.layout.manifest_path(rendition);
            if let Err(e) = write_atomic(&path, playlist.manifest()).await {
                warn!(rendition, "write {}: {}", path.display(), e);
            }
        }
        drop(writer);

        debug!(
            rendition,
            sequence = segment.sequence,
            file = %segment.file_name,
            "segment published"
        );

        for old in evicted {
            self.retire(old).await;
        }
        Ok(segment)
    }

    async fn retire(&self, segment: Arc<Segment>) {
        if self.cleaned.lock().contains(&segment.identifier) {
            // Left the window after its session was cleaned up.
            self.storage.purge(&segment.locator).await;
            return;
        }

        match &self.offload {
            Some(pool) => pool.submit(segment),
            None => self.storage.purge(&segment.locator).await,
        }
    }

    async fn cleanup_session(&self, identifier: &str) {
        if self.active_session().as_deref() == Some(identifier) {
            return;
        }

        let mut removed = 0;
        for name in self.renditions.keys() {
            let playlist = self.current_playlist(name);
            let dir = self.layout.rendition_dir(name);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(rendition = %name, "cleanup: read {}: {}", dir.display(), e);
                    continue;
                }
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if !is_session_file(identifier, &file_name) {
                    continue;
                }
                if playlist.as_ref().is_some_and(|p| p.contains(&file_name)) {
                    continue;
                }

                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(rendition = %name, "cleanup: remove {}: {}", file_name, e),
                }
            }
        }

        // Nothing references the session any more, so its redirects go too.
        let archived = self.archive.take_session(identifier);
        if self.options.purge_archive {
            for locator in archived.iter().filter(|l| l.is_remote()) {
                self.storage.purge(locator).await;
            }
        }

        {
            let mut cleaned = self.cleaned.lock();
            cleaned.push_back(identifier.to_string());
            if cleaned.len() > CLEANED_HISTORY {
                cleaned.pop_front();
            }
        }

        info!(
            identifier,
            removed,
            archived = archived.len(),
            "session cleaned up"
        );
    }
}

fn is_session_file(identifier: &str, file_name: &str) -> bool {
    HlsLayout::belongs_to(identifier, file_name)
        || (file_name.ends_with(".tmp") && file_name.starts_with(&format!("{}-", identifier)))
}

/// Writes to a sibling temporary file and renames it into place.
pub async fn write_atomic(path: &Path, data: &str) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{profile, RecordingStorage};
    use tokio::sync::watch;

    fn meta(identifier: &str, source_sequence: u64) -> SegmentMeta {
        SegmentMeta {
            identifier: identifier.to_string(),
            source_sequence,
            duration: Duration::from_secs(3),
            size: 188,
            file_name: HlsLayout::segment_file_name(identifier, source_sequence),
        }
    }

    fn options(persist_manifests: bool) -> CatalogOptions {
        CatalogOptions {
            persist_manifests,
            session_grace: Duration::from_millis(20),
            purge_archive: false,
        }
    }

    fn catalog(
        dir: &Path,
        window: usize,
        storage: Arc<RecordingStorage>,
        offload: Option<Arc<OffloadPool>>,
    ) -> Arc<SegmentCatalog> {
        Arc::new(SegmentCatalog::new(
            &[profile("720p", window)],
            HlsLayout::new(dir),
            storage,
            offload,
            Arc::new(ArchiveIndex::new()),
            options(true),
        ))
    }

    fn assert_contiguous(playlist: &Playlist) {
        for pair in playlist.segments.windows(2) {
            assert_eq!(pair[1].sequence, pair[0].sequence + 1);
        }
    }

    #[tokio::test]
    async fn window_keeps_the_newest_segments_and_offers_the_rest_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(RecordingStorage::remote());
        let archive = Arc::new(ArchiveIndex::new());
        let pool = Arc::new(OffloadPool::new(storage.clone(), archive, 64, false, false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _workers = pool.start(2, shutdown_rx);
        let catalog = catalog(dir.path(), 5, storage.clone(), Some(pool.clone()));
        catalog.prepare().await.unwrap();

        for n in 1..=20 {
            catalog.notify_new_segment("720p", meta("s1", n)).await.unwrap();
            let playlist = catalog.current_playlist("720p").unwrap();
            assert!(playlist.segments.len() <= 5);
            assert_eq!(playlist.segments.last().unwrap().source_sequence, n);
            assert_contiguous(&playlist);
        }

        let playlist = catalog.current_playlist("720p").unwrap();
        let sources: Vec<u64> = playlist.segments.iter().map(|s| s.source_sequence).collect();
        assert_eq!(sources, vec![16, 17, 18, 19, 20]);
        assert_eq!(playlist.media_sequence(), 15);

        tokio::time::timeout(Duration::from_secs(5), async {
            while storage.offered().len() < 15 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut offered = storage.offered();
        offered.sort();
        let mut expected: Vec<String> = (1..=15).map(|n| format!("720p/s1-{}.ts", n)).collect();
        expected.sort();
        assert_eq!(offered, expected);

        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn purged_segments_are_never_in_the_published_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(RecordingStorage::local());
        let catalog = catalog(dir.path(), 3, storage.clone(), None);
        catalog.prepare().await.unwrap();

        for n in 0..10 {
            catalog.notify_new_segment("720p", meta("s1", n)).await.unwrap();
            let playlist = catalog.current_playlist("720p").unwrap();
            for purged in storage.purged() {
                assert!(playlist.segments.iter().all(|s| s.locator != purged));
            }
        }
        assert_eq!(storage.purged().len(), 7);

        let on_disk = std::fs::read_to_string(dir.path().join("720p/stream.m3u8")).unwrap();
        assert_eq!(on_disk, catalog.current_playlist("720p").unwrap().manifest());
        let master = std::fs::read_to_string(dir.path().join("stream.m3u8")).unwrap();
        assert!(master.contains("720p/stream.m3u8"));
    }

    #[tokio::test]
    async fn out_of_order_segments_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog(dir.path(), 5, Arc::new(RecordingStorage::local()), None);

        catalog.notify_new_segment("720p", meta("s1", 3)).await.unwrap();
        for stale in [3, 2] {
            let err = catalog.notify_new_segment("720p", meta("s1", stale)).await.unwrap_err();
            assert!(matches!(
                err,
                ServerError::SegmentOrderingViolation { sequence, tail: 3, .. } if sequence == stale
            ));
        }

        let playlist = catalog.current_playlist("720p").unwrap();
        assert_eq!(playlist.segments.len(), 1);

        let err = catalog.notify_new_segment("1080p", meta("s1", 4)).await.unwrap_err();
        assert!(matches!(err, ServerError::UnknownRendition(_)));
    }

    #[tokio::test]
    async fn new_producer_session_continues_numbering_with_a_discontinuity() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog(dir.path(), 2, Arc::new(RecordingStorage::local()), None);

        catalog.notify_new_segment("720p", meta("offline-a", 7)).await.unwrap();
        catalog.notify_new_segment("720p", meta("offline-a", 8)).await.unwrap();
        let first = catalog.notify_new_segment("720p", meta("live-b", 0)).await.unwrap();
        assert!(first.discontinuity);
        assert_eq!(first.sequence, 2);

        let playlist = catalog.current_playlist("720p").unwrap();
        assert_eq!(playlist.discontinuity_sequence, 0);
        assert!(playlist.manifest().contains("#EXT-X-DISCONTINUITY\n"));

        catalog.notify_new_segment("720p", meta("live-b", 1)).await.unwrap();
        catalog.notify_new_segment("720p", meta("live-b", 2)).await.unwrap();
        let playlist = catalog.current_playlist("720p").unwrap();
        assert_eq!(playlist.discontinuity_sequence, 1);
        assert!(!playlist.manifest().contains("#EXT-X-DISCONTINUITY\n"));
        assert!(playlist.manifest().contains("#EXT-X-DISCONTINUITY-SEQUENCE:1\n"));
        assert_contiguous(&playlist);
    }

    #[tokio::test]
    async fn ended_session_leftovers_are_removed_after_the_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog(dir.path(), 2, Arc::new(RecordingStorage::local()), None);
        catalog.prepare().await.unwrap();

        let rendition = dir.path().join("720p");
        for name in ["s1.m3u8", "s1-0.ts", "s1-1.ts", "s1-2.ts.tmp", "s2-0.ts"] {
            std::fs::write(rendition.join(name), b"x").unwrap();
        }

        catalog.begin_session("s1");
        catalog.notify_new_segment("720p", meta("s1", 1)).await.unwrap();
        catalog.begin_session("s2");
        catalog.end_session("s1");
        assert_eq!(catalog.active_session().as_deref(), Some("s2"));

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!rendition.join("s1.m3u8").exists());
        assert!(!rendition.join("s1-0.ts").exists());
        assert!(!rendition.join("s1-2.ts.tmp").exists());
        // Still referenced by the published window.
        assert!(rendition.join("s1-1.ts").exists());
        assert!(rendition.join("s2-0.ts").exists());
        assert!(rendition.join("stream.m3u8").exists());
    }

    #[tokio::test]
    async fn startup_clears_output_of_a_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let rendition = dir.path().join("720p");
        std::fs::create_dir_all(&rendition).unwrap();
        for name in ["live-deadbeef-7.ts", "live-deadbeef.m3u8", "stream.m3u8"] {
            std::fs::write(rendition.join(name), b"stale").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        let catalog = catalog(dir.path(), 5, Arc::new(RecordingStorage::local()), None);
        catalog.prepare().await.unwrap();

        assert!(rendition.is_dir());
        assert_eq!(std::fs::read_dir(&rendition).unwrap().count(), 0);
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("stream.m3u8").is_file());
    }

    #[tokio::test]
    async fn archive_stays_flat_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(RecordingStorage::remote());
        let archive = Arc::new(ArchiveIndex::new());
        let pool = Arc::new(OffloadPool::new(storage.clone(), archive.clone(), 256, false, false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _workers = pool.start(2, shutdown_rx);
        let catalog = Arc::new(SegmentCatalog::new(
            &[profile("720p", 2)],
            HlsLayout::new(dir.path()),
            storage.clone(),
            Some(pool.clone()),
            archive.clone(),
            options(false),
        ));
        catalog.prepare().await.unwrap();

        let sessions = ["s1", "s2", "s3", "s4"];
        for (round, identifier) in sessions.iter().enumerate() {
            catalog.begin_session(identifier);
            if round > 0 {
                catalog.end_session(sessions[round - 1]);
                tokio::time::sleep(Duration::from_millis(100)).await;
                assert_eq!(archive.len(), 0, "after cleaning {}", sessions[round - 1]);
            }

            for n in 0..25 {
                catalog.notify_new_segment("720p", meta(identifier, n)).await.unwrap();
            }
            let expected = 23 * (round as u64 + 1);
            tokio::time::timeout(Duration::from_secs(5), async {
                while pool.offloaded() < expected {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
            assert_eq!(archive.len(), 23);
        }

        let _ = shutdown_tx.send(true);
    }
}
