use crate::backoff::{Backoff, BackoffSettings};
use crate::catalog::SegmentCatalog;
use crate::errors::ServerError;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use transcoder::{
    wait_for_exit, LatencyLevel, PlaceholderClip, RenditionProfile, StartRequest, Transcoder,
    TranscoderError,
};
use uuid::Uuid;

/// Consecutive failures after which restart problems are logged as errors.
const PERSISTENT_FAILURES: u32 = 5;

#[derive(Debug, Clone)]
pub struct OfflineSettings {
    pub logo: Option<PathBuf>,
    pub clip: Option<PathBuf>,
    pub rendered_clip: PathBuf,
    pub placeholder: PlaceholderClip,
    pub restart: BackoffSettings,
    pub stable_after: Duration,
    pub webroot: PathBuf,
}

struct Active {
    stop: Arc<Notify>,
    ready: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

enum Outcome {
    Stopped,
    Failed(ServerError),
}

/// Keeps a looping placeholder stream running while nobody is live.
pub struct OfflineContentSupplier {
    transcoder: Arc<dyn Transcoder>,
    catalog: Arc<SegmentCatalog>,
    profiles: Vec<RenditionProfile>,
    settings: OfflineSettings,
    active: Mutex<Option<Active>>,
    fingerprint: tokio::sync::Mutex<Option<String>>,
    restarts: AtomicU64,
}

impl OfflineContentSupplier {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        catalog: Arc<SegmentCatalog>,
        profiles: &[RenditionProfile],
        settings: OfflineSettings,
    ) -> Self {
        let profiles = profiles
            .iter()
            .cloned()
            .map(|mut profile| {
                profile.latency_level = LatencyLevel::offline();
                profile
            })
            .collect();

        Self {
            transcoder,
            catalog,
            profiles,
            settings,
            active: Mutex::new(None),
            fingerprint: tokio::sync::Mutex::new(None),
            restarts: AtomicU64::new(0),
        }
    }

    /// Starts the offline stream unless it is already running. The returned
    /// flag turns true whenever an offline encoder is up.
    pub fn ensure_offline_stream_active(self: &Arc<Self>) -> watch::Receiver<bool> {
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            if !current.task.is_finished() {
                return current.ready.clone();
            }
        }

        let stop = Arc::new(Notify::new());
        let (ready_tx, ready_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(self).supervise(Arc::clone(&stop), ready_tx));
        *active = Some(Active {
            stop,
            ready: ready_rx.clone(),
            task,
        });
        info!("offline stream activated");
        ready_rx
    }

    /// Stops the offline stream and waits until its encoder is gone.
    pub async fn deactivate(&self) {
        let active = self.active.lock().take();
        let Some(active) = active else {
            return;
        };

        active.stop.notify_one();
        if let Err(e) = active.task.await {
            warn!("offline supervisor: {}", e);
        }
        info!("offline stream deactivated");
    }

    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    async fn supervise(self: Arc<Self>, stop: Arc<Notify>, ready: watch::Sender<bool>) {
        self.publish_imagery().await;

        let mut backoff = Backoff::new(self.settings.restart.clone());
        let mut failures = 0u32;
        loop {
            let started = Instant::now();
            let e = match self.run_once(&stop, &ready).await {
                Outcome::Stopped => return,
                Outcome::Failed(e) => e,
            };

            if started.elapsed() >= self.settings.stable_after {
                backoff.reset();
                failures = 0;
            }
            failures += 1;
            self.restarts.fetch_add(1, Ordering::Relaxed);

            let delay = backoff.next_delay();
            if failures >= PERSISTENT_FAILURES {
                error!(failures, "offline stream keeps failing, restarting in {:?}: {}", delay, e);
            } else {
                warn!(failures, "offline stream failed, restarting in {:?}: {}", delay, e);
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = stop.notified() => return,
            }
        }
    }

    async fn run_once(&self, stop: &Notify, ready: &watch::Sender<bool>) -> Outcome {
        let clip = tokio::select! {
            clip = self.prepare_clip() => clip,
            _ = stop.notified() => return Outcome::Stopped,
        };
        let clip = match clip {
            Ok(clip) => clip,
            Err(e) => return Outcome::Failed(e),
        };

        let identifier = format!("offline-{}", &Uuid::new_v4().simple().to_string()[..8]);
        self.catalog.begin_session(&identifier);

        let request = StartRequest::event(self.profiles.clone(), identifier.clone(), clip);
        let session = match self.transcoder.start(request).await {
            Ok(session) => session,
            Err(e) => {
                self.catalog.end_session(&identifier);
                return Outcome::Failed(e.into());
            }
        };

        ready.send_replace(true);
        debug!(identifier, "offline encoder running");

        tokio::select! {
            status = wait_for_exit(session.handle.subscribe()) => {
                ready.send_replace(false);
                self.catalog.end_session(&identifier);
                Outcome::Failed(TranscoderError::Crash(status.to_string()).into())
            }
            _ = stop.notified() => {
                ready.send_replace(false);
                if let Err(e) = self.transcoder.stop(&session.handle).await {
                    warn!(identifier, "{}", e);
                }
                self.catalog.end_session(&identifier);
                Outcome::Stopped
            }
        }
    }

    /// Returns the clip to loop, rendering it again when the logo changed.
    async fn prepare_clip(&self) -> Result<PathBuf, ServerError> {
        if let Some(clip) = &self.settings.clip {
            tokio::fs::metadata(clip).await.map_err(|e| {
                ServerError::StorageError(format!("offline clip {}: {}", clip.display(), e))
            })?;
            return Ok(clip.clone());
        }

        let logo = self.settings.logo.as_deref();
        let current = match logo {
            Some(logo) => fingerprint(logo).await?,
            None => format!("color:{}", self.settings.placeholder.color),
        };

        let rendered = &self.settings.rendered_clip;
        let mut known = self.fingerprint.lock().await;
        let exists = tokio::fs::metadata(rendered).await.is_ok();
        if exists && known.as_deref() == Some(current.as_str()) {
            return Ok(rendered.clone());
        }

        info!(fingerprint = %current, "rendering offline clip");
        self.settings.placeholder.render(logo, rendered).await?;
        *known = Some(current);
        Ok(rendered.clone())
    }

    /// Shows the logo as the stream thumbnail and drops the stale preview.
    async fn publish_imagery(&self) {
        let webroot = &self.settings.webroot;
        if let Some(logo) = &self.settings.logo {
            let thumbnail = webroot.join("thumbnail.jpg");
            let copied = match tokio::fs::create_dir_all(webroot).await {
                Ok(()) => tokio::fs::copy(logo, &thumbnail).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = copied {
                warn!("publish {} as thumbnail: {}", logo.display(), e);
            }
        }

        match tokio::fs::remove_file(webroot.join("preview.gif")).await {
            Ok(()) => debug!("removed stale preview"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("remove preview.gif: {}", e),
        }
    }
}

async fn fingerprint(path: &Path) -> Result<String, ServerError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| ServerError::StorageError(format!("logo {}: {}", path.display(), e)))?;
    let modified = metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok(format!("{}:{}", metadata.len(), modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[tokio::test(start_paused = true)]
    async fn crashing_offline_encoder_restarts_with_delays_growing_to_the_cap() {
        let harness = Harness::new().await;
        harness.transcoder.wait_for_event_starts(1).await;
        harness.transcoder.crash_event_streams(true);
        harness.transcoder.crash_all_events();

        // 0.5s doubling up to 60s: eight growing gaps, then the plateau.
        let cap = Duration::from_secs(60);
        let starts = harness.transcoder.wait_for_event_starts(12).await;
        let gaps: Vec<Duration> = starts.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            if pair[0] < cap - Duration::from_millis(100) {
                assert!(pair[1] > pair[0], "delays did not grow: {:?}", gaps);
            } else {
                assert!(pair[1] <= cap + Duration::from_millis(100), "delay passed the cap: {:?}", gaps);
            }
        }
        let last = gaps[gaps.len() - 1];
        assert!(last >= cap && last < cap + Duration::from_millis(100));
        assert!(harness.offline.is_active());
        assert!(harness.offline.restarts() >= 11);
    }

    #[tokio::test(start_paused = true)]
    async fn stable_run_resets_the_backoff() {
        let harness = Harness::new().await;
        harness.transcoder.wait_for_event_starts(1).await;

        harness.transcoder.crash_event_streams(true);
        harness.transcoder.crash_all_events();
        harness.transcoder.wait_for_event_starts(3).await;
        harness.transcoder.crash_event_streams(false);

        let starts = harness.transcoder.wait_for_event_starts(4).await;
        let gap = starts[3] - starts[2];
        assert!(gap >= Duration::from_secs(2) && gap < Duration::from_millis(2100));

        tokio::time::sleep(Duration::from_secs(120)).await;
        let crashed_at = Instant::now();
        harness.transcoder.crash_all_events();

        let starts = harness.transcoder.wait_for_event_starts(5).await;
        let delay = starts[4] - crashed_at;
        assert!(delay >= Duration::from_millis(500) && delay < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_starts_are_retried() {
        let harness = Harness::new().await;
        harness.transcoder.wait_for_event_starts(1).await;
        harness.offline.deactivate().await;
        harness.transcoder.fail_event_starts(true);

        let _ = harness.offline.ensure_offline_stream_active();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(harness.offline.restarts() >= 2);
        assert_eq!(harness.transcoder.event_starts().len(), 1);

        harness.transcoder.fail_event_starts(false);
        harness.transcoder.wait_for_event_starts(2).await;
        assert!(harness.offline.is_active());
    }

    #[tokio::test]
    async fn activation_is_idempotent_and_deactivation_stops_the_encoder() {
        let harness = Harness::new().await;
        let mut ready = harness.offline.ensure_offline_stream_active();
        ready.wait_for(|ready| *ready).await.unwrap();
        let _ = harness.offline.ensure_offline_stream_active();
        assert_eq!(harness.transcoder.event_starts().len(), 1);

        harness.offline.deactivate().await;
        assert!(!harness.offline.is_active());
        assert_eq!(harness.transcoder.running_events(), 0);
        assert_eq!(harness.transcoder.stopped().len(), 1);
        assert!(!*ready.borrow());
    }

    #[tokio::test]
    async fn logo_becomes_the_thumbnail_and_preview_is_removed() {
        let harness = Harness::new().await;
        harness.offline.deactivate().await;

        let webroot = harness.dir.path().join("webroot");
        std::fs::write(webroot.join("preview.gif"), b"gif").unwrap();
        harness.offline.publish_imagery().await;

        assert_eq!(std::fs::read(webroot.join("thumbnail.jpg")).unwrap(), b"logo");
        assert!(!webroot.join("preview.gif").exists());
    }
}
