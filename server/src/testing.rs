//! Fakes and fixtures shared by the unit tests.

use crate::backoff::BackoffSettings;
use crate::catalog::{CatalogOptions, Segment, SegmentCatalog};
use crate::errors::ServerError;
use crate::notify::{DispatchSettings, EventDelivery, EventPayload, NotificationDispatcher, NotificationEvent};
use crate::offline::{OfflineContentSupplier, OfflineSettings};
use crate::session::{SessionSettings, StreamSessionManager, StreamState};
use crate::storage::{segment_key, ArchiveIndex, Locator, StorageProvider};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use transcoder::{
    HlsLayout, InputSink, LatencyLevel, PlaceholderClip, RenditionProfile, Session, StartRequest,
    Status, Transcoder, TranscoderError, TranscoderHandle,
};
use uuid::Uuid;

pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Serves http on a random local port, recording every request and
/// answering with whatever status `respond` picks.
pub async fn loopback<F>(respond: F) -> (SocketAddr, Arc<Mutex<Vec<Recorded>>>)
where
    F: Fn(&Recorded) -> StatusCode + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);

    let recorded = Arc::clone(&requests);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let requests = Arc::clone(&recorded);
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let requests = Arc::clone(&requests);
                    let respond = Arc::clone(&respond);
                    async move {
                        let (parts, body) = req.into_parts();
                        let recorded = Recorded {
                            method: parts.method,
                            path: parts.uri.path().to_string(),
                            content_type: parts
                                .headers
                                .get(CONTENT_TYPE)
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string),
                            body: body.collect().await?.to_bytes(),
                        };
                        let status = respond(&recorded);
                        requests.lock().push(recorded);

                        let mut res = Response::new(Full::new(Bytes::new()));
                        *res.status_mut() = status;
                        Ok::<_, hyper::Error>(res)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, requests)
}

pub fn profile(name: &str, window: usize) -> RenditionProfile {
    RenditionProfile {
        name: name.to_string(),
        width: None,
        height: Some(720),
        framerate: 30,
        video_bitrate: 2500,
        max_rate: None,
        buffer_size: None,
        audio_bitrate: 128,
        latency_level: LatencyLevel::default(),
        window_size: Some(window),
    }
}

pub fn segment(rendition: &str, identifier: &str, sequence: u64) -> Segment {
    let file_name = HlsLayout::segment_file_name(identifier, sequence);
    Segment {
        sequence,
        source_sequence: sequence,
        identifier: identifier.to_string(),
        duration: Duration::from_secs(3),
        size: 188,
        path: PathBuf::from("/nonexistent").join(rendition).join(&file_name),
        rendition: rendition.to_string(),
        created_at: Utc::now(),
        discontinuity: false,
        locator: Locator::Local(segment_key(rendition, &file_name)),
        file_name,
    }
}

/// Storage that remembers what it was asked to do.
pub struct RecordingStorage {
    remote: bool,
    offered: Mutex<Vec<String>>,
    purged: Mutex<Vec<Locator>>,
}

impl RecordingStorage {
    pub fn local() -> Self {
        Self::new(false)
    }

    pub fn remote() -> Self {
        Self::new(true)
    }

    fn new(remote: bool) -> Self {
        Self {
            remote,
            offered: Mutex::new(Vec::new()),
            purged: Mutex::new(Vec::new()),
        }
    }

    pub fn offered(&self) -> Vec<String> {
        self.offered.lock().clone()
    }

    pub fn purged(&self) -> Vec<Locator> {
        self.purged.lock().clone()
    }
}

#[async_trait]
impl StorageProvider for RecordingStorage {
    async fn offload(&self, segment: &Segment) -> Result<Locator, ServerError> {
        let key = segment.key();
        self.offered.lock().push(key.clone());
        Ok(if self.remote {
            Locator::Remote(key)
        } else {
            Locator::Local(key)
        })
    }

    async fn purge(&self, locator: &Locator) {
        self.purged.lock().push(locator.clone());
    }

    fn resolve_serving_url(&self, locator: &Locator) -> String {
        match locator {
            Locator::Local(key) => format!("/hls/{}", key),
            Locator::Remote(key) => format!("https://cdn.test/{}", key),
        }
    }
}

/// Fails the first `failures` attempts of every event, then accepts.
pub struct RecordingDelivery {
    failures: u32,
    attempts: Mutex<Vec<Instant>>,
    tries: Mutex<HashMap<Uuid, u32>>,
    delivered: Mutex<Vec<EventPayload>>,
}

impl RecordingDelivery {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures,
            attempts: Mutex::new(Vec::new()),
            tries: Mutex::new(HashMap::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    pub fn delivered(&self) -> Vec<EventPayload> {
        self.delivered.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.delivered.lock().iter().map(|p| p.kind()).collect()
    }
}

#[async_trait]
impl EventDelivery for RecordingDelivery {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), ServerError> {
        self.attempts.lock().push(Instant::now());
        let tries = {
            let mut tries = self.tries.lock();
            let count = tries.entry(event.id).or_insert(0);
            *count += 1;
            *count
        };
        if tries <= self.failures {
            return Err(ServerError::RequestError("refused".to_string()));
        }
        self.delivered.lock().push(event.payload.clone());
        Ok(())
    }
}

struct FakeRun {
    identifier: String,
    is_event_stream: bool,
    status: watch::Sender<Status>,
}

/// In-memory encoder. Sessions run until stopped or crashed on demand.
pub struct FakeTranscoder {
    running: Mutex<HashMap<Uuid, FakeRun>>,
    live_starts: AtomicU32,
    event_starts: Mutex<Vec<Instant>>,
    event_count: watch::Sender<usize>,
    stopped: Mutex<Vec<String>>,
    fail_live: AtomicBool,
    fail_event: AtomicBool,
    crash_events: AtomicBool,
}

impl FakeTranscoder {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            live_starts: AtomicU32::new(0),
            event_starts: Mutex::new(Vec::new()),
            event_count: watch::channel(0).0,
            stopped: Mutex::new(Vec::new()),
            fail_live: AtomicBool::new(false),
            fail_event: AtomicBool::new(false),
            crash_events: AtomicBool::new(false),
        }
    }

    pub fn fail_live_starts(&self, fail: bool) {
        self.fail_live.store(fail, Ordering::SeqCst);
    }

    pub fn fail_event_starts(&self, fail: bool) {
        self.fail_event.store(fail, Ordering::SeqCst);
    }

    /// Event streams started from now on crash right away.
    pub fn crash_event_streams(&self, crash: bool) {
        self.crash_events.store(crash, Ordering::SeqCst);
    }

    pub fn crash(&self, identifier: &str) {
        let run = {
            let mut running = self.running.lock();
            let id = running
                .iter()
                .find(|(_, run)| run.identifier == identifier)
                .map(|(id, _)| *id);
            id.and_then(|id| running.remove(&id))
        };
        if let Some(run) = run {
            run.status.send_replace(Status::Crashed("killed by test".to_string()));
        }
    }

    pub fn crash_all_events(&self) {
        let runs: Vec<FakeRun> = {
            let mut running = self.running.lock();
            let ids: Vec<Uuid> = running
                .iter()
                .filter(|(_, run)| run.is_event_stream)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| running.remove(id)).collect()
        };
        for run in runs {
            run.status.send_replace(Status::Crashed("killed by test".to_string()));
        }
    }

    pub fn live_starts(&self) -> u32 {
        self.live_starts.load(Ordering::SeqCst)
    }

    pub fn event_starts(&self) -> Vec<Instant> {
        self.event_starts.lock().clone()
    }

    pub async fn wait_for_event_starts(&self, count: usize) -> Vec<Instant> {
        let mut starts = self.event_count.subscribe();
        let _ = starts.wait_for(|n| *n >= count).await;
        self.event_starts()
    }

    pub fn running_events(&self) -> usize {
        self.running
            .lock()
            .values()
            .filter(|run| run.is_event_stream)
            .count()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().clone()
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn start(&self, request: StartRequest) -> Result<Session, TranscoderError> {
        let failing = if request.is_event_stream {
            &self.fail_event
        } else {
            &self.fail_live
        };
        if failing.load(Ordering::SeqCst) {
            return Err(TranscoderError::StartFailure("refused by test".to_string()));
        }

        let (status, status_rx) = watch::channel(Status::Running);
        let handle = TranscoderHandle::new(
            request.identifier.clone(),
            request.is_event_stream,
            status_rx,
        );

        let input = if request.is_event_stream {
            self.event_starts.lock().push(Instant::now());
            self.event_count.send_modify(|n| *n += 1);
            None
        } else {
            self.live_starts.fetch_add(1, Ordering::SeqCst);
            let (tx, mut rx) = mpsc::channel::<Bytes>(16);
            tokio::spawn(async move { while rx.recv().await.is_some() {} });
            Some(InputSink::new(tx))
        };

        if request.is_event_stream && self.crash_events.load(Ordering::SeqCst) {
            status.send_replace(Status::Crashed("crashes on start".to_string()));
        } else {
            self.running.lock().insert(
                handle.id(),
                FakeRun {
                    identifier: request.identifier,
                    is_event_stream: request.is_event_stream,
                    status,
                },
            );
        }

        Ok(Session { handle, input })
    }

    async fn stop(&self, handle: &TranscoderHandle) -> Result<(), TranscoderError> {
        self.stopped.lock().push(handle.identifier().to_string());
        if let Some(run) = self.running.lock().remove(&handle.id()) {
            run.status.send_replace(Status::Exited(0));
        }
        Ok(())
    }
}

/// A wired session manager over fakes, with the offline stream started.
pub struct Harness {
    pub dir: TempDir,
    pub sessions: Arc<StreamSessionManager>,
    pub transcoder: Arc<FakeTranscoder>,
    pub offline: Arc<OfflineContentSupplier>,
    pub catalog: Arc<SegmentCatalog>,
    pub delivery: Arc<RecordingDelivery>,
    _workers: JoinSet<()>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let logo = dir.path().join("logo.png");
        std::fs::write(&logo, b"logo").unwrap();
        let clip = dir.path().join("offline.ts");
        std::fs::write(&clip, b"clip").unwrap();

        let profiles = vec![profile("720p", 5)];
        let transcoder = Arc::new(FakeTranscoder::new());
        let catalog = Arc::new(SegmentCatalog::new(
            &profiles,
            HlsLayout::new(dir.path().join("hls")),
            Arc::new(RecordingStorage::local()),
            None,
            Arc::new(ArchiveIndex::new()),
            CatalogOptions {
                persist_manifests: false,
                session_grace: Duration::from_secs(1),
                purge_archive: false,
            },
        ));

        let offline = Arc::new(OfflineContentSupplier::new(
            transcoder.clone(),
            Arc::clone(&catalog),
            &profiles,
            OfflineSettings {
                logo: Some(logo),
                clip: Some(clip),
                rendered_clip: dir.path().join("rendered.ts"),
                placeholder: PlaceholderClip::default(),
                restart: BackoffSettings::new(Duration::from_millis(500), Duration::from_secs(60)),
                stable_after: Duration::from_secs(30),
                webroot: dir.path().join("webroot"),
            },
        ));

        let delivery = Arc::new(RecordingDelivery::failing(0));
        let notifier = Arc::new(NotificationDispatcher::new(
            DispatchSettings {
                workers: 1,
                queue: 64,
                max_attempts: 3,
                backoff: BackoffSettings::new(Duration::from_millis(10), Duration::from_millis(100)),
            },
            vec![delivery.clone()],
        ));
        let workers = notifier.start();

        let sessions = Arc::new(StreamSessionManager::new(
            SessionSettings {
                stream_key: "secret".to_string(),
                liveness_timeout: Duration::from_secs(10),
            },
            profiles,
            transcoder.clone(),
            Arc::clone(&catalog),
            Arc::clone(&offline),
            notifier,
        ));
        sessions.start();

        Self {
            dir,
            sessions,
            transcoder,
            offline,
            catalog,
            delivery,
            _workers: workers,
        }
    }

    pub async fn wait_for_state(&self, state: StreamState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.sessions.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    pub async fn wait_for_events(&self, count: usize) -> Vec<EventPayload> {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.delivery.delivered().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        self.delivery.delivered()
    }
}
