use crate::catalog::SegmentCatalog;
use crate::errors::{RejectReason, ServerError};
use crate::notify::{EventPayload, NotificationDispatcher};
use crate::offline::OfflineContentSupplier;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};
use transcoder::{
    wait_for_exit, InputSink, RenditionProfile, StartRequest, Status, Transcoder,
    TranscoderError, TranscoderHandle,
};
use uuid::Uuid;

mod state;

pub use state::{StateCell, StreamState};

/// Proof of holding the single live slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExclusivityToken(Uuid);

impl ExclusivityToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for ExclusivityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Broadcaster {
    pub remote_addr: SocketAddr,
    pub user_agent: Option<String>,
    pub connected_at: DateTime<Utc>,
    #[serde(skip)]
    pub token: ExclusivityToken,
}

#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub remote_addr: SocketAddr,
    pub user_agent: Option<String>,
    pub stream_key: String,
}

/// Handed to the ingest boundary on a successful claim.
#[derive(Debug)]
pub struct Lease {
    pub token: ExclusivityToken,
    pub input: InputSink,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    Disconnected,
    LivenessTimeout,
    TranscoderExited(Status),
    StartFailure(String),
    Shutdown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Disconnected => write!(f, "broadcaster disconnected"),
            EndReason::LivenessTimeout => write!(f, "broadcaster went silent"),
            EndReason::TranscoderExited(status) => write!(f, "transcoder {}", status),
            EndReason::StartFailure(msg) => write!(f, "transcoder failed to start: {}", msg),
            EndReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: StreamState,
    pub online: bool,
    pub broadcaster: Option<Broadcaster>,
    pub session: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub stream_key: String,
    pub liveness_timeout: Duration,
}

struct Holder {
    broadcaster: Broadcaster,
    handle: TranscoderHandle,
    started: Instant,
    last_activity: Instant,
}

/// Owns the live slot and the `Offline -> Online -> Transitioning -> Offline`
/// state machine. Claims and releases are serialized by the claim gate.
pub struct StreamSessionManager {
    state: StateCell,
    gate: tokio::sync::Mutex<()>,
    holder: Mutex<Option<Holder>>,
    transcoder: Arc<dyn Transcoder>,
    catalog: Arc<SegmentCatalog>,
    offline: Arc<OfflineContentSupplier>,
    notifier: Arc<NotificationDispatcher>,
    profiles: Vec<RenditionProfile>,
    settings: SessionSettings,
}

impl StreamSessionManager {
    pub fn new(
        settings: SessionSettings,
        profiles: Vec<RenditionProfile>,
        transcoder: Arc<dyn Transcoder>,
        catalog: Arc<SegmentCatalog>,
        offline: Arc<OfflineContentSupplier>,
        notifier: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            state: StateCell::new(StreamState::Offline),
            gate: tokio::sync::Mutex::new(()),
            holder: Mutex::new(None),
            transcoder,
            catalog,
            offline,
            notifier,
            profiles,
            settings,
        }
    }

    /// Brings up the offline stream.
    pub fn start(self: &Arc<Self>) {
        self.fall_back_to_offline();
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    pub fn status(&self) -> StatusSnapshot {
        let holder = self.holder.lock();
        StatusSnapshot {
            state: self.state.get(),
            online: holder.is_some(),
            broadcaster: holder.as_ref().map(|h| h.broadcaster.clone()),
            session: holder.as_ref().map(|h| h.handle.identifier().to_string()),
        }
    }

    pub async fn attempt_claim(self: &Arc<Self>, request: ClaimRequest) -> Result<Lease, ServerError> {
        if request.stream_key != self.settings.stream_key {
            warn!(remote = %request.remote_addr, "claim rejected: invalid stream key");
            return Err(ServerError::ClaimRejected(RejectReason::InvalidStreamKey));
        }

        let _gate = self.gate.lock().await;

        let stale = {
            let holder = self.holder.lock();
            match holder.as_ref() {
                Some(h) if h.last_activity.elapsed() < self.settings.liveness_timeout => {
                    info!(
                        remote = %request.remote_addr,
                        holder = %h.broadcaster.remote_addr,
                        "claim rejected: slot held"
                    );
                    return Err(ServerError::ClaimRejected(RejectReason::SlotHeld));
                }
                Some(_) => true,
                None => false,
            }
        };
        if stale {
            let holder = self.holder.lock().take();
            if let Some(holder) = holder {
                warn!(
                    holder = %holder.broadcaster.remote_addr,
                    "replacing silent broadcaster"
                );
                self.end_session(holder, EndReason::LivenessTimeout, false).await;
            }
        }

        self.offline.deactivate().await;

        let token = ExclusivityToken::new();
        let identifier = format!("live-{}", token.short());
        self.catalog.begin_session(&identifier);

        let session = match self
            .transcoder
            .start(StartRequest::live(self.profiles.clone(), identifier.clone()))
            .await
        {
            Ok(session) => session,
            Err(e) => return Err(self.roll_back(&identifier, e)),
        };

        let Some(input) = session.input else {
            if let Err(e) = self.transcoder.stop(&session.handle).await {
                warn!(identifier, "{}", e);
            }
            return Err(self.roll_back(&identifier, TranscoderError::InputClosed));
        };

        let broadcaster = Broadcaster {
            remote_addr: request.remote_addr,
            user_agent: request.user_agent,
            connected_at: Utc::now(),
            token,
        };
        let status = session.handle.subscribe();
        let now = Instant::now();
        *self.holder.lock() = Some(Holder {
            broadcaster: broadcaster.clone(),
            handle: session.handle,
            started: now,
            last_activity: now,
        });

        let previous = self.state.swap(StreamState::Online);
        self.emit_transition(previous, StreamState::Online);
        info!(
            identifier,
            remote = %broadcaster.remote_addr,
            "broadcaster connected"
        );
        self.notifier
            .enqueue(EventPayload::SessionStarted { broadcaster });

        tokio::spawn(Arc::clone(self).supervise(token, status));
        Ok(Lease { token, input })
    }

    /// Returns false once the token no longer holds the slot.
    pub fn report_activity(&self, token: ExclusivityToken) -> bool {
        match self.holder.lock().as_mut() {
            Some(holder) if holder.broadcaster.token == token => {
                holder.last_activity = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Ends the session held by `token`. Returns false when it already ended.
    pub async fn release(self: &Arc<Self>, token: ExclusivityToken, reason: EndReason) -> bool {
        let _gate = self.gate.lock().await;
        let holder = {
            let mut guard = self.holder.lock();
            if guard
                .as_ref()
                .is_some_and(|h| h.broadcaster.token == token)
            {
                guard.take()
            } else {
                None
            }
        };

        match holder {
            Some(holder) => {
                self.end_session(holder, reason, true).await;
                true
            }
            None => false,
        }
    }

    /// Ends any live session and stops the offline stream without restarting it.
    pub async fn shutdown(self: &Arc<Self>) {
        let _gate = self.gate.lock().await;
        let holder = self.holder.lock().take();
        if let Some(holder) = holder {
            self.end_session(holder, EndReason::Shutdown, false).await;
        }
        self.offline.deactivate().await;
    }

    async fn supervise(self: Arc<Self>, token: ExclusivityToken, status: watch::Receiver<Status>) {
        loop {
            let Some(deadline) = self.activity_deadline(token) else {
                return;
            };

            tokio::select! {
                status = wait_for_exit(status.clone()) => {
                    self.release(token, EndReason::TranscoderExited(status)).await;
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let expired = self
                        .activity_deadline(token)
                        .is_some_and(|deadline| deadline <= Instant::now());
                    if expired {
                        self.release(token, EndReason::LivenessTimeout).await;
                        return;
                    }
                }
            }
        }
    }

    fn activity_deadline(&self, token: ExclusivityToken) -> Option<Instant> {
        self.holder
            .lock()
            .as_ref()
            .filter(|h| h.broadcaster.token == token)
            .map(|h| h.last_activity + self.settings.liveness_timeout)
    }

    async fn end_session(self: &Arc<Self>, holder: Holder, reason: EndReason, fall_back: bool) {
        if self
            .state
            .compare_exchange(StreamState::Online, StreamState::Transitioning)
        {
            self.emit_transition(StreamState::Online, StreamState::Transitioning);
        }

        let identifier = holder.handle.identifier();
        if let Err(e) = self.transcoder.stop(&holder.handle).await {
            warn!(identifier, "{}", e);
        }
        self.catalog.end_session(identifier);

        let duration = holder.started.elapsed();
        info!(
            identifier,
            remote = %holder.broadcaster.remote_addr,
            "session ended after {:?}: {}",
            duration,
            reason
        );
        self.notifier.enqueue(EventPayload::SessionEnded {
            duration_secs: duration.as_secs_f64(),
            reason: reason.to_string(),
        });

        if fall_back {
            self.fall_back_to_offline();
        }
    }

    fn roll_back(self: &Arc<Self>, identifier: &str, e: TranscoderError) -> ServerError {
        error!(identifier, "live transcoder: {}", e);
        self.catalog.end_session(identifier);
        self.notifier.enqueue(EventPayload::SessionEnded {
            duration_secs: 0.0,
            reason: EndReason::StartFailure(e.to_string()).to_string(),
        });
        self.fall_back_to_offline();
        e.into()
    }

    /// Settles `Transitioning` into `Offline` once the offline stream runs.
    fn fall_back_to_offline(self: &Arc<Self>) {
        let mut ready = self.offline.ensure_offline_stream_active();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if ready.wait_for(|ready| *ready).await.is_ok()
                && manager
                    .state
                    .compare_exchange(StreamState::Transitioning, StreamState::Offline)
            {
                manager.emit_transition(StreamState::Transitioning, StreamState::Offline);
            }
        });
    }

    fn emit_transition(&self, from: StreamState, to: StreamState) {
        if from == to {
            return;
        }
        info!(%from, %to, "stream state changed");
        self.notifier.enqueue(EventPayload::Transition { from, to });
    }
}
