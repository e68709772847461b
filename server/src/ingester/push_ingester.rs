use crate::errors::{RejectReason, ServerError};
use crate::ingester::Ingester;
use crate::session::{ClaimRequest, EndReason, StreamSessionManager};
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::USER_AGENT;
use hyper::{Method, Request, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LIVE_PREFIX: &str = "/live/";

/// Takes a continuous MPEG-TS upload on `PUT /live/<stream key>` and feeds it
/// to the live transcoder for as long as the request body lasts.
#[derive(Clone)]
pub struct PushIngester {
    sessions: Arc<StreamSessionManager>,
    liveness_timeout: Duration,
}

impl PushIngester {
    pub fn new(sessions: Arc<StreamSessionManager>, liveness_timeout: Duration) -> Self {
        PushIngester {
            sessions,
            liveness_timeout,
        }
    }
}

#[async_trait]
impl Ingester for PushIngester {
    async fn ingest(&self, remote: SocketAddr, mut req: Request<Incoming>) -> StatusCode {
        if req.method() != Method::PUT && req.method() != Method::POST {
            return StatusCode::METHOD_NOT_ALLOWED;
        }

        let Some(stream_key) = req.uri().path().strip_prefix(LIVE_PREFIX) else {
            return StatusCode::NOT_FOUND;
        };
        let request = ClaimRequest {
            remote_addr: remote,
            user_agent: req
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            stream_key: stream_key.to_string(),
        };

        let lease = match self.sessions.attempt_claim(request).await {
            Ok(lease) => lease,
            Err(ServerError::ClaimRejected(RejectReason::InvalidStreamKey)) => {
                return StatusCode::FORBIDDEN
            }
            Err(ServerError::ClaimRejected(RejectReason::SlotHeld)) => {
                return StatusCode::CONFLICT
            }
            Err(e) => {
                error!(%remote, "ingest: {}", e);
                return StatusCode::SERVICE_UNAVAILABLE;
            }
        };

        let mut received = 0u64;
        let reason = loop {
            let next = match tokio::time::timeout(self.liveness_timeout, req.frame()).await {
                Ok(next) => next,
                Err(_) => break EndReason::LivenessTimeout,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!(%remote, "req body: read: {}", e);
                    break EndReason::Disconnected;
                }
                None => break EndReason::Disconnected,
            };

            let Ok(data) = frame.into_data() else {
                continue;
            };
            if !self.sessions.report_activity(lease.token) {
                info!(%remote, "ingest: session was taken over");
                return StatusCode::GONE;
            }

            received += data.len() as u64;
            if let Err(e) = lease.input.send(data).await {
                // The session supervisor reports the encoder exit.
                warn!(%remote, "ingest: {}", e);
                return StatusCode::BAD_GATEWAY;
            }
        };

        debug!(%remote, received, "ingest: upload finished");
        self.sessions.release(lease.token, reason).await;
        StatusCode::OK
    }
}
