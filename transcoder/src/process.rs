use crate::error::TranscoderError;
use crate::hls::HlsLayout;
use crate::transcoder::{RenditionProfile, TranscoderSettings};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where the encoder reads its media from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Bytes pushed through the session's [`InputSink`].
    Pipe,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub input: Input,
    pub profiles: Vec<RenditionProfile>,
    /// Unique per session; names the files the session writes.
    pub identifier: String,
    /// Continuously available content such as the offline loop. Any exit that
    /// was not requested is a crash.
    pub is_event_stream: bool,
}

impl StartRequest {
    pub fn live(profiles: Vec<RenditionProfile>, identifier: impl Into<String>) -> Self {
        Self {
            input: Input::Pipe,
            profiles,
            identifier: identifier.into(),
            is_event_stream: false,
        }
    }

    pub fn event(
        profiles: Vec<RenditionProfile>,
        identifier: impl Into<String>,
        clip: PathBuf,
    ) -> Self {
        Self {
            input: Input::File(clip),
            profiles,
            identifier: identifier.into(),
            is_event_stream: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Starting,
    Running,
    Exited(i32),
    Crashed(String),
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Exited(_) | Status::Crashed(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Starting => write!(f, "starting"),
            Status::Running => write!(f, "running"),
            Status::Exited(code) => write!(f, "exited with code {}", code),
            Status::Crashed(reason) => write!(f, "crashed: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscoderHandle {
    id: Uuid,
    identifier: String,
    is_event_stream: bool,
    status: watch::Receiver<Status>,
}

impl TranscoderHandle {
    pub fn new(
        identifier: impl Into<String>,
        is_event_stream: bool,
        status: watch::Receiver<Status>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identifier: identifier.into(),
            is_event_stream,
            status,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_event_stream(&self) -> bool {
        self.is_event_stream
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }
}

/// Resolves once the status is terminal. A dropped sender counts as a crash.
pub async fn wait_for_exit(mut status: watch::Receiver<Status>) -> Status {
    loop {
        let current = status.borrow_and_update().clone();
        if current.is_terminal() {
            return current;
        }
        if status.changed().await.is_err() {
            return Status::Crashed("status channel closed".to_string());
        }
    }
}

/// Write side of a piped session input.
#[derive(Debug, Clone)]
pub struct InputSink {
    chunks: mpsc::Sender<Bytes>,
}

impl InputSink {
    pub fn new(chunks: mpsc::Sender<Bytes>) -> Self {
        Self { chunks }
    }

    pub async fn send(&self, chunk: Bytes) -> Result<(), TranscoderError> {
        self.chunks
            .send(chunk)
            .await
            .map_err(|_| TranscoderError::InputClosed)
    }
}

pub struct Session {
    pub handle: TranscoderHandle,
    /// Present for [`Input::Pipe`] sessions.
    pub input: Option<InputSink>,
}

/// Capability interface over an external encoder.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn start(&self, request: StartRequest) -> Result<Session, TranscoderError>;

    /// Stops the session. The handle is forgotten even when this returns
    /// [`TranscoderError::ShutdownTimeout`].
    async fn stop(&self, handle: &TranscoderHandle) -> Result<(), TranscoderError>;

    fn status(&self, handle: &TranscoderHandle) -> Status {
        handle.status()
    }
}

type StopReply = oneshot::Sender<Result<(), TranscoderError>>;
type Running = Arc<Mutex<HashMap<Uuid, oneshot::Sender<StopReply>>>>;

/// Runs one ffmpeg process per session and supervises it from a tokio task.
pub struct FfmpegTranscoder {
    settings: Arc<TranscoderSettings>,
    layout: HlsLayout,
    running: Running,
}

impl FfmpegTranscoder {
    pub fn new(settings: TranscoderSettings, layout: HlsLayout) -> Self {
        Self {
            settings: Arc::new(settings),
            layout,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn layout(&self) -> &HlsLayout {
        &self.layout
    }

    /// Number of sessions currently tracked.
    pub fn running(&self) -> usize {
        self.running.lock().len()
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn start(&self, request: StartRequest) -> Result<Session, TranscoderError> {
        let cmd = self.settings.build_ffmpeg_command(&self.layout, &request)?;

        for profile in request.profiles.iter() {
            let dir = self.layout.rendition_dir(&profile.name);
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                TranscoderError::StartFailure(format!("create {}: {}", dir.display(), e))
            })?;
        }

        let mut cmd = Command::from(cmd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            TranscoderError::StartFailure(format!("spawn {}: {}", self.settings.ffmpeg.display(), e))
        })?;

        let (status_tx, status_rx) = watch::channel(Status::Starting);
        let handle = TranscoderHandle::new(
            request.identifier.clone(),
            request.is_event_stream,
            status_rx,
        );

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(request.identifier.clone(), stderr));
        }

        let stdin = child.stdin.take().ok_or_else(|| {
            TranscoderError::StartFailure("encoder stdin was not captured".to_string())
        })?;

        let (input, control) = match request.input {
            Input::Pipe => {
                let (tx, rx) = mpsc::channel(self.settings.input_buffer.max(1));
                let (drain, drained) = oneshot::channel();
                let pump = tokio::spawn(pump_input(request.identifier.clone(), rx, drained, stdin));
                (Some(InputSink::new(tx)), InputControl::Pipe { drain, pump })
            }
            Input::File(_) => (None, InputControl::Stdin(stdin)),
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        self.running.lock().insert(handle.id(), stop_tx);
        let _ = status_tx.send(Status::Running);

        info!(
            identifier = %request.identifier,
            event_stream = request.is_event_stream,
            pid = ?child.id(),
            "transcoder started"
        );

        tokio::spawn(supervise(
            child,
            control,
            stop_rx,
            status_tx,
            Supervision {
                id: handle.id(),
                identifier: request.identifier,
                is_event_stream: request.is_event_stream,
                grace_period: self.settings.grace_period,
                running: Arc::clone(&self.running),
            },
        ));

        Ok(Session { handle, input })
    }

    async fn stop(&self, handle: &TranscoderHandle) -> Result<(), TranscoderError> {
        let control = self.running.lock().remove(&handle.id());
        let Some(control) = control else {
            debug!(identifier = handle.identifier(), "transcoder already exited");
            return Ok(());
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if control.send(reply_tx).is_err() {
            return Ok(());
        }

        reply_rx.await.unwrap_or(Ok(()))
    }
}

struct Supervision {
    id: Uuid,
    identifier: String,
    is_event_stream: bool,
    grace_period: Duration,
    running: Running,
}

enum InputControl {
    /// The pump task owns stdin and closes it once drained.
    Pipe {
        drain: oneshot::Sender<()>,
        pump: JoinHandle<()>,
    },
    Stdin(ChildStdin),
}

impl InputControl {
    /// Asks the encoder to finish: EOF after the queued chunks for piped
    /// input, `q` for file input.
    async fn finish(self, grace_period: Duration, identifier: &str) {
        match self {
            InputControl::Pipe { drain, mut pump } => {
                let _ = drain.send(());
                if tokio::time::timeout(grace_period, &mut pump).await.is_err() {
                    warn!(identifier, "transcoder input not drained within {:?}", grace_period);
                    pump.abort();
                }
            }
            InputControl::Stdin(mut stdin) => {
                let _ = stdin.write_all(b"q").await;
                let _ = stdin.flush().await;
            }
        }
    }

    fn close(self) {
        if let InputControl::Pipe { pump, .. } = self {
            pump.abort();
        }
    }
}

async fn supervise(
    mut child: Child,
    control: InputControl,
    stop: oneshot::Receiver<StopReply>,
    status: watch::Sender<Status>,
    supervision: Supervision,
) {
    let identifier = supervision.identifier.as_str();
    tokio::select! {
        result = child.wait() => {
            supervision.running.lock().remove(&supervision.id);
            control.close();

            let next = classify(result, supervision.is_event_stream);
            match &next {
                Status::Crashed(reason) => warn!(identifier, "transcoder crashed: {}", reason),
                _ => info!(identifier, "transcoder {}", next),
            }
            let _ = status.send(next);
        }
        request = stop => {
            let (result, code) = shutdown(&mut child, control, supervision.grace_period, identifier).await;
            info!(identifier, "transcoder stopped");
            let _ = status.send(Status::Exited(code));
            if let Ok(reply) = request {
                let _ = reply.send(result);
            }
        }
    }
}

async fn shutdown(
    child: &mut Child,
    control: InputControl,
    grace_period: Duration,
    identifier: &str,
) -> (Result<(), TranscoderError>, i32) {
    control.finish(grace_period, identifier).await;

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => (Ok(()), status.code().unwrap_or(-1)),
        Ok(Err(e)) => {
            warn!(identifier, "wait for transcoder: {}", e);
            (Ok(()), -1)
        }
        Err(_) => {
            warn!(
                identifier,
                "transcoder did not exit within {:?}, killing it", grace_period
            );
            if let Err(e) = child.kill().await {
                error!(identifier, pid = ?child.id(), "leaked transcoder process: {}", e);
            }
            (Err(TranscoderError::ShutdownTimeout(grace_period)), -1)
        }
    }
}

fn classify(result: io::Result<ExitStatus>, is_event_stream: bool) -> Status {
    match result {
        Err(e) => Status::Crashed(format!("wait: {}", e)),
        Ok(status) if status.success() && !is_event_stream => Status::Exited(0),
        Ok(status) if status.success() => {
            Status::Crashed("event stream input ended".to_string())
        }
        Ok(status) => match status.code() {
            Some(code) => Status::Crashed(format!("exited with code {}", code)),
            None => Status::Crashed("terminated by signal".to_string()),
        },
    }
}

/// Copies chunks to stdin. Once `drain` fires no new chunks are accepted,
/// the queued ones are written and stdin is closed.
async fn pump_input(
    identifier: String,
    mut chunks: mpsc::Receiver<Bytes>,
    mut drain: oneshot::Receiver<()>,
    mut stdin: ChildStdin,
) {
    let mut draining = false;
    loop {
        let chunk = tokio::select! {
            chunk = chunks.recv() => chunk,
            _ = &mut drain, if !draining => {
                draining = true;
                chunks.close();
                continue;
            }
        };
        let Some(chunk) = chunk else {
            break;
        };
        if let Err(e) = stdin.write_all(&chunk).await {
            debug!(identifier, "transcoder input closed: {}", e);
            return;
        }
    }

    if let Err(e) = stdin.flush().await {
        debug!(identifier, "flush transcoder input: {}", e);
    }
}

async fn forward_stderr(identifier: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => warn!(identifier, "ffmpeg: {}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(identifier, "read ffmpeg stderr: {}", e);
                break;
            }
        }
    }
}
