use crate::backoff::{Backoff, BackoffSettings};
use crate::errors::ServerError;
use crate::session::{Broadcaster, StreamState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub mod webhook;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    SessionStarted {
        broadcaster: Broadcaster,
    },
    SessionEnded {
        duration_secs: f64,
        reason: String,
    },
    Transition {
        from: StreamState,
        to: StreamState,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::SessionStarted { .. } => "session-started",
            EventPayload::SessionEnded { .. } => "session-ended",
            EventPayload::Transition { .. } => "transition",
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub id: Uuid,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub attempts: u32,
    #[serde(skip)]
    pub next_retry: Option<DateTime<Utc>>,
}

impl NotificationEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            created_at: Utc::now(),
            attempts: 0,
            next_retry: None,
        }
    }
}

/// One way of getting an event to a consumer.
#[async_trait]
pub trait EventDelivery: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), ServerError>;
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub workers: usize,
    pub queue: usize,
    pub max_attempts: u32,
    pub backoff: BackoffSettings,
}

struct Job {
    event: NotificationEvent,
    target: Arc<dyn EventDelivery>,
}

/// Fans state-change events out to every target through a bounded queue.
/// A job's retries run sequentially in the worker that picked it up.
pub struct NotificationDispatcher {
    targets: Vec<Arc<dyn EventDelivery>>,
    settings: DispatchSettings,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl NotificationDispatcher {
    pub fn new(settings: DispatchSettings, targets: Vec<Arc<dyn EventDelivery>>) -> Self {
        let (sender, receiver) = mpsc::channel(settings.queue.max(1));
        Self {
            targets,
            settings,
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Never blocks. Jobs that do not fit in the queue are dropped.
    pub fn enqueue(&self, payload: EventPayload) {
        let sender = match self.sender.lock().as_ref() {
            Some(sender) => sender.clone(),
            None => {
                debug!(kind = payload.kind(), "dispatcher closed, event dropped");
                return;
            }
        };

        let event = NotificationEvent::new(payload);
        for target in self.targets.iter() {
            let job = Job {
                event: event.clone(),
                target: Arc::clone(target),
            };
            if let Err(e) = sender.try_send(job) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    kind = event.payload.kind(),
                    target = target.name(),
                    "notification queue: {}, event dropped",
                    e
                );
            }
        }
    }

    pub fn start(self: &Arc<Self>) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for worker in 0..self.settings.workers.max(1) {
            let dispatcher = Arc::clone(self);
            set.spawn(async move { dispatcher.work(worker).await });
        }
        set
    }

    /// Stops accepting events. Workers exit once the queue is drained.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    async fn work(&self, worker: usize) {
        loop {
            let job = self.receiver.lock().await.recv().await;
            let Some(job) = job else { break };
            self.deliver(job).await;
        }
        debug!(worker, "notification worker stopped");
    }

    async fn deliver(&self, job: Job) {
        let Job { mut event, target } = job;
        let mut backoff = Backoff::new(self.settings.backoff.clone());

        loop {
            event.attempts += 1;
            let e = match target.deliver(&event).await {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        kind = event.payload.kind(),
                        target = target.name(),
                        attempts = event.attempts,
                        "event delivered"
                    );
                    return;
                }
                Err(e) => e,
            };

            if event.attempts >= self.settings.max_attempts {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let failure = ServerError::DeliveryFailure(format!(
                    "{} event {} to {} after {} attempts: {}",
                    event.payload.kind(),
                    event.id,
                    target.name(),
                    event.attempts,
                    e
                ));
                error!("{}", failure);
                return;
            }

            let delay = backoff.next_delay();
            event.next_retry = chrono::Duration::from_std(delay)
                .ok()
                .map(|delay| Utc::now() + delay);
            warn!(
                kind = event.payload.kind(),
                target = target.name(),
                attempt = event.attempts,
                "delivery failed, retrying in {:?}: {}",
                delay,
                e
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
