use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Offline = 0,
    Online = 1,
    Transitioning = 2,
}

impl StreamState {
    fn from_u8(value: u8) -> StreamState {
        match value {
            1 => StreamState::Online,
            2 => StreamState::Transitioning,
            _ => StreamState::Offline,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Offline => write!(f, "offline"),
            StreamState::Online => write!(f, "online"),
            StreamState::Transitioning => write!(f, "transitioning"),
        }
    }
}

/// The authoritative stream state. Reads never block.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: StreamState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Stores `to` and returns the previous state.
    pub fn swap(&self, to: StreamState) -> StreamState {
        StreamState::from_u8(self.0.swap(to as u8, Ordering::AcqRel))
    }

    pub fn compare_exchange(&self, from: StreamState, to: StreamState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
