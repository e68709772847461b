use std::{error::Error, fmt};
use transcoder::TranscoderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidStreamKey,
    /// Another broadcaster holds the slot and is still active.
    SlotHeld,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InvalidStreamKey => write!(f, "invalid stream key"),
            RejectReason::SlotHeld => write!(f, "another broadcaster is live"),
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    ConfigError(String),
    NetworkError(String),
    StorageError(String),
    RequestError(String),
    ClaimRejected(RejectReason),
    Transcoder(TranscoderError),
    OffloadFailure(String),
    SegmentOrderingViolation {
        rendition: String,
        sequence: u64,
        tail: u64,
    },
    DeliveryFailure(String),
    UnknownRendition(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            ServerError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            ServerError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            ServerError::RequestError(msg) => write!(f, "Request error: {}", msg),
            ServerError::ClaimRejected(reason) => write!(f, "Claim rejected: {}", reason),
            ServerError::Transcoder(e) => write!(f, "{}", e),
            ServerError::OffloadFailure(msg) => write!(f, "Offload failure: {}", msg),
            ServerError::SegmentOrderingViolation {
                rendition,
                sequence,
                tail,
            } => write!(
                f,
                "Segment ordering violation: {}: sequence {} is not after {}",
                rendition, sequence, tail
            ),
            ServerError::DeliveryFailure(msg) => write!(f, "Delivery failure: {}", msg),
            ServerError::UnknownRendition(name) => write!(f, "Unknown rendition: {}", name),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServerError::Transcoder(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TranscoderError> for ServerError {
    fn from(e: TranscoderError) -> Self {
        ServerError::Transcoder(e)
    }
}
