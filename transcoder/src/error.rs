use std::time::Duration;
use std::{error::Error, fmt};

#[derive(Debug)]
pub enum TranscoderError {
    ConfigError(String),
    /// The encoder process could not be launched.
    StartFailure(String),
    /// The encoder exited without being asked to.
    Crash(String),
    /// The encoder outlived the grace period and had to be killed.
    ShutdownTimeout(Duration),
    InputClosed,
}

impl fmt::Display for TranscoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscoderError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            TranscoderError::StartFailure(msg) => write!(f, "Transcoder start failure: {}", msg),
            TranscoderError::Crash(msg) => write!(f, "Transcoder crash: {}", msg),
            TranscoderError::ShutdownTimeout(grace) => {
                write!(f, "Transcoder did not exit within {:?}", grace)
            }
            TranscoderError::InputClosed => write!(f, "Transcoder input is closed"),
        }
    }
}

impl Error for TranscoderError {}
