pub mod error;
pub mod hls;
pub mod placeholder;
pub mod process;
pub mod transcoder;

pub use error::TranscoderError;
pub use hls::{HlsLayout, LatencyLevel, MANIFEST_NAME};
pub use placeholder::PlaceholderClip;
pub use process::{
    wait_for_exit, FfmpegTranscoder, Input, InputSink, Session, StartRequest, Status, Transcoder,
    TranscoderHandle,
};
pub use transcoder::{RenditionProfile, TranscoderSettings};
