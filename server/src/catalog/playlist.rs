use crate::storage::{segment_key, Locator, StorageProvider};
use chrono::{DateTime, Utc};
use std::fmt::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use transcoder::RenditionProfile;

/// What the output watcher learns about a freshly written segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentMeta {
    /// Producer session that wrote the segment.
    pub identifier: String,
    /// Sequence number assigned by the producer.
    pub source_sequence: u64,
    pub duration: Duration,
    pub size: u64,
    pub file_name: String,
}

#[derive(Debug, Clone)]
pub struct Segment {
    /// Position in the rendition playlist, contiguous from zero for the
    /// process lifetime.
    pub sequence: u64,
    pub source_sequence: u64,
    pub identifier: String,
    pub duration: Duration,
    pub size: u64,
    pub file_name: String,
    pub path: PathBuf,
    pub rendition: String,
    pub created_at: DateTime<Utc>,
    /// First segment of a new producer session.
    pub discontinuity: bool,
    pub locator: Locator,
}

impl Segment {
    pub fn key(&self) -> String {
        segment_key(&self.rendition, &self.file_name)
    }
}

/// Immutable snapshot of one rendition playlist.
#[derive(Debug)]
pub struct Playlist {
    pub rendition: String,
    pub target_duration: u64,
    pub discontinuity_sequence: u64,
    pub segments: Vec<Arc<Segment>>,
    manifest: String,
}

impl Playlist {
    pub fn new(
        rendition: String,
        target_duration: u64,
        discontinuity_sequence: u64,
        segments: Vec<Arc<Segment>>,
        storage: &dyn StorageProvider,
    ) -> Self {
        let mut playlist = Self {
            rendition,
            target_duration,
            discontinuity_sequence,
            segments,
            manifest: String::new(),
        };
        playlist.manifest = playlist.render(storage);
        playlist
    }

    pub fn media_sequence(&self) -> u64 {
        self.segments.first().map(|s| s.sequence).unwrap_or(0)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.segments.last().map(|s| s.sequence)
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.segments.iter().any(|s| s.file_name == file_name)
    }

    pub fn manifest(&self) -> &str {
        &self.manifest
    }

    fn render(&self, storage: &dyn StorageProvider) -> String {
        // Players reject a target duration below any segment's rounded length.
        let target = self
            .segments
            .iter()
            .map(|s| s.duration.as_secs_f64().round() as u64)
            .max()
            .unwrap_or(0)
            .max(self.target_duration);

        let mut out = String::with_capacity(128 + self.segments.len() * 64);
        let _ = writeln!(out, "#EXTM3U");
        let _ = writeln!(out, "#EXT-X-VERSION:3");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", target);
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence());
        if self.discontinuity_sequence > 0 {
            let _ = writeln!(
                out,
                "#EXT-X-DISCONTINUITY-SEQUENCE:{}",
                self.discontinuity_sequence
            );
        }

        for segment in self.segments.iter() {
            if segment.discontinuity {
                let _ = writeln!(out, "#EXT-X-DISCONTINUITY");
            }
            let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration.as_secs_f64());
            let _ = writeln!(out, "{}", storage.resolve_serving_url(&segment.locator));
        }
        out
    }
}

/// Master playlist listing every rendition, relative to `/hls/`.
pub fn render_master(profiles: &[RenditionProfile]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "#EXTM3U");
    let _ = writeln!(out, "#EXT-X-VERSION:3");
    for profile in profiles {
        match profile.resolution() {
            Some((width, height)) => {
                let _ = writeln!(
                    out,
                    "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}",
                    profile.bandwidth(),
                    width,
                    height
                );
            }
            None => {
                let _ = writeln!(out, "#EXT-X-STREAM-INF:BANDWIDTH={}", profile.bandwidth());
            }
        }
        let _ = writeln!(out, "{}/stream.m3u8", profile.name);
    }
    out
}

/// Parses the producer playlist written by the encoder into
/// `(duration, file name)` entries.
pub fn parse_producer_playlist(data: &str) -> Vec<(Duration, String)> {
    let mut entries = Vec::new();
    let mut duration = None;
    for line in data.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let value = rest.split(',').next().unwrap_or("");
            duration = value
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite() && *d >= 0.0)
                .map(Duration::from_secs_f64);
        } else if line.is_empty() || line.starts_with('#') {
            continue;
        } else if let Some(d) = duration.take() {
            let file_name = line.rsplit('/').next().unwrap_or(line);
            entries.push((d, file_name.to_string()));
        }
    }
    entries
}
