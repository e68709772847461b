use common::defaults::Bool;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// A latency level trades live-edge latency against playback stability by
/// choosing how long each segment is and how many of them a playlist keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyLevel {
    level: u8,
    segment_seconds: u32,
    segment_count: usize,
}

const LATENCY_LEVELS: [LatencyLevel; 5] = [
    LatencyLevel::new(0, 1, 25),
    LatencyLevel::new(1, 2, 15),
    LatencyLevel::new(2, 3, 10),
    LatencyLevel::new(3, 4, 10),
    LatencyLevel::new(4, 5, 20),
];

impl LatencyLevel {
    /// The level used for the offline loop, where stability matters more than latency.
    pub const OFFLINE: u8 = 4;
    pub const DEFAULT: u8 = 2;

    const fn new(level: u8, segment_seconds: u32, segment_count: usize) -> Self {
        Self {
            level,
            segment_seconds,
            segment_count,
        }
    }

    pub fn get(level: u8) -> Option<LatencyLevel> {
        LATENCY_LEVELS.get(level as usize).copied()
    }

    pub fn offline() -> LatencyLevel {
        LATENCY_LEVELS[Self::OFFLINE as usize]
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn segment_seconds(&self) -> u32 {
        self.segment_seconds
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_seconds as u64)
    }

    /// Number of segments kept in a rendition playlist.
    pub fn window_size(&self) -> usize {
        self.segment_count
    }
}

impl Default for LatencyLevel {
    fn default() -> Self {
        LATENCY_LEVELS[Self::DEFAULT as usize]
    }
}

impl<'de> Deserialize<'de> for LatencyLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = u8::deserialize(deserializer)?;
        LatencyLevel::get(level).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "unknown latency level {}, expected 0..={}",
                level,
                LATENCY_LEVELS.len() - 1
            ))
        })
    }
}

/// HLS muxer options shared by every rendition of one encoder process.
#[derive(Deserialize, Debug, Clone)]
pub struct Hls {
    /// Writes `#EXT-X-PROGRAM-DATE-TIME` into the producer playlist.
    #[serde(default = "Bool::r#true")]
    pub program_date_time: bool,
    /// Every segment starts with a keyframe.
    #[serde(default = "Bool::r#true")]
    pub independent_segments: bool,
    /// Segments are written to a temporary name and renamed once complete, so
    /// the watcher never sees a partially written file.
    #[serde(default = "Bool::r#true")]
    pub temp_file: bool,
    /// Entries kept in the producer playlist. Zero derives it from the window size.
    #[serde(default)]
    pub list_size: usize,
}

impl Default for Hls {
    fn default() -> Self {
        Self {
            program_date_time: true,
            independent_segments: true,
            temp_file: true,
            list_size: 0,
        }
    }
}

impl Hls {
    pub fn add_args(
        &self,
        cmd: &mut Command,
        layout: &HlsLayout,
        identifier: &str,
        segment_seconds: u32,
        window_size: usize,
    ) {
        // The producer playlist only feeds the watcher, which may fall a cycle
        // behind; keep enough history that no segment scrolls out unseen.
        let list_size = if self.list_size > 0 {
            self.list_size
        } else {
            (window_size * 2).max(10)
        };

        cmd.arg("-f")
            .arg("hls")
            .arg("-hls_time")
            .arg(segment_seconds.to_string())
            .arg("-hls_list_size")
            .arg(list_size.to_string())
            .arg("-hls_segment_type")
            .arg("mpegts");

        let mut flags = Vec::new();
        if self.program_date_time {
            flags.push("program_date_time");
        }
        if self.independent_segments {
            flags.push("independent_segments");
        }
        if self.temp_file {
            flags.push("temp_file");
        }
        if !flags.is_empty() {
            cmd.arg("-hls_flags").arg(flags.join("+"));
        }

        cmd.arg("-hls_segment_filename")
            .arg(layout.segment_template(identifier))
            .arg(layout.playlist_template(identifier));
    }
}

/// Directory layout of the managed HLS tree:
///
/// ```text
/// <root>/stream.m3u8                         master playlist
/// <root>/<rendition>/stream.m3u8             served rendition playlist
/// <root>/<rendition>/<identifier>.m3u8       producer playlist written by the encoder
/// <root>/<rendition>/<identifier>-<n>.ts     segments
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsLayout {
    root: PathBuf,
}

pub const MANIFEST_NAME: &str = "stream.m3u8";

impl HlsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rendition_dir(&self, rendition: &str) -> PathBuf {
        self.root.join(rendition)
    }

    pub fn master_manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_NAME)
    }

    pub fn manifest_path(&self, rendition: &str) -> PathBuf {
        self.rendition_dir(rendition).join(MANIFEST_NAME)
    }

    pub fn producer_playlist(&self, rendition: &str, identifier: &str) -> PathBuf {
        self.rendition_dir(rendition)
            .join(format!("{}.m3u8", identifier))
    }

    pub fn segment_path(&self, rendition: &str, file_name: &str) -> PathBuf {
        self.rendition_dir(rendition).join(file_name)
    }

    pub fn segment_file_name(identifier: &str, sequence: u64) -> String {
        format!("{}-{}.ts", identifier, sequence)
    }

    /// Extracts the producer sequence number from a segment file name.
    pub fn parse_segment_file_name(identifier: &str, file_name: &str) -> Option<u64> {
        file_name
            .strip_prefix(identifier)?
            .strip_prefix('-')?
            .strip_suffix(".ts")?
            .parse()
            .ok()
    }

    /// Whether a file in a rendition directory was produced by the given session.
    pub fn belongs_to(identifier: &str, file_name: &str) -> bool {
        file_name == format!("{}.m3u8", identifier)
            || Self::parse_segment_file_name(identifier, file_name).is_some()
    }

    fn segment_template(&self, identifier: &str) -> PathBuf {
        self.root.join("%v").join(format!("{}-%d.ts", identifier))
    }

    fn playlist_template(&self, identifier: &str) -> PathBuf {
        self.root.join("%v").join(format!("{}.m3u8", identifier))
    }
}
