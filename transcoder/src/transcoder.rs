use crate::error::TranscoderError;
use crate::hls::{Hls, HlsLayout, LatencyLevel};
use crate::process::{Input, StartRequest};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
pub struct TranscoderSettings {
    /// Path of the ffmpeg binary.
    #[serde(default = "TranscoderSettings::default_ffmpeg")]
    pub ffmpeg: PathBuf,
    /// How long a stopping encoder may take to flush before it is killed.
    #[serde(
        default = "TranscoderSettings::default_grace_period",
        with = "humantime_serde"
    )]
    pub grace_period: Duration,
    /// Media chunks buffered between the ingest boundary and the encoder's stdin.
    #[serde(default = "TranscoderSettings::default_input_buffer")]
    pub input_buffer: usize,
    /// General encoding settings that apply to all renditions.
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default)]
    pub hls: Hls,
}

impl Default for TranscoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg: Self::default_ffmpeg(),
            grace_period: Self::default_grace_period(),
            input_buffer: Self::default_input_buffer(),
            encoding: Encoding::default(),
            hls: Hls::default(),
        }
    }
}

impl TranscoderSettings {
    fn default_ffmpeg() -> PathBuf {
        PathBuf::from("ffmpeg")
    }

    fn default_grace_period() -> Duration {
        Duration::from_secs(5)
    }

    fn default_input_buffer() -> usize {
        64
    }

    /// Builds the ffmpeg command for one session. The input is decoded once and
    /// fanned out to every rendition inside the filter graph.
    pub fn build_ffmpeg_command(
        &self,
        layout: &HlsLayout,
        request: &StartRequest,
    ) -> Result<Command, TranscoderError> {
        if request.profiles.is_empty() {
            return Err(TranscoderError::ConfigError(
                "at least one rendition profile is required".to_string(),
            ));
        }

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-hide_banner").arg("-loglevel").arg("warning");

        if request.is_event_stream {
            // Read the clip at its native rate, forever.
            cmd.arg("-re").arg("-stream_loop").arg("-1");
        } else {
            cmd.arg("-fflags").arg("+genpts");
        }

        match &request.input {
            Input::Pipe => cmd.arg("-i").arg("pipe:0"),
            Input::File(path) => cmd.arg("-i").arg(path),
        };

        let filter_complex = build_filter_complex(&request.profiles);
        cmd.arg("-filter_complex").arg(&filter_complex);

        let segment_seconds = request
            .profiles
            .iter()
            .map(|profile| profile.latency_level.segment_seconds())
            .min()
            .unwrap_or_else(|| LatencyLevel::default().segment_seconds());
        let window_size = request
            .profiles
            .iter()
            .map(RenditionProfile::window_size)
            .max()
            .unwrap_or_else(|| LatencyLevel::default().window_size());

        self.add_profiles_encoding(&mut cmd, &request.profiles, segment_seconds);
        cmd.arg("-var_stream_map")
            .arg(build_var_stream_map(&request.profiles));
        self.hls.add_args(
            &mut cmd,
            layout,
            &request.identifier,
            segment_seconds,
            window_size,
        );

        Ok(cmd)
    }

    fn add_profiles_encoding(
        &self,
        cmd: &mut Command,
        profiles: &[RenditionProfile],
        segment_seconds: u32,
    ) {
        for profile in profiles.iter() {
            cmd.arg("-map").arg(format!("[{}_out]", profile.name));
            cmd.arg("-map").arg("0:a:0?");
        }

        for (i, profile) in profiles.iter().enumerate() {
            self.encoding.add_args(cmd, i);
            profile.add_args(cmd, i, segment_seconds);
        }

        cmd.arg("-sc_threshold")
            .arg(self.encoding.sc_threshold.to_string());
    }
}

/// Splits the first video stream once per rendition and scales each branch.
fn build_filter_complex(profiles: &[RenditionProfile]) -> String {
    let mut filters = Vec::new();

    let split = format!(
        "[0:v:0]split={}{}",
        profiles.len(),
        profiles
            .iter()
            .enumerate()
            .map(|(i, _)| format!("[v{}]", i))
            .collect::<Vec<_>>()
            .join("")
    );
    filters.push(split);

    for (i, profile) in profiles.iter().enumerate() {
        match profile.scale_filter() {
            Some(scale) => filters.push(format!("[v{}]{}[{}_out]", i, scale, profile.name)),
            None => filters.push(format!("[v{}]copy[{}_out]", i, profile.name)),
        }
    }

    filters.join(";")
}

/// Groups each rendition's video and audio output and names the group, so
/// `%v` in the output templates expands to the rendition name.
fn build_var_stream_map(profiles: &[RenditionProfile]) -> String {
    profiles
        .iter()
        .enumerate()
        .map(|(i, profile)| format!("v:{i},a:{i},name:{}", profile.name))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Encoding defines the parameters applied to every video output.
#[derive(Deserialize, Debug, Clone)]
pub struct Encoding {
    /// Speed/compression trade-off of the encoder.
    #[serde(default)]
    pub preset: Preset,
    #[serde(default)]
    pub tune: Tune,
    #[serde(default)]
    pub profile: VideoProfileLevel,
    /// Scene cut threshold. Zero keeps keyframes on the segment grid.
    #[serde(default)]
    pub sc_threshold: u32,
    #[serde(default = "Encoding::default_video_codec")]
    pub video_codec: String,
    #[serde(default = "Encoding::default_audio_codec")]
    pub audio_codec: String,
}

impl Default for Encoding {
    fn default() -> Self {
        Self {
            preset: Preset::VeryFast,
            tune: Tune::ZeroLatency,
            profile: VideoProfileLevel::default(),
            sc_threshold: 0,
            video_codec: Self::default_video_codec(),
            audio_codec: Self::default_audio_codec(),
        }
    }
}

impl Encoding {
    fn default_video_codec() -> String {
        "libx264".to_string()
    }

    fn default_audio_codec() -> String {
        "aac".to_string()
    }

    fn add_args(&self, cmd: &mut Command, idx: usize) {
        cmd.arg(format!("-c:v:{}", idx))
            .arg(&self.video_codec)
            .arg(format!("-c:a:{}", idx))
            .arg(&self.audio_codec);

        if self.preset != Preset::None {
            cmd.arg(format!("-preset:v:{}", idx))
                .arg(self.preset.to_string());
        }
        if self.tune != Tune::None {
            cmd.arg(format!("-tune:v:{}", idx)).arg(self.tune.to_string());
        }
        if self.profile != VideoProfileLevel::None {
            cmd.arg(format!("-profile:v:{}", idx))
                .arg(self.profile.to_string());
        }
    }
}

/// One encoded variant of the stream.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RenditionProfile {
    /// Identifier of the rendition, used as its directory name and in URLs.
    pub name: String,
    /// Output width; `None` keeps the aspect ratio of `height`, or the source size.
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default = "RenditionProfile::default_framerate")]
    pub framerate: u32,
    /// Target video bitrate in kbit/s.
    pub video_bitrate: u32,
    /// Peak video bitrate in kbit/s, defaults to 107% of the target.
    #[serde(default)]
    pub max_rate: Option<u32>,
    /// Rate control buffer in kbit, defaults to twice the peak rate.
    #[serde(default)]
    pub buffer_size: Option<u32>,
    /// Audio bitrate in kbit/s.
    #[serde(default = "RenditionProfile::default_audio_bitrate")]
    pub audio_bitrate: u32,
    #[serde(default)]
    pub latency_level: LatencyLevel,
    /// Overrides the playlist window derived from the latency level.
    #[serde(default)]
    pub window_size: Option<usize>,
}

impl RenditionProfile {
    fn default_framerate() -> u32 {
        24
    }

    fn default_audio_bitrate() -> u32 {
        128
    }

    pub fn window_size(&self) -> usize {
        self.window_size
            .unwrap_or_else(|| self.latency_level.window_size())
            .max(1)
    }

    /// Peak bandwidth in bit/s as advertised in the master playlist.
    pub fn bandwidth(&self) -> u64 {
        (self.max_rate() as u64 + self.audio_bitrate as u64) * 1000
    }

    pub fn resolution(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(width), Some(height)) => Some((width, height)),
            _ => None,
        }
    }

    fn max_rate(&self) -> u32 {
        self.max_rate
            .unwrap_or_else(|| self.video_bitrate + self.video_bitrate * 7 / 100)
    }

    fn scale_filter(&self) -> Option<String> {
        match (self.width, self.height) {
            (Some(width), Some(height)) => Some(format!("scale={}:{}", width, height)),
            (Some(width), None) => Some(format!("scale={}:-2", width)),
            (None, Some(height)) => Some(format!("scale=-2:{}", height)),
            (None, None) => None,
        }
    }

    fn add_args(&self, cmd: &mut Command, idx: usize, segment_seconds: u32) {
        let keyframe_interval = self.framerate * segment_seconds;
        let max_rate = self.max_rate();
        let buffer_size = self.buffer_size.unwrap_or(max_rate * 2);

        cmd.arg(format!("-r:v:{}", idx))
            .arg(self.framerate.to_string())
            .arg(format!("-g:v:{}", idx))
            .arg(keyframe_interval.to_string())
            .arg(format!("-keyint_min:v:{}", idx))
            .arg(keyframe_interval.to_string())
            .arg(format!("-b:v:{}", idx))
            .arg(format!("{}k", self.video_bitrate))
            .arg(format!("-maxrate:v:{}", idx))
            .arg(format!("{}k", max_rate))
            .arg(format!("-bufsize:v:{}", idx))
            .arg(format!("{}k", buffer_size))
            .arg(format!("-b:a:{}", idx))
            .arg(format!("{}k", self.audio_bitrate));
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
/// H.264 profile of the video outputs.
pub enum VideoProfileLevel {
    #[default]
    None,
    Baseline,
    Main,
    High,
}

impl fmt::Display for VideoProfileLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            VideoProfileLevel::None => "none",
            VideoProfileLevel::Baseline => "baseline",
            VideoProfileLevel::Main => "main",
            VideoProfileLevel::High => "high",
        };
        f.write_str(value)
    }
}

/// Encoder presets control the encoding speed and compression efficiency trade-off.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    None,
    UltraFast,
    SuperFast,
    #[default]
    VeryFast,
    Faster,
    Fast,
    Medium,
    Slow,
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Preset::None => "none",
            Preset::UltraFast => "ultrafast",
            Preset::SuperFast => "superfast",
            Preset::VeryFast => "veryfast",
            Preset::Faster => "faster",
            Preset::Fast => "fast",
            Preset::Medium => "medium",
            Preset::Slow => "slow",
        };
        f.write_str(value)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tune {
    /// Fast encoding and low latency streaming
    #[default]
    ZeroLatency,
    Film,
    Animation,
    /// Screen recordings and still images
    StillImage,
    None,
}

impl fmt::Display for Tune {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Tune::ZeroLatency => "zerolatency",
            Tune::Film => "film",
            Tune::Animation => "animation",
            Tune::StillImage => "stillimage",
            Tune::None => "none",
        };
        f.write_str(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, height: Option<u32>, level: u8) -> RenditionProfile {
        RenditionProfile {
            name: name.to_string(),
            width: None,
            height,
            framerate: 30,
            video_bitrate: 2000,
            max_rate: None,
            buffer_size: None,
            audio_bitrate: 128,
            latency_level: LatencyLevel::get(level).unwrap(),
            window_size: None,
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> &'a str {
        let pos = args.iter().position(|a| a == flag).unwrap();
        &args[pos + 1]
    }

    #[test]
    fn live_command_reads_stdin_once_and_fans_out() {
        let settings = TranscoderSettings::default();
        let layout = HlsLayout::new("/tmp/hls");
        let request = StartRequest::live(
            vec![profile("high", Some(720), 2), profile("low", Some(360), 2)],
            "s1",
        );

        let cmd = settings.build_ffmpeg_command(&layout, &request).unwrap();
        let args = args(&cmd);

        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 1);
        assert_eq!(value_after(&args, "-i"), "pipe:0");
        assert_eq!(
            value_after(&args, "-filter_complex"),
            "[0:v:0]split=2[v0][v1];[v0]scale=-2:720[high_out];[v1]scale=-2:360[low_out]"
        );
        assert_eq!(
            value_after(&args, "-var_stream_map"),
            "v:0,a:0,name:high v:1,a:1,name:low"
        );
        assert!(!args.contains(&"-stream_loop".to_string()));
        assert_eq!(value_after(&args, "-g:v:1"), "90");
    }

    #[test]
    fn event_stream_loops_file_input_at_native_rate() {
        let settings = TranscoderSettings::default();
        let layout = HlsLayout::new("/tmp/hls");
        let request = StartRequest::event(
            vec![profile("only", None, 4)],
            "offline-1",
            PathBuf::from("/tmp/offline.ts"),
        );

        let cmd = settings.build_ffmpeg_command(&layout, &request).unwrap();
        let args = args(&cmd);

        assert!(args.contains(&"-re".to_string()));
        assert_eq!(value_after(&args, "-stream_loop"), "-1");
        assert_eq!(value_after(&args, "-i"), "/tmp/offline.ts");
        assert_eq!(value_after(&args, "-hls_time"), "5");
        assert!(value_after(&args, "-filter_complex").ends_with("[v0]copy[only_out]"));
    }

    #[test]
    fn segment_length_follows_the_lowest_latency_profile() {
        let settings = TranscoderSettings::default();
        let layout = HlsLayout::new("/tmp/hls");
        let request = StartRequest::live(vec![profile("a", None, 4), profile("b", None, 1)], "s");

        let cmd = settings.build_ffmpeg_command(&layout, &request).unwrap();
        assert_eq!(value_after(&args(&cmd), "-hls_time"), "2");
    }

    #[test]
    fn empty_profile_list_is_rejected() {
        let settings = TranscoderSettings::default();
        let layout = HlsLayout::new("/tmp/hls");
        let request = StartRequest::live(Vec::new(), "s");

        let result = settings.build_ffmpeg_command(&layout, &request);
        assert!(matches!(result, Err(TranscoderError::ConfigError(_))));
    }

    #[test]
    fn bandwidth_uses_peak_rate_plus_audio() {
        let mut p = profile("p", Some(720), 2);
        p.width = Some(1280);
        assert_eq!(p.bandwidth(), (2140 + 128) * 1000);
        assert_eq!(p.resolution(), Some((1280, 720)));
        assert_eq!(p.window_size(), 10);

        p.window_size = Some(0);
        assert_eq!(p.window_size(), 1);
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: TranscoderSettings = toml::from_str(
            r#"
            grace_period = "2s"

            [encoding]
            preset = "fast"
            "#,
        )
        .unwrap();

        assert_eq!(settings.grace_period, Duration::from_secs(2));
        assert_eq!(settings.encoding.preset, Preset::Fast);
        assert_eq!(settings.encoding.tune, Tune::ZeroLatency);
        assert_eq!(settings.ffmpeg, PathBuf::from("ffmpeg"));
    }
}
