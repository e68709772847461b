use crate::error::TranscoderError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::info;

/// Renders the short MPEG-TS clip that the offline loop plays on repeat,
/// either from a still image or from a plain color card.
#[derive(Deserialize, Debug, Clone)]
pub struct PlaceholderClip {
    #[serde(skip)]
    pub ffmpeg: PathBuf,
    #[serde(default = "PlaceholderClip::default_duration", with = "humantime_serde")]
    pub duration: Duration,
    #[serde(default = "PlaceholderClip::default_width")]
    pub width: u32,
    #[serde(default = "PlaceholderClip::default_height")]
    pub height: u32,
    #[serde(default = "PlaceholderClip::default_framerate")]
    pub framerate: u32,
    /// Used when there is no image to loop.
    #[serde(default = "PlaceholderClip::default_color")]
    pub color: String,
}

impl Default for PlaceholderClip {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            duration: Self::default_duration(),
            width: Self::default_width(),
            height: Self::default_height(),
            framerate: Self::default_framerate(),
            color: Self::default_color(),
        }
    }
}

impl PlaceholderClip {
    fn default_duration() -> Duration {
        Duration::from_secs(10)
    }

    fn default_width() -> u32 {
        1280
    }

    fn default_height() -> u32 {
        720
    }

    fn default_framerate() -> u32 {
        30
    }

    fn default_color() -> String {
        "black".to_string()
    }

    pub fn with_ffmpeg(mut self, ffmpeg: impl Into<PathBuf>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self
    }

    pub fn build_command(&self, image: Option<&Path>, output: &Path) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y");

        match image {
            Some(image) => {
                cmd.arg("-loop")
                    .arg("1")
                    .arg("-framerate")
                    .arg(self.framerate.to_string())
                    .arg("-i")
                    .arg(image);
            }
            None => {
                cmd.arg("-f").arg("lavfi").arg("-i").arg(format!(
                    "color=c={}:s={}x{}:r={}",
                    self.color, self.width, self.height, self.framerate
                ));
            }
        }

        cmd.arg("-f")
            .arg("lavfi")
            .arg("-i")
            .arg("anullsrc=channel_layout=stereo:sample_rate=44100")
            .arg("-t")
            .arg(format!("{:.3}", self.duration.as_secs_f64()))
            .arg("-vf")
            .arg(format!(
                "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,format=yuv420p",
                w = self.width,
                h = self.height
            ))
            .arg("-c:v")
            .arg("libx264")
            .arg("-tune")
            .arg("stillimage")
            .arg("-c:a")
            .arg("aac")
            .arg("-shortest")
            .arg("-f")
            .arg("mpegts")
            .arg(output);

        cmd
    }

    /// Renders into a sibling temporary file and renames it over `output`, so a
    /// running loop never reads a half written clip.
    pub async fn render(&self, image: Option<&Path>, output: &Path) -> Result<(), TranscoderError> {
        let tmp = output.with_extension("ts.tmp");
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TranscoderError::StartFailure(format!("create {}: {}", parent.display(), e)))?;
        }

        let mut cmd = tokio::process::Command::from(self.build_command(image, &tmp));
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).kill_on_drop(true);

        let output_status = cmd.output().await.map_err(|e| {
            TranscoderError::StartFailure(format!("spawn {}: {}", self.ffmpeg.display(), e))
        })?;

        if !output_status.status.success() {
            let _ = tokio::fs::remove_file(&tmp).await;
            let stderr = String::from_utf8_lossy(&output_status.stderr);
            return Err(TranscoderError::Crash(format!(
                "render placeholder clip: {} {}",
                output_status.status,
                stderr.trim()
            )));
        }

        tokio::fs::rename(&tmp, output)
            .await
            .map_err(|e| TranscoderError::StartFailure(format!("publish {}: {}", output.display(), e)))?;

        info!(output = %output.display(), "placeholder clip rendered");
        Ok(())
    }
}
