use crate::backoff::BackoffSettings;
use crate::errors::ServerError;
use common::defaults::Bool;
use hyper::Uri;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use transcoder::{PlaceholderClip, RenditionProfile, TranscoderSettings};

#[derive(Debug, Deserialize)]
pub struct Setting {
    #[serde(default)]
    pub runtime: Runtime,
    pub ingest: Ingest,
    pub http: Http,
    #[serde(default)]
    pub hls: Hls,
    #[serde(default)]
    pub transcoder: TranscoderSettings,
    pub renditions: Vec<RenditionProfile>,
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub offline: Offline,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub retention: Retention,
    #[serde(default)]
    pub notifications: Notifications,
}

impl Setting {
    pub fn from_file(path: &str) -> Result<Setting, ServerError> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ServerError::ConfigError(format!("read config file '{}': {}", path, e))
        })?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Setting, ServerError> {
        let setting: Setting =
            toml::from_str(data).map_err(|e| ServerError::ConfigError(e.to_string()))?;
        setting.validate().map_err(ServerError::ConfigError)?;
        Ok(setting)
    }

    fn validate(&self) -> Result<(), String> {
        if self.ingest.stream_key.is_empty() {
            return Err("ingest.stream_key must not be empty".to_string());
        }
        if self.renditions.is_empty() {
            return Err("at least one rendition is required".to_string());
        }

        let mut names = HashSet::new();
        for rendition in self.renditions.iter() {
            if !is_path_safe(&rendition.name) {
                return Err(format!(
                    "rendition name '{}' may only contain letters, digits, '-' and '_'",
                    rendition.name
                ));
            }
            if !names.insert(rendition.name.as_str()) {
                return Err(format!("duplicate rendition '{}'", rendition.name));
            }
            if rendition.video_bitrate == 0 {
                return Err(format!("rendition '{}': video_bitrate is zero", rendition.name));
            }
        }

        if self.hls.poll_interval.is_zero() {
            return Err("hls.poll_interval must be positive".to_string());
        }
        if self.session.liveness_timeout.is_zero() {
            return Err("session.liveness_timeout must be positive".to_string());
        }

        self.offline.restart.validate("offline.restart")?;
        self.notifications.backoff.validate("notifications.backoff")?;

        if self.storage.workers == 0 || self.storage.queue == 0 {
            return Err("storage.workers and storage.queue must be positive".to_string());
        }
        if self.storage.backend == Backend::Remote {
            let remote = self
                .storage
                .remote
                .as_ref()
                .ok_or_else(|| "storage.remote is required for the remote backend".to_string())?;
            check_url("storage.remote.endpoint", &remote.endpoint)?;
            if remote.bucket.is_empty() {
                return Err("storage.remote.bucket must not be empty".to_string());
            }
            if let Some(public_url) = &remote.public_url {
                check_url("storage.remote.public_url", public_url)?;
            }
            if !self.storage.offload {
                return Err("the remote backend requires storage.offload".to_string());
            }
        }

        if self.notifications.workers == 0 || self.notifications.queue == 0 {
            return Err("notifications.workers and notifications.queue must be positive".to_string());
        }
        if self.retention.archive_entries == 0 {
            return Err("retention.archive_entries must be positive".to_string());
        }
        if self.notifications.max_attempts == 0 {
            return Err("notifications.max_attempts must be at least 1".to_string());
        }
        for webhook in self.notifications.webhooks.iter() {
            check_url("notifications.webhooks", webhook)?;
        }

        Ok(())
    }
}

fn is_path_safe(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn check_url(field: &str, value: &str) -> Result<(), String> {
    let uri: Uri = value
        .parse()
        .map_err(|e| format!("{}: invalid url '{}': {}", field, value, e))?;
    if !matches!(uri.scheme_str(), Some("http") | Some("https")) || uri.host().is_none() {
        return Err(format!("{}: expected an http(s) url, got '{}'", field, value));
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct Runtime {
    pub threads: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct Ingest {
    pub addr: String,
    pub stream_key: String,
    pub max_buffer_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct Http {
    pub addr: String,
    /// Directory holding `thumbnail.jpg` and `preview.gif`.
    #[serde(default = "Http::default_webroot")]
    pub webroot: PathBuf,
    pub max_buffer_size: Option<usize>,
    /// How long open connections may take to finish on shutdown.
    #[serde(default = "Http::default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Http {
    fn default_webroot() -> PathBuf {
        PathBuf::from("webroot")
    }

    fn default_shutdown_timeout() -> Duration {
        Duration::from_secs(30)
    }
}

#[derive(Debug, Deserialize)]
pub struct Hls {
    #[serde(default = "Hls::default_root")]
    pub root: PathBuf,
    /// Cycle of the output watcher.
    #[serde(default = "Hls::default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Also write each rendition's `stream.m3u8` to disk.
    #[serde(default = "Bool::r#true")]
    pub persist_manifests: bool,
}

impl Default for Hls {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            poll_interval: Self::default_poll_interval(),
            persist_manifests: true,
        }
    }
}

impl Hls {
    fn default_root() -> PathBuf {
        PathBuf::from("data/hls")
    }

    fn default_poll_interval() -> Duration {
        Duration::from_millis(250)
    }
}

#[derive(Debug, Deserialize)]
pub struct Session {
    /// A broadcaster that sent nothing for this long loses the slot.
    #[serde(default = "Session::default_liveness_timeout", with = "humantime_serde")]
    pub liveness_timeout: Duration,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            liveness_timeout: Self::default_liveness_timeout(),
        }
    }
}

impl Session {
    fn default_liveness_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

#[derive(Debug, Deserialize)]
pub struct Offline {
    /// Image shown while nobody is live.
    pub logo: Option<PathBuf>,
    /// Ready made clip to loop. Rendered from the logo when absent.
    pub clip: Option<PathBuf>,
    /// Where the rendered clip is kept.
    #[serde(default = "Offline::default_rendered_clip")]
    pub rendered_clip: PathBuf,
    #[serde(default)]
    pub placeholder: PlaceholderClip,
    #[serde(default = "Offline::default_restart")]
    pub restart: BackoffSettings,
    /// A run lasting this long resets the restart backoff.
    #[serde(default = "Offline::default_stable_after", with = "humantime_serde")]
    pub stable_after: Duration,
}

impl Default for Offline {
    fn default() -> Self {
        Self {
            logo: None,
            clip: None,
            rendered_clip: Self::default_rendered_clip(),
            placeholder: PlaceholderClip::default(),
            restart: Self::default_restart(),
            stable_after: Self::default_stable_after(),
        }
    }
}

impl Offline {
    fn default_rendered_clip() -> PathBuf {
        PathBuf::from("data/offline.ts")
    }

    fn default_restart() -> BackoffSettings {
        BackoffSettings::new(Duration::from_millis(500), Duration::from_secs(60))
    }

    fn default_stable_after() -> Duration {
        Duration::from_secs(30)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Deserialize)]
pub struct Storage {
    #[serde(default)]
    pub backend: Backend,
    /// Hand evicted segments to the backend instead of deleting them.
    #[serde(default = "Bool::r#false")]
    pub offload: bool,
    #[serde(default = "Storage::default_workers")]
    pub workers: usize,
    #[serde(default = "Storage::default_queue")]
    pub queue: usize,
    /// Keep the local file after a successful remote offload.
    #[serde(default = "Bool::r#false")]
    pub retain_local: bool,
    pub remote: Option<Remote>,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            offload: false,
            workers: Self::default_workers(),
            queue: Self::default_queue(),
            retain_local: false,
            remote: None,
        }
    }
}

impl Storage {
    fn default_workers() -> usize {
        2
    }

    fn default_queue() -> usize {
        128
    }
}

/// An S3 compatible bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct Remote {
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "Remote::default_region")]
    pub region: String,
    /// Read from the environment when absent.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Prefix of every object key inside the bucket.
    #[serde(default = "Remote::default_root")]
    pub root: String,
    /// Base url viewers fetch offloaded objects from, mapping to `root`.
    /// Defaults to the path style url of the bucket.
    pub public_url: Option<String>,
    #[serde(default = "Remote::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Remote {
    fn default_region() -> String {
        "us-east-1".to_string()
    }

    fn default_root() -> String {
        "/".to_string()
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn serving_base(&self) -> String {
        match &self.public_url {
            Some(url) => url.clone(),
            None => {
                let mut base = format!("{}/{}", self.endpoint.trim_end_matches('/'), self.bucket);
                let root = self.root.trim_matches('/');
                if !root.is_empty() {
                    base.push('/');
                    base.push_str(root);
                }
                base
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Retention {
    /// How long segments of an ended session stay around.
    #[serde(default = "Retention::default_session_grace", with = "humantime_serde")]
    pub session_grace: Duration,
    /// Also purge the offloaded copies of an ended session.
    #[serde(default = "Bool::r#false")]
    pub purge_archive: bool,
    /// Evicted segments remembered for redirects. The oldest are forgotten first.
    #[serde(default = "Retention::default_archive_entries")]
    pub archive_entries: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            session_grace: Self::default_session_grace(),
            purge_archive: false,
            archive_entries: Self::default_archive_entries(),
        }
    }
}

impl Retention {
    fn default_session_grace() -> Duration {
        Duration::from_secs(60)
    }

    fn default_archive_entries() -> usize {
        4096
    }
}

#[derive(Debug, Deserialize)]
pub struct Notifications {
    #[serde(default = "Notifications::default_workers")]
    pub workers: usize,
    #[serde(default = "Notifications::default_queue")]
    pub queue: usize,
    #[serde(default = "Notifications::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "Notifications::default_backoff")]
    pub backoff: BackoffSettings,
    #[serde(default = "Notifications::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub webhooks: Vec<String>,
}

impl Default for Notifications {
    fn default() -> Self {
        Self {
            workers: Self::default_workers(),
            queue: Self::default_queue(),
            max_attempts: Self::default_max_attempts(),
            backoff: Self::default_backoff(),
            timeout: Self::default_timeout(),
            webhooks: Vec::new(),
        }
    }
}

impl Notifications {
    fn default_workers() -> usize {
        2
    }

    fn default_queue() -> usize {
        256
    }

    fn default_max_attempts() -> u32 {
        3
    }

    fn default_backoff() -> BackoffSettings {
        BackoffSettings::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

/// Rejects relative components so request paths cannot leave a served directory.
pub fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, std::path::Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = include_str!("../livecast.toml");

    const MINIMAL: &str = r#"
        [ingest]
        addr = "127.0.0.1:8935"
        stream_key = "secret"

        [http]
        addr = "127.0.0.1:8080"

        [[renditions]]
        name = "720p"
        video_bitrate = 2500
    "#;

    #[test]
    fn sample_config_is_valid() {
        let setting = Setting::parse(SAMPLE).unwrap();
        assert!(setting.renditions.len() >= 2);
        assert!(setting.notifications.webhooks.len() >= 1);
    }

    #[test]
    fn defaults_fill_every_optional_section() {
        let setting = Setting::parse(MINIMAL).unwrap();
        assert_eq!(setting.hls.root, PathBuf::from("data/hls"));
        assert_eq!(setting.transcoder.grace_period, Duration::from_secs(5));
        assert_eq!(setting.notifications.max_attempts, 3);
        assert_eq!(setting.notifications.backoff.initial, Duration::from_secs(1));
        assert_eq!(setting.notifications.backoff.max, Duration::from_secs(30));
        assert_eq!(setting.storage.backend, Backend::Local);
        assert!(!setting.storage.offload);
        assert_eq!(setting.renditions[0].window_size(), 10);
    }

    #[test]
    fn rejects_remote_backend_without_endpoint() {
        let data = format!("{}\n[storage]\nbackend = \"remote\"\noffload = true\n", MINIMAL);
        let err = Setting::parse(&data).unwrap_err();
        assert!(matches!(err, ServerError::ConfigError(msg) if msg.contains("storage.remote")));
    }

    #[test]
    fn rejects_unsafe_or_duplicate_rendition_names() {
        let data = MINIMAL.replace("\"720p\"", "\"../720p\"");
        assert!(Setting::parse(&data).is_err());

        let data = format!("{}\n[[renditions]]\nname = \"720p\"\nvideo_bitrate = 800\n", MINIMAL);
        assert!(Setting::parse(&data).is_err());
    }

    #[test]
    fn accepts_https_endpoints_and_webhooks() {
        let data = format!(
            "{}\n[storage]\nbackend = \"remote\"\noffload = true\n\n[storage.remote]\nendpoint = \"https://s3.us-east-1.amazonaws.com\"\nbucket = \"live\"\nroot = \"/hls\"\n\n[notifications]\nwebhooks = [\"https://example.com/hook\"]\n",
            MINIMAL
        );
        let setting = Setting::parse(&data).unwrap();
        let remote = setting.storage.remote.unwrap();
        assert_eq!(remote.region, "us-east-1");
        assert_eq!(remote.serving_base(), "https://s3.us-east-1.amazonaws.com/live/hls");
        assert_eq!(setting.retention.archive_entries, 4096);
    }

    #[test]
    fn rejects_non_http_urls() {
        let data = format!(
            "{}\n[notifications]\nwebhooks = [\"ftp://example.com/hook\"]\n",
            MINIMAL
        );
        assert!(Setting::parse(&data).is_err());
    }

    #[test]
    fn contained_paths_have_only_normal_components() {
        assert!(is_contained(Path::new("720p/s1-3.ts")));
        assert!(!is_contained(Path::new("../secret")));
        assert!(!is_contained(Path::new("/etc/passwd")));
    }
}
