//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// TOML serialization error
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

/// Connection settings for the remote Node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Base URL of the Node HTTP API
    #[serde(default = "default_node_base_url")]
    pub base_url: String,
    /// Bearer token sent with every request
    #[serde(default)]
    pub token: String,
    /// Path of the realtime WebSocket endpoint, relative to `base_url`
    #[serde(default = "default_realtime_path")]
    pub realtime_path: String,
    /// Timeout in seconds for JSON requests, body included
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Timeout in seconds for establishing a connection
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Timeout in seconds for one file upload, body included
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
}

fn default_node_base_url() -> String {
    "http://127.0.0.1:8181".to_string()
}

fn default_realtime_path() -> String {
    "/ws".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_upload_timeout_secs() -> u64 {
    3600
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            base_url: default_node_base_url(),
            token: String::new(),
            realtime_path: default_realtime_path(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            upload_timeout_secs: default_upload_timeout_secs(),
        }
    }
}

/// Local storage and tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Root directory holding one working directory per video
    #[serde(default = "default_videos_root")]
    pub videos_root: PathBuf,
    /// Processing-agent settings file
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,
    /// Encoder binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Probe binary used to measure source durations
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
}

fn default_videos_root() -> PathBuf {
    PathBuf::from("./videos")
}

fn default_settings_path() -> PathBuf {
    PathBuf::from("./settings.toml")
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            videos_root: default_videos_root(),
            settings_path: default_settings_path(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

/// Publish queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishConfig {
    /// Maximum number of jobs encoding at once
    #[serde(default = "default_concurrency_cap")]
    pub concurrency_cap: u32,
    /// Dispatcher tick period in milliseconds
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    /// How long finished tracker entries are kept before eviction
    #[serde(default = "default_tracker_retention_secs")]
    pub tracker_retention_secs: u64,
}

fn default_concurrency_cap() -> u32 {
    5
}

fn default_dispatch_interval_ms() -> u64 {
    3000
}

fn default_tracker_retention_secs() -> u64 {
    600
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: default_concurrency_cap(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            tracker_retention_secs: default_tracker_retention_secs(),
        }
    }
}

/// Live streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveConfig {
    /// Poll loop period in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Number of segments kept on disk behind the Node's expected index
    #[serde(default = "default_segment_window")]
    pub segment_window: u64,
    /// Target duration of each live segment in seconds
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u32,
    /// Offset into a segment where stills are sampled
    #[serde(default = "default_still_offset_secs")]
    pub still_offset_secs: f64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_segment_window() -> u64 {
    20
}

fn default_segment_duration_secs() -> u32 {
    6
}

fn default_still_offset_secs() -> f64 {
    1.0
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            segment_window: default_segment_window(),
            segment_duration_secs: default_segment_duration_secs(),
            still_offset_secs: default_still_offset_secs(),
        }
    }
}

/// Import configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportConfig {
    /// Minimum spacing between two progress events in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_progress_interval_ms() -> u64 {
    100
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

/// Local HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "publish_agent=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - NODE_BASE_URL -> node.base_url
    /// - NODE_TOKEN -> node.token
    /// - VIDEOS_ROOT -> storage.videos_root
    /// - FFMPEG_PATH -> storage.ffmpeg_path
    /// - FFPROBE_PATH -> storage.ffprobe_path
    /// - PUBLISH_CONCURRENCY_CAP -> publish.concurrency_cap
    /// - LIVE_SEGMENT_WINDOW -> live.segment_window
    /// - SERVER_BIND -> server.bind
    /// - LOG_FILTER -> logging.filter
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("NODE_BASE_URL") {
            self.node.base_url = val;
        }

        if let Ok(val) = env::var("NODE_TOKEN") {
            self.node.token = val;
        }

        if let Ok(val) = env::var("VIDEOS_ROOT") {
            self.storage.videos_root = PathBuf::from(val);
        }

        if let Ok(val) = env::var("FFMPEG_PATH") {
            self.storage.ffmpeg_path = PathBuf::from(val);
        }

        if let Ok(val) = env::var("FFPROBE_PATH") {
            self.storage.ffprobe_path = PathBuf::from(val);
        }

        if let Ok(val) = env::var("PUBLISH_CONCURRENCY_CAP") {
            if let Ok(cap) = val.parse::<u32>() {
                self.publish.concurrency_cap = cap;
            }
        }

        if let Ok(val) = env::var("LIVE_SEGMENT_WINDOW") {
            if let Ok(window) = val.parse::<u64>() {
                self.live.segment_window = window;
            }
        }

        if let Ok(val) = env::var("SERVER_BIND") {
            self.server.bind = val;
        }

        if let Ok(val) = env::var("LOG_FILTER") {
            self.logging.filter = val;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Env var tests share process state
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        for key in [
            "NODE_BASE_URL",
            "NODE_TOKEN",
            "VIDEOS_ROOT",
            "FFMPEG_PATH",
            "FFPROBE_PATH",
            "PUBLISH_CONCURRENCY_CAP",
            "LIVE_SEGMENT_WINDOW",
            "SERVER_BIND",
            "LOG_FILTER",
        ] {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_numeric_sections(
            cap in 1u32..64,
            dispatch_ms in 1u64..60_000,
            window in 1u64..500,
            poll_ms in 1u64..10_000,
            progress_ms in 1u64..5_000,
        ) {
            let toml_str = format!(
                r#"
[publish]
concurrency_cap = {}
dispatch_interval_ms = {}

[live]
segment_window = {}
poll_interval_ms = {}

[import]
progress_interval_ms = {}
"#,
                cap, dispatch_ms, window, poll_ms, progress_ms
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.publish.concurrency_cap, cap);
            prop_assert_eq!(config.publish.dispatch_interval_ms, dispatch_ms);
            prop_assert_eq!(config.live.segment_window, window);
            prop_assert_eq!(config.live.poll_interval_ms, poll_ms);
            prop_assert_eq!(config.import.progress_interval_ms, progress_ms);
            // untouched sections keep their defaults
            prop_assert_eq!(config.node, NodeConfig::default());
        }

        #[test]
        fn prop_env_overrides_concurrency_cap(
            initial in 1u32..16,
            override_cap in 1u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[publish]\nconcurrency_cap = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("PUBLISH_CONCURRENCY_CAP", override_cap.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.publish.concurrency_cap, override_cap);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.node.base_url, "http://127.0.0.1:8181");
        assert_eq!(config.node.realtime_path, "/ws");
        assert_eq!(config.publish.concurrency_cap, 5);
        assert_eq!(config.publish.dispatch_interval_ms, 3000);
        assert_eq!(config.live.segment_window, 20);
        assert_eq!(config.live.poll_interval_ms, 1000);
        assert_eq!(config.import.progress_interval_ms, 100);
        assert_eq!(config.storage.ffmpeg_path, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn test_invalid_numeric_override_keeps_value() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("LIVE_SEGMENT_WINDOW", "not-a-number");
        env::set_var("NODE_TOKEN", "secret");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.live.segment_window, 20);
        assert_eq!(config.node.token, "secret");
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[storage]
videos_root = "/srv/videos"
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.storage.videos_root, PathBuf::from("/srv/videos"));
        assert_eq!(config.storage.ffprobe_path, PathBuf::from("ffprobe"));
        assert_eq!(config.publish, PublishConfig::default());
    }
}
