use rollcall_core::{MatchPolicy, DEFAULT_MATCH_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Runtime configuration.
///
/// Resolved as defaults, then an optional TOML file (`ROLLCALL_CONFIG`, or
/// `$XDG_CONFIG_HOME/rollcall/config.toml` when it exists), then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture size; the driver may adjust it.
    pub capture_width: u32,
    pub capture_height: u32,
    /// Number of frames to discard when the loop starts (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Skip frames that are almost entirely black.
    pub skip_dark_frames: bool,
    /// Path to the SQLite ledger.
    pub db_path: PathBuf,
    /// Directory holding stored reference images.
    pub image_dir: PathBuf,
    /// Maximum Euclidean distance for a match.
    pub match_threshold: f32,
    pub match_policy: MatchPolicy,
    /// Command line of the external locator/embedding helper.
    pub extractor_command: Option<String>,
    /// Metadata keys every enrollment must supply.
    pub required_metadata: Vec<String>,
    /// Recompute every gallery embedding from its reference image at startup.
    pub recompute_on_load: bool,
}

/// On-disk shape of the config file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    capture_width: Option<u32>,
    capture_height: Option<u32>,
    warmup_frames: Option<usize>,
    skip_dark_frames: Option<bool>,
    db_path: Option<PathBuf>,
    image_dir: Option<PathBuf>,
    match_threshold: Option<f32>,
    match_policy: Option<MatchPolicy>,
    extractor_command: Option<String>,
    required_metadata: Option<Vec<String>>,
    recompute_on_load: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

impl Config {
    /// Built-in defaults rooted at `data_dir`.
    pub fn defaults(data_dir: &Path) -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            warmup_frames: 4,
            skip_dark_frames: true,
            db_path: data_dir.join("attendance.db"),
            image_dir: data_dir.join("reference"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            match_policy: MatchPolicy::Closest,
            extractor_command: None,
            required_metadata: Vec::new(),
            recompute_on_load: false,
        }
    }

    /// Load configuration from the config file and `ROLLCALL_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::defaults(&default_data_dir());

        let explicit = std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(default_config_path);
        if explicit.is_some() || path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            config.apply_toml(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
            tracing::debug!(path = %path.display(), "loaded config file");
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_toml(&mut self, text: &str) -> Result<(), toml::de::Error> {
        let file: FileConfig = toml::from_str(text)?;

        if let Some(v) = file.camera_device {
            self.camera_device = v;
        }
        if let Some(v) = file.capture_width {
            self.capture_width = v;
        }
        if let Some(v) = file.capture_height {
            self.capture_height = v;
        }
        if let Some(v) = file.warmup_frames {
            self.warmup_frames = v;
        }
        if let Some(v) = file.skip_dark_frames {
            self.skip_dark_frames = v;
        }
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.image_dir {
            self.image_dir = v;
        }
        if let Some(v) = file.match_threshold {
            self.match_threshold = v;
        }
        if let Some(v) = file.match_policy {
            self.match_policy = v;
        }
        if file.extractor_command.is_some() {
            self.extractor_command = file.extractor_command;
        }
        if let Some(v) = file.required_metadata {
            self.required_metadata = v;
        }
        if let Some(v) = file.recompute_on_load {
            self.recompute_on_load = v;
        }
        Ok(())
    }

    fn apply_env<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = get("ROLLCALL_CAPTURE_WIDTH") {
            self.capture_width = parse_value("ROLLCALL_CAPTURE_WIDTH", v)?;
        }
        if let Some(v) = get("ROLLCALL_CAPTURE_HEIGHT") {
            self.capture_height = parse_value("ROLLCALL_CAPTURE_HEIGHT", v)?;
        }
        if let Some(v) = get("ROLLCALL_WARMUP_FRAMES") {
            self.warmup_frames = parse_value("ROLLCALL_WARMUP_FRAMES", v)?;
        }
        if let Some(v) = get("ROLLCALL_SKIP_DARK_FRAMES") {
            self.skip_dark_frames = parse_flag("ROLLCALL_SKIP_DARK_FRAMES", v)?;
        }
        if let Some(v) = get("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("ROLLCALL_IMAGE_DIR") {
            self.image_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ROLLCALL_MATCH_THRESHOLD") {
            self.match_threshold = parse_value("ROLLCALL_MATCH_THRESHOLD", v)?;
        }
        if let Some(v) = get("ROLLCALL_MATCH_POLICY") {
            self.match_policy = parse_value("ROLLCALL_MATCH_POLICY", v)?;
        }
        if let Some(v) = get("ROLLCALL_EXTRACTOR_COMMAND") {
            self.extractor_command = Some(v);
        }
        if let Some(v) = get("ROLLCALL_REQUIRED_METADATA") {
            self.required_metadata = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = get("ROLLCALL_RECOMPUTE_ON_LOAD") {
            self.recompute_on_load = parse_flag("ROLLCALL_RECOMPUTE_ON_LOAD", v)?;
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

fn parse_flag(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue { key, value }),
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("rollcall")
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("rollcall/config.toml")
}
