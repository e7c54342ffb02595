use crate::detector::LocatorParams;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Runtime configuration shared by the terminal shell and the daemon.
///
/// Resolution order: built-in defaults, then the TOML file, then `PRESENCE_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Directory containing `det_10g.onnx`.
    pub model_dir: PathBuf,
    /// One reference image per registered identity.
    pub gallery_dir: PathBuf,
    /// Attendance CSV.
    pub ledger_path: PathBuf,
    pub detector: LocatorParams,
    /// Deadline for terminal sessions in seconds; 0 means none.
    pub session_timeout_secs: u64,
    /// Deadline for sessions started over D-Bus in seconds; 0 means none.
    pub service_timeout_secs: u64,
    /// Frames discarded after opening the camera (AGC/AE settling).
    pub warmup_frames: usize,
    /// When set, the terminal shell writes each annotated frame here as PNG.
    pub preview_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: data_dir.join("models"),
            gallery_dir: data_dir.join("known_faces"),
            ledger_path: data_dir.join("attendance.csv"),
            detector: LocatorParams::default(),
            session_timeout_secs: 0,
            service_timeout_secs: 30,
            warmup_frames: 4,
            preview_path: None,
        }
    }
}

impl Config {
    /// Load from `PRESENCE_CONFIG` (must exist if set) or the default config
    /// path (optional), then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("PRESENCE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("PRESENCE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = std::env::var_os("PRESENCE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = std::env::var_os("PRESENCE_GALLERY_DIR") {
            self.gallery_dir = PathBuf::from(v);
        }
        if let Some(v) = std::env::var_os("PRESENCE_LEDGER_PATH") {
            self.ledger_path = PathBuf::from(v);
        }
        if let Some(v) = std::env::var_os("PRESENCE_PREVIEW_PATH") {
            self.preview_path = Some(PathBuf::from(v));
        }
        self.detector.confidence_threshold =
            env_parse("PRESENCE_DETECTOR_CONFIDENCE", self.detector.confidence_threshold);
        self.detector.nms_threshold = env_parse("PRESENCE_DETECTOR_NMS", self.detector.nms_threshold);
        self.session_timeout_secs = env_parse("PRESENCE_SESSION_TIMEOUT_SECS", self.session_timeout_secs);
        self.service_timeout_secs = env_parse("PRESENCE_SERVICE_TIMEOUT_SECS", self.service_timeout_secs);
        self.warmup_frames = env_parse("PRESENCE_WARMUP_FRAMES", self.warmup_frames);
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir.join("det_10g.onnx").to_string_lossy().into_owned()
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        secs(self.session_timeout_secs)
    }

    pub fn service_timeout(&self) -> Option<Duration> {
        secs(self.service_timeout_secs)
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// `$XDG_DATA_HOME/presence`, falling back to `~/.local/share/presence`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("presence")
}

/// `$XDG_CONFIG_HOME/presence/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("presence/config.toml")
}
