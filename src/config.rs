//! Assistant configuration
//!
//! User preferences are stored as a camelCase JSON document. Every field is
//! optional in the file; missing fields take the defaults below.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Puck";

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are Orbit, a friendly and concise voice assistant. \
Answer conversationally and keep spoken replies short. \
When a question needs calculation, data processing or a chart, write and run Python code; \
use Matplotlib for plots and describe the result out loud. \
Use web search for current events and facts you are unsure of.";

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid settings {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssistantConfig {
    pub model_name: String,
    pub system_instruction: String,
    /// Prebuilt voice; empty leaves the choice to the service.
    pub voice_name: String,
    pub enable_google_search: bool,
    /// PulseAudio source name; `None` uses the server default.
    pub input_device: Option<String>,
    pub output_gain: f32,
    /// Directory for per-session WAV recordings.
    pub record_dir: Option<PathBuf>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            enable_google_search: true,
            input_device: None,
            output_gain: 1.0,
            record_dir: None,
        }
    }
}

impl AssistantConfig {
    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("⚙️ Loaded settings from {}", path.display());
        Ok(config)
    }

    /// Output gain limited to the supported range.
    pub fn output_gain(&self) -> f32 {
        if self.output_gain.is_finite() {
            self.output_gain.clamp(0.0, 2.0)
        } else {
            1.0
        }
    }
}

/// Per-user configuration directory for orbit.
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "orbit", "orbit").map(|dirs| dirs.config_dir().to_path_buf())
}

/// `settings.json` inside [`config_dir`].
pub fn default_settings_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(SETTINGS_FILE))
}
