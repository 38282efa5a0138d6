use crate::bass::BASS_DEVICE_DEFAULT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize settings: {0}")]
    Json(#[from] serde_json::Error),
}

// Player settings with persistence support
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    // Output device
    pub device_id: i32,
    pub sample_rate: u32,
    pub buffer_size_ms: u32,
    /// Explicit location of the BASS shared library, searched before the defaults.
    pub bass_library: Option<PathBuf>,

    // Session behaviour
    pub tick_interval_ms: u64,
    pub seek_step_seconds: f64,
    pub connect_timeout_secs: u64,

    // File endpoint
    pub server_bind: String,
    pub server_root: Option<PathBuf>,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            device_id: BASS_DEVICE_DEFAULT,
            sample_rate: 44100,
            buffer_size_ms: 500,
            bass_library: None,
            tick_interval_ms: 50,
            seek_step_seconds: 10.0,
            connect_timeout_secs: 10,
            server_bind: "127.0.0.1:5000".to_string(),
            server_root: None,
        }
    }
}

impl PlayerSettings {
    /// Load settings from `path`, using defaults if the file is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!("[settings] Settings file not found, using defaults");
            return Self::default();
        }

        let mut settings = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<PlayerSettings>(&content) {
                Ok(settings) => {
                    info!("[settings] Loaded settings from: {}", path.display());
                    settings
                }
                Err(e) => {
                    warn!("[settings] Failed to parse settings file: {}, using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("[settings] Failed to read settings file: {}, using defaults", e);
                Self::default()
            }
        };
        settings.validate();
        settings
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        info!("[settings] Saved settings to: {}", path.display());
        Ok(())
    }

    /// Clamp settings to workable ranges.
    pub fn validate(&mut self) {
        self.sample_rate = self.sample_rate.clamp(8000, 384000);
        self.buffer_size_ms = self.buffer_size_ms.clamp(10, 5000);
        self.tick_interval_ms = self.tick_interval_ms.clamp(10, 1000);
        if !self.seek_step_seconds.is_finite() || self.seek_step_seconds <= 0.0 {
            self.seek_step_seconds = 10.0;
        }
        self.seek_step_seconds = self.seek_step_seconds.min(600.0);
        self.connect_timeout_secs = self.connect_timeout_secs.clamp(1, 120);
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
