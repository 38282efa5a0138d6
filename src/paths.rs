use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const APP_DIR_NAME: &str = "fetchplay";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("could not determine the system {0} directory")]
    NoSystemDir(&'static str),
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize path config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Resolved directories and files for the application
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PathConfig {
    pub app_data_dir: PathBuf,
    pub app_cache_dir: PathBuf,
    pub app_log_dir: PathBuf,

    /// Downloaded audio lives here, one file per source file name
    pub audio_cache_dir: PathBuf,
    pub settings_file: PathBuf,

    pub logs: LogPaths,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LogPaths {
    pub backend_logs: PathBuf,
    pub backend_errors: PathBuf,
}

impl PathConfig {
    /// Resolve the standard per-user directories, or lay everything out under
    /// `base` when one is given.
    pub fn new(base: Option<&Path>) -> Result<Self, PathError> {
        let (app_data_dir, app_cache_dir) = match base {
            Some(base) => (base.join("data"), base.join("cache")),
            None => {
                let data = dirs::data_dir().ok_or(PathError::NoSystemDir("data"))?;
                let cache = dirs::cache_dir().ok_or(PathError::NoSystemDir("cache"))?;
                (data.join(APP_DIR_NAME), cache.join(APP_DIR_NAME))
            }
        };
        Ok(Self::from_dirs(app_data_dir, app_cache_dir))
    }

    fn from_dirs(app_data_dir: PathBuf, app_cache_dir: PathBuf) -> Self {
        let app_log_dir = app_data_dir.join("logs");
        let logs = LogPaths {
            backend_logs: app_log_dir.join("backend_logs.txt"),
            backend_errors: app_log_dir.join("backend_errors.txt"),
        };

        Self {
            audio_cache_dir: app_cache_dir.join("audio_cache"),
            settings_file: app_data_dir.join("settings.json"),
            app_data_dir,
            app_cache_dir,
            app_log_dir,
            logs,
        }
    }

    pub fn ensure_directories_exist(&self) -> Result<(), PathError> {
        let dirs_to_create = [
            &self.app_data_dir,
            &self.app_cache_dir,
            &self.app_log_dir,
            &self.audio_cache_dir,
        ];

        for dir in dirs_to_create {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|source| PathError::CreateDir {
                    path: dir.clone(),
                    source,
                })?;
            }
        }

        Ok(())
    }

    pub fn to_json(&self) -> Result<String, PathError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
