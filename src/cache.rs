use crate::utils::plain_file_name;
use reqwest::Url;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Suffix for files still being written by a download.
pub const PART_SUFFIX: &str = ".part";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{0}")]
    InvalidUrl(String),
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub files: usize,
    pub total_bytes: u64,
    pub partial_files: usize,
}

/// Single-directory audio cache keyed by the source URL's file name.
///
/// A file that exists under its final name is a hit; nothing checks whether the
/// remote copy has changed since.
#[derive(Debug, Clone)]
pub struct AudioCache {
    cache_dir: PathBuf,
}

impl AudioCache {
    pub fn new(cache_dir: &Path) -> Result<Self, CacheError> {
        if !cache_dir.exists() {
            fs::create_dir_all(cache_dir).map_err(|source| CacheError::Io {
                path: cache_dir.to_path_buf(),
                source,
            })?;
        }
        info!("[cache] Audio cache initialized at: {}", cache_dir.display());
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    /// File name the cache stores `url` under: the last segment of the URL
    /// path, percent-decoded.
    pub fn file_name_for(url: &str) -> Result<String, CacheError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(CacheError::InvalidUrl("no URL given".to_string()));
        }

        let parsed = Url::parse(trimmed)
            .map_err(|e| CacheError::InvalidUrl(format!("{trimmed}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CacheError::InvalidUrl(format!(
                "{trimmed}: unsupported scheme '{}'",
                parsed.scheme()
            )));
        }

        let segment = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default();
        let decoded = urlencoding::decode(segment)
            .map_err(|e| CacheError::InvalidUrl(format!("{trimmed}: {e}")))?;

        match plain_file_name(&decoded) {
            Some(name) if !name.ends_with(PART_SUFFIX) => Ok(name.to_string()),
            _ => Err(CacheError::InvalidUrl(format!(
                "{trimmed}: URL does not name a file"
            ))),
        }
    }

    pub fn local_path_for(&self, url: &str) -> Result<PathBuf, CacheError> {
        Ok(self.cache_dir.join(Self::file_name_for(url)?))
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.local_path_for(url)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    fn entries(&self) -> Result<Vec<fs::DirEntry>, CacheError> {
        let read_dir = fs::read_dir(&self.cache_dir).map_err(|source| CacheError::Io {
            path: self.cache_dir.clone(),
            source,
        })?;
        Ok(read_dir
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .collect())
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();
        for entry in self.entries()? {
            if is_part_file(&entry.path()) {
                stats.partial_files += 1;
                continue;
            }
            stats.files += 1;
            stats.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
        Ok(stats)
    }

    /// Delete every cached file, including leftovers from interrupted
    /// downloads. Returns how many files were removed.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for entry in self.entries()? {
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("[cache] Failed to remove {}: {}", path.display(), e),
            }
        }
        info!("[cache] Cleared {} file(s) from {}", removed, self.cache_dir.display());
        Ok(removed)
    }
}

/// Sibling path a download writes to before it is complete. `attempt` keeps
/// concurrent downloads of the same file name apart.
pub fn part_path_for(path: &Path, attempt: u64) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}-{}{}", std::process::id(), attempt, PART_SUFFIX));
    path.with_file_name(name)
}

fn is_part_file(path: &Path) -> bool {
    let partial = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(PART_SUFFIX))
        .unwrap_or(false);
    if partial {
        debug!("[cache] Skipping partial download {}", path.display());
    }
    partial
}
