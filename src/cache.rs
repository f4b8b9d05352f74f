//! Weight cache management for downloaded model files
//!
//! Files are stored in an XDG-compliant directory, one sub-directory per
//! `HuggingFace` repository, next to a JSON manifest recording where each file
//! came from and its SHA-256.

use crate::error::{RelightError, Result};
use crate::models::ModelFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the cache location
pub const CACHE_DIR_ENV: &str = "ICLIGHT_RELIGHT_CACHE_DIR";

const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Cache subdirectory holding merged weights
const MERGED_DIR: &str = "merged";

/// Provenance record written next to every downloaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadManifest {
    /// Source URL
    pub url: String,
    /// File size in bytes
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the file
    pub sha256: String,
    /// Completion time of the download
    pub downloaded_at: DateTime<Utc>,
}

/// Information about a cached weight file
#[derive(Debug, Clone)]
pub struct CachedFileInfo {
    /// Path relative to the cache root
    pub file_id: String,
    /// Absolute path of the file
    pub path: PathBuf,
    /// Size on disk
    pub size_bytes: u64,
    /// Download manifest, when present and readable
    pub manifest: Option<DownloadManifest>,
}

/// Model cache manager
#[derive(Debug, Clone)]
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Create a new model cache manager
    ///
    /// Uses XDG Base Directory specification for cache location:
    /// - Linux/macOS: `~/.cache/iclight-relight/models/`
    /// - Windows: `%LOCALAPPDATA%/iclight-relight/models/`
    ///
    /// # Errors
    /// - Failed to determine cache directory
    /// - Failed to create cache directory
    pub fn new() -> Result<Self> {
        let cache_dir = Self::get_cache_dir()?;

        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir)
                .map_err(|e| RelightError::file_io_error("create cache directory", &cache_dir, &e))?;
        }

        Ok(Self { cache_dir })
    }

    /// Create a new model cache with a custom cache directory
    ///
    /// # Errors
    /// - Failed to create cache directory
    pub fn with_custom_cache_dir(cache_dir: &Path) -> Result<Self> {
        let models_dir = cache_dir.join("models");

        if !models_dir.exists() {
            fs::create_dir_all(&models_dir).map_err(|e| {
                RelightError::file_io_error("create custom cache directory", &models_dir, &e)
            })?;
        }

        Ok(Self {
            cache_dir: models_dir,
        })
    }

    fn get_cache_dir() -> Result<PathBuf> {
        if let Ok(cache_override) = std::env::var(CACHE_DIR_ENV) {
            return Ok(PathBuf::from(cache_override).join("models"));
        }

        Ok(dirs::cache_dir()
            .ok_or_else(|| {
                RelightError::invalid_config(format!(
                    "Failed to determine cache directory. Set {} environment variable.",
                    CACHE_DIR_ENV
                ))
            })?
            .join("iclight-relight")
            .join("models"))
    }

    /// Cache-safe identifier of a repository (`owner/name` -> `owner--name`)
    #[must_use]
    pub fn repo_to_model_id(repo: &str) -> String {
        repo.trim_matches('/').replace('/', "--")
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Directory of weights derived from downloaded files
    #[must_use]
    pub fn merged_dir(&self) -> PathBuf {
        self.cache_dir.join(MERGED_DIR)
    }

    /// Location of a model file inside the cache (may not exist)
    #[must_use]
    pub fn file_path(&self, file: &ModelFile) -> PathBuf {
        self.cache_dir
            .join(Self::repo_to_model_id(file.repo))
            .join(file.remote_path)
    }

    /// Location of the manifest of a cached file
    #[must_use]
    pub fn manifest_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(MANIFEST_SUFFIX);
        path.with_file_name(name)
    }

    /// Whether a model file is present and non-empty
    #[must_use]
    pub fn is_cached(&self, file: &ModelFile) -> bool {
        fs::metadata(self.file_path(file)).is_ok_and(|meta| meta.is_file() && meta.len() > 0)
    }

    /// Write the manifest of a downloaded file
    ///
    /// # Errors
    /// - Serialization or write failures
    pub fn write_manifest(path: &Path, manifest: &DownloadManifest) -> Result<()> {
        let manifest_path = Self::manifest_path(path);
        let json = serde_json::to_string_pretty(manifest)
            .map_err(|e| RelightError::internal(format!("Failed to serialize manifest: {}", e)))?;
        fs::write(&manifest_path, json)
            .map_err(|e| RelightError::file_io_error("write manifest", &manifest_path, &e))
    }

    /// Read the manifest of a cached file, if any
    #[must_use]
    pub fn read_manifest(path: &Path) -> Option<DownloadManifest> {
        let content = fs::read_to_string(Self::manifest_path(path)).ok()?;
        match serde_json::from_str(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                log::warn!("Ignoring unreadable manifest for {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Scan the cache for weight files
    ///
    /// # Errors
    /// - Failed to read cache directory
    pub fn scan_cached_files(&self) -> Result<Vec<CachedFileInfo>> {
        let mut files = Vec::new();
        if !self.cache_dir.exists() {
            return Ok(files);
        }

        let mut paths = Vec::new();
        Self::visit_dir(&self.cache_dir, &mut paths)
            .map_err(|e| RelightError::file_io_error("read cache directory", &self.cache_dir, &e))?;

        for path in paths {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if name.ends_with(MANIFEST_SUFFIX) || name.ends_with(".part") {
                continue;
            }
            let size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let file_id = path
                .strip_prefix(&self.cache_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            files.push(CachedFileInfo {
                file_id,
                manifest: Self::read_manifest(&path),
                path,
                size_bytes,
            });
        }

        files.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        Ok(files)
    }

    /// Recursively collect regular files
    fn visit_dir(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::visit_dir(&path, files)?;
            } else {
                files.push(path);
            }
        }
        Ok(())
    }

    /// Remove every cached repository
    ///
    /// # Returns
    /// Removed repository identifiers for user feedback
    ///
    /// # Errors
    /// - Failed to access or remove cache entries
    pub fn clear_all_models(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        if !self.cache_dir.exists() {
            return Ok(removed);
        }

        let entries = fs::read_dir(&self.cache_dir)
            .map_err(|e| RelightError::file_io_error("read cache directory", &self.cache_dir, &e))?;

        for entry in entries {
            let entry =
                entry.map_err(|e| RelightError::file_io_error("read cache directory", &self.cache_dir, &e))?;
            let path = entry.path();
            let model_id = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("unknown")
                .to_string();

            log::info!("Removing cached model: {}", model_id);
            if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            }
            .map_err(|e| RelightError::file_io_error("remove cached model", &path, &e))?;
            removed.push(model_id);
        }

        removed.sort();
        Ok(removed)
    }

    /// Human readable byte count
    #[must_use]
    pub fn format_size(bytes: u64) -> String {
        const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit = 0;
        while size >= 1024.0 && unit < UNITS.len() - 1 {
            size /= 1024.0;
            unit += 1;
        }
        if unit == 0 {
            format!("{} B", bytes)
        } else {
            format!("{:.1} {}", size, UNITS[unit])
        }
    }
}
