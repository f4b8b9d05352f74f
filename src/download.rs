//! Weight file downloading from `HuggingFace` repositories
//!
//! Files are streamed into a `.part` file next to their cache location, hashed
//! while streaming, then renamed into place and recorded in a manifest.

use crate::cache::{DownloadManifest, ModelCache};
use crate::error::{RelightError, Result};
use crate::models::ModelFile;
use futures_util::stream::TryStreamExt;
#[cfg(feature = "cli")]
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{info_span, Instrument};

const HUB_PREFIX: &str = "https://huggingface.co/";

/// Weight file downloader with progress reporting
#[derive(Debug)]
pub struct ModelDownloader {
    client: Client,
    cache: ModelCache,
}

/// Progress bar abstraction that works with and without CLI features
#[derive(Debug)]
pub enum ProgressIndicator {
    #[cfg(feature = "cli")]
    Indicatif(ProgressBar),
    NoOp,
}

impl ProgressIndicator {
    pub fn set_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_message(msg),
            Self::NoOp => {},
        }
    }

    pub fn set_length(&self, len: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_length(len),
            Self::NoOp => {},
        }
    }

    pub fn set_position(&self, pos: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_position(pos),
            Self::NoOp => {},
        }
    }

    pub fn finish_with_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.finish_with_message(msg),
            Self::NoOp => {},
        }
    }
}

impl ModelDownloader {
    /// Create a downloader writing into the given cache
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn new(cache: ModelCache) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(1800))
            .build()
            .map_err(|e| RelightError::network_error("Failed to create HTTP client", e))?;

        Ok(Self { client, cache })
    }

    /// Download one weight file into the cache
    ///
    /// Already cached files are returned without touching the network.
    ///
    /// # Errors
    /// - Network errors during download
    /// - File system errors during caching
    pub async fn download_file(&self, file: &ModelFile, show_progress: bool) -> Result<PathBuf> {
        let final_path = self.cache.file_path(file);
        if self.cache.is_cached(file) {
            log::info!("Already cached: {}", final_path.display());
            return Ok(final_path);
        }

        let url = file.url();
        validate_model_url(&url)?;

        let span = info_span!("download", repo = file.repo, file = file.remote_path);
        async {
            let temp_path = Self::part_path(&final_path);
            let progress = if show_progress {
                Self::create_progress_indicator()
            } else {
                ProgressIndicator::NoOp
            };
            progress.set_message(format!("{} ({})", file.component, file.remote_path));

            match self.stream_to_file(&url, &temp_path, &progress).await {
                Ok((size_bytes, sha256)) => {
                    fs::rename(&temp_path, &final_path).map_err(|e| {
                        RelightError::file_io_error("move downloaded file to cache", &final_path, &e)
                    })?;
                    let manifest = DownloadManifest {
                        url: url.clone(),
                        size_bytes,
                        sha256,
                        downloaded_at: chrono::Utc::now(),
                    };
                    ModelCache::write_manifest(&final_path, &manifest)?;
                    progress.finish_with_message(format!("Downloaded {}", file.component));
                    log::info!(
                        "Downloaded {} ({}) to {}",
                        url,
                        ModelCache::format_size(size_bytes),
                        final_path.display()
                    );
                    Ok(final_path)
                },
                Err(e) => {
                    if temp_path.exists() {
                        if let Err(cleanup_err) = fs::remove_file(&temp_path) {
                            log::warn!("Failed to cleanup partial download: {}", cleanup_err);
                        }
                    }
                    progress.finish_with_message("Download failed".to_string());
                    Err(e)
                },
            }
        }
        .instrument(span)
        .await
    }

    /// Temporary location of an in-flight download
    #[must_use]
    pub fn part_path(final_path: &Path) -> PathBuf {
        let mut name = final_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".part");
        final_path.with_file_name(name)
    }

    fn create_progress_indicator() -> ProgressIndicator {
        #[cfg(feature = "cli")]
        {
            let pb = ProgressBar::new(0);
            if let Ok(style) = ProgressStyle::default_bar().template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
            ) {
                pb.set_style(style.progress_chars("#>-"));
            }
            ProgressIndicator::Indicatif(pb)
        }
        #[cfg(not(feature = "cli"))]
        {
            ProgressIndicator::NoOp
        }
    }

    /// Stream a URL into a local file, returning its size and SHA-256
    async fn stream_to_file(
        &self,
        url: &str,
        local_path: &Path,
        progress: &ProgressIndicator,
    ) -> Result<(u64, String)> {
        log::debug!("Downloading: {} -> {}", url, local_path.display());

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RelightError::file_io_error("create directory", parent, &e))?;
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RelightError::network_error(format!("Failed to download {}", url), e))?;

        if !response.status().is_success() {
            return Err(RelightError::network_error(
                format!("Download of {} failed", url),
                format!("HTTP {}", response.status()),
            ));
        }

        if let Some(total) = response.content_length() {
            progress.set_length(total);
        }

        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| RelightError::file_io_error("create file", local_path, &e))?;

        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut hasher = Sha256::new();
        let mut downloaded = 0u64;
        let mut buffer = vec![0; 64 * 1024];

        loop {
            let bytes_read = tokio::io::AsyncReadExt::read(&mut stream, &mut buffer)
                .await
                .map_err(|e| RelightError::network_error("Failed to read download stream", e))?;

            if bytes_read == 0 {
                break;
            }

            let chunk = buffer.get(..bytes_read).unwrap_or(&[]);
            hasher.update(chunk);
            file.write_all(chunk)
                .await
                .map_err(|e| RelightError::file_io_error("write to file", local_path, &e))?;

            downloaded += bytes_read as u64;
            progress.set_position(downloaded);
        }

        file.flush()
            .await
            .map_err(|e| RelightError::file_io_error("flush file", local_path, &e))?;

        Ok((downloaded, format!("{:x}", hasher.finalize())))
    }

    /// Check a file against its recorded SHA-256
    ///
    /// Returns `true` when no hash is expected.
    ///
    /// # Errors
    /// - Failed to read the file
    pub fn verify_file_integrity(file_path: &Path, expected_hash: Option<&str>) -> Result<bool> {
        let Some(expected) = expected_hash else {
            return Ok(true);
        };

        let contents = fs::read(file_path)
            .map_err(|e| RelightError::file_io_error("read file for verification", file_path, &e))?;
        let actual_hash = format!("{:x}", Sha256::digest(&contents));

        if actual_hash == expected {
            Ok(true)
        } else {
            log::warn!(
                "File integrity check failed for {}: expected {}, got {}",
                file_path.display(),
                expected,
                actual_hash
            );
            Ok(false)
        }
    }

    #[must_use]
    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }
}

/// Validate that a URL points at a file in a `HuggingFace` repository
///
/// # Errors
/// - Empty URL, foreign host or missing `owner/repo` segment
pub fn validate_model_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(RelightError::invalid_config("Model URL cannot be empty"));
    }

    let Some(repo_path) = url.strip_prefix(HUB_PREFIX) else {
        return Err(RelightError::invalid_config(format!(
            "Unsupported URL format: {}. Only HuggingFace repositories are supported ({}...)",
            url, HUB_PREFIX
        )));
    };

    let mut segments = repo_path.split('/').filter(|s| !s.is_empty());
    if segments.next().is_none() || segments.next().is_none() {
        return Err(RelightError::invalid_config(format!(
            "Invalid HuggingFace repository URL: {}. Expected format: {}owner/repo-name/...",
            url, HUB_PREFIX
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelComponent;
    use tempfile::TempDir;

    #[test]
    fn test_validate_model_url() {
        assert!(validate_model_url(&ModelComponent::Unet.file().url()).is_ok());
        assert!(validate_model_url("").is_err());
        assert!(validate_model_url("https://example.com/a/b").is_err());
        assert!(validate_model_url("https://huggingface.co/lonely").is_err());
    }

    #[test]
    fn test_part_path() {
        let part = ModelDownloader::part_path(Path::new("/tmp/x/model.onnx"));
        assert_eq!(part, PathBuf::from("/tmp/x/model.onnx.part"));
    }

    #[test]
    fn test_verify_file_integrity() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("weights.bin");
        fs::write(&path, b"abc").unwrap();
        let hash = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

        assert!(ModelDownloader::verify_file_integrity(&path, Some(hash)).unwrap());
        assert!(!ModelDownloader::verify_file_integrity(&path, Some("00")).unwrap());
        assert!(ModelDownloader::verify_file_integrity(&path, None).unwrap());
    }

    #[tokio::test]
    async fn test_cached_file_skips_network() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::with_custom_cache_dir(temp.path()).unwrap();
        let file = ModelComponent::Tokenizer.file();
        let path = cache.file_path(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{}").unwrap();

        let downloader = ModelDownloader::new(cache).unwrap();
        let resolved = downloader.download_file(file, false).await.unwrap();
        assert_eq!(resolved, path);
    }
}
