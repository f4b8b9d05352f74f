//! Model file registry and resolution
//!
//! Every weight file the pipeline needs is described by a `ModelFile`.
//! `ModelManager` resolves them from a user supplied directory first, then
//! from the cache, and downloads whatever is still missing.

use crate::{
    cache::ModelCache,
    download::ModelDownloader,
    error::{RelightError, Result},
};
use std::path::{Path, PathBuf};
use tracing::info;

/// Base model repository (Stable Diffusion 1.5 fine-tune, diffusers layout)
pub const SD15_REPO: &str = "stablediffusionapi/realistic-vision-v51";

/// CLIP tokenizer repository
pub const TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";

/// Relighting offset repository
pub const ICLIGHT_REPO: &str = "lllyasviel/ic-light";

/// Matting model repository
pub const RMBG_REPO: &str = "briaai/RMBG-1.4";

/// Role of a weight file in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelComponent {
    Tokenizer,
    TextEncoder,
    Vae,
    Unet,
    IcLightOffset,
    Rmbg,
}

/// One downloadable weight file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelFile {
    pub component: ModelComponent,
    /// `HuggingFace` repository (`owner/name`)
    pub repo: &'static str,
    /// Path inside the repository
    pub remote_path: &'static str,
    /// File name inside a `--models_dir` directory
    pub local_name: &'static str,
}

impl ModelFile {
    /// Download URL on the `HuggingFace` hub
    #[must_use]
    pub fn url(&self) -> String {
        format!("https://huggingface.co/{}/resolve/main/{}", self.repo, self.remote_path)
    }
}

const MODEL_FILES: [ModelFile; 6] = [
    ModelFile {
        component: ModelComponent::Tokenizer,
        repo: TOKENIZER_REPO,
        remote_path: "tokenizer.json",
        local_name: "tokenizer.json",
    },
    ModelFile {
        component: ModelComponent::TextEncoder,
        repo: SD15_REPO,
        remote_path: "text_encoder/model.safetensors",
        local_name: "text_encoder.safetensors",
    },
    ModelFile {
        component: ModelComponent::Vae,
        repo: SD15_REPO,
        remote_path: "vae/diffusion_pytorch_model.safetensors",
        local_name: "vae.safetensors",
    },
    ModelFile {
        component: ModelComponent::Unet,
        repo: SD15_REPO,
        remote_path: "unet/diffusion_pytorch_model.safetensors",
        local_name: "unet.safetensors",
    },
    ModelFile {
        component: ModelComponent::IcLightOffset,
        repo: ICLIGHT_REPO,
        remote_path: "iclight_sd15_fbc.safetensors",
        local_name: "iclight_sd15_fbc.safetensors",
    },
    ModelFile {
        component: ModelComponent::Rmbg,
        repo: RMBG_REPO,
        remote_path: "onnx/model.onnx",
        local_name: "rmbg-1.4.onnx",
    },
];

impl ModelComponent {
    /// Every component, in download order
    pub const ALL: [Self; 6] = [
        Self::Tokenizer,
        Self::TextEncoder,
        Self::Vae,
        Self::Unet,
        Self::IcLightOffset,
        Self::Rmbg,
    ];

    /// Registry entry of this component
    #[must_use]
    pub fn file(self) -> &'static ModelFile {
        let index = match self {
            Self::Tokenizer => 0,
            Self::TextEncoder => 1,
            Self::Vae => 2,
            Self::Unet => 3,
            Self::IcLightOffset => 4,
            Self::Rmbg => 5,
        };
        &MODEL_FILES[index]
    }
}

impl std::fmt::Display for ModelComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Tokenizer => "tokenizer",
            Self::TextEncoder => "text encoder",
            Self::Vae => "vae",
            Self::Unet => "unet",
            Self::IcLightOffset => "ic-light offset",
            Self::Rmbg => "rmbg matting",
        };
        f.write_str(name)
    }
}

/// Resolved locations of every weight file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub tokenizer: PathBuf,
    pub text_encoder: PathBuf,
    pub vae: PathBuf,
    pub unet: PathBuf,
    pub iclight_offset: PathBuf,
    pub rmbg: PathBuf,
    /// Writable directory for derived weights (the merged UNet)
    pub merged_dir: PathBuf,
}

impl ModelPaths {
    fn from_lookup(
        merged_dir: PathBuf,
        mut lookup: impl FnMut(ModelComponent) -> Result<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            tokenizer: lookup(ModelComponent::Tokenizer)?,
            text_encoder: lookup(ModelComponent::TextEncoder)?,
            vae: lookup(ModelComponent::Vae)?,
            unet: lookup(ModelComponent::Unet)?,
            iclight_offset: lookup(ModelComponent::IcLightOffset)?,
            rmbg: lookup(ModelComponent::Rmbg)?,
            merged_dir,
        })
    }
}

/// Resolves weight files from a local directory, the cache or the network
#[derive(Debug, Clone)]
pub struct ModelManager {
    cache: ModelCache,
    models_dir: Option<PathBuf>,
}

impl ModelManager {
    #[must_use]
    pub fn new(cache: ModelCache, models_dir: Option<PathBuf>) -> Self {
        Self { cache, models_dir }
    }

    #[must_use]
    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Existing location of a component, without downloading
    #[must_use]
    pub fn locate(&self, component: ModelComponent) -> Option<PathBuf> {
        let file = component.file();
        if let Some(dir) = &self.models_dir {
            let local = dir.join(file.local_name);
            if local.is_file() {
                return Some(local);
            }
        }
        if self.cache.is_cached(file) {
            return Some(self.cache.file_path(file));
        }
        None
    }

    /// Components not available locally
    #[must_use]
    pub fn missing(&self) -> Vec<ModelComponent> {
        ModelComponent::ALL
            .into_iter()
            .filter(|component| self.locate(*component).is_none())
            .collect()
    }

    /// Resolve every file, failing if any is missing
    ///
    /// # Errors
    /// - A component is neither in the models directory nor in the cache
    pub fn resolve_local(&self) -> Result<ModelPaths> {
        ModelPaths::from_lookup(self.cache.merged_dir(), |component| {
            self.locate(component).ok_or_else(|| {
                RelightError::model_error_with_context(
                    "locate",
                    self.models_dir.as_deref().unwrap_or(self.cache.cache_dir()),
                    &format!("{} weights not found", component),
                    &["run without --models_dir to download", "check the models directory layout"],
                )
            })
        })
    }

    /// Resolve every file, downloading missing ones into the cache
    ///
    /// # Errors
    /// - Download failures
    pub async fn resolve(&self, downloader: &ModelDownloader, show_progress: bool) -> Result<ModelPaths> {
        let missing = self.missing();
        if !missing.is_empty() {
            info!(files = missing.len(), "Downloading missing model files");
        }
        for component in missing {
            downloader.download_file(component.file(), show_progress).await?;
        }
        self.resolve_local()
    }

    /// Local layout expected under a models directory
    #[must_use]
    pub fn expected_layout(dir: &Path) -> Vec<PathBuf> {
        ModelComponent::ALL
            .into_iter()
            .map(|component| dir.join(component.file().local_name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_registry_urls() {
        assert_eq!(
            ModelComponent::IcLightOffset.file().url(),
            "https://huggingface.co/lllyasviel/ic-light/resolve/main/iclight_sd15_fbc.safetensors"
        );
        assert_eq!(
            ModelComponent::Rmbg.file().url(),
            "https://huggingface.co/briaai/RMBG-1.4/resolve/main/onnx/model.onnx"
        );
        for component in ModelComponent::ALL {
            assert_eq!(component.file().component, component);
        }
    }

    #[test]
    fn test_models_dir_takes_precedence_over_cache() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::with_custom_cache_dir(&temp.path().join("cache")).unwrap();
        let models_dir = temp.path().join("weights");
        fs::create_dir_all(&models_dir).unwrap();

        let cached = cache.file_path(ModelComponent::Vae.file());
        fs::create_dir_all(cached.parent().unwrap()).unwrap();
        fs::write(&cached, b"cached").unwrap();
        fs::write(models_dir.join("vae.safetensors"), b"local").unwrap();
        fs::write(models_dir.join("unet.safetensors"), b"local").unwrap();

        let manager = ModelManager::new(cache.clone(), Some(models_dir.clone()));
        assert_eq!(manager.locate(ModelComponent::Vae), Some(models_dir.join("vae.safetensors")));
        assert_eq!(manager.locate(ModelComponent::Unet), Some(models_dir.join("unet.safetensors")));
        assert_eq!(manager.locate(ModelComponent::Tokenizer), None);

        let manager = ModelManager::new(cache, None);
        assert_eq!(manager.locate(ModelComponent::Vae), Some(cached));
        assert_eq!(manager.missing().len(), 5);
    }

    #[test]
    fn test_resolve_local_reports_missing_component() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::with_custom_cache_dir(temp.path()).unwrap();
        let models_dir = temp.path().join("weights");
        fs::create_dir_all(&models_dir).unwrap();
        for path in ModelManager::expected_layout(&models_dir) {
            if !path.ends_with("rmbg-1.4.onnx") {
                fs::write(path, b"x").unwrap();
            }
        }

        let manager = ModelManager::new(cache, Some(models_dir.clone()));
        let err = manager.resolve_local().unwrap_err();
        assert!(err.to_string().contains("rmbg matting"));

        fs::write(models_dir.join("rmbg-1.4.onnx"), b"x").unwrap();
        let paths = manager.resolve_local().unwrap();
        assert_eq!(paths.rmbg, models_dir.join("rmbg-1.4.onnx"));
        assert_eq!(paths.tokenizer, models_dir.join("tokenizer.json"));
        // derived weights always go to the cache, never the models directory
        assert_eq!(paths.merged_dir, manager.cache().merged_dir());
        assert!(!paths.merged_dir.starts_with(&models_dir));
    }
}
