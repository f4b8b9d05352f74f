//! Candle backend for the IC-Light conditioned Stable Diffusion 1.5 model
//!
//! The UNet input convolution is widened from 4 to 12 channels (noisy
//! latent + foreground latent + background latent) and the IC-Light offset
//! is added to every base weight. The merged weights are stored in the cache
//! under a name derived from both inputs, so a changed base UNet or offset
//! triggers a fresh merge.

use crate::cache::ModelCache;
use crate::config::ExecutionProvider;
use crate::error::{RelightError, Result};
use crate::inference::{DiffusionBackend, SamplingRequest};
use crate::models::ModelPaths;
use crate::text::chunk_token_ids;
use crate::tracing_config::spans;
use candle::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, schedulers::Scheduler, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
};
use ndarray::{Array3, Array4};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokenizers::Tokenizer;

/// VAE latent scaling factor of Stable Diffusion 1.x
pub const VAE_SCALE: f64 = 0.18215;

/// Input channels of the patched UNet
pub const ICLIGHT_IN_CHANNELS: usize = 12;

const CONV_IN_WEIGHT: &str = "conv_in.weight";
const MERGED_UNET_PREFIX: &str = "unet_iclight_fbc_merged";

/// Pick the candle device for an execution provider
///
/// # Errors
/// - CUDA requested but unavailable in this build
pub fn select_device(provider: ExecutionProvider) -> Result<Device> {
    let device = match provider {
        ExecutionProvider::Cpu => Device::Cpu,
        ExecutionProvider::Auto => Device::cuda_if_available(0)?,
        ExecutionProvider::Cuda => Device::new_cuda(0)?,
    };
    log::info!("Diffusion device: {:?}", device);
    Ok(device)
}

/// Zero-pad the input channels of a conv weight `(out, in, kh, kw)`
///
/// # Errors
/// - Weight is not 4D or already wider than `in_channels`
pub fn widen_conv_in(weight: &Tensor, in_channels: usize) -> Result<Tensor> {
    let (out, current, kh, kw) = weight.dims4()?;
    if current > in_channels {
        return Err(RelightError::model(format!(
            "conv_in already has {} input channels, cannot narrow to {}",
            current, in_channels
        )));
    }
    if current == in_channels {
        return Ok(weight.clone());
    }
    let zeros = Tensor::zeros((out, in_channels - current, kh, kw), weight.dtype(), weight.device())?;
    Ok(Tensor::cat(&[weight, &zeros], 1)?)
}

/// Add the IC-Light offset to a base UNet state dict
///
/// The base `conv_in` is widened first. Key sets must match exactly and every
/// pair must share a shape; sums are computed in f32.
///
/// # Errors
/// - Missing or extra keys
/// - Shape mismatches
pub fn merge_iclight_offset(
    mut base: HashMap<String, Tensor>,
    offset: &HashMap<String, Tensor>,
) -> Result<HashMap<String, Tensor>> {
    if let Some(conv_in) = base.get(CONV_IN_WEIGHT) {
        let widened = widen_conv_in(conv_in, ICLIGHT_IN_CHANNELS)?;
        base.insert(CONV_IN_WEIGHT.to_string(), widened);
    }

    if let Some(extra) = offset.keys().find(|key| !base.contains_key(*key)) {
        return Err(RelightError::model(format!(
            "IC-Light offset has key '{}' missing from the base UNet",
            extra
        )));
    }

    let mut merged = HashMap::with_capacity(base.len());
    for (key, weight) in base {
        let delta = offset.get(&key).ok_or_else(|| {
            RelightError::model(format!("IC-Light offset is missing key '{}'", key))
        })?;
        if weight.dims() != delta.dims() {
            return Err(RelightError::model(format!(
                "Shape mismatch for '{}': base {:?}, offset {:?}",
                key,
                weight.dims(),
                delta.dims()
            )));
        }
        let sum = (weight.to_dtype(DType::F32)? + delta.to_dtype(DType::F32)?)?;
        merged.insert(key, sum);
    }
    Ok(merged)
}

/// Identity of a weight file: size plus the download checksum when a
/// manifest exists, otherwise size, canonical path and modification time
fn weight_identity(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path).map_err(|e| RelightError::file_io_error("inspect weights", path, &e))?;
    if let Some(manifest) = ModelCache::read_manifest(path) {
        return Ok(format!("{}:sha256:{}", meta.len(), manifest.sha256));
    }
    let modified = meta
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |elapsed| elapsed.as_nanos());
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    Ok(format!("{}:{}:{}", meta.len(), canonical.display(), modified))
}

/// Location of the merged UNet for a base/offset pair inside `merged_dir`
///
/// # Errors
/// - Either input file cannot be inspected
pub fn merged_unet_file(merged_dir: &Path, base: &Path, offset: &Path) -> Result<PathBuf> {
    let mut hasher = Sha256::new();
    for path in [base, offset] {
        hasher.update(weight_identity(path)?.as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    let short = digest.get(..16).unwrap_or(&digest);
    Ok(merged_dir.join(format!("{}-{}.safetensors", MERGED_UNET_PREFIX, short)))
}

/// Remove merged UNets other than `keep`
fn prune_stale_merges(merged_dir: &Path, keep: &Path) {
    let Ok(entries) = std::fs::read_dir(merged_dir) else {
        return;
    };
    for path in entries.flatten().map(|entry| entry.path()) {
        let stale = path != keep
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(MERGED_UNET_PREFIX));
        if stale {
            log::debug!("Removing stale merged UNet: {}", path.display());
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

fn array4_to_tensor(array: &Array4<f32>, device: &Device, dtype: DType) -> Result<Tensor> {
    let data: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_vec(data, array.dim(), device)?.to_dtype(dtype)?)
}

fn array3_to_tensor(array: &Array3<f32>, device: &Device, dtype: DType) -> Result<Tensor> {
    let data: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_vec(data, array.dim(), device)?.to_dtype(dtype)?)
}

fn tensor_to_array4(tensor: &Tensor) -> Result<Array4<f32>> {
    let shape = tensor.dims4()?;
    let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(Array4::from_shape_vec(shape, data)?)
}

fn tensor_to_array3(tensor: &Tensor) -> Result<Array3<f32>> {
    let shape = tensor.dims3()?;
    let data = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(Array3::from_shape_vec(shape, data)?)
}

/// Stable Diffusion 1.5 with the IC-Light foreground/background patch
pub struct CandleDiffusionBackend {
    device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    bos: u32,
    eos: u32,
    text_model: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl std::fmt::Debug for CandleDiffusionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleDiffusionBackend")
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .finish_non_exhaustive()
    }
}

impl CandleDiffusionBackend {
    /// Load every component of the relighting model
    ///
    /// # Errors
    /// - Device selection failures
    /// - Unreadable or incompatible weight files
    pub fn load(paths: &ModelPaths, provider: ExecutionProvider) -> Result<Self> {
        let device = select_device(provider)?;
        let dtype = DType::F32;
        let sd_config = StableDiffusionConfig::v1_5(None, None, None);

        let (tokenizer, bos, eos) = spans::model_loading("tokenizer")
            .in_scope(|| Self::load_tokenizer(&paths.tokenizer))?;

        let text_model = spans::model_loading("text_encoder").in_scope(|| {
            stable_diffusion::build_clip_transformer(&sd_config.clip, &paths.text_encoder, &device, dtype)
        })?;

        let vae = spans::model_loading("vae")
            .in_scope(|| sd_config.build_vae(&paths.vae, &device, dtype))?;

        let unet = spans::model_loading("unet").in_scope(|| -> Result<_> {
            let merged = Self::merged_unet_path(paths)?;
            Ok(sd_config.build_unet(&merged, &device, ICLIGHT_IN_CHANNELS, false, dtype)?)
        })?;

        log::info!("Relighting model loaded");
        Ok(Self {
            device,
            dtype,
            sd_config,
            tokenizer,
            bos,
            eos,
            text_model,
            vae,
            unet,
        })
    }

    fn load_tokenizer(path: &Path) -> Result<(Tokenizer, u32, u32)> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            RelightError::model_error_with_context("load", path, &e.to_string(), &["expected a CLIP tokenizer.json"])
        })?;
        let special = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| RelightError::model(format!("Tokenizer has no '{}' token", token)))
        };
        let bos = special("<|startoftext|>")?;
        let eos = special("<|endoftext|>")?;
        Ok((tokenizer, bos, eos))
    }

    /// Merged UNet weights, building them when the inputs changed
    fn merged_unet_path(paths: &ModelPaths) -> Result<PathBuf> {
        let merged_path = merged_unet_file(&paths.merged_dir, &paths.unet, &paths.iclight_offset)?;
        if merged_path.is_file() {
            log::debug!("Reusing merged UNet weights: {}", merged_path.display());
            return Ok(merged_path);
        }

        log::info!("Merging IC-Light offset into base UNet weights");
        let base = candle::safetensors::load(&paths.unet, &Device::Cpu)?;
        let offset = candle::safetensors::load(&paths.iclight_offset, &Device::Cpu)?;
        let merged = merge_iclight_offset(base, &offset)?;

        std::fs::create_dir_all(&paths.merged_dir)
            .map_err(|e| RelightError::file_io_error("create merged weights directory", &paths.merged_dir, &e))?;
        let part = merged_path.with_extension("part");
        candle::safetensors::save(&merged, &part)?;
        std::fs::rename(&part, &merged_path)
            .map_err(|e| RelightError::file_io_error("store merged UNet weights", &merged_path, &e))?;
        prune_stale_merges(&paths.merged_dir, &merged_path);
        Ok(merged_path)
    }
}

impl DiffusionBackend for CandleDiffusionBackend {
    fn encode_text(&self, prompt: &str) -> Result<Array3<f32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| RelightError::inference(format!("Tokenization failed: {e}")))?;

        let mut states = Vec::new();
        for ids in chunk_token_ids(encoding.get_ids(), self.bos, self.eos) {
            let input = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
            states.push(self.text_model.forward(&input)?);
        }
        tensor_to_array3(&Tensor::cat(&states, 0)?)
    }

    /// Encode pixels through the VAE posterior
    ///
    /// candle's `DiagonalGaussianDistribution` only exposes `sample()`, drawn
    /// from the device RNG, so repeated encodings of the same image differ
    /// slightly and this backend is not bit-reproducible across runs.
    fn encode_image(&self, pixels: &Array4<f32>) -> Result<Array4<f32>> {
        let input = array4_to_tensor(pixels, &self.device, self.dtype)?;
        let latents = (self.vae.encode(&input)?.sample()? * VAE_SCALE)?;
        tensor_to_array4(&latents)
    }

    fn decode_latent(&self, latents: &Array4<f32>) -> Result<Array4<f32>> {
        let latents = array4_to_tensor(latents, &self.device, self.dtype)?;
        let pixels = self.vae.decode(&(latents / VAE_SCALE)?)?;
        tensor_to_array4(&pixels.clamp(-1f32, 1f32)?)
    }

    fn sample(&self, request: &SamplingRequest<'_>) -> Result<Array4<f32>> {
        let batch = request.batch_size();
        let mut scheduler = self.sd_config.build_scheduler(request.num_inference_steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let noise = array4_to_tensor(request.noise, &self.device, self.dtype)?;
        let mut latents = match request.init_latents {
            Some(init) => {
                let Some(&first) = timesteps.get(request.start_step) else {
                    return Ok(init.clone());
                };
                let init = array4_to_tensor(init, &self.device, self.dtype)?;
                scheduler.add_noise(&init, noise, first)?
            },
            None => (noise * scheduler.init_noise_sigma())?,
        };

        let concat = array4_to_tensor(request.concat, &self.device, self.dtype)?.repeat((2 * batch, 1, 1, 1))?;
        let negative = array3_to_tensor(request.negative, &self.device, self.dtype)?.repeat((batch, 1, 1))?;
        let positive = array3_to_tensor(request.positive, &self.device, self.dtype)?.repeat((batch, 1, 1))?;
        let text = Tensor::cat(&[&negative, &positive], 0)?;

        for (index, &timestep) in timesteps.iter().enumerate().skip(request.start_step) {
            log::trace!("Denoising step {}/{} (t={})", index + 1, timesteps.len(), timestep);
            let model_input = Tensor::cat(&[&latents, &latents], 0)?;
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let model_input = Tensor::cat(&[&model_input, &concat], 1)?;

            let noise_pred = self.unet.forward(&model_input, timestep as f64, &text)?;
            let uncond = noise_pred.narrow(0, 0, batch)?;
            let cond = noise_pred.narrow(0, batch, batch)?;
            let guided = (&uncond + ((&cond - &uncond)? * request.guidance_scale)?)?;

            latents = scheduler.step(&guided, timestep, &latents)?;
        }

        tensor_to_array4(&latents)
    }

    fn name(&self) -> &'static str {
        "candle"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ones(shape: (usize, usize, usize, usize)) -> Tensor {
        Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_widen_conv_in_pads_with_zeros() {
        let weight = ones((2, 4, 3, 3));
        let widened = widen_conv_in(&weight, 12).unwrap();
        assert_eq!(widened.dims(), &[2, 12, 3, 3]);
        let total = widened.sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(total, 2.0 * 4.0 * 9.0);
        assert!(widen_conv_in(&widened, 4).is_err());
    }

    #[test]
    fn test_merge_adds_offsets() {
        let mut base = HashMap::new();
        base.insert(CONV_IN_WEIGHT.to_string(), ones((2, 4, 3, 3)));
        base.insert("conv_out.bias".to_string(), ones((1, 1, 1, 4)));

        let mut offset = HashMap::new();
        offset.insert(CONV_IN_WEIGHT.to_string(), ones((2, 12, 3, 3)));
        offset.insert("conv_out.bias".to_string(), ones((1, 1, 1, 4)));

        let merged = merge_iclight_offset(base, &offset).unwrap();
        let conv_in = tensor_to_array4(&merged[CONV_IN_WEIGHT]).unwrap();
        assert_eq!(conv_in[[0, 0, 0, 0]], 2.0);
        assert_eq!(conv_in[[0, 11, 0, 0]], 1.0);
        let bias = tensor_to_array4(&merged["conv_out.bias"]).unwrap();
        assert!(bias.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_merge_requires_matching_keys() {
        let mut base = HashMap::new();
        base.insert("a".to_string(), ones((1, 1, 1, 1)));
        let mut offset = HashMap::new();
        offset.insert("b".to_string(), ones((1, 1, 1, 1)));
        assert!(merge_iclight_offset(base.clone(), &offset).is_err());

        offset.clear();
        assert!(merge_iclight_offset(base.clone(), &offset).is_err());

        offset.insert("a".to_string(), ones((1, 1, 1, 2)));
        assert!(merge_iclight_offset(base, &offset).is_err());
    }

    #[test]
    fn test_array_tensor_conversion_keeps_layout() {
        let array = Array4::from_shape_fn((1, 2, 2, 3), |(_, c, y, x)| (c * 100 + y * 10 + x) as f32);
        let tensor = array4_to_tensor(&array, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(tensor_to_array4(&tensor).unwrap(), array);

        let text = Array3::from_shape_fn((2, 3, 4), |(a, b, c)| (a * 12 + b * 4 + c) as f32);
        let tensor = array3_to_tensor(&text, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(tensor_to_array3(&tensor).unwrap(), text);
    }

    #[test]
    fn test_merged_file_tracks_both_inputs() {
        let temp = tempfile::TempDir::new().unwrap();
        let merged_dir = temp.path().join("merged");
        let base = temp.path().join("unet.safetensors");
        let offset = temp.path().join("iclight_sd15_fbc.safetensors");
        std::fs::write(&base, b"base weights A").unwrap();
        std::fs::write(&offset, b"offset").unwrap();

        let first = merged_unet_file(&merged_dir, &base, &offset).unwrap();
        assert!(first.starts_with(&merged_dir));
        assert_eq!(merged_unet_file(&merged_dir, &base, &offset).unwrap(), first);

        std::fs::write(&base, b"other base weights B").unwrap();
        let rebased = merged_unet_file(&merged_dir, &base, &offset).unwrap();
        assert_ne!(rebased, first);

        let other_base = temp.path().join("elsewhere.safetensors");
        std::fs::write(&other_base, b"other base weights B").unwrap();
        assert_ne!(merged_unet_file(&merged_dir, &other_base, &offset).unwrap(), rebased);

        std::fs::write(&offset, b"new offset").unwrap();
        assert_ne!(merged_unet_file(&merged_dir, &base, &offset).unwrap(), rebased);

        assert!(merged_unet_file(&merged_dir, &temp.path().join("missing"), &offset).is_err());
    }

    #[test]
    fn test_prune_keeps_only_current_merge() {
        let temp = tempfile::TempDir::new().unwrap();
        let keep = temp.path().join(format!("{}-aaaa.safetensors", MERGED_UNET_PREFIX));
        let stale = temp.path().join(format!("{}-bbbb.safetensors", MERGED_UNET_PREFIX));
        let unrelated = temp.path().join("notes.txt");
        for path in [&keep, &stale, &unrelated] {
            std::fs::write(path, b"x").unwrap();
        }

        prune_stale_merges(temp.path(), &keep);
        assert!(keep.exists());
        assert!(!stale.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_cpu_device_selection() {
        assert!(select_device(ExecutionProvider::Cpu).unwrap().is_cpu());
    }
}
