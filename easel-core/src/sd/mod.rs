//! Candle-backed Stable Diffusion engines.
//!
//! Implements the [`EngineFactory`] boundary with the diffusers-layout
//! Stable Diffusion v1.5 family: CLIP text encoding, DDIM scheduling, UNet
//! denoising, and VAE decode, with weights fetched from the Hugging Face hub
//! on first construction. The orchestration layer never sees any of this;
//! it only receives pixels.

use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::device::DeviceProfile;
use crate::engine::{EngineFactory, EngineJob, EngineLike, EngineMode, EngineOptions};
use crate::util::{image_to_tensor, tensor_to_image};

/// Latent channels of the SD v1.x UNet.
const LATENT_CHANNELS: usize = 4;
/// VAE latent scaling factor for the SD v1.x family.
const VAE_SCALE: f64 = 0.18215;
/// Attention slice size used when reduced-memory attention is requested.
const ATTENTION_SLICE: usize = 128;
/// Tokenizer repo for the SD v1.x CLIP text encoder.
const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

/// Builds [`SdPipeline`] engines bound to the service's device profile.
pub struct SdEngineFactory {
    profile: DeviceProfile,
}

impl SdEngineFactory {
    pub fn new(profile: DeviceProfile) -> Self {
        Self { profile }
    }
}

impl EngineFactory for SdEngineFactory {
    fn construct(
        &self,
        model_id: &str,
        mode: EngineMode,
        options: &EngineOptions,
    ) -> Result<Arc<dyn EngineLike>> {
        let pipeline = SdPipeline::load(model_id, mode, &self.profile, options)?;
        Ok(Arc::new(pipeline))
    }
}

/// A fully loaded Stable Diffusion pipeline on one device, in one mode.
pub struct SdPipeline {
    mode: EngineMode,
    device: Device,
    /// Where the text encoder lives; host memory when offloaded.
    text_device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    clip: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl SdPipeline {
    /// Download (or reuse from the hub cache) and load all pipeline weights.
    /// The optimization options are baked in here and never change for the
    /// lifetime of the pipeline.
    pub fn load(
        model_id: &str,
        mode: EngineMode,
        profile: &DeviceProfile,
        options: &EngineOptions,
    ) -> Result<Self> {
        let device = profile.device.clone();
        let text_device = if options.offload_text_encoder {
            Device::Cpu
        } else {
            device.clone()
        };
        let dtype = if options.half_precision {
            DType::F16
        } else {
            DType::F32
        };
        let sliced_attention = options.sliced_attention.then_some(ATTENTION_SLICE);
        let sd_config = StableDiffusionConfig::v1_5(sliced_attention, None, None);

        info!(model_id, ?mode, "loading stable diffusion pipeline");
        let api = hf_hub::api::sync::Api::new().context("failed to create hub API")?;
        let repo = api.model(model_id.to_string());

        let tokenizer_file = api
            .model(CLIP_TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(anyhow::Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = sd_config
            .clip
            .pad_with
            .clone()
            .unwrap_or_else(|| "<|endoftext|>".to_string());
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .with_context(|| format!("tokenizer is missing the pad token {pad_token}"))?;

        let clip_weights = repo
            .get("text_encoder/model.safetensors")
            .context("failed to get text encoder weights")?;
        // The text encoder stays in F32; embeddings are converted on the way
        // into the UNet.
        let clip = stable_diffusion::build_clip_transformer(
            &sd_config.clip,
            clip_weights,
            &text_device,
            DType::F32,
        )
        .context("failed to load text encoder")?;

        let vae_weights = repo
            .get("vae/diffusion_pytorch_model.safetensors")
            .context("failed to get VAE weights")?;
        let vae = sd_config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to load VAE")?;

        let unet_weights = repo
            .get("unet/diffusion_pytorch_model.safetensors")
            .context("failed to get UNet weights")?;
        let unet = sd_config
            .build_unet(
                unet_weights,
                &device,
                LATENT_CHANNELS,
                cfg!(feature = "flash-attn"),
                dtype,
            )
            .context("failed to load UNet")?;

        info!(model_id, "stable diffusion pipeline ready");
        Ok(Self {
            mode,
            device,
            text_device,
            dtype,
            sd_config,
            tokenizer,
            pad_id,
            clip,
            unet,
            vae,
        })
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(anyhow::Error::msg)
            .context("failed to tokenize prompt")?
            .get_ids()
            .to_vec();
        // The budgeter keeps prompts inside the window; hard-clamp anyway
        // since overrunning the position embeddings is a tensor error.
        let window = self.sd_config.clip.max_position_embeddings;
        tokens.truncate(window);
        tokens.resize(window, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.text_device)?.unsqueeze(0)?;
        Ok(self.clip.forward(&tokens)?)
    }

    /// Classifier-free guidance embeddings: `[negative, positive]` stacked on
    /// the batch axis when guidance is on, positive only otherwise.
    fn text_embeddings(
        &self,
        prompt: &str,
        negative_prompt: &str,
        use_guidance: bool,
    ) -> Result<Tensor> {
        let positive = self.encode_prompt(prompt)?;
        let embeddings = if use_guidance {
            let negative = self.encode_prompt(negative_prompt)?;
            Tensor::cat(&[negative, positive], 0)?
        } else {
            positive
        };
        Ok(embeddings.to_device(&self.device)?.to_dtype(self.dtype)?)
    }
}

impl EngineLike for SdPipeline {
    fn run(&self, job: &EngineJob) -> Result<DynamicImage> {
        if matches!(self.mode, EngineMode::ImageToImage) && job.reference.is_none() {
            anyhow::bail!("image-conditioned pipeline requires a reference image");
        }

        if let Some(seed) = job.seed {
            self.device.set_seed(seed)?;
        }

        let mut scheduler = self.sd_config.build_scheduler(job.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let use_guidance = job.guidance_scale > 1.0;
        let embeddings = self.text_embeddings(job.prompt, job.negative_prompt, use_guidance)?;
        let latent_height = job.height / 8;
        let latent_width = job.width / 8;

        let (mut latents, t_start) = match job.reference {
            None => {
                let noise = Tensor::randn(
                    0f32,
                    1f32,
                    (1, LATENT_CHANNELS, latent_height, latent_width),
                    &self.device,
                )?
                .to_dtype(self.dtype)?;
                ((noise * scheduler.init_noise_sigma())?, 0)
            }
            Some(reference) => {
                let image = image_to_tensor(reference.image, job.width, job.height)?
                    .to_device(&self.device)?
                    .to_dtype(self.dtype)?;
                let init_latent = (self.vae.encode(&image)?.sample()? * VAE_SCALE)?;
                // Skip the share of the schedule the reference already
                // provides; strength 1.0 denoises from scratch.
                let skipped = (job.steps as f32 * reference.strength) as usize;
                let t_start = job
                    .steps
                    .saturating_sub(skipped)
                    .min(job.steps.saturating_sub(1));
                let noise = init_latent.randn_like(0f64, 1f64)?;
                let latents = scheduler.add_noise(&init_latent, noise, timesteps[t_start])?;
                (latents, t_start)
            }
        };

        debug!(steps = job.steps, t_start, "denoising");
        for (index, &timestep) in timesteps.iter().enumerate() {
            if index < t_start {
                continue;
            }
            let latent_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&latent_input, timestep as f64, &embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * job.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        let decoded = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let pixels = ((decoded / 2.)? + 0.5)?.clamp(0f32, 1f32)?;
        let pixels = (pixels.to_dtype(DType::F32)? * 255.)?
            .to_dtype(DType::U8)?
            .i(0)?;
        tensor_to_image(&pixels.to_device(&Device::Cpu)?)
    }
}
