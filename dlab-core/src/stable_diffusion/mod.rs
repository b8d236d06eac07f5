use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self as sd, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::{api::sync::Api, Repo, RepoType};
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;

use crate::{
    batch_to_images, loader_factory::StableDiffusionVersion, precision_for, select_best_device,
    DiffusionPipeline, GenerationRequest, LoadOptions, Loader, ModelVariant, ResolvedDevice,
    Scheduler,
};

/// Repository holding the CLIP tokenizer shared by Stable Diffusion 1.x and 2.x.
const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

impl StableDiffusionVersion {
    fn config(&self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
        }
    }

    /// Scheduler used when the model ships no readable scheduler config.
    fn default_scheduler(&self) -> Scheduler {
        let mut scheduler = Scheduler::default();
        if let Self::V2_1 = self {
            scheduler.params.prediction_type = crate::scheduler::PredictionKind::VPrediction;
        }
        scheduler
    }

    fn vae_scale(&self) -> f64 {
        0.18215
    }

    // Half the attention head dimension, like the hub's "auto" slicing.
    fn attention_slice_size(&self) -> usize {
        4
    }
}

pub struct StableDiffusionPipeline {
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_tokens: usize,
    clip_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    vae_scale: f64,
    scheduler: Scheduler,
}

impl StableDiffusionPipeline {
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)? // Encode the prompt
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_tokens {
            tracing::warn!(
                tokens = tokens.len(),
                max = self.max_tokens,
                "prompt is too long for CLIP, truncating"
            );
            tokens.truncate(self.max_tokens);
        }
        tokens.resize(self.max_tokens, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&tokens)?)
    }

    fn initial_latents(&self, request: &GenerationRequest, init_noise_sigma: f64) -> Result<Tensor> {
        let shape = (1, 4, request.height / 8, request.width / 8);
        let latents = match request.seed {
            Some(seed) => seeded_latents(seed, shape, &self.device)?,
            None => Tensor::randn(0f32, 1f32, shape, &self.device)?,
        };
        Ok((latents * init_noise_sigma)?.to_dtype(self.dtype)?)
    }
}

/// Standard normal latents drawn from a `StdRng`, so the starting noise does not
/// depend on the device's random source.
fn seeded_latents(
    seed: u64,
    shape: (usize, usize, usize, usize),
    device: &Device,
) -> candle_core::Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let count = shape.0 * shape.1 * shape.2 * shape.3;
    let values: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_vec(values, shape, device)
}

impl DiffusionPipeline for StableDiffusionPipeline {
    fn run(&mut self, request: &GenerationRequest) -> Result<Vec<DynamicImage>> {
        let mut scheduler = self
            .scheduler
            .build(request.steps)
            .context("failed to build scheduler")?;

        // Stochastic schedulers draw from the device rng, which the CPU backend cannot seed.
        if let (Some(seed), false) = (request.seed, self.device.is_cpu()) {
            self.device.set_seed(seed)?;
        }

        // --- Compute CLIP embeddings, unconditional first when guiding ---
        let use_guidance = request.uses_guidance();
        let text_embeddings = self.encode_prompt(&request.prompt)?;
        let text_embeddings = if use_guidance {
            let uncond_embeddings =
                self.encode_prompt(request.negative_prompt.as_deref().unwrap_or(""))?;
            Tensor::cat(&[uncond_embeddings, text_embeddings], 0)?
        } else {
            text_embeddings
        }
        .to_dtype(self.dtype)?;

        // --- Denoise ---
        let mut latents = self.initial_latents(request, scheduler.init_noise_sigma())?;
        let timesteps = scheduler.timesteps().to_vec();
        for (step, &timestep) in timesteps.iter().enumerate() {
            let latent_model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
                (noise_pred_uncond
                    + ((noise_pred_text - noise_pred_uncond)? * request.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            tracing::debug!(step = step + 1, total = timesteps.len(), "denoising step");
        }

        // --- Decode the latents and rescale to u8 ---
        let decoded = self.vae.decode(&(&latents / self.vae_scale)?)?;
        let img = ((decoded.to_dtype(DType::F32)? / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let img = (img.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;
        batch_to_images(&img)
    }

    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn replace_scheduler(&mut self, scheduler: Scheduler) -> Scheduler {
        std::mem::replace(&mut self.scheduler, scheduler)
    }

    fn components(&self) -> Vec<String> {
        ["tokenizer", "text_encoder", "unet", "vae", "scheduler"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionPipeline;

    fn load(
        model_id: &str,
        variant: ModelVariant,
        api: &Api,
        device: ResolvedDevice,
        options: &LoadOptions,
    ) -> Result<Self::Model> {
        let ModelVariant::StableDiffusion(version) = variant;

        // Configure device.
        let dtype = precision_for(device);
        let device = select_best_device(device).context("failed to set up device")?;

        let sliced_attention_size = if options.attention_slicing && !options.use_flash_attn {
            Some(version.attention_slice_size())
        } else {
            None
        };
        let sd_config = version.config(sliced_attention_size);
        tracing::info!(?version, ?dtype, ?sliced_attention_size, "building pipeline");

        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            options.revision.clone(),
        ));
        let weights = |stem: &str| {
            if dtype == DType::F16 && options.fp16_weights {
                format!("{stem}.fp16.safetensors")
            } else {
                format!("{stem}.safetensors")
            }
        };

        // --- Load CLIP tokenizer and text encoder ---
        let tokenizer_filename = api
            .model(TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = sd_config
            .clip
            .pad_with
            .clone()
            .unwrap_or_else(|| "<|endoftext|>".to_string());
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .with_context(|| format!("tokenizer has no {pad_token:?} token"))?;

        let clip_model_file = repo
            .get(&weights("text_encoder/model"))
            .context("failed to get text encoder weights")?;
        let clip_model =
            sd::build_clip_transformer(&sd_config.clip, clip_model_file, &device, DType::F32)
                .context("failed to load text encoder")?;

        // --- Load U-Net and autoencoder ---
        let unet_file = repo
            .get(&weights("unet/diffusion_pytorch_model"))
            .context("failed to get unet weights")?;
        let unet = sd_config
            .build_unet(unet_file, &device, 4, options.use_flash_attn, dtype)
            .context("failed to load unet")?;
        let vae_file = repo
            .get(&weights("vae/diffusion_pytorch_model"))
            .context("failed to get vae weights")?;
        let vae = sd_config
            .build_vae(vae_file, &device, dtype)
            .context("failed to load vae")?;

        // --- Scheduler config, optional ---
        let scheduler = match repo
            .get("scheduler/scheduler_config.json")
            .map_err(Error::from)
            .and_then(|path| Ok(std::fs::read_to_string(path)?))
            .and_then(|json| Scheduler::from_hub_config(&json))
        {
            Ok(scheduler) => scheduler,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "no usable scheduler config, using defaults");
                version.default_scheduler()
            }
        };

        Ok(StableDiffusionPipeline {
            device,
            dtype,
            tokenizer,
            pad_id,
            max_tokens: sd_config.clip.max_position_embeddings,
            clip_model,
            unet,
            vae,
            vae_scale: version.vae_scale(),
            scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(latents: &Tensor) -> candle_core::Result<Vec<f32>> {
        latents.flatten_all()?.to_vec1::<f32>()
    }

    #[test]
    fn seeded_latents_repeat_for_the_same_seed() -> candle_core::Result<()> {
        let shape = (1, 4, 8, 8);
        let first = seeded_latents(123, shape, &Device::Cpu)?;
        let second = seeded_latents(123, shape, &Device::Cpu)?;
        assert_eq!(first.dims4()?, shape);
        assert_eq!(values(&first)?, values(&second)?);

        let other = seeded_latents(124, shape, &Device::Cpu)?;
        assert_ne!(values(&first)?, values(&other)?);
        Ok(())
    }

    #[test]
    fn seeded_latents_look_standard_normal() -> candle_core::Result<()> {
        let values = values(&seeded_latents(7, (1, 4, 64, 64), &Device::Cpu)?)?;
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
        Ok(())
    }
}
