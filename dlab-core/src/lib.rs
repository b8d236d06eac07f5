#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod auth;
pub mod config;
pub mod device_map;
pub mod error;
pub mod loader;
mod loader_factory;
pub mod output;
pub mod scheduler;
pub mod session;
mod util;

mod stable_diffusion;

pub use auth::{AuthStatus, Credentials, HfHubAuthenticator, HubAuthenticator, TokenSource};
pub use config::LabConfig;
pub use device_map::*;
pub use error::{LabError, Result};
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use scheduler::{Scheduler, SchedulerChoice, SchedulerKind, SchedulerParams};
use serde::{Deserialize, Serialize};
pub use session::{GenerationResult, LabSession, ModelInfo, PipelineState, SchedulerComparison};
pub use stable_diffusion::{StableDiffusionLoader, StableDiffusionPipeline};
pub(crate) use util::*;

pub const DEFAULT_MODEL_ID: &str = "runwayml/stable-diffusion-v1-5";

fn default_steps() -> usize {
    50
}

fn default_guidance() -> f64 {
    7.5
}

fn default_size() -> usize {
    512
}

/// One text-to-image request. Built once and consumed by a single generation.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_guidance")]
    pub guidance_scale: f64,
    #[serde(default = "default_size")]
    pub width: usize,
    #[serde(default = "default_size")]
    pub height: usize,
    /// Fixes the starting noise. With DDIM or UniPC the image is reproducible
    /// on every device. DDPM and Euler Ancestral also draw noise during
    /// denoising from the device RNG, which candle cannot seed on the CPU, so
    /// their CPU output still varies between runs.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            steps: default_steps(),
            guidance_scale: default_guidance(),
            width: default_size(),
            height: default_size(),
            seed: None,
        }
    }

    pub fn with_negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative_prompt.into());
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    pub fn with_size(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Classifier-free guidance only makes a difference above 1.
    pub fn uses_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.prompt.trim().is_empty() {
            return Err("prompt must not be empty".to_string());
        }
        if self.steps == 0 {
            return Err("steps must be positive".to_string());
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(format!(
                "guidance scale must be a non-negative number, got {}",
                self.guidance_scale
            ));
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 || value % 8 != 0 {
                return Err(format!("{name} must be a positive multiple of 8, got {value}"));
            }
        }
        Ok(())
    }
}

/// A loaded text-to-image pipeline.
pub trait DiffusionPipeline: Send {
    /// Run one generation. Pipelines may return more than one image.
    ///
    /// Seeded requests are only as reproducible as the active scheduler
    /// allows, see [`GenerationRequest::seed`].
    fn run(&mut self, request: &GenerationRequest) -> anyhow::Result<Vec<DynamicImage>>;

    fn scheduler(&self) -> &Scheduler;

    /// Install `scheduler` and hand back the one it replaces.
    fn replace_scheduler(&mut self, scheduler: Scheduler) -> Scheduler;

    fn components(&self) -> Vec<String>;
}
