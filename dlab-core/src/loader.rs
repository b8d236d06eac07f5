use anyhow::Result;
use hf_hub::api::sync::Api;
use serde::{Deserialize, Serialize};

use crate::{Credentials, DiffusionPipeline, ModelVariant, ResolvedDevice};

/// Knobs applied while a pipeline is being built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Hub revision (branch, tag or commit) to fetch.
    pub revision: String,
    /// Compute attention in slices to lower peak memory.
    pub attention_slicing: bool,
    /// Use flash attention in the U-Net. Takes precedence over slicing.
    pub use_flash_attn: bool,
    /// Fetch the `.fp16.safetensors` weights when running in half precision.
    pub fp16_weights: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            revision: "main".to_string(),
            attention_slicing: true,
            use_flash_attn: false,
            fp16_weights: true,
        }
    }
}

/// Builds one family of pipelines from hub artifacts.
pub trait Loader {
    type Model: DiffusionPipeline;

    fn load(
        model_id: &str,
        variant: ModelVariant,
        api: &Api,
        device: ResolvedDevice,
        options: &LoadOptions,
    ) -> Result<Self::Model>
    where
        Self: Sized;
}

/// Produces a ready pipeline for a model identifier. The session owns one and
/// calls it on every `load_model`.
pub trait PipelineLoader {
    fn load(
        &self,
        model_id: &str,
        device: ResolvedDevice,
        credentials: &Credentials,
        options: &LoadOptions,
    ) -> Result<Box<dyn DiffusionPipeline>>;
}
