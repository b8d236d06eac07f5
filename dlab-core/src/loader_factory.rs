use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::ApiBuilder;

use crate::{
    Credentials, DiffusionPipeline, Loader, LoadOptions, PipelineLoader, ResolvedDevice,
    StableDiffusionLoader,
};

/// Enum of supported model types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    StableDiffusion,
    StableDiffusionXl,
    Flux,
}

impl ModelType {
    /// Detect model type from model name. Unknown names are assumed to be
    /// Stable Diffusion fine-tunes, which is what most hub text-to-image
    /// checkpoints are.
    pub fn from_name(model_name: &str) -> Self {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            ModelType::Flux
        } else if name_upper.contains("XL") || name_upper.contains("TURBO") {
            ModelType::StableDiffusionXl
        } else {
            ModelType::StableDiffusion
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVersion {
    V1_5,
    V2_1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    StableDiffusion(StableDiffusionVersion),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        match ModelType::from_name(model_name) {
            ModelType::StableDiffusion => Some(ModelVariant::StableDiffusion(
                if ["2-1", "2.1", "2-BASE", "V2"]
                    .iter()
                    .any(|tag| name_upper.contains(tag))
                {
                    StableDiffusionVersion::V2_1
                } else {
                    StableDiffusionVersion::V1_5 // Default to 1.5 if no specific version is found
                },
            )),
            _ => None,
        }
    }
}

/// Fetches pipelines from the Hugging Face hub, or its local cache.
#[derive(Debug, Clone, Default)]
pub struct HubPipelineLoader {
    progress: bool,
}

impl HubPipelineLoader {
    pub fn new() -> Self {
        Self { progress: true }
    }
}

impl PipelineLoader for HubPipelineLoader {
    fn load(
        &self,
        model_id: &str,
        device: ResolvedDevice,
        credentials: &Credentials,
        options: &LoadOptions,
    ) -> Result<Box<dyn DiffusionPipeline>> {
        let mut builder = ApiBuilder::new().with_progress(self.progress);
        if let Some(token) = credentials.token() {
            builder = builder.with_token(Some(token.to_string()));
        }
        let api = builder.build().context("failed to create hf hub API")?;
        load_model(model_id, &api, device, options)
    }
}

/// Load a model based on its name, automatically detecting the appropriate loader
pub fn load_model(
    model_id: &str,
    api: &hf_hub::api::sync::Api,
    device: ResolvedDevice,
    options: &LoadOptions,
) -> Result<Box<dyn DiffusionPipeline>> {
    let model_type = ModelType::from_name(model_id);

    tracing::info!(
        model = %model_id,
        model_type = ?model_type,
        device = %device,
        "loading model"
    );

    match (model_type, ModelVariant::from_name(model_id)) {
        (ModelType::StableDiffusion, Some(variant)) => {
            let model = StableDiffusionLoader::load(model_id, variant, api, device, options)?;
            Ok(Box::new(model))
        }
        _ => Err(anyhow!(
            "Model type {:?} is recognized but not yet implemented",
            model_type
        )),
    }
}
