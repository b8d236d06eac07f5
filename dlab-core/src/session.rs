//! The lab session: one device, one set of credentials, at most one loaded
//! pipeline.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
};

use image::DynamicImage;
use serde::{ser::SerializeStruct, Serialize, Serializer};

use crate::{
    auth, loader_factory::HubPipelineLoader, output, AuthStatus, Credentials, DiffusionPipeline,
    GenerationRequest, HfHubAuthenticator, HubAuthenticator, LabConfig, LabError, LoadOptions,
    PipelineLoader, ResolvedDevice, Result, Scheduler, SchedulerChoice,
};

pub enum PipelineState {
    Unloaded,
    Loaded {
        pipeline: Box<dyn DiffusionPipeline>,
        model_id: String,
    },
}

impl PipelineState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }
}

impl fmt::Debug for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => write!(f, "Unloaded"),
            Self::Loaded { model_id, .. } => f.debug_struct("Loaded").field("model_id", model_id).finish(),
        }
    }
}

/// An image together with the request that produced it.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub image: DynamicImage,
    pub request: GenerationRequest,
}

impl GenerationResult {
    pub fn into_image(self) -> DynamicImage {
        self.image
    }
}

/// Images from a scheduler comparison, with the scheduler names as titles.
/// Both vectors follow the order of the requested names.
#[derive(Debug, Clone, Default)]
pub struct SchedulerComparison {
    pub images: Vec<DynamicImage>,
    pub titles: Vec<String>,
}

/// Serializes as the string `No model loaded` before a load, otherwise as an
/// object with the loaded pipeline's details.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelInfo {
    NotLoaded,
    Loaded {
        model_id: String,
        device: String,
        scheduler: String,
        components: Vec<String>,
    },
}

impl Serialize for ModelInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::NotLoaded => serializer.serialize_str(&self.to_string()),
            Self::Loaded {
                model_id,
                device,
                scheduler,
                components,
            } => {
                let mut info = serializer.serialize_struct("ModelInfo", 4)?;
                info.serialize_field("model_id", model_id)?;
                info.serialize_field("device", device)?;
                info.serialize_field("scheduler", scheduler)?;
                info.serialize_field("components", components)?;
                info.end()
            }
        }
    }
}

impl fmt::Display for ModelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLoaded => write!(f, "No model loaded"),
            Self::Loaded {
                model_id,
                device,
                scheduler,
                components,
            } => {
                writeln!(f, "  model_id: {model_id}")?;
                writeln!(f, "  device: {device}")?;
                writeln!(f, "  scheduler: {scheduler}")?;
                write!(f, "  components: {}", components.join(", "))
            }
        }
    }
}

pub struct LabSession {
    device: ResolvedDevice,
    credentials: Credentials,
    auth_status: AuthStatus,
    output_dir: PathBuf,
    load_options: LoadOptions,
    loader: Box<dyn PipelineLoader>,
    state: PipelineState,
}

impl LabSession {
    /// Build a session that authenticates against and loads from the Hugging Face hub.
    pub fn new(config: LabConfig) -> Self {
        Self::with_components(config, &HfHubAuthenticator::default(), Box::new(HubPipelineLoader::new()))
    }

    pub fn with_components(
        config: LabConfig,
        authenticator: &dyn HubAuthenticator,
        loader: Box<dyn PipelineLoader>,
    ) -> Self {
        let device = config.device.resolve();
        let credentials = config.credentials();
        let auth_status = auth::authenticate(&credentials, authenticator);

        tracing::info!(%device, "diffusion lab initialized");

        Self {
            device,
            credentials,
            auth_status,
            output_dir: config.output_dir,
            load_options: config.load_options,
            loader,
            state: PipelineState::Unloaded,
        }
    }

    pub fn device(&self) -> ResolvedDevice {
        self.device
    }

    pub fn auth_status(&self) -> &AuthStatus {
        &self.auth_status
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn current_model(&self) -> Option<&str> {
        match &self.state {
            PipelineState::Loaded { model_id, .. } => Some(model_id),
            PipelineState::Unloaded => None,
        }
    }

    /// Load `model_id` with the session's load options.
    pub fn load_model(&mut self, model_id: &str) -> Result<()> {
        let options = self.load_options.clone();
        self.load_model_with(model_id, &options)
    }

    /// Load `model_id`, replacing any pipeline already loaded. On failure the
    /// previous state is kept.
    pub fn load_model_with(&mut self, model_id: &str, options: &LoadOptions) -> Result<()> {
        tracing::info!(model = %model_id, "loading model");
        match self
            .loader
            .load(model_id, self.device, &self.credentials, options)
        {
            Ok(pipeline) => {
                self.state = PipelineState::Loaded {
                    pipeline,
                    model_id: model_id.to_string(),
                };
                tracing::info!(model = %model_id, "model loaded successfully");
                Ok(())
            }
            Err(source) => {
                tracing::error!(model = %model_id, error = %format!("{source:#}"), "failed to load model");
                Err(LabError::PipelineLoad {
                    model_id: model_id.to_string(),
                    source,
                })
            }
        }
    }

    fn pipeline_mut(&mut self) -> Result<&mut dyn DiffusionPipeline> {
        match &mut self.state {
            PipelineState::Loaded { pipeline, .. } => Ok(pipeline.as_mut()),
            PipelineState::Unloaded => {
                tracing::error!("no model loaded, call load_model() first");
                Err(LabError::NoModelLoaded)
            }
        }
    }

    /// Generate one image. Extra images returned by the pipeline are dropped.
    pub fn generate_image(&mut self, request: GenerationRequest) -> Result<GenerationResult> {
        let pipeline = self.pipeline_mut()?;
        let image = run_generation(pipeline, &request)?;
        Ok(GenerationResult { image, request })
    }

    /// Generate `request` once per named scheduler. Unknown names and failed
    /// runs are skipped with a warning; the original scheduler is always
    /// restored.
    pub fn compare_schedulers<S: AsRef<str>>(
        &mut self,
        request: &GenerationRequest,
        schedulers: &[S],
    ) -> Result<SchedulerComparison> {
        let device = self.device;
        let pipeline = self.pipeline_mut()?;
        let mut pipeline = SchedulerRestore::new(pipeline);
        let mut comparison = SchedulerComparison::default();

        for name in schedulers {
            let name = name.as_ref();
            let kind = match SchedulerChoice::from_name(name) {
                SchedulerChoice::Known(kind) => kind,
                SchedulerChoice::Unrecognized(name) => {
                    tracing::warn!(scheduler = %name, "unknown scheduler, skipping");
                    continue;
                }
            };

            let fresh = Scheduler::from_config(kind, pipeline.original());
            pipeline.replace_scheduler(fresh);
            tracing::info!(scheduler = %kind, "generating with scheduler");
            if kind.is_stochastic() && !device.is_accelerator() {
                tracing::info!(scheduler = %kind, "stochastic scheduler on CPU, output varies between runs");
            }
            match run_generation(&mut *pipeline, request) {
                Ok(image) => {
                    comparison.images.push(image);
                    comparison.titles.push(kind.to_string());
                }
                Err(e) => tracing::warn!(scheduler = %kind, error = %e, "failed to use scheduler"),
            }
        }

        Ok(comparison)
    }

    pub fn get_model_info(&self) -> ModelInfo {
        match &self.state {
            PipelineState::Unloaded => ModelInfo::NotLoaded,
            PipelineState::Loaded { pipeline, model_id } => ModelInfo::Loaded {
                model_id: model_id.clone(),
                device: self.device.to_string(),
                scheduler: pipeline.scheduler().kind.to_string(),
                components: pipeline.components(),
            },
        }
    }

    /// Save into the session's output directory.
    pub fn save_image(&self, image: &DynamicImage, filename: &str) -> Result<PathBuf> {
        output::save_image(image, &self.output_dir, filename)
    }

    pub fn display_image(&self, image: &DynamicImage, title: &str) -> Result<()> {
        output::display_image(image, title).inspect_err(|e| {
            tracing::warn!(error = %e, "could not display image");
        })
    }
}

fn run_generation(
    pipeline: &mut dyn DiffusionPipeline,
    request: &GenerationRequest,
) -> Result<DynamicImage> {
    request.validate().map_err(|reason| {
        tracing::error!(%reason, "invalid generation request");
        LabError::InvalidRequest(reason)
    })?;

    tracing::info!(prompt = %request.prompt, steps = request.steps, seed = ?request.seed, "generating image");
    let images = pipeline.run(request).map_err(|e| {
        tracing::error!(error = %format!("{e:#}"), "generation failed");
        LabError::Generation(e)
    })?;
    let image = images.into_iter().next().ok_or_else(|| {
        tracing::error!("pipeline produced no images");
        LabError::EmptyOutput
    })?;
    tracing::info!("image generated successfully");
    Ok(image)
}

/// Puts a pipeline's scheduler back when dropped, whatever happened in between.
struct SchedulerRestore<'a> {
    pipeline: &'a mut dyn DiffusionPipeline,
    original: Option<Scheduler>,
}

impl<'a> SchedulerRestore<'a> {
    fn new(pipeline: &'a mut dyn DiffusionPipeline) -> Self {
        let original = Some(pipeline.scheduler().clone());
        Self { pipeline, original }
    }

    fn original(&self) -> &Scheduler {
        self.original
            .as_ref()
            .unwrap_or_else(|| self.pipeline.scheduler())
    }
}

impl<'a> Deref for SchedulerRestore<'a> {
    type Target = dyn DiffusionPipeline + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.pipeline
    }
}

impl DerefMut for SchedulerRestore<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.pipeline
    }
}

impl Drop for SchedulerRestore<'_> {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            self.pipeline.replace_scheduler(original);
        }
    }
}
