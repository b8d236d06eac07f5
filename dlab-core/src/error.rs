use std::path::PathBuf;

/// Failures that stop a lab operation.
///
/// Credential problems and unknown scheduler names are not represented here:
/// they are logged and the operation carries on.
#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error("no model loaded, call load_model() first")]
    NoModelLoaded,

    #[error("failed to load model {model_id}: {source:#}")]
    PipelineLoad {
        model_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("generation failed: {0:#}")]
    Generation(#[source] anyhow::Error),

    #[error("pipeline produced no images")]
    EmptyOutput,

    #[error("failed to save image to {}: {source}", path.display())]
    SaveImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to display image: {0}")]
    Display(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, LabError>;
