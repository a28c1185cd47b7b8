use thiserror::Error;

/// Failures surfaced by the generation service.
///
/// Everything the engines or the hub can throw is folded into one of these
/// variants at the orchestration boundary; callers never see a panic or a
/// partially generated image.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no model loaded")]
    NoModelLoaded,

    #[error("failed to load model {model_id}: {reason}")]
    ModelLoad { model_id: String, reason: String },

    #[error("image generation failed: {0}")]
    Generation(String),
}

impl Error {
    pub(crate) fn model_load(model_id: &str, source: anyhow::Error) -> Self {
        Self::ModelLoad {
            model_id: model_id.to_string(),
            reason: format!("{source:#}"),
        }
    }

    pub(crate) fn generation(source: anyhow::Error) -> Self {
        Self::Generation(format!("{source:#}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
