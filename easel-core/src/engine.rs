//! The inference engine boundary.
//!
//! The orchestration layer never touches tensors directly: it hands a fully
//! parameterized job to an [`EngineLike`] and gets pixels back. Engines are
//! built by an [`EngineFactory`], which lets tests substitute deterministic
//! stubs for the candle-backed implementation in [`crate::sd`].

use std::sync::Arc;

use image::DynamicImage;

/// Which pipeline an engine was constructed for. A handle is bound to one
/// mode (and one model id and device) for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    TextToImage,
    ImageToImage,
}

/// Memory-oriented construction flags. Applied exactly once when an engine is
/// built; they cannot be toggled afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineOptions {
    /// Compute attention in slices to bound peak memory.
    pub sliced_attention: bool,
    /// Load weights in F16 rather than F32.
    pub half_precision: bool,
    /// Keep the text encoder in host memory, moving only embeddings to the
    /// accelerator.
    pub offload_text_encoder: bool,
}

/// Reference image conditioning for image-to-image jobs. `strength` is the
/// fraction of the denoising process allowed to deviate from the reference:
/// low values stay close to it, values near 1.0 behave like unconditioned
/// generation.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceInput<'a> {
    pub image: &'a DynamicImage,
    pub strength: f32,
}

/// One generation invocation, fully parameterized by the caller.
#[derive(Debug, Clone, Copy)]
pub struct EngineJob<'a> {
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub steps: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
    pub seed: Option<u64>,
    pub reference: Option<ReferenceInput<'a>>,
}

pub trait EngineLike: Send + Sync {
    fn run(&self, job: &EngineJob) -> anyhow::Result<DynamicImage>;
}

pub trait EngineFactory: Send + Sync {
    fn construct(
        &self,
        model_id: &str,
        mode: EngineMode,
        options: &EngineOptions,
    ) -> anyhow::Result<Arc<dyn EngineLike>>;
}
