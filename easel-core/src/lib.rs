//! Core orchestration for the easel image generation service: style presets,
//! prompt budgeting, model residency, and the two generation modes. The HTTP
//! surface lives in `easel-server`; the diffusion math lives behind the
//! [`EngineLike`] boundary.

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod budget;
pub mod device;
pub mod engine;
pub mod error;
pub mod residency;
pub mod sd;
pub mod service;
pub mod style;
mod util;

pub use budget::{LengthEstimator, PromptBudgeter, WhitespaceEstimator, DEFAULT_PROMPT_BUDGET};
pub use device::{DeviceKind, DevicePreference, DeviceProfile};
pub use engine::{EngineFactory, EngineJob, EngineLike, EngineMode, EngineOptions, ReferenceInput};
pub use error::{Error, Result};
pub use residency::{ModelPool, ResidentEngine};
pub use sd::SdEngineFactory;
pub use service::{
    GenerationMetadata, GenerationOutput, GenerationRequest, ImageService, MemoryUsage,
    ServiceConfig, ServiceStatus, DEFAULT_REFERENCE_STRENGTH,
};
pub use style::{StylePreset, StyleRegistry, DEFAULT_MODEL_ID};
