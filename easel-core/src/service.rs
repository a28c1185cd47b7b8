//! Generation orchestration.
//!
//! [`ImageService`] is the explicit service context: it owns the style table,
//! the prompt budgeter, the model pool, and the lazily built reference
//! engine. One instance is constructed at startup and shared behind an `Arc`
//! for the life of the process.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::budget::{PromptBudgeter, DEFAULT_PROMPT_BUDGET};
use crate::device::DeviceProfile;
use crate::engine::{EngineFactory, EngineJob, EngineMode, ReferenceInput};
use crate::error::{Error, Result};
use crate::residency::{ModelPool, ResidentEngine};
use crate::style::{StylePreset, StyleRegistry};
use crate::util::image_to_png;

/// Strength applied when an image-conditioned request does not specify one;
/// balances character consistency against scene variety.
pub const DEFAULT_REFERENCE_STRENGTH: f32 = 0.7;

/// Image conditioning needs less denoising than pure text-to-image, but too
/// few steps degrades badly.
const MIN_REFERENCE_STEPS: usize = 15;
const REFERENCE_STEP_FACTOR: f32 = 0.8;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub style: String,
    pub seed: Option<u64>,
    /// Encoded reference image (any format the `image` crate decodes).
    pub reference_image: Option<Vec<u8>>,
    /// Must lie in [0.1, 1.0] when present.
    pub strength: Option<f32>,
}

impl GenerationRequest {
    pub fn text(prompt: impl Into<String>, style: impl Into<String>, seed: Option<u64>) -> Self {
        Self {
            prompt: prompt.into(),
            style: style.into(),
            seed,
            reference_image: None,
            strength: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GenerationMetadata {
    pub model_id: String,
    pub style: String,
    pub step_count: usize,
    pub guidance_scale: f64,
    pub resolution: String,
    pub prompt_truncated: bool,
    pub character_based: bool,
    pub device: String,
}

/// A successful generation: PNG bytes plus the parameters that produced them.
/// Failures are reported through [`Error`] and never carry image bytes.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub image_png: Vec<u8>,
    pub metadata: GenerationMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryUsage {
    pub accelerator_bytes: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub ready: bool,
    pub device: String,
    pub model_id: Option<String>,
    pub cached_models: Vec<String>,
    pub residency_capacity: usize,
    /// Model id the reference engine was built against, when one exists. May
    /// lag behind `model_id` after a switch; see [`ImageService::generate_from_reference`].
    pub reference_engine_model_id: Option<String>,
    pub memory_usage: MemoryUsage,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub prompt_budget: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            prompt_budget: DEFAULT_PROMPT_BUDGET,
        }
    }
}

pub struct ImageService {
    styles: StyleRegistry,
    budgeter: PromptBudgeter,
    pool: ModelPool,
    factory: Arc<dyn EngineFactory>,
    /// Process-lifetime slot for the single image-conditioned engine.
    reference_engine: RwLock<Option<ResidentEngine>>,
}

impl ImageService {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        profile: DeviceProfile,
        config: ServiceConfig,
    ) -> Self {
        Self {
            styles: StyleRegistry::new(),
            budgeter: PromptBudgeter::new(config.prompt_budget),
            pool: ModelPool::new(factory.clone(), profile),
            factory,
            reference_engine: RwLock::new(None),
        }
    }

    /// Load or switch the active text-to-image model.
    pub fn load_model(&self, model_id: &str) -> Result<()> {
        self.pool.load(model_id)
    }

    pub fn styles(&self) -> &StyleRegistry {
        &self.styles
    }

    /// Generate an image from a prompt and style preset.
    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        if request.prompt.trim().is_empty() {
            return Err(Error::InvalidArgument("prompt is required".to_string()));
        }
        let engine = self.pool.active().ok_or(Error::NoModelLoaded)?;
        let preset = self.styles.get(&request.style);

        let full_prompt = format!("{}, {}", preset.positive_fragment, request.prompt);
        let (prompt, truncated) = self.budgeter.budget(&full_prompt);

        info!(
            style = preset.name,
            model_id = engine.model_id(),
            seed = request.seed,
            prompt_truncated = truncated,
            "generating image"
        );
        let job = EngineJob {
            prompt: &prompt,
            negative_prompt: preset.negative_fragment,
            steps: preset.step_count,
            guidance_scale: preset.guidance_scale,
            width: preset.width,
            height: preset.height,
            seed: request.seed,
            reference: None,
        };
        let image = engine.run(&job).map_err(|source| {
            error!(style = preset.name, "generation failed: {source:#}");
            Error::generation(source)
        })?;

        self.finish(&engine, preset, preset.step_count, truncated, false, &image)
    }

    /// Generate a scene anchored to a reference image, keeping the depicted
    /// character consistent across generations.
    ///
    /// The image-conditioned engine is built lazily on first use against the
    /// model active at that moment and is then kept for the process lifetime:
    /// switching the primary model does not refresh it, so scenes keep coming
    /// from the first-use model until restart. The binding is observable via
    /// [`ServiceStatus::reference_engine_model_id`] and the result metadata.
    pub fn generate_from_reference(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        let reference_bytes = request
            .reference_image
            .as_deref()
            .ok_or_else(|| Error::InvalidArgument("reference image is required".to_string()))?;
        let strength = request.strength.unwrap_or(DEFAULT_REFERENCE_STRENGTH);
        if !(0.1..=1.0).contains(&strength) {
            return Err(Error::InvalidArgument(format!(
                "strength must be within 0.1..=1.0, got {strength}"
            )));
        }
        if request.prompt.trim().is_empty() {
            return Err(Error::InvalidArgument("prompt is required".to_string()));
        }
        let active = self.pool.active().ok_or(Error::NoModelLoaded)?;
        let engine = self.reference_engine(active.model_id())?;

        let reference = image::load_from_memory(reference_bytes)
            .map_err(|source| Error::Generation(format!("malformed reference image: {source}")))?;
        let preset = self.styles.get(&request.style);

        let scene_prompt = format!(
            "{}, {}, same character, consistent art style",
            preset.positive_fragment, request.prompt
        );
        let (prompt, truncated) = self.budgeter.budget(&scene_prompt);
        let steps = reference_step_count(preset.step_count);

        info!(
            style = preset.name,
            model_id = engine.model_id(),
            strength = %strength,
            steps,
            "generating character-consistent scene"
        );
        let job = EngineJob {
            prompt: &prompt,
            negative_prompt: preset.negative_fragment,
            steps,
            guidance_scale: preset.guidance_scale,
            width: preset.width,
            height: preset.height,
            seed: request.seed,
            reference: Some(ReferenceInput {
                image: &reference,
                strength,
            }),
        };
        let image = engine.run(&job).map_err(|source| {
            error!(style = preset.name, "scene generation failed: {source:#}");
            Error::generation(source)
        })?;

        self.finish(&engine, preset, steps, truncated, true, &image)
    }

    /// Residency, device, and memory snapshot for observability.
    pub fn status(&self) -> ServiceStatus {
        let profile = self.pool.profile();
        let reference_engine_model_id = self
            .reference_engine
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|engine| engine.model_id().to_string());
        ServiceStatus {
            ready: self.pool.active().is_some(),
            device: profile.kind.as_str().to_string(),
            model_id: self.pool.active_model_id(),
            cached_models: self.pool.cached_ids(),
            residency_capacity: self.pool.capacity(),
            reference_engine_model_id,
            memory_usage: MemoryUsage {
                accelerator_bytes: profile.available_memory_bytes,
            },
        }
    }

    /// Get or lazily build the image-conditioned engine. Bound to the model
    /// id active at first use; capacity is exactly one.
    fn reference_engine(&self, active_model_id: &str) -> Result<ResidentEngine> {
        {
            let slot = self
                .reference_engine
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(existing) = slot.as_ref() {
                return Ok(existing.clone());
            }
        }

        let mut slot = self
            .reference_engine
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }

        info!(model_id = active_model_id, "building image-conditioned engine");
        let options = self.pool.profile().engine_options();
        let engine = self
            .factory
            .construct(active_model_id, EngineMode::ImageToImage, &options)
            .map_err(|source| Error::model_load(active_model_id, source))?;
        let resident = ResidentEngine::new(active_model_id, engine);
        *slot = Some(resident.clone());
        Ok(resident)
    }

    fn finish(
        &self,
        engine: &ResidentEngine,
        preset: &StylePreset,
        steps: usize,
        prompt_truncated: bool,
        character_based: bool,
        image: &image::DynamicImage,
    ) -> Result<GenerationOutput> {
        let image_png = image_to_png(image).map_err(Error::generation)?;
        Ok(GenerationOutput {
            image_png,
            metadata: GenerationMetadata {
                model_id: engine.model_id().to_string(),
                style: preset.name.to_string(),
                step_count: steps,
                guidance_scale: preset.guidance_scale,
                resolution: format!("{}x{}", preset.width, preset.height),
                prompt_truncated,
                character_based,
                device: self.pool.profile().kind.as_str().to_string(),
            },
        })
    }
}

fn reference_step_count(preset_steps: usize) -> usize {
    MIN_REFERENCE_STEPS.max((preset_steps as f32 * REFERENCE_STEP_FACTOR) as usize)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::anyhow;
    use image::{DynamicImage, Rgb, RgbImage};

    use super::*;
    use crate::engine::{EngineLike, EngineOptions};
    use crate::util::image_to_png;

    /// Deterministic stand-in for a diffusion pipeline: the output image is a
    /// pure function of the job parameters.
    struct StubEngine {
        mode: EngineMode,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    impl EngineLike for StubEngine {
        fn run(&self, job: &EngineJob) -> anyhow::Result<DynamicImage> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("accelerator out of memory"));
            }
            if matches!(self.mode, EngineMode::ImageToImage) && job.reference.is_none() {
                return Err(anyhow!("image-conditioned engine needs a reference"));
            }
            let mut fingerprint: u64 = job.seed.unwrap_or(0);
            for byte in job.prompt.bytes() {
                fingerprint = fingerprint.wrapping_mul(31).wrapping_add(u64::from(byte));
            }
            fingerprint = fingerprint.wrapping_add(job.steps as u64);
            let shade = (fingerprint % 256) as u8;
            let mut img = RgbImage::new(job.width as u32 / 8, job.height as u32 / 8);
            for pixel in img.pixels_mut() {
                *pixel = Rgb([shade, shade.wrapping_add(1), shade.wrapping_add(2)]);
            }
            Ok(DynamicImage::ImageRgb8(img))
        }
    }

    #[derive(Default)]
    struct StubFactory {
        runs: Arc<AtomicUsize>,
        constructed: Mutex<Vec<(String, EngineMode)>>,
        fail_generation: bool,
    }

    impl StubFactory {
        fn run_count(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }

        fn constructed(&self) -> Vec<(String, EngineMode)> {
            self.constructed.lock().unwrap().clone()
        }
    }

    impl EngineFactory for StubFactory {
        fn construct(
            &self,
            model_id: &str,
            mode: EngineMode,
            _options: &EngineOptions,
        ) -> anyhow::Result<Arc<dyn EngineLike>> {
            self.constructed
                .lock()
                .unwrap()
                .push((model_id.to_string(), mode));
            Ok(Arc::new(StubEngine {
                mode,
                runs: self.runs.clone(),
                fail: self.fail_generation,
            }))
        }
    }

    fn service_with(factory: Arc<StubFactory>) -> ImageService {
        ImageService::new(factory, DeviceProfile::cpu(), ServiceConfig::default())
    }

    fn loaded_service(factory: Arc<StubFactory>) -> ImageService {
        let service = service_with(factory);
        service.load_model("test-model").unwrap();
        service
    }

    fn reference_png() -> Vec<u8> {
        let mut img = RgbImage::new(32, 32);
        for pixel in img.pixels_mut() {
            *pixel = Rgb([40, 90, 200]);
        }
        image_to_png(&DynamicImage::ImageRgb8(img)).unwrap()
    }

    fn scene_request(strength: Option<f32>) -> GenerationRequest {
        GenerationRequest {
            prompt: "forest scene".to_string(),
            style: "cartoon".to_string(),
            seed: Some(7),
            reference_image: Some(reference_png()),
            strength,
        }
    }

    #[test]
    fn generate_without_model_fails() {
        let service = service_with(Arc::new(StubFactory::default()));
        let err = service
            .generate(&GenerationRequest::text("a dog", "cartoon", None))
            .unwrap_err();
        assert!(matches!(err, Error::NoModelLoaded));
    }

    #[test]
    fn generate_returns_png_with_metadata() {
        let service = loaded_service(Arc::new(StubFactory::default()));
        let out = service
            .generate(&GenerationRequest::text("a dog", "storybook", Some(3)))
            .unwrap();
        assert_eq!(&out.image_png[..4], &[0x89, b'P', b'N', b'G']);
        assert_eq!(out.metadata.model_id, "test-model");
        assert_eq!(out.metadata.style, "storybook");
        assert_eq!(out.metadata.step_count, 30);
        assert_eq!(out.metadata.resolution, "512x512");
        assert!(!out.metadata.prompt_truncated);
        assert!(!out.metadata.character_based);
    }

    #[test]
    fn empty_prompt_is_invalid() {
        let service = loaded_service(Arc::new(StubFactory::default()));
        let err = service
            .generate(&GenerationRequest::text("   ", "cartoon", None))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn unknown_style_generates_with_default_preset() {
        let service = loaded_service(Arc::new(StubFactory::default()));
        let out = service
            .generate(&GenerationRequest::text("a dog", "no-such-style", None))
            .unwrap();
        assert_eq!(out.metadata.style, "cartoon");
        assert_eq!(out.metadata.guidance_scale, 7.0);
    }

    #[test]
    fn same_seed_yields_identical_bytes() {
        let service = loaded_service(Arc::new(StubFactory::default()));
        let request = GenerationRequest::text("a knight by a river", "anime", Some(42));
        let first = service.generate(&request).unwrap();
        let second = service.generate(&request).unwrap();
        assert_eq!(first.image_png, second.image_png);
    }

    #[test]
    fn different_seeds_change_output() {
        let service = loaded_service(Arc::new(StubFactory::default()));
        let first = service
            .generate(&GenerationRequest::text("a knight", "anime", Some(1)))
            .unwrap();
        let second = service
            .generate(&GenerationRequest::text("a knight", "anime", Some(2)))
            .unwrap();
        assert_ne!(first.image_png, second.image_png);
    }

    #[test]
    fn long_prompt_flags_truncation() {
        let service = loaded_service(Arc::new(StubFactory::default()));
        let long_prompt = vec!["meadow"; 120].join(" ");
        let out = service
            .generate(&GenerationRequest::text(long_prompt, "cartoon", None))
            .unwrap();
        assert!(out.metadata.prompt_truncated);
    }

    #[test]
    fn engine_failure_becomes_generation_error() {
        let factory = Arc::new(StubFactory {
            fail_generation: true,
            ..StubFactory::default()
        });
        let service = loaded_service(factory);
        let err = service
            .generate(&GenerationRequest::text("a dog", "cartoon", None))
            .unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
    }

    #[test]
    fn reference_generation_round_trips() {
        let service = loaded_service(Arc::new(StubFactory::default()));
        let out = service.generate_from_reference(&scene_request(Some(0.7))).unwrap();
        assert!(out.metadata.character_based);
        // cartoon preset: max(15, floor(20 * 0.8)) = 16
        assert_eq!(out.metadata.step_count, 16);
    }

    #[test]
    fn reference_steps_floor_at_fifteen() {
        assert_eq!(reference_step_count(20), 16);
        assert_eq!(reference_step_count(35), 28);
        assert_eq!(reference_step_count(15), 15);
        assert_eq!(reference_step_count(10), 15);
    }

    #[test]
    fn strength_below_range_fails_before_any_engine_runs() {
        let factory = Arc::new(StubFactory::default());
        let service = loaded_service(factory.clone());
        let err = service
            .generate_from_reference(&scene_request(Some(0.05)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(factory.run_count(), 0);
    }

    #[test]
    fn strength_above_range_fails() {
        let service = loaded_service(Arc::new(StubFactory::default()));
        let err = service
            .generate_from_reference(&scene_request(Some(1.5)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn missing_reference_image_fails() {
        let service = loaded_service(Arc::new(StubFactory::default()));
        let mut request = scene_request(Some(0.7));
        request.reference_image = None;
        let err = service.generate_from_reference(&request).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn missing_strength_defaults_into_range() {
        let service = loaded_service(Arc::new(StubFactory::default()));
        assert!(service.generate_from_reference(&scene_request(None)).is_ok());
    }

    #[test]
    fn malformed_reference_image_is_a_generation_error() {
        let service = loaded_service(Arc::new(StubFactory::default()));
        let mut request = scene_request(Some(0.7));
        request.reference_image = Some(vec![0u8; 16]);
        let err = service.generate_from_reference(&request).unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
    }

    #[test]
    fn reference_engine_is_built_once() {
        let factory = Arc::new(StubFactory::default());
        let service = loaded_service(factory.clone());
        service.generate_from_reference(&scene_request(Some(0.5))).unwrap();
        service.generate_from_reference(&scene_request(Some(0.5))).unwrap();
        let image_engines: Vec<_> = factory
            .constructed()
            .into_iter()
            .filter(|(_, mode)| *mode == EngineMode::ImageToImage)
            .collect();
        assert_eq!(image_engines.len(), 1);
    }

    #[test]
    fn reference_engine_stays_bound_to_first_use_model() {
        let factory = Arc::new(StubFactory::default());
        let service = loaded_service(factory.clone());
        service.generate_from_reference(&scene_request(Some(0.5))).unwrap();

        service.load_model("other-model").unwrap();
        let out = service.generate_from_reference(&scene_request(Some(0.5))).unwrap();

        // Scenes still come from the engine built against the first model.
        assert_eq!(out.metadata.model_id, "test-model");
        let status = service.status();
        assert_eq!(status.model_id.as_deref(), Some("other-model"));
        assert_eq!(
            status.reference_engine_model_id.as_deref(),
            Some("test-model")
        );
    }

    #[test]
    fn status_reports_residency() {
        let factory = Arc::new(StubFactory::default());
        let service = service_with(factory);
        let status = service.status();
        assert!(!status.ready);
        assert!(status.model_id.is_none());

        service.load_model("test-model").unwrap();
        let status = service.status();
        assert!(status.ready);
        assert_eq!(status.model_id.as_deref(), Some("test-model"));
        assert_eq!(status.cached_models, vec!["test-model".to_string()]);
        assert_eq!(status.residency_capacity, 1);
        assert_eq!(status.device, "cpu");
    }
}
