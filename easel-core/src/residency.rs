//! Model residency.
//!
//! Engines are expensive to construct, so loaded ones are kept in a small
//! capacity-bounded cache keyed by model id. There is deliberately no
//! eviction: once the cache is full, further models load transiently and are
//! rebuilt from scratch on every switch back. On 6GB-class hardware holding
//! more would exhaust accelerator memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::device::DeviceProfile;
use crate::engine::{EngineFactory, EngineJob, EngineLike, EngineMode};
use crate::error::{Error, Result};

/// A constructed engine bound to one model id, plus the lock that serializes
/// generations against the shared accelerator.
#[derive(Clone)]
pub struct ResidentEngine {
    model_id: Arc<str>,
    engine: Arc<dyn EngineLike>,
    run_lock: Arc<Mutex<()>>,
}

impl ResidentEngine {
    pub(crate) fn new(model_id: &str, engine: Arc<dyn EngineLike>) -> Self {
        Self {
            model_id: Arc::from(model_id),
            engine,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Run one job. At most one generation is in flight per engine; callers
    /// queue on the run lock.
    pub(crate) fn run(&self, job: &EngineJob) -> anyhow::Result<DynamicImage> {
        let _serialized = self
            .run_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.engine.run(job)
    }
}

struct PoolState {
    active: Option<ResidentEngine>,
    cache: HashMap<String, ResidentEngine>,
}

/// Owns every text-to-image engine in the process and tracks which one is
/// active. Loads, switches, and the residency cache all live behind one lock,
/// so a switch blocks new generation admission until it completes; in-flight
/// generations finish on the handle they started with.
pub struct ModelPool {
    factory: Arc<dyn EngineFactory>,
    profile: DeviceProfile,
    capacity: usize,
    state: RwLock<PoolState>,
}

impl ModelPool {
    pub fn new(factory: Arc<dyn EngineFactory>, profile: DeviceProfile) -> Self {
        let capacity = profile.residency_capacity();
        Self {
            factory,
            profile,
            capacity,
            state: RwLock::new(PoolState {
                active: None,
                cache: HashMap::new(),
            }),
        }
    }

    /// Load `model_id` and make it active.
    ///
    /// Already-active ids are a no-op; cached ids activate without a reload.
    /// Otherwise a fresh engine is constructed with the profile's permanent
    /// optimization options, retained only if the cache has room. On failure
    /// the previously active engine stays active and usable.
    pub fn load(&self, model_id: &str) -> Result<()> {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if state
            .active
            .as_ref()
            .is_some_and(|engine| engine.model_id() == model_id)
        {
            debug!(model_id, "model already active");
            return Ok(());
        }

        if let Some(cached) = state.cache.get(model_id).cloned() {
            info!(model_id, "activating cached model");
            state.active = Some(cached);
            return Ok(());
        }

        info!(model_id, device = self.profile.kind.as_str(), "loading model");
        let options = self.profile.engine_options();
        let engine = self
            .factory
            .construct(model_id, EngineMode::TextToImage, &options)
            .map_err(|source| Error::model_load(model_id, source))?;
        let resident = ResidentEngine::new(model_id, engine);

        if state.cache.len() < self.capacity {
            state.cache.insert(model_id.to_string(), resident.clone());
        } else {
            warn!(
                model_id,
                capacity = self.capacity,
                "residency cache full, model held transiently"
            );
        }
        state.active = Some(resident);
        info!(model_id, "model loaded");
        Ok(())
    }

    /// The currently active engine, if any. Cloning the handle is cheap and
    /// lets a generation outlive a concurrent switch.
    pub fn active(&self) -> Option<ResidentEngine> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .active
            .clone()
    }

    pub fn active_model_id(&self) -> Option<String> {
        self.active().map(|engine| engine.model_id().to_string())
    }

    pub fn cached_ids(&self) -> Vec<String> {
        let state = self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut ids: Vec<String> = state.cache.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use image::DynamicImage;

    use super::*;
    use crate::engine::EngineOptions;

    struct NullEngine;

    impl EngineLike for NullEngine {
        fn run(&self, _job: &EngineJob) -> anyhow::Result<DynamicImage> {
            Ok(DynamicImage::new_rgb8(8, 8))
        }
    }

    /// Counts constructions and fails for one designated model id.
    struct CountingFactory {
        loads: AtomicUsize,
        fail_for: Option<&'static str>,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                loads: AtomicUsize::new(0),
                fail_for: None,
            }
        }

        fn failing_for(model_id: &'static str) -> Self {
            Self {
                loads: AtomicUsize::new(0),
                fail_for: Some(model_id),
            }
        }

        fn load_count(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    impl EngineFactory for CountingFactory {
        fn construct(
            &self,
            model_id: &str,
            _mode: EngineMode,
            _options: &EngineOptions,
        ) -> anyhow::Result<Arc<dyn EngineLike>> {
            if self.fail_for == Some(model_id) {
                return Err(anyhow!("weights unavailable for {model_id}"));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullEngine))
        }
    }

    fn capacity_one_pool(factory: Arc<CountingFactory>) -> ModelPool {
        ModelPool::new(factory, DeviceProfile::cpu())
    }

    #[test]
    fn load_makes_model_active() {
        let factory = Arc::new(CountingFactory::new());
        let pool = capacity_one_pool(factory);
        pool.load("model-a").unwrap();
        assert_eq!(pool.active_model_id().as_deref(), Some("model-a"));
    }

    #[test]
    fn reloading_active_model_is_a_noop() {
        let factory = Arc::new(CountingFactory::new());
        let pool = capacity_one_pool(factory.clone());
        pool.load("model-a").unwrap();
        pool.load("model-a").unwrap();
        assert_eq!(factory.load_count(), 1);
    }

    #[test]
    fn cache_never_exceeds_capacity() {
        let factory = Arc::new(CountingFactory::new());
        let pool = capacity_one_pool(factory);
        for id in ["a", "b", "c", "d"] {
            pool.load(id).unwrap();
            assert!(pool.cached_ids().len() <= pool.capacity());
        }
    }

    #[test]
    fn evictionless_cache_reconstructs_on_switch_back() {
        // Capacity 1: "a" is cached, "b" loads transiently, returning to "a"
        // hits the cache but a second visit to "b" rebuilds it.
        let factory = Arc::new(CountingFactory::new());
        let pool = capacity_one_pool(factory.clone());
        pool.load("a").unwrap();
        pool.load("b").unwrap();
        pool.load("a").unwrap();
        assert_eq!(factory.load_count(), 2, "a came back from cache");
        pool.load("b").unwrap();
        assert_eq!(factory.load_count(), 3, "b was never retained");
    }

    #[test]
    fn capacity_two_retains_both_models() {
        let factory = Arc::new(CountingFactory::new());
        let profile = DeviceProfile {
            device: candle_core::Device::Cpu,
            kind: crate::device::DeviceKind::Gpu,
            low_vram: false,
            available_memory_bytes: None,
        };
        let pool = ModelPool::new(factory.clone(), profile);
        pool.load("a").unwrap();
        pool.load("b").unwrap();
        pool.load("a").unwrap();
        pool.load("b").unwrap();
        assert_eq!(factory.load_count(), 2);
        assert_eq!(pool.cached_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn failed_load_keeps_previous_model_active() {
        let factory = Arc::new(CountingFactory::failing_for("bad"));
        let pool = capacity_one_pool(factory);
        pool.load("good").unwrap();

        let err = pool.load("bad").unwrap_err();
        assert!(matches!(err, Error::ModelLoad { .. }));
        assert_eq!(pool.active_model_id().as_deref(), Some("good"));
    }

    #[test]
    fn load_failure_with_no_previous_model_stays_unloaded() {
        let factory = Arc::new(CountingFactory::failing_for("bad"));
        let pool = capacity_one_pool(factory);
        assert!(pool.load("bad").is_err());
        assert!(pool.active().is_none());
    }
}
