//! OpenVINO runtime plumbing
//!
//! Send/Sync wrappers over the OpenVINO bindings and the engine factory
//! that compiles one detector+recognizer pair per pool slot.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

use openvino::{CompiledModel, Core};
use parking_lot::RwLock;
use tracing::info;

use crate::config::Config;

use super::detector::ScrfdDetector;
use super::embedder::ArcFaceRecognizer;
use super::pool::{EngineFactory, EngineSet};

/// Wrapper for OpenVINO Core that implements Send + Sync.
pub struct SafeCore(Core);

unsafe impl Send for SafeCore {}
unsafe impl Sync for SafeCore {}

impl Deref for SafeCore {
    type Target = Core;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for SafeCore {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Wrapper for OpenVINO CompiledModel that implements Send + Sync.
#[derive(Clone)]
pub struct SafeCompiledModel(pub Arc<CompiledModel>);

unsafe impl Send for SafeCompiledModel {}
unsafe impl Sync for SafeCompiledModel {}

impl SafeCompiledModel {
    /// Create an inference request.
    /// OpenVINO CompiledModel methods are thread-safe in C++, but the Rust
    /// bindings require &mut self. We bypass this restriction safely.
    pub fn create_infer_request(&self) -> anyhow::Result<openvino::InferRequest> {
        unsafe {
            let ptr = Arc::as_ptr(&self.0) as *mut CompiledModel;
            (*ptr).create_infer_request().map_err(|e| e.into())
        }
    }
}

impl Deref for SafeCompiledModel {
    type Target = CompiledModel;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Compiles SCRFD + ArcFace model pairs on the configured device.
pub struct OpenVinoEngineFactory {
    core: Arc<RwLock<SafeCore>>,
    device: String,
    detector_path: String,
    recognizer_path: String,
    detection_threshold: f32,
    embedding_dim: usize,
}

impl OpenVinoEngineFactory {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let core = Core::new()?;
        Ok(Self {
            core: Arc::new(RwLock::new(SafeCore(core))),
            device: config.inference.device.clone(),
            detector_path: config.models.detector.to_string_lossy().into_owned(),
            recognizer_path: config.models.recognizer.to_string_lossy().into_owned(),
            detection_threshold: config.recognition.detection_threshold,
            embedding_dim: config.recognition.embedding_dim,
        })
    }

    fn compile(&self, path: &str) -> anyhow::Result<SafeCompiledModel> {
        info!("compiling model {} on {}", path, self.device);
        let start = Instant::now();

        // Core methods take &mut self in the Rust bindings.
        let mut core = self.core.write();
        let model = core.read_model_from_file(path, "")?;
        let compiled = core.compile_model(&model, self.device.as_str().into())?;

        info!("model {} compiled in {:?}", path, start.elapsed());
        Ok(SafeCompiledModel(Arc::new(compiled)))
    }
}

impl EngineFactory for OpenVinoEngineFactory {
    fn create(&self) -> anyhow::Result<EngineSet> {
        let detector = self.compile(&self.detector_path)?;
        let recognizer = self.compile(&self.recognizer_path)?;
        Ok(EngineSet {
            detector: Box::new(ScrfdDetector::new(detector, self.detection_threshold)),
            recognizer: Box::new(ArcFaceRecognizer::new(recognizer, self.embedding_dim)),
        })
    }

    // OpenVINO compiled models release their device memory on drop, so the
    // default no-op reclaim is sufficient for this backend.
}
