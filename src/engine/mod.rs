//! Inference engine layer
//!
//! Collaborator traits for the two-stage inference graph, the shared engine
//! pool, and the per-stream pipeline that drives frames through it.

pub mod detector;
pub mod embedder;
pub mod openvino;
pub mod pipeline;
pub mod pool;
pub mod preprocess;
pub mod source;

use anyhow::Result;
use image::RgbImage;

pub use embedder::FaceEmbedding;
pub use pipeline::{PipelineState, StreamPipeline};
pub use pool::{EngineFactory, EnginePool, EngineSet};
pub use source::{FrameReader, FrameSource, ImageDirSource, ReadOutcome};

/// Axis-aligned box in frame coordinates.
#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// A single face found in a frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Landmark points in frame coordinates. Recognition only runs on
    /// detections carrying exactly five (eyes, nose, mouth corners).
    pub landmarks: Vec<[f32; 2]>,
    pub score: f32,
}

/// Face detection capability. Implementations may be invoked concurrently
/// across streams but are used exclusively within one stream's checked-out
/// engine set.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>>;
}

/// Face recognition capability. All aligned crops from one frame are
/// embedded in a single batched call.
pub trait FaceRecognizer: Send + Sync {
    fn recognize_batch(&self, crops: &[RgbImage]) -> Result<Vec<FaceEmbedding>>;
}

#[cfg(test)]
pub(crate) mod testsupport {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use image::RgbImage;
    use parking_lot::Mutex;

    use crate::error::SourceError;
    use crate::storage::{IdentityMatch, IdentityStore};

    use super::source::{FrameReader, FrameSource, ReadOutcome};
    use super::{
        BoundingBox, Detection, EngineFactory, EngineSet, FaceDetector, FaceEmbedding,
        FaceRecognizer,
    };

    pub fn test_frame() -> RgbImage {
        RgbImage::new(32, 24)
    }

    fn stub_detection(landmark_count: usize) -> Detection {
        Detection {
            bbox: BoundingBox {
                x1: 2.0,
                y1: 2.0,
                x2: 20.0,
                y2: 20.0,
            },
            landmarks: vec![[5.0, 5.0]; landmark_count],
            score: 0.9,
        }
    }

    /// Emits one detection per configured landmark count for every frame,
    /// optionally taking a fixed amount of time per invocation.
    pub struct StubDetector {
        pub landmark_counts: Vec<usize>,
        pub delay: Duration,
    }

    impl FaceDetector for StubDetector {
        fn detect(&self, _frame: &RgbImage) -> anyhow::Result<Vec<Detection>> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            Ok(self
                .landmark_counts
                .iter()
                .map(|&n| stub_detection(n))
                .collect())
        }
    }

    /// Records the size of every batch it is asked to embed.
    #[derive(Default)]
    pub struct StubRecognizer {
        pub batch_sizes: Arc<Mutex<Vec<usize>>>,
    }

    impl FaceRecognizer for StubRecognizer {
        fn recognize_batch(&self, crops: &[RgbImage]) -> anyhow::Result<Vec<FaceEmbedding>> {
            self.batch_sizes.lock().push(crops.len());
            Ok(crops
                .iter()
                .map(|_| FaceEmbedding::new(vec![1.0, 0.0, 0.0]))
                .collect())
        }
    }

    pub struct StubFactory {
        pub landmark_counts: Vec<usize>,
        pub detect_delay: Duration,
        pub batch_sizes: Arc<Mutex<Vec<usize>>>,
        pub created: AtomicUsize,
        pub reclaimed: Arc<AtomicUsize>,
        pub fail_from: Option<usize>,
    }

    impl StubFactory {
        pub fn new() -> Self {
            Self {
                landmark_counts: vec![5],
                detect_delay: Duration::ZERO,
                batch_sizes: Arc::new(Mutex::new(Vec::new())),
                created: AtomicUsize::new(0),
                reclaimed: Arc::new(AtomicUsize::new(0)),
                fail_from: None,
            }
        }

        pub fn with_landmark_counts(counts: Vec<usize>) -> Self {
            Self {
                landmark_counts: counts,
                ..Self::new()
            }
        }

        pub fn with_detect_delay(delay: Duration) -> Self {
            Self {
                detect_delay: delay,
                ..Self::new()
            }
        }
    }

    impl EngineFactory for StubFactory {
        fn create(&self) -> anyhow::Result<EngineSet> {
            let index = self.created.fetch_add(1, Ordering::SeqCst);
            if let Some(fail_from) = self.fail_from {
                if index >= fail_from {
                    anyhow::bail!("engine backend refused to load set #{index}");
                }
            }
            Ok(EngineSet {
                detector: Box::new(StubDetector {
                    landmark_counts: self.landmark_counts.clone(),
                    delay: self.detect_delay,
                }),
                recognizer: Box::new(StubRecognizer {
                    batch_sizes: self.batch_sizes.clone(),
                }),
            })
        }

        fn force_reclaim(&self, _set: &EngineSet) -> anyhow::Result<()> {
            self.reclaimed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Finite source: yields `frames` synthetic frames, then end-of-stream.
    pub struct FiniteSource {
        pub frames: usize,
    }

    struct FiniteReader {
        remaining: usize,
    }

    impl FrameSource for FiniteSource {
        fn open(&self, _descriptor: &str) -> Result<Box<dyn FrameReader>, SourceError> {
            Ok(Box::new(FiniteReader {
                remaining: self.frames,
            }))
        }
    }

    impl FrameReader for FiniteReader {
        fn read(&mut self) -> ReadOutcome {
            if self.remaining == 0 {
                return ReadOutcome::EndOfStream;
            }
            self.remaining -= 1;
            ReadOutcome::Frame(test_frame())
        }

        fn is_live(&self) -> bool {
            false
        }
    }

    /// Live source: produces frames as fast as it is polled and counts reads.
    pub struct LiveSource {
        pub reads: Arc<AtomicUsize>,
    }

    struct LiveReader {
        reads: Arc<AtomicUsize>,
    }

    impl FrameSource for LiveSource {
        fn open(&self, _descriptor: &str) -> Result<Box<dyn FrameReader>, SourceError> {
            Ok(Box::new(LiveReader {
                reads: self.reads.clone(),
            }))
        }
    }

    impl FrameReader for LiveReader {
        fn read(&mut self) -> ReadOutcome {
            self.reads.fetch_add(1, Ordering::Relaxed);
            ReadOutcome::Frame(test_frame())
        }

        fn is_live(&self) -> bool {
            true
        }
    }

    /// Live source whose reads block for a long time, simulating stuck I/O.
    pub struct BlockingSource {
        pub block_for: Duration,
    }

    struct BlockingReader {
        block_for: Duration,
    }

    impl FrameSource for BlockingSource {
        fn open(&self, _descriptor: &str) -> Result<Box<dyn FrameReader>, SourceError> {
            Ok(Box::new(BlockingReader {
                block_for: self.block_for,
            }))
        }
    }

    impl FrameReader for BlockingReader {
        fn read(&mut self) -> ReadOutcome {
            std::thread::sleep(self.block_for);
            ReadOutcome::Transient
        }

        fn is_live(&self) -> bool {
            true
        }
    }

    /// Source whose open always fails.
    pub struct BrokenSource;

    impl FrameSource for BrokenSource {
        fn open(&self, descriptor: &str) -> Result<Box<dyn FrameReader>, SourceError> {
            Err(SourceError::Open {
                descriptor: descriptor.to_string(),
                reason: "no such device".to_string(),
            })
        }
    }

    /// Store that matches everything against a single identity.
    pub struct SingleIdentityStore {
        pub name: String,
    }

    impl IdentityStore for SingleIdentityStore {
        fn search(&self, _embedding: &[f32], _threshold: f32) -> Option<IdentityMatch> {
            Some(IdentityMatch {
                name: self.name.clone(),
                external_id: "SN-1".to_string(),
                similarity: 0.93,
            })
        }
    }
}
