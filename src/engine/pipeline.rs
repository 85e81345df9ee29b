//! Per-stream inference pipeline
//!
//! Four stage workers per stream (capture → relay → detect →
//! recognize/render) wired by bounded queues, plus a supervising driver.
//! The relay stage performs no transformation: it decouples capture cadence
//! from inference cadence and gives shutdown a checkpoint that is never
//! blocked on source I/O.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use image::RgbImage;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::storage::IdentityStore;
use crate::utils::draw::{self, FaceMatch};

use super::pool::{EnginePool, EngineSet};
use super::preprocess::align_and_crop;
use super::source::{FrameReader, FrameSource, ReadOutcome};
use super::Detection;

const SUPERVISION_POLL: Duration = Duration::from_millis(200);
const CAPTURE_RETRY: Duration = Duration::from_millis(10);
const SENTINEL_SEND_TIMEOUT: Duration = Duration::from_millis(500);
const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub acquire_timeout: Duration,
    pub queue_capacity: usize,
    pub stage_poll: Duration,
    pub join_timeout: Duration,
    pub similarity_threshold: f32,
    pub align_size: u32,
    pub jpeg_quality: u8,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            acquire_timeout: Duration::from_secs_f64(config.inference.acquire_timeout_secs),
            queue_capacity: config.stream.queue_capacity,
            stage_poll: Duration::from_millis(config.stream.stage_poll_ms),
            join_timeout: Duration::from_secs(config.stream.stop_join_timeout_secs),
            similarity_threshold: config.recognition.similarity_threshold,
            align_size: config.recognition.align_size,
            jpeg_quality: config.stream.jpeg_quality,
        }
    }
}

/// Receiver clones kept for draining during teardown.
struct StageQueues {
    captured: Receiver<Option<RgbImage>>,
    relayed: Receiver<Option<RgbImage>>,
    detected: Receiver<Option<(RgbImage, Vec<Detection>)>>,
}

impl StageQueues {
    fn drain(&self) {
        while self.captured.try_recv().is_ok() {}
        while self.relayed.try_recv().is_ok() {}
        while self.detected.try_recv().is_ok() {}
    }
}

pub struct StreamPipeline {
    stream_id: String,
    descriptor: String,
    pool: Arc<EnginePool>,
    source: Arc<dyn FrameSource>,
    store: Arc<dyn IdentityStore>,
    settings: PipelineSettings,

    output_tx: Mutex<Option<Sender<Option<Vec<u8>>>>>,
    output_rx: Receiver<Option<Vec<u8>>>,

    state: Mutex<PipelineState>,
    stop_flag: AtomicBool,
    dropped_frames: AtomicU64,

    workers: Mutex<Vec<JoinHandle<()>>>,
    stage_queues: Mutex<Option<StageQueues>>,
    engines: Mutex<Option<Arc<EngineSet>>>,
}

impl StreamPipeline {
    pub fn new(
        stream_id: String,
        descriptor: String,
        pool: Arc<EnginePool>,
        source: Arc<dyn FrameSource>,
        store: Arc<dyn IdentityStore>,
        settings: PipelineSettings,
    ) -> Self {
        let (output_tx, output_rx) = bounded(settings.queue_capacity);
        Self {
            stream_id,
            descriptor,
            pool,
            source,
            store,
            settings,
            output_tx: Mutex::new(Some(output_tx)),
            output_rx,
            state: Mutex::new(PipelineState::Created),
            stop_flag: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
            stage_queues: Mutex::new(None),
            engines: Mutex::new(None),
        }
    }

    /// Queue of encoded output frames; `None` is the end-of-stream sentinel.
    pub fn output_receiver(&self) -> Receiver<Option<Vec<u8>>> {
        self.output_rx.clone()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Terminal means the driver has nothing more to produce.
    pub fn is_finished(&self) -> bool {
        matches!(self.state(), PipelineState::Stopped | PipelineState::Failed)
    }

    /// Frames discarded by capture because the downstream queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    fn set_state(&self, next: PipelineState) {
        *self.state.lock() = next;
    }

    /// Move to a terminal state, never downgrading Failed.
    fn finish_state(&self) {
        let mut state = self.state.lock();
        if *state != PipelineState::Failed {
            *state = PipelineState::Stopped;
        }
    }

    fn stopped(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    /// Drive the pipeline to completion. Runs on the stream's driver thread;
    /// returns only once every resource is back where it belongs.
    pub fn run(self: Arc<Self>) {
        self.set_state(PipelineState::Starting);
        info!("[stream {}] starting, acquiring engine set", self.stream_id);

        let engines = match self.pool.acquire(self.settings.acquire_timeout) {
            Ok(set) => set,
            Err(err) => {
                error!("[stream {}] start failed: {err}", self.stream_id);
                self.set_state(PipelineState::Failed);
                return;
            }
        };
        *self.engines.lock() = Some(engines.clone());

        let reader = match self.source.open(&self.descriptor) {
            Ok(reader) => reader,
            Err(err) => {
                error!("[stream {}] start failed: {err}", self.stream_id);
                self.release_engines();
                self.set_state(PipelineState::Failed);
                return;
            }
        };
        info!(
            "[stream {}] source '{}' opened, starting stage workers",
            self.stream_id, self.descriptor
        );

        if self.stopped() {
            self.release_engines();
            self.finish_state();
            return;
        }

        self.clone().spawn_stages(engines, reader);
        self.set_state(PipelineState::Running);

        // Supervision: a stage dying without a stop request is unhealthy and
        // tears the whole stream down. The sleep comes first so a stage that
        // finished naturally gets a window to flush in-flight frames.
        while !self.stopped() {
            thread::sleep(SUPERVISION_POLL);
            if self.stopped() {
                break;
            }
            let stage_died = self.workers.lock().iter().any(|handle| handle.is_finished());
            if stage_died {
                info!(
                    "[stream {}] a stage worker finished, shutting down",
                    self.stream_id
                );
                break;
            }
        }

        self.stop();
    }

    /// Signal all stages, join them within a bounded budget, drain every
    /// queue, and return the engine set. Idempotent; safe to call from the
    /// driver and the manager concurrently.
    pub fn stop(&self) {
        if self.stop_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock();
            if *state != PipelineState::Failed {
                *state = PipelineState::Stopping;
            }
        }
        warn!("[stream {}] stopping", self.stream_id);

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let name = handle
                .thread()
                .name()
                .unwrap_or("stage")
                .to_string();
            let deadline = Instant::now() + self.settings.join_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                error!(
                    "[stream {}] worker '{name}' did not stop in time, likely blocked on I/O",
                    self.stream_id
                );
            }
        }

        if let Some(queues) = self.stage_queues.lock().take() {
            queues.drain();
        }
        while self.output_rx.try_recv().is_ok() {}

        // Pool availability never depends on a clean join: a stuck capture
        // call must not starve other streams of engines.
        self.release_engines();

        self.finish_state();
        info!("[stream {}] all resources released", self.stream_id);
    }

    fn release_engines(&self) {
        if let Some(set) = self.engines.lock().take() {
            self.pool.release(set);
            debug!("[stream {}] engine set returned to pool", self.stream_id);
        }
    }

    fn spawn_stages(self: Arc<Self>, engines: Arc<EngineSet>, reader: Box<dyn FrameReader>) {
        let capacity = self.settings.queue_capacity;
        let (captured_tx, captured_rx) = bounded::<Option<RgbImage>>(capacity);
        let (relayed_tx, relayed_rx) = bounded::<Option<RgbImage>>(capacity);
        let (detected_tx, detected_rx) = bounded::<Option<(RgbImage, Vec<Detection>)>>(capacity);

        *self.stage_queues.lock() = Some(StageQueues {
            captured: captured_rx.clone(),
            relayed: relayed_rx.clone(),
            detected: detected_rx.clone(),
        });

        let output_tx = self
            .output_tx
            .lock()
            .take()
            .expect("stages are spawned at most once per pipeline");

        let mut workers = self.workers.lock();
        workers.push(self.spawn_worker("capture", {
            let pipeline = self.clone();
            move || pipeline.capture_loop(reader, captured_tx)
        }));
        workers.push(self.spawn_worker("relay", {
            let pipeline = self.clone();
            move || pipeline.relay_loop(captured_rx, relayed_tx)
        }));
        workers.push(self.spawn_worker("detect", {
            let pipeline = self.clone();
            let engines = engines.clone();
            move || pipeline.detect_loop(engines, relayed_rx, detected_tx)
        }));
        workers.push(self.spawn_worker("recognize", {
            let pipeline = self.clone();
            move || pipeline.recognize_loop(engines, detected_rx, output_tx)
        }));
    }

    fn spawn_worker(
        &self,
        stage: &str,
        body: impl FnOnce() + Send + 'static,
    ) -> JoinHandle<()> {
        thread::Builder::new()
            .name(format!("{}-{stage}", self.stream_id))
            .spawn(body)
            .expect("failed to spawn stage worker")
    }

    /// Bounded send that stays responsive to the stop signal. Returns false
    /// once the pipeline is shutting down or the consumer is gone.
    fn forward<T>(&self, tx: &Sender<Option<T>>, item: Option<T>) -> bool {
        let mut item = item;
        while !self.stopped() {
            match tx.send_timeout(item, self.settings.stage_poll) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(unsent)) => item = unsent,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
        false
    }

    /// Stage 1: read frames at source pace. Never blocks on the downstream
    /// queue: when it is full the incoming frame is dropped on the spot,
    /// trading completeness for freshness.
    fn capture_loop(&self, mut reader: Box<dyn FrameReader>, tx: Sender<Option<RgbImage>>) {
        debug!("[stream {}] capture worker started", self.stream_id);
        while !self.stopped() {
            match reader.read() {
                ReadOutcome::Frame(frame) => match tx.try_send(Some(frame)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                        thread::sleep(CAPTURE_RETRY);
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                },
                ReadOutcome::EndOfStream => {
                    info!("[stream {}] source reached end of stream", self.stream_id);
                    break;
                }
                ReadOutcome::Transient => {
                    if reader.is_live() {
                        thread::sleep(CAPTURE_RETRY);
                    } else {
                        info!(
                            "[stream {}] finite source failed to read, treating as end of stream",
                            self.stream_id
                        );
                        break;
                    }
                }
            }
        }
        if tx.send_timeout(None, SENTINEL_SEND_TIMEOUT).is_err() {
            debug!("[stream {}] capture sentinel not delivered", self.stream_id);
        }
        debug!("[stream {}] capture worker stopped", self.stream_id);
    }

    /// Stage 2: forward frames unchanged, polling with a short timeout so a
    /// stop request is noticed promptly even when capture is wedged in I/O.
    fn relay_loop(&self, rx: Receiver<Option<RgbImage>>, tx: Sender<Option<RgbImage>>) {
        debug!("[stream {}] relay worker started", self.stream_id);
        while !self.stopped() {
            match rx.recv_timeout(self.settings.stage_poll) {
                Ok(Some(frame)) => {
                    if !self.forward(&tx, Some(frame)) {
                        break;
                    }
                }
                Ok(None) => {
                    self.forward(&tx, None);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("[stream {}] relay worker stopped", self.stream_id);
    }

    /// Stage 3: one detector invocation per frame. Detection errors are
    /// absorbed per frame; they never terminate the stage.
    fn detect_loop(
        &self,
        engines: Arc<EngineSet>,
        rx: Receiver<Option<RgbImage>>,
        tx: Sender<Option<(RgbImage, Vec<Detection>)>>,
    ) {
        debug!("[stream {}] detect worker started", self.stream_id);
        while !self.stopped() {
            match rx.recv_timeout(self.settings.stage_poll) {
                Ok(Some(frame)) => match engines.detector.detect(&frame) {
                    Ok(detections) => {
                        if !self.forward(&tx, Some((frame, detections))) {
                            break;
                        }
                    }
                    Err(err) => {
                        error!("[stream {}] detection failed: {err:#}", self.stream_id);
                    }
                },
                Ok(None) => {
                    self.forward(&tx, None);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("[stream {}] detect worker stopped", self.stream_id);
    }

    /// Stage 4: align, batch-recognize, annotate, encode, publish. Output
    /// enqueue never blocks; a full output queue drops the frame so the
    /// stream always favors the latest result.
    fn recognize_loop(
        &self,
        engines: Arc<EngineSet>,
        rx: Receiver<Option<(RgbImage, Vec<Detection>)>>,
        tx: Sender<Option<Vec<u8>>>,
    ) {
        debug!("[stream {}] recognize worker started", self.stream_id);
        while !self.stopped() {
            match rx.recv_timeout(self.settings.stage_poll) {
                Ok(Some((frame, detections))) => {
                    match self.recognize_and_render(&engines, frame, &detections) {
                        Ok(jpeg) => {
                            let _ = tx.try_send(Some(jpeg));
                        }
                        Err(err) => {
                            error!("[stream {}] recognition failed: {err:#}", self.stream_id);
                        }
                    }
                }
                Ok(None) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        // End-of-stream marker for the consumer, sent exactly once.
        let _ = tx.try_send(None);
        debug!("[stream {}] recognize worker stopped", self.stream_id);
    }

    fn recognize_and_render(
        &self,
        engines: &EngineSet,
        mut frame: RgbImage,
        detections: &[Detection],
    ) -> anyhow::Result<Vec<u8>> {
        let mut crops = Vec::new();
        let mut eligible = Vec::new();
        for detection in detections {
            // Only detections with the full five-point landmark set can be
            // aligned; anything else is skipped, not an error.
            let Ok(landmarks) = <[[f32; 2]; 5]>::try_from(detection.landmarks.as_slice()) else {
                continue;
            };
            let (crop, _) = align_and_crop(&frame, &landmarks, self.settings.align_size);
            crops.push(crop);
            eligible.push(detection);
        }

        let mut results = Vec::with_capacity(eligible.len());
        if !crops.is_empty() {
            let embeddings = engines.recognizer.recognize_batch(&crops)?;
            for (embedding, detection) in embeddings.iter().zip(eligible) {
                let matched = self
                    .store
                    .search(embedding.as_slice(), self.settings.similarity_threshold);
                results.push(match matched {
                    Some(identity) => FaceMatch {
                        bbox: detection.bbox,
                        name: Some(identity.name),
                        similarity: Some(identity.similarity),
                    },
                    None => FaceMatch {
                        bbox: detection.bbox,
                        name: None,
                        similarity: None,
                    },
                });
            }
        }

        draw::annotate(&mut frame, &results);
        draw::encode_jpeg(&frame, self.settings.jpeg_quality)
    }
}
