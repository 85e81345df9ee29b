//! Stream lifecycle management
//!
//! Registry of running streams. Starts pipelines against the shared engine
//! pool, bridges their output queues to cancellable byte streams, expires
//! streams past their lifetime, and shuts everything down on exit. The
//! async side never blocks directly on pool or queue operations; every
//! blocking call is pushed through `spawn_blocking`.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use futures::Stream;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::pipeline::PipelineSettings;
use crate::engine::{EnginePool, FrameSource, StreamPipeline};
use crate::error::StreamError;
use crate::storage::IdentityStore;

use super::types::{StreamInfo, LIFETIME_INFINITE};

/// How long `stop` waits for a driver thread before giving up on the join.
const DRIVER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const FEED_POLL: Duration = Duration::from_millis(20);
const FEED_IDLE_SLEEP: Duration = Duration::from_millis(10);

struct StreamEntry {
    info: StreamInfo,
    output: Receiver<Option<Vec<u8>>>,
    pipeline: Arc<StreamPipeline>,
    driver: JoinHandle<()>,
}

pub struct StreamManager {
    config: Arc<Config>,
    pool: Arc<EnginePool>,
    source: Arc<dyn FrameSource>,
    store: Arc<dyn IdentityStore>,
    streams: Mutex<HashMap<String, StreamEntry>>,
}

impl StreamManager {
    pub fn new(
        config: Arc<Config>,
        pool: Arc<EnginePool>,
        source: Arc<dyn FrameSource>,
        store: Arc<dyn IdentityStore>,
    ) -> Self {
        info!("initializing stream manager");
        Self {
            config,
            pool,
            source,
            store,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Start a new stream against `source_descriptor`. A lifetime of -1
    /// means the stream never expires; None picks the configured default.
    pub async fn start(
        &self,
        source_descriptor: String,
        lifetime_minutes: Option<i64>,
    ) -> Result<StreamInfo, StreamError> {
        let stream_id = Uuid::new_v4().to_string();
        let lifetime = lifetime_minutes.unwrap_or(self.config.stream.default_lifetime_minutes);

        let pipeline = Arc::new(StreamPipeline::new(
            stream_id.clone(),
            source_descriptor.clone(),
            self.pool.clone(),
            self.source.clone(),
            self.store.clone(),
            PipelineSettings::from_config(&self.config),
        ));
        let output = pipeline.output_receiver();

        let driver = {
            let pipeline = pipeline.clone();
            thread::Builder::new()
                .name(format!("stream-{stream_id}"))
                .spawn(move || pipeline.run())
                .map_err(|err| {
                    error!("failed to spawn driver thread: {err}");
                    StreamError::ServiceBusy
                })?
        };

        // Give the driver one grace window; an immediate death means the
        // pool is exhausted or the source would not open.
        tokio::time::sleep(Duration::from_millis(self.config.stream.start_grace_ms)).await;
        if driver.is_finished() {
            let _ = driver.join();
            warn!(
                "stream {stream_id} died during startup (source '{source_descriptor}'), reporting busy"
            );
            return Err(StreamError::ServiceBusy);
        }

        let started_at = Utc::now();
        let expires_at = (lifetime != LIFETIME_INFINITE)
            .then(|| started_at + chrono::Duration::minutes(lifetime));
        let info = StreamInfo {
            stream_id: stream_id.clone(),
            source: source_descriptor.clone(),
            started_at,
            expires_at,
            lifetime_minutes: lifetime,
        };

        self.streams.lock().insert(
            stream_id.clone(),
            StreamEntry {
                info: info.clone(),
                output,
                pipeline,
                driver,
            },
        );
        info!("stream started: id={stream_id}, source={source_descriptor}");
        Ok(info)
    }

    /// Stop a stream and join its driver. Returns whether it existed.
    pub async fn stop(&self, stream_id: &str) -> bool {
        let entry = self.streams.lock().remove(stream_id);
        let Some(entry) = entry else {
            debug!("stop requested for unknown stream {stream_id}");
            return false;
        };

        let StreamEntry {
            pipeline, driver, ..
        } = entry;
        let stream_id = stream_id.to_string();
        let joined = tokio::task::spawn_blocking(move || {
            pipeline.stop();
            let deadline = Instant::now() + DRIVER_JOIN_TIMEOUT;
            while !driver.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if driver.is_finished() {
                let _ = driver.join();
                true
            } else {
                false
            }
        })
        .await
        .unwrap_or(false);

        if joined {
            info!("stream {stream_id} stopped");
        } else {
            warn!("stream {stream_id} driver did not finish within {DRIVER_JOIN_TIMEOUT:?}");
        }
        true
    }

    /// Cancellable lazy stream of multipart-delimited JPEG frames. Dropping
    /// the returned stream only stops iteration; the pipeline keeps running
    /// until `stop` or expiry ends it.
    pub fn feed(
        &self,
        stream_id: &str,
    ) -> Result<impl Stream<Item = Bytes> + Send + 'static, StreamError> {
        let (output, pipeline) = {
            let streams = self.streams.lock();
            let entry = streams
                .get(stream_id)
                .ok_or_else(|| StreamError::NotFound(stream_id.to_string()))?;
            (entry.output.clone(), entry.pipeline.clone())
        };

        Ok(futures::stream::unfold(
            (output, pipeline),
            |(output, pipeline)| async move {
                loop {
                    let queue = output.clone();
                    let polled =
                        tokio::task::spawn_blocking(move || queue.recv_timeout(FEED_POLL))
                            .await
                            .ok()?;
                    match polled {
                        Ok(Some(jpeg)) => {
                            return Some((multipart_part(&jpeg), (output, pipeline)));
                        }
                        // Sentinel: the pipeline has produced its last frame.
                        Ok(None) => return None,
                        Err(RecvTimeoutError::Timeout) => {
                            if pipeline.is_finished() && output.is_empty() {
                                return None;
                            }
                            tokio::time::sleep(FEED_IDLE_SLEEP).await;
                        }
                        Err(RecvTimeoutError::Disconnected) => return None,
                    }
                }
            },
        ))
    }

    /// Streams whose driver thread is currently alive. Entries whose driver
    /// died without an explicit stop are reaped on the way.
    pub fn list(&self) -> Vec<StreamInfo> {
        let mut streams = self.streams.lock();

        let dead: Vec<String> = streams
            .iter()
            .filter(|(_, entry)| entry.driver.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for id in dead {
            debug!("reaping stream {id} whose driver terminated");
            streams.remove(&id);
        }

        streams.values().map(|entry| entry.info.clone()).collect()
    }

    /// Stop every stream whose expiry timestamp has elapsed.
    pub async fn sweep_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = {
            self.streams
                .lock()
                .iter()
                .filter(|(_, entry)| entry.info.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect()
        };
        if expired.is_empty() {
            return;
        }

        info!("stopping {} expired stream(s)", expired.len());
        futures::future::join_all(expired.iter().map(|id| self.stop(id))).await;
    }

    /// Periodic expiry sweeper; runs until the process exits.
    pub async fn run_expiry_sweeper(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.stream.sweeper_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            self.sweep_expired().await;
        }
    }

    /// Stop every registered stream and wait for all of them.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.streams.lock().keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!("stopping all {} active stream(s)", ids.len());
        futures::future::join_all(ids.iter().map(|id| self.stop(id))).await;
    }
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}
