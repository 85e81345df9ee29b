//! Face stream service configuration

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub models: ModelsConfig,
    pub recognition: RecognitionConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub rest_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    pub device: String,
    /// Number of detector+recognizer sets built at startup. Also the maximum
    /// number of concurrently running streams.
    pub pool_capacity: usize,
    /// How long a starting stream waits for a free engine set. Kept below
    /// the start grace window so pool exhaustion surfaces as a service-busy
    /// failure at start time.
    pub acquire_timeout_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    pub similarity_threshold: f32,
    pub detection_threshold: f32,
    pub embedding_dim: usize,
    /// Side length of aligned crops. Must be a multiple of 112 or 128.
    pub align_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Capacity of every inter-stage queue and of the output queue.
    pub queue_capacity: usize,
    /// Default stream lifetime in minutes; -1 means the stream never expires.
    pub default_lifetime_minutes: i64,
    pub sweeper_interval_secs: u64,
    /// Grace window after spawning a driver thread before the stream is
    /// declared started.
    pub start_grace_ms: u64,
    /// Dequeue poll used by every stage so workers stay responsive to stop.
    pub stage_poll_ms: u64,
    /// Per-thread join budget during teardown.
    pub stop_join_timeout_secs: u64,
    pub jpeg_quality: u8,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig { rest_port: 3000 },
            inference: InferenceConfig {
                device: "CPU".to_string(),
                pool_capacity: 3,
                acquire_timeout_secs: 0.1,
            },
            models: ModelsConfig {
                detector: PathBuf::from("models/scrfd_10g_kps.onnx"),
                recognizer: PathBuf::from("models/glint360k_r100.onnx"),
            },
            recognition: RecognitionConfig {
                similarity_threshold: 0.5,
                detection_threshold: 0.5,
                embedding_dim: 512,
                align_size: 112,
            },
            stream: StreamConfig {
                queue_capacity: 30,
                default_lifetime_minutes: 10,
                sweeper_interval_secs: 60,
                start_grace_ms: 200,
                stage_poll_ms: 200,
                stop_join_timeout_secs: 1,
                jpeg_quality: 80,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = Config::default();
        assert_eq!(config.stream.queue_capacity, 30);
        assert_eq!(config.stream.default_lifetime_minutes, 10);
        assert!(config.recognition.align_size % 112 == 0 || config.recognition.align_size % 128 == 0);
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
            [server]
            rest_port = 8080

            [inference]
            device = "GPU"
            pool_capacity = 2
            acquire_timeout_secs = 1.0

            [models]
            detector = "det.onnx"
            recognizer = "rec.onnx"

            [recognition]
            similarity_threshold = 0.6
            detection_threshold = 0.5
            embedding_dim = 512
            align_size = 112

            [stream]
            queue_capacity = 16
            default_lifetime_minutes = -1
            sweeper_interval_secs = 30
            start_grace_ms = 100
            stage_poll_ms = 100
            stop_join_timeout_secs = 2
            jpeg_quality = 90
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.rest_port, 8080);
        assert_eq!(config.inference.pool_capacity, 2);
        assert_eq!(config.stream.default_lifetime_minutes, -1);
    }
}
