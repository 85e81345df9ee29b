//! Service error taxonomy

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the engine pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No engine set became free before the deadline. Maps to a
    /// service-busy failure at session start.
    #[error("no engine set became available within {0:?}")]
    Exhausted(Duration),
}

/// Errors surfaced when opening a frame source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open source '{descriptor}': {reason}")]
    Open { descriptor: String, reason: String },
}

/// Errors surfaced by the stream manager.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The pipeline died within the start grace window, typically because
    /// the pool is exhausted or the source could not be opened.
    #[error("service busy: unable to start a new stream, try again later")]
    ServiceBusy,

    #[error("stream '{0}' not found")]
    NotFound(String),
}
