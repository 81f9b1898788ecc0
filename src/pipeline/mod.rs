//! The streaming-correlation pipeline.
//!
//! ```text
//! WorldEventStreamer ──batches──▶ filter ──batches──▶ flatten ──events──▶ Correlator ──actor events──▶ collector
//!      (paged, dedup)             (outfit +          (one event    (bounded worker       (facility lookup,
//!                                  owner change)      at a time)     pool)                 OutputRecord)
//! ```
//!
//! Stages are tokio tasks joined by bounded `mpsc` channels. A stage finishes
//! when its upstream channel closes and its own work is done, and dropping its
//! sender closes the next channel in turn. The first stage error cancels the
//! run's abort token and tears the remaining stages down, see
//! [`CapturePipeline::run`].

pub mod collector;
pub mod correlator;
pub mod filter;
pub mod orchestrator;
pub mod streamer;

use crate::census::CensusError;
use crate::resolve::ResolveError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

pub use correlator::{CorrelationSummary, Correlator};
pub use orchestrator::{CapturePipeline, CaptureWindow, PipelineSettings};
pub use streamer::{StreamSummary, WorldEventStreamer};

/// Errors that abort a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Census(#[from] CensusError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// A downstream stage went away before accepting our output
    #[error("{0} stage stopped accepting input")]
    Disconnected(&'static str),

    /// A stage panicked or was torn down
    #[error("pipeline stage failed: {0}")]
    StageFailed(String),
}

/// A progress notification for the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Earliest timestamp downloaded so far
    pub current_timestamp: Option<DateTime<Utc>>,

    /// Share of the time window downloaded, 0 to 100
    pub percentage: f64,

    /// Set once downloading is over and correlation is draining
    pub post_processing: bool,
}

impl ProgressUpdate {
    pub fn download(current_timestamp: DateTime<Utc>, percentage: f64) -> Self {
        Self {
            current_timestamp: Some(current_timestamp),
            percentage,
            post_processing: false,
        }
    }

    pub fn post_processing() -> Self {
        Self {
            current_timestamp: None,
            percentage: 100.0,
            post_processing: true,
        }
    }
}

/// Receives [`ProgressUpdate`]s. Called from pipeline tasks, so it must be cheap.
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// A callback that drops every update.
pub fn no_progress() -> ProgressCallback {
    Arc::new(|_| {})
}
