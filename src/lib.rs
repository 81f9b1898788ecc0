//! # capstream
//!
//! Builds a per-character leaderboard of facility captures for one outfit by
//! correlating two Census event streams.
//!
//! ## Architecture
//!
//! ```text
//! RosterResolver ──▶ CapturePipeline
//!                     WorldEventStreamer -> filter -> flatten -> Correlator -> collector
//!                                                                   │             │
//!                                                              event query   FacilityResolver
//! ```
//!
//! ## Modules
//!
//! - [`census`]: Query model, transport trait and the HTTP implementation
//! - [`event`]: World events, actor events and output records
//! - [`retry`]: Exponential backoff around Census calls
//! - [`dedup`]: Bounded fingerprint cache for overlapping pages
//! - [`resolve`]: Outfit roster and facility metadata lookups
//! - [`pipeline`]: The streaming-correlation pipeline
//! - [`report`]: JSON output and the summary table

pub mod census;
pub mod config;
pub mod dedup;
pub mod event;
pub mod pipeline;
pub mod report;
pub mod resolve;
pub mod retry;
pub mod shutdown;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at crate root
pub use census::{CensusError, HttpQueryService, Query, QueryService};
pub use config::CapstreamConfig;
pub use event::{ActorEvent, OutputRecord, WorldEvent};
pub use pipeline::{CapturePipeline, CaptureWindow, PipelineError, PipelineSettings, ProgressUpdate};
pub use resolve::{ResolveError, Roster, RosterResolver};
pub use retry::RetryPolicy;

/// Rows requested per Census page
pub const PAGE_SIZE: usize = 1000;

/// Cobalt
pub const DEFAULT_WORLD_ID: u32 = 13;

/// Correlation queries in flight at once
pub const DEFAULT_CORRELATOR_PARALLELISM: usize = 4;

/// Buffer size of the channels between pipeline stages
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
