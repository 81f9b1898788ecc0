//! Stage wiring, completion and fault propagation.

use super::collector;
use super::correlator::{CorrelationSummary, Correlator};
use super::filter;
use super::streamer::{StreamSummary, WorldEventStreamer};
use super::{PipelineError, ProgressCallback, ProgressUpdate};
use crate::census::{CensusError, QueryService};
use crate::dedup::{DedupCache, DEFAULT_DEDUP_CAPACITY};
use crate::event::OutputRecord;
use crate::resolve::{FacilityResolver, ResolveError, Roster, DEFAULT_FACILITY_CACHE_CAPACITY};
use crate::retry::RetryPolicy;
use crate::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_CORRELATOR_PARALLELISM, PAGE_SIZE};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The world and time range to report on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureWindow {
    pub world_id: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Sizing knobs for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Rows requested per `world_event` page
    pub page_size: usize,

    /// Correlation queries in flight at once
    pub correlator_parallelism: usize,

    /// Buffer size of every inter-stage channel
    pub channel_capacity: usize,

    pub dedup_capacity: usize,
    pub facility_cache_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            correlator_parallelism: DEFAULT_CORRELATOR_PARALLELISM,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            facility_cache_capacity: DEFAULT_FACILITY_CACHE_CAPACITY,
        }
    }
}

enum StageOutcome {
    Streamed(StreamSummary),
    Filtered(usize),
    Flattened(usize),
    Correlated(CorrelationSummary),
    Collected(Vec<OutputRecord>),
}

impl PipelineError {
    /// Errors that are a consequence of another stage failing first.
    fn is_secondary(&self) -> bool {
        matches!(
            self,
            PipelineError::Disconnected(_)
                | PipelineError::Census(CensusError::Cancelled)
                | PipelineError::Resolve(ResolveError::Census(CensusError::Cancelled))
        )
    }
}

/// Runs the capture pipeline.
///
/// ```rust,ignore
/// let pipeline = CapturePipeline::new(census, RetryPolicy::default());
/// let records = pipeline
///     .run(roster, window, no_progress(), CancellationToken::new())
///     .await?;
/// ```
pub struct CapturePipeline {
    census: Arc<dyn QueryService>,
    retry: RetryPolicy,
    settings: PipelineSettings,
}

impl CapturePipeline {
    pub fn new(census: Arc<dyn QueryService>, retry: RetryPolicy) -> Self {
        Self {
            census,
            retry,
            settings: PipelineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Stream, filter, correlate and collect every capture in `window`
    /// credited to the roster's outfit.
    ///
    /// `cancel` stops paging before the next page; whatever was already
    /// downloaded still drains through the pipeline and is returned. The first
    /// stage failure aborts the others and is returned instead.
    pub async fn run(
        &self,
        roster: Arc<Roster>,
        window: CaptureWindow,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<Vec<OutputRecord>, PipelineError> {
        let settings = &self.settings;
        let capacity = settings.channel_capacity.max(1);
        let abort = CancellationToken::new();

        let facilities = Arc::new(
            FacilityResolver::new(
                self.census.clone(),
                self.retry,
                settings.facility_cache_capacity,
            )
            .with_cancellation(abort.clone()),
        );

        let streamer = WorldEventStreamer::new(
            self.census.clone(),
            self.retry,
            Arc::new(DedupCache::new(settings.dedup_capacity)),
            window.world_id,
            window.start.timestamp(),
            window.end.timestamp(),
        )
        .with_page_size(settings.page_size)
        .with_progress(progress.clone())
        .with_abort(abort.clone());

        let correlator = Arc::new(
            Correlator::new(
                self.census.clone(),
                self.retry,
                roster.clone(),
                facilities.clone(),
            )
            .with_abort(abort.clone()),
        );

        let (page_tx, page_rx) = mpsc::channel(capacity);
        let (filtered_tx, filtered_rx) = mpsc::channel(capacity);
        let (capture_tx, capture_rx) = mpsc::channel(capacity);
        let (actor_tx, actor_rx) = mpsc::channel(capacity);

        let outfit_id = roster.outfit().outfit_id;
        let parallelism = settings.correlator_parallelism;
        let window_start = window.start;

        let mut stages: JoinSet<Result<StageOutcome, PipelineError>> = JoinSet::new();

        stages.spawn(async move {
            let summary = streamer.run(page_tx, &cancel).await?;
            progress(ProgressUpdate::download(window_start, 100.0));
            progress(ProgressUpdate::post_processing());
            Ok(StageOutcome::Streamed(summary))
        });
        stages.spawn(async move {
            filter::run_filter(page_rx, filtered_tx, outfit_id)
                .await
                .map(StageOutcome::Filtered)
        });
        stages.spawn(async move {
            filter::run_flatten(filtered_rx, capture_tx)
                .await
                .map(StageOutcome::Flattened)
        });
        stages.spawn(async move {
            correlator
                .run(capture_rx, actor_tx, parallelism)
                .await
                .map(StageOutcome::Correlated)
        });
        stages.spawn(async move {
            collector::collect(actor_rx, &roster, &facilities)
                .await
                .map(StageOutcome::Collected)
        });

        let mut records = None;
        let mut secondary = None;

        while let Some(joined) = stages.join_next().await {
            let result = joined
                .map_err(|e| PipelineError::StageFailed(e.to_string()))
                .and_then(|result| result);

            match result {
                Ok(StageOutcome::Streamed(summary)) => {
                    info!(
                        pages = summary.pages,
                        events = summary.events,
                        cancelled = summary.cancelled,
                        "Download finished, waiting for correlation to drain"
                    );
                }
                Ok(StageOutcome::Filtered(kept)) => debug!(kept = kept, "Filter stage finished"),
                Ok(StageOutcome::Flattened(forwarded)) => {
                    debug!(forwarded = forwarded, "Flatten stage finished")
                }
                Ok(StageOutcome::Correlated(summary)) => {
                    debug!(captures = summary.captures, "Correlation stage finished")
                }
                Ok(StageOutcome::Collected(collected)) => records = Some(collected),
                Err(e) if e.is_secondary() => {
                    debug!(error = %e, "Stage stopped after an upstream fault");
                    abort.cancel();
                    secondary.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Pipeline stage failed, aborting run");
                    abort.cancel();
                    stages.abort_all();
                    return Err(e);
                }
            }
        }

        if let Some(e) = secondary {
            error!(error = %e, "Pipeline aborted");
            return Err(e);
        }

        let records = records
            .ok_or_else(|| PipelineError::StageFailed("collector produced no result".into()))?;
        info!(records = records.len(), "Pipeline finished");
        Ok(records)
    }
}
