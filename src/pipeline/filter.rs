//! Outfit filter and flatten stages.

use super::PipelineError;
use crate::event::WorldEvent;
use tokio::sync::mpsc;
use tracing::debug;

/// A capture credited to `outfit_id` that actually changed ownership.
pub fn is_relevant(event: &WorldEvent, outfit_id: u64) -> bool {
    event.outfit_id == outfit_id && event.changed_owner()
}

pub fn filter_batch(batch: Vec<WorldEvent>, outfit_id: u64) -> Vec<WorldEvent> {
    batch
        .into_iter()
        .filter(|event| is_relevant(event, outfit_id))
        .collect()
}

/// Keep only the outfit's captures from every batch.
///
/// Batches that end up empty are not forwarded. Returns the number of events
/// kept.
pub async fn run_filter(
    mut batches: mpsc::Receiver<Vec<WorldEvent>>,
    filtered: mpsc::Sender<Vec<WorldEvent>>,
    outfit_id: u64,
) -> Result<usize, PipelineError> {
    let mut kept = 0;

    while let Some(batch) = batches.recv().await {
        let received = batch.len();
        let batch = filter_batch(batch, outfit_id);
        debug!(received = received, kept = batch.len(), "Filtered batch");

        if batch.is_empty() {
            continue;
        }
        kept += batch.len();

        if filtered.send(batch).await.is_err() {
            return Err(PipelineError::Disconnected("flatten"));
        }
    }

    Ok(kept)
}

/// Unpack batches into individual events for the correlator.
pub async fn run_flatten(
    mut batches: mpsc::Receiver<Vec<WorldEvent>>,
    events: mpsc::Sender<WorldEvent>,
) -> Result<usize, PipelineError> {
    let mut forwarded = 0;

    while let Some(batch) = batches.recv().await {
        for event in batch {
            if events.send(event).await.is_err() {
                return Err(PipelineError::Disconnected("correlator"));
            }
            forwarded += 1;
        }
    }

    Ok(forwarded)
}
