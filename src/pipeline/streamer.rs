//! Backward-in-time pager over the `world_event` collection.

use super::{PipelineError, ProgressCallback, ProgressUpdate};
use crate::census::{self, Query, QueryService};
use crate::dedup::DedupCache;
use crate::event::{capture_datetime, WorldEvent};
use crate::retry::RetryPolicy;
use crate::PAGE_SIZE;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a finished stream did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub pages: usize,
    pub events: usize,
    pub duplicates: usize,

    /// The caller asked to stop before the window was exhausted
    pub cancelled: bool,
}

/// Pages facility world events from `end` back to `start`.
///
/// Each page asks for events with `start < timestamp < cursor`, where the
/// cursor starts at `end` and moves to the earliest timestamp of every page.
/// Pages are deduplicated against a shared [`DedupCache`] and sent downstream
/// as one batch each, even when dedup leaves them empty.
pub struct WorldEventStreamer {
    census: Arc<dyn QueryService>,
    retry: RetryPolicy,
    dedup: Arc<DedupCache>,
    world_id: u32,
    start: i64,
    end: i64,
    page_size: usize,
    progress: ProgressCallback,
    abort: CancellationToken,
}

impl WorldEventStreamer {
    /// `start` and `end` are epoch seconds.
    pub fn new(
        census: Arc<dyn QueryService>,
        retry: RetryPolicy,
        dedup: Arc<DedupCache>,
        world_id: u32,
        start: i64,
        end: i64,
    ) -> Self {
        Self {
            census,
            retry,
            dedup,
            world_id,
            start,
            end,
            page_size: PAGE_SIZE,
            progress: super::no_progress(),
            abort: CancellationToken::new(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    /// Token that aborts an in-flight page request (used on pipeline faults).
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    /// Query for the page of events strictly before `cursor`.
    pub fn page_query(&self, cursor: i64) -> Query {
        Query::new("world_event")
            .where_eq("type", "facility")
            .where_eq("world_id", self.world_id)
            .where_eq("after", self.start)
            .where_eq("before", cursor)
            .with_limit(self.page_size)
    }

    /// Stream every page into `batches`.
    ///
    /// `cancel` is checked before each page request; cancelling ends the
    /// stream cleanly. Returns once the window is exhausted, a short or empty
    /// page arrives, or `cancel` fires.
    pub async fn run(
        &self,
        batches: mpsc::Sender<Vec<WorldEvent>>,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary, PipelineError> {
        let mut summary = StreamSummary::default();
        let mut cursor = self.end;
        let mut reported = 0.0_f64;

        info!(
            world_id = self.world_id,
            start = %capture_datetime(self.start),
            end = %capture_datetime(self.end),
            "Streaming facility capture events"
        );

        loop {
            if cancel.is_cancelled() {
                info!(pages = summary.pages, "Event stream cancelled");
                summary.cancelled = true;
                break;
            }

            debug!(before = %capture_datetime(cursor), "Retrieving capture events");
            let query = self.page_query(cursor);
            let page: Vec<WorldEvent> = self
                .retry
                .execute("retrieve a page of facility capture events", || {
                    census::get_list(self.census.as_ref(), &query, &self.abort)
                })
                .await?;

            let Some(earliest) = page.iter().map(|e| e.timestamp).min() else {
                debug!("Empty page, reached the end of the window");
                break;
            };

            let returned = page.len();
            summary.pages += 1;

            reported = reported.max(progress_percentage(self.start, self.end, earliest));
            (self.progress)(ProgressUpdate::download(capture_datetime(earliest), reported));

            if earliest < cursor {
                cursor = earliest;
            } else {
                // a full page sharing the cursor timestamp would never advance
                warn!(
                    cursor = cursor,
                    "Page did not move the cursor, stepping back one second"
                );
                cursor -= 1;
            }

            let (unique, duplicates) = self.deduplicate(page);
            summary.events += unique.len();
            summary.duplicates += duplicates;

            if batches.send(unique).await.is_err() {
                return Err(PipelineError::Disconnected("filter"));
            }

            if returned < self.page_size || cursor <= self.start {
                break;
            }
        }

        info!(
            pages = summary.pages,
            events = summary.events,
            duplicates = summary.duplicates,
            cancelled = summary.cancelled,
            "Event stream finished"
        );

        Ok(summary)
    }

    /// Drop events whose fingerprint was already seen this run.
    fn deduplicate(&self, page: Vec<WorldEvent>) -> (Vec<WorldEvent>, usize) {
        let received = page.len();
        let unique: Vec<WorldEvent> = page
            .into_iter()
            .filter(|event| self.dedup.insert_if_absent(event.fingerprint()))
            .collect();

        let duplicates = received - unique.len();
        if duplicates > 0 {
            info!(
                duplicates = duplicates,
                "{} duplicate events were dropped from this batch.", duplicates
            );
        }

        (unique, duplicates)
    }
}

/// Share of `[start, end]` covered once everything back to `earliest` is in.
pub fn progress_percentage(start: i64, end: i64, earliest: i64) -> f64 {
    if end <= start {
        return 100.0;
    }
    let covered = (end - earliest) as f64 / (end - start) as f64 * 100.0;
    covered.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::census::CensusError;
    use crate::test_support::ScriptedQueryService;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn event(timestamp: i64, facility_id: u32) -> Value {
        json!({
            "facility_id": facility_id.to_string(),
            "faction_old": "1",
            "faction_new": "2",
            "timestamp": timestamp.to_string(),
            "zone_id": "2",
            "world_id": "13",
            "outfit_id": "100"
        })
    }

    /// Serves `events` like the census does, newest first, treating `before`
    /// as inclusive so consecutive pages overlap at the boundary.
    fn serve(census: &ScriptedQueryService, events: Vec<(i64, u32)>) {
        census.respond_with("world_event", move |query| {
            let after: i64 = query.term("after").unwrap().parse().unwrap();
            let before: i64 = query.term("before").unwrap().parse().unwrap();
            let limit = query.limit().unwrap();

            let mut page: Vec<(i64, u32)> = events
                .iter()
                .copied()
                .filter(|(ts, _)| *ts > after && *ts <= before)
                .collect();
            page.sort_by(|a, b| b.0.cmp(&a.0));
            Ok(page.into_iter().take(limit).map(|(ts, f)| event(ts, f)).collect())
        });
    }

    fn streamer(census: Arc<ScriptedQueryService>, start: i64, end: i64) -> WorldEventStreamer {
        WorldEventStreamer::new(
            census,
            RetryPolicy::new(6, Duration::from_millis(1)),
            Arc::new(DedupCache::default()),
            13,
            start,
            end,
        )
        .with_page_size(3)
    }

    async fn drain(mut rx: mpsc::Receiver<Vec<WorldEvent>>) -> Vec<Vec<WorldEvent>> {
        let mut batches = Vec::new();
        while let Some(batch) = rx.recv().await {
            batches.push(batch);
        }
        batches
    }

    #[test]
    fn test_progress_percentage() {
        assert_eq!(progress_percentage(0, 100, 100), 0.0);
        assert_eq!(progress_percentage(0, 100, 25), 75.0);
        assert_eq!(progress_percentage(0, 100, 0), 100.0);
        assert_eq!(progress_percentage(0, 100, -50), 100.0);
        assert_eq!(progress_percentage(10, 10, 10), 100.0);
    }

    #[test]
    fn test_page_query() {
        let census = Arc::new(ScriptedQueryService::new());
        let query = streamer(census, 1_000, 2_000).with_page_size(1000).page_query(1_500);

        assert_eq!(
            query.query_string(),
            "type=facility&world_id=13&after=1000&before=1500&c:limit=1000"
        );
    }

    #[tokio::test]
    async fn test_overlapping_pages_are_deduplicated() {
        let census = Arc::new(ScriptedQueryService::new());
        serve(&census, vec![(10, 1), (9, 1), (8, 1), (8, 2), (7, 1), (6, 1)]);

        let (tx, rx) = mpsc::channel(16);
        let summary = streamer(census.clone(), 0, 11)
            .run(tx, &CancellationToken::new())
            .await
            .unwrap();
        let batches = drain(rx).await;

        let flattened: Vec<(i64, u32)> = batches
            .iter()
            .flatten()
            .map(|e| (e.timestamp, e.facility_id))
            .collect();
        assert_eq!(flattened, vec![(10, 1), (9, 1), (8, 1), (8, 2), (7, 1), (6, 1)]);

        assert_eq!(summary.pages, 3);
        assert_eq!(summary.events, 6);
        assert_eq!(summary.duplicates, 2);
        assert!(!summary.cancelled);

        let befores: Vec<String> = census
            .queries("world_event")
            .iter()
            .map(|q| q.term("before").unwrap().to_string())
            .collect();
        assert_eq!(befores, vec!["11", "8", "7"]);
    }

    #[tokio::test]
    async fn test_fully_duplicated_page_still_emits_and_reports() {
        let census = Arc::new(ScriptedQueryService::new());
        census.respond("world_event", Ok(vec![event(9, 1), event(8, 1), event(7, 1)]));
        census.respond("world_event", Ok(vec![event(9, 1), event(8, 1), event(7, 1)]));
        census.respond("world_event", Ok(vec![]));

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let (tx, rx) = mpsc::channel(16);

        streamer(census, 0, 10)
            .with_progress(Arc::new(move |u: ProgressUpdate| sink.lock().push(u)))
            .run(tx, &CancellationToken::new())
            .await
            .unwrap();
        let batches = drain(rx).await;

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 3);
        assert!(batches[1].is_empty());
        assert_eq!(updates.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let census = Arc::new(ScriptedQueryService::new());
        serve(&census, (1..=10).map(|ts| (ts * 10, 1)).collect());

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let (tx, rx) = mpsc::channel(16);

        streamer(census, 0, 100)
            .with_progress(Arc::new(move |u: ProgressUpdate| sink.lock().push(u.percentage)))
            .run(tx, &CancellationToken::new())
            .await
            .unwrap();
        drain(rx).await;

        let updates = updates.lock();
        assert!(!updates.is_empty());
        assert!(updates.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*updates.last().unwrap(), 90.0);
    }

    #[tokio::test]
    async fn test_empty_window_ends_without_error() {
        let census = Arc::new(ScriptedQueryService::new());
        let (tx, rx) = mpsc::channel(16);

        let summary = streamer(census, 0, 100)
            .run(tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary, StreamSummary::default());
        assert!(drain(rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_page() {
        let census = Arc::new(ScriptedQueryService::new());
        serve(&census, (1..=10).map(|ts| (ts, 1)).collect());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let (tx, rx) = mpsc::channel(16);
        let summary = streamer(census.clone(), 0, 11)
            .with_progress(Arc::new(move |_: ProgressUpdate| trigger.cancel()))
            .run(tx, &cancel)
            .await
            .unwrap();
        let batches = drain(rx).await;

        assert!(summary.cancelled);
        assert_eq!(summary.pages, 1);
        assert_eq!(batches.len(), 1);
        assert_eq!(census.calls("world_event"), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_abort_the_stream() {
        let census = Arc::new(ScriptedQueryService::new());
        census.respond_with("world_event", |_| Err(CensusError::Status { status: 500 }));
        let (tx, _rx) = mpsc::channel(16);

        let result = streamer(census.clone(), 0, 10)
            .run(tx, &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::Census(CensusError::Status { status: 500 }))
        ));
        assert_eq!(census.calls("world_event"), 7);
    }

    #[tokio::test]
    async fn test_closed_downstream_is_an_error() {
        let census = Arc::new(ScriptedQueryService::new());
        census.respond("world_event", Ok(vec![event(5, 1)]));
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let result = streamer(census, 0, 10).run(tx, &CancellationToken::new()).await;
        assert!(matches!(result, Err(PipelineError::Disconnected("filter"))));
    }
}
