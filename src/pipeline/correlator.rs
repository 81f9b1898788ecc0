//! Attributes outfit captures to individual characters.
//!
//! For every capture the correlator asks the `event` collection for
//! `PlayerFacility` events within a second either side and keeps those that
//! describe the same capture and belong to a roster member. Captures are
//! processed by a bounded pool of workers, so results for different captures
//! can arrive in any order; the matches of one capture are always sent
//! together.

use super::PipelineError;
use crate::census::{self, Query, QueryService};
use crate::event::{capture_datetime, ActorEvent, WorldEvent};
use crate::resolve::{FacilityResolver, Roster};
use crate::retry::RetryPolicy;
use crate::PAGE_SIZE;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a finished correlation stage did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationSummary {
    /// Captures processed
    pub captures: usize,

    /// Captures with no attributable member, dropped
    pub unattributed: usize,

    /// Actor events forwarded
    pub attributed: usize,
}

impl CorrelationSummary {
    fn record(&mut self, joined: Result<Result<usize, PipelineError>, JoinError>) -> Result<(), PipelineError> {
        let matched = match joined {
            Ok(result) => result?,
            Err(e) => return Err(PipelineError::StageFailed(format!("correlation worker: {e}"))),
        };

        self.captures += 1;
        if matched == 0 {
            self.unattributed += 1;
        }
        self.attributed += matched;
        Ok(())
    }
}

pub struct Correlator {
    census: Arc<dyn QueryService>,
    retry: RetryPolicy,
    roster: Arc<Roster>,
    facilities: Arc<FacilityResolver>,
    abort: CancellationToken,
}

impl Correlator {
    pub fn new(
        census: Arc<dyn QueryService>,
        retry: RetryPolicy,
        roster: Arc<Roster>,
        facilities: Arc<FacilityResolver>,
    ) -> Self {
        Self {
            census,
            retry,
            roster,
            facilities,
            abort: CancellationToken::new(),
        }
    }

    /// Token that aborts in-flight correlation queries (used on pipeline faults).
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    pub fn correlation_query(capture: &WorldEvent) -> Query {
        Query::new("event")
            .where_eq("type", "PlayerFacility")
            .where_eq("after", capture.timestamp - 1)
            .where_eq("before", capture.timestamp + 1)
            .with_limit(PAGE_SIZE)
    }

    /// Roster members credited with `capture`.
    ///
    /// A capture nobody on the roster is credited with is logged and yields an
    /// empty vector. Exhausted retries are returned as errors.
    pub async fn correlate(&self, capture: &WorldEvent) -> Result<Vec<ActorEvent>, PipelineError> {
        let query = Self::correlation_query(capture);
        let candidates: Vec<ActorEvent> = self
            .retry
            .execute("query player facility events", || {
                census::get_list(self.census.as_ref(), &query, &self.abort)
            })
            .await?;

        let queried = candidates.len();
        let matched: Vec<ActorEvent> = candidates
            .into_iter()
            .filter(|actor| actor.matches(capture) && self.roster.is_member(actor.character_id))
            .collect();

        if matched.is_empty() {
            let facility = self.facilities.get(capture.facility_id).await?;
            warn!(
                facility_id = capture.facility_id,
                facility = %facility.facility_name,
                captured_at = %capture_datetime(capture.timestamp),
                "Found a facility capture with no associated player events on {} for {}. This can occur due to all the players leaving the base before the capture timer hits zero (or API weirdness).",
                capture_datetime(capture.timestamp),
                facility.facility_name
            );
        } else {
            debug!(
                facility_id = capture.facility_id,
                timestamp = capture.timestamp,
                queried = queried,
                matched = matched.len(),
                "Correlated capture"
            );
        }

        Ok(matched)
    }

    /// Correlate every capture from `captures` with up to `parallelism`
    /// queries in flight.
    ///
    /// Returns once `captures` is closed and every worker has finished, or
    /// as soon as any worker fails, even while `captures` is still open.
    /// Dropping the returned future aborts the outstanding workers.
    pub async fn run(
        self: Arc<Self>,
        mut captures: mpsc::Receiver<WorldEvent>,
        actors: mpsc::Sender<Vec<ActorEvent>>,
        parallelism: usize,
    ) -> Result<CorrelationSummary, PipelineError> {
        let permits = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut workers = JoinSet::new();
        let mut summary = CorrelationSummary::default();

        loop {
            tokio::select! {
                biased;

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    summary.record(joined)?;
                }

                received = captures.recv() => {
                    let Some(capture) = received else { break };

                    let permit = permits
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| PipelineError::StageFailed(format!("correlation pool closed: {e}")))?;

                    let correlator = self.clone();
                    let actors = actors.clone();
                    workers.spawn(async move {
                        let _permit = permit;
                        let matched = correlator.correlate(&capture).await?;
                        let count = matched.len();

                        if count > 0 && actors.send(matched).await.is_err() {
                            return Err(PipelineError::Disconnected("output collector"));
                        }
                        Ok(count)
                    });
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            summary.record(joined)?;
        }

        info!(
            captures = summary.captures,
            attributed = summary.attributed,
            unattributed = summary.unattributed,
            "Correlation finished"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::census::CensusError;
    use crate::resolve::{OutfitInfo, ResolveError};
    use crate::test_support::ScriptedQueryService;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const OUTFIT: u64 = 100;

    fn roster() -> Arc<Roster> {
        let outfit = OutfitInfo {
            outfit_id: OUTFIT,
            name: "Test Outfit".to_string(),
            alias: "TEST".to_string(),
            member_count: 2,
        };
        let names = HashMap::from([(1, "Alpha".to_string()), (2, "Bravo".to_string())]);
        Arc::new(Roster::new(outfit, names))
    }

    fn capture(timestamp: i64, facility_id: u32) -> WorldEvent {
        WorldEvent {
            facility_id,
            faction_old: 1,
            faction_new: 2,
            timestamp,
            zone_id: 2,
            world_id: 13,
            outfit_id: OUTFIT,
        }
    }

    fn actor(character_id: u64, timestamp: i64, facility_id: u32) -> Value {
        json!({
            "character_id": character_id.to_string(),
            "facility_id": facility_id.to_string(),
            "outfit_id": OUTFIT.to_string(),
            "timestamp": timestamp.to_string(),
            "zone_id": "2",
            "world_id": "13",
            "event_type": "PlayerFacilityCapture"
        })
    }

    fn region(facility_id: u32) -> Value {
        json!({
            "facility_id": facility_id.to_string(),
            "zone_id": "2",
            "facility_name": format!("Facility {facility_id}"),
            "facility_type_id": "5",
            "facility_type": "Large Outpost"
        })
    }

    fn correlator(census: Arc<ScriptedQueryService>) -> Arc<Correlator> {
        let retry = RetryPolicy::new(6, Duration::from_millis(1));
        let facilities = Arc::new(FacilityResolver::new(census.clone(), retry, 16));
        Arc::new(Correlator::new(census, retry, roster(), facilities))
    }

    #[test]
    fn test_correlation_query() {
        let query = Correlator::correlation_query(&capture(1_700_000_000, 7));
        assert_eq!(
            query.query_string(),
            "type=PlayerFacility&after=1699999999&before=1700000001&c:limit=1000"
        );
    }

    #[tokio::test]
    async fn test_only_roster_members_are_attributed() {
        let census = Arc::new(ScriptedQueryService::new());
        census.respond(
            "event",
            Ok(vec![
                actor(1, 50, 7),
                actor(999, 50, 7),
                actor(2, 49, 7),
                actor(2, 50, 8),
            ]),
        );

        let matched = correlator(census.clone()).correlate(&capture(50, 7)).await.unwrap();

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].character_id, 1);
        assert_eq!(census.calls("map_region"), 0);
    }

    #[tokio::test]
    async fn test_zero_matches_is_not_an_error() {
        let census = Arc::new(ScriptedQueryService::new());
        census.respond("event", Ok(vec![actor(999, 50, 7)]));
        census.respond("map_region", Ok(vec![region(7)]));

        let matched = correlator(census.clone()).correlate(&capture(50, 7)).await.unwrap();

        assert!(matched.is_empty());
        assert_eq!(census.calls("map_region"), 1);
    }

    #[tokio::test]
    async fn test_correlation_failure_is_fatal() {
        let census = Arc::new(ScriptedQueryService::new());
        census.respond_with("event", |_| Err(CensusError::Status { status: 502 }));

        let result = correlator(census.clone()).correlate(&capture(50, 7)).await;

        assert!(matches!(
            result,
            Err(PipelineError::Census(CensusError::Status { status: 502 }))
        ));
        assert_eq!(census.calls("event"), 7);
    }

    #[tokio::test]
    async fn test_unknown_facility_on_empty_capture_is_fatal() {
        let census = Arc::new(ScriptedQueryService::new());

        let result = correlator(census).correlate(&capture(50, 7)).await;
        assert!(matches!(
            result,
            Err(PipelineError::Resolve(ResolveError::FacilityNotFound(7)))
        ));
    }

    #[tokio::test]
    async fn test_run_sends_each_capture_together() {
        let census = Arc::new(ScriptedQueryService::new());
        census.respond_with("event", |query| {
            let before: i64 = query.term("before").unwrap().parse().unwrap();
            let ts = before - 1;
            Ok(vec![actor(1, ts, 7), actor(2, ts, 7), actor(3, ts, 7)])
        });

        let (capture_tx, capture_rx) = mpsc::channel(8);
        let (actor_tx, mut actor_rx) = mpsc::channel(8);
        let run = tokio::spawn(correlator(census).run(capture_rx, actor_tx, 4));

        for ts in 1..=10 {
            capture_tx.send(capture(ts, 7)).await.unwrap();
        }
        drop(capture_tx);

        let mut groups = Vec::new();
        while let Some(group) = actor_rx.recv().await {
            groups.push(group);
        }
        let summary = run.await.unwrap().unwrap();

        assert_eq!(groups.len(), 10);
        for group in &groups {
            assert_eq!(group.len(), 2);
            assert_eq!(group[0].timestamp, group[1].timestamp);
        }
        assert_eq!(
            summary,
            CorrelationSummary {
                captures: 10,
                unattributed: 0,
                attributed: 20,
            }
        );
    }

    #[tokio::test]
    async fn test_run_respects_parallelism() {
        struct Gauge {
            current: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl QueryService for Gauge {
            async fn fetch(
                &self,
                _query: &Query,
                _cancel: &CancellationToken,
            ) -> Result<Vec<Value>, CensusError> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(vec![actor(1, 0, 7)])
            }
        }

        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let retry = RetryPolicy::new(0, Duration::from_millis(1));
        let facilities = Arc::new(FacilityResolver::new(gauge.clone(), retry, 16));
        let correlator = Arc::new(Correlator::new(gauge.clone(), retry, roster(), facilities));

        let (capture_tx, capture_rx) = mpsc::channel(32);
        let (actor_tx, mut actor_rx) = mpsc::channel(32);
        for _ in 0..12 {
            capture_tx.send(capture(0, 7)).await.unwrap();
        }
        drop(capture_tx);

        let summary = correlator.run(capture_rx, actor_tx, 3).await.unwrap();
        let mut groups = 0;
        while actor_rx.recv().await.is_some() {
            groups += 1;
        }

        assert_eq!(summary.captures, 12);
        assert_eq!(groups, 12);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_run_surfaces_worker_errors() {
        let census = Arc::new(ScriptedQueryService::new());
        census.respond_with("event", |_| Err(CensusError::Api("Invalid query".into())));

        let (capture_tx, capture_rx) = mpsc::channel(8);
        let (actor_tx, _actor_rx) = mpsc::channel(8);
        capture_tx.send(capture(1, 7)).await.unwrap();
        drop(capture_tx);

        let result = correlator(census).run(capture_rx, actor_tx, 4).await;
        assert!(matches!(result, Err(PipelineError::Census(CensusError::Api(_)))));
    }

    #[tokio::test]
    async fn test_run_fails_without_waiting_for_more_captures() {
        let census = Arc::new(ScriptedQueryService::new());
        census.respond_with("event", |_| Err(CensusError::Api("Invalid query".into())));

        let (capture_tx, capture_rx) = mpsc::channel(8);
        let (actor_tx, _actor_rx) = mpsc::channel(8);
        capture_tx.send(capture(1, 7)).await.unwrap();

        // capture_tx stays open for the whole run
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            correlator(census).run(capture_rx, actor_tx, 4),
        )
        .await
        .expect("worker error was held until the input closed");

        assert!(matches!(result, Err(PipelineError::Census(CensusError::Api(_)))));
        drop(capture_tx);
    }

    #[tokio::test]
    async fn test_run_counts_unattributed_captures() {
        let census = Arc::new(ScriptedQueryService::new());
        census.respond_with("event", |query| {
            let before: i64 = query.term("before").unwrap().parse().unwrap();
            let ts = before - 1;
            if ts % 2 == 0 {
                Ok(vec![actor(999, ts, 7)])
            } else {
                Ok(vec![actor(1, ts, 7)])
            }
        });
        census.respond("map_region", Ok(vec![region(7)]));

        let (capture_tx, capture_rx) = mpsc::channel(8);
        let (actor_tx, mut actor_rx) = mpsc::channel(8);
        for ts in 1..=4 {
            capture_tx.send(capture(ts, 7)).await.unwrap();
        }
        drop(capture_tx);

        let summary = correlator(census.clone()).run(capture_rx, actor_tx, 2).await.unwrap();
        let mut groups = 0;
        while actor_rx.recv().await.is_some() {
            groups += 1;
        }

        assert_eq!(
            summary,
            CorrelationSummary {
                captures: 4,
                unattributed: 2,
                attributed: 2,
            }
        );
        assert_eq!(groups, 2);
        assert_eq!(census.calls("map_region"), 1);
    }
}
