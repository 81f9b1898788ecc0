//! In-memory [`QueryService`] for tests.

use crate::census::{CensusError, Query, QueryService};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tokio_util::sync::CancellationToken;

type Handler = Box<dyn Fn(&Query) -> Result<Vec<Value>, CensusError> + Send + Sync>;

/// Replays canned responses per collection.
///
/// Queued responses are consumed first, in order. After the queue for a
/// collection is drained, the collection's handler (if any) answers. With
/// neither, the query returns no rows.
#[derive(Default)]
pub struct ScriptedQueryService {
    queued: Mutex<HashMap<String, VecDeque<Result<Vec<Value>, CensusError>>>>,
    handlers: Mutex<HashMap<String, Handler>>,
    log: Mutex<Vec<Query>>,
}

impl ScriptedQueryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response for the next query on `collection`.
    pub fn respond(&self, collection: &str, response: Result<Vec<Value>, CensusError>) {
        self.queued
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push_back(response);
    }

    /// Answer every (unqueued) query on `collection` with `handler`.
    pub fn respond_with<F>(&self, collection: &str, handler: F)
    where
        F: Fn(&Query) -> Result<Vec<Value>, CensusError> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .insert(collection.to_string(), Box::new(handler));
    }

    /// Every query issued against `collection`, in order.
    pub fn queries(&self, collection: &str) -> Vec<Query> {
        self.log
            .lock()
            .iter()
            .filter(|q| q.collection() == collection)
            .cloned()
            .collect()
    }

    pub fn calls(&self, collection: &str) -> usize {
        self.queries(collection).len()
    }
}

#[async_trait]
impl QueryService for ScriptedQueryService {
    async fn fetch(
        &self,
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, CensusError> {
        if cancel.is_cancelled() {
            return Err(CensusError::Cancelled);
        }

        self.log.lock().push(query.clone());

        let queued = self
            .queued
            .lock()
            .get_mut(query.collection())
            .and_then(|queue| queue.pop_front());
        if let Some(response) = queued {
            return response;
        }

        match self.handlers.lock().get(query.collection()) {
            Some(handler) => handler(query),
            None => Ok(Vec::new()),
        }
    }
}
