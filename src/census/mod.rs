//! Census REST query boundary.
//!
//! Everything the pipeline knows about the remote API goes through the
//! [`QueryService`] trait. The production implementation is
//! [`HttpQueryService`]; tests substitute a scripted fake.
//!
//! ## Implementing a transport
//!
//! ```rust,ignore
//! use capstream::census::{CensusError, Query, QueryService};
//! use async_trait::async_trait;
//! use serde_json::Value;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Offline;
//!
//! #[async_trait]
//! impl QueryService for Offline {
//!     async fn fetch(&self, _query: &Query, _cancel: &CancellationToken) -> Result<Vec<Value>, CensusError> {
//!         Ok(Vec::new())
//!     }
//! }
//! ```

pub mod de;
pub mod http;
pub mod query;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use http::HttpQueryService;
pub use query::Query;

/// Errors raised while talking to the Census API.
#[derive(Error, Debug)]
pub enum CensusError {
    /// Connection, TLS or protocol failure
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The request exceeded its deadline
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Non-success HTTP status
    #[error("census returned HTTP {status}")]
    Status { status: u16 },

    /// The service answered with an error document
    #[error("census error: {0}")]
    Api(String),

    /// The body was not the JSON shape we expected
    #[error("failed to decode census response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The caller cancelled the request
    #[error("request cancelled")]
    Cancelled,
}

impl CensusError {
    /// Whether retrying the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CensusError::Transport(e) => !e.is_builder() && !e.is_decode(),
            CensusError::Timeout(_) => true,
            CensusError::Status { status } => *status >= 500 || *status == 429,
            CensusError::Api(_) | CensusError::Decode(_) | CensusError::Cancelled => false,
        }
    }
}

/// Executes [`Query`]s against a Census-like backend.
///
/// Returns the raw rows of the result list. An empty vector means the query
/// matched nothing, which is a valid outcome and not an error.
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn fetch(
        &self,
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, CensusError>;
}

/// Fetch and decode every row of a query.
pub async fn get_list<T: DeserializeOwned>(
    service: &dyn QueryService,
    query: &Query,
    cancel: &CancellationToken,
) -> Result<Vec<T>, CensusError> {
    let rows = service.fetch(query, cancel).await?;
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(CensusError::from))
        .collect()
}

/// Fetch and decode the first row of a query, `None` when nothing matched.
pub async fn get_one<T: DeserializeOwned>(
    service: &dyn QueryService,
    query: &Query,
    cancel: &CancellationToken,
) -> Result<Option<T>, CensusError> {
    let rows = service.fetch(query, cancel).await?;
    match rows.into_iter().next() {
        Some(row) => Ok(Some(serde_json::from_value(row)?)),
        None => Ok(None),
    }
}

/// Pull the result rows out of a Census response document.
///
/// A missing list is treated as "no results"; an `error` or `errorMessage`
/// key becomes [`CensusError::Api`].
pub fn extract_rows(list_key: &str, document: Value) -> Result<Vec<Value>, CensusError> {
    let Value::Object(mut map) = document else {
        return Err(CensusError::Api("response was not a JSON object".into()));
    };

    if let Some(message) = map
        .get("error")
        .or_else(|| map.get("errorMessage"))
        .or_else(|| map.get("errorCode"))
    {
        let message = match message {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(CensusError::Api(message));
    }

    match map.remove(list_key) {
        Some(Value::Array(rows)) => Ok(rows),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(other) => Err(CensusError::Api(format!(
            "expected '{}' to be an array, got {}",
            list_key, other
        ))),
    }
}
