//! reqwest-backed [`QueryService`].
//!
//! # Example
//!
//! ```rust,ignore
//! use capstream::census::HttpQueryService;
//! use std::time::Duration;
//!
//! let census = HttpQueryService::new("https://census.daybreakgames.com/", "example")
//!     .with_namespace("ps2:v2")
//!     .with_timeout(Duration::from_secs(30));
//! ```

use super::{extract_rows, CensusError, Query, QueryService};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default timeout for a single Census request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Public Census endpoint
pub const DEFAULT_ROOT_ENDPOINT: &str = "https://census.daybreakgames.com/";

/// Default game namespace
pub const DEFAULT_NAMESPACE: &str = "ps2:v2";

/// Talks to the Census REST API over HTTPS.
///
/// Does not retry on its own; wrap calls in a
/// [`RetryPolicy`](crate::retry::RetryPolicy).
#[derive(Debug, Clone)]
pub struct HttpQueryService {
    /// e.g. `https://census.daybreakgames.com/`
    root_endpoint: String,

    /// Service ID without the `s:` prefix
    service_id: String,

    namespace: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    timeout: Duration,
}

impl HttpQueryService {
    pub fn new(root_endpoint: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            root_endpoint: root_endpoint.into(),
            service_id: service_id.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set custom per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request(&self, query: &Query) -> RequestBuilder {
        let base = query.base_url(&self.root_endpoint, &self.service_id, &self.namespace);
        self.client
            .get(base)
            .query(&query.params())
            .timeout(self.timeout)
    }

    /// Encoded request URL for a query.
    pub fn url_for(&self, query: &Query) -> Result<Url, CensusError> {
        let request = self.request(query).build()?;
        Ok(request.url().clone())
    }

    async fn send(&self, query: &Query) -> Result<Vec<Value>, CensusError> {
        debug!(collection = %query.collection(), query = %query.query_string(), "Querying census");

        let response = self
            .request(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CensusError::Timeout(self.timeout)
                } else {
                    CensusError::Transport(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                status = %status,
                collection = %query.collection(),
                "Census returned an error status"
            );
            return Err(CensusError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let document: Value = serde_json::from_str(&body)?;
        extract_rows(&query.list_key(), document)
    }
}

#[async_trait]
impl QueryService for HttpQueryService {
    async fn fetch(
        &self,
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, CensusError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CensusError::Cancelled),
            result = self.send(query) => result,
        }
    }
}
