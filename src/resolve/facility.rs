//! Facility (map region) metadata.

use super::ResolveError;
use crate::census::{self, de, Query, QueryService};
use crate::retry::RetryPolicy;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default number of facilities kept per run
pub const DEFAULT_FACILITY_CACHE_CAPACITY: usize = 2048;

/// A resource grant attached to a facility.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceReward {
    pub description: String,

    #[serde(deserialize_with = "de::number")]
    pub amount: i32,
}

/// Descriptive data for one capturable facility.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FacilityInfo {
    #[serde(deserialize_with = "de::number")]
    pub facility_id: u32,

    #[serde(deserialize_with = "de::number")]
    pub zone_id: u32,

    pub facility_name: String,

    #[serde(deserialize_with = "de::number")]
    pub facility_type_id: u32,

    pub facility_type: String,

    #[serde(default)]
    pub capture_reward: Option<ResourceReward>,

    #[serde(default)]
    pub tick_reward: Option<ResourceReward>,
}

/// Cache-aside lookup of [`FacilityInfo`] by facility id.
///
/// Concurrent lookups of the same id share one download. Entries are never
/// invalidated; facilities do not change during a run. A failed download
/// leaves the slot empty so a later caller tries again.
pub struct FacilityResolver {
    census: Arc<dyn QueryService>,
    retry: RetryPolicy,
    cache: Mutex<LruCache<u32, Arc<OnceCell<FacilityInfo>>>>,
    cancel: CancellationToken,
}

impl FacilityResolver {
    pub fn new(census: Arc<dyn QueryService>, retry: RetryPolicy, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            census,
            retry,
            cache: Mutex::new(LruCache::new(capacity)),
            cancel: CancellationToken::new(),
        }
    }

    /// Abort in-flight downloads when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Look up a facility, downloading it on first use.
    pub async fn get(&self, facility_id: u32) -> Result<FacilityInfo, ResolveError> {
        let slot = {
            let mut cache = self.cache.lock();
            match cache.get(&facility_id) {
                Some(slot) => slot.clone(),
                None => {
                    let slot = Arc::new(OnceCell::new());
                    cache.put(facility_id, slot.clone());
                    slot
                }
            }
        };

        if let Some(info) = slot.get() {
            debug!(
                facility_id = facility_id,
                name = %info.facility_name,
                "Serving facility info from cache"
            );
            return Ok(info.clone());
        }

        let info = slot.get_or_try_init(|| self.download(facility_id)).await?;
        Ok(info.clone())
    }

    /// Number of facilities currently cached (including pending downloads).
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    async fn download(&self, facility_id: u32) -> Result<FacilityInfo, ResolveError> {
        debug!(facility_id = facility_id, "Downloading facility info");

        let query = Query::new("map_region")
            .where_eq("facility_id", facility_id)
            .with_limit(1);

        let result = self
            .retry
            .execute("query facility info", || {
                census::get_one::<FacilityInfo>(self.census.as_ref(), &query, &self.cancel)
            })
            .await?;

        match result {
            Some(info) => {
                debug!(
                    facility_id = facility_id,
                    name = %info.facility_name,
                    "Downloaded facility info"
                );
                Ok(info)
            }
            None => Err(ResolveError::FacilityNotFound(facility_id)),
        }
    }
}
