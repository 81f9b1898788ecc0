//! Auxiliary metadata lookups.
//!
//! - [`FacilityResolver`]: cache-aside facility names and types, filled lazily
//! - [`RosterResolver`]: the target outfit and its member names, resolved once

pub mod facility;
pub mod roster;

use crate::census::CensusError;
use thiserror::Error;

pub use facility::{FacilityInfo, FacilityResolver, ResourceReward, DEFAULT_FACILITY_CACHE_CAPACITY};
pub use roster::{OutfitInfo, Roster, RosterResolver};

/// Errors raised while resolving metadata.
///
/// Unlike paging, a lookup for an entity that a real event referenced must
/// find something, so "not found" is fatal here.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    Census(#[from] CensusError),

    #[error("facility {0} not found in the census")]
    FacilityNotFound(u32),

    #[error("outfit with tag '{0}' not found in the census")]
    OutfitNotFound(String),
}
