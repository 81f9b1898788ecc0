//! Outfit roster resolution.
//!
//! The roster is resolved once, before the pipeline starts, and shared
//! read-only with the correlator afterwards.

use super::ResolveError;
use crate::census::{self, de, Query, QueryService};
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Identity of the outfit being reported on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutfitInfo {
    pub outfit_id: u64,
    pub name: String,
    pub alias: String,

    /// Member count as declared by the server
    pub member_count: u32,
}

#[derive(Debug, Deserialize)]
struct OutfitResponse {
    #[serde(deserialize_with = "de::number")]
    outfit_id: u64,

    name: String,

    alias: String,

    #[serde(deserialize_with = "de::number")]
    member_count: u32,

    #[serde(default)]
    members: Vec<MemberRecord>,
}

#[derive(Debug, Deserialize)]
struct MemberRecord {
    #[serde(deserialize_with = "de::number")]
    character_id: u64,

    /// Absent when the character record no longer exists
    #[serde(default)]
    name: Option<CharacterName>,
}

#[derive(Debug, Deserialize)]
struct CharacterName {
    first: String,
}

/// The outfit plus a character id to name lookup of its resolvable members.
#[derive(Debug, Clone)]
pub struct Roster {
    outfit: OutfitInfo,
    names: HashMap<u64, String>,
}

impl Roster {
    pub fn new(outfit: OutfitInfo, names: HashMap<u64, String>) -> Self {
        Self { outfit, names }
    }

    pub fn outfit(&self) -> &OutfitInfo {
        &self.outfit
    }

    pub fn member_name(&self, character_id: u64) -> Option<&str> {
        self.names.get(&character_id).map(String::as_str)
    }

    pub fn is_member(&self, character_id: u64) -> bool {
        self.names.contains_key(&character_id)
    }

    /// Number of members with a resolved name.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn from_response(response: OutfitResponse) -> Self {
        let returned = response.members.len();

        info!(
            tag = %response.alias,
            name = %response.name,
            returned = returned,
            declared = response.member_count,
            "Retrieved data of outfit {} {}. Retrieved names and IDs of {}/{} members.",
            response.alias,
            response.name,
            returned,
            response.member_count
        );

        if returned != response.member_count as usize {
            warn!(
                missing = (response.member_count as usize).saturating_sub(returned),
                declared = response.member_count,
                "Couldn't retrieve every member of the outfit, results may be inaccurate"
            );
        }

        let names: HashMap<u64, String> = response
            .members
            .into_iter()
            .filter_map(|member| member.name.map(|name| (member.character_id, name.first)))
            .collect();

        let nameless = returned - names.len().min(returned);
        if nameless > 0 {
            warn!(
                nameless = nameless,
                "{} members of the outfit have no character record and were skipped",
                nameless
            );
        }

        Self {
            outfit: OutfitInfo {
                outfit_id: response.outfit_id,
                name: response.name,
                alias: response.alias,
                member_count: response.member_count,
            },
            names,
        }
    }
}

/// Resolves an outfit tag into a [`Roster`].
pub struct RosterResolver {
    census: Arc<dyn QueryService>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl RosterResolver {
    pub fn new(census: Arc<dyn QueryService>, retry: RetryPolicy) -> Self {
        Self {
            census,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve `tag` (case-insensitive) and its members.
    pub async fn resolve(&self, tag: &str) -> Result<Roster, ResolveError> {
        let query = Query::new("outfit")
            .with_limit(1)
            .where_eq("alias_lower", tag.to_lowercase())
            .add_resolve("member_character_name");

        let response = self
            .retry
            .execute("retrieve outfit info", || {
                census::get_one::<OutfitResponse>(self.census.as_ref(), &query, &self.cancel)
            })
            .await
            .map_err(|e| {
                error!(error = %e, tag = %tag, "Failed to retrieve or parse outfit info");
                ResolveError::from(e)
            })?;

        match response {
            Some(response) => Ok(Roster::from_response(response)),
            None => {
                error!(tag = %tag, "Outfit not found");
                Err(ResolveError::OutfitNotFound(tag.to_string()))
            }
        }
    }
}
