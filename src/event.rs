//! Core capture types for capstream.
//!
//! [`WorldEvent`]s are facility ownership changes paged out of the
//! `world_event` collection. [`ActorEvent`]s attribute one of those changes to
//! an individual character. An [`OutputRecord`] is the joined result handed
//! back to the caller.

use crate::census::de;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A facility changing hands on a world.
///
/// # Example
///
/// ```json
/// {
///   "facility_id": "222280",
///   "faction_old": "2",
///   "faction_new": "3",
///   "timestamp": "1700000000",
///   "zone_id": "2",
///   "world_id": "13",
///   "outfit_id": "37509488620604883"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorldEvent {
    #[serde(deserialize_with = "de::number")]
    pub facility_id: u32,

    #[serde(deserialize_with = "de::number")]
    pub faction_old: u8,

    #[serde(deserialize_with = "de::number")]
    pub faction_new: u8,

    /// Epoch seconds
    #[serde(deserialize_with = "de::number")]
    pub timestamp: i64,

    #[serde(deserialize_with = "de::number")]
    pub zone_id: u32,

    #[serde(deserialize_with = "de::number")]
    pub world_id: u32,

    /// Outfit credited with the capture, `0` when nobody was.
    #[serde(default, deserialize_with = "de::number")]
    pub outfit_id: u64,
}

impl WorldEvent {
    /// Identity used to drop duplicate deliveries across overlapping pages.
    ///
    /// Faction fields are not part of the fingerprint, so two events that only
    /// differ in factions collapse into one.
    pub fn fingerprint(&self) -> EventFingerprint {
        EventFingerprint {
            timestamp: self.timestamp,
            facility_id: self.facility_id,
            zone_id: self.zone_id,
            world_id: self.world_id,
        }
    }

    /// True when ownership actually moved to a different faction.
    pub fn changed_owner(&self) -> bool {
        self.faction_old != self.faction_new
    }
}

/// Dedup key for a [`WorldEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventFingerprint {
    pub timestamp: i64,
    pub facility_id: u32,
    pub zone_id: u32,
    pub world_id: u32,
}

impl std::fmt::Display for EventFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.timestamp, self.facility_id, self.zone_id, self.world_id
        )
    }
}

/// A single character credited with a facility capture.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActorEvent {
    #[serde(deserialize_with = "de::number")]
    pub character_id: u64,

    #[serde(deserialize_with = "de::number")]
    pub facility_id: u32,

    #[serde(default, deserialize_with = "de::number")]
    pub outfit_id: u64,

    #[serde(deserialize_with = "de::number")]
    pub timestamp: i64,

    #[serde(deserialize_with = "de::number")]
    pub zone_id: u32,

    #[serde(deserialize_with = "de::number")]
    pub world_id: u32,
}

impl ActorEvent {
    /// Whether this event describes the same capture as `world_event`.
    pub fn matches(&self, world_event: &WorldEvent) -> bool {
        self.timestamp == world_event.timestamp
            && self.world_id == world_event.world_id
            && self.zone_id == world_event.zone_id
            && self.facility_id == world_event.facility_id
    }
}

/// One attributed capture, ready for output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub character_id: u64,

    /// Empty when the character's name could not be resolved
    pub character_name: String,

    pub facility_id: u32,
    pub facility_name: String,
    pub facility_type_id: u32,
    pub facility_type: String,

    /// Epoch seconds
    pub capture_timestamp: i64,
}

/// Convert epoch seconds into a UTC timestamp.
///
/// Out-of-range values clamp to the Unix epoch rather than failing.
pub fn capture_datetime(epoch_seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch_seconds, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

impl Serialize for OutputRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("OutputRecord", 8)?;
        state.serialize_field("CharacterId", &self.character_id)?;
        state.serialize_field("CharacterName", &self.character_name)?;
        state.serialize_field("FacilityId", &self.facility_id)?;
        state.serialize_field("FacilityName", &self.facility_name)?;
        state.serialize_field("FacilityTypeId", &self.facility_type_id)?;
        state.serialize_field("FacilityType", &self.facility_type)?;
        state.serialize_field(
            "CaptureDateTime",
            &capture_datetime(self.capture_timestamp).to_rfc3339(),
        )?;
        state.serialize_field("CaptureTimestamp", &self.capture_timestamp)?;
        state.end()
    }
}
