//! Terminal stage: joins actor events with names and facility metadata.

use super::PipelineError;
use crate::event::{ActorEvent, OutputRecord};
use crate::resolve::{FacilityResolver, Roster};
use tokio::sync::mpsc;

pub async fn output_record(
    actor: &ActorEvent,
    roster: &Roster,
    facilities: &FacilityResolver,
) -> Result<OutputRecord, PipelineError> {
    let facility = facilities.get(actor.facility_id).await?;

    Ok(OutputRecord {
        character_id: actor.character_id,
        character_name: roster
            .member_name(actor.character_id)
            .unwrap_or_default()
            .to_string(),
        facility_id: actor.facility_id,
        facility_name: facility.facility_name,
        facility_type_id: facility.facility_type_id,
        facility_type: facility.facility_type,
        capture_timestamp: actor.timestamp,
    })
}

/// Build an [`OutputRecord`] for every actor event until `actors` closes.
///
/// This stage is the only writer of the result list.
pub async fn collect(
    mut actors: mpsc::Receiver<Vec<ActorEvent>>,
    roster: &Roster,
    facilities: &FacilityResolver,
) -> Result<Vec<OutputRecord>, PipelineError> {
    let mut records = Vec::new();

    while let Some(group) = actors.recv().await {
        for actor in &group {
            records.push(output_record(actor, roster, facilities).await?);
        }
    }

    Ok(records)
}
