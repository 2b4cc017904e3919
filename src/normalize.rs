//! Payload validation and normalization for incoming events.
//!
//! Nothing here returns an error past the caller's stream: a malformed event
//! from a misbehaving author becomes a [`Rejected`] value that is logged and
//! dropped, and the subscription keeps running.

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::{
    entity::{
        ChatMessage, Entity, Geometry, LngLat, OwnerProfile, Place, PlaceProperties, Profile,
        Record,
    },
    event::{Event, KIND_PLACE, KIND_PROFILE, KIND_TEXT_NOTE},
};

/// Why an event was not turned into an entity.
#[derive(Debug, Error)]
pub enum Rejected {
    #[error("expected kind {expected}, got {actual}")]
    UnexpectedKind { expected: u32, actual: u32 },
    #[error("unsupported kind {0}")]
    UnsupportedKind(u32),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("place has no geometry coordinates")]
    MissingGeometry,
}

/// Place payload as found on the wire, before required members are checked.
#[derive(Deserialize)]
struct RawPlace {
    geometry: Option<RawGeometry>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawGeometry {
    coordinates: Option<LngLat>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Validate `event` as an entity of `kind`.
pub fn normalize(event: Event, kind: u32) -> Result<Entity, Rejected> {
    match kind {
        KIND_PLACE => normalize_place(event).map(Entity::Place),
        KIND_TEXT_NOTE => normalize_chat(event).map(Entity::Chat),
        KIND_PROFILE => normalize_profile(event).map(Entity::Profile),
        other => Err(Rejected::UnsupportedKind(other)),
    }
}

/// Normalize a place event, rewriting labeled coordinates to `[lng, lat]`.
pub fn normalize_place(event: Event) -> Result<Place, Rejected> {
    expect_kind(&event, KIND_PLACE)?;
    place(event)
}

/// Normalize a profile metadata event.
pub fn normalize_profile(event: Event) -> Result<OwnerProfile, Rejected> {
    expect_kind(&event, KIND_PROFILE)?;
    profile(event)
}

/// Normalize a text note.
pub fn normalize_chat(event: Event) -> Result<ChatMessage, Rejected> {
    expect_kind(&event, KIND_TEXT_NOTE)?;
    Ok(chat(event))
}

fn expect_kind(event: &Event, expected: u32) -> Result<(), Rejected> {
    if event.kind == expected {
        Ok(())
    } else {
        Err(Rejected::UnexpectedKind {
            expected,
            actual: event.kind,
        })
    }
}

fn place(mut event: Event) -> Result<Place, Rejected> {
    let raw: RawPlace = serde_json::from_str(&event.content)?;
    let geometry = raw.geometry.ok_or(Rejected::MissingGeometry)?;
    let coordinates = geometry.coordinates.ok_or(Rejected::MissingGeometry)?;
    let properties = PlaceProperties {
        geometry: Geometry {
            coordinates,
            extra: geometry.extra,
        },
        fields: raw.fields,
    };
    event.content.clear();
    Ok(Record::from_event(event, properties))
}

fn profile(mut event: Event) -> Result<OwnerProfile, Rejected> {
    let profile: Profile = serde_json::from_str(&event.content)?;
    event.content.clear();
    Ok(Record::from_event(event, profile))
}

fn chat(mut event: Event) -> ChatMessage {
    let text = std::mem::take(&mut event.content);
    Record::from_event(event, text)
}

/// Run `normalize_*` and log rejections at debug level.
pub fn accept<T>(result: Result<T, Rejected>, event_id: &str) -> Option<T> {
    match result {
        Ok(entity) => Some(entity),
        Err(reason) => {
            debug!(event = %event_id, %reason, "rejected event");
            None
        }
    }
}
