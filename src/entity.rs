//! Typed entities produced from relay events once their payload is parsed.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::{Event, Tag};

/// An event whose `content` has been parsed into `C`.
///
/// The raw payload string is not kept, so nothing downstream of the
/// normalizer can observe a legacy payload shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record<C> {
    pub id: String,
    pub pubkey: String,
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: C,
}

impl<C> Record<C> {
    /// Move the envelope of `event` around an already parsed payload.
    pub(crate) fn from_event(event: Event, content: C) -> Self {
        Self {
            id: event.id,
            pubkey: event.pubkey,
            kind: event.kind,
            created_at: event.created_at,
            tags: event.tags,
            content,
        }
    }

    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(Tag::value)
    }
}

/// Point of interest (kind 37515).
pub type Place = Record<PlaceProperties>;
/// Geochat note (kind 1). The payload is freeform text.
pub type ChatMessage = Record<String>;
/// Author profile metadata (kind 0).
pub type OwnerProfile = Record<Profile>;

impl Place {
    /// Composite identity. `None` when the event carries no `d` tag.
    pub fn place_id(&self) -> Option<PlaceId> {
        let d_tag = self.tag_value("d")?;
        Some(PlaceId {
            d_tag: d_tag.to_string(),
            pubkey: self.pubkey.clone(),
            kind: self.kind,
        })
    }

    pub fn coordinates(&self) -> LngLat {
        self.content.geometry.coordinates
    }
}

impl ChatMessage {
    /// Geohash the note was tagged with. Display only.
    pub fn geohash(&self) -> Option<&str> {
        self.tag_value("g")
    }
}

/// Any entity the normalizer can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Place(Place),
    Chat(ChatMessage),
    Profile(OwnerProfile),
}

/// One canonical slot per author per logical place.
///
/// Republications of the same place share an id and are reconciled; distinct
/// authors or `d` values never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlaceId {
    pub d_tag: String,
    pub pubkey: String,
    pub kind: u32,
}

impl fmt::Display for PlaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.d_tag, self.pubkey, self.kind)
    }
}

impl FromStr for PlaceId {
    type Err = anyhow::Error;

    /// Parse `"{d}-{pubkey}-{kind}"`. The `d` value may itself contain dashes;
    /// the pubkey (hex) never does.
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.rsplitn(3, '-');
        let kind = parts.next().unwrap_or_default().parse()?;
        let pubkey = parts.next().filter(|p| !p.is_empty());
        let d_tag = parts.next();
        match (d_tag, pubkey) {
            (Some(d_tag), Some(pubkey)) => Ok(PlaceId {
                d_tag: d_tag.to_string(),
                pubkey: pubkey.to_string(),
                kind,
            }),
            _ => Err(anyhow::anyhow!("expected <d>-<pubkey>-<kind>, got {s:?}")),
        }
    }
}

/// Canonical coordinate pair, serialized as `[lng, lat]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawCoordinates", into = "[f64; 2]")]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

/// Coordinate shapes accepted from the wire.
///
/// Some publishers wrote a labeled object instead of the positional pair.
/// Both collapse into [`LngLat`] at the parse boundary.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawCoordinates {
    Canonical([f64; 2]),
    Labeled {
        #[serde(alias = "lon", alias = "longitude")]
        lng: f64,
        #[serde(alias = "latitude")]
        lat: f64,
    },
}

impl From<RawCoordinates> for LngLat {
    fn from(raw: RawCoordinates) -> Self {
        match raw {
            RawCoordinates::Canonical([lng, lat]) => LngLat { lng, lat },
            RawCoordinates::Labeled { lng, lat } => LngLat { lng, lat },
        }
    }
}

impl From<LngLat> for [f64; 2] {
    fn from(c: LngLat) -> Self {
        [c.lng, c.lat]
    }
}

/// GeoJSON-like geometry of a place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Geometry {
    pub coordinates: LngLat,
    /// Other geometry members (e.g. `"type": "Point"`), kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parsed payload of a place: geometry plus free descriptive fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaceProperties {
    pub geometry: Geometry,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PlaceProperties {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.field("name")
    }
}

/// Profile metadata object. Any JSON object is accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Profile(pub Map<String, Value>);

impl Profile {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Best label for the author: `display_name`, then `name`.
    pub fn display_name(&self) -> Option<&str> {
        self.get("display_name").or_else(|| self.get("name"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn place_id_display_and_parse() {
        let id = PlaceId {
            d_tag: "corner-cafe".into(),
            pubkey: "ab12".into(),
            kind: 37515,
        };
        assert_eq!(id.to_string(), "corner-cafe-ab12-37515");
        assert_eq!(id.to_string().parse::<PlaceId>().unwrap(), id);
    }

    #[test]
    fn place_id_parse_errors() {
        assert!("nokind".parse::<PlaceId>().is_err());
        assert!("pub-37515".parse::<PlaceId>().is_err());
        assert!("d-pub-x".parse::<PlaceId>().is_err());
    }

    #[test]
    fn coordinates_serialize_as_array() {
        let c: LngLat = serde_json::from_str(r#"{"lng": 1.5, "lat": -2}"#).unwrap();
        assert_eq!(c, LngLat { lng: 1.5, lat: -2.0 });
        assert_eq!(serde_json::to_string(&c).unwrap(), "[1.5,-2.0]");
    }

    #[test]
    fn coordinate_aliases() {
        let c: LngLat = serde_json::from_str(r#"{"longitude": 3, "latitude": 4}"#).unwrap();
        assert_eq!(c, LngLat { lng: 3.0, lat: 4.0 });
        let c: LngLat = serde_json::from_str(r#"{"lon": 5, "lat": 6}"#).unwrap();
        assert_eq!(c, LngLat { lng: 5.0, lat: 6.0 });
    }

    #[test]
    fn profile_display_name_fallback() {
        let p: Profile = serde_json::from_str(r#"{"name": "ann", "display_name": ""}"#).unwrap();
        assert_eq!(p.display_name(), Some("ann"));
        let p: Profile = serde_json::from_str(r#"{"name": "ann", "display_name": "Ann B"}"#).unwrap();
        assert_eq!(p.display_name(), Some("Ann B"));
        assert!(Profile::default().display_name().is_none());
    }
}
