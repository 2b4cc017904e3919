//! Nostr event model as delivered by relays.

use serde::{Deserialize, Serialize};

/// Kind of profile metadata events (NIP-01 `set_metadata`).
pub const KIND_PROFILE: u32 = 0;
/// Kind of short text notes, used for geochat.
pub const KIND_TEXT_NOTE: u32 = 1;
/// Kind of addressable place events.
pub const KIND_PLACE: u32 = 37515;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element names the tag and the following elements hold data.
/// The ones this client reads are:
///
/// - `d` – slot identifier of an addressable event (a place)
/// - `g` – geohash a chat note was posted from
///
/// Everything else is preserved verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name, e.g. `"d"`.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Parsed event record delivered by the relay transport.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "f00d...",
///   "kind": 37515,
///   "created_at": 1700000000,
///   "tags": [["d", "corner-cafe"]],
///   "content": "{\"geometry\":{\"coordinates\":[10.0,20.0]}}",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `37515`.
    pub kind: u32,
    /// Unix timestamp of creation, in seconds.
    pub created_at: u64,
    /// Arbitrary tags such as `d` (identifier) or `g` (geohash).
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Event content body. Its meaning depends on `kind`.
    #[serde(default)]
    pub content: String,
    /// Schnorr signature. Verification happens upstream of this crate.
    #[serde(default)]
    pub sig: String,
}
