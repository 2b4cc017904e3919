//! Reconciliation stores: latest known version per identity.
//!
//! Relays deliver versions of the same entity in any order and any number of
//! times. A store keeps, per identity, the version with the largest
//! `created_at`. Equal timestamps keep the version already stored, so applying
//! the same event twice is a no-op.

use std::{
    collections::{hash_map::Entry, BTreeSet, HashMap},
    fmt,
    hash::Hash,
};

use crate::entity::{OwnerProfile, Place, PlaceId};

/// An entity that can be reconciled by identity and timestamp.
pub trait Versioned {
    type Key: Clone + Eq + Hash + Ord + fmt::Debug;

    /// Identity of this entity, or `None` when it cannot be derived.
    fn key(&self) -> Option<Self::Key>;
    fn created_at(&self) -> u64;
    /// Public key of the author.
    fn author(&self) -> &str;
}

impl Versioned for Place {
    type Key = PlaceId;

    fn key(&self) -> Option<PlaceId> {
        self.place_id()
    }

    fn created_at(&self) -> u64 {
        self.created_at
    }

    fn author(&self) -> &str {
        &self.pubkey
    }
}

/// Profiles are keyed by author alone: one profile per identity.
impl Versioned for OwnerProfile {
    type Key = String;

    fn key(&self) -> Option<String> {
        Some(self.pubkey.clone())
    }

    fn created_at(&self) -> u64 {
        self.created_at
    }

    fn author(&self) -> &str {
        &self.pubkey
    }
}

/// Outcome of [`LatestStore::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// First version seen for this identity.
    Inserted,
    /// Replaced an older version.
    Replaced { previous_created_at: u64 },
    /// Not newer than the stored version; dropped.
    Stale,
    /// No identity could be derived; skipped.
    Unkeyed,
}

impl Applied {
    /// Whether the store contents changed.
    pub fn changed(self) -> bool {
        matches!(self, Applied::Inserted | Applied::Replaced { .. })
    }
}

/// Map from identity to the newest version seen.
#[derive(Debug)]
pub struct LatestStore<T: Versioned> {
    entries: HashMap<T::Key, T>,
}

pub type PlaceStore = LatestStore<Place>;
pub type ProfileStore = LatestStore<OwnerProfile>;

impl<T: Versioned> Default for LatestStore<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: Versioned> LatestStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `entity` if it is strictly newer than what is held for its key.
    pub fn apply(&mut self, entity: T) -> Applied {
        let Some(key) = entity.key() else {
            return Applied::Unkeyed;
        };
        match self.entries.entry(key) {
            Entry::Occupied(mut slot) => {
                let previous_created_at = slot.get().created_at();
                if previous_created_at >= entity.created_at() {
                    return Applied::Stale;
                }
                slot.insert(entity);
                Applied::Replaced {
                    previous_created_at,
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entity);
                Applied::Inserted
            }
        }
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.entries.get(key)
    }

    /// Current snapshot. No order is defined.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    /// Distinct authors across the snapshot, sorted.
    pub fn authors(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .map(|e| e.author().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop everything. Used when the query scope changes.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        entity::{Geometry, LngLat, PlaceProperties, Profile, Record},
        event::{Tag, KIND_PLACE, KIND_PROFILE},
    };
    use serde_json::Map;

    pub(crate) fn place(d: &str, pubkey: &str, created_at: u64, name: &str) -> Place {
        let mut fields = Map::new();
        fields.insert("name".into(), name.into());
        Record {
            id: format!("{d}-{pubkey}-{created_at}-{name}"),
            pubkey: pubkey.into(),
            kind: KIND_PLACE,
            created_at,
            tags: vec![Tag(vec!["d".into(), d.into()])],
            content: PlaceProperties {
                geometry: Geometry {
                    coordinates: LngLat { lng: 1.0, lat: 2.0 },
                    extra: Map::new(),
                },
                fields,
            },
        }
    }

    pub(crate) fn profile(pubkey: &str, created_at: u64, name: &str) -> OwnerProfile {
        let mut map = Map::new();
        map.insert("name".into(), name.into());
        Record {
            id: format!("{pubkey}-{created_at}"),
            pubkey: pubkey.into(),
            kind: KIND_PROFILE,
            created_at,
            tags: vec![],
            content: Profile(map),
        }
    }

    fn id(d: &str, pubkey: &str) -> PlaceId {
        PlaceId {
            d_tag: d.into(),
            pubkey: pubkey.into(),
            kind: KIND_PLACE,
        }
    }

    #[test]
    fn newer_replaces_older_is_dropped() {
        let mut store = PlaceStore::new();
        assert_eq!(store.apply(place("a", "p", 100, "A")), Applied::Inserted);
        assert_eq!(store.apply(place("a", "p", 90, "A'")), Applied::Stale);
        assert_eq!(store.get(&id("a", "p")).unwrap().content.name(), Some("A"));
        assert_eq!(
            store.apply(place("a", "p", 150, "A''")),
            Applied::Replaced {
                previous_created_at: 100
            }
        );
        assert_eq!(store.get(&id("a", "p")).unwrap().content.name(), Some("A''"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn ties_keep_first_applied() {
        let mut store = PlaceStore::new();
        store.apply(place("a", "p", 100, "first"));
        assert_eq!(store.apply(place("a", "p", 100, "second")), Applied::Stale);
        assert_eq!(store.get(&id("a", "p")).unwrap().content.name(), Some("first"));
    }

    #[test]
    fn reapply_is_idempotent() {
        let mut store = PlaceStore::new();
        let p = place("a", "p", 7, "A");
        store.apply(p.clone());
        let before: Vec<_> = store.values().cloned().collect();
        assert!(!store.apply(p).changed());
        let after: Vec<_> = store.values().cloned().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn every_prefix_holds_maximum() {
        let stamps = [5u64, 3, 9, 9, 1, 12, 12, 4, 20, 2];
        let mut store = PlaceStore::new();
        for (i, ts) in stamps.iter().enumerate() {
            store.apply(place("a", "p", *ts, &format!("v{i}")));
            let prefix = &stamps[..=i];
            let max = *prefix.iter().max().unwrap();
            let first_max = prefix.iter().position(|t| *t == max).unwrap();
            let held = store.get(&id("a", "p")).unwrap();
            assert_eq!(held.created_at, max);
            assert_eq!(held.content.name(), Some(format!("v{first_max}").as_str()));
        }
    }

    #[test]
    fn distinct_identities_do_not_collide() {
        let mut store = PlaceStore::new();
        store.apply(place("a", "p1", 1, "x"));
        store.apply(place("a", "p2", 1, "x"));
        store.apply(place("b", "p1", 1, "x"));
        assert_eq!(store.len(), 3);
        let authors: Vec<_> = store.authors().into_iter().collect();
        assert_eq!(authors, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[test]
    fn place_without_d_tag_is_skipped() {
        let mut store = PlaceStore::new();
        let mut p = place("a", "p", 1, "x");
        p.tags.clear();
        assert_eq!(store.apply(p), Applied::Unkeyed);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn clear_empties() {
        let mut store = PlaceStore::new();
        store.apply(place("a", "p", 1, "x"));
        store.clear();
        assert_eq!(store.len(), 0);
        assert!(store.get(&id("a", "p")).is_none());
        assert_eq!(store.apply(place("a", "p", 1, "x")), Applied::Inserted);
    }

    #[test]
    fn profiles_newest_wins() {
        let mut store = ProfileStore::new();
        store.apply(profile("p", 10, "new"));
        assert_eq!(store.apply(profile("p", 5, "old")), Applied::Stale);
        assert_eq!(
            store.get(&"p".to_string()).unwrap().content.display_name(),
            Some("new")
        );
    }
}
