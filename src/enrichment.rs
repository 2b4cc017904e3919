//! Author profile enrichment joined against the primary entities.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use crate::{
    entity::OwnerProfile,
    event::{Event, KIND_PROFILE},
    filter::Filter,
    normalize::{accept, normalize_profile},
    relay::Transport,
    store::{Applied, ProfileStore},
    subscription::{Notification, SubscriptionKey, SubscriptionSlot},
};

/// Keeps one profile subscription scoped to the authors currently in view and
/// the newest profile seen for each of them.
pub struct EnrichmentJoin {
    slot: SubscriptionSlot,
    profiles: ProfileStore,
}

impl EnrichmentJoin {
    pub fn new(transport: Arc<dyn Transport>, eose_timeout: Option<Duration>) -> Self {
        Self {
            slot: SubscriptionSlot::new(transport, eose_timeout),
            profiles: ProfileStore::new(),
        }
    }

    /// Scope the profile subscription to `authors`. Returns whether the
    /// subscription changed.
    ///
    /// An empty set closes it: an empty `authors` filter means "everyone" on
    /// some relays.
    pub fn sync(&mut self, authors: &BTreeSet<String>, relays: &[String]) -> bool {
        if authors.is_empty() {
            let had = self.slot.key().is_some();
            self.slot.clear();
            return had;
        }
        let filter = Filter::kinds([KIND_PROFILE]).authors(authors.iter().cloned());
        self.slot
            .ensure(SubscriptionKey::new(vec![filter], relays.iter().cloned()))
    }

    /// Normalize and merge a profile event. `None` when it was rejected.
    pub fn apply(&mut self, event: Event) -> Option<Applied> {
        let id = event.id.clone();
        let profile = accept(normalize_profile(event), &id)?;
        Some(self.profiles.apply(profile))
    }

    /// Profile of `pubkey`, if one has arrived.
    pub fn lookup(&self, pubkey: &str) -> Option<&OwnerProfile> {
        self.profiles.get(&pubkey.to_string())
    }

    pub fn is_active(&self) -> bool {
        self.slot.is_active()
    }

    /// Whether the current author set's profile backlog has been delivered.
    pub fn backlog_done(&self) -> bool {
        self.slot.backlog_done()
    }

    /// Next notification of the profile subscription. End-of-backlog is passed
    /// through and never causes a resubscription.
    pub async fn next(&mut self) -> Option<Notification> {
        self.slot.next().await
    }

    /// Close the subscription and forget every profile.
    pub fn clear(&mut self) {
        self.slot.clear();
        self.profiles.clear();
    }
}
