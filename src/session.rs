//! Places session: subscription, reconciliation and enrichment for the map.
//!
//! Data flows one way. Scope changes reopen the place subscription, incoming
//! events are normalized and applied to the place store, the store's author
//! set drives the profile subscription, and [`PlacesSession::rendered`] orders
//! the current snapshot against the caller's pin list.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info};

use crate::{
    entity::{OwnerProfile, Place, PlaceId},
    enrichment::EnrichmentJoin,
    event::{Event, KIND_PLACE},
    filter::Filter,
    normalize::{accept, normalize_place},
    order::{order, PinList},
    relay::Transport,
    store::{Applied, PlaceStore},
    subscription::{Notification, SubscriptionKey, SubscriptionSlot},
};

/// Whose places are shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceScope {
    Global,
    /// Only these authors, typically the user plus their contacts.
    Authors(Vec<String>),
}

impl PlaceScope {
    fn filter(&self) -> Filter {
        let filter = Filter::kinds([KIND_PLACE]);
        match self {
            PlaceScope::Global => filter,
            PlaceScope::Authors(authors) => filter.authors(authors.iter().cloned()),
        }
    }
}

/// Outcome of one step of [`PlacesSession::next_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// A place event passed validation and was offered to the store.
    Place(Applied),
    /// A profile event passed validation and was offered to the profile store.
    Profile(Applied),
    /// An event failed validation and was dropped.
    Rejected,
    /// The place backlog has been delivered.
    Backlog,
    /// The profile backlog for the current author set has been delivered.
    ProfileBacklog,
    /// Nothing is subscribed; no further updates will come.
    Idle,
}

/// A place ready for display with its owner's profile, if known.
#[derive(Debug, Clone, Copy)]
pub struct RenderedPlace<'a> {
    pub place: &'a Place,
    pub owner: Option<&'a OwnerProfile>,
}

enum Source {
    Places(Option<Notification>),
    Profiles(Option<Notification>),
}

pub struct PlacesSession {
    places: SubscriptionSlot,
    enrichment: EnrichmentJoin,
    store: PlaceStore,
    relays: Vec<String>,
    close_on_backlog: bool,
}

impl PlacesSession {
    pub fn new(transport: Arc<dyn Transport>, eose_timeout: Option<Duration>) -> Self {
        Self {
            places: SubscriptionSlot::new(transport.clone(), eose_timeout),
            enrichment: EnrichmentJoin::new(transport, eose_timeout),
            store: PlaceStore::new(),
            relays: Vec::new(),
            close_on_backlog: false,
        }
    }

    /// Stop the place subscription once its backlog is in. Profiles keep
    /// streaming.
    pub fn close_on_backlog(mut self, enabled: bool) -> Self {
        self.close_on_backlog = enabled;
        self
    }

    /// Switch to `scope` on `relays`. Returns `false` when nothing changed.
    ///
    /// A change drops every place and profile and reopens the subscription.
    pub fn set_scope(&mut self, scope: PlaceScope, relays: &[String]) -> bool {
        let key = SubscriptionKey::new(vec![scope.filter()], relays.iter().cloned());
        if self.places.key() == Some(&key) {
            return false;
        }
        info!(scope = ?scope, relays = key.relays().len(), "place scope changed");
        self.store.clear();
        self.enrichment.clear();
        self.relays = key.relays().to_vec();
        self.places.ensure(key);
        true
    }

    /// Whether every owner profile the relays hold for the current places
    /// has been delivered: the profile backlog is in, or there is no
    /// profile subscription to wait for.
    pub fn owners_settled(&self) -> bool {
        !self.enrichment.is_active() || self.enrichment.backlog_done()
    }

    /// Wait for the next change. Returns [`Update::Idle`] immediately when
    /// nothing is subscribed.
    pub async fn next_update(&mut self) -> Update {
        loop {
            let places_active = self.places.is_active();
            let profiles_active = self.enrichment.is_active();
            if !places_active && !profiles_active {
                return Update::Idle;
            }
            let source = tokio::select! {
                n = self.places.next(), if places_active => Source::Places(n),
                n = self.enrichment.next(), if profiles_active => Source::Profiles(n),
            };
            match source {
                Source::Places(Some(Notification::Event(event))) => return self.on_place(event),
                Source::Places(Some(Notification::EndOfBacklog)) => {
                    debug!(places = self.store.len(), "place backlog done");
                    if self.close_on_backlog {
                        self.places.close();
                    }
                    return Update::Backlog;
                }
                Source::Profiles(Some(Notification::Event(event))) => {
                    return match self.enrichment.apply(event) {
                        Some(applied) => Update::Profile(applied),
                        None => Update::Rejected,
                    };
                }
                Source::Profiles(Some(Notification::EndOfBacklog)) => return Update::ProfileBacklog,
                Source::Places(None) | Source::Profiles(None) => {}
            }
        }
    }

    fn on_place(&mut self, event: Event) -> Update {
        let id = event.id.clone();
        let Some(place) = accept(normalize_place(event), &id) else {
            return Update::Rejected;
        };
        let applied = self.store.apply(place);
        if applied.changed() {
            let authors = self.store.authors();
            if self.enrichment.sync(&authors, &self.relays) {
                debug!(authors = authors.len(), "profile scope changed");
            }
        }
        Update::Place(applied)
    }

    /// Current places in draw order (last drawn on top), with owners.
    pub fn rendered(&self, pins: &PinList<PlaceId>) -> Vec<RenderedPlace<'_>> {
        order(self.store.values(), pins)
            .into_iter()
            .map(|place| RenderedPlace {
                place,
                owner: self.enrichment.lookup(&place.pubkey),
            })
            .collect()
    }
}
