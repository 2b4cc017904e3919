//! Subscription lifecycle: one logical query fanned out to a set of relays.
//!
//! A [`Subscription`] owns the receiving end of a private channel that every
//! relay of the query writes into. Closing it drops that receiver, so nothing
//! a relay delivers afterwards (or already delivered but not yet read) can
//! reach the caller. Each subscription also gets a fresh id, and relays route
//! by id, so a stale relay stream never feeds a newer subscription.

use std::{
    collections::HashSet,
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::Value;
use sha1::{Digest, Sha1};
use tokio::{
    sync::mpsc,
    time::{sleep, Sleep},
};
use tracing::debug;

use crate::{
    event::Event,
    filter::Filter,
    relay::{RelayMessage, RelaySubscription, Transport},
};

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Event(Event),
    /// Stored events have been delivered (or the wait for them timed out).
    /// Yielded at most once per subscription.
    EndOfBacklog,
}

/// Identity of a query: its filters plus the relay set it runs against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    filters: Vec<Filter>,
    relays: Vec<String>,
}

impl SubscriptionKey {
    /// Relays are sorted and deduplicated, so order in configuration does not
    /// matter.
    pub fn new<S: Into<String>>(filters: Vec<Filter>, relays: impl IntoIterator<Item = S>) -> Self {
        let mut relays: Vec<String> = relays.into_iter().map(Into::into).collect();
        relays.sort();
        relays.dedup();
        Self { filters, relays }
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }
}

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(0);

/// Fresh subscription id: a process-wide counter plus a short hash of the key.
fn subscription_id(key: &SubscriptionKey) -> String {
    let n = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha1::new();
    hasher.update(n.to_be_bytes());
    for filter in key.filters() {
        hasher.update(Value::Object(filter.to_json()).to_string().as_bytes());
    }
    for relay in key.relays() {
        hasher.update(relay.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("yd{n}-{}", &digest[..8])
}

enum Wake {
    Relay(Option<RelayMessage>),
    BacklogTimeout,
}

/// A live query against a set of relays.
pub struct Subscription {
    id: String,
    rx: Option<mpsc::UnboundedReceiver<RelayMessage>>,
    handles: Vec<RelaySubscription>,
    awaiting_eose: HashSet<String>,
    backlog_done: bool,
    backlog_deadline: Option<Pin<Box<Sleep>>>,
    seen: HashSet<String>,
}

impl Subscription {
    /// Subscribe to every relay of `key`.
    ///
    /// With `eose_timeout`, end-of-backlog is reported after that delay even
    /// if some relays never send `EOSE`.
    pub fn open(
        transport: &dyn Transport,
        key: &SubscriptionKey,
        eose_timeout: Option<Duration>,
    ) -> Self {
        let id = subscription_id(key);
        let (tx, rx) = mpsc::unbounded_channel();
        let handles = key
            .relays()
            .iter()
            .map(|relay| transport.subscribe(relay, &id, key.filters(), tx.clone()))
            .collect();
        debug!(sub = %id, relays = key.relays().len(), "subscription opened");
        Self {
            awaiting_eose: key.relays().iter().cloned().collect(),
            backlog_deadline: eose_timeout.map(|t| Box::pin(sleep(t))),
            id,
            rx: Some(rx),
            handles,
            backlog_done: false,
            seen: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_none()
    }

    /// Whether end-of-backlog has been reported.
    pub fn backlog_done(&self) -> bool {
        self.backlog_done
    }

    /// Next notification, or `None` once closed or once every relay is gone.
    ///
    /// Cancel safe: nothing is lost if the future is dropped before it
    /// completes.
    pub async fn next(&mut self) -> Option<Notification> {
        loop {
            if self.is_closed() {
                return None;
            }
            if !self.backlog_done && self.awaiting_eose.is_empty() {
                return Some(self.finish_backlog());
            }
            let wake = {
                let rx = self.rx.as_mut()?;
                match self.backlog_deadline.as_mut() {
                    Some(deadline) => tokio::select! {
                        msg = rx.recv() => Wake::Relay(msg),
                        () = deadline.as_mut() => Wake::BacklogTimeout,
                    },
                    None => Wake::Relay(rx.recv().await),
                }
            };
            match wake {
                Wake::BacklogTimeout => {
                    debug!(
                        sub = %self.id,
                        silent = self.awaiting_eose.len(),
                        "backlog wait timed out"
                    );
                    return Some(self.finish_backlog());
                }
                Wake::Relay(None) => {
                    debug!(sub = %self.id, "all relays gone");
                    self.close();
                    return None;
                }
                Wake::Relay(Some(RelayMessage::Eose { relay })) => {
                    self.awaiting_eose.remove(&relay);
                }
                Wake::Relay(Some(RelayMessage::Event { event, .. })) => {
                    if self.seen.insert(event.id.clone()) {
                        return Some(Notification::Event(event));
                    }
                }
            }
        }
    }

    fn finish_backlog(&mut self) -> Notification {
        self.backlog_done = true;
        self.backlog_deadline = None;
        self.awaiting_eose.clear();
        Notification::EndOfBacklog
    }

    /// Unsubscribe from every relay and discard anything still buffered.
    pub fn close(&mut self) {
        if self.rx.take().is_none() {
            return;
        }
        for handle in &mut self.handles {
            handle.unsubscribe();
        }
        self.handles.clear();
        self.backlog_deadline = None;
        debug!(sub = %self.id, "subscription closed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("backlog_done", &self.backlog_done)
            .finish()
    }
}

/// Holds at most one live subscription, reopened whenever its key changes.
pub struct SubscriptionSlot {
    transport: Arc<dyn Transport>,
    eose_timeout: Option<Duration>,
    key: Option<SubscriptionKey>,
    current: Option<Subscription>,
}

impl SubscriptionSlot {
    pub fn new(transport: Arc<dyn Transport>, eose_timeout: Option<Duration>) -> Self {
        Self {
            transport,
            eose_timeout,
            key: None,
            current: None,
        }
    }

    /// Make `key` the live query. Returns `false` when it already was.
    ///
    /// The previous subscription is closed before the new one is opened.
    pub fn ensure(&mut self, key: SubscriptionKey) -> bool {
        if self.key.as_ref() == Some(&key) {
            return false;
        }
        if let Some(mut previous) = self.current.take() {
            debug!(sub = previous.id(), "subscription key changed");
            previous.close();
        }
        self.current = Some(Subscription::open(
            self.transport.as_ref(),
            &key,
            self.eose_timeout,
        ));
        self.key = Some(key);
        true
    }

    /// Close the live subscription but remember its key, so `ensure` with the
    /// same key stays a no-op.
    pub fn close(&mut self) {
        if let Some(current) = self.current.as_mut() {
            current.close();
        }
    }

    /// Close the live subscription and forget its key.
    pub fn clear(&mut self) {
        self.current = None;
        self.key = None;
    }

    pub fn key(&self) -> Option<&SubscriptionKey> {
        self.key.as_ref()
    }

    /// Whether the live subscription has reported end-of-backlog.
    pub fn backlog_done(&self) -> bool {
        self.current.as_ref().is_some_and(Subscription::backlog_done)
    }

    pub fn is_active(&self) -> bool {
        self.current.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Next notification of the live subscription; `None` when there is none.
    pub async fn next(&mut self) -> Option<Notification> {
        match self.current.as_mut() {
            Some(current) => current.next().await,
            None => None,
        }
    }
}
