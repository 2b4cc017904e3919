//! Geochat: text notes tagged with the geohash area around a point.

use std::{sync::Arc, time::Duration};

use tracing::info;

use crate::{
    entity::ChatMessage,
    event::KIND_TEXT_NOTE,
    filter::Filter,
    geocell::{self, GeocellError},
    normalize::{accept, normalize_chat},
    relay::Transport,
    subscription::{Notification, SubscriptionKey, SubscriptionSlot},
};

/// Precision of the cell shown as the chat title.
pub const DEFAULT_PRECISION: usize = 5;
/// Prefix length of the `#g` filter. Shorter means a wider area.
pub const DEFAULT_SCOPE_PRECISION: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatUpdate {
    /// A message was appended to the log.
    Message,
    Rejected,
    Backlog,
    Idle,
}

/// Chat log for the area around the current map center.
///
/// Messages are kept in arrival order and are not deduplicated beyond what
/// the subscription already drops.
pub struct ChatSession {
    slot: SubscriptionSlot,
    messages: Vec<ChatMessage>,
    cell: Option<String>,
    precision: usize,
    scope_precision: usize,
}

impl ChatSession {
    pub fn new(transport: Arc<dyn Transport>, eose_timeout: Option<Duration>) -> Self {
        Self {
            slot: SubscriptionSlot::new(transport, eose_timeout),
            messages: Vec::new(),
            cell: None,
            precision: DEFAULT_PRECISION,
            scope_precision: DEFAULT_SCOPE_PRECISION,
        }
    }

    pub fn with_precision(mut self, precision: usize, scope_precision: usize) -> Self {
        self.precision = precision;
        self.scope_precision = scope_precision;
        self
    }

    /// Move the chat to the cell containing (`lng`, `lat`).
    ///
    /// Returns whether the subscription was reopened. That only happens when
    /// the scope prefix changes; moving inside the same area keeps the log.
    pub fn set_center(
        &mut self,
        lng: f64,
        lat: f64,
        relays: &[String],
    ) -> Result<bool, GeocellError> {
        let cell = geocell::geocell_key(lng, lat, self.precision)?;
        let area = geocell::scope(&cell, self.scope_precision);
        let filter = Filter::kinds([KIND_TEXT_NOTE]).tag("g", [area]);
        let key = SubscriptionKey::new(vec![filter], relays.iter().cloned());
        let reopened = self.slot.key() != Some(&key);
        if reopened {
            info!(%area, "chat area changed");
            self.messages.clear();
            self.slot.ensure(key);
        }
        self.cell = Some(cell);
        Ok(reopened)
    }

    /// Geocell of the current center.
    pub fn title(&self) -> Option<&str> {
        self.cell.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub async fn next_update(&mut self) -> ChatUpdate {
        loop {
            if !self.slot.is_active() {
                return ChatUpdate::Idle;
            }
            match self.slot.next().await {
                Some(Notification::Event(event)) => {
                    let id = event.id.clone();
                    let Some(message) = accept(normalize_chat(event), &id) else {
                        return ChatUpdate::Rejected;
                    };
                    self.messages.push(message);
                    return ChatUpdate::Message;
                }
                Some(Notification::EndOfBacklog) => return ChatUpdate::Backlog,
                None => {}
            }
        }
    }
}
