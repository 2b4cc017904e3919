//! Display order for reconciled entities.
//!
//! The renderer draws a sequence front to back: the first element is drawn
//! first (bottom), the last element is drawn last (top). [`order`] returns
//! that draw order directly:
//!
//! 1. The logical order is pinned entities in [`PinList`] order (most
//!    recently pinned first), then unpinned entities newest first.
//! 2. The whole logical order is reversed, so the most recently pinned entity
//!    ends up last and renders above its siblings.
//!
//! Pinned ids with no entity in the input are ignored.

use std::cmp::{Ordering, Reverse};

use crate::store::Versioned;

/// Pinned identities, front = most recently pinned.
///
/// Owned by the UI layer. Event ingestion never touches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinList<K> {
    ids: Vec<K>,
}

impl<K> Default for PinList<K> {
    fn default() -> Self {
        Self { ids: Vec::new() }
    }
}

impl<K: PartialEq> PinList<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `id` to the front, dropping any earlier occurrence.
    pub fn pin(&mut self, id: K) {
        self.ids.retain(|existing| existing != &id);
        self.ids.insert(0, id);
    }

    /// Remove `id` if present.
    pub fn unpin(&mut self, id: &K) {
        self.ids.retain(|existing| existing != id);
    }

    pub fn contains(&self, id: &K) -> bool {
        self.ids.contains(id)
    }

    /// Position from the front, 0 = most recently pinned.
    pub fn position(&self, id: &K) -> Option<usize> {
        self.ids.iter().position(|existing| existing == id)
    }

}

/// Draw order for `values` given `pins`. See the module docs.
pub fn order<'a, T, I>(values: I, pins: &PinList<T::Key>) -> Vec<&'a T>
where
    T: Versioned + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut ranked: Vec<(Option<usize>, T::Key, &T)> = values
        .into_iter()
        .filter_map(|v| {
            let key = v.key()?;
            Some((pins.position(&key), key, v))
        })
        .collect();
    ranked.sort_by(|(pa, ka, a), (pb, kb, b)| match (pa, pb) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Reverse(a.created_at())
            .cmp(&Reverse(b.created_at()))
            .then_with(|| ka.cmp(kb)),
    });
    ranked.into_iter().rev().map(|(_, _, v)| v).collect()
}
