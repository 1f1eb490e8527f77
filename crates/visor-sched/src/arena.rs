//! Group arena
//!
//! Owns every open group and maps (stream, slot) to it. Groups are handed
//! out as `Arc` so callers can work outside the arena lock; the arena
//! itself sits behind a short-held mutex in the manager.
//!
//! A slot vacated by close is reused by the next open, so [`GroupIx`]
//! values are only meaningful while the group they were taken from stays
//! open. The graph builder re-derives every link on each build, which
//! keeps stale indices from surviving a close/open cycle.

use std::collections::HashMap;
use std::sync::Arc;

use visor_hw::{Slot, StageId, StreamId};

use crate::group::{Group, GroupIx};

/// Arena of open groups, keyed by (stream, slot)
#[derive(Debug, Default)]
pub struct GroupArena {
    slots: Vec<Option<Arc<Group>>>,
    map: HashMap<(StreamId, Slot), GroupIx>,
    parallel: HashMap<(StreamId, Slot), GroupIx>,
}

impl GroupArena {
    /// Create an empty arena
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, stream: StreamId, slot: Slot, id: StageId) -> Arc<Group> {
        let ix = self
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                self.slots.push(None);
                self.slots.len() - 1
            });
        let group = Arc::new(Group::new(GroupIx(ix), stream, slot, id));
        self.slots[ix] = Some(Arc::clone(&group));
        group
    }

    /// Register a group for the main chain; `None` if the key is taken
    pub fn insert(&mut self, stream: StreamId, slot: Slot, id: StageId) -> Option<Arc<Group>> {
        if self.map.contains_key(&(stream, slot)) {
            return None;
        }
        let group = self.alloc(stream, slot, id);
        self.map.insert((stream, slot), group.ix());
        Some(group)
    }

    /// Register a duplicated parallel twin for an already-open slot
    pub fn insert_parallel(
        &mut self,
        stream: StreamId,
        slot: Slot,
        id: StageId,
    ) -> Option<Arc<Group>> {
        if !self.map.contains_key(&(stream, slot)) || self.parallel.contains_key(&(stream, slot)) {
            return None;
        }
        let group = self.alloc(stream, slot, id);
        self.parallel.insert((stream, slot), group.ix());
        Some(group)
    }

    /// Main-chain group for a key
    #[must_use]
    pub fn get(&self, stream: StreamId, slot: Slot) -> Option<Arc<Group>> {
        let ix = *self.map.get(&(stream, slot))?;
        self.by_ix(ix)
    }

    /// Parallel twin for a key, if one was opened
    #[must_use]
    pub fn get_parallel(&self, stream: StreamId, slot: Slot) -> Option<Arc<Group>> {
        let ix = *self.parallel.get(&(stream, slot))?;
        self.by_ix(ix)
    }

    /// Group by arena index
    #[must_use]
    pub fn by_ix(&self, ix: GroupIx) -> Option<Arc<Group>> {
        self.slots.get(ix.0)?.clone()
    }

    /// Remove a main-chain group, returning it
    pub fn remove(&mut self, stream: StreamId, slot: Slot) -> Option<Arc<Group>> {
        let ix = self.map.remove(&(stream, slot))?;
        self.slots.get_mut(ix.0)?.take()
    }

    /// Remove a parallel twin, returning it
    pub fn remove_parallel(&mut self, stream: StreamId, slot: Slot) -> Option<Arc<Group>> {
        let ix = self.parallel.remove(&(stream, slot))?;
        self.slots.get_mut(ix.0)?.take()
    }

    /// Main-chain groups of a stream, in pipeline order
    #[must_use]
    pub fn stream_groups(&self, stream: StreamId) -> Vec<Arc<Group>> {
        let mut groups: Vec<Arc<Group>> = self
            .map
            .iter()
            .filter(|((s, _), _)| *s == stream)
            .filter_map(|(_, &ix)| self.by_ix(ix))
            .collect();
        groups.sort_by_key(|g| g.slot());
        groups
    }

    /// Parallel twins of a stream, in pipeline order
    #[must_use]
    pub fn stream_parallel(&self, stream: StreamId) -> Vec<Arc<Group>> {
        let mut groups: Vec<Arc<Group>> = self
            .parallel
            .iter()
            .filter(|((s, _), _)| *s == stream)
            .filter_map(|(_, &ix)| self.by_ix(ix))
            .collect();
        groups.sort_by_key(|g| g.slot());
        groups
    }

    /// Number of open groups
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether the arena holds no groups
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
