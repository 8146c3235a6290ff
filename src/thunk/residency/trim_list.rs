use crate::thunk::memory::GraphicsAllocation;
use crate::thunk::memory::residency::ContextId;
use std::sync::Arc;
use tracing::warn;

/// Ordered set of allocations one engine context may evict.
///
/// Removal leaves a hole instead of shifting, so every allocation can keep its
/// own index (its trim list position) and add/remove stay O(1). Holes are
/// squeezed out by [`Self::compact`], which keeps survivors in insertion order:
/// the head of the list is the least recently used candidate.
#[derive(Debug)]
pub struct TrimCandidateList {
    context: ContextId,
    entries: Vec<Option<Arc<GraphicsAllocation>>>,
    live: usize,
}

impl TrimCandidateList {
    #[must_use]
    pub const fn new(context: ContextId) -> Self {
        Self {
            context,
            entries: Vec::new(),
            live: 0,
        }
    }

    /// Appends `allocation` unless it is already a candidate.
    pub fn add(&mut self, allocation: &Arc<GraphicsAllocation>) {
        if allocation.trim_list_position(self.context).is_some() {
            return;
        }
        let position = self.entries.len();
        self.entries.push(Some(allocation.clone()));
        allocation
            .residency()
            .set_trim_list_position(self.context, Some(position));
        self.live += 1;
    }

    /// Removes a candidate. The allocation must currently be on the list.
    pub fn remove(&mut self, allocation: &GraphicsAllocation, compact: bool) {
        let Some(position) = allocation.trim_list_position(self.context) else {
            warn!(id = %allocation.id(), "remove of an allocation that is not a trim candidate");
            return;
        };
        debug_assert!(
            self.entries
                .get(position)
                .and_then(Option::as_ref)
                .is_some_and(|entry| entry.id() == allocation.id()),
            "stale trim list position {position} for {}",
            allocation.id()
        );

        self.entries[position] = None;
        allocation
            .residency()
            .set_trim_list_position(self.context, None);
        self.live -= 1;

        if position + 1 == self.entries.len() {
            while matches!(self.entries.last(), Some(None)) {
                self.entries.pop();
            }
        }

        if compact && self.needs_compaction() {
            self.compact();
        }
    }

    /// Removes `allocation` if it is a candidate. Returns whether it was.
    pub fn remove_if_present(&mut self, allocation: &GraphicsAllocation, compact: bool) -> bool {
        if allocation.trim_list_position(self.context).is_none() {
            return false;
        }
        self.remove(allocation, compact);
        true
    }

    /// True once at least half of the backing slots are holes.
    #[must_use]
    pub const fn needs_compaction(&self) -> bool {
        self.live * 2 <= self.entries.len()
    }

    /// Moves every live entry to the earliest free slot, preserving order, and
    /// drops the trailing holes.
    pub fn compact(&mut self) {
        let mut free = 0;
        for index in 0..self.entries.len() {
            if self.entries[index].is_none() {
                continue;
            }
            if index != free {
                let allocation = self.entries[index].take();
                if let Some(allocation) = &allocation {
                    allocation
                        .residency()
                        .set_trim_list_position(self.context, Some(free));
                }
                self.entries[free] = allocation;
            }
            free += 1;
        }
        self.entries.truncate(free);
    }

    /// Candidate at `index`, `None` for a hole or past the end.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<GraphicsAllocation>> {
        self.entries.get(index).and_then(Option::as_ref)
    }

    /// Number of backing slots, holes included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of live candidates.
    #[must_use]
    pub const fn live_count(&self) -> usize {
        self.live
    }

    #[must_use]
    pub const fn context(&self) -> ContextId {
        self.context
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<GraphicsAllocation>> {
        self.entries.iter().flatten()
    }

    /// True if every live entry's recorded position is its actual index and the
    /// live count matches.
    #[must_use]
    pub fn positions_consistent(&self) -> bool {
        let mut live = 0;
        for (index, entry) in self.entries.iter().enumerate() {
            if let Some(allocation) = entry {
                live += 1;
                if allocation.trim_list_position(self.context) != Some(index) {
                    return false;
                }
            }
        }
        live == self.live && !matches!(self.entries.last(), Some(None))
    }

    #[cfg(test)]
    fn push_hole(&mut self) {
        self.entries.push(None);
    }

    #[cfg(test)]
    fn set_shape(&mut self, live: usize, len: usize) {
        self.live = live;
        self.entries.resize(len, None);
    }
}
