use crate::error::{ResidencyError, ResidencyResult};
use parking_lot::Mutex;
use std::fmt;

/// Upper bound on engine contexts per device. Every [`ResidencyData`] carries one
/// slot per possible context.
pub const MAX_ENGINE_CONTEXTS: usize = 32;

/// Index of an independent GPU submission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u32);

impl ContextId {
    pub fn new(id: u32) -> ResidencyResult<Self> {
        if (id as usize) < MAX_ENGINE_CONTEXTS {
            Ok(Self(id))
        } else {
            Err(ResidencyError::InvalidContextId(id))
        }
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Residency state of one memory object as seen by one engine context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextResidency {
    pub resident: bool,
    /// Fence value that must complete before this context's GPU work using the
    /// object is known to be done.
    pub last_fence_value: u64,
    /// Index in the context's trim candidate list, if the object is a candidate.
    pub trim_list_position: Option<usize>,
    /// Pinned for this context: trims skip the object.
    pub always_resident: bool,
}

/// Per-context residency slots of an allocation or fragment.
///
/// Slot `C` is only written by context `C`'s controller while it holds its own
/// lock; the per-slot mutex exists so readers on other threads see a coherent value.
pub struct ResidencyData {
    slots: Box<[Mutex<ContextResidency>]>,
}

impl ResidencyData {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_ENGINE_CONTEXTS)
                .map(|_| Mutex::new(ContextResidency::default()))
                .collect(),
        }
    }

    #[must_use]
    pub fn get(&self, context: ContextId) -> ContextResidency {
        *self.slots[context.index()].lock()
    }

    pub fn update(&self, context: ContextId, f: impl FnOnce(&mut ContextResidency)) {
        f(&mut self.slots[context.index()].lock());
    }

    #[must_use]
    pub fn is_resident(&self, context: ContextId) -> bool {
        self.get(context).resident
    }

    pub fn set_resident(&self, context: ContextId, resident: bool) {
        self.update(context, |slot| slot.resident = resident);
    }

    #[must_use]
    pub fn last_fence_value(&self, context: ContextId) -> u64 {
        self.get(context).last_fence_value
    }

    /// Records the fence value of the submission that will use the object.
    pub fn update_completion_data(&self, context: ContextId, fence_value: u64) {
        self.update(context, |slot| slot.last_fence_value = fence_value);
    }

    #[must_use]
    pub fn trim_list_position(&self, context: ContextId) -> Option<usize> {
        self.get(context).trim_list_position
    }

    pub fn set_trim_list_position(&self, context: ContextId, position: Option<usize>) {
        self.update(context, |slot| slot.trim_list_position = position);
    }

    #[must_use]
    pub fn is_always_resident(&self, context: ContextId) -> bool {
        self.get(context).always_resident
    }

    pub fn set_always_resident(&self, context: ContextId, always_resident: bool) {
        self.update(context, |slot| slot.always_resident = always_resident);
    }

    /// True if any context currently holds the object resident.
    #[must_use]
    pub fn is_resident_anywhere(&self) -> bool {
        self.slots.iter().any(|slot| slot.lock().resident)
    }
}

impl Default for ResidencyData {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResidencyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active: Vec<_> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let slot = *slot.lock();
                (slot != ContextResidency::default()).then_some((idx, slot))
            })
            .collect();
        f.debug_struct("ResidencyData").field("active", &active).finish()
    }
}
