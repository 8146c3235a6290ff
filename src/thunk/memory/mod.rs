pub mod host_ptr;
pub mod manager;
pub mod residency;

use crate::error::{ResidencyError, ResidencyResult};
use crate::kmd::OsHandle;
use crate::utils::page_align_up;
use residency::{ContextId, ResidencyData};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

// Re-export the main manager for easy access
pub use manager::MemoryManager;

/// A page-unaligned host range splits into at most a leading page, a run of
/// whole middle pages and a trailing page.
pub const MAX_FRAGMENTS: usize = 3;

static NEXT_ALLOCATION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a [`GraphicsAllocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(u64);

impl AllocationId {
    fn next() -> Self {
        Self(NEXT_ALLOCATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc#{}", self.0)
    }
}

/// A page-aligned piece of host memory, paged independently of the
/// allocations that reference it.
#[derive(Debug)]
pub struct Fragment {
    pub handle: OsHandle,
    pub cpu_ptr: usize,
    pub size: u64,
    pub residency: ResidencyData,
}

impl Fragment {
    #[must_use]
    pub fn new(handle: OsHandle, cpu_ptr: usize, size: u64) -> Self {
        Self {
            handle,
            cpu_ptr,
            size,
            residency: ResidencyData::new(),
        }
    }
}

/// Fixed-capacity list of the fragments backing one allocation.
#[derive(Debug, Default)]
pub struct FragmentStorage(SmallVec<[Arc<Fragment>; MAX_FRAGMENTS]>);

impl FragmentStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: Arc<Fragment>) -> ResidencyResult<()> {
        if self.0.len() == MAX_FRAGMENTS {
            return Err(ResidencyError::TooManyFragments { max: MAX_FRAGMENTS });
        }
        self.0.push(fragment);
        Ok(())
    }

    pub fn from_fragments(
        fragments: impl IntoIterator<Item = Arc<Fragment>>,
    ) -> ResidencyResult<Self> {
        let mut storage = Self::new();
        for fragment in fragments {
            storage.push(fragment)?;
        }
        Ok(storage)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Fragment>> {
        self.0.iter()
    }
}

/// What the kernel driver pages for an allocation.
#[derive(Debug)]
pub enum Backing {
    /// A single driver-created memory object.
    Handle(OsHandle),
    /// Host memory split into page-aligned fragments.
    Fragments(FragmentStorage),
}

/// A GPU-visible memory allocation.
pub struct GraphicsAllocation {
    id: AllocationId,
    backing: Backing,
    size: u64,
    gpu_address: u64,
    residency: ResidencyData,
    memory_manager: Weak<MemoryManager>,
}

impl GraphicsAllocation {
    /// Creates an allocation backed by a single handle and not owned by any manager.
    #[must_use]
    pub fn new(handle: OsHandle, size: u64) -> Self {
        Self::with_backing(Backing::Handle(handle), size, 0, Weak::new())
    }

    /// Creates an allocation backed by host-memory fragments.
    #[must_use]
    pub fn with_fragments(fragments: FragmentStorage, size: u64) -> Self {
        Self::with_backing(Backing::Fragments(fragments), size, 0, Weak::new())
    }

    pub(crate) fn with_backing(
        backing: Backing,
        size: u64,
        gpu_address: u64,
        memory_manager: Weak<MemoryManager>,
    ) -> Self {
        Self {
            id: AllocationId::next(),
            backing,
            size,
            gpu_address,
            residency: ResidencyData::new(),
            memory_manager,
        }
    }

    #[must_use]
    pub const fn id(&self) -> AllocationId {
        self.id
    }

    #[must_use]
    pub const fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Primary handle, `None` for fragment-backed allocations.
    #[must_use]
    pub const fn handle(&self) -> Option<OsHandle> {
        match self.backing {
            Backing::Handle(handle) => Some(handle),
            Backing::Fragments(_) => None,
        }
    }

    /// Fragments backing the allocation; empty when it has a primary handle.
    pub fn fragments(&self) -> impl Iterator<Item = &Arc<Fragment>> {
        let fragments = match &self.backing {
            Backing::Handle(_) => None,
            Backing::Fragments(storage) => Some(storage.iter()),
        };
        fragments.into_iter().flatten()
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        match &self.backing {
            Backing::Handle(_) => 0,
            Backing::Fragments(storage) => storage.len(),
        }
    }

    /// Size requested by the creator.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Size actually paged by the OS.
    #[must_use]
    pub const fn aligned_size(&self) -> u64 {
        page_align_up(self.size)
    }

    #[must_use]
    pub const fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    #[must_use]
    pub const fn residency(&self) -> &ResidencyData {
        &self.residency
    }

    #[must_use]
    pub fn trim_list_position(&self, context: ContextId) -> Option<usize> {
        self.residency.trim_list_position(context)
    }

    /// The manager that created this allocation, if it is still alive.
    #[must_use]
    pub fn memory_manager(&self) -> Option<Arc<MemoryManager>> {
        self.memory_manager.upgrade()
    }
}

impl fmt::Debug for GraphicsAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsAllocation")
            .field("id", &self.id)
            .field("backing", &self.backing)
            .field("size", &self.size)
            .field("gpu_address", &format_args!("0x{:x}", self.gpu_address))
            .field("residency", &self.residency)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_storage_enforces_bound() {
        let fragments = (0..MAX_FRAGMENTS as u32)
            .map(|i| Arc::new(Fragment::new(OsHandle(i + 1), 0x1000 * i as usize, 0x1000)));
        let mut storage = FragmentStorage::from_fragments(fragments).unwrap();
        assert_eq!(storage.len(), MAX_FRAGMENTS);

        let extra = Arc::new(Fragment::new(OsHandle(99), 0x9000, 0x1000));
        assert!(matches!(
            storage.push(extra),
            Err(ResidencyError::TooManyFragments { max: MAX_FRAGMENTS })
        ));
    }

    #[test]
    fn allocation_ids_are_unique() {
        let a = GraphicsAllocation::new(OsHandle(1), 0x1000);
        let b = GraphicsAllocation::new(OsHandle(1), 0x1000);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn handle_backed_allocation_has_no_fragments() {
        let alloc = GraphicsAllocation::new(OsHandle(5), 0xF00);
        assert_eq!(alloc.handle(), Some(OsHandle(5)));
        assert_eq!(alloc.fragment_count(), 0);
        assert_eq!(alloc.fragments().count(), 0);
        assert_eq!(alloc.aligned_size(), 0x1000);
        assert!(alloc.memory_manager().is_none());
    }

    #[test]
    fn fragment_backed_allocation_exposes_fragments() {
        let storage = FragmentStorage::from_fragments([
            Arc::new(Fragment::new(OsHandle(1), 0x1000, 0x1000)),
            Arc::new(Fragment::new(OsHandle(2), 0x2000, 0x1000)),
        ])
        .unwrap();
        let alloc = GraphicsAllocation::with_fragments(storage, 0x1800);
        assert_eq!(alloc.handle(), None);
        assert_eq!(alloc.fragment_count(), 2);
        let handles: Vec<_> = alloc.fragments().map(|f| f.handle).collect();
        assert_eq!(handles, vec![OsHandle(1), OsHandle(2)]);
    }
}
