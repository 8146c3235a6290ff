use super::host_ptr::HostPtrManager;
use super::{AllocationId, Backing, Fragment, FragmentStorage, GraphicsAllocation};
use crate::error::{ResidencyError, ResidencyResult};
use crate::kmd::KernelDriver;
use crate::thunk::residency::ResidencyController;
use crate::utils::{PAGE_SIZE, page_align_up};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

// Start of the range handed out to driver-backed allocations.
const GPU_VA_BASE: u64 = 0x1000_0000;

/// Creates and destroys graphics allocations and knows every engine context
/// that may hold them resident.
pub struct MemoryManager {
    driver: Arc<dyn KernelDriver>,
    host_ptr_manager: Mutex<HostPtrManager>,
    allocations: Mutex<HashMap<AllocationId, Arc<GraphicsAllocation>>>,
    os_contexts: RwLock<Vec<Arc<ResidencyController>>>,
    next_gpu_va: AtomicU64,
}

impl MemoryManager {
    #[must_use]
    pub fn new(driver: Arc<dyn KernelDriver>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            host_ptr_manager: Mutex::new(HostPtrManager::new()),
            allocations: Mutex::new(HashMap::new()),
            os_contexts: RwLock::new(Vec::new()),
            next_gpu_va: AtomicU64::new(GPU_VA_BASE),
        })
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn KernelDriver> {
        &self.driver
    }

    /// Makes `controller` part of every subsequent free.
    pub fn register_os_context(&self, controller: Arc<ResidencyController>) {
        debug!(context = %controller.context(), "registered engine context");
        self.os_contexts.write().push(controller);
    }

    #[must_use]
    pub fn os_context_count(&self) -> usize {
        self.os_contexts.read().len()
    }

    /// Allocates `size` bytes backed by one driver memory object.
    pub fn allocate(self: &Arc<Self>, size: u64) -> ResidencyResult<Arc<GraphicsAllocation>> {
        let handle = self.driver.create_allocation(size)?;
        let gpu_address = self
            .next_gpu_va
            .fetch_add(page_align_up(size).max(PAGE_SIZE), Ordering::Relaxed);

        let allocation = Arc::new(GraphicsAllocation::with_backing(
            Backing::Handle(handle),
            size,
            gpu_address,
            Arc::downgrade(self),
        ));
        debug!(
            id = %allocation.id(),
            handle = %handle,
            size,
            gpu_address = format_args!("0x{gpu_address:x}"),
            "allocated"
        );
        self.allocations
            .lock()
            .insert(allocation.id(), allocation.clone());
        Ok(allocation)
    }

    /// Wraps the host range `[ptr, ptr + size)` in an allocation backed by
    /// page-aligned fragments. Identical ranges share their fragments.
    pub fn allocate_with_host_ptr(
        self: &Arc<Self>,
        ptr: usize,
        size: u64,
    ) -> ResidencyResult<Arc<GraphicsAllocation>> {
        if size == 0 {
            return Err(ResidencyError::driver("create_allocation", "zero-sized allocation"));
        }

        let fragments = self
            .host_ptr_manager
            .lock()
            .acquire_fragments(self.driver.as_ref(), ptr, size)?;
        let storage = match FragmentStorage::from_fragments(fragments.iter().cloned()) {
            Ok(storage) => storage,
            Err(e) => {
                self.release_fragments(fragments.iter().map(|fragment| &**fragment))?;
                return Err(e);
            }
        };

        let allocation = Arc::new(GraphicsAllocation::with_backing(
            Backing::Fragments(storage),
            size,
            ptr as u64,
            Arc::downgrade(self),
        ));
        debug!(
            id = %allocation.id(),
            fragments = allocation.fragment_count(),
            cpu_ptr = format_args!("0x{ptr:x}"),
            size,
            "allocated from host pointer"
        );
        self.allocations
            .lock()
            .insert(allocation.id(), allocation.clone());
        Ok(allocation)
    }

    #[must_use]
    pub fn get(&self, id: AllocationId) -> Option<Arc<GraphicsAllocation>> {
        self.allocations.lock().get(&id).cloned()
    }

    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.allocations.lock().len()
    }

    #[must_use]
    pub fn host_fragment_count(&self) -> usize {
        self.host_ptr_manager.lock().fragment_count()
    }

    /// Destroys an allocation once no engine context can still be using it.
    ///
    /// The allocation leaves every trim list first, then each context's fence is
    /// waited on up to the allocation's last use. Only then are its handles
    /// evicted and destroyed (or its fragment references dropped).
    pub fn free(&self, allocation: &Arc<GraphicsAllocation>) -> ResidencyResult<()> {
        let id = allocation.id();
        if self.allocations.lock().remove(&id).is_none() {
            return Err(ResidencyError::UnknownAllocation(id.raw()));
        }

        let contexts = self.os_contexts.read().clone();
        for controller in &contexts {
            controller.remove_from_trim_candidate_list(allocation, true);
        }

        for controller in &contexts {
            let context = controller.context();
            let last_use = allocation
                .fragments()
                .map(|fragment| fragment.residency.last_fence_value(context))
                .chain(std::iter::once(allocation.residency().last_fence_value(context)))
                .max()
                .unwrap_or(0);
            controller.wait_for_fence_value(last_use)?;
        }

        match allocation.backing() {
            Backing::Handle(handle) => {
                if allocation.residency().is_resident_anywhere() {
                    self.driver.evict(&[*handle])?;
                }
                self.driver.destroy_allocations(&[*handle])?;
                for controller in &contexts {
                    allocation
                        .residency()
                        .set_resident(controller.context(), false);
                }
            }
            Backing::Fragments(storage) => {
                self.release_fragments(storage.iter().map(|fragment| &**fragment))?;
            }
        }

        debug!(id = %id, "freed");
        Ok(())
    }

    /// Frees the allocation registered under `id`.
    pub fn free_by_id(&self, id: AllocationId) -> ResidencyResult<()> {
        let allocation = self
            .get(id)
            .ok_or(ResidencyError::UnknownAllocation(id.raw()))?;
        self.free(&allocation)
    }

    fn release_fragments<'a>(
        &self,
        fragments: impl Iterator<Item = &'a Fragment>,
    ) -> ResidencyResult<()> {
        let mut host_ptr_manager = self.host_ptr_manager.lock();
        for fragment in fragments {
            host_ptr_manager.release_fragment(self.driver.as_ref(), fragment)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("allocations", &self.allocation_count())
            .field("os_contexts", &self.os_context_count())
            .field("host_fragments", &self.host_fragment_count())
            .finish_non_exhaustive()
    }
}
