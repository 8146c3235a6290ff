//! Interface to the kernel-mode driver.
//!
//! The residency controller never talks to the OS directly; every paging
//! operation goes through [`KernelDriver`]. [`device::SimulatedDevice`] is an
//! in-process implementation used by tests and demos.

pub mod device;
pub mod trim;

use crate::error::ResidencyResult;
use crate::thunk::fence::MonitoredFence;
use std::fmt;
use std::sync::Weak;
use trim::{TrimCallbackHandle, TrimHandler};

/// Kernel-driver handle of one pageable memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OsHandle(pub u32);

impl fmt::Display for OsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Outcome of a make-resident request that the driver accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakeResidentStatus {
    /// Every handle of the request is resident.
    Resident,
    /// The request exceeds the process budget; `bytes_to_trim` must be freed first.
    InsufficientBudget { bytes_to_trim: u64 },
}

/// Paging primitives consumed by the residency controller.
///
/// An `Err` from any of these means the driver contract itself was broken
/// (bad handle, lost device, ...). Memory pressure is reported in-band through
/// [`MakeResidentStatus::InsufficientBudget`].
pub trait KernelDriver: Send + Sync {
    /// Creates the monitored fence of one engine context.
    fn create_monitored_fence(&self) -> ResidencyResult<MonitoredFence>;

    /// Creates a pageable memory object of `size` bytes.
    fn create_allocation(&self, size: u64) -> ResidencyResult<OsHandle>;

    /// Destroys memory objects. The caller guarantees the GPU no longer uses them.
    fn destroy_allocations(&self, handles: &[OsHandle]) -> ResidencyResult<()>;

    /// Evicts `handles`. Returns the driver's advisory count of bytes still to trim.
    fn evict(&self, handles: &[OsHandle]) -> ResidencyResult<u64>;

    /// Pages `handles` in. With `cant_trim_further` set this is the last-resort
    /// call: the driver must succeed or report that it cannot.
    fn make_resident(
        &self,
        handles: &[OsHandle],
        cant_trim_further: bool,
        total_size: u64,
    ) -> ResidencyResult<MakeResidentStatus>;

    /// Blocks until `fence` reaches `value`. Returns immediately if it already has.
    fn wait_from_cpu(&self, fence: &MonitoredFence, value: u64) -> ResidencyResult<()>;

    /// Drops the driver's internal temporary-resource cache. Returns the bytes released.
    fn evict_temporary_resources(&self) -> ResidencyResult<u64>;

    /// Registers a trim callback. `None` when the OS refused the registration.
    fn register_trim_callback(&self, handler: Weak<dyn TrimHandler>) -> Option<TrimCallbackHandle>;

    fn unregister_trim_callback(&self, handle: TrimCallbackHandle);
}
