use crate::error::{ResidencyError, ResidencyResult};
use crate::kmd::trim::{TrimCallbackHandle, TrimCallbackRegistry, TrimHandler, TrimNotification};
use crate::kmd::{KernelDriver, MakeResidentStatus, OsHandle};
use crate::thunk::fence::{FenceCompletion, MonitoredFence};
use crate::utils::page_align_up;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Weak;
use tracing::debug;

const FENCE_GPU_VA_BASE: u64 = 0x7f00_0000_0000;

/// One recorded `make_resident` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeResidentCall {
    pub handles: Vec<OsHandle>,
    pub cant_trim_further: bool,
    pub total_size: u64,
}

/// Everything the controller asked of the device, in call order per primitive.
#[derive(Debug, Clone, Default)]
pub struct DeviceCalls {
    pub evict: Vec<Vec<OsHandle>>,
    pub make_resident: Vec<MakeResidentCall>,
    pub wait_from_cpu: Vec<u64>,
    pub evict_temporary_resources: u32,
}

#[derive(Debug, Default)]
struct DeviceState {
    next_handle: u32,
    next_fence: u64,
    allocations: HashMap<OsHandle, u64>,
    resident: HashSet<OsHandle>,
    fences: HashMap<u64, FenceCompletion>,
    budget: Option<u64>,
    temporary_bytes: u64,
    scripted_make_resident: VecDeque<MakeResidentStatus>,
    evict_advisory_bytes: u64,
    fail_evict: bool,
    fail_wait: bool,
    allocation_limit: Option<usize>,
    calls: DeviceCalls,
}

impl DeviceState {
    fn resident_bytes(&self) -> u64 {
        self.resident
            .iter()
            .filter_map(|handle| self.allocations.get(handle))
            .sum::<u64>()
            + self.temporary_bytes
    }

    fn check_handles(&self, op: &'static str, handles: &[OsHandle]) -> ResidencyResult<()> {
        match handles.iter().find(|h| !self.allocations.contains_key(*h)) {
            Some(handle) => Err(ResidencyError::driver(op, format!("unknown handle {handle}"))),
            None => Ok(()),
        }
    }
}

/// In-process stand-in for the kernel-mode driver.
///
/// Tracks a resident-memory budget, a temporary resource cache that counts
/// against it, and a table of monitored fences. Waiting on a fence completes it,
/// as if the GPU finished the outstanding work. Failures can be scripted and
/// every call is recorded.
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    state: Mutex<DeviceState>,
    trim_callbacks: TrimCallbackRegistry,
}

impl SimulatedDevice {
    /// A device with unlimited budget.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that refuses to keep more than `budget` bytes resident.
    #[must_use]
    pub fn with_budget(budget: u64) -> Self {
        let device = Self::new();
        device.state.lock().budget = Some(budget);
        device
    }

    pub fn set_budget(&self, budget: Option<u64>) {
        self.state.lock().budget = budget;
    }

    /// Bytes held by the driver's internal cache; they count against the budget.
    pub fn set_temporary_resources(&self, bytes: u64) {
        self.state.lock().temporary_bytes = bytes;
    }

    /// Queues results returned by the next `make_resident` calls, ahead of the
    /// budget check.
    pub fn script_make_resident(&self, results: impl IntoIterator<Item = MakeResidentStatus>) {
        self.state.lock().scripted_make_resident.extend(results);
    }

    /// Advisory byte count reported by every `evict`.
    pub fn set_evict_advisory_bytes(&self, bytes: u64) {
        self.state.lock().evict_advisory_bytes = bytes;
    }

    pub fn fail_evict(&self, fail: bool) {
        self.state.lock().fail_evict = fail;
    }

    pub fn fail_wait(&self, fail: bool) {
        self.state.lock().fail_wait = fail;
    }

    /// Caps the number of live allocations; creating one more fails.
    pub fn limit_allocations(&self, limit: Option<usize>) {
        self.state.lock().allocation_limit = limit;
    }

    #[must_use]
    pub fn calls(&self) -> DeviceCalls {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls = DeviceCalls::default();
    }

    #[must_use]
    pub fn is_resident(&self, handle: OsHandle) -> bool {
        self.state.lock().resident.contains(&handle)
    }

    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.state.lock().resident_bytes()
    }

    #[must_use]
    pub fn live_allocation_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Marks a handle resident without going through `make_resident`.
    pub fn force_resident(&self, handle: OsHandle) {
        self.state.lock().resident.insert(handle);
    }

    /// Emulates the OS raising a trim notification. Returns the number of
    /// callbacks that received it.
    pub fn signal_trim(&self, notification: TrimNotification) -> usize {
        self.trim_callbacks.notify_all(notification)
    }

    #[must_use]
    pub fn trim_callback_count(&self) -> usize {
        self.trim_callbacks.len()
    }
}

impl KernelDriver for SimulatedDevice {
    fn create_monitored_fence(&self) -> ResidencyResult<MonitoredFence> {
        let mut state = self.state.lock();
        state.next_fence += 1;
        let fence_handle = state.next_fence;
        let completion = FenceCompletion::new(0);
        state.fences.insert(fence_handle, completion.clone());

        Ok(MonitoredFence::new(
            fence_handle,
            FENCE_GPU_VA_BASE + fence_handle * 8,
            completion,
        ))
    }

    fn create_allocation(&self, size: u64) -> ResidencyResult<OsHandle> {
        if size == 0 {
            return Err(ResidencyError::driver("create_allocation", "zero-sized allocation"));
        }
        let mut state = self.state.lock();
        if state
            .allocation_limit
            .is_some_and(|limit| state.allocations.len() >= limit)
        {
            return Err(ResidencyError::driver("create_allocation", "out of handles"));
        }
        state.next_handle += 1;
        let handle = OsHandle(state.next_handle);
        state.allocations.insert(handle, page_align_up(size));
        Ok(handle)
    }

    fn destroy_allocations(&self, handles: &[OsHandle]) -> ResidencyResult<()> {
        let mut state = self.state.lock();
        state.check_handles("destroy_allocations", handles)?;
        for handle in handles {
            state.allocations.remove(handle);
            state.resident.remove(handle);
        }
        Ok(())
    }

    fn evict(&self, handles: &[OsHandle]) -> ResidencyResult<u64> {
        let mut state = self.state.lock();
        state.calls.evict.push(handles.to_vec());
        if state.fail_evict {
            return Err(ResidencyError::driver("evict", "device rejected evict"));
        }
        state.check_handles("evict", handles)?;
        for handle in handles {
            state.resident.remove(handle);
        }
        Ok(state.evict_advisory_bytes)
    }

    fn make_resident(
        &self,
        handles: &[OsHandle],
        cant_trim_further: bool,
        total_size: u64,
    ) -> ResidencyResult<MakeResidentStatus> {
        let mut state = self.state.lock();
        state.calls.make_resident.push(MakeResidentCall {
            handles: handles.to_vec(),
            cant_trim_further,
            total_size,
        });
        state.check_handles("make_resident", handles)?;

        let scripted = state.scripted_make_resident.pop_front();
        let status = match scripted {
            Some(status) => status,
            None => {
                let incoming: u64 = handles
                    .iter()
                    .filter(|h| !state.resident.contains(*h))
                    .filter_map(|h| state.allocations.get(h))
                    .sum();
                let needed = state.resident_bytes() + incoming;
                match state.budget {
                    Some(budget) if needed > budget => MakeResidentStatus::InsufficientBudget {
                        bytes_to_trim: needed - budget,
                    },
                    _ => MakeResidentStatus::Resident,
                }
            }
        };

        if status == MakeResidentStatus::Resident {
            state.resident.extend(handles.iter().copied());
        }
        debug!(count = handles.len(), cant_trim_further, ?status, "simulated make_resident");
        Ok(status)
    }

    fn wait_from_cpu(&self, fence: &MonitoredFence, value: u64) -> ResidencyResult<()> {
        let mut state = self.state.lock();
        state.calls.wait_from_cpu.push(value);
        if state.fail_wait {
            return Err(ResidencyError::driver("wait_from_cpu", "device lost"));
        }
        let Some(completion) = state.fences.get(&fence.fence_handle) else {
            return Err(ResidencyError::driver(
                "wait_from_cpu",
                format!("unknown fence {}", fence.fence_handle),
            ));
        };
        if value > fence.last_submitted_fence {
            // Nothing was ever submitted that could signal this value.
            return Err(ResidencyError::WaitTimeout);
        }
        completion.signal(value);
        Ok(())
    }

    fn evict_temporary_resources(&self) -> ResidencyResult<u64> {
        let mut state = self.state.lock();
        state.calls.evict_temporary_resources += 1;
        Ok(std::mem::take(&mut state.temporary_bytes))
    }

    fn register_trim_callback(&self, handler: Weak<dyn TrimHandler>) -> Option<TrimCallbackHandle> {
        Some(self.trim_callbacks.register(handler))
    }

    fn unregister_trim_callback(&self, handle: TrimCallbackHandle) {
        self.trim_callbacks.unregister(handle);
    }
}
