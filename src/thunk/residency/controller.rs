use super::trim_list::TrimCandidateList;
use crate::config::ResidencyConfig;
use crate::error::{ResidencyError, ResidencyResult};
use crate::kmd::trim::{TrimCallbackHandle, TrimFlags, TrimHandler, TrimNotification};
use crate::kmd::{KernelDriver, MakeResidentStatus, OsHandle};
use crate::thunk::fence::{FenceCompletion, MonitoredFence};
use crate::thunk::memory::residency::ContextId;
use crate::thunk::memory::{Fragment, GraphicsAllocation, MAX_FRAGMENTS};
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, instrument, trace, warn};

// ===============================================================================================
// Statistics
// ===============================================================================================

/// Point-in-time counters of one controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResidencyStats {
    pub lock_acquisitions: u64,
    pub evicted_handles: u64,
    pub evicted_bytes: u64,
    pub trim_passes: u64,
    pub make_resident_retries: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    lock_acquisitions: AtomicU64,
    evicted_handles: AtomicU64,
    evicted_bytes: AtomicU64,
    trim_passes: AtomicU64,
    make_resident_retries: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ResidencyStats {
        ResidencyStats {
            lock_acquisitions: self.lock_acquisitions.load(Ordering::Relaxed),
            evicted_handles: self.evicted_handles.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            trim_passes: self.trim_passes.load(Ordering::Relaxed),
            make_resident_retries: self.make_resident_retries.load(Ordering::Relaxed),
        }
    }
}

// ===============================================================================================
// Controller
// ===============================================================================================

#[derive(Debug)]
struct ControllerState {
    trim_candidates: TrimCandidateList,
    fence: MonitoredFence,
}

/// Handles picked for eviction from one trim candidate.
struct EvictionBatch<'a> {
    handles: SmallVec<[OsHandle; MAX_FRAGMENTS]>,
    fragments: SmallVec<[&'a Arc<Fragment>; MAX_FRAGMENTS]>,
    bytes: u64,
    max_fence: u64,
}

impl<'a> EvictionBatch<'a> {
    /// Everything backing `allocation` whose last use is at or below `fence_limit`.
    fn collect(allocation: &'a GraphicsAllocation, context: ContextId, fence_limit: u64) -> Self {
        let mut batch = Self {
            handles: SmallVec::new(),
            fragments: SmallVec::new(),
            bytes: 0,
            max_fence: 0,
        };

        if let Some(handle) = allocation.handle() {
            batch.handles.push(handle);
            batch.bytes = allocation.aligned_size();
            batch.max_fence = allocation.residency().last_fence_value(context);
            return batch;
        }

        for fragment in allocation.fragments() {
            let fence = fragment.residency.last_fence_value(context);
            if fence <= fence_limit {
                batch.handles.push(fragment.handle);
                batch.fragments.push(fragment);
                batch.bytes += fragment.size;
                batch.max_fence = batch.max_fence.max(fence);
            }
        }
        batch
    }
}

/// Residency bookkeeping of one engine context.
///
/// Owns the context's trim candidate list and monitored fence behind a single
/// lock. Submission threads call [`Self::make_resident_residency_allocations`]
/// and [`Self::make_non_resident_eviction_allocations`]; the OS trim callback
/// calls [`Self::trim_residency`], possibly from another thread.
pub struct ResidencyController {
    driver: Arc<dyn KernelDriver>,
    context: ContextId,
    config: ResidencyConfig,
    state: Mutex<ControllerState>,
    completion: FenceCompletion,
    last_trim_fence_value: AtomicU64,
    memory_budget_exhausted: AtomicBool,
    trim_callback: Option<TrimCallbackHandle>,
    stats: StatsCounters,
}

impl ResidencyController {
    /// Creates the controller of engine context `context` and, if configured,
    /// registers it for OS trim notifications.
    pub fn new(
        driver: Arc<dyn KernelDriver>,
        context: ContextId,
        config: &ResidencyConfig,
    ) -> ResidencyResult<Arc<Self>> {
        let fence = driver.create_monitored_fence()?;
        let completion = fence.completion().clone();

        let controller = Arc::new_cyclic(|weak: &Weak<Self>| {
            let trim_callback = if config.register_trim_callback {
                let handler: Weak<dyn TrimHandler> = weak.clone();
                let handle = driver.register_trim_callback(handler);
                if handle.is_none() {
                    warn!(context = %context, "trim callback registration refused");
                }
                handle
            } else {
                None
            };

            Self {
                driver: driver.clone(),
                context,
                config: config.clone(),
                state: Mutex::new(ControllerState {
                    trim_candidates: TrimCandidateList::new(context),
                    fence,
                }),
                completion,
                last_trim_fence_value: AtomicU64::new(0),
                memory_budget_exhausted: AtomicBool::new(false),
                trim_callback,
                stats: StatsCounters::default(),
            }
        });

        debug!(
            context = %context,
            trim_callback = controller.trim_callback.is_some(),
            "residency controller created"
        );
        Ok(controller)
    }

    #[must_use]
    pub const fn context(&self) -> ContextId {
        self.context
    }

    #[must_use]
    pub const fn trim_callback_handle(&self) -> Option<TrimCallbackHandle> {
        self.trim_callback
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        StatsCounters::bump(&self.stats.lock_acquisitions, 1);
        self.state.lock()
    }

    // -------------------------------------------------------------------------------------------
    // Submission path
    // -------------------------------------------------------------------------------------------

    /// Makes every allocation (or fragment) of an upcoming submission resident.
    ///
    /// On success each of them is resident for this context and stamped with
    /// the fence value of the submission about to happen. On failure nothing is
    /// marked and the call returns [`ResidencyError::OutOfMemory`], or the
    /// driver error that broke the ladder.
    pub fn make_resident_residency_allocations(
        &self,
        allocations: &[Arc<GraphicsAllocation>],
    ) -> ResidencyResult<()> {
        let mut state = self.lock_state();

        let mut removed: SmallVec<[&Arc<GraphicsAllocation>; 8]> = SmallVec::new();
        for allocation in allocations {
            if state.trim_candidates.remove_if_present(allocation, false) {
                removed.push(allocation);
            }
        }

        let result = self.make_resident_locked(&mut state, allocations);

        if result.is_err() {
            // Candidates that survived the failed attempt stay evictable.
            for allocation in removed {
                if allocation.residency().is_resident(self.context) {
                    state.trim_candidates.add(allocation);
                }
            }
        }
        if state.trim_candidates.needs_compaction() {
            state.trim_candidates.compact();
        }
        result
    }

    fn make_resident_locked(
        &self,
        state: &mut ControllerState,
        allocations: &[Arc<GraphicsAllocation>],
    ) -> ResidencyResult<()> {
        let (mut handles, mut total_size) = self.pending_handles(allocations);

        if !handles.is_empty() {
            let mut status = self.driver.make_resident(&handles, false, total_size)?;

            if let MakeResidentStatus::InsufficientBudget { bytes_to_trim } = status {
                self.memory_budget_exhausted.store(true, Ordering::Release);
                warn!(
                    context = %self.context,
                    bytes_to_trim,
                    "make resident over budget, trimming"
                );
                if self.trim_to_budget_locked(state, bytes_to_trim)? {
                    // The trim may have evicted fragments shared with this call.
                    (handles, total_size) = self.pending_handles(allocations);
                    status = self.retry_make_resident(&handles, false, total_size)?;
                }
            }

            if status != MakeResidentStatus::Resident && self.config.evict_temporary_resources {
                let released = self.driver.evict_temporary_resources()?;
                debug!(context = %self.context, released, "evicted temporary resources");
                (handles, total_size) = self.pending_handles(allocations);
                status = self.retry_make_resident(&handles, false, total_size)?;
            }

            if status != MakeResidentStatus::Resident {
                (handles, total_size) = self.pending_handles(allocations);
                status = self.retry_make_resident(&handles, true, total_size)?;
            }

            if let MakeResidentStatus::InsufficientBudget { bytes_to_trim } = status {
                error!(
                    context = %self.context,
                    handles = handles.len(),
                    bytes_to_trim,
                    "out of GPU memory"
                );
                return Err(ResidencyError::OutOfMemory { bytes_to_trim });
            }

            if self.config.residency_logging {
                for handle in &handles {
                    trace!(context = %self.context, handle = %handle, "made resident");
                }
            }
        }

        let fence_value = state.fence.current_fence_value;
        for allocation in allocations {
            allocation.residency().update(self.context, |slot| {
                slot.resident = true;
                slot.last_fence_value = fence_value;
            });
            for fragment in allocation.fragments() {
                fragment.residency.update(self.context, |slot| {
                    slot.resident = true;
                    slot.last_fence_value = fence_value;
                });
            }
        }
        Ok(())
    }

    fn retry_make_resident(
        &self,
        handles: &[OsHandle],
        cant_trim_further: bool,
        total_size: u64,
    ) -> ResidencyResult<MakeResidentStatus> {
        StatsCounters::bump(&self.stats.make_resident_retries, 1);
        self.driver
            .make_resident(handles, cant_trim_further, total_size)
    }

    /// Handles of `allocations` not yet resident for this context, deduplicated,
    /// plus the bytes they cover.
    fn pending_handles(&self, allocations: &[Arc<GraphicsAllocation>]) -> (Vec<OsHandle>, u64) {
        let mut handles = Vec::with_capacity(allocations.len());
        let mut total_size = 0;

        for allocation in allocations {
            if let Some(handle) = allocation.handle() {
                if !allocation.residency().is_resident(self.context) && !handles.contains(&handle) {
                    handles.push(handle);
                    total_size += allocation.aligned_size();
                }
                continue;
            }
            for fragment in allocation.fragments() {
                if !fragment.residency.is_resident(self.context)
                    && !handles.contains(&fragment.handle)
                {
                    handles.push(fragment.handle);
                    total_size += fragment.size;
                }
            }
        }
        (handles, total_size)
    }

    /// Marks allocations as no longer referenced by pending work. They become
    /// trim candidates; nothing is evicted here.
    pub fn make_non_resident_eviction_allocations(&self, allocations: &[Arc<GraphicsAllocation>]) {
        let mut state = self.lock_state();
        for allocation in allocations {
            state.trim_candidates.add(allocation);
        }
    }

    pub fn add_to_trim_candidate_list(&self, allocation: &Arc<GraphicsAllocation>) {
        self.lock_state().trim_candidates.add(allocation);
    }

    /// Pins `allocation` for this context. Both trim policies step over pinned
    /// candidates and leave them on the list.
    pub fn set_always_resident(&self, allocation: &GraphicsAllocation, always_resident: bool) {
        let _state = self.lock_state();
        allocation
            .residency()
            .set_always_resident(self.context, always_resident);
    }

    /// Removes `allocation` from the trim list if it is there. Returns whether it was.
    pub fn remove_from_trim_candidate_list(
        &self,
        allocation: &GraphicsAllocation,
        compact: bool,
    ) -> bool {
        self.lock_state()
            .trim_candidates
            .remove_if_present(allocation, compact)
    }

    /// Books one submission and returns the fence value the GPU will signal for it.
    pub fn record_submission(&self) -> u64 {
        self.lock_state().fence.advance()
    }

    /// Blocks until every submission up to `value` has completed. Values never
    /// submitted are clamped: no GPU work can be using them.
    pub fn wait_for_fence_value(&self, value: u64) -> ResidencyResult<()> {
        if value <= self.completion.value() {
            return Ok(());
        }
        let state = self.lock_state();
        let value = value.min(state.fence.last_submitted_fence);
        if value > state.fence.completed_value() {
            self.driver.wait_from_cpu(&state.fence, value)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Trim path
    // -------------------------------------------------------------------------------------------

    /// Serves one OS trim notification. The controller lock is taken once for
    /// each sub-policy present in `flags`.
    #[instrument(skip(self), fields(context = %self.context))]
    pub fn trim_residency(&self, flags: TrimFlags, bytes: u64) -> ResidencyResult<()> {
        if flags.periodic_trim {
            let mut state = self.lock_state();
            self.periodic_trim_locked(&mut state)?;
        }

        if flags.trim_to_budget {
            let mut state = self.lock_state();
            let satisfied = self.trim_to_budget_locked(&mut state, bytes)?;
            if !satisfied {
                debug!(bytes, "trim list exhausted before budget was met");
            }
        }

        // Includes fences the budget pass waited on.
        if flags.periodic_trim || flags.restart_periodic_trim {
            self.update_last_trim_fence_value();
        }
        Ok(())
    }

    /// Evicts candidates in list order until `bytes` have been freed. Returns
    /// `false` if the list ran out first.
    pub fn trim_residency_to_budget(&self, bytes: u64) -> ResidencyResult<bool> {
        let mut state = self.lock_state();
        self.trim_to_budget_locked(&mut state, bytes)
    }

    fn periodic_trim_locked(&self, state: &mut ControllerState) -> ResidencyResult<()> {
        StatsCounters::bump(&self.stats.trim_passes, 1);
        let watermark = self.last_trim_fence_value();
        let mut evicted = 0usize;
        let mut index = 0;

        while index < state.trim_candidates.len() {
            let Some(allocation) = state.trim_candidates.get(index).cloned() else {
                index += 1;
                continue;
            };
            index += 1;

            if allocation.residency().is_always_resident(self.context) {
                continue;
            }
            if allocation.residency().last_fence_value(self.context) > watermark {
                break;
            }

            let batch = EvictionBatch::collect(&allocation, self.context, watermark);
            self.evict_batch(&allocation, &batch)?;
            state.trim_candidates.remove(&allocation, false);
            evicted += 1;
        }

        if state.trim_candidates.needs_compaction() {
            state.trim_candidates.compact();
        }
        debug!(
            evicted,
            watermark,
            remaining = state.trim_candidates.live_count(),
            "periodic trim done"
        );
        Ok(())
    }

    fn trim_to_budget_locked(&self, state: &mut ControllerState, bytes: u64) -> ResidencyResult<bool> {
        if bytes == 0 {
            return Ok(true);
        }
        StatsCounters::bump(&self.stats.trim_passes, 1);

        let mut remaining = bytes;
        let mut index = 0;

        while remaining > 0 && index < state.trim_candidates.len() {
            let Some(allocation) = state.trim_candidates.get(index).cloned() else {
                index += 1;
                continue;
            };
            index += 1;

            if allocation.residency().is_always_resident(self.context) {
                continue;
            }
            let last_submitted = state.fence.last_submitted_fence;
            if allocation.residency().last_fence_value(self.context) > last_submitted {
                break;
            }

            let batch = EvictionBatch::collect(&allocation, self.context, last_submitted);
            if batch.max_fence > state.fence.completed_value() {
                self.driver.wait_from_cpu(&state.fence, batch.max_fence)?;
            }
            self.evict_batch(&allocation, &batch)?;
            state.trim_candidates.remove(&allocation, false);
            remaining = remaining.saturating_sub(batch.bytes);
        }

        if state.trim_candidates.needs_compaction() {
            state.trim_candidates.compact();
        }
        debug!(requested = bytes, remaining, "trim to budget done");
        Ok(remaining == 0)
    }

    fn evict_batch(&self, allocation: &GraphicsAllocation, batch: &EvictionBatch<'_>) -> ResidencyResult<()> {
        if !batch.handles.is_empty() {
            self.driver.evict(&batch.handles)?;
            StatsCounters::bump(&self.stats.evicted_handles, batch.handles.len() as u64);
            StatsCounters::bump(&self.stats.evicted_bytes, batch.bytes);

            if self.config.residency_logging {
                for handle in &batch.handles {
                    trace!(context = %self.context, handle = %handle, "evicted");
                }
            }
        }

        for fragment in &batch.fragments {
            fragment.residency.set_resident(self.context, false);
        }
        allocation.residency().set_resident(self.context, false);
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------------------------

    /// Sticky: set the first time a make-resident request exceeded the budget.
    #[must_use]
    pub fn is_memory_budget_exhausted(&self) -> bool {
        self.memory_budget_exhausted.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_trim_fence_value(&self) -> u64 {
        self.last_trim_fence_value.load(Ordering::Acquire)
    }

    pub fn set_last_trim_fence_value(&self, value: u64) {
        self.last_trim_fence_value.store(value, Ordering::Release);
    }

    /// Moves the periodic-trim watermark to the fence's completed value.
    pub fn update_last_trim_fence_value(&self) {
        self.set_last_trim_fence_value(self.completion.value());
    }

    /// True if work stamped with `fence_value` was submitted after the last
    /// periodic trim watermark.
    #[must_use]
    pub fn was_allocation_used_since_last_trim(&self, fence_value: u64) -> bool {
        fence_value > self.last_trim_fence_value()
    }

    /// Copy of the monitored fence's bookkeeping.
    #[must_use]
    pub fn monitored_fence(&self) -> MonitoredFence {
        self.lock_state().fence.clone()
    }

    /// Writer side of the fence's completed value, as the GPU sees it.
    #[must_use]
    pub const fn fence_completion(&self) -> &FenceCompletion {
        &self.completion
    }

    /// Live trim candidates in list order.
    #[must_use]
    pub fn trim_candidates(&self) -> Vec<Arc<GraphicsAllocation>> {
        self.lock_state().trim_candidates.iter().cloned().collect()
    }

    /// Runs `f` on the trim candidate list under the controller lock.
    pub fn with_trim_candidates<R>(&self, f: impl FnOnce(&TrimCandidateList) -> R) -> R {
        f(&self.lock_state().trim_candidates)
    }

    #[must_use]
    pub fn trim_candidate_count(&self) -> usize {
        self.lock_state().trim_candidates.live_count()
    }

    #[must_use]
    pub fn stats(&self) -> ResidencyStats {
        self.stats.snapshot()
    }
}

impl TrimHandler for ResidencyController {
    fn on_trim(&self, notification: TrimNotification) {
        if let Err(e) = self.trim_residency(notification.flags, notification.num_bytes_to_trim) {
            error!(context = %self.context, error = %e, "trim callback failed");
        }
    }
}

impl Drop for ResidencyController {
    fn drop(&mut self) {
        if let Some(handle) = self.trim_callback.take() {
            self.driver.unregister_trim_callback(handle);
        }
    }
}

impl fmt::Debug for ResidencyController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResidencyController")
            .field("context", &self.context)
            .field("trim_callback", &self.trim_callback)
            .field("last_trim_fence_value", &self.last_trim_fence_value())
            .field("memory_budget_exhausted", &self.is_memory_budget_exhausted())
            .finish_non_exhaustive()
    }
}
