use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// CPU-visible completion value of a monitored fence.
///
/// The GPU (or whatever stands in for it) writes through a clone of this handle;
/// the value only ever moves forward.
#[derive(Debug, Clone, Default)]
pub struct FenceCompletion(Arc<AtomicU64>);

impl FenceCompletion {
    #[must_use]
    pub fn new(initial: u64) -> Self {
        Self(Arc::new(AtomicU64::new(initial)))
    }

    #[must_use]
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Publishes `value` as completed. Lower values than the current one are ignored.
    pub fn signal(&self, value: u64) {
        self.0.fetch_max(value, Ordering::AcqRel);
    }
}

/// Per engine-context GPU completion counter.
///
/// `current_fence_value` is the value the *next* submission will signal;
/// `last_submitted_fence` is the value of the most recent submission. The
/// completed value trails `last_submitted_fence` and eventually reaches it.
#[derive(Debug, Clone)]
pub struct MonitoredFence {
    pub fence_handle: u64,
    pub gpu_address: u64,
    pub current_fence_value: u64,
    pub last_submitted_fence: u64,
    completion: FenceCompletion,
}

impl MonitoredFence {
    #[must_use]
    pub fn new(fence_handle: u64, gpu_address: u64, completion: FenceCompletion) -> Self {
        Self {
            fence_handle,
            gpu_address,
            current_fence_value: 1,
            last_submitted_fence: 0,
            completion,
        }
    }

    /// The value the GPU has written back so far.
    #[must_use]
    pub fn completed_value(&self) -> u64 {
        self.completion.value()
    }

    #[must_use]
    pub fn completion(&self) -> &FenceCompletion {
        &self.completion
    }

    /// Stands in for the GPU writing `value` back.
    pub fn signal(&self, value: u64) {
        self.completion.signal(value);
    }

    #[must_use]
    pub fn is_completed(&self, value: u64) -> bool {
        value <= self.completed_value()
    }

    /// Books one submission: returns the value the GPU will signal for it.
    pub fn advance(&mut self) -> u64 {
        let submitted = self.current_fence_value;
        self.last_submitted_fence = submitted;
        self.current_fence_value += 1;
        submitted
    }
}
