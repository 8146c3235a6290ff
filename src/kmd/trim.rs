use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

pub const TRIM_FLAG_PERIODIC_TRIM: u32 = 1 << 0;
pub const TRIM_FLAG_RESTART_PERIODIC_TRIM: u32 = 1 << 1;
pub const TRIM_FLAG_TRIM_TO_BUDGET: u32 = 1 << 2;

/// Reasons carried by an OS trim notification. Several may be set at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimFlags {
    pub periodic_trim: bool,
    pub restart_periodic_trim: bool,
    pub trim_to_budget: bool,
}

impl TrimFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn periodic_trim(mut self) -> Self {
        self.periodic_trim = true;
        self
    }

    #[must_use]
    pub const fn restart_periodic_trim(mut self) -> Self {
        self.restart_periodic_trim = true;
        self
    }

    #[must_use]
    pub const fn trim_to_budget(mut self) -> Self {
        self.trim_to_budget = true;
        self
    }

    /// Decodes the raw bitmask delivered by the OS. Unknown bits are ignored.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            periodic_trim: bits & TRIM_FLAG_PERIODIC_TRIM != 0,
            restart_periodic_trim: bits & TRIM_FLAG_RESTART_PERIODIC_TRIM != 0,
            trim_to_budget: bits & TRIM_FLAG_TRIM_TO_BUDGET != 0,
        }
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        let mut bits = 0;
        if self.periodic_trim {
            bits |= TRIM_FLAG_PERIODIC_TRIM;
        }
        if self.restart_periodic_trim {
            bits |= TRIM_FLAG_RESTART_PERIODIC_TRIM;
        }
        if self.trim_to_budget {
            bits |= TRIM_FLAG_TRIM_TO_BUDGET;
        }
        bits
    }
}

/// The message the OS delivers to a registered trim callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimNotification {
    pub flags: TrimFlags,
    pub num_bytes_to_trim: u64,
}

/// Receiver side of a trim callback registration.
pub trait TrimHandler: Send + Sync {
    fn on_trim(&self, notification: TrimNotification);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrimCallbackHandle(u64);

impl TrimCallbackHandle {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Registration table for trim callbacks.
///
/// Handlers are held weakly, so a registration never extends the lifetime of the
/// controller behind it. Notifications are delivered outside the table lock: a
/// handler may be dropped (and unregister itself) while a delivery is in flight.
#[derive(Default)]
pub struct TrimCallbackRegistry {
    next_handle: AtomicU64,
    entries: Mutex<HashMap<TrimCallbackHandle, Weak<dyn TrimHandler>>>,
}

impl TrimCallbackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Weak<dyn TrimHandler>) -> TrimCallbackHandle {
        let handle = TrimCallbackHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        self.entries.lock().insert(handle, handler);
        handle
    }

    /// Returns `false` if the handle was not registered.
    pub fn unregister(&self, handle: TrimCallbackHandle) -> bool {
        self.entries.lock().remove(&handle).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers a notification to every live registration, returning how many
    /// handlers received it.
    pub fn notify_all(&self, notification: TrimNotification) -> usize {
        let handlers: Vec<_> = self
            .entries
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        for handler in &handlers {
            handler.on_trim(notification);
        }
        handlers.len()
    }
}

impl std::fmt::Debug for TrimCallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrimCallbackRegistry")
            .field("registrations", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct Counter {
        calls: AtomicU32,
        last_bytes: AtomicU64,
    }

    impl TrimHandler for Counter {
        fn on_trim(&self, notification: TrimNotification) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.last_bytes
                .store(notification.num_bytes_to_trim, Ordering::Relaxed);
        }
    }

    #[test]
    fn flags_roundtrip_through_raw_bits() {
        let flags = TrimFlags::new().periodic_trim().trim_to_budget();
        assert_eq!(flags.bits(), TRIM_FLAG_PERIODIC_TRIM | TRIM_FLAG_TRIM_TO_BUDGET);
        assert_eq!(TrimFlags::from_bits(flags.bits()), flags);
        assert_eq!(TrimFlags::from_bits(0x80), TrimFlags::new());
    }

    #[test]
    fn notification_reaches_registered_handler() {
        let registry = TrimCallbackRegistry::new();
        let counter = Arc::new(Counter::default());
        let weak: Weak<dyn TrimHandler> = Arc::downgrade(&counter) as Weak<dyn TrimHandler>;
        registry.register(weak);

        let notification = TrimNotification {
            flags: TrimFlags::new().trim_to_budget(),
            num_bytes_to_trim: 0x2000,
        };
        assert_eq!(registry.notify_all(notification), 1);
        assert_eq!(counter.calls.load(Ordering::Relaxed), 1);
        assert_eq!(counter.last_bytes.load(Ordering::Relaxed), 0x2000);
    }

    #[test]
    fn dropped_handler_is_skipped() {
        let registry = TrimCallbackRegistry::new();
        let counter = Arc::new(Counter::default());
        registry.register(Arc::downgrade(&counter) as Weak<dyn TrimHandler>);
        drop(counter);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.notify_all(TrimNotification::default()), 0);
    }

    #[test]
    fn unregister_removes_entry() {
        let registry = TrimCallbackRegistry::new();
        let counter = Arc::new(Counter::default());
        let handle = registry.register(Arc::downgrade(&counter) as Weak<dyn TrimHandler>);
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(handle));
        assert!(!registry.unregister(handle));
        assert!(registry.is_empty());
        assert_eq!(registry.notify_all(TrimNotification::default()), 0);
    }
}
