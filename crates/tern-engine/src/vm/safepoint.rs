//! Safepoint infrastructure for stop-the-world operations
//!
//! Reload commits and heap rewrites run inside a safepoint operation: every
//! mutator thread is quiesced at a known point and no allocation or GC runs.
//! Within such an operation, a no-safepoint scope asserts that nothing on the
//! current path can re-enter a safepoint.
//!
//! Polling is cooperative: the interpreter calls [`SafepointCoordinator::poll`]
//! at loop back-edges, calls, and allocations. The fast path is a single
//! atomic load.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Reasons for requesting a stop-the-world pause
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Garbage collection
    GarbageCollection,
    /// Live program reload
    Reload,
    /// Debugger inspection
    Debug,
}

/// Coordinates stop-the-world pauses across mutator threads
#[derive(Debug)]
pub struct SafepointCoordinator {
    /// Some pause is pending
    pause_pending: AtomicBool,
    /// Current pause reason
    current_reason: Mutex<Option<StopReason>>,
    /// Depth of active no-safepoint scopes
    no_safepoint_depth: AtomicUsize,
}

impl SafepointCoordinator {
    /// Create a coordinator
    pub fn new() -> Self {
        Self {
            pause_pending: AtomicBool::new(false),
            current_reason: Mutex::new(None),
            no_safepoint_depth: AtomicUsize::new(0),
        }
    }

    /// Fast check called from interpreter hot paths
    #[inline(always)]
    pub fn poll(&self) -> bool {
        self.pause_pending.load(Ordering::Acquire)
    }

    /// Request a stop-the-world pause for `reason`
    ///
    /// Panics if another pause is already active or a no-safepoint scope is
    /// open on this thread's path.
    pub fn request_stop(&self, reason: StopReason) {
        assert_eq!(
            self.no_safepoint_depth.load(Ordering::Acquire),
            0,
            "cannot enter a safepoint inside a no-safepoint scope"
        );
        let mut current = self.current_reason.lock();
        if current.is_some() {
            panic!("cannot request a stop-the-world pause while another is active");
        }
        *current = Some(reason);
        self.pause_pending.store(true, Ordering::Release);
    }

    /// Resume from a stop-the-world pause
    pub fn resume(&self) {
        self.pause_pending.store(false, Ordering::Release);
        *self.current_reason.lock() = None;
    }

    /// Current pause reason, if a pause is active
    pub fn current_reason(&self) -> Option<StopReason> {
        *self.current_reason.lock()
    }

    /// Whether any pause is pending
    pub fn is_pause_pending(&self) -> bool {
        self.poll()
    }

    fn begin_no_safepoint(&self) {
        self.no_safepoint_depth.fetch_add(1, Ordering::AcqRel);
    }

    fn end_no_safepoint(&self) {
        let prev = self.no_safepoint_depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }
}

impl Default for SafepointCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII scope for a safepoint operation: mutators are stopped for the
/// lifetime of this scope
#[must_use]
pub struct SafepointOperationScope<'a> {
    coordinator: &'a SafepointCoordinator,
}

impl<'a> SafepointOperationScope<'a> {
    /// Stop the world for `reason`
    pub fn new(coordinator: &'a SafepointCoordinator, reason: StopReason) -> Self {
        coordinator.request_stop(reason);
        Self { coordinator }
    }
}

impl Drop for SafepointOperationScope<'_> {
    fn drop(&mut self) {
        self.coordinator.resume();
    }
}

/// RAII scope asserting that no safepoint can be entered while it is alive
#[must_use]
pub struct NoSafepointScope<'a> {
    coordinator: &'a SafepointCoordinator,
}

impl<'a> NoSafepointScope<'a> {
    /// Open a no-safepoint scope
    pub fn new(coordinator: &'a SafepointCoordinator) -> Self {
        coordinator.begin_no_safepoint();
        Self { coordinator }
    }
}

impl Drop for NoSafepointScope<'_> {
    fn drop(&mut self) {
        self.coordinator.end_no_safepoint();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_pending_pause_initially() {
        let coord = SafepointCoordinator::new();
        assert!(!coord.is_pause_pending());
        assert_eq!(coord.current_reason(), None);
    }

    #[test]
    fn test_operation_scope_sets_and_clears_reason() {
        let coord = SafepointCoordinator::new();
        {
            let _scope = SafepointOperationScope::new(&coord, StopReason::Reload);
            assert!(coord.is_pause_pending());
            assert_eq!(coord.current_reason(), Some(StopReason::Reload));
        }
        assert!(!coord.is_pause_pending());
        assert_eq!(coord.current_reason(), None);
    }

    #[test]
    #[should_panic(expected = "while another is active")]
    fn test_nested_operations_rejected() {
        let coord = SafepointCoordinator::new();
        let _outer = SafepointOperationScope::new(&coord, StopReason::Reload);
        let _inner = SafepointOperationScope::new(&coord, StopReason::GarbageCollection);
    }

    #[test]
    #[should_panic(expected = "no-safepoint scope")]
    fn test_stop_inside_no_safepoint_scope_rejected() {
        let coord = SafepointCoordinator::new();
        let _guard = NoSafepointScope::new(&coord);
        coord.request_stop(StopReason::GarbageCollection);
    }

    #[test]
    fn test_no_safepoint_scope_nests() {
        let coord = SafepointCoordinator::new();
        {
            let _a = NoSafepointScope::new(&coord);
            let _b = NoSafepointScope::new(&coord);
        }
        // Depth unwound; safepoints allowed again.
        coord.request_stop(StopReason::Debug);
        coord.resume();
    }
}
