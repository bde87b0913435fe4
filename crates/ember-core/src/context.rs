//! # Execution Context
//!
//! An independent hardware submission queue with its own monotonic task
//! counter and hardware-writable fence location.
//!
//! The fence is a 32-bit counter in a CPU-visible page; the hardware (or a
//! null/software backend) writes the latest completed task count there.
//! Reading it is a plain volatile load and needs no lock, which keeps
//! completion polling lock-free.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use crate::types::{Handle, TaskCount};

// =============================================================================
// CONTEXT ID
// =============================================================================

/// Marker for context handles
pub struct ContextMarker;

/// Execution context identifier
pub type ContextId = Handle<ContextMarker>;

// =============================================================================
// EXECUTION CONTEXT
// =============================================================================

/// Per-queue submission state
///
/// Task counters are strictly increasing and never reset while the context
/// is alive. Contexts are created once at engine initialization and live for
/// the engine's lifetime.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Context identifier
    id: ContextId,
    /// Last assigned task count
    task_count: AtomicU32,
    /// Last task count handed to the dispatch collaborator
    latest_flushed: AtomicU32,
    /// Hardware-written fence location (null until `init_fence`)
    fence_ptr: AtomicPtr<u32>,
    /// Single-initialization guard for the fence
    fence_initialized: AtomicBool,
}

impl ExecutionContext {
    /// Create a new execution context
    pub fn new(id: ContextId) -> Self {
        Self {
            id,
            task_count: AtomicU32::new(0),
            latest_flushed: AtomicU32::new(0),
            fence_ptr: AtomicPtr::new(core::ptr::null_mut()),
            fence_initialized: AtomicBool::new(false),
        }
    }

    /// Get the context ID
    #[inline]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Install the hardware fence location and write the initial value
    ///
    /// # Panics
    ///
    /// Panics if called twice. The fence is a singleton resource with a
    /// single-initialization lifecycle; re-initialization is a programming
    /// contract violation.
    ///
    /// # Safety
    ///
    /// `ptr` must point to CPU-visible memory that stays valid until
    /// engine teardown.
    pub unsafe fn init_fence(&self, ptr: *mut u32) {
        let was = self.fence_initialized.swap(true, Ordering::SeqCst);
        assert!(!was, "completion fence initialized twice");

        // SAFETY: caller guarantees validity for the engine lifetime
        unsafe { ptr.write_volatile(0) };
        self.fence_ptr.store(ptr, Ordering::Release);
        log::debug!("context {:?}: completion fence installed", self.id);
    }

    /// Drop the fence mapping at teardown
    pub fn clear_fence(&self) {
        self.fence_ptr
            .store(core::ptr::null_mut(), Ordering::Release);
    }

    /// Last completed task count, as written by the hardware
    ///
    /// Plain volatile read; lock-free by design. Returns 0 before the fence
    /// is initialized.
    #[inline]
    pub fn completed(&self) -> TaskCount {
        let ptr = self.fence_ptr.load(Ordering::Acquire);
        if ptr.is_null() {
            return 0;
        }
        // SAFETY: non-null pointer was installed via init_fence and outlives
        // the context per its contract
        unsafe { ptr.read_volatile() }
    }

    /// Write a completed value to the fence location
    ///
    /// For null-hardware and software dispatch backends; real hardware
    /// writes the fence itself.
    pub fn signal_completion(&self, value: TaskCount) {
        let ptr = self.fence_ptr.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: see `completed`
            unsafe { ptr.write_volatile(value) };
        }
    }

    /// Last assigned task count
    #[inline]
    pub fn task_count(&self) -> TaskCount {
        self.task_count.load(Ordering::Acquire)
    }

    /// Task count the next submission will be assigned
    #[inline]
    pub fn next_task_count(&self) -> TaskCount {
        self.task_count() + 1
    }

    /// Assign the next task count (returns the assigned value)
    pub fn advance_task_count(&self) -> TaskCount {
        self.task_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Last flushed task count
    #[inline]
    pub fn latest_flushed(&self) -> TaskCount {
        self.latest_flushed.load(Ordering::Acquire)
    }

    /// Record that work up to `task` has been handed to the dispatcher
    pub fn update_latest_flushed(&self, task: TaskCount) {
        // Strictly forward; flush never regresses
        let prev = self.latest_flushed.load(Ordering::Acquire);
        if task > prev {
            self.latest_flushed.store(task, Ordering::Release);
        }
    }

    /// Check whether a task count has completed on hardware
    #[inline]
    pub fn is_complete(&self, task: TaskCount) -> bool {
        self.completed() >= task
    }
}

// SAFETY: fence pointer is only written once and read via volatile loads
unsafe impl Send for ExecutionContext {}
unsafe impl Sync for ExecutionContext {}

// =============================================================================
// TESTS
// =============================================================================
