//! # EMBER Memory Lifecycle
//!
//! Deferred reclamation lists, linear heaps, completion tag pools, and
//! per-context residency tracking.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    EMBER Memory Lifecycle                       │
//! │                                                                 │
//! │  ┌──────────────────┐   ┌───────────────┐   ┌────────────────┐  │
//! │  │ AllocationStorage│   │    HeapSet    │   │    TagPool     │  │
//! │  │ (temporary +     │◄──│ (command      │   │ (timestamps,   │  │
//! │  │  reusable lists) │   │  stream + aux │   │  counters,     │  │
//! │  │                  │   │  linear heaps)│   │  sync fences)  │  │
//! │  └──────────────────┘   └───────────────┘   └────────────────┘  │
//! │            │                                                    │
//! │  ┌─────────┴──────────────────────────────────────────────────┐ │
//! │  │                    ResidencyTracker                        │ │
//! │  │     per-(allocation, context) residency and eviction       │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reclamation Design
//!
//! An allocation leaves a lifecycle list only once the owning context's
//! fence has reached its recorded free-after task count. The unconditional
//! drain (`TASK_COUNT_ALL`) bypasses the check and is reserved for the
//! teardown path, after the caller has awaited full pipeline drain.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod heap;
pub mod storage;
pub mod tagpool;
pub mod tracker;

// Re-exports
pub use heap::{HeapChunk, HeapKind, HeapSet, LinearHeap};
pub use storage::{AllocationStorage, ListKind};
pub use tagpool::{TagHandle, TagKind, TagPool, TagPoolConfig, TagState};
pub use tracker::{ResidencyRecord, ResidencyTracker};

// =============================================================================
// TEST SUPPORT
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use alloc::collections::BTreeMap;
    use alloc::sync::Arc;
    use core::alloc::Layout;
    use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use ember_core::{
        Allocation, AllocationFlags, AllocationId, AllocationKind, ByteSize, ContextId, Error,
        ExecutionContext, GpuAddr, MemoryOps, Result,
    };

    /// Host-memory-backed allocator used by the module tests
    pub struct TestAllocator {
        next_id: AtomicU64,
        live: spin::Mutex<BTreeMap<u64, u64>>,
        fail: AtomicBool,
    }

    impl TestAllocator {
        pub fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                live: spin::Mutex::new(BTreeMap::new()),
                fail: AtomicBool::new(false),
            }
        }

        pub fn live_count(&self) -> usize {
            self.live.lock().len()
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    impl MemoryOps for TestAllocator {
        fn allocate(&self, size: ByteSize, kind: AllocationKind) -> Result<Allocation> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::AllocationFailed);
            }
            let bytes = size.as_bytes().max(1) as usize;
            let layout = Layout::from_size_align(bytes, 4096).unwrap();
            // SAFETY: layout has non-zero size and valid alignment
            let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(Error::OutOfMemory);
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.live.lock().insert(id, size.as_bytes());
            Ok(Allocation::new(
                AllocationId::new(id),
                GpuAddr::new(ptr as u64),
                ptr,
                size,
                kind,
                AllocationFlags::CPU_VISIBLE,
            ))
        }

        fn free(&self, allocation: Allocation) {
            let removed = self.live.lock().remove(&allocation.id().id());
            assert!(removed.is_some(), "double free of {:?}", allocation);
            if let Some(ptr) = allocation.cpu_ptr() {
                let bytes = allocation.size().as_bytes().max(1) as usize;
                let layout = Layout::from_size_align(bytes, 4096).unwrap();
                // SAFETY: pointer and layout mirror the allocate call
                unsafe { alloc::alloc::dealloc(ptr, layout) };
            }
        }
    }

    /// Fresh execution context with a leaked fence word
    pub fn test_context() -> Arc<ExecutionContext> {
        let ctx = Arc::new(ExecutionContext::new(ContextId::new(1)));
        let fence = std::boxed::Box::leak(std::boxed::Box::new(0u32));
        // SAFETY: leaked box lives forever
        unsafe { ctx.init_fence(fence) };
        ctx
    }
}
