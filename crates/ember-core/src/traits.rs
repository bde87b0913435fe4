//! # EMBER Core Traits
//!
//! Collaborator seams for the submission engine.
//!
//! The engine coordinates CPU-side producers against asynchronous hardware
//! execution through three collaborators:
//!
//! ```text
//! SubmissionEngine
//!    │
//!    ├── MemoryOps    (allocate / free device memory)
//!    ├── DispatchOps  (hand batches to hardware, coherence)
//!    └── Clock        (wall-clock timeout measurement)
//! ```

use crate::allocation::{Allocation, AllocationKind};
use crate::command::{BufferRegion, SubmitBatch};
use crate::error::Result;
use crate::types::{ByteSize, TaskCount};

// =============================================================================
// MEMORY ALLOCATOR COLLABORATOR
// =============================================================================

/// Device memory allocator collaborator
///
/// Failures are non-throwing: `allocate` reports them as
/// [`Error::AllocationFailed`](crate::Error::AllocationFailed) and the
/// engine falls back to reuse-pool lookups or propagates the outcome upward
/// without internal retry.
pub trait MemoryOps: Send + Sync {
    /// Allocate device-visible memory
    fn allocate(&self, size: ByteSize, kind: AllocationKind) -> Result<Allocation>;

    /// Return an allocation to the allocator
    fn free(&self, allocation: Allocation);
}

// =============================================================================
// DISPATCH COLLABORATOR
// =============================================================================

/// Execution/dispatch collaborator
///
/// Owns the OS- and generation-specific submission path. The hardware side
/// writes the completed task count to the context's fence location.
pub trait DispatchOps: Send + Sync {
    /// Hand a batch to the hardware queue
    fn submit(&self, batch: &SubmitBatch) -> Result<()>;

    /// Make a region coherent before eviction
    ///
    /// Default is a no-op; backends with non-coherent mappings override.
    fn make_coherent(&self, region: BufferRegion) {
        let _ = region;
    }
}

// =============================================================================
// TRACE HOOK
// =============================================================================

/// Optional external completion observer
///
/// Notified after a successful completion wait; used by profiling and
/// instrumentation tooling.
pub trait TraceHook: Send + Sync {
    /// A wait for `task` observed completion
    fn task_completed(&self, task: TaskCount);
}

// =============================================================================
// CLOCK
// =============================================================================

/// Monotonic wall-clock source for wait timeouts
///
/// Completion is signaled by a hardware memory write, not a wakeable event,
/// so waiting is a cooperative spin with the elapsed time measured per
/// iteration through this trait.
pub trait Clock: Send + Sync {
    /// Current monotonic time in microseconds
    fn now_micros(&self) -> u64;
}

/// Host clock backed by `std::time::Instant`
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct StdClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    /// Create a new host clock
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Clock for StdClock {
    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}
