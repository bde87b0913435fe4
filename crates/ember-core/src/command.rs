//! # Submission Descriptors
//!
//! The data handed to the dispatch collaborator for each submission.

use crate::types::{ByteSize, GpuAddr, TaskCount};

// =============================================================================
// BUFFER REGION
// =============================================================================

/// A contiguous region inside an engine-owned buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    /// GPU address of the region start
    pub gpu_addr: GpuAddr,
    /// Region length
    pub size: ByteSize,
}

impl BufferRegion {
    /// Create a new buffer region
    pub const fn new(gpu_addr: GpuAddr, size: ByteSize) -> Self {
        Self { gpu_addr, size }
    }

    /// Check if the region is empty
    pub const fn is_empty(&self) -> bool {
        self.size.as_bytes() == 0
    }
}

// =============================================================================
// SUBMIT FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Per-submission behavior flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SubmitFlags: u32 {
        /// Low-latency submission (skip aggregation heuristics downstream)
        const LOW_LATENCY = 1 << 0;
        /// Submission carries only internal state programming
        const INTERNAL = 1 << 1;
    }
}

// =============================================================================
// SUBMIT BATCH
// =============================================================================

/// One unit of work handed to the dispatch collaborator
///
/// The engine is agnostic to the byte contents of `region`; command encoding
/// belongs to the per-generation backend.
#[derive(Debug, Clone, Copy)]
pub struct SubmitBatch {
    /// Commands recorded for this submission
    pub region: BufferRegion,
    /// Task count assigned to this submission
    pub task_count: TaskCount,
    /// Where the hardware writes `task_count` on completion
    pub fence_addr: GpuAddr,
    /// Behavior flags
    pub flags: SubmitFlags,
}
