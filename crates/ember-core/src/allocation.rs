//! # Allocation Handle
//!
//! The opaque handle over a region of device-visible memory.
//!
//! Allocations are owned by exactly one container at any time: a heap
//! backing, a lifecycle list, a tag-pool block, or the caller. Transfer
//! between containers is a move, never a duplicated live reference, which
//! rules out double-free and use-after-reclaim by construction. `Allocation`
//! is therefore deliberately not `Clone`.

use core::fmt;

use crate::types::{ByteSize, GpuAddr, Handle};

// =============================================================================
// ALLOCATION ID
// =============================================================================

/// Marker for allocation handles
pub struct AllocationMarker;

/// Unique identifier assigned by the allocator collaborator
pub type AllocationId = Handle<AllocationMarker>;

// =============================================================================
// ALLOCATION KIND
// =============================================================================

/// Type tag describing what an allocation backs
///
/// Reuse-pool lookups only match entries of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AllocationKind {
    /// Primary command buffer backing
    CommandBuffer,
    /// Auxiliary linear heap backing (surface/dynamic state)
    LinearStream,
    /// Internal heap backing (indirect object, instruction)
    InternalHeap,
    /// Tag pool block
    TagBuffer,
    /// Temporary copy-staging memory
    Staging,
    /// Completion fence page
    Fence,
}

// =============================================================================
// ALLOCATION FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Allocation property flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocationFlags: u32 {
        /// CPU accessible (has a valid CPU mapping)
        const CPU_VISIBLE = 1 << 0;
        /// Device local memory
        const DEVICE_LOCAL = 1 << 1;
        /// Coherent (no explicit flush needed)
        const COHERENT = 1 << 2;
        /// Write-combined mapping
        const WRITE_COMBINE = 1 << 3;
    }
}

// =============================================================================
// ALLOCATION
// =============================================================================

/// Opaque handle over a region of device-visible memory
///
/// Produced by the allocator collaborator and destroyed by returning it to
/// the same collaborator, either after fence-gated reclamation or during the
/// unconditional drain at engine teardown.
pub struct Allocation {
    id: AllocationId,
    gpu_addr: GpuAddr,
    cpu_ptr: *mut u8,
    size: ByteSize,
    kind: AllocationKind,
    flags: AllocationFlags,
}

impl Allocation {
    /// Create a new allocation handle
    ///
    /// Called by allocator collaborators only. `cpu_ptr` may be null for
    /// allocations without a CPU mapping.
    pub const fn new(
        id: AllocationId,
        gpu_addr: GpuAddr,
        cpu_ptr: *mut u8,
        size: ByteSize,
        kind: AllocationKind,
        flags: AllocationFlags,
    ) -> Self {
        Self {
            id,
            gpu_addr,
            cpu_ptr,
            size,
            kind,
            flags,
        }
    }

    /// Get the allocation ID
    #[inline]
    pub const fn id(&self) -> AllocationId {
        self.id
    }

    /// Get the GPU address
    #[inline]
    pub const fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Get the CPU mapping, if any
    #[inline]
    pub fn cpu_ptr(&self) -> Option<*mut u8> {
        if self.cpu_ptr.is_null() {
            None
        } else {
            Some(self.cpu_ptr)
        }
    }

    /// Get the size
    #[inline]
    pub const fn size(&self) -> ByteSize {
        self.size
    }

    /// Get the kind tag
    #[inline]
    pub const fn kind(&self) -> AllocationKind {
        self.kind
    }

    /// Get the property flags
    #[inline]
    pub const fn flags(&self) -> AllocationFlags {
        self.flags
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Allocation(id=0x{:x}, {:?}, {} @ {})",
            self.id.id(),
            self.kind,
            self.size,
            self.gpu_addr
        )
    }
}

// SAFETY: the CPU pointer is only dereferenced by the single owning
// container; ownership transfer is a move.
unsafe impl Send for Allocation {}

static_assertions::assert_impl_all!(AllocationId: Send, Sync, Copy);
static_assertions::assert_impl_all!(AllocationKind: Send, Sync, Copy);
