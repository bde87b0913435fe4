//! # Linear Heaps
//!
//! The primary command stream and the auxiliary state heaps.
//!
//! Each heap is a linear cursor over one backing allocation. When a request
//! does not fit, the current backing is retired to the reusable list tagged
//! with the *next* task count (so it survives the in-flight submission) and
//! a replacement is obtained, reuse-first. Growth invalidates the previous
//! base address; callers must not hold pointers into a heap across a growth
//! call.

use ember_core::{
    Allocation, AllocationKind, ByteSize, EngineCaps, Error, GpuAddr, MemoryOps, Result, TaskCount,
};

use crate::storage::{AllocationStorage, ListKind};

// =============================================================================
// HEAP KIND
// =============================================================================

/// Auxiliary heap type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Surface state (capped below a fixed ceiling)
    SurfaceState,
    /// Dynamic state
    DynamicState,
    /// Indirect object
    IndirectObject,
    /// Instruction
    Instruction,
}

impl HeapKind {
    /// Number of auxiliary heap types
    pub const COUNT: usize = 4;

    /// All heap kinds, in slot order
    pub const ALL: [HeapKind; Self::COUNT] = [
        HeapKind::SurfaceState,
        HeapKind::DynamicState,
        HeapKind::IndirectObject,
        HeapKind::Instruction,
    ];

    /// Slot index for this kind
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            HeapKind::SurfaceState => 0,
            HeapKind::DynamicState => 1,
            HeapKind::IndirectObject => 2,
            HeapKind::Instruction => 3,
        }
    }

    /// Allocation kind used for this heap's backing
    ///
    /// Indirect-object and instruction heaps live in the internal heap
    /// aperture; the state heaps are plain linear streams.
    #[inline]
    pub const fn allocation_kind(self) -> AllocationKind {
        match self {
            HeapKind::IndirectObject | HeapKind::Instruction => AllocationKind::InternalHeap,
            _ => AllocationKind::LinearStream,
        }
    }
}

// =============================================================================
// HEAP CHUNK
// =============================================================================

/// A chunk carved out of a linear heap
#[derive(Debug, Clone, Copy)]
pub struct HeapChunk {
    /// GPU address of the chunk
    pub gpu_addr: GpuAddr,
    /// CPU pointer to the chunk (null if the backing has no mapping)
    pub cpu_ptr: *mut u8,
    /// Offset of the chunk from the heap base
    pub offset: u64,
}

// =============================================================================
// LINEAR HEAP
// =============================================================================

/// Linear cursor over one backing allocation
#[derive(Debug)]
pub struct LinearHeap {
    backing: Option<Allocation>,
    capacity: u64,
    used: u64,
}

impl LinearHeap {
    /// Create an empty heap with no backing
    pub const fn new() -> Self {
        Self {
            backing: None,
            capacity: 0,
            used: 0,
        }
    }

    /// Check whether the heap has a backing allocation
    #[inline]
    pub fn has_backing(&self) -> bool {
        self.backing.is_some()
    }

    /// Usable capacity
    #[inline]
    pub fn capacity(&self) -> ByteSize {
        ByteSize::from_bytes(self.capacity)
    }

    /// Bytes consumed so far
    #[inline]
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Remaining space
    #[inline]
    pub fn available_space(&self) -> ByteSize {
        ByteSize::from_bytes(self.capacity - self.used)
    }

    /// GPU address of the heap base
    pub fn gpu_base(&self) -> GpuAddr {
        self.backing
            .as_ref()
            .map(|a| a.gpu_addr())
            .unwrap_or(GpuAddr::null())
    }

    /// Backing allocation, if present
    pub fn backing(&self) -> Option<&Allocation> {
        self.backing.as_ref()
    }

    /// Carve a chunk and advance the cursor
    pub fn get_space(&mut self, size: ByteSize) -> Result<HeapChunk> {
        let backing = self
            .backing
            .as_ref()
            .ok_or(Error::CommandBufferUnavailable)?;
        if size.as_bytes() > self.capacity - self.used {
            return Err(Error::HeapOverflow);
        }
        let offset = self.used;
        self.used += size.as_bytes();
        let cpu_ptr = backing
            .cpu_ptr()
            // SAFETY: offset < capacity <= backing size
            .map(|p| unsafe { p.add(offset as usize) })
            .unwrap_or(core::ptr::null_mut());
        Ok(HeapChunk {
            gpu_addr: backing.gpu_addr().offset(offset),
            cpu_ptr,
            offset,
        })
    }

    /// Round the cursor up to an alignment boundary
    pub fn align_used(&mut self, alignment: u64) {
        let mask = alignment - 1;
        self.used = ((self.used + mask) & !mask).min(self.capacity);
    }

    /// Install a new backing, returning the old one
    ///
    /// Resets the cursor; any previously handed out chunk is invalidated.
    pub fn replace_backing(
        &mut self,
        allocation: Allocation,
        usable_capacity: u64,
    ) -> Option<Allocation> {
        debug_assert!(usable_capacity <= allocation.size().as_bytes());
        let old = self.backing.replace(allocation);
        self.capacity = usable_capacity;
        self.used = 0;
        old
    }

    /// Remove the backing, leaving the heap empty
    pub fn take_backing(&mut self) -> Option<Allocation> {
        self.capacity = 0;
        self.used = 0;
        self.backing.take()
    }
}

// =============================================================================
// HEAP SET
// =============================================================================

/// The primary command stream plus one linear heap per auxiliary type
#[derive(Debug)]
pub struct HeapSet {
    caps: EngineCaps,
    command_stream: LinearHeap,
    heaps: [LinearHeap; HeapKind::COUNT],
}

impl HeapSet {
    /// Create an empty heap set
    pub fn new(caps: EngineCaps) -> Self {
        Self {
            caps,
            command_stream: LinearHeap::new(),
            heaps: [
                LinearHeap::new(),
                LinearHeap::new(),
                LinearHeap::new(),
                LinearHeap::new(),
            ],
        }
    }

    /// Borrow the primary command stream without growing it
    pub fn command_stream(&self) -> &LinearHeap {
        &self.command_stream
    }

    /// Borrow an auxiliary heap without growing it
    pub fn heap(&self, kind: HeapKind) -> &LinearHeap {
        &self.heaps[kind.index()]
    }

    /// Get the primary command stream with at least `min_required` bytes
    /// free
    ///
    /// Growth pads the request with a cache line for the end-of-buffer
    /// marker plus the hardware overfetch pad, rounds up to large-page
    /// granularity, and retires the old backing reusable tagged with
    /// `retire_after` (the next task count).
    pub fn get_command_stream(
        &mut self,
        min_required: ByteSize,
        storage: &AllocationStorage,
        allocator: &dyn MemoryOps,
        retire_after: TaskCount,
    ) -> Result<&mut LinearHeap> {
        if self.command_stream.available_space() < min_required {
            let pad = self.caps.cache_line_size + self.caps.overfetch_size;
            let total = ByteSize::from_bytes(min_required.as_bytes() + pad)
                .align_up(self.caps.large_page_size);

            let kind = AllocationKind::CommandBuffer;
            let allocation = match storage.obtain_reusable_allocation(total, kind) {
                Some(allocation) => allocation,
                None => allocator.allocate(total, kind)?,
            };

            let usable = allocation.size().as_bytes() - pad;
            log::debug!(
                "heap: command stream grows to {:?} (usable {} bytes)",
                allocation.size(),
                usable
            );
            if let Some(old) = self.command_stream.replace_backing(allocation, usable) {
                storage.store_allocation_with_task_count(old, ListKind::Reusable, retire_after);
            }
        }
        Ok(&mut self.command_stream)
    }

    /// Get an auxiliary heap with at least `min_required` bytes free
    ///
    /// Sized to `align_up(max(default, min_required), page)`; the
    /// surface-state heap's capacity is clamped to its ceiling minus one
    /// page after sizing, guaranteeing prefetch headroom.
    pub fn get_heap(
        &mut self,
        kind: HeapKind,
        min_required: ByteSize,
        storage: &AllocationStorage,
        allocator: &dyn MemoryOps,
        retire_after: TaskCount,
    ) -> Result<&mut LinearHeap> {
        let heap = &mut self.heaps[kind.index()];

        if heap.has_backing() && heap.available_space() < min_required {
            if let Some(old) = heap.take_backing() {
                storage.store_allocation_with_task_count(old, ListKind::Reusable, retire_after);
            }
        }

        if !heap.has_backing() {
            let final_size = self
                .caps
                .default_heap_size
                .max(min_required)
                .align_up(self.caps.page_size);
            let alloc_kind = kind.allocation_kind();

            let allocation = match storage.obtain_reusable_allocation(final_size, alloc_kind) {
                Some(allocation) => allocation,
                None => allocator.allocate(final_size, alloc_kind)?,
            };

            let mut capacity = allocation.size().as_bytes();
            if kind == HeapKind::SurfaceState {
                capacity = capacity.min(self.caps.surface_heap_max_usable().as_bytes());
            }
            log::debug!("heap: {:?} backed with {} usable bytes", kind, capacity);
            heap.replace_backing(allocation, capacity);
        }

        Ok(&mut self.heaps[kind.index()])
    }

    /// Return a heap's backing to the reusable list without growing it
    ///
    /// The heap slot stays allocated; the next `get_heap` call re-backs it.
    pub fn release_heap(
        &mut self,
        kind: HeapKind,
        storage: &AllocationStorage,
        retire_after: TaskCount,
    ) {
        if let Some(old) = self.heaps[kind.index()].take_backing() {
            storage.store_allocation_with_task_count(old, ListKind::Reusable, retire_after);
        }
    }

    /// Free every backing directly (teardown path)
    pub fn teardown(&mut self, allocator: &dyn MemoryOps) {
        if let Some(backing) = self.command_stream.take_backing() {
            allocator.free(backing);
        }
        for heap in &mut self.heaps {
            if let Some(backing) = heap.take_backing() {
                allocator.free(backing);
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
