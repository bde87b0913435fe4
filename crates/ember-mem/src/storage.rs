//! # Allocation Lifecycle Store
//!
//! Two typed deferred-reclamation lists keyed by completion thresholds.
//!
//! Temporary entries back one-shot staging copies and are freed once the
//! submission after their creation completes. Reusable entries are retired
//! backings (command buffers, heaps) that later growth requests may pick up
//! again instead of hitting the allocator.
//!
//! Removal from a list is gated strictly by the fence check; memory is never
//! handed out while hardware may still be using it. The unconditional drain
//! bypasses the check only on the teardown path.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ember_core::{
    Allocation, AllocationKind, ByteSize, ExecutionContext, MemoryOps, TaskCount, TASK_COUNT_ALL,
};

use crate::tracker::ResidencyTracker;

// =============================================================================
// LIST KIND
// =============================================================================

/// Which lifecycle list an allocation is stored on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// One-shot staging memory, freed after the next submission completes
    Temporary,
    /// Retired backing eligible for reuse by later growth requests
    Reusable,
}

// =============================================================================
// STORED ALLOCATION
// =============================================================================

/// A list entry: the owned allocation plus its completion threshold
#[derive(Debug)]
struct StoredAllocation {
    allocation: Allocation,
    free_after: TaskCount,
}

#[derive(Debug, Default)]
struct Lists {
    temporary: Vec<StoredAllocation>,
    reusable: Vec<StoredAllocation>,
}

impl Lists {
    fn list_mut(&mut self, kind: ListKind) -> &mut Vec<StoredAllocation> {
        match kind {
            ListKind::Temporary => &mut self.temporary,
            ListKind::Reusable => &mut self.reusable,
        }
    }
}

// =============================================================================
// ALLOCATION STORAGE
// =============================================================================

/// The allocation lifecycle store
///
/// Ownership transfers atomically at the `store_allocation` /
/// `obtain_reusable_allocation` boundaries, guarded by the store's own lock;
/// no allocation is ever concurrently writable by two owners.
pub struct AllocationStorage {
    ctx: Arc<ExecutionContext>,
    allocator: Arc<dyn MemoryOps>,
    tracker: Arc<ResidencyTracker>,
    lists: spin::Mutex<Lists>,
}

impl AllocationStorage {
    /// Create a new lifecycle store bound to a context, allocator, and
    /// residency tracker
    pub fn new(
        ctx: Arc<ExecutionContext>,
        allocator: Arc<dyn MemoryOps>,
        tracker: Arc<ResidencyTracker>,
    ) -> Self {
        Self {
            ctx,
            allocator,
            tracker,
            lists: spin::Mutex::new(Lists::default()),
        }
    }

    /// Store an allocation with the default completion threshold
    ///
    /// Temporary entries are tagged free-after the submission following the
    /// current task count; reusable entries stored through this path are
    /// tagged the same way (the next submission is the last that may
    /// reference a freshly retired backing).
    pub fn store_allocation(&self, allocation: Allocation, kind: ListKind) {
        let free_after = self.ctx.task_count() + 1;
        self.store_allocation_with_task_count(allocation, kind, free_after);
    }

    /// Store an allocation with an explicit completion threshold
    ///
    /// Ownership moves into the list, so the allocation's residency
    /// bookkeeping ends here; the tracker entry is dropped and a later
    /// reuse starts from a clean watermark.
    pub fn store_allocation_with_task_count(
        &self,
        allocation: Allocation,
        kind: ListKind,
        free_after: TaskCount,
    ) {
        log::trace!(
            "storage: store {:?} on {:?} list, free-after {}",
            allocation,
            kind,
            free_after
        );
        self.tracker.remove(allocation.id());
        let mut lists = self.lists.lock();
        lists.list_mut(kind).push(StoredAllocation {
            allocation,
            free_after,
        });
    }

    /// Take the first reusable allocation matching kind and size whose
    /// completion threshold the fence has already passed
    ///
    /// A miss is not an error; callers fall through to fresh allocation.
    pub fn obtain_reusable_allocation(
        &self,
        min_size: ByteSize,
        kind: AllocationKind,
    ) -> Option<Allocation> {
        let completed = self.ctx.completed();
        let mut lists = self.lists.lock();
        let pos = lists.reusable.iter().position(|entry| {
            entry.allocation.kind() == kind
                && entry.allocation.size() >= min_size
                && entry.free_after <= completed
        })?;
        let entry = lists.reusable.remove(pos);
        log::trace!(
            "storage: reuse hit {:?} (fence {} >= {})",
            entry.allocation,
            completed,
            entry.free_after
        );
        Some(entry.allocation)
    }

    /// Free every entry whose completion threshold is at or below
    /// `task_count`
    ///
    /// `TASK_COUNT_ALL` forces an unconditional drain regardless of
    /// completion state; callers must have awaited full pipeline drain
    /// first (teardown path).
    pub fn clean_allocation_list(&self, task_count: TaskCount, kind: ListKind) {
        let mut freed = Vec::new();
        {
            let mut lists = self.lists.lock();
            let list = lists.list_mut(kind);
            let mut i = 0;
            while i < list.len() {
                if list[i].free_after <= task_count {
                    freed.push(list.remove(i).allocation);
                } else {
                    i += 1;
                }
            }
        }
        if !freed.is_empty() {
            log::debug!(
                "storage: cleaning {} {:?} entries at task {}",
                freed.len(),
                kind,
                task_count
            );
        }
        // Free outside the list lock; the allocator must not observe it held
        for allocation in freed {
            self.allocator.free(allocation);
        }
    }

    /// Number of entries on a list
    pub fn len(&self, kind: ListKind) -> usize {
        let mut lists = self.lists.lock();
        lists.list_mut(kind).len()
    }

    /// Check whether both lists are empty
    pub fn is_empty(&self) -> bool {
        let lists = self.lists.lock();
        lists.temporary.is_empty() && lists.reusable.is_empty()
    }
}

impl Drop for AllocationStorage {
    fn drop(&mut self) {
        if !self.is_empty() {
            log::warn!(
                "storage: {} temporary / {} reusable entries alive at drop, draining",
                self.len(ListKind::Temporary),
                self.len(ListKind::Reusable)
            );
            self.clean_allocation_list(TASK_COUNT_ALL, ListKind::Temporary);
            self.clean_allocation_list(TASK_COUNT_ALL, ListKind::Reusable);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, TestAllocator};

    fn setup() -> (Arc<ExecutionContext>, Arc<TestAllocator>, AllocationStorage) {
        let ctx = test_context();
        let allocator = Arc::new(TestAllocator::new());
        let storage = AllocationStorage::new(
            ctx.clone(),
            allocator.clone(),
            Arc::new(ResidencyTracker::new()),
        );
        (ctx, allocator, storage)
    }

    #[test]
    fn test_reuse_gated_by_fence() {
        let (ctx, allocator, storage) = setup();
        let alloc = allocator
            .allocate(ByteSize::from_kib(64), AllocationKind::CommandBuffer)
            .unwrap();
        storage.store_allocation_with_task_count(alloc, ListKind::Reusable, 3);

        // fence at 0: entry must not be handed out
        assert!(storage
            .obtain_reusable_allocation(ByteSize::from_kib(4), AllocationKind::CommandBuffer)
            .is_none());

        ctx.signal_completion(2);
        assert!(storage
            .obtain_reusable_allocation(ByteSize::from_kib(4), AllocationKind::CommandBuffer)
            .is_none());

        ctx.signal_completion(3);
        let reused = storage
            .obtain_reusable_allocation(ByteSize::from_kib(4), AllocationKind::CommandBuffer)
            .expect("fence reached free-after");
        assert!(reused.size() >= ByteSize::from_kib(4));
        allocator.free(reused);
    }

    #[test]
    fn test_reuse_matches_kind_and_size() {
        let (ctx, allocator, storage) = setup();
        ctx.signal_completion(10);

        let small = allocator
            .allocate(ByteSize::from_kib(4), AllocationKind::LinearStream)
            .unwrap();
        storage.store_allocation_with_task_count(small, ListKind::Reusable, 1);

        // wrong kind
        assert!(storage
            .obtain_reusable_allocation(ByteSize::from_kib(4), AllocationKind::CommandBuffer)
            .is_none());
        // too small
        assert!(storage
            .obtain_reusable_allocation(ByteSize::from_kib(8), AllocationKind::LinearStream)
            .is_none());
        // match
        let hit = storage
            .obtain_reusable_allocation(ByteSize::from_kib(4), AllocationKind::LinearStream)
            .unwrap();
        allocator.free(hit);
    }

    #[test]
    fn test_clean_respects_threshold() {
        let (_ctx, allocator, storage) = setup();
        for free_after in [1, 2, 5] {
            let alloc = allocator
                .allocate(ByteSize::from_kib(4), AllocationKind::Staging)
                .unwrap();
            storage.store_allocation_with_task_count(alloc, ListKind::Temporary, free_after);
        }

        storage.clean_allocation_list(2, ListKind::Temporary);
        assert_eq!(storage.len(ListKind::Temporary), 1);
        assert_eq!(allocator.live_count(), 1);

        storage.clean_allocation_list(TASK_COUNT_ALL, ListKind::Temporary);
        assert_eq!(storage.len(ListKind::Temporary), 0);
        assert_eq!(allocator.live_count(), 0);
    }

    #[test]
    fn test_unconditional_drain_empties_both_lists() {
        let (_ctx, allocator, storage) = setup();
        let a = allocator
            .allocate(ByteSize::from_kib(4), AllocationKind::Staging)
            .unwrap();
        let b = allocator
            .allocate(ByteSize::from_kib(64), AllocationKind::CommandBuffer)
            .unwrap();
        storage.store_allocation(a, ListKind::Temporary);
        storage.store_allocation(b, ListKind::Reusable);

        storage.clean_allocation_list(TASK_COUNT_ALL, ListKind::Temporary);
        storage.clean_allocation_list(TASK_COUNT_ALL, ListKind::Reusable);
        assert!(storage.is_empty());
        // freed exactly once each
        assert_eq!(allocator.live_count(), 0);
    }

    #[test]
    fn test_store_forgets_residency_entry() {
        let ctx = test_context();
        let allocator = Arc::new(TestAllocator::new());
        let tracker = Arc::new(ResidencyTracker::new());
        let storage = AllocationStorage::new(ctx, allocator.clone(), tracker.clone());

        let alloc = allocator
            .allocate(ByteSize::from_kib(4), AllocationKind::CommandBuffer)
            .unwrap();
        let id = alloc.id();
        tracker.make_resident(&alloc, 1);

        storage.store_allocation(alloc, ListKind::Reusable);
        // the handle left the residency domain with its allocation
        assert!(tracker.watermark(id).is_none());
        assert_eq!(tracker.memory_in_use(), ByteSize::ZERO);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_temporary_threshold_is_next_task() {
        let (ctx, allocator, storage) = setup();
        // advance the counter to 4, so temporaries die after task 5
        for _ in 0..4 {
            ctx.advance_task_count();
        }
        let alloc = allocator
            .allocate(ByteSize::from_kib(4), AllocationKind::Staging)
            .unwrap();
        storage.store_allocation(alloc, ListKind::Temporary);

        storage.clean_allocation_list(4, ListKind::Temporary);
        assert_eq!(storage.len(ListKind::Temporary), 1);
        storage.clean_allocation_list(5, ListKind::Temporary);
        assert_eq!(storage.len(ListKind::Temporary), 0);
    }
}
