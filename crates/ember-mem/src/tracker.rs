//! # Residency Tracker
//!
//! Per-(allocation, context) residency state and the two pass lists the
//! submission path drains: the residency pack handed to the kernel with each
//! flush, and the eviction queue processed afterwards.
//!
//! Eviction is two-step. The first time an allocation leaves residency it is
//! only marked evictable; it must survive one more residency cycle before a
//! later departure actually queues it for eviction. Short-lived ping-pong
//! between resident and non-resident therefore never thrashes the kernel
//! eviction path.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use ember_core::{Allocation, AllocationId, BufferRegion, ByteSize, TaskCount};

// =============================================================================
// RESIDENCY RECORD
// =============================================================================

/// One entry of the residency pack or eviction queue
#[derive(Debug, Clone, Copy)]
pub struct ResidencyRecord {
    /// The allocation concerned
    pub id: AllocationId,
    /// Its device address range
    pub region: BufferRegion,
}

// =============================================================================
// TRACKER
// =============================================================================

#[derive(Debug)]
struct Entry {
    region: BufferRegion,
    resident: bool,
    evictable: bool,
    /// Highest submission task count this entry was packed for
    watermark: TaskCount,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<AllocationId, Entry>,
    pack: Vec<ResidencyRecord>,
    eviction_queue: Vec<ResidencyRecord>,
    memory_in_use: u64,
}

/// Residency state for every allocation a context has referenced
#[derive(Debug)]
pub struct ResidencyTracker {
    state: spin::Mutex<State>,
}

impl ResidencyTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            state: spin::Mutex::new(State::default()),
        }
    }

    /// Mark an allocation resident for the submission with task count
    /// `submission`
    ///
    /// Appends to the residency pack at most once per submission: a repeat
    /// call with the same task count only confirms the existing record. The
    /// watermark never regresses.
    pub fn make_resident(&self, allocation: &Allocation, submission: TaskCount) {
        let mut state = self.state.lock();
        let region = BufferRegion {
            gpu_addr: allocation.gpu_addr(),
            size: allocation.size(),
        };
        let entry = state.entries.entry(allocation.id()).or_insert(Entry {
            region,
            resident: false,
            evictable: false,
            watermark: 0,
        });
        entry.region = region;

        let newly_packed = entry.watermark < submission;
        if newly_packed {
            entry.watermark = submission;
        }
        let newly_resident = !entry.resident;
        if newly_resident {
            entry.resident = true;
        }
        if newly_packed {
            state.pack.push(ResidencyRecord {
                id: allocation.id(),
                region,
            });
        }
        if newly_resident {
            state.memory_in_use += region.size.as_bytes();
        }
    }

    /// Take an allocation out of residency
    ///
    /// Returns whether it was resident. A first departure only marks the
    /// entry evictable; a departure of an already-evictable entry queues it
    /// for eviction. Calling on a non-resident allocation is a no-op.
    pub fn make_non_resident(&self, id: AllocationId) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            return false;
        };
        if !entry.resident {
            return false;
        }
        entry.resident = false;
        let record = ResidencyRecord {
            id,
            region: entry.region,
        };
        let queue_eviction = entry.evictable;
        entry.evictable = true;
        let size = entry.region.size.as_bytes();
        if queue_eviction {
            log::trace!("tracker: queueing eviction of {:?}", id);
            state.eviction_queue.push(record);
        }
        state.memory_in_use = state.memory_in_use.saturating_sub(size);
        true
    }

    /// Check residency
    pub fn is_resident(&self, id: AllocationId) -> bool {
        self.state
            .lock()
            .entries
            .get(&id)
            .is_some_and(|e| e.resident)
    }

    /// Highest submission an allocation was packed for
    pub fn watermark(&self, id: AllocationId) -> Option<TaskCount> {
        self.state.lock().entries.get(&id).map(|e| e.watermark)
    }

    /// Drain the residency pack for the flush in progress
    pub fn take_residency_pack(&self) -> Vec<ResidencyRecord> {
        core::mem::take(&mut self.state.lock().pack)
    }

    /// Drain the pending eviction queue
    pub fn take_eviction_queue(&self) -> Vec<ResidencyRecord> {
        core::mem::take(&mut self.state.lock().eviction_queue)
    }

    /// Bytes currently resident
    pub fn memory_in_use(&self) -> ByteSize {
        ByteSize::from_bytes(self.state.lock().memory_in_use)
    }

    /// Forget an allocation entirely (it was freed)
    pub fn remove(&self, id: AllocationId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.remove(&id) {
            if entry.resident {
                state.memory_in_use = state
                    .memory_in_use
                    .saturating_sub(entry.region.size.as_bytes());
            }
        }
    }

    /// Number of tracked allocations
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check whether the tracker is empty
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }
}

impl Default for ResidencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
