//! # Completion Tag Pool
//!
//! Fixed-stride device words for timestamps, counters, and fence targets.
//!
//! Tags are carved out of block allocations and recycled through the same
//! fence discipline as everything else: a released tag stays unavailable
//! until the owning context's fence passes its recorded task count, because
//! in-flight hardware may still write to it.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ember_core::{
    Allocation, AllocationKind, ByteSize, Error, ExecutionContext, GpuAddr, MemoryOps, Result,
    TaskCount,
};

// =============================================================================
// TAG KIND
// =============================================================================

/// What the tag word is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TagKind {
    /// Hardware timestamp write target
    Timestamp,
    /// Profiling counter
    PerfCounter,
    /// Fence word written at batch completion
    SyncFence,
}

// =============================================================================
// TAG STATE
// =============================================================================

/// Lifecycle state of one tag node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagState {
    /// Never handed out since its block was allocated
    Free,
    /// Held by a caller, may be written by hardware
    InUse,
    /// Released, waiting for the fence to pass its task count
    ReadyForReuse,
}

// =============================================================================
// CONFIG
// =============================================================================

/// Tag pool sizing
#[derive(Debug, Clone, Copy)]
pub struct TagPoolConfig {
    /// What the pool's tags are used for
    pub kind: TagKind,
    /// Nodes carved out of each block allocation
    pub nodes_per_block: usize,
    /// Stride between nodes in bytes
    pub node_size: u64,
}

impl TagPoolConfig {
    /// Byte size of one block
    fn block_size(&self) -> ByteSize {
        ByteSize::from_bytes(self.nodes_per_block as u64 * self.node_size)
    }
}

// =============================================================================
// TAG HANDLE
// =============================================================================

/// A held tag; return it with [`TagPool::release`]
#[derive(Debug)]
pub struct TagHandle {
    index: usize,
    gpu_addr: GpuAddr,
    cpu_ptr: *mut u8,
}

impl TagHandle {
    /// GPU address hardware writes to
    #[inline]
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// CPU pointer for polling the tag word (null if unmapped)
    pub fn cpu_ptr(&self) -> Option<*mut u8> {
        if self.cpu_ptr.is_null() {
            None
        } else {
            Some(self.cpu_ptr)
        }
    }

    /// Read the tag word
    ///
    /// Returns 0 when the backing has no CPU mapping.
    pub fn read(&self) -> u32 {
        if self.cpu_ptr.is_null() {
            return 0;
        }
        // SAFETY: pointer targets a live node inside a pool block; hardware
        // writes concurrently, so the read must be volatile
        unsafe { core::ptr::read_volatile(self.cpu_ptr as *const u32) }
    }
}

// SAFETY: the handle is a stable pointer into a pool block; the word it
// targets is only written through volatile accesses
unsafe impl Send for TagHandle {}

// =============================================================================
// TAG POOL
// =============================================================================

#[derive(Debug)]
struct TagNode {
    state: TagState,
    release_after: TaskCount,
    gpu_addr: GpuAddr,
    cpu_ptr: *mut u8,
}

#[derive(Debug, Default)]
struct PoolInner {
    blocks: Vec<Allocation>,
    nodes: Vec<TagNode>,
}

/// Pool of fixed-stride completion tags
pub struct TagPool {
    ctx: Arc<ExecutionContext>,
    allocator: Arc<dyn MemoryOps>,
    config: TagPoolConfig,
    inner: spin::Mutex<PoolInner>,
}

impl TagPool {
    /// Create an empty pool; the first `acquire` allocates the first block
    pub fn new(
        ctx: Arc<ExecutionContext>,
        allocator: Arc<dyn MemoryOps>,
        config: TagPoolConfig,
    ) -> Self {
        Self {
            ctx,
            allocator,
            config,
            inner: spin::Mutex::new(PoolInner::default()),
        }
    }

    /// Acquire a tag
    ///
    /// Preference order: a never-used node, then a released node whose
    /// fence threshold has passed, then a freshly grown block. The tag word
    /// is zeroed before hand-out.
    pub fn acquire(&self) -> Result<TagHandle> {
        let completed = self.ctx.completed();
        let mut inner = self.inner.lock();

        let pos = inner
            .nodes
            .iter()
            .position(|n| n.state == TagState::Free)
            .or_else(|| {
                inner.nodes.iter().position(|n| {
                    n.state == TagState::ReadyForReuse && n.release_after <= completed
                })
            });

        let index = match pos {
            Some(index) => index,
            None => {
                self.grow(&mut inner)?;
                // grow appends nodes_per_block free nodes
                inner.nodes.len() - self.config.nodes_per_block
            }
        };

        let node = &mut inner.nodes[index];
        node.state = TagState::InUse;
        if !node.cpu_ptr.is_null() {
            // SAFETY: node pointer is within its block; the node is not
            // in use by hardware (fence passed or never handed out)
            unsafe { core::ptr::write_volatile(node.cpu_ptr as *mut u32, 0) };
        }
        Ok(TagHandle {
            index,
            gpu_addr: node.gpu_addr,
            cpu_ptr: node.cpu_ptr,
        })
    }

    /// Release a tag, recyclable after the next submission completes
    pub fn release(&self, handle: TagHandle) {
        self.release_with_task_count(handle, self.ctx.task_count() + 1);
    }

    /// Release a tag with an explicit recycling threshold
    pub fn release_with_task_count(&self, handle: TagHandle, release_after: TaskCount) {
        let mut inner = self.inner.lock();
        let node = &mut inner.nodes[handle.index];
        debug_assert_eq!(node.state, TagState::InUse);
        node.state = TagState::ReadyForReuse;
        node.release_after = release_after;
    }

    /// Total nodes across all blocks
    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// Nodes currently held by callers
    pub fn in_use(&self) -> usize {
        self.inner
            .lock()
            .nodes
            .iter()
            .filter(|n| n.state == TagState::InUse)
            .count()
    }

    /// Free every block (teardown path)
    ///
    /// Callers must have awaited full pipeline drain; any still-held tag
    /// handle is invalidated.
    pub fn teardown(&self) {
        let mut inner = self.inner.lock();
        let held = inner
            .nodes
            .iter()
            .filter(|n| n.state == TagState::InUse)
            .count();
        if held > 0 {
            log::warn!("tagpool: {} {:?} tags held at teardown", held, self.config.kind);
        }
        inner.nodes.clear();
        for block in inner.blocks.drain(..) {
            self.allocator.free(block);
        }
    }

    fn grow(&self, inner: &mut PoolInner) -> Result<()> {
        if self.config.nodes_per_block == 0 || self.config.node_size == 0 {
            return Err(Error::InvalidParameter);
        }
        let block = self
            .allocator
            .allocate(self.config.block_size(), AllocationKind::TagBuffer)?;
        log::debug!(
            "tagpool: {:?} grows by {} nodes ({:?})",
            self.config.kind,
            self.config.nodes_per_block,
            self.config.block_size()
        );
        let base_gpu = block.gpu_addr();
        let base_cpu = block.cpu_ptr().unwrap_or(core::ptr::null_mut());
        for i in 0..self.config.nodes_per_block {
            let byte_offset = i as u64 * self.config.node_size;
            let cpu_ptr = if base_cpu.is_null() {
                core::ptr::null_mut()
            } else {
                // SAFETY: offset < block size
                unsafe { base_cpu.add(byte_offset as usize) }
            };
            inner.nodes.push(TagNode {
                state: TagState::Free,
                release_after: 0,
                gpu_addr: base_gpu.offset(byte_offset),
                cpu_ptr,
            });
        }
        inner.blocks.push(block);
        Ok(())
    }
}

impl Drop for TagPool {
    fn drop(&mut self) {
        self.teardown();
    }
}

// SAFETY: node pointers are only dereferenced through volatile accesses
// and all bookkeeping sits behind the inner lock
unsafe impl Send for TagPool {}
unsafe impl Sync for TagPool {}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, TestAllocator};

    fn pool_with(nodes_per_block: usize) -> (Arc<ExecutionContext>, Arc<TestAllocator>, TagPool) {
        let ctx = test_context();
        let allocator = Arc::new(TestAllocator::new());
        let pool = TagPool::new(
            ctx.clone(),
            allocator.clone(),
            TagPoolConfig {
                kind: TagKind::Timestamp,
                nodes_per_block,
                node_size: 64,
            },
        );
        (ctx, allocator, pool)
    }

    #[test]
    fn test_grows_when_block_exhausted() {
        let (_ctx, allocator, pool) = pool_with(4);
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire().unwrap());
        }
        assert_eq!(pool.node_count(), 4);
        assert_eq!(allocator.live_count(), 1);

        // fifth acquire has no free or recyclable node
        held.push(pool.acquire().unwrap());
        assert_eq!(pool.node_count(), 8);
        assert_eq!(allocator.live_count(), 2);

        for handle in held {
            pool.release(handle);
        }
    }

    #[test]
    fn test_released_tag_waits_for_fence() {
        let (ctx, allocator, pool) = pool_with(1);
        let tag = pool.acquire().unwrap();
        pool.release_with_task_count(tag, 2);

        // fence at 0: node not recyclable, pool must grow
        let _second = pool.acquire().unwrap();
        assert_eq!(pool.node_count(), 2);

        ctx.signal_completion(2);
        let third = pool.acquire().unwrap();
        // recycled the released node instead of growing again
        assert_eq!(pool.node_count(), 2);
        assert_eq!(allocator.live_count(), 2);
        pool.release(third);
    }

    #[test]
    fn test_tags_have_fixed_stride() {
        let (_ctx, _allocator, pool) = pool_with(4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(b.gpu_addr() - a.gpu_addr(), 64);
        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn test_acquired_tag_is_zeroed() {
        let (ctx, _allocator, pool) = pool_with(1);
        let tag = pool.acquire().unwrap();
        // dirty the word, release, complete, reacquire
        // SAFETY: test owns the tag
        unsafe { core::ptr::write_volatile(tag.cpu_ptr().unwrap() as *mut u32, 0xdead) };
        pool.release_with_task_count(tag, 1);
        ctx.signal_completion(1);

        let again = pool.acquire().unwrap();
        assert_eq!(again.read(), 0);
        pool.release(again);
    }

    #[test]
    fn test_teardown_frees_all_blocks() {
        let (_ctx, allocator, pool) = pool_with(2);
        let a = pool.acquire().unwrap();
        pool.release(a);
        pool.teardown();
        assert_eq!(allocator.live_count(), 0);
        assert_eq!(pool.node_count(), 0);
    }
}
