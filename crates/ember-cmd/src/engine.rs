//! # Submission Engine
//!
//! Orchestrates heap growth, residency registration, batch submission, and
//! completion waiting for one execution context.
//!
//! All mutating multi-step sequences run under the engine's exclusive-access
//! scope (one `spin::Mutex` over [`EngineCore`]). Fence polling runs outside
//! it: completion is a hardware memory write observed by a plain volatile
//! read, so the wait loop holds no lock.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use ember_core::{
    Allocation, AllocationId, AllocationKind, BufferRegion, ByteSize, Clock, ContextId,
    DispatchOps, EngineCaps, Error, ExecutionContext, GpuAddr, MemoryOps, Result, SubmitBatch,
    SubmitFlags, TaskCount, TraceHook, TASK_COUNT_ALL,
};
use ember_mem::{
    AllocationStorage, HeapChunk, HeapKind, HeapSet, ListKind, ResidencyTracker, TagKind, TagPool,
    TagPoolConfig,
};

// =============================================================================
// CONFIG
// =============================================================================

/// Everything needed to bring up a submission engine
pub struct EngineConfig {
    /// Identifier for the engine's execution context
    pub context_id: ContextId,
    /// Sizing and padding constants (from the caps registry)
    pub caps: EngineCaps,
    /// Device memory allocator
    pub allocator: Arc<dyn MemoryOps>,
    /// Hardware dispatch backend
    pub dispatcher: Arc<dyn DispatchOps>,
    /// Wall-clock source for wait timeouts
    pub clock: Arc<dyn Clock>,
    /// Optional completion observer
    pub trace: Option<Arc<dyn TraceHook>>,
}

// =============================================================================
// ENGINE CORE
// =============================================================================

/// Engine state guarded by the exclusive-access mutex
///
/// Obtainable as a whole through
/// [`SubmissionEngine::obtain_exclusive_access`] for multi-step sequences
/// that must appear atomic to concurrent submitters.
pub struct EngineCore {
    caps: EngineCaps,
    ctx: Arc<ExecutionContext>,
    allocator: Arc<dyn MemoryOps>,
    dispatcher: Arc<dyn DispatchOps>,
    storage: Arc<AllocationStorage>,
    tracker: Arc<ResidencyTracker>,
    heaps: HeapSet,
    tag_pools: BTreeMap<TagKind, Arc<TagPool>>,
    queued: Vec<SubmitBatch>,
    fence_allocation: Option<Allocation>,
    /// Stream offset of the first byte not yet captured by a submit
    flush_offset: u64,
    stream_backing: Option<AllocationId>,
    torn_down: bool,
}

impl EngineCore {
    fn ensure_live(&self) -> Result<()> {
        if self.torn_down {
            return Err(Error::EngineTornDown);
        }
        Ok(())
    }

    /// Reset the capture offset when the stream backing was swapped
    fn sync_stream_backing(&mut self) {
        let current = self.heaps.command_stream().backing().map(|a| a.id());
        if current != self.stream_backing {
            self.stream_backing = current;
            self.flush_offset = 0;
        }
    }

    /// Carve a writable region of the primary command stream
    ///
    /// Grows the stream first when remaining space is short; growth retires
    /// the old backing reusable, tagged with the next task count so it
    /// survives the in-flight submission.
    ///
    /// Carved regions must be captured by a `submit` before a request that
    /// grows the stream: growth swaps the backing, and bytes recorded in
    /// the old backing but never submitted are not carried over.
    pub fn get_command_stream(&mut self, min_size: ByteSize) -> Result<HeapChunk> {
        self.ensure_live()?;
        let retire_after = self.ctx.next_task_count();
        let stream = self.heaps.get_command_stream(
            min_size,
            &self.storage,
            &*self.allocator,
            retire_after,
        )?;
        let chunk = stream.get_space(min_size)?;
        self.sync_stream_backing();
        Ok(chunk)
    }

    /// Carve a writable region of an auxiliary heap
    pub fn get_heap(&mut self, kind: HeapKind, min_size: ByteSize) -> Result<HeapChunk> {
        self.ensure_live()?;
        let retire_after = self.ctx.next_task_count();
        let heap =
            self.heaps
                .get_heap(kind, min_size, &self.storage, &*self.allocator, retire_after)?;
        heap.get_space(min_size)
    }

    /// Return a heap's backing to the reusable list
    pub fn release_heap(&mut self, kind: HeapKind) {
        let retire_after = self.ctx.next_task_count();
        self.heaps.release_heap(kind, &self.storage, retire_after);
    }

    /// Register an allocation for the next submission
    ///
    /// The residency watermark only ever rises; repeat registration extends
    /// retained lifetime, never shortens it.
    pub fn make_resident(&self, allocation: &Allocation) {
        self.tracker
            .make_resident(allocation, self.ctx.next_task_count());
    }

    /// Take an allocation out of residency
    ///
    /// Performs the coherence step through the dispatcher while the
    /// allocation is still resident. Returns whether it was resident; a
    /// repeat call is a no-op.
    pub fn make_non_resident(&self, allocation: &Allocation) -> bool {
        self.evict(
            allocation.id(),
            BufferRegion::new(allocation.gpu_addr(), allocation.size()),
        )
    }

    fn evict(&self, id: AllocationId, region: BufferRegion) -> bool {
        if self.tracker.is_resident(id) {
            self.dispatcher.make_coherent(region);
        }
        self.tracker.make_non_resident(id)
    }

    /// Record a batch covering everything written to the stream since the
    /// last submit
    ///
    /// Assigns the next task count, marks the stream backing and the fence
    /// page resident for it, and queues the batch for the next flush.
    pub fn submit(&mut self, flags: SubmitFlags) -> Result<TaskCount> {
        self.ensure_live()?;
        self.sync_stream_backing();
        let stream = self.heaps.command_stream();
        let backing = stream.backing().ok_or(Error::CommandBufferUnavailable)?;

        let task = self.ctx.advance_task_count();
        let region = BufferRegion::new(
            backing.gpu_addr().offset(self.flush_offset),
            ByteSize::from_bytes(stream.used() - self.flush_offset),
        );
        self.tracker.make_resident(backing, task);
        let fence_addr = match &self.fence_allocation {
            Some(fence) => {
                self.tracker.make_resident(fence, task);
                fence.gpu_addr()
            }
            None => GpuAddr::null(),
        };
        self.flush_offset = stream.used();

        log::debug!("engine: batch queued, task {}, {:?}", task, region);
        self.queued.push(SubmitBatch {
            region,
            task_count: task,
            fence_addr,
            flags,
        });
        Ok(task)
    }

    /// Hand every queued batch to the dispatcher
    ///
    /// After dispatch, drains the residency pack (coherence + non-resident
    /// for each entry) and then the eviction set unconditionally; the
    /// eviction set is a deferred-release staging buffer, not a cache.
    pub fn flush_pending(&mut self) -> Result<()> {
        self.ensure_live()?;
        while !self.queued.is_empty() {
            let batch = self.queued.remove(0);
            log::debug!("engine: flushing task {}", batch.task_count);
            self.dispatcher.submit(&batch).map_err(|e| {
                log::warn!("engine: dispatch of task {} failed", batch.task_count);
                e
            })?;
            self.ctx.update_latest_flushed(batch.task_count);
        }

        for record in self.tracker.take_residency_pack() {
            self.evict(record.id, record.region);
        }
        let evicted = self.tracker.take_eviction_queue();
        if !evicted.is_empty() {
            log::debug!("engine: releasing {} evicted allocations", evicted.len());
        }
        Ok(())
    }

    /// Lazily construct and return the pool for a tag kind
    pub fn get_tag_pool(&mut self, kind: TagKind) -> Arc<TagPool> {
        let (ctx, allocator, caps) = (&self.ctx, &self.allocator, &self.caps);
        self.tag_pools
            .entry(kind)
            .or_insert_with(|| {
                Arc::new(TagPool::new(
                    ctx.clone(),
                    allocator.clone(),
                    TagPoolConfig {
                        kind,
                        nodes_per_block: caps.tag_pool_capacity as usize,
                        node_size: caps.tag_node_size,
                    },
                ))
            })
            .clone()
    }

    /// Unconditional teardown drain
    ///
    /// Only valid once the caller has confirmed no further submissions will
    /// occur; bypasses every fence check. Frees both lifecycle lists, all
    /// heap backings, all tag blocks, and the fence page.
    pub fn cleanup(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if !self.queued.is_empty() {
            log::warn!("engine: {} batches still queued at teardown", self.queued.len());
            self.queued.clear();
        }
        self.storage
            .clean_allocation_list(TASK_COUNT_ALL, ListKind::Temporary);
        self.storage
            .clean_allocation_list(TASK_COUNT_ALL, ListKind::Reusable);
        self.heaps.teardown(&*self.allocator);
        for (_, pool) in core::mem::take(&mut self.tag_pools) {
            pool.teardown();
        }
        self.ctx.clear_fence();
        if let Some(fence) = self.fence_allocation.take() {
            self.tracker.remove(fence.id());
            self.allocator.free(fence);
        }
    }
}

// =============================================================================
// SUBMISSION ENGINE
// =============================================================================

/// The command-submission and residency engine for one execution context
pub struct SubmissionEngine {
    ctx: Arc<ExecutionContext>,
    storage: Arc<AllocationStorage>,
    tracker: Arc<ResidencyTracker>,
    clock: Arc<dyn Clock>,
    trace: Option<Arc<dyn TraceHook>>,
    core: spin::Mutex<EngineCore>,
}

impl SubmissionEngine {
    /// Bring up an engine: create the context, allocate and zero the
    /// completion fence page, wire the storage, tracker, and heap set
    pub fn new(config: EngineConfig) -> Result<Self> {
        let ctx = Arc::new(ExecutionContext::new(config.context_id));

        let fence = config.allocator.allocate(
            ByteSize::from_bytes(config.caps.page_size),
            AllocationKind::Fence,
        )?;
        let fence_ptr = match fence.cpu_ptr() {
            Some(ptr) => ptr,
            None => {
                // The wait loop polls the fence from the CPU; an unmapped
                // page is unusable
                config.allocator.free(fence);
                return Err(Error::AllocationFailed);
            }
        };
        // SAFETY: the fence allocation is held in the engine core until
        // cleanup, which clears the context's fence pointer before freeing
        unsafe { ctx.init_fence(fence_ptr as *mut u32) };

        let tracker = Arc::new(ResidencyTracker::new());
        let storage = Arc::new(AllocationStorage::new(
            ctx.clone(),
            config.allocator.clone(),
            tracker.clone(),
        ));

        log::debug!("engine: context {:?} up, fence at {}", ctx.id(), fence.gpu_addr());
        Ok(Self {
            ctx: ctx.clone(),
            storage: storage.clone(),
            tracker: tracker.clone(),
            clock: config.clock,
            trace: config.trace,
            core: spin::Mutex::new(EngineCore {
                caps: config.caps,
                ctx,
                allocator: config.allocator,
                dispatcher: config.dispatcher,
                storage,
                tracker,
                heaps: HeapSet::new(config.caps),
                tag_pools: BTreeMap::new(),
                queued: Vec::new(),
                fence_allocation: Some(fence),
                flush_offset: 0,
                stream_backing: None,
                torn_down: false,
            }),
        })
    }

    /// The engine's execution context
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    /// Scoped acquisition of the engine's internal mutex
    ///
    /// Required around any multi-step sequence that must appear atomic to
    /// concurrent submitters (record commands, register residency, submit).
    pub fn obtain_exclusive_access(&self) -> spin::MutexGuard<'_, EngineCore> {
        self.core.lock()
    }

    /// See [`EngineCore::get_command_stream`]
    pub fn get_command_stream(&self, min_size: ByteSize) -> Result<HeapChunk> {
        self.core.lock().get_command_stream(min_size)
    }

    /// See [`EngineCore::get_heap`]
    pub fn get_heap(&self, kind: HeapKind, min_size: ByteSize) -> Result<HeapChunk> {
        self.core.lock().get_heap(kind, min_size)
    }

    /// See [`EngineCore::release_heap`]
    pub fn release_heap(&self, kind: HeapKind) {
        self.core.lock().release_heap(kind)
    }

    /// See [`EngineCore::make_resident`]
    pub fn make_resident(&self, allocation: &Allocation) {
        self.core.lock().make_resident(allocation)
    }

    /// See [`EngineCore::make_non_resident`]
    pub fn make_non_resident(&self, allocation: &Allocation) -> bool {
        self.core.lock().make_non_resident(allocation)
    }

    /// See [`EngineCore::submit`]
    pub fn submit(&self, flags: SubmitFlags) -> Result<TaskCount> {
        self.core.lock().submit(flags)
    }

    /// See [`EngineCore::flush_pending`]
    pub fn flush_pending(&self) -> Result<()> {
        self.core.lock().flush_pending()
    }

    /// See [`EngineCore::get_tag_pool`]
    pub fn get_tag_pool(&self, kind: TagKind) -> Arc<TagPool> {
        self.core.lock().get_tag_pool(kind)
    }

    /// Store caller memory on a lifecycle list for deferred reclamation
    ///
    /// Temporary entries become free after the next submission completes.
    /// Reusable entries become free once the allocation's last recorded
    /// submission completes; an allocation idle since task N is eligible
    /// for reuse as soon as the fence passes N, with no extra submission
    /// in between.
    pub fn store_allocation(&self, allocation: Allocation, kind: ListKind) {
        match kind {
            ListKind::Reusable => {
                let free_after = self.tracker.watermark(allocation.id()).unwrap_or(0);
                self.storage
                    .store_allocation_with_task_count(allocation, kind, free_after);
            }
            ListKind::Temporary => self.storage.store_allocation(allocation, kind),
        }
    }

    /// Bytes currently resident for this context
    pub fn total_memory_used(&self) -> ByteSize {
        self.tracker.memory_in_use()
    }

    /// Flush if behind the target, then wait for the fence to reach it
    ///
    /// Completion is a hardware memory write with no wakeable event behind
    /// it, so the wait is a cooperative spin: spin-loop hint (and a thread
    /// yield on hosted builds) with the wall clock checked per iteration.
    /// With the timeout disabled the poll runs indefinitely. A timeout is a
    /// normal outcome, reported as `Ok(false)`; the caller decides whether
    /// it is an execution stall. The trace hook fires on success.
    pub fn flush_and_wait(
        &self,
        target: TaskCount,
        timeout_micros: u64,
        enable_timeout: bool,
    ) -> Result<bool> {
        {
            let mut core = self.core.lock();
            core.ensure_live()?;
            if self.ctx.latest_flushed() < target {
                core.flush_pending()?;
            }
        }

        let start = self.clock.now_micros();
        loop {
            if self.ctx.is_complete(target) {
                log::trace!("engine: task {} complete", target);
                if let Some(hook) = &self.trace {
                    hook.task_completed(target);
                }
                return Ok(true);
            }
            core::hint::spin_loop();
            #[cfg(any(feature = "std", test))]
            std::thread::yield_now();
            if enable_timeout
                && self.clock.now_micros().saturating_sub(start) >= timeout_micros
            {
                log::debug!("engine: wait for task {} timed out", target);
                return Ok(false);
            }
        }
    }

    /// Wait indefinitely for a task, then clean the given lifecycle list up
    /// to it
    pub fn wait_and_clean(&self, task: TaskCount, kind: ListKind) -> Result<()> {
        self.flush_and_wait(task, 0, false)?;
        self.storage.clean_allocation_list(task, kind);
        Ok(())
    }

    /// See [`EngineCore::cleanup`]
    pub fn cleanup(&self) {
        self.core.lock().cleanup()
    }
}

impl Drop for SubmissionEngine {
    fn drop(&mut self) {
        self.core.lock().cleanup();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use core::alloc::Layout;
    use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

    use ember_core::{AllocationFlags, AllocationId};

    // -------------------------------------------------------------------------
    // Test doubles
    // -------------------------------------------------------------------------

    struct TestAllocator {
        next_id: AtomicU64,
        live: spin::Mutex<BTreeMap<u64, u64>>,
        fail: AtomicBool,
    }

    impl TestAllocator {
        fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                live: spin::Mutex::new(BTreeMap::new()),
                fail: AtomicBool::new(false),
            }
        }

        fn live_count(&self) -> usize {
            self.live.lock().len()
        }

        fn set_failing(&self, fail: bool) {
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
            // SAFETY: non-zero size, valid alignment
            let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
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
                // SAFETY: mirrors the allocate call
                unsafe { alloc::alloc::dealloc(ptr, layout) };
            }
        }
    }

    /// Dispatcher that writes the fence immediately (null-hardware path)
    struct SignalingDispatcher {
        signal: bool,
        submits: AtomicU32,
        coherence_calls: AtomicU32,
        last_region: spin::Mutex<Option<BufferRegion>>,
    }

    impl SignalingDispatcher {
        fn new(signal: bool) -> Self {
            Self {
                signal,
                submits: AtomicU32::new(0),
                coherence_calls: AtomicU32::new(0),
                last_region: spin::Mutex::new(None),
            }
        }
    }

    impl DispatchOps for SignalingDispatcher {
        fn submit(&self, batch: &SubmitBatch) -> Result<()> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            *self.last_region.lock() = Some(batch.region);
            if self.signal {
                assert!(!batch.fence_addr.is_null());
                // SAFETY: fence_addr doubles as the CPU pointer under the
                // test allocator
                unsafe {
                    core::ptr::write_volatile(batch.fence_addr.raw() as *mut u32, batch.task_count)
                };
            }
            Ok(())
        }

        fn make_coherent(&self, _region: BufferRegion) {
            self.coherence_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Clock advancing a fixed step per reading
    struct SteppingClock {
        now: AtomicU64,
        step: u64,
    }

    impl Clock for SteppingClock {
        fn now_micros(&self) -> u64 {
            self.now.fetch_add(self.step, Ordering::SeqCst)
        }
    }

    struct RecordingHook {
        last: AtomicU32,
    }

    impl TraceHook for RecordingHook {
        fn task_completed(&self, task: TaskCount) {
            self.last.store(task, Ordering::SeqCst);
        }
    }

    struct Rig {
        allocator: Arc<TestAllocator>,
        dispatcher: Arc<SignalingDispatcher>,
        hook: Arc<RecordingHook>,
        engine: SubmissionEngine,
    }

    fn rig(signal: bool) -> Rig {
        let allocator = Arc::new(TestAllocator::new());
        let dispatcher = Arc::new(SignalingDispatcher::new(signal));
        let hook = Arc::new(RecordingHook {
            last: AtomicU32::new(0),
        });
        let engine = SubmissionEngine::new(EngineConfig {
            context_id: ContextId::new(1),
            caps: EngineCaps::default(),
            allocator: allocator.clone(),
            dispatcher: dispatcher.clone(),
            clock: Arc::new(SteppingClock {
                now: AtomicU64::new(0),
                step: 10,
            }),
            trace: Some(hook.clone()),
        })
        .unwrap();
        Rig {
            allocator,
            dispatcher,
            hook,
            engine,
        }
    }

    // -------------------------------------------------------------------------
    // Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_submit_flush_wait_roundtrip() {
        let r = rig(true);
        r.engine.get_command_stream(ByteSize::from_kib(4)).unwrap();
        let task = r.engine.submit(SubmitFlags::empty()).unwrap();
        assert_eq!(task, 1);

        let done = r.engine.flush_and_wait(task, 0, false).unwrap();
        assert!(done);
        assert_eq!(r.dispatcher.submits.load(Ordering::SeqCst), 1);
        assert_eq!(r.engine.context().latest_flushed(), 1);
        assert_eq!(r.hook.last.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_timeout_is_recoverable() {
        let r = rig(false);
        r.engine.get_command_stream(ByteSize::from_kib(4)).unwrap();
        let task = r.engine.submit(SubmitFlags::empty()).unwrap();

        // fence never advances; stepping clock expires the budget
        let done = r.engine.flush_and_wait(task, 100, true).unwrap();
        assert!(!done);
        // the batch was still dispatched
        assert_eq!(r.dispatcher.submits.load(Ordering::SeqCst), 1);
        assert_eq!(r.hook.last.load(Ordering::SeqCst), 0);
        r.engine.cleanup();
    }

    #[test]
    fn test_submission_regions_are_consecutive() {
        let r = rig(true);
        let first = r.engine.get_command_stream(ByteSize::from_kib(4)).unwrap();
        r.engine.submit(SubmitFlags::empty()).unwrap();

        let second = r.engine.get_command_stream(ByteSize::from_kib(4)).unwrap();
        r.engine.submit(SubmitFlags::empty()).unwrap();

        // same backing, second batch starts where the first ended
        assert_eq!(second.gpu_addr - first.gpu_addr, 4 * 1024);
    }

    #[test]
    fn test_stream_growth_retires_backing_reusable() {
        let r = rig(true);
        r.engine.get_command_stream(ByteSize::from_kib(60)).unwrap();
        let task = r.engine.submit(SubmitFlags::empty()).unwrap();
        r.engine.flush_and_wait(task, 0, false).unwrap();

        // 60 KiB used of a 64 KiB backing; this forces a swap
        r.engine.get_command_stream(ByteSize::from_kib(8)).unwrap();
        assert_eq!(r.engine.storage.len(ListKind::Reusable), 1);
    }

    #[test]
    fn test_residency_watermark_across_submissions() {
        let r = rig(true);
        let buffer = r
            .allocator
            .allocate(ByteSize::from_kib(4), AllocationKind::LinearStream)
            .unwrap();

        // park the counter so the next three submissions are tasks 5, 6, 7
        for _ in 0..4 {
            r.engine.context().advance_task_count();
        }
        for expected in [5, 6, 7] {
            r.engine.make_resident(&buffer);
            r.engine.get_command_stream(ByteSize::from_kib(1)).unwrap();
            let task = r.engine.submit(SubmitFlags::empty()).unwrap();
            assert_eq!(task, expected);
        }
        assert_eq!(r.engine.tracker.watermark(buffer.id()), Some(7));
        r.allocator.free(buffer);
    }

    #[test]
    fn test_two_step_eviction_with_coherence() {
        let r = rig(true);
        let buffer = r
            .allocator
            .allocate(ByteSize::from_kib(4), AllocationKind::LinearStream)
            .unwrap();

        r.engine.make_resident(&buffer);
        assert!(r.engine.make_non_resident(&buffer));
        assert_eq!(r.dispatcher.coherence_calls.load(Ordering::SeqCst), 1);
        // repeat call on a non-resident allocation: no-op, no coherence
        assert!(!r.engine.make_non_resident(&buffer));
        assert_eq!(r.dispatcher.coherence_calls.load(Ordering::SeqCst), 1);

        // second residency cycle queues the actual eviction at flush
        r.engine.make_resident(&buffer);
        assert!(r.engine.make_non_resident(&buffer));
        r.engine.flush_pending().unwrap();
        assert!(r.engine.tracker.take_eviction_queue().is_empty());
        r.allocator.free(buffer);
    }

    #[test]
    fn test_memory_usage_counts_first_residency_only() {
        let r = rig(true);
        let buffer = r
            .allocator
            .allocate(ByteSize::from_kib(8), AllocationKind::LinearStream)
            .unwrap();
        r.engine.make_resident(&buffer);
        r.engine.make_resident(&buffer);
        assert_eq!(r.engine.total_memory_used(), ByteSize::from_kib(8));
        r.allocator.free(buffer);
    }

    #[test]
    fn test_wait_and_clean_reclaims_temporaries() {
        let r = rig(true);
        let staging = r
            .allocator
            .allocate(ByteSize::from_kib(4), AllocationKind::Staging)
            .unwrap();
        r.engine.store_allocation(staging, ListKind::Temporary);

        r.engine.get_command_stream(ByteSize::from_kib(1)).unwrap();
        let task = r.engine.submit(SubmitFlags::empty()).unwrap();
        r.engine
            .wait_and_clean(task, ListKind::Temporary)
            .unwrap();
        assert_eq!(r.engine.storage.len(ListKind::Temporary), 0);
    }

    #[test]
    fn test_tag_pool_is_lazy_and_cached() {
        let r = rig(true);
        let before = r.allocator.live_count();
        let pool = r.engine.get_tag_pool(TagKind::Timestamp);
        // no block until first acquire
        assert_eq!(r.allocator.live_count(), before);
        let tag = pool.acquire().unwrap();
        assert_eq!(r.allocator.live_count(), before + 1);
        pool.release(tag);

        let again = r.engine.get_tag_pool(TagKind::Timestamp);
        assert!(Arc::ptr_eq(&pool, &again));
    }

    #[test]
    fn test_allocation_failure_propagates() {
        let r = rig(true);
        r.allocator.set_failing(true);
        assert_eq!(
            r.engine.get_command_stream(ByteSize::from_kib(4)).unwrap_err(),
            Error::AllocationFailed
        );
        r.allocator.set_failing(false);
    }

    #[test]
    fn test_release_cycles_do_not_accumulate_tracker_entries() {
        let r = rig(true);
        for _ in 0..8 {
            let buffer = r
                .allocator
                .allocate(ByteSize::from_kib(4), AllocationKind::LinearStream)
                .unwrap();
            r.engine.make_resident(&buffer);
            r.engine.get_command_stream(ByteSize::from_kib(1)).unwrap();
            let task = r.engine.submit(SubmitFlags::empty()).unwrap();
            r.engine.flush_and_wait(task, 0, false).unwrap();
            r.engine.store_allocation(buffer, ListKind::Reusable);
        }
        // only the live stream backing and the fence page remain tracked;
        // released buffers left the residency domain with their memory
        assert_eq!(r.engine.tracker.len(), 2);
    }

    #[test]
    fn test_reusable_release_uses_last_submission_count() {
        let r = rig(true);
        let buffer = r
            .allocator
            .allocate(ByteSize::from_kib(4), AllocationKind::CommandBuffer)
            .unwrap();

        // last referenced by task 1
        r.engine.make_resident(&buffer);
        r.engine.get_command_stream(ByteSize::from_kib(1)).unwrap();
        let first = r.engine.submit(SubmitFlags::empty()).unwrap();
        r.engine.flush_and_wait(first, 0, false).unwrap();

        // several unrelated submissions later
        for _ in 0..3 {
            r.engine.get_command_stream(ByteSize::from_kib(1)).unwrap();
            let task = r.engine.submit(SubmitFlags::empty()).unwrap();
            r.engine.flush_and_wait(task, 0, false).unwrap();
        }

        r.engine.store_allocation(buffer, ListKind::Reusable);
        // free-after is task 1, long complete; eligible immediately
        let hit = r
            .engine
            .storage
            .obtain_reusable_allocation(ByteSize::from_kib(4), AllocationKind::CommandBuffer)
            .expect("idle allocation must be reusable once its last submission completed");
        r.allocator.free(hit);
    }

    #[test]
    fn test_wait_after_teardown_errors() {
        let r = rig(true);
        r.engine.get_command_stream(ByteSize::from_kib(1)).unwrap();
        let task = r.engine.submit(SubmitFlags::empty()).unwrap();
        r.engine.flush_and_wait(task, 0, false).unwrap();
        r.engine.cleanup();

        // must answer, not spin on the cleared fence
        assert_eq!(
            r.engine.flush_and_wait(task, 0, false).unwrap_err(),
            Error::EngineTornDown
        );
        assert_eq!(
            r.engine
                .wait_and_clean(task, ListKind::Temporary)
                .unwrap_err(),
            Error::EngineTornDown
        );
    }

    #[test]
    fn test_submit_after_growth_captures_new_backing_only() {
        let r = rig(true);
        // recorded but never submitted; the growth below abandons it
        r.engine.get_command_stream(ByteSize::from_kib(60)).unwrap();
        let regrown = r.engine.get_command_stream(ByteSize::from_kib(8)).unwrap();

        let task = r.engine.submit(SubmitFlags::empty()).unwrap();
        r.engine.flush_and_wait(task, 0, false).unwrap();
        assert_eq!(
            *r.dispatcher.last_region.lock(),
            Some(BufferRegion::new(regrown.gpu_addr, ByteSize::from_kib(8)))
        );
    }

    #[test]
    fn test_cleanup_frees_everything_once() {
        let r = rig(true);
        r.engine.get_command_stream(ByteSize::from_kib(60)).unwrap();
        r.engine
            .get_heap(HeapKind::SurfaceState, ByteSize::from_kib(4))
            .unwrap();
        let pool = r.engine.get_tag_pool(TagKind::SyncFence);
        let tag = pool.acquire().unwrap();
        pool.release(tag);
        let staging = r
            .allocator
            .allocate(ByteSize::from_kib(4), AllocationKind::Staging)
            .unwrap();
        r.engine.store_allocation(staging, ListKind::Temporary);
        let task = r.engine.submit(SubmitFlags::empty()).unwrap();
        r.engine.flush_and_wait(task, 0, false).unwrap();

        r.engine.cleanup();
        // fence page, stream and heap backings, tag block, staging: all gone
        assert_eq!(r.allocator.live_count(), 0);

        // engine refuses further work
        assert_eq!(
            r.engine.submit(SubmitFlags::empty()).unwrap_err(),
            Error::EngineTornDown
        );
        // second cleanup (and the one from Drop) must not double-free
        r.engine.cleanup();
    }

    #[test]
    fn test_exclusive_scope_multi_step() {
        let r = rig(true);
        let task = {
            let mut core = r.engine.obtain_exclusive_access();
            core.get_command_stream(ByteSize::from_kib(4)).unwrap();
            core.submit(SubmitFlags::LOW_LATENCY).unwrap()
        };
        assert!(r.engine.flush_and_wait(task, 0, false).unwrap());
    }
}
