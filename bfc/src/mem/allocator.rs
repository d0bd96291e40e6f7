use super::alloc_utils::*;
use super::bin::BinSet;
use super::chunk::{Chunk, ChunkHandle, ChunkTable, FREE_ALLOCATION_ID, INVALID_CHUNK_HANDLE};
use super::region::RegionManager;
use super::retry::AllocatorRetry;
use super::stats::AllocatorStats;
use crate::config::AllocatorConfig;
use crate::device::{DeviceBlock, DeviceMemory, DevicePtr};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Called with the base and size of a region as it is obtained from or
/// returned to the device.
pub type RegionVisitor = Box<dyn Fn(DevicePtr, usize) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationAttributes {
    /// Fail at once instead of waiting for memory to be freed. For optional
    /// allocations whose failure the caller can live with.
    pub no_retry_on_failure: bool,
}

const BACKPEDAL_FACTOR: f64 = 0.9;
const MAX_FAILURE_LOGS: usize = 10;

static NO_RETRY_FAILURE_LOGS: AtomicUsize = AtomicUsize::new(0);

/// Best-fit-with-coalescing allocator over regions of device memory.
///
/// Every operation runs under a single lock, so chunk splitting, coalescing
/// and region growth are atomic with respect to other threads.
pub struct BfcAllocator {
    name: String,
    retry_timeout: Duration,
    retry_helper: AllocatorRetry,
    inner: Mutex<BfcInner>,
    /// Kept outside `inner` so visitors run without the allocator lock held.
    alloc_visitors: Mutex<Vec<RegionVisitor>>,
    free_visitors: Mutex<Vec<RegionVisitor>>,
}

pub(super) struct BfcInner {
    pub(super) name: String,
    device: Box<dyn DeviceMemory>,
    pub(super) chunks: ChunkTable,
    pub(super) bins: BinSet,
    pub(super) region_manager: RegionManager,
    pub(super) memory_limit: usize,
    /// Size of the next region to request from the device.
    pub(super) curr_region_allocation_bytes: usize,
    pub(super) total_region_allocated_bytes: usize,
    started_backpedal: bool,
    next_allocation_id: i64,
    pub(super) stats: AllocatorStats,
}

impl BfcAllocator {
    pub fn new(device: Box<dyn DeviceMemory>, config: &AllocatorConfig) -> Self {
        let memory_limit = config.memory_limit;
        let first_region = if config.allow_growth {
            std::cmp::min(memory_limit, config.initial_region_size)
        } else {
            memory_limit
        };
        let curr_region_allocation_bytes =
            rounded_bytes(first_region.min(MAX_ALLOCATION_SIZE)).max(MIN_ALLOCATION_SIZE);
        info!(
            "Creating bfc allocator {} on device {}: limit {}, growth {}, first region {}",
            config.name,
            device.device_id(),
            human_readable_num_bytes(memory_limit),
            config.allow_growth,
            human_readable_num_bytes(curr_region_allocation_bytes)
        );
        BfcAllocator {
            name: config.name.clone(),
            retry_timeout: config.retry_timeout(),
            retry_helper: AllocatorRetry::new(),
            inner: Mutex::new(BfcInner {
                name: config.name.clone(),
                device,
                chunks: ChunkTable::new(),
                bins: BinSet::new(),
                region_manager: RegionManager::new(),
                memory_limit,
                curr_region_allocation_bytes,
                total_region_allocated_bytes: 0,
                started_backpedal: false,
                next_allocation_id: 1,
                stats: AllocatorStats::new(memory_limit),
            }),
            alloc_visitors: Mutex::new(vec![]),
            free_visitors: Mutex::new(vec![]),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, BfcInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates `num_bytes`, waiting for other threads to free memory if the
    /// arena is exhausted. `None` on failure.
    pub fn allocate_raw(&self, alignment: usize, num_bytes: usize) -> Option<DevicePtr> {
        self.allocate_raw_with_attrs(alignment, num_bytes, AllocationAttributes::default())
    }

    pub fn allocate_raw_with_attrs(
        &self,
        alignment: usize,
        num_bytes: usize,
        attrs: AllocationAttributes,
    ) -> Option<DevicePtr> {
        if num_bytes == 0 {
            warn!("{}: tried to allocate 0 bytes", self.name);
            return None;
        }
        if num_bytes > MAX_ALLOCATION_SIZE {
            warn!("{}: tried to allocate {num_bytes} bytes", self.name);
            return None;
        }
        if alignment > MIN_ALLOCATION_SIZE {
            debug!(
                "{}: alignment {alignment} requested, chunks are {MIN_ALLOCATION_SIZE} byte aligned",
                self.name
            );
        }
        if attrs.no_retry_on_failure {
            let result = self.allocate_raw_internal(alignment, num_bytes, false);
            if result.is_none()
                && NO_RETRY_FAILURE_LOGS.fetch_add(1, Ordering::Relaxed) < MAX_FAILURE_LOGS
            {
                warn!(
                    "{}: ran out of memory trying to allocate {} with no retry. \
                     The caller indicates that this is not a failure, but may mean \
                     that there could be performance gains if more memory were available.",
                    self.name,
                    human_readable_num_bytes(num_bytes)
                );
            }
            result
        } else {
            self.retry_helper.allocate_raw(
                |alignment, num_bytes, verbose_failure| {
                    self.allocate_raw_internal(alignment, num_bytes, verbose_failure)
                },
                self.retry_timeout,
                alignment,
                num_bytes,
            )
        }
    }

    fn allocate_raw_internal(
        &self,
        _alignment: usize,
        num_bytes: usize,
        dump_log_on_failure: bool,
    ) -> Option<DevicePtr> {
        let rounded_bytes = rounded_bytes(num_bytes);
        let bin_num = bin_num_for_size(rounded_bytes);
        let mut inner = self.lock();
        if let Some(ptr) = inner.find_chunk_ptr(bin_num, rounded_bytes, num_bytes) {
            return Some(ptr);
        }
        if let Some(region) = inner.extend(rounded_bytes) {
            let ptr = inner.find_chunk_ptr(bin_num, rounded_bytes, num_bytes);
            drop(inner);
            self.visit_new_region(region);
            if ptr.is_some() {
                return ptr;
            }
            inner = self.lock();
        }
        if dump_log_on_failure {
            warn!(
                "{}: ran out of memory trying to allocate {} (rounded to {}). \
                 Current allocation summary follows.",
                self.name,
                human_readable_num_bytes(num_bytes),
                rounded_bytes
            );
            inner.dump_memory_log(rounded_bytes);
            warn!("{}", inner.render_occupancy());
        }
        None
    }

    fn visit_new_region(&self, region: DeviceBlock) {
        let visitors = self
            .alloc_visitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for visitor in visitors.iter() {
            visitor(region.ptr, region.size);
        }
    }

    /// Returns `ptr` to the allocator. Panics if `ptr` was not handed out by
    /// this allocator or is already free.
    pub fn deallocate_raw(&self, ptr: DevicePtr) {
        if ptr.is_null() {
            error!("{}: tried to deallocate a null pointer", self.name);
            return;
        }
        self.lock().deallocate_raw_internal(ptr);
        self.retry_helper.notify_dealloc();
    }

    pub fn tracks_allocation_sizes(&self) -> bool {
        true
    }

    pub fn requested_size(&self, ptr: DevicePtr) -> usize {
        self.lock().in_use_chunk(ptr).requested_size
    }

    pub fn allocated_size(&self, ptr: DevicePtr) -> usize {
        self.lock().in_use_chunk(ptr).size
    }

    pub fn allocation_id(&self, ptr: DevicePtr) -> i64 {
        self.lock().in_use_chunk(ptr).allocation_id
    }

    /// Registers a hook run for every region obtained after this call. Hooks
    /// run after the allocator lock is released, so they may call back into
    /// the allocator, but must not register further visitors.
    pub fn add_alloc_visitor(&self, visitor: impl Fn(DevicePtr, usize) + Send + Sync + 'static) {
        self.alloc_visitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(visitor));
    }

    /// Registers a hook run for every region returned to the device.
    pub fn add_free_visitor(&self, visitor: impl Fn(DevicePtr, usize) + Send + Sync + 'static) {
        self.free_visitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(visitor));
    }

    pub fn get_stats(&self) -> AllocatorStats {
        self.lock().stats.clone()
    }

    pub fn clear_stats(&self) {
        self.lock().stats.clear();
    }

    /// A 100 character picture of all regions: `*` requested bytes, `x`
    /// rounding waste, `_` free.
    pub fn render_occupancy(&self) -> String {
        self.lock().render_occupancy()
    }

    /// Logs bins, chunks and stats as seen by a request for `num_bytes`.
    pub fn dump_memory_log(&self, num_bytes: usize) {
        self.lock().dump_memory_log(rounded_bytes(num_bytes.min(MAX_ALLOCATION_SIZE)));
    }
}

impl Drop for BfcAllocator {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        let free_visitors = self
            .free_visitors
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        info!(
            "{}: number of regions allocated: {}",
            self.name,
            inner.region_manager.regions().len()
        );
        inner.release_regions(free_visitors);
    }
}

impl BfcInner {
    /// Grows the arena by one region able to hold `rounded_bytes` and returns
    /// the new region.
    fn extend(&mut self, rounded_bytes: usize) -> Option<DeviceBlock> {
        let mut available_bytes = self
            .memory_limit
            .saturating_sub(self.total_region_allocated_bytes);
        available_bytes = (available_bytes / MIN_ALLOCATION_SIZE) * MIN_ALLOCATION_SIZE;
        if rounded_bytes > available_bytes {
            debug!(
                "{}: cannot extend by {} bytes, only {} left under the limit",
                self.name, rounded_bytes, available_bytes
            );
            return None;
        }

        let mut increased_allocation = false;
        while rounded_bytes > self.curr_region_allocation_bytes {
            self.curr_region_allocation_bytes *= 2;
            increased_allocation = true;
        }

        let mut bytes = std::cmp::min(self.curr_region_allocation_bytes, available_bytes);
        let mut block = self.device.allocate_block(bytes);
        if let Err(err) = &block {
            warn!(
                "{}: device refused a region of {}: {err}",
                self.name,
                human_readable_num_bytes(bytes)
            );
        }
        if block.is_err() && !self.started_backpedal {
            self.started_backpedal = true;
            while block.is_err() {
                let smaller = rounded_bytes_of_fraction(bytes, BACKPEDAL_FACTOR);
                if smaller < rounded_bytes || smaller >= bytes {
                    break;
                }
                bytes = smaller;
                block = self.device.allocate_block(bytes);
            }
        }
        let block = match block {
            Ok(block) => block,
            Err(err) => {
                warn!(
                    "{}: could not extend by {} bytes: {err}",
                    self.name, rounded_bytes
                );
                return None;
            }
        };
        if !block.ptr.is_aligned(MIN_ALLOCATION_SIZE) || block.size != bytes {
            error!(
                "{}: device returned an unusable region of {} bytes at {}",
                self.name, block.size, block.ptr
            );
            self.device.free_block(block);
            return None;
        }

        if !increased_allocation {
            self.curr_region_allocation_bytes = self.curr_region_allocation_bytes.saturating_mul(2);
        }
        self.total_region_allocated_bytes += bytes;
        self.stats.bytes_reserved = self.total_region_allocated_bytes;
        info!(
            "{}: extending allocation by {} bytes at {}, total {}",
            self.name,
            human_readable_num_bytes(bytes),
            block.ptr,
            human_readable_num_bytes(self.total_region_allocated_bytes)
        );

        self.region_manager.add_allocation_region(block.ptr, bytes);
        let h = self.chunks.allocate_chunk();
        {
            let chunk = self.chunks.chunk_mut(h);
            chunk.ptr = block.ptr;
            chunk.size = bytes;
        }
        self.region_manager.set_handle(block.ptr, h);
        self.bins.insert_free_chunk(&mut self.chunks, h);
        Some(block)
    }

    fn find_chunk_ptr(
        &mut self,
        bin_num: usize,
        rounded_bytes: usize,
        num_bytes: usize,
    ) -> Option<DevicePtr> {
        let h = self.bins.find_fit(bin_num, rounded_bytes)?;
        self.bins.remove_free_chunk(&mut self.chunks, h);
        if self.chunks.chunk(h).size >= rounded_bytes * 2 {
            self.split_chunk(h, rounded_bytes);
        }
        let allocation_id = self.next_allocation_id;
        self.next_allocation_id += 1;
        let chunk = self.chunks.chunk_mut(h);
        chunk.requested_size = num_bytes;
        chunk.allocation_id = allocation_id;
        let (ptr, size) = (chunk.ptr, chunk.size);
        self.stats.record_allocation(size);
        trace!(
            "{}: allocated {} bytes ({} requested) at {}, id {}",
            self.name, size, num_bytes, ptr, allocation_id
        );
        Some(ptr)
    }

    /// Keeps the first `num_bytes` of `h` and turns the rest into a new free chunk.
    fn split_chunk(&mut self, h: ChunkHandle, num_bytes: usize) {
        let h_new = self.chunks.allocate_chunk();
        let (ptr, size, next) = {
            let chunk = self.chunks.chunk(h);
            debug_assert!(!chunk.in_use() && chunk.size > num_bytes);
            (chunk.ptr, chunk.size, chunk.next)
        };
        let new_ptr = ptr + num_bytes;
        {
            let new_chunk = self.chunks.chunk_mut(h_new);
            new_chunk.ptr = new_ptr;
            new_chunk.size = size - num_bytes;
            new_chunk.allocation_id = FREE_ALLOCATION_ID;
            new_chunk.prev = h;
            new_chunk.next = next;
        }
        self.region_manager.set_handle(new_ptr, h_new);
        {
            let chunk = self.chunks.chunk_mut(h);
            chunk.size = num_bytes;
            chunk.next = h_new;
        }
        if next != INVALID_CHUNK_HANDLE {
            self.chunks.chunk_mut(next).prev = h_new;
        }
        self.bins.insert_free_chunk(&mut self.chunks, h_new);
    }

    fn deallocate_raw_internal(&mut self, ptr: DevicePtr) {
        let h = self.region_manager.get_handle(ptr);
        assert!(
            h != INVALID_CHUNK_HANDLE,
            "{}: deallocate of {ptr}, which was never allocated",
            self.name
        );
        assert!(
            self.chunks.chunk(h).in_use(),
            "{}: deallocate of {ptr}, which is already free",
            self.name
        );
        trace!("{}: free {}", self.name, ptr);
        self.free_and_maybe_coalesce(h);
    }

    fn free_and_maybe_coalesce(&mut self, h: ChunkHandle) {
        let size = {
            let chunk = self.chunks.chunk_mut(h);
            chunk.allocation_id = FREE_ALLOCATION_ID;
            chunk.requested_size = 0;
            chunk.size
        };
        self.stats.record_free(size);

        let mut coalesced = h;
        let next = self.chunks.chunk(h).next;
        if next != INVALID_CHUNK_HANDLE && !self.chunks.chunk(next).in_use() {
            self.bins.remove_free_chunk(&mut self.chunks, next);
            self.merge(h, next);
        }
        let prev = self.chunks.chunk(h).prev;
        if prev != INVALID_CHUNK_HANDLE && !self.chunks.chunk(prev).in_use() {
            coalesced = prev;
            self.bins.remove_free_chunk(&mut self.chunks, prev);
            self.merge(prev, h);
        }
        self.bins.insert_free_chunk(&mut self.chunks, coalesced);
    }

    /// Absorbs `h2` into its predecessor `h1`. Neither may be binned.
    fn merge(&mut self, h1: ChunkHandle, h2: ChunkHandle) {
        let (h3, size2) = {
            let c2 = self.chunks.chunk(h2);
            debug_assert!(!c2.in_use() && c2.prev == h1);
            (c2.next, c2.size)
        };
        {
            let c1 = self.chunks.chunk_mut(h1);
            debug_assert!(!c1.in_use() && c1.next == h2);
            c1.next = h3;
            c1.size += size2;
        }
        if h3 != INVALID_CHUNK_HANDLE {
            self.chunks.chunk_mut(h3).prev = h1;
        }
        self.delete_chunk(h2);
    }

    fn delete_chunk(&mut self, h: ChunkHandle) {
        let ptr = self.chunks.chunk(h).ptr;
        self.region_manager.erase(ptr);
        self.chunks.deallocate_chunk(h);
    }

    fn in_use_chunk(&self, ptr: DevicePtr) -> &Chunk {
        let h = self.region_manager.get_handle(ptr);
        assert!(
            h != INVALID_CHUNK_HANDLE,
            "{}: asked about {ptr}, which was never allocated",
            self.name
        );
        let chunk = self.chunks.chunk(h);
        assert!(
            chunk.in_use(),
            "{}: asked about {ptr}, which is not in use",
            self.name
        );
        chunk
    }

    fn release_regions(&mut self, free_visitors: &[RegionVisitor]) {
        for region in self.region_manager.take_regions() {
            for visitor in free_visitors {
                visitor(region.ptr(), region.memory_size());
            }
            self.device.free_block(DeviceBlock {
                ptr: region.ptr(),
                size: region.memory_size(),
            });
        }
        self.total_region_allocated_bytes = 0;
        self.stats.bytes_reserved = 0;
    }
}

fn rounded_bytes_of_fraction(bytes: usize, factor: f64) -> usize {
    rounded_bytes((bytes as f64 * factor) as usize)
}
