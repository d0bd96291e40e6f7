use super::alloc_utils::{MIN_ALLOCATION_BITS, MIN_ALLOCATION_SIZE};
use super::chunk::{ChunkHandle, INVALID_CHUNK_HANDLE};
use crate::device::DevicePtr;

/// One extent obtained from the device, with a handle slot per granule so any
/// chunk start inside it resolves in O(1).
#[derive(Debug)]
pub(super) struct AllocationRegion {
    ptr: DevicePtr,
    memory_size: usize,
    end_ptr: DevicePtr,
    handles: Box<[ChunkHandle]>,
}

impl AllocationRegion {
    fn new(ptr: DevicePtr, memory_size: usize) -> Self {
        assert!(
            memory_size % MIN_ALLOCATION_SIZE == 0,
            "region size {memory_size} is not a multiple of {MIN_ALLOCATION_SIZE}"
        );
        let n_handles = memory_size >> MIN_ALLOCATION_BITS;
        AllocationRegion {
            ptr,
            memory_size,
            end_ptr: ptr + memory_size,
            handles: vec![INVALID_CHUNK_HANDLE; n_handles].into_boxed_slice(),
        }
    }

    pub(super) fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub(super) fn end_ptr(&self) -> DevicePtr {
        self.end_ptr
    }

    pub(super) fn memory_size(&self) -> usize {
        self.memory_size
    }

    fn index_for(&self, p: DevicePtr) -> usize {
        assert!(
            p >= self.ptr && p < self.end_ptr,
            "{p} outside region [{}, {})",
            self.ptr,
            self.end_ptr
        );
        (p - self.ptr) >> MIN_ALLOCATION_BITS
    }

    fn set_handle(&mut self, p: DevicePtr, h: ChunkHandle) {
        let index = self.index_for(p);
        self.handles[index] = h;
    }

    fn get_handle(&self, p: DevicePtr) -> ChunkHandle {
        self.handles[self.index_for(p)]
    }

    fn erase(&mut self, p: DevicePtr) {
        self.set_handle(p, INVALID_CHUNK_HANDLE);
    }
}

/// Regions sorted by end address; lookups binary search for the region
/// containing an address.
#[derive(Debug, Default)]
pub(super) struct RegionManager {
    regions: Vec<AllocationRegion>,
}

impl RegionManager {
    pub(super) fn new() -> Self {
        RegionManager { regions: vec![] }
    }

    pub(super) fn add_allocation_region(&mut self, ptr: DevicePtr, memory_size: usize) {
        let region = AllocationRegion::new(ptr, memory_size);
        let idx = self
            .regions
            .partition_point(|r| r.end_ptr() <= region.end_ptr());
        debug_assert!(
            self.regions
                .get(idx)
                .is_none_or(|next| region.end_ptr() <= next.ptr()),
            "region at {ptr} overlaps an existing region"
        );
        self.regions.insert(idx, region);
    }

    pub(super) fn regions(&self) -> &[AllocationRegion] {
        &self.regions
    }

    pub(super) fn total_bytes(&self) -> usize {
        self.regions.iter().map(|r| r.memory_size()).sum()
    }

    fn region_index(&self, p: DevicePtr) -> Option<usize> {
        let idx = self.regions.partition_point(|r| r.end_ptr() <= p);
        (idx < self.regions.len() && self.regions[idx].ptr() <= p).then_some(idx)
    }

    fn region_for(&self, p: DevicePtr) -> &AllocationRegion {
        match self.region_index(p) {
            Some(idx) => &self.regions[idx],
            None => panic!("could not find region for {p}"),
        }
    }

    fn region_for_mut(&mut self, p: DevicePtr) -> &mut AllocationRegion {
        match self.region_index(p) {
            Some(idx) => &mut self.regions[idx],
            None => panic!("could not find region for {p}"),
        }
    }

    pub(super) fn set_handle(&mut self, p: DevicePtr, h: ChunkHandle) {
        self.region_for_mut(p).set_handle(p, h);
    }

    pub(super) fn erase(&mut self, p: DevicePtr) {
        self.region_for_mut(p).erase(p);
    }

    /// Handle of the chunk starting at `p`, or the invalid handle when `p`
    /// lies inside a region but does not start a chunk.
    pub(super) fn get_handle(&self, p: DevicePtr) -> ChunkHandle {
        self.region_for(p).get_handle(p)
    }

    pub(super) fn take_regions(&mut self) -> Vec<AllocationRegion> {
        std::mem::take(&mut self.regions)
    }
}
