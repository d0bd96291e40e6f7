use super::{DeviceBlock, DeviceError, DeviceMemory, DevicePtr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Gap left between consecutive blocks so no two blocks are ever adjacent.
const BLOCK_GAP: usize = 1 << 12;
/// Offset applied to blocks handed out misaligned.
const MISALIGNMENT: usize = 128;

/// Call counters of a [`SimulatedDevice`], shared so they stay readable after
/// the device has been moved into an allocator.
#[derive(Debug, Default)]
pub struct SimulatedDeviceCounters {
    allocate_calls: AtomicUsize,
    failed_calls: AtomicUsize,
    free_calls: AtomicUsize,
    live_bytes: AtomicUsize,
    failures_to_inject: AtomicUsize,
    misaligned_to_return: AtomicUsize,
}

impl SimulatedDeviceCounters {
    pub fn allocate_calls(&self) -> usize {
        self.allocate_calls.load(Ordering::Relaxed)
    }

    pub fn failed_calls(&self) -> usize {
        self.failed_calls.load(Ordering::Relaxed)
    }

    pub fn free_calls(&self) -> usize {
        self.free_calls.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Make the next `count` block requests fail regardless of capacity.
    pub fn inject_failures(&self, count: usize) {
        self.failures_to_inject.store(count, Ordering::Relaxed);
    }

    /// Make the next `count` successful block requests return a base that is
    /// only 128-byte aligned.
    pub fn misalign_blocks(&self, count: usize) {
        self.misaligned_to_return.store(count, Ordering::Relaxed);
    }

    fn take_injected_failure(&self) -> bool {
        take_one(&self.failures_to_inject)
    }

    fn take_misaligned(&self) -> bool {
        take_one(&self.misaligned_to_return)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
        .is_ok()
}

/// A device that only hands out address ranges. Nothing behind the returned
/// pointers is ever mapped, so it can model devices far larger than the host.
#[derive(Debug)]
pub struct SimulatedDevice {
    device_id: usize,
    next_addr: DevicePtr,
    capacity: usize,
    counters: Arc<SimulatedDeviceCounters>,
}

impl SimulatedDevice {
    pub fn new(device_id: usize, base: u64, capacity: usize) -> Self {
        SimulatedDevice {
            device_id,
            next_addr: DevicePtr::new(base.max(BLOCK_GAP as u64)),
            capacity,
            counters: Arc::new(SimulatedDeviceCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<SimulatedDeviceCounters> {
        self.counters.clone()
    }
}

impl DeviceMemory for SimulatedDevice {
    fn device_id(&self) -> usize {
        self.device_id
    }

    fn allocate_block(&mut self, num_bytes: usize) -> Result<DeviceBlock, DeviceError> {
        self.counters.allocate_calls.fetch_add(1, Ordering::Relaxed);
        if num_bytes == 0 {
            self.counters.failed_calls.fetch_add(1, Ordering::Relaxed);
            return Err(DeviceError::ZeroSized);
        }
        if self.counters.take_injected_failure() {
            self.counters.failed_calls.fetch_add(1, Ordering::Relaxed);
            return Err(DeviceError::Injected);
        }
        let live = self.counters.live_bytes();
        let available = self.capacity.saturating_sub(live);
        if num_bytes > available {
            self.counters.failed_calls.fetch_add(1, Ordering::Relaxed);
            return Err(DeviceError::OutOfMemory {
                device_id: self.device_id,
                requested: num_bytes,
                available,
            });
        }
        let mut ptr = self.next_addr;
        self.next_addr += num_bytes.div_ceil(BLOCK_GAP) * BLOCK_GAP + BLOCK_GAP;
        if self.counters.take_misaligned() {
            ptr += MISALIGNMENT;
        }
        self.counters
            .live_bytes
            .fetch_add(num_bytes, Ordering::Relaxed);
        log::trace!(
            "simulated device {} handed out {} bytes at {}",
            self.device_id,
            num_bytes,
            ptr
        );
        Ok(DeviceBlock {
            ptr,
            size: num_bytes,
        })
    }

    fn free_block(&mut self, block: DeviceBlock) {
        self.counters.free_calls.fetch_add(1, Ordering::Relaxed);
        self.counters
            .live_bytes
            .fetch_sub(block.size, Ordering::Relaxed);
    }
}
