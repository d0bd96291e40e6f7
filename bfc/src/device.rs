mod host;
mod simulated;

pub use host::HostDevice;
pub use simulated::{SimulatedDevice, SimulatedDeviceCounters};

use crate::config::{AllocatorConfig, DeviceKind};
use std::fmt::Display;
use std::ops::{Add, AddAssign, Sub};

/// An address in device memory. The allocator never dereferences it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const fn new(addr: u64) -> Self {
        DevicePtr(addr)
    }

    pub const fn null() -> Self {
        DevicePtr(0)
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub const fn addr(&self) -> u64 {
        self.0
    }

    pub fn is_aligned(&self, alignment: usize) -> bool {
        debug_assert!(alignment.is_power_of_two());
        self.0 & (alignment as u64 - 1) == 0
    }
}

impl From<DevicePtr> for u64 {
    fn from(ptr: DevicePtr) -> Self {
        ptr.0
    }
}

impl Display for DevicePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Add<usize> for DevicePtr {
    type Output = Self;
    fn add(self, rhs: usize) -> Self {
        DevicePtr(self.0 + rhs as u64)
    }
}

impl AddAssign<usize> for DevicePtr {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs as u64;
    }
}

impl Sub<DevicePtr> for DevicePtr {
    type Output = usize;
    fn sub(self, rhs: DevicePtr) -> usize {
        debug_assert!(rhs.0 <= self.0);
        (self.0 - rhs.0) as usize
    }
}

impl Sub<usize> for DevicePtr {
    type Output = Self;
    fn sub(self, rhs: usize) -> Self {
        DevicePtr(self.0 - rhs as u64)
    }
}

/// One contiguous extent handed out by a [`DeviceMemory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBlock {
    pub ptr: DevicePtr,
    pub size: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device {device_id} out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        device_id: usize,
        requested: usize,
        available: usize,
    },
    #[error("zero-sized device block requested")]
    ZeroSized,
    #[error("mmap failed: {0}")]
    Map(#[from] nix::Error),
    #[error("injected device failure")]
    Injected,
}

/// The memory source behind an allocator. Blocks are requested rarely and in
/// large sizes, and are only returned when the allocator is dropped.
pub trait DeviceMemory: Send {
    fn device_id(&self) -> usize;

    fn allocate_block(&mut self, num_bytes: usize) -> Result<DeviceBlock, DeviceError>;

    fn free_block(&mut self, block: DeviceBlock);
}

pub fn open_device(config: &AllocatorConfig) -> Box<dyn DeviceMemory> {
    match config.device {
        DeviceKind::Host => Box::new(HostDevice::new(
            config.device_id,
            config.huge_pages,
            config.device_capacity,
        )),
        DeviceKind::Simulated => Box::new(SimulatedDevice::new(
            config.device_id,
            config.simulated_base,
            config.device_capacity.unwrap_or(usize::MAX),
        )),
    }
}
