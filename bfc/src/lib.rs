//! A best-fit-with-coalescing allocator for device memory.
//!
//! The allocator obtains large regions from a [`device::DeviceMemory`] and
//! carves them into 256-byte-granular chunks. Free chunks live in
//! power-of-two size bins; freed chunks merge with free neighbours.

pub mod config;
pub mod device;
pub mod mem;

pub use config::{AllocatorConfig, ConfigError, DeviceKind};
pub use device::{DeviceBlock, DeviceError, DeviceMemory, DevicePtr};
pub use mem::{AllocationAttributes, AllocatorStats, BfcAllocator, MIN_ALLOCATION_SIZE};

/// Opens the device named by `config` and builds an allocator over it.
pub fn initialize(config: &AllocatorConfig) -> BfcAllocator {
    BfcAllocator::new(device::open_device(config), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn initialize_simulated() {
        let config = AllocatorConfig::from_toml_str(
            r#"
            name = "gpu0_bfc"
            device = "simulated"
            memory_limit = 4194304
            initial_region_size = 1048576
            "#,
        )
        .unwrap();
        let alloc = initialize(&config);
        assert_eq!(alloc.name(), "gpu0_bfc");
        let p = alloc.allocate_raw(MIN_ALLOCATION_SIZE, 1000).unwrap();
        assert!(p.is_aligned(MIN_ALLOCATION_SIZE));
        assert_eq!(alloc.get_stats().bytes_reserved, 1 << 20);
        assert_eq!(alloc.get_stats().bytes_limit, 4 << 20);
        alloc.deallocate_raw(p);
    }

    #[test]
    #[serial]
    fn host_backed_allocations_are_writable() {
        let config = AllocatorConfig {
            device: DeviceKind::Host,
            memory_limit: 8 << 20,
            initial_region_size: 2 << 20,
            ..AllocatorConfig::default()
        };
        let alloc = initialize(&config);
        let ptrs: Vec<_> = (1..=8)
            .map(|i| alloc.allocate_raw(MIN_ALLOCATION_SIZE, i * 1000).unwrap())
            .collect();
        for (i, &p) in ptrs.iter().enumerate() {
            let len = alloc.requested_size(p);
            let bytes = unsafe { std::slice::from_raw_parts_mut(p.addr() as *mut u8, len) };
            bytes.fill(i as u8);
        }
        for (i, &p) in ptrs.iter().enumerate() {
            let len = alloc.requested_size(p);
            let bytes = unsafe { std::slice::from_raw_parts(p.addr() as *const u8, len) };
            assert!(bytes.iter().all(|&b| b == i as u8));
        }
        for p in ptrs {
            alloc.deallocate_raw(p);
        }
        assert_eq!(alloc.get_stats().bytes_in_use, 0);
    }
}
