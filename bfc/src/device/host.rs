use super::{DeviceBlock, DeviceError, DeviceMemory, DevicePtr};
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use std::{ffi::c_void, num::NonZero, ptr::NonNull};

const PAGE_SIZE: usize = 4096;
const HUGE_PAGE_SIZE: usize = 1 << 21;

/// Host memory obtained with anonymous private mappings.
#[derive(Debug)]
pub struct HostDevice {
    device_id: usize,
    huge_pages: bool,
    capacity: Option<usize>,
    mapped_bytes: usize,
}

impl HostDevice {
    pub fn new(device_id: usize, huge_pages: bool, capacity: Option<usize>) -> Self {
        HostDevice {
            device_id,
            huge_pages,
            capacity,
            mapped_bytes: 0,
        }
    }

    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }

    fn mmap_length(&self, size: usize) -> usize {
        let alignment = if self.huge_pages {
            HUGE_PAGE_SIZE
        } else {
            PAGE_SIZE
        };
        size.div_ceil(alignment) * alignment
    }

    #[cfg(target_os = "linux")]
    fn map_flags(&self) -> MapFlags {
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANON;
        if self.huge_pages {
            flags | MapFlags::MAP_HUGETLB | MapFlags::MAP_HUGE_2MB
        } else {
            flags
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn map_flags(&self) -> MapFlags {
        MapFlags::MAP_PRIVATE | MapFlags::MAP_ANON
    }
}

impl DeviceMemory for HostDevice {
    fn device_id(&self) -> usize {
        self.device_id
    }

    fn allocate_block(&mut self, num_bytes: usize) -> Result<DeviceBlock, DeviceError> {
        let length = NonZero::new(self.mmap_length(num_bytes)).ok_or(DeviceError::ZeroSized)?;
        if let Some(capacity) = self.capacity {
            if self.mapped_bytes + length.get() > capacity {
                return Err(DeviceError::OutOfMemory {
                    device_id: self.device_id,
                    requested: length.get(),
                    available: capacity.saturating_sub(self.mapped_bytes),
                });
            }
        }
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        let mem = unsafe { mmap_anonymous(None, length, prot, self.map_flags())? };
        self.mapped_bytes += length.get();
        log::debug!(
            "host device {} mapped {} bytes at {:p}",
            self.device_id,
            length,
            mem.as_ptr()
        );
        Ok(DeviceBlock {
            ptr: DevicePtr::new(mem.as_ptr() as u64),
            size: num_bytes,
        })
    }

    fn free_block(&mut self, block: DeviceBlock) {
        let length = self.mmap_length(block.size);
        let Some(ptr) = NonNull::new(block.ptr.addr() as *mut c_void) else {
            log::error!("host device {} asked to unmap null", self.device_id);
            return;
        };
        if let Err(err) = unsafe { munmap(ptr, length) } {
            log::error!(
                "host device {} failed to unmap {} bytes at {}: {err}",
                self.device_id,
                length,
                block.ptr
            );
            return;
        }
        self.mapped_bytes -= length;
    }
}
