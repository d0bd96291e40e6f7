use std::fmt::Display;

/// Cumulative allocator counters. Returned by value as a consistent snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub num_allocs: u64,
    pub bytes_in_use: usize,
    pub peak_bytes_in_use: usize,
    pub largest_alloc_size: usize,
    pub bytes_limit: usize,
    /// Bytes currently obtained from the device.
    pub bytes_reserved: usize,
}

impl AllocatorStats {
    pub(super) fn new(bytes_limit: usize) -> Self {
        AllocatorStats {
            bytes_limit,
            ..Default::default()
        }
    }

    pub(super) fn record_allocation(&mut self, chunk_size: usize) {
        self.num_allocs += 1;
        self.bytes_in_use += chunk_size;
        self.peak_bytes_in_use = self.peak_bytes_in_use.max(self.bytes_in_use);
        self.largest_alloc_size = self.largest_alloc_size.max(chunk_size);
    }

    pub(super) fn record_free(&mut self, chunk_size: usize) {
        debug_assert!(self.bytes_in_use >= chunk_size);
        self.bytes_in_use -= chunk_size;
    }

    pub(super) fn clear(&mut self) {
        self.num_allocs = 0;
        self.peak_bytes_in_use = self.bytes_in_use;
        self.largest_alloc_size = 0;
    }
}

impl Display for AllocatorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Limit:        {:>20}", self.bytes_limit)?;
        writeln!(f, "InUse:        {:>20}", self.bytes_in_use)?;
        writeln!(f, "MaxInUse:     {:>20}", self.peak_bytes_in_use)?;
        writeln!(f, "NumAllocs:    {:>20}", self.num_allocs)?;
        writeln!(f, "MaxAllocSize: {:>20}", self.largest_alloc_size)?;
        write!(f, "Reserved:     {:>20}", self.bytes_reserved)
    }
}
