use super::alloc_utils::{NUM_BINS, bin_num_for_size, human_readable_num_bytes};
use super::allocator::BfcInner;
use super::chunk::{Chunk, INVALID_CHUNK_HANDLE};
use crate::device::DevicePtr;
use log::info;
use std::collections::BTreeMap;

const OCCUPANCY_RESOLUTION: usize = 100;

/// Totals over every chunk whose size maps to one bin, free or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct BinDebugInfo {
    pub(super) total_bytes_in_use: usize,
    pub(super) total_bytes_in_bin: usize,
    pub(super) total_requested_bytes_in_use: usize,
    pub(super) total_chunks_in_use: usize,
    pub(super) total_chunks_in_bin: usize,
}

/// Paints `c` over the characters covering `[ptr, ptr + size)` of a region
/// that starts `offset` bytes into the rendered space.
fn render_region(
    rendered: &mut [u8],
    total_render_size: usize,
    offset: usize,
    base_ptr: DevicePtr,
    ptr: DevicePtr,
    size: usize,
    c: u8,
) {
    if size == 0 {
        return;
    }
    let resolution = rendered.len();
    let start = (ptr - base_ptr) + offset;
    let start_location = start * resolution / total_render_size;
    let end_location = (start + size - 1) * resolution / total_render_size;
    debug_assert!(end_location < resolution);
    rendered[start_location..=end_location].fill(c);
}

impl BfcInner {
    /// Visits every chunk of every region in address order.
    fn for_each_chunk(&self, mut f: impl FnMut(&Chunk)) {
        for region in self.region_manager.regions() {
            let mut h = self.region_manager.get_handle(region.ptr());
            while h != INVALID_CHUNK_HANDLE {
                let chunk = self.chunks.chunk(h);
                f(chunk);
                h = chunk.next;
            }
        }
    }

    pub(super) fn bin_debug_info(&self) -> [BinDebugInfo; NUM_BINS] {
        let mut infos = [BinDebugInfo::default(); NUM_BINS];
        self.for_each_chunk(|chunk| {
            let info = &mut infos[bin_num_for_size(chunk.size)];
            info.total_bytes_in_bin += chunk.size;
            info.total_chunks_in_bin += 1;
            if chunk.in_use() {
                info.total_bytes_in_use += chunk.size;
                info.total_requested_bytes_in_use += chunk.requested_size;
                info.total_chunks_in_use += 1;
            }
        });
        infos
    }

    pub(super) fn render_occupancy(&self) -> String {
        let total_region_size = self.region_manager.total_bytes();
        if total_region_size == 0 {
            return "<allocator contains no memory>".to_string();
        }
        let mut rendered = vec![b'_'; OCCUPANCY_RESOLUTION];
        let mut region_offset = 0;
        for region in self.region_manager.regions() {
            let mut h = self.region_manager.get_handle(region.ptr());
            while h != INVALID_CHUNK_HANDLE {
                let chunk = self.chunks.chunk(h);
                if chunk.in_use() {
                    let wasted = chunk.size - chunk.requested_size;
                    render_region(
                        &mut rendered,
                        total_region_size,
                        region_offset,
                        region.ptr(),
                        chunk.ptr + chunk.requested_size,
                        wasted,
                        b'x',
                    );
                    render_region(
                        &mut rendered,
                        total_region_size,
                        region_offset,
                        region.ptr(),
                        chunk.ptr,
                        chunk.requested_size,
                        b'*',
                    );
                }
                h = chunk.next;
            }
            region_offset += region.memory_size();
        }
        rendered.into_iter().map(char::from).collect()
    }

    pub(super) fn dump_memory_log(&self, rounded_bytes: usize) {
        let infos = self.bin_debug_info();
        for (bin_num, bin) in self.bins.iter() {
            let info = &infos[bin_num];
            info!(
                "Bin ({}): \tTotal Chunks: {}, Chunks in use: {}, Free in bin: {}. \
                 {} allocated for chunks. {} in use in bin. {} client-requested in use in bin.",
                bin.bin_size(),
                info.total_chunks_in_bin,
                info.total_chunks_in_use,
                bin.len(),
                human_readable_num_bytes(info.total_bytes_in_bin),
                human_readable_num_bytes(info.total_bytes_in_use),
                human_readable_num_bytes(info.total_requested_bytes_in_use)
            );
        }

        let bin_num = bin_num_for_size(rounded_bytes);
        let bin = self.bins.bin(bin_num);
        info!(
            "Bin for {} was {}, Chunk State: ",
            human_readable_num_bytes(rounded_bytes),
            human_readable_num_bytes(bin.bin_size())
        );
        for h in bin.free_chunks() {
            info!("  {}", self.chunks.chunk(h).debug_string(&self.chunks));
        }

        info!("Next region of size {}", self.curr_region_allocation_bytes);
        info!(
            "{} chunk records, {} live",
            self.chunks.capacity(),
            self.chunks.live_count()
        );
        for region in self.region_manager.regions() {
            let mut h = self.region_manager.get_handle(region.ptr());
            while h != INVALID_CHUNK_HANDLE {
                let chunk = self.chunks.chunk(h);
                info!(
                    "{} Chunk at {} of size {}{}",
                    if chunk.in_use() { "InUse" } else { "Free " },
                    chunk.ptr,
                    chunk.size,
                    if chunk.in_use() {
                        format!(
                            " by op with id {} with requested size {}",
                            chunk.allocation_id, chunk.requested_size
                        )
                    } else {
                        String::new()
                    }
                );
                h = chunk.next;
            }
        }

        info!("     Summary of in-use Chunks by size: ");
        let mut in_use_by_size: BTreeMap<usize, usize> = BTreeMap::new();
        self.for_each_chunk(|chunk| {
            if chunk.in_use() {
                *in_use_by_size.entry(chunk.size).or_default() += 1;
            }
        });
        let mut total_bytes = 0;
        for (size, count) in in_use_by_size {
            info!(
                "{} Chunks of size {} totalling {}",
                count,
                size,
                human_readable_num_bytes(size * count)
            );
            total_bytes += size * count;
        }
        info!(
            "Sum Total of in-use chunks: {}",
            human_readable_num_bytes(total_bytes)
        );
        info!(
            "Total bytes in pool: {} memory limit: {} available bytes: {} \
             next region size: {}",
            self.stats.bytes_reserved,
            self.memory_limit,
            self.memory_limit.saturating_sub(self.stats.bytes_reserved),
            self.curr_region_allocation_bytes
        );
        info!("Stats: \n{}", self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::device::SimulatedDevice;
    use crate::mem::BfcAllocator;

    const KB: usize = 1 << 10;
    const MB: usize = 1 << 20;

    fn allocator(memory_limit: usize, initial_region_size: usize) -> BfcAllocator {
        let config = AllocatorConfig {
            memory_limit,
            initial_region_size,
            retry_timeout_ms: 0,
            ..AllocatorConfig::default()
        };
        BfcAllocator::new(Box::new(SimulatedDevice::new(0, 1 << 32, usize::MAX)), &config)
    }

    #[test]
    fn render_region_covers_inclusive_range() {
        let mut rendered = vec![b'_'; 10];
        let base = DevicePtr::new(0x1000);
        render_region(&mut rendered, 1000, 0, base, base + 100usize, 200, b'*');
        assert_eq!(&rendered, b"_**_______");
        render_region(&mut rendered, 1000, 500, base, base, 1, b'x');
        assert_eq!(&rendered, b"_**__x____");
        render_region(&mut rendered, 1000, 0, base, base, 0, b'x');
        assert_eq!(&rendered, b"_**__x____");
    }

    #[test]
    fn empty_allocator_renders_placeholder() {
        let alloc = allocator(MB, MB);
        assert_eq!(alloc.render_occupancy(), "<allocator contains no memory>");
    }

    #[test]
    fn small_allocation_occupies_one_character() {
        let alloc = allocator(MB, MB);
        let p = alloc.allocate_raw(256, 100).unwrap();
        let expected = format!("*{}", "_".repeat(99));
        assert_eq!(alloc.render_occupancy(), expected);
        alloc.deallocate_raw(p);
        assert_eq!(alloc.render_occupancy(), "_".repeat(100));
    }

    #[test]
    fn half_region_renders_half_bar() {
        let alloc = allocator(MB, MB);
        let p = alloc.allocate_raw(256, 512 * KB).unwrap();
        let rendered = alloc.render_occupancy();
        assert_eq!(rendered.len(), 100);
        assert_eq!(rendered, format!("{}{}", "*".repeat(50), "_".repeat(50)));
        alloc.deallocate_raw(p);
    }

    #[test]
    fn waste_renders_as_x() {
        // 128 bytes per character
        let alloc = allocator(12800, 12800);
        let p = alloc.allocate_raw(256, 128).unwrap();
        let q = alloc.allocate_raw(256, 256).unwrap();
        let rendered = alloc.render_occupancy();
        assert_eq!(&rendered[..4], "*x**");
        assert!(rendered[4..].chars().all(|c| c == '_'));
        alloc.deallocate_raw(p);
        alloc.deallocate_raw(q);
    }

    #[test]
    fn occupancy_spans_all_regions() {
        let alloc = allocator(4 * MB, MB);
        let a = alloc.allocate_raw(256, MB).unwrap();
        let b = alloc.allocate_raw(256, 2 * MB).unwrap();
        // one region of 1M full, one of 2M full
        assert_eq!(alloc.get_stats().bytes_reserved, 3 * MB);
        assert_eq!(alloc.render_occupancy(), "*".repeat(100));
        alloc.deallocate_raw(a);
        let rendered = alloc.render_occupancy();
        assert_eq!(rendered.chars().filter(|&c| c == '_').count(), 33);
        alloc.deallocate_raw(b);
    }

    #[test]
    fn bin_debug_info_counts_every_chunk() {
        let alloc = allocator(MB, MB);
        let a = alloc.allocate_raw(256, 300).unwrap();
        let _b = alloc.allocate_raw(256, 1000).unwrap();
        alloc.deallocate_raw(a);
        let inner = alloc.lock();
        let infos = inner.bin_debug_info();
        // bin 1: the freed 512 byte chunk
        assert_eq!(infos[1].total_chunks_in_bin, 1);
        assert_eq!(infos[1].total_chunks_in_use, 0);
        // the live 1024 byte chunk
        assert_eq!(infos[2].total_chunks_in_use, 1);
        assert_eq!(infos[2].total_bytes_in_use, 1024);
        assert_eq!(infos[2].total_requested_bytes_in_use, 1000);
        let total: usize = infos.iter().map(|i| i.total_bytes_in_bin).sum();
        assert_eq!(total, MB);
        let chunks: usize = infos.iter().map(|i| i.total_chunks_in_bin).sum();
        assert_eq!(chunks, 3);
    }

    #[test]
    fn dump_walks_every_region() {
        let _ = pretty_env_logger::try_init();
        let alloc = allocator(4 * MB, MB);
        let a = alloc.allocate_raw(256, 100).unwrap();
        let _b = alloc.allocate_raw(256, 2 * MB).unwrap();
        alloc.deallocate_raw(a);
        alloc.dump_memory_log(3 * MB);
        alloc.dump_memory_log(0);
    }
}
