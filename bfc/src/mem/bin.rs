use super::alloc_utils::{NUM_BINS, bin_num_for_size, bin_size};
use super::chunk::{BinNum, ChunkHandle, ChunkTable, INVALID_BIN_NUM};
use crate::device::DevicePtr;
use std::collections::BTreeSet;

/// Free chunks ordered by size, then address.
type FreeChunkSet = BTreeSet<(usize, DevicePtr, ChunkHandle)>;

#[derive(Debug)]
pub(super) struct Bin {
    bin_size: usize,
    free_chunks: FreeChunkSet,
}

impl Bin {
    fn new(bin_size: usize) -> Self {
        Bin {
            bin_size,
            free_chunks: BTreeSet::new(),
        }
    }

    pub(super) fn bin_size(&self) -> usize {
        self.bin_size
    }

    pub(super) fn free_chunks(&self) -> impl Iterator<Item = ChunkHandle> + '_ {
        self.free_chunks.iter().map(|&(_, _, h)| h)
    }

    pub(super) fn len(&self) -> usize {
        self.free_chunks.len()
    }
}

#[derive(Debug)]
pub(super) struct BinSet {
    bins: [Bin; NUM_BINS],
}

impl BinSet {
    pub(super) fn new() -> Self {
        BinSet {
            bins: std::array::from_fn(|b| Bin::new(bin_size(b))),
        }
    }

    pub(super) fn bin(&self, bin_num: BinNum) -> &Bin {
        &self.bins[bin_num]
    }

    pub(super) fn insert_free_chunk(&mut self, chunks: &mut ChunkTable, h: ChunkHandle) {
        let chunk = chunks.chunk_mut(h);
        debug_assert!(!chunk.in_use() && chunk.bin_num == INVALID_BIN_NUM);
        let bin_num = bin_num_for_size(chunk.size);
        chunk.bin_num = bin_num;
        let inserted = self.bins[bin_num]
            .free_chunks
            .insert((chunk.size, chunk.ptr, h));
        debug_assert!(inserted, "chunk {} already binned", chunk.ptr);
    }

    pub(super) fn remove_free_chunk(&mut self, chunks: &mut ChunkTable, h: ChunkHandle) {
        let chunk = chunks.chunk_mut(h);
        debug_assert!(!chunk.in_use() && chunk.bin_num != INVALID_BIN_NUM);
        let removed = self.bins[chunk.bin_num]
            .free_chunks
            .remove(&(chunk.size, chunk.ptr, h));
        assert!(removed, "free chunk {} missing from bin {}", chunk.ptr, chunk.bin_num);
        chunk.bin_num = INVALID_BIN_NUM;
    }

    /// Smallest free chunk of at least `rounded_bytes` in the first bin at or
    /// above `min_bin` that has one; ties go to the lowest address.
    pub(super) fn find_fit(&self, min_bin: BinNum, rounded_bytes: usize) -> Option<ChunkHandle> {
        self.bins[min_bin..].iter().find_map(|bin| {
            bin.free_chunks
                .range((rounded_bytes, DevicePtr::null(), 0)..)
                .next()
                .map(|&(_, _, h)| h)
        })
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = (BinNum, &Bin)> {
        self.bins.iter().enumerate()
    }
}
