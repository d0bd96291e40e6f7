use crate::device::DevicePtr;

pub(super) type ChunkHandle = usize;
pub(super) const INVALID_CHUNK_HANDLE: ChunkHandle = usize::MAX;

pub(super) type BinNum = usize;
pub(super) const INVALID_BIN_NUM: BinNum = usize::MAX;

pub(super) const FREE_ALLOCATION_ID: i64 = -1;

/// A maximal contiguous span of a region, either free or handed out.
#[derive(Debug, Clone)]
pub(super) struct Chunk {
    pub(super) ptr: DevicePtr,
    pub(super) size: usize,
    /// Bytes the client asked for; only meaningful while in use.
    pub(super) requested_size: usize,
    pub(super) allocation_id: i64,
    /// Neighbours in address order within the same region.
    pub(super) prev: ChunkHandle,
    pub(super) next: ChunkHandle,
    pub(super) bin_num: BinNum,
}

impl Chunk {
    fn empty() -> Self {
        Chunk {
            ptr: DevicePtr::null(),
            size: 0,
            requested_size: 0,
            allocation_id: FREE_ALLOCATION_ID,
            prev: INVALID_CHUNK_HANDLE,
            next: INVALID_CHUNK_HANDLE,
            bin_num: INVALID_BIN_NUM,
        }
    }

    pub(super) fn in_use(&self) -> bool {
        self.allocation_id != FREE_ALLOCATION_ID
    }

    pub(super) fn debug_string(&self, chunks: &ChunkTable) -> String {
        let mut s = format!(
            "Size: {} | Requested Size: {} | in_use: {} | bin_num: {}",
            self.size,
            self.requested_size,
            self.in_use(),
            if self.bin_num == INVALID_BIN_NUM {
                -1
            } else {
                self.bin_num as i64
            }
        );
        if self.prev != INVALID_CHUNK_HANDLE {
            s += &format!(", prev: {}", chunks.chunk(self.prev).ptr);
        }
        if self.next != INVALID_CHUNK_HANDLE {
            s += &format!(", next: {}", chunks.chunk(self.next).ptr);
        }
        s
    }
}

/// Chunk records addressed by handle; released handles are threaded through
/// `next` and reused before the table grows.
#[derive(Debug)]
pub(super) struct ChunkTable {
    chunks: Vec<Chunk>,
    free_chunks_list: ChunkHandle,
    free_count: usize,
}

impl ChunkTable {
    pub(super) fn new() -> Self {
        ChunkTable {
            chunks: vec![],
            free_chunks_list: INVALID_CHUNK_HANDLE,
            free_count: 0,
        }
    }

    pub(super) fn allocate_chunk(&mut self) -> ChunkHandle {
        if self.free_chunks_list != INVALID_CHUNK_HANDLE {
            let h = self.free_chunks_list;
            self.free_chunks_list = self.chunks[h].next;
            self.free_count -= 1;
            self.chunks[h] = Chunk::empty();
            h
        } else {
            self.chunks.push(Chunk::empty());
            self.chunks.len() - 1
        }
    }

    /// The chunk must already be out of its bin and the address map.
    pub(super) fn deallocate_chunk(&mut self, h: ChunkHandle) {
        let chunk = &mut self.chunks[h];
        debug_assert!(chunk.bin_num == INVALID_BIN_NUM);
        *chunk = Chunk::empty();
        chunk.next = self.free_chunks_list;
        self.free_chunks_list = h;
        self.free_count += 1;
    }

    #[inline]
    pub(super) fn chunk(&self, h: ChunkHandle) -> &Chunk {
        &self.chunks[h]
    }

    #[inline]
    pub(super) fn chunk_mut(&mut self, h: ChunkHandle) -> &mut Chunk {
        &mut self.chunks[h]
    }

    pub(super) fn live_count(&self) -> usize {
        self.chunks.len() - self.free_count
    }

    pub(super) fn capacity(&self) -> usize {
        self.chunks.len()
    }
}
