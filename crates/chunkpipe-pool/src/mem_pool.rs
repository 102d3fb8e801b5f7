//! A pool of equally sized chunk slots with a lock-free free-list.
//!
//! # Memory Layout
//!
//! ```text
//! +-------------------------------------------------+ <- pool offset (64-aligned)
//! | MemPoolHeader (64 bytes)                        |
//! +-------------------------------------------------+ <- free_list_offset
//! | IndexList header (64) + links[chunk_count] (u32)|
//! +-------------------------------------------------+ <- chunks_offset (64-aligned)
//! | chunk 0 | chunk 1 | ... | chunk n-1             |    chunk_size bytes each
//! +-------------------------------------------------+
//! ```
//!
//! Offsets in the header are relative to the pool header itself, so a pool
//! can be reached from any of its chunks without knowing the segment base.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use shm_primitives::{IndexList, Region, RelativePointerData, SegmentId, align_up};

use crate::chunk_header::ChunkHeader;

/// Chunk slots start at multiples of this within a pool.
pub const CHUNK_MEMORY_ALIGNMENT: usize = 8;

/// Pool header (64 bytes).
#[repr(C, align(64))]
pub struct MemPoolHeader {
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub pool_index: u16,
    _pad0: u16,
    _pad1: u32,

    /// Chunks currently handed out.
    pub used_chunks: AtomicU32,
    /// Lowest number of free chunks ever observed.
    pub min_free_chunks: AtomicU32,

    /// Offset of the free-list from the pool header.
    pub free_list_offset: u64,
    /// Offset of chunk 0 from the pool header.
    pub chunks_offset: u64,

    _pad2: [u8; 24],
}

static_assertions::const_assert_eq!(size_of::<MemPoolHeader>(), 64);

/// Usage statistics of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemPoolInfo {
    pub used_chunks: u32,
    pub min_free_chunks: u32,
    pub num_chunks: u32,
    pub chunk_size: u32,
}

/// A view of a pool living in shared memory.
#[derive(Clone, Copy)]
pub struct MemPool {
    header: NonNull<MemPoolHeader>,
}

// SAFETY: all shared state in the pool is accessed through atomics.
unsafe impl Send for MemPool {}
unsafe impl Sync for MemPool {}

impl MemPool {
    fn free_list_offset() -> usize {
        size_of::<MemPoolHeader>()
    }

    fn chunks_offset(chunk_count: u32) -> usize {
        align_up(
            Self::free_list_offset() + IndexList::required_size(chunk_count),
            64,
        )
    }

    /// Bytes a pool of `chunk_count` chunks of `chunk_size` occupies, or
    /// `None` on overflow.
    pub fn required_size(chunk_size: u32, chunk_count: u32) -> Option<usize> {
        let chunks = (chunk_size as usize).checked_mul(chunk_count as usize)?;
        let total = Self::chunks_offset(chunk_count).checked_add(chunks)?;
        Some(align_up(total, 64))
    }

    /// Initialize a pool at `offset` in a segment region and stamp every slot.
    ///
    /// `region` must be the whole segment registered under `segment_id`, so
    /// region offsets are segment offsets.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during initialization.
    pub unsafe fn init(
        region: Region,
        offset: usize,
        segment_id: SegmentId,
        pool_index: u16,
        chunk_size: u32,
        chunk_count: u32,
    ) -> Self {
        assert!(offset.is_multiple_of(64), "pool offset must be 64-byte aligned");
        assert!(
            chunk_size as usize >= size_of::<ChunkHeader>()
                && (chunk_size as usize).is_multiple_of(CHUNK_MEMORY_ALIGNMENT),
            "invalid chunk size {chunk_size}"
        );
        assert!(chunk_count > 0, "chunk_count must be > 0");
        let required = MemPool::required_size(chunk_size, chunk_count);
        assert!(
            required.is_some_and(|r| offset + r <= region.len()),
            "region too small for pool"
        );

        let free_list_offset = Self::free_list_offset();
        let chunks_offset = Self::chunks_offset(chunk_count);

        let header = unsafe { region.get_mut::<MemPoolHeader>(offset) };
        header.chunk_size = chunk_size;
        header.chunk_count = chunk_count;
        header.pool_index = pool_index;
        header._pad0 = 0;
        header._pad1 = 0;
        header.used_chunks = AtomicU32::new(0);
        header.min_free_chunks = AtomicU32::new(chunk_count);
        header.free_list_offset = free_list_offset as u64;
        header.chunks_offset = chunks_offset as u64;
        header._pad2 = [0; 24];

        unsafe { IndexList::init(region, offset + free_list_offset, chunk_count) };

        for slot in 0..chunk_count {
            let chunk_offset = offset + chunks_offset + slot as usize * chunk_size as usize;
            let self_ref = RelativePointerData::new(segment_id, chunk_offset as u64)
                .unwrap_or(RelativePointerData::NULL);
            let chunk = unsafe { region.offset(chunk_offset) } as *mut ChunkHeader;
            unsafe {
                ChunkHeader::init_slot(
                    chunk,
                    chunk_size,
                    pool_index,
                    slot,
                    -((chunk_offset - offset) as i64),
                    self_ref,
                )
            };
        }

        Self {
            header: NonNull::from(header),
        }
    }

    /// Build a view from a pointer to an initialized pool header.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a pool initialized with [`MemPool::init`] that
    /// stays mapped while the view is used.
    #[inline]
    pub unsafe fn from_header_ptr(ptr: *const u8) -> Self {
        debug_assert!(!ptr.is_null());
        Self {
            header: unsafe { NonNull::new_unchecked(ptr as *mut MemPoolHeader) },
        }
    }

    #[inline]
    fn header(&self) -> &MemPoolHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.header.as_ptr() as *mut u8
    }

    #[inline]
    fn free_list(&self) -> IndexList {
        let offset = self.header().free_list_offset as usize;
        unsafe { IndexList::from_raw(self.base().add(offset).cast()) }
    }

    /// Header of slot `slot_index`.
    #[inline]
    pub fn chunk_ptr(&self, slot_index: u32) -> NonNull<ChunkHeader> {
        let header = self.header();
        debug_assert!(slot_index < header.chunk_count);
        let offset = header.chunks_offset as usize + slot_index as usize * header.chunk_size as usize;
        unsafe { NonNull::new_unchecked(self.base().add(offset).cast()) }
    }

    /// Pop a free slot. Never blocks.
    pub fn allocate(&self) -> Option<NonNull<ChunkHeader>> {
        let slot = self.free_list().pop()?;
        let header = self.header();
        let used = header.used_chunks.fetch_add(1, Ordering::Relaxed) + 1;
        header
            .min_free_chunks
            .fetch_min(header.chunk_count.saturating_sub(used), Ordering::Relaxed);
        Some(self.chunk_ptr(slot))
    }

    /// Return slot `slot_index` to the free-list.
    ///
    /// Called by the last [`ChunkHeader::release`]; freeing a slot twice
    /// corrupts the pool.
    pub fn free(&self, slot_index: u32) {
        let header = self.header();
        debug_assert!(slot_index < header.chunk_count, "slot {slot_index} out of range");
        header.used_chunks.fetch_sub(1, Ordering::Relaxed);
        self.free_list().push(slot_index);
    }

    #[inline]
    pub fn chunk_size(&self) -> u32 {
        self.header().chunk_size
    }

    #[inline]
    pub fn chunk_count(&self) -> u32 {
        self.header().chunk_count
    }

    #[inline]
    pub fn pool_index(&self) -> u16 {
        self.header().pool_index
    }

    pub fn info(&self) -> MemPoolInfo {
        let header = self.header();
        MemPoolInfo {
            used_chunks: header.used_chunks.load(Ordering::Relaxed),
            min_free_chunks: header.min_free_chunks.load(Ordering::Relaxed),
            num_chunks: header.chunk_count,
            chunk_size: header.chunk_size,
        }
    }
}

impl std::fmt::Debug for MemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemPool")
            .field("pool_index", &self.pool_index())
            .field("info", &self.info())
            .finish()
    }
}
