//! The header at the start of every chunk.
//!
//! # Chunk Layout
//!
//! ```text
//! +---------------------------+ <- chunk start (slot start)
//! | ChunkHeader (64 bytes)    |    last field: user_payload_offset (u32)
//! +---------------------------+
//! | padding (only if the      |    last 4 bytes: back-offset to the header
//! | payload needs > 8 align)  |
//! +---------------------------+ <- chunk start + user_payload_offset
//! | user payload              |
//! +---------------------------+
//! ```
//!
//! The four bytes right before the payload always hold the distance back to
//! the header, so [`ChunkHeader::from_payload`] works for any alignment.

use std::fmt;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicU32, Ordering};

use shm_primitives::RelativePointerData;

use crate::mem_pool::MemPool;

/// Layout version stamped into every header.
pub const CHUNK_HEADER_VERSION: u8 = 1;

/// Payload alignment used when the caller does not ask for one.
pub const CHUNK_DEFAULT_PAYLOAD_ALIGNMENT: u32 = 8;

/// Largest chunk a pool can hold.
pub const MAX_CHUNK_SIZE: u32 = u32::MAX;

/// Header of a chunk (64 bytes).
///
/// Slot-constant fields (`chunk_size`, `pool_index`, `slot_index`,
/// `pool_header_offset`, `self_ref`) are written once when the pool is
/// created. Payload fields are written by the allocating side while it holds
/// the only reference.
#[repr(C, align(8))]
pub struct ChunkHeader {
    /// Size of the whole slot, header included.
    pub chunk_size: u32,
    /// Layout version.
    pub version: u8,
    _reserved0: u8,
    /// Index of the pool in its memory manager.
    pub pool_index: u16,

    pub user_payload_size: u32,
    pub user_payload_alignment: u32,

    /// Index of the slot inside its pool.
    pub slot_index: u32,
    reference_count: AtomicU32,

    /// Signed byte distance from this header to its pool header.
    pub pool_header_offset: i64,
    /// Relative pointer to this header, as packed `RelativePointerData`.
    pub self_ref: u64,

    /// Id of the sending port.
    pub origin_id: u64,
    /// Per-sender sequence number.
    pub sequence_number: u64,

    _reserved1: u32,
    /// Distance from the header start to the payload. Must stay the last
    /// field: it doubles as the back-offset when there is no padding.
    pub user_payload_offset: u32,
}

static_assertions::const_assert_eq!(size_of::<ChunkHeader>(), 64);
static_assertions::const_assert_eq!(align_of::<ChunkHeader>(), 8);
static_assertions::const_assert_eq!(std::mem::offset_of!(ChunkHeader, user_payload_offset), 60);

impl ChunkHeader {
    /// Stamp the slot-constant fields of a fresh slot.
    ///
    /// # Safety
    ///
    /// `this` must point to writable, 8-aligned memory of at least
    /// `chunk_size` bytes that nothing else accesses.
    pub(crate) unsafe fn init_slot(
        this: *mut ChunkHeader,
        chunk_size: u32,
        pool_index: u16,
        slot_index: u32,
        pool_header_offset: i64,
        self_ref: RelativePointerData,
    ) {
        let header_size = size_of::<ChunkHeader>() as u32;
        unsafe {
            this.write(ChunkHeader {
                chunk_size,
                version: CHUNK_HEADER_VERSION,
                _reserved0: 0,
                pool_index,
                user_payload_size: chunk_size - header_size,
                user_payload_alignment: CHUNK_DEFAULT_PAYLOAD_ALIGNMENT,
                slot_index,
                reference_count: AtomicU32::new(0),
                pool_header_offset,
                self_ref: self_ref.to_raw(),
                origin_id: 0,
                sequence_number: 0,
                _reserved1: 0,
                user_payload_offset: header_size,
            })
        };
    }

    /// Prepare a freshly popped slot for `settings`: place the payload,
    /// write the back-offset and set the reference count to 1.
    ///
    /// # Safety
    ///
    /// The caller must own the slot exclusively (it was just popped from the
    /// pool's free-list) and `settings` must fit `chunk_size`.
    pub(crate) unsafe fn prepare(this: *mut ChunkHeader, settings: &ChunkSettings) {
        let header = unsafe { &mut *this };
        debug_assert!(settings.required_chunk_size() <= header.chunk_size);

        let header_addr = this as usize;
        let header_size = size_of::<ChunkHeader>();
        let alignment = settings.payload_alignment() as usize;
        let payload_addr = (header_addr + header_size).next_multiple_of(alignment);
        let payload_offset = (payload_addr - header_addr) as u32;

        header.user_payload_size = settings.payload_size();
        header.user_payload_alignment = settings.payload_alignment();
        header.user_payload_offset = payload_offset;
        header.origin_id = 0;
        header.sequence_number = 0;
        if payload_offset as usize != header_size {
            // SAFETY: padding is a multiple of 8 bytes, so these 4 bytes lie
            // inside it.
            unsafe { ((payload_addr - size_of::<u32>()) as *mut u32).write(payload_offset) };
        }
        header.reference_count.store(1, Ordering::Relaxed);
    }

    /// Recover the header from a payload pointer handed out by this crate.
    ///
    /// # Safety
    ///
    /// `payload` must be the payload pointer of a live chunk.
    pub unsafe fn from_payload(payload: *const u8) -> *const ChunkHeader {
        let back_offset = unsafe { (payload.sub(size_of::<u32>()) as *const u32).read() };
        unsafe { payload.sub(back_offset as usize) as *const ChunkHeader }
    }

    /// Pointer to the payload.
    #[inline]
    pub fn payload_ptr(&self) -> *mut u8 {
        let base = self as *const ChunkHeader as *mut u8;
        // SAFETY: the offset stays inside the chunk.
        unsafe { base.add(self.user_payload_offset as usize) }
    }

    /// This header as a relative pointer.
    #[inline]
    pub fn relative(&self) -> RelativePointerData {
        RelativePointerData::from_raw(self.self_ref)
    }

    #[inline]
    pub fn reference_count(&self) -> u32 {
        self.reference_count.load(Ordering::Acquire)
    }

    /// Register one more holder.
    ///
    /// # Safety
    ///
    /// The caller must already hold a reference, and the new reference must
    /// eventually be passed to [`release`](Self::release) exactly once.
    #[inline]
    pub unsafe fn add_reference(&self) {
        // Publication through a queue orders this increment.
        let previous = self.reference_count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "add_reference on a free chunk");
    }

    /// Drop one reference. The release that takes the count to zero returns
    /// the slot to its pool.
    ///
    /// # Safety
    ///
    /// The caller must hold a reference and must not touch the chunk after
    /// this call. Releasing more references than were taken is undefined.
    pub unsafe fn release(&self) {
        let previous = self.reference_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "chunk released more often than referenced");
        if previous == 1 {
            let this = self as *const ChunkHeader as *const u8;
            // SAFETY: the offset was written at pool creation and points at
            // the pool header of this slot.
            let pool = unsafe { MemPool::from_header_ptr(this.offset(self.pool_header_offset as isize)) };
            pool.free(self.slot_index);
        }
    }
}

impl fmt::Debug for ChunkHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkHeader")
            .field("chunk_size", &self.chunk_size)
            .field("pool_index", &self.pool_index)
            .field("slot_index", &self.slot_index)
            .field("user_payload_size", &self.user_payload_size)
            .field("user_payload_alignment", &self.user_payload_alignment)
            .field("user_payload_offset", &self.user_payload_offset)
            .field("reference_count", &self.reference_count())
            .field("origin_id", &self.origin_id)
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

// =============================================================================
// Chunk settings
// =============================================================================

/// Payload requirements of an allocation and the chunk size they need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSettings {
    payload_size: u32,
    payload_alignment: u32,
    required_chunk_size: u32,
}

impl ChunkSettings {
    /// Compute the chunk size for `payload_size` bytes aligned to
    /// `payload_alignment` (a power of two).
    ///
    /// The size covers the worst case placement of the header, so the payload
    /// fits wherever the slot starts.
    pub fn new(payload_size: u32, payload_alignment: u32) -> Result<Self, ChunkSettingsError> {
        if !payload_alignment.is_power_of_two() {
            return Err(ChunkSettingsError::AlignmentNotPowerOfTwo {
                alignment: payload_alignment,
            });
        }

        let header_size = size_of::<ChunkHeader>() as u64;
        let header_alignment = align_of::<ChunkHeader>() as u64;
        let alignment = payload_alignment as u64;

        let required = if alignment <= header_alignment {
            header_size + payload_size as u64
        } else {
            let overhang = header_size - header_alignment;
            overhang + alignment + payload_size as u64
        };

        if required > MAX_CHUNK_SIZE as u64 {
            return Err(ChunkSettingsError::RequiredChunkSizeTooLarge { required });
        }

        Ok(Self {
            payload_size,
            payload_alignment,
            required_chunk_size: required as u32,
        })
    }

    /// Settings with the default payload alignment.
    pub fn with_default_alignment(payload_size: u32) -> Result<Self, ChunkSettingsError> {
        Self::new(payload_size, CHUNK_DEFAULT_PAYLOAD_ALIGNMENT)
    }

    #[inline]
    pub fn payload_size(&self) -> u32 {
        self.payload_size
    }

    #[inline]
    pub fn payload_alignment(&self) -> u32 {
        self.payload_alignment
    }

    #[inline]
    pub fn required_chunk_size(&self) -> u32 {
        self.required_chunk_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSettingsError {
    AlignmentNotPowerOfTwo { alignment: u32 },
    RequiredChunkSizeTooLarge { required: u64 },
}

impl fmt::Display for ChunkSettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlignmentNotPowerOfTwo { alignment } => {
                write!(f, "payload alignment {alignment} is not a power of two")
            }
            Self::RequiredChunkSizeTooLarge { required } => {
                write!(f, "required chunk size {required} exceeds {MAX_CHUNK_SIZE}")
            }
        }
    }
}

impl std::error::Error for ChunkSettingsError {}
