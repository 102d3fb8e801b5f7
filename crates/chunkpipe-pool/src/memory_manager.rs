//! Segregated pools: one [`MemPool`] per configured size class.
//!
//! # Memory Layout
//!
//! ```text
//! +-----------------------------------------+ <- manager offset (64-aligned)
//! | MemoryManagerHeader (320 bytes)         |
//! |   magic "CPMEPOO\0", version, pool count|
//! |   pool_offsets[MAX_NUMBER_OF_MEMPOOLS]  |
//! +-----------------------------------------+
//! | pool 0 (smallest chunks)                |
//! +-----------------------------------------+
//! | pool 1                                  |
//! +-----------------------------------------+
//! | ...                                     |
//! +-----------------------------------------+
//! ```
//!
//! Allocation picks the smallest pool whose chunks fit the request and never
//! falls back to a larger one: a drained size class reports
//! [`AllocationError::RunningOutOfChunks`] even if bigger chunks are free.

use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;

use shm_primitives::{Region, SegmentId, SegmentOwner, align_up};

use crate::chunk_header::{CHUNK_DEFAULT_PAYLOAD_ALIGNMENT, ChunkHeader, ChunkSettings, ChunkSettingsError};
use crate::config::{MAX_NUMBER_OF_MEMPOOLS, MePooConfig, MePooConfigError};
use crate::mem_pool::{MemPool, MemPoolInfo};
use crate::shared_chunk::SharedChunk;

/// Magic bytes identifying a memory manager area.
pub const MEMORY_MANAGER_MAGIC: [u8; 8] = *b"CPMEPOO\0";

/// Layout version (major.minor packed into u32).
pub const MEMORY_MANAGER_VERSION: u32 = 1 << 16;

/// Memory manager header (320 bytes).
#[repr(C, align(64))]
pub struct MemoryManagerHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub pool_count: u32,
    pub segment_id: SegmentId,
    _pad0: u16,
    _pad1: u32,
    /// Bytes covered by the header and all pools.
    pub total_size: u64,
    /// Offset of each pool from this header.
    pub pool_offsets: [u64; MAX_NUMBER_OF_MEMPOOLS],
}

static_assertions::const_assert_eq!(size_of::<MemoryManagerHeader>(), 320);

impl MemoryManagerHeader {
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.magic != MEMORY_MANAGER_MAGIC {
            return Err(LayoutError::InvalidMagic);
        }
        if self.version >> 16 != MEMORY_MANAGER_VERSION >> 16 {
            return Err(LayoutError::IncompatibleVersion {
                expected: MEMORY_MANAGER_VERSION,
                found: self.version,
            });
        }
        if self.pool_count as usize > MAX_NUMBER_OF_MEMPOOLS {
            return Err(LayoutError::InvalidConfig("pool_count out of range"));
        }
        Ok(())
    }
}

/// Offsets of a memory manager's parts, relative to its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryManagerLayout {
    /// (offset, chunk_size, chunk_count) per pool.
    pub pools: Vec<(usize, u32, u32)>,
    pub total_size: usize,
}

impl MemoryManagerLayout {
    pub fn calculate(config: &MePooConfig) -> Result<Self, LayoutError> {
        let mut cursor = size_of::<MemoryManagerHeader>();
        let mut pools = Vec::with_capacity(config.len());
        for entry in config.entries() {
            let chunk_size = entry.chunk_size().map_err(LayoutError::Config)?;
            let pool_size = MemPool::required_size(chunk_size, entry.chunk_count)
                .ok_or(LayoutError::Overflow("pool size overflow"))?;
            pools.push((cursor, chunk_size, entry.chunk_count));
            cursor = cursor
                .checked_add(pool_size)
                .ok_or(LayoutError::Overflow("pool offset overflow"))?;
        }
        Ok(Self {
            pools,
            total_size: align_up(cursor, 64),
        })
    }
}

/// View of the pools of one segment.
///
/// With an owner set ([`with_owner`](Self::with_owner)) the manager and
/// every chunk it hands out keep the segment mapped.
#[derive(Clone)]
pub struct MemoryManager {
    header: NonNull<MemoryManagerHeader>,
    pools: Vec<MemPool>,
    owner: Option<SegmentOwner>,
}

// SAFETY: the manager is a set of views over atomically synchronized pools.
unsafe impl Send for MemoryManager {}
unsafe impl Sync for MemoryManager {}

impl MemoryManager {
    /// Bytes needed for `config`.
    pub fn required_size(config: &MePooConfig) -> Result<usize, LayoutError> {
        Ok(MemoryManagerLayout::calculate(config)?.total_size)
    }

    /// Create the pools described by `config` at `offset`.
    ///
    /// `region` must be the whole segment registered under `segment_id`.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during initialization.
    pub unsafe fn init(
        region: Region,
        offset: usize,
        segment_id: SegmentId,
        config: &MePooConfig,
    ) -> Result<Self, LayoutError> {
        if !offset.is_multiple_of(64) {
            return Err(LayoutError::Misaligned { offset });
        }
        let layout = MemoryManagerLayout::calculate(config)?;
        let required = offset
            .checked_add(layout.total_size)
            .ok_or(LayoutError::Overflow("memory manager end overflow"))?;
        if required > region.len() {
            return Err(LayoutError::RegionTooSmall {
                required,
                found: region.len(),
            });
        }

        let header = unsafe { region.get_mut::<MemoryManagerHeader>(offset) };
        header.magic = MEMORY_MANAGER_MAGIC;
        header.version = MEMORY_MANAGER_VERSION;
        header.pool_count = layout.pools.len() as u32;
        header.segment_id = segment_id;
        header._pad0 = 0;
        header._pad1 = 0;
        header.total_size = layout.total_size as u64;
        header.pool_offsets = [0; MAX_NUMBER_OF_MEMPOOLS];

        let mut pools = Vec::with_capacity(layout.pools.len());
        for (index, &(pool_offset, chunk_size, chunk_count)) in layout.pools.iter().enumerate() {
            header.pool_offsets[index] = pool_offset as u64;
            let pool = unsafe {
                MemPool::init(
                    region,
                    offset + pool_offset,
                    segment_id,
                    index as u16,
                    chunk_size,
                    chunk_count,
                )
            };
            tracing::debug!(
                segment_id,
                pool_index = index,
                chunk_size,
                chunk_count,
                "mempool created"
            );
            pools.push(pool);
        }

        Ok(Self {
            header: NonNull::from(header),
            pools,
            owner: None,
        })
    }

    /// Attach to pools created by [`MemoryManager::init`].
    ///
    /// # Safety
    ///
    /// The region must contain an initialized memory manager at `offset`.
    pub unsafe fn attach(region: Region, offset: usize) -> Result<Self, LayoutError> {
        if !offset.is_multiple_of(64) {
            return Err(LayoutError::Misaligned { offset });
        }
        let header_end = offset + size_of::<MemoryManagerHeader>();
        if header_end > region.len() {
            return Err(LayoutError::RegionTooSmall {
                required: header_end,
                found: region.len(),
            });
        }
        let header = unsafe { region.get::<MemoryManagerHeader>(offset) };
        header.validate()?;
        let required = offset + header.total_size as usize;
        if required > region.len() {
            return Err(LayoutError::RegionTooSmall {
                required,
                found: region.len(),
            });
        }

        let pools = header.pool_offsets[..header.pool_count as usize]
            .iter()
            .map(|&pool_offset| unsafe {
                MemPool::from_header_ptr(region.offset(offset + pool_offset as usize))
            })
            .collect();

        Ok(Self {
            header: NonNull::from(header),
            pools,
            owner: None,
        })
    }

    /// Keep `owner` alive as long as this manager or any chunk from it.
    pub fn with_owner(mut self, owner: SegmentOwner) -> Self {
        self.owner = Some(owner);
        self
    }

    #[inline]
    pub fn owner(&self) -> Option<&SegmentOwner> {
        self.owner.as_ref()
    }

    #[inline]
    fn header(&self) -> &MemoryManagerHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline]
    pub fn segment_id(&self) -> SegmentId {
        self.header().segment_id
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        self.header().total_size as usize
    }

    #[inline]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn pool(&self, index: usize) -> Option<&MemPool> {
        self.pools.get(index)
    }

    pub fn pool_info(&self, index: usize) -> Option<MemPoolInfo> {
        self.pools.get(index).map(MemPool::info)
    }

    pub fn pool_infos(&self) -> Vec<MemPoolInfo> {
        self.pools.iter().map(MemPool::info).collect()
    }

    /// Allocate a chunk for `settings` from the smallest fitting pool.
    ///
    /// The chunk comes back with a reference count of 1.
    pub fn get_chunk(&self, settings: &ChunkSettings) -> Result<SharedChunk, AllocationError> {
        let Some(largest) = self.pools.last() else {
            return Err(AllocationError::NoMempoolsAvailable);
        };
        let required = settings.required_chunk_size();
        let Some(pool) = self.pools.iter().find(|p| p.chunk_size() >= required) else {
            return Err(AllocationError::RequestedSizeTooLarge {
                required,
                max: largest.chunk_size(),
            });
        };

        let Some(header) = pool.allocate() else {
            tracing::warn!(
                segment_id = self.segment_id(),
                pool_index = pool.pool_index(),
                chunk_size = pool.chunk_size(),
                "mempool running out of chunks"
            );
            return Err(AllocationError::RunningOutOfChunks {
                pool_index: pool.pool_index(),
                chunk_size: pool.chunk_size(),
            });
        };

        // SAFETY: just popped from the free-list, so we own the slot.
        unsafe {
            ChunkHeader::prepare(header.as_ptr(), settings);
            Ok(SharedChunk::from_header(header, self.owner.clone()))
        }
    }

    /// Allocate a chunk for `payload_size` bytes aligned to `alignment`.
    pub fn allocate(&self, payload_size: u32, alignment: u32) -> Result<SharedChunk, AllocationError> {
        let settings = ChunkSettings::new(payload_size, alignment).map_err(AllocationError::InvalidSettings)?;
        self.get_chunk(&settings)
    }

    /// Allocate with the default payload alignment.
    pub fn allocate_default(&self, payload_size: u32) -> Result<SharedChunk, AllocationError> {
        self.allocate(payload_size, CHUNK_DEFAULT_PAYLOAD_ALIGNMENT)
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("segment_id", &self.segment_id())
            .field("pools", &self.pools)
            .finish()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from chunk allocation. All of them are recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    /// The manager has no pools.
    NoMempoolsAvailable,
    /// No pool has chunks large enough.
    RequestedSizeTooLarge { required: u32, max: u32 },
    /// The fitting pool is empty.
    RunningOutOfChunks { pool_index: u16, chunk_size: u32 },
    /// Payload size or alignment cannot form a chunk.
    InvalidSettings(ChunkSettingsError),
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMempoolsAvailable => write!(f, "no mempools available"),
            Self::RequestedSizeTooLarge { required, max } => {
                write!(f, "requested chunk of {required} bytes, largest pool has {max}")
            }
            Self::RunningOutOfChunks {
                pool_index,
                chunk_size,
            } => write!(
                f,
                "mempool {pool_index} ({chunk_size} byte chunks) is out of chunks"
            ),
            Self::InvalidSettings(e) => write!(f, "invalid chunk settings: {e}"),
        }
    }
}

impl std::error::Error for AllocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidSettings(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from laying out or attaching a memory manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    InvalidMagic,
    IncompatibleVersion { expected: u32, found: u32 },
    RegionTooSmall { required: usize, found: usize },
    Misaligned { offset: usize },
    Overflow(&'static str),
    InvalidConfig(&'static str),
    Config(MePooConfigError),
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid memory manager magic bytes"),
            Self::IncompatibleVersion { expected, found } => write!(
                f,
                "incompatible memory manager version: expected {}.{}, found {}.{}",
                expected >> 16,
                expected & 0xFFFF,
                found >> 16,
                found & 0xFFFF
            ),
            Self::RegionTooSmall { required, found } => {
                write!(f, "region too small: need {required} bytes, got {found}")
            }
            Self::Misaligned { offset } => write!(f, "offset {offset} is not 64-byte aligned"),
            Self::Overflow(what) => write!(f, "layout overflow: {what}"),
            Self::InvalidConfig(msg) => write!(f, "invalid memory manager config: {msg}"),
            Self::Config(e) => write!(f, "invalid mempool config: {e}"),
        }
    }
}

impl std::error::Error for LayoutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}
