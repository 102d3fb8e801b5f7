//! A shared-memory segment: header, chunk pools and a port area.
//!
//! # Memory Layout
//!
//! ```text
//! +--------------------------------------+ <- offset 0
//! | SegmentHeader (64 bytes)             |
//! |   magic "CHUNKSEG", version, id,     |
//! |   area offsets, port bump cursor     |
//! +--------------------------------------+ <- mepoo_offset
//! | MemoryManager: pool tables + slots   |
//! +--------------------------------------+ <- port_area_offset
//! | port area: chunk queues and          |
//! | condition variables, bump allocated  |
//! +--------------------------------------+ <- total_size
//! ```
//!
//! The layout is fixed at creation and recorded in the header; attachers
//! read it back instead of recomputing it.

use std::mem::size_of;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chunkpipe_pool::{MePooConfig, MemoryManager};
use chunkpipe_ports::{
    ChunkQueueConfig, ChunkQueuePopper, ChunkQueuePusher, ChunkReceiver, ChunkSender,
    ConditionVariable, ConditionVariableData, PublisherPort, ReceiverConfig, SenderConfig,
    SubscriberPort, chunk_queue_size, create_chunk_queue,
};
use shm_primitives::{
    HeapRegion, Region, RelativePointerData, SegmentId, SegmentOwner, SegmentRegistry, align_up,
};

use crate::error::SegmentError;
use crate::mapping::{MappedSegment, SegmentMemory};

/// Magic bytes identifying a chunkpipe segment.
pub const SEGMENT_MAGIC: [u8; 8] = *b"CHUNKSEG";

/// Segment layout version (major.minor packed into u32).
pub const SEGMENT_VERSION: u32 = 1 << 16;

/// Port area size when none is configured.
pub const DEFAULT_PORT_AREA_SIZE: usize = 256 * 1024;

/// Alignment of everything allocated from the port area.
const PORT_ALIGNMENT: usize = 64;

/// Segment header (64 bytes).
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// [`SEGMENT_MAGIC`] once the header is complete, published last.
    magic: AtomicU64,
    pub version: u32,
    pub segment_id: SegmentId,
    _pad: u16,
    pub total_size: u64,
    pub mepoo_offset: u64,
    pub mepoo_size: u64,
    pub port_area_offset: u64,
    pub port_area_size: u64,
    /// Next free byte of the port area, relative to the segment base.
    pub port_cursor: AtomicU64,
}

static_assertions::const_assert_eq!(size_of::<SegmentHeader>(), 64);

impl SegmentHeader {
    #[inline]
    pub fn magic(&self) -> [u8; 8] {
        self.magic.load(Ordering::Acquire).to_ne_bytes()
    }

    pub fn validate(&self, mapped_len: usize) -> Result<(), SegmentError> {
        // Acquire pairs with the release in Segment::initialize.
        if self.magic() != SEGMENT_MAGIC {
            return Err(SegmentError::InvalidHeader("bad magic"));
        }
        if self.version >> 16 != SEGMENT_VERSION >> 16 {
            return Err(SegmentError::InvalidHeader("incompatible version"));
        }
        if self.total_size as usize > mapped_len {
            return Err(SegmentError::InvalidHeader("segment larger than mapping"));
        }
        let mepoo_end = self.mepoo_offset.checked_add(self.mepoo_size);
        let port_end = self.port_area_offset.checked_add(self.port_area_size);
        match (mepoo_end, port_end) {
            (Some(mepoo_end), Some(port_end))
                if mepoo_end <= self.port_area_offset && port_end <= self.total_size => {}
            _ => return Err(SegmentError::InvalidHeader("areas out of bounds")),
        }
        Ok(())
    }
}

/// Offsets of a segment's areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub mepoo_offset: usize,
    pub mepoo_size: usize,
    pub port_area_offset: usize,
    pub port_area_size: usize,
    pub total_size: usize,
}

impl SegmentLayout {
    pub fn calculate(config: &SegmentConfig) -> Result<Self, SegmentError> {
        let mepoo_offset = size_of::<SegmentHeader>();
        let mepoo_size = MemoryManager::required_size(&config.pools)?;
        let port_area_offset = align_up(mepoo_offset + mepoo_size, PORT_ALIGNMENT);
        let port_area_size = align_up(config.port_area_size, PORT_ALIGNMENT);
        let total_size = port_area_offset
            .checked_add(port_area_size)
            .ok_or(SegmentError::InvalidHeader("segment size overflow"))?;
        Ok(Self {
            mepoo_offset,
            mepoo_size,
            port_area_offset,
            port_area_size,
            total_size,
        })
    }
}

/// How to build a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Id under which every process registers this segment.
    pub segment_id: SegmentId,
    pub pools: MePooConfig,
    /// Bytes reserved for chunk queues and condition variables.
    pub port_area_size: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            segment_id: 0,
            pools: MePooConfig::default(),
            port_area_size: DEFAULT_PORT_AREA_SIZE,
        }
    }
}

/// The mapping behind a [`Segment`], shared with every handle into it.
///
/// It is the segment's registry owner: the registration is removed when the
/// last holder drops it, right before the memory is released.
struct SegmentShared {
    registry: Arc<SegmentRegistry>,
    segment_id: SegmentId,
    memory: SegmentMemory,
}

impl Drop for SegmentShared {
    fn drop(&mut self) {
        if self
            .registry
            .unregister_owned(self.segment_id, self as *const Self as *const ())
        {
            tracing::debug!(segment_id = self.segment_id, "segment released");
        }
    }
}

/// One segment as seen by this process.
///
/// Registers itself in the given registry. Chunks, queues, ports and
/// condition variables created from a segment keep its memory mapped and
/// registered, so they may outlive the `Segment` value.
pub struct Segment {
    shared: Arc<SegmentShared>,
    memory_manager: MemoryManager,
}

impl Segment {
    /// Create a segment in process-local memory.
    pub fn create_in_memory(
        registry: Arc<SegmentRegistry>,
        config: &SegmentConfig,
    ) -> Result<Self, SegmentError> {
        let layout = SegmentLayout::calculate(config)?;
        let memory = SegmentMemory::Heap(HeapRegion::new_zeroed(layout.total_size));
        Self::initialize(memory, registry, config, &layout)
    }

    /// Create a segment backed by the file at `path`, replacing any previous
    /// content.
    pub fn create(
        path: impl AsRef<Path>,
        registry: Arc<SegmentRegistry>,
        config: &SegmentConfig,
    ) -> Result<Self, SegmentError> {
        let layout = SegmentLayout::calculate(config)?;
        let memory = SegmentMemory::Mapped(MappedSegment::create(path, layout.total_size)?);
        Self::initialize(memory, registry, config, &layout)
    }

    /// Map and attach to a segment created by [`Segment::create`].
    pub fn open(path: impl AsRef<Path>, registry: Arc<SegmentRegistry>) -> Result<Self, SegmentError> {
        let mapping = MappedSegment::open(path)?;
        let region = mapping.region();
        if region.len() < size_of::<SegmentHeader>() {
            return Err(SegmentError::InvalidHeader("file too small"));
        }
        // SAFETY: the mapping holds at least a header and is page aligned.
        let header = unsafe { region.get::<SegmentHeader>(0) };
        header.validate(region.len())?;
        let segment_id = header.segment_id;
        // SAFETY: the header says a memory manager lives there.
        let memory_manager = unsafe { MemoryManager::attach(region, header.mepoo_offset as usize)? };
        if memory_manager.segment_id() != segment_id {
            return Err(SegmentError::InvalidHeader("pool segment id mismatch"));
        }

        let path = mapping.path().to_path_buf();
        let segment = Self::register(SegmentMemory::Mapped(mapping), registry, segment_id, memory_manager)?;
        tracing::debug!(
            segment_id,
            path = %path.display(),
            size = region.len(),
            pools = segment.memory_manager.pool_count(),
            "segment attached"
        );
        Ok(segment)
    }

    fn initialize(
        memory: SegmentMemory,
        registry: Arc<SegmentRegistry>,
        config: &SegmentConfig,
        layout: &SegmentLayout,
    ) -> Result<Self, SegmentError> {
        let region = memory.region();
        let memory_manager =
            unsafe { Self::create_pools(region, layout.mepoo_offset, config.segment_id, &config.pools)? };

        // SAFETY: freshly created memory, nobody else sees it yet.
        let header = unsafe { region.get_mut::<SegmentHeader>(0) };
        header.version = SEGMENT_VERSION;
        header.segment_id = config.segment_id;
        header._pad = 0;
        header.total_size = layout.total_size as u64;
        header.mepoo_offset = layout.mepoo_offset as u64;
        header.mepoo_size = layout.mepoo_size as u64;
        header.port_area_offset = layout.port_area_offset as u64;
        header.port_area_size = layout.port_area_size as u64;
        header.port_cursor = AtomicU64::new(layout.port_area_offset as u64);
        // Magic last: a half-written header never validates.
        header
            .magic
            .store(u64::from_ne_bytes(SEGMENT_MAGIC), Ordering::Release);

        let segment = Self::register(memory, registry, config.segment_id, memory_manager)?;
        tracing::debug!(
            segment_id = config.segment_id,
            path = ?segment.path(),
            size = layout.total_size,
            pools = segment.memory_manager.pool_count(),
            port_area = layout.port_area_size,
            "segment created"
        );
        Ok(segment)
    }

    /// Lay out one pool per configured size class.
    ///
    /// # Safety
    ///
    /// `region` must be writable and not yet shared.
    unsafe fn create_pools(
        region: Region,
        offset: usize,
        segment_id: SegmentId,
        pools: &MePooConfig,
    ) -> Result<MemoryManager, SegmentError> {
        let memory_manager = unsafe { MemoryManager::init(region, offset, segment_id, pools)? };
        for info in memory_manager.pool_infos() {
            tracing::debug!(
                segment_id,
                chunk_size = info.chunk_size,
                chunks = info.num_chunks,
                "pool created"
            );
        }
        Ok(memory_manager)
    }

    /// Register `memory` under `id` with a fresh owner and hand that owner
    /// to the memory manager, so every chunk it lends keeps the segment.
    fn register(
        memory: SegmentMemory,
        registry: Arc<SegmentRegistry>,
        id: SegmentId,
        memory_manager: MemoryManager,
    ) -> Result<Self, SegmentError> {
        let region = memory.region();
        let shared = Arc::new(SegmentShared {
            registry,
            segment_id: id,
            memory,
        });
        let owner: SegmentOwner = shared.clone();
        // On failure `shared` drops without touching the existing entry.
        shared
            .registry
            .register_owned(id, region.as_ptr(), region.len(), &owner)
            .map_err(|e| {
                tracing::warn!(segment_id = id, error = %e, "segment registration failed");
                SegmentError::Registry(e)
            })?;
        Ok(Self {
            memory_manager: memory_manager.with_owner(owner),
            shared,
        })
    }

    #[inline]
    fn region(&self) -> Region {
        self.shared.memory.region()
    }

    #[inline]
    fn header(&self) -> &SegmentHeader {
        // SAFETY: validated or written at construction, and the memory lives
        // as long as self.
        unsafe { &*(self.region().as_ptr() as *const SegmentHeader) }
    }

    #[inline]
    pub fn segment_id(&self) -> SegmentId {
        self.shared.segment_id
    }

    #[inline]
    pub fn registry(&self) -> &Arc<SegmentRegistry> {
        &self.shared.registry
    }

    #[inline]
    pub fn memory_manager(&self) -> &MemoryManager {
        &self.memory_manager
    }

    pub fn size(&self) -> usize {
        self.header().total_size as usize
    }

    pub fn path(&self) -> Option<&Path> {
        self.shared.memory.path()
    }

    /// Unused bytes left in the port area.
    pub fn port_area_available(&self) -> usize {
        let header = self.header();
        let end = header.port_area_offset + header.port_area_size;
        end.saturating_sub(header.port_cursor.load(Ordering::Acquire)) as usize
    }

    /// Reserve `size` bytes of the port area and return their offset.
    fn allocate_port_area(&self, size: usize) -> Result<usize, SegmentError> {
        let header = self.header();
        let size = align_up(size, PORT_ALIGNMENT) as u64;
        let end = header.port_area_offset + header.port_area_size;
        header
            .port_cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                cursor.checked_add(size).filter(|&next| next <= end)
            })
            .map(|offset| offset as usize)
            .map_err(|cursor| SegmentError::PortAreaExhausted {
                requested: size as usize,
                available: end.saturating_sub(cursor) as usize,
            })
    }

    /// Create a chunk queue in the port area.
    pub fn create_receiver_queue(
        &self,
        config: &ChunkQueueConfig,
    ) -> Result<(ChunkQueuePusher, ChunkQueuePopper), SegmentError> {
        config.validate()?;
        let offset = self.allocate_port_area(chunk_queue_size(config))?;
        // SAFETY: the bytes were just reserved for this queue.
        let ends = unsafe {
            create_chunk_queue(
                self.region(),
                offset,
                self.segment_id(),
                self.registry().clone(),
                config,
            )?
        };
        Ok(ends)
    }

    /// Create a condition variable in the port area.
    pub fn create_condition_variable(&self) -> Result<ConditionVariable, SegmentError> {
        let offset = self.allocate_port_area(size_of::<ConditionVariableData>())?;
        // SAFETY: the bytes were just reserved for this variable.
        unsafe {
            ConditionVariableData::init(self.region().offset(offset) as *mut ConditionVariableData)
        };
        let relative = RelativePointerData::new(self.segment_id(), offset as u64)
            .ok_or(SegmentError::InvalidHeader("port offset out of range"))?;
        // SAFETY: just initialized inside this registered segment.
        Ok(unsafe { ConditionVariable::from_relative(self.registry(), relative)? })
    }

    /// Attach to a condition variable another process created.
    pub fn condition_variable(&self, relative: RelativePointerData) -> Result<ConditionVariable, SegmentError> {
        // SAFETY: resolution checks bounds and alignment; callers pass
        // pointers produced by create_condition_variable.
        Ok(unsafe { ConditionVariable::from_relative(self.registry(), relative)? })
    }

    /// A sender allocating from this segment's pools.
    pub fn create_sender(&self, config: SenderConfig) -> ChunkSender {
        ChunkSender::new(self.memory_manager.clone(), config)
    }

    /// A receiver with a fresh queue. Producers attach to the queue by
    /// [`ChunkReceiver::queue_id`].
    pub fn create_receiver(
        &self,
        queue: &ChunkQueueConfig,
        config: ReceiverConfig,
    ) -> Result<ChunkReceiver, SegmentError> {
        let (_pusher, popper) = self.create_receiver_queue(queue)?;
        Ok(ChunkReceiver::new(popper, config))
    }

    pub fn create_publisher(&self, config: SenderConfig) -> PublisherPort {
        PublisherPort::new(self.create_sender(config), self.registry().clone())
    }

    pub fn create_subscriber(
        &self,
        queue: &ChunkQueueConfig,
        config: ReceiverConfig,
        history_request: usize,
    ) -> Result<SubscriberPort, SegmentError> {
        Ok(SubscriberPort::new(self.create_receiver(queue, config)?, history_request))
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("segment_id", &self.segment_id())
            .field("size", &self.size())
            .field("path", &self.path())
            .field("memory_manager", &self.memory_manager)
            .finish()
    }
}
