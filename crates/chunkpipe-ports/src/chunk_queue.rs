//! Port-level queue of chunk references with an explicit overflow policy.
//!
//! # Memory Layout
//!
//! ```text
//! +--------------------------------------+ <- queue offset (64-aligned)
//! | ChunkQueueHeader (64 bytes)          |
//! |   magic, policy, lost flag,          |
//! |   attached condition variable        |
//! +--------------------------------------+
//! | Sofi (DiscardOldestData)             |  or  | SpscRing<u64> (RejectNewest) |
//! +--------------------------------------+
//! ```
//!
//! Entries are packed relative pointers to chunk headers; every queued entry
//! owns one reference of its chunk. Whatever the policy, a chunk that does
//! not end up queued (the evicted oldest, or the rejected newest) is released
//! and the lost flag is raised.

use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chunkpipe_pool::SharedChunk;
use shm_primitives::{
    Region, RelativePointerData, SegmentId, SegmentOwner, SegmentRegistry, Sofi, SpscRing,
    align_up,
};

use crate::condition::{ConditionNotifier, ConditionVariableData, MAX_NOTIFIERS};

/// Magic tag of an initialized queue header ("CPQU").
pub const CHUNK_QUEUE_MAGIC: u32 = u32::from_be_bytes(*b"CPQU");

/// Queue capacity when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: u32 = 16;

/// Largest queue capacity.
pub const MAX_QUEUE_CAPACITY: u32 = 1024;

const NO_NOTIFICATION_INDEX: u32 = u32::MAX;

/// What a full queue does with a new chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QueueFullPolicy {
    /// Evict and release the oldest chunk (safely-overflowing FIFO).
    #[default]
    DiscardOldestData = 0,
    /// Release the new chunk without queueing it (plain FIFO).
    RejectNewest = 1,
}

impl QueueFullPolicy {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::DiscardOldestData),
            1 => Some(Self::RejectNewest),
            _ => None,
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkQueueConfig {
    pub capacity: u32,
    /// Capacity storage is reserved for; bounds [`ChunkQueuePopper::set_capacity`].
    pub max_capacity: u32,
    pub full_policy: QueueFullPolicy,
}

impl Default for ChunkQueueConfig {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, QueueFullPolicy::default())
    }
}

impl ChunkQueueConfig {
    pub fn new(capacity: u32, full_policy: QueueFullPolicy) -> Self {
        Self {
            capacity,
            max_capacity: capacity.max(DEFAULT_QUEUE_CAPACITY).min(MAX_QUEUE_CAPACITY),
            full_policy,
        }
    }

    pub fn validate(&self) -> Result<(), ChunkQueueError> {
        if self.capacity == 0
            || self.capacity > MAX_QUEUE_CAPACITY
            || self.max_capacity < self.capacity
            || self.max_capacity > MAX_QUEUE_CAPACITY
        {
            return Err(ChunkQueueError::InvalidCapacity {
                capacity: self.capacity,
                max_capacity: self.max_capacity,
            });
        }
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        match self.full_policy {
            QueueFullPolicy::DiscardOldestData => Sofi::required_size(self.max_capacity),
            QueueFullPolicy::RejectNewest => SpscRing::<u64>::required_size(self.capacity),
        }
    }
}

/// Queue header (64 bytes).
#[repr(C, align(64))]
pub struct ChunkQueueHeader {
    pub magic: u32,
    pub policy: u8,
    _pad0: [u8; 3],
    /// Total bytes of header and buffer.
    pub size: u32,
    /// Set when a chunk was discarded or rejected; cleared on read.
    pub lost_chunks: AtomicU32,
    /// Packed relative pointer of the attached condition variable, or null.
    pub condition_variable: AtomicU64,
    pub notification_index: AtomicU32,
    _pad1: u32,
    /// Packed relative pointer of this header.
    pub queue_id: u64,
    _pad2: [u8; 24],
}

static_assertions::const_assert_eq!(size_of::<ChunkQueueHeader>(), 64);

/// Identity of a queue: the relative pointer of its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub RelativePointerData);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue@{}:{:#x}", self.0.id(), self.0.offset())
    }
}

/// Result of pushing a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting (and releasing) the oldest chunk.
    QueuedDiscardedOldest,
    /// Not queued; the chunk was released.
    Rejected,
}

impl PushOutcome {
    #[inline]
    pub fn is_queued(self) -> bool {
        !matches!(self, PushOutcome::Rejected)
    }

    #[inline]
    pub fn lost_chunk(self) -> bool {
        !matches!(self, PushOutcome::Queued)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkQueueError {
    InvalidCapacity { capacity: u32, max_capacity: u32 },
    /// Not a queue header (bad magic, policy or size).
    InvalidHeader,
    /// The queue id does not resolve in this process.
    Unresolvable,
    /// A popped entry does not name a live chunk. Its reference is leaked.
    InvalidChunk(RelativePointerData),
    RegionTooSmall { required: usize, found: usize },
    NotificationIndexOutOfRange { index: u32 },
}

impl fmt::Display for ChunkQueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCapacity {
                capacity,
                max_capacity,
            } => write!(
                f,
                "invalid queue capacity {capacity} (max {max_capacity}, limit {MAX_QUEUE_CAPACITY})"
            ),
            Self::InvalidHeader => write!(f, "invalid chunk queue header"),
            Self::Unresolvable => write!(f, "chunk queue does not resolve"),
            Self::InvalidChunk(ptr) => write!(f, "queue held an invalid chunk {ptr:?}"),
            Self::RegionTooSmall { required, found } => {
                write!(f, "region too small for queue: need {required} bytes, got {found}")
            }
            Self::NotificationIndexOutOfRange { index } => {
                write!(f, "notification index {index} exceeds {}", MAX_NOTIFIERS - 1)
            }
        }
    }
}

impl std::error::Error for ChunkQueueError {}

enum QueueBuffer {
    Sofi(Sofi),
    Fifo(SpscRing<u64>),
}

/// Shared view of a queue; the pusher and popper each own one.
struct ChunkQueue {
    header: NonNull<ChunkQueueHeader>,
    buffer: QueueBuffer,
    registry: Arc<SegmentRegistry>,
    /// Keeps the queue's segment mapped.
    _owner: Option<SegmentOwner>,
}

// SAFETY: the header and buffers are synchronized through atomics.
unsafe impl Send for ChunkQueue {}

impl ChunkQueue {
    /// Bytes needed by a queue with `config`.
    fn required_size(config: &ChunkQueueConfig) -> usize {
        align_up(size_of::<ChunkQueueHeader>() + config.buffer_size(), 64)
    }

    unsafe fn init(
        region: Region,
        offset: usize,
        segment_id: SegmentId,
        registry: Arc<SegmentRegistry>,
        config: &ChunkQueueConfig,
    ) -> Result<Self, ChunkQueueError> {
        config.validate()?;
        let size = Self::required_size(config);
        let required = offset + size;
        if !offset.is_multiple_of(64) || required > region.len() {
            return Err(ChunkQueueError::RegionTooSmall {
                required,
                found: region.len(),
            });
        }
        let queue_id = RelativePointerData::new(segment_id, offset as u64)
            .ok_or(ChunkQueueError::Unresolvable)?;
        let owner = registry
            .owner(segment_id)
            .map_err(|_| ChunkQueueError::Unresolvable)?;

        let header = unsafe { region.get_mut::<ChunkQueueHeader>(offset) };
        header.magic = 0;
        header.policy = config.full_policy as u8;
        header._pad0 = [0; 3];
        header.size = size as u32;
        header.lost_chunks = AtomicU32::new(0);
        header.condition_variable = AtomicU64::new(RelativePointerData::NULL.to_raw());
        header.notification_index = AtomicU32::new(NO_NOTIFICATION_INDEX);
        header._pad1 = 0;
        header.queue_id = queue_id.to_raw();
        header._pad2 = [0; 24];

        let buffer_offset = offset + size_of::<ChunkQueueHeader>();
        let buffer = match config.full_policy {
            QueueFullPolicy::DiscardOldestData => QueueBuffer::Sofi(unsafe {
                Sofi::init(region, buffer_offset, config.capacity, config.max_capacity)
            }),
            QueueFullPolicy::RejectNewest => QueueBuffer::Fifo(unsafe {
                SpscRing::init(region, buffer_offset, config.capacity)
            }),
        };

        let header_ptr = NonNull::from(&*header);
        // Publish last: attachers check the magic.
        unsafe { (*(header_ptr.as_ptr() as *const AtomicU32)).store(CHUNK_QUEUE_MAGIC, Ordering::Release) };

        Ok(Self {
            header: header_ptr,
            buffer,
            registry,
            _owner: owner,
        })
    }

    unsafe fn attach(registry: Arc<SegmentRegistry>, id: QueueId) -> Result<Self, ChunkQueueError> {
        let owner = registry
            .owner(id.0.id())
            .map_err(|_| ChunkQueueError::Unresolvable)?;
        let header = registry
            .resolve::<ChunkQueueHeader>(id.0)
            .ok_or(ChunkQueueError::Unresolvable)?;
        let header_ref = unsafe { header.as_ref() };
        let magic = unsafe { (*(header.as_ptr() as *const AtomicU32)).load(Ordering::Acquire) };
        if magic != CHUNK_QUEUE_MAGIC || header_ref.queue_id != id.0.to_raw() {
            return Err(ChunkQueueError::InvalidHeader);
        }
        let policy = QueueFullPolicy::from_u8(header_ref.policy).ok_or(ChunkQueueError::InvalidHeader)?;
        let size = header_ref.size as usize;
        if registry.resolve_raw(id.0, size).is_none() {
            return Err(ChunkQueueError::InvalidHeader);
        }

        // SAFETY: the whole queue lies inside the registered segment.
        let region = unsafe { Region::from_raw(header.as_ptr() as *mut u8, size) };
        let buffer_offset = size_of::<ChunkQueueHeader>();
        let buffer = match policy {
            QueueFullPolicy::DiscardOldestData => {
                QueueBuffer::Sofi(unsafe { Sofi::attach(region, buffer_offset) }.map_err(|_| ChunkQueueError::InvalidHeader)?)
            }
            QueueFullPolicy::RejectNewest => QueueBuffer::Fifo(
                unsafe { SpscRing::attach(region, buffer_offset) }.map_err(|_| ChunkQueueError::InvalidHeader)?,
            ),
        };

        Ok(Self {
            header,
            buffer,
            registry,
            _owner: owner,
        })
    }

    #[inline]
    fn header(&self) -> &ChunkQueueHeader {
        unsafe { self.header.as_ref() }
    }

    fn id(&self) -> QueueId {
        QueueId(RelativePointerData::from_raw(self.header().queue_id))
    }

    fn policy(&self) -> QueueFullPolicy {
        match self.buffer {
            QueueBuffer::Sofi(_) => QueueFullPolicy::DiscardOldestData,
            QueueBuffer::Fifo(_) => QueueFullPolicy::RejectNewest,
        }
    }

    fn size(&self) -> u64 {
        match &self.buffer {
            QueueBuffer::Sofi(sofi) => sofi.size(),
            QueueBuffer::Fifo(ring) => ring.len(),
        }
    }

    fn capacity(&self) -> u32 {
        match &self.buffer {
            QueueBuffer::Sofi(sofi) => sofi.capacity(),
            QueueBuffer::Fifo(ring) => ring.capacity(),
        }
    }

    fn mark_lost(&self) {
        self.header().lost_chunks.store(1, Ordering::Release);
    }

    fn release_raw(&self, raw: u64) {
        let data = RelativePointerData::from_raw(raw);
        // SAFETY: every queued entry owns one reference.
        match unsafe { SharedChunk::from_relative(&self.registry, data) } {
            Some(chunk) => drop(chunk),
            None => tracing::warn!(chunk = ?data, queue = %self.id(), "invalid chunk in queue"),
        }
    }

    fn notify(&self) {
        let header = self.header();
        let cv = RelativePointerData::from_raw(header.condition_variable.load(Ordering::Acquire));
        if cv.is_null() {
            return;
        }
        let index = header.notification_index.load(Ordering::Acquire);
        // Held across the notify so the variable's segment stays mapped.
        let Ok(_owner) = self.registry.owner(cv.id()) else {
            tracing::warn!(condition_variable = ?cv, queue = %self.id(), "attached condition variable is gone");
            return;
        };
        let Some(data) = self.registry.resolve::<ConditionVariableData>(cv) else {
            tracing::warn!(condition_variable = ?cv, queue = %self.id(), "attached condition variable does not resolve");
            return;
        };
        // SAFETY: attached variables live in a registered segment.
        if let Ok(notifier) = ConditionNotifier::new(unsafe { data.as_ref() }, index) {
            notifier.notify();
        }
    }
}

/// Creates a queue in a segment region and returns both of its ends.
///
/// # Safety
///
/// The bytes at `offset` must be writable, unused, and inside the segment
/// registered under `segment_id` in `registry`.
pub unsafe fn create_chunk_queue(
    region: Region,
    offset: usize,
    segment_id: SegmentId,
    registry: Arc<SegmentRegistry>,
    config: &ChunkQueueConfig,
) -> Result<(ChunkQueuePusher, ChunkQueuePopper), ChunkQueueError> {
    let pusher = unsafe { ChunkQueue::init(region, offset, segment_id, registry.clone(), config)? };
    let popper = unsafe { ChunkQueue::attach(registry, pusher.id())? };
    tracing::debug!(
        queue = %pusher.id(),
        capacity = config.capacity,
        policy = ?config.full_policy,
        "chunk queue created"
    );
    Ok((
        ChunkQueuePusher { queue: pusher },
        ChunkQueuePopper { queue: popper },
    ))
}

/// Bytes a queue with `config` occupies in the port area.
pub fn chunk_queue_size(config: &ChunkQueueConfig) -> usize {
    ChunkQueue::required_size(config)
}

/// The producing end of a chunk queue.
pub struct ChunkQueuePusher {
    queue: ChunkQueue,
}

impl ChunkQueuePusher {
    /// Attach a producing end to an existing queue.
    ///
    /// # Safety
    ///
    /// No other pusher of this queue may be used concurrently, and the
    /// queue's segment must stay registered while the pusher lives.
    pub unsafe fn attach(registry: Arc<SegmentRegistry>, id: QueueId) -> Result<Self, ChunkQueueError> {
        Ok(Self {
            queue: unsafe { ChunkQueue::attach(registry, id)? },
        })
    }

    #[inline]
    pub fn id(&self) -> QueueId {
        self.queue.id()
    }

    #[inline]
    pub fn policy(&self) -> QueueFullPolicy {
        self.queue.policy()
    }

    /// Hand one chunk reference to the queue, then notify the attached
    /// condition variable if the chunk was queued.
    pub fn push(&mut self, chunk: SharedChunk) -> PushOutcome {
        let raw = chunk.relative().to_raw();
        let outcome = match &self.queue.buffer {
            QueueBuffer::Sofi(sofi) => {
                std::mem::forget(chunk);
                // SAFETY: this pusher is the queue's only producer.
                match unsafe { sofi.producer() }.push(raw) {
                    None => PushOutcome::Queued,
                    Some(evicted) => {
                        self.queue.release_raw(evicted);
                        PushOutcome::QueuedDiscardedOldest
                    }
                }
            }
            QueueBuffer::Fifo(ring) => {
                // SAFETY: this pusher is the queue's only producer.
                if unsafe { ring.producer() }.push(raw) {
                    std::mem::forget(chunk);
                    PushOutcome::Queued
                } else {
                    drop(chunk);
                    PushOutcome::Rejected
                }
            }
        };

        if outcome.lost_chunk() {
            self.queue.mark_lost();
            tracing::warn!(queue = %self.id(), ?outcome, "queue overflow, chunk lost");
        }
        if outcome.is_queued() {
            self.queue.notify();
        }
        outcome
    }
}

impl fmt::Debug for ChunkQueuePusher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkQueuePusher")
            .field("id", &self.id())
            .field("policy", &self.policy())
            .finish()
    }
}

/// The consuming end of a chunk queue.
pub struct ChunkQueuePopper {
    queue: ChunkQueue,
}

impl ChunkQueuePopper {
    /// Attach a consuming end to an existing queue.
    ///
    /// # Safety
    ///
    /// No other popper of this queue may be used concurrently, and the
    /// queue's segment must stay registered while the popper lives.
    pub unsafe fn attach(registry: Arc<SegmentRegistry>, id: QueueId) -> Result<Self, ChunkQueueError> {
        Ok(Self {
            queue: unsafe { ChunkQueue::attach(registry, id)? },
        })
    }

    #[inline]
    pub fn id(&self) -> QueueId {
        self.queue.id()
    }

    #[inline]
    pub fn policy(&self) -> QueueFullPolicy {
        self.queue.policy()
    }

    fn pop_raw(&mut self) -> Option<u64> {
        match &self.queue.buffer {
            QueueBuffer::Sofi(sofi) => sofi.consumer().pop(),
            // SAFETY: this popper is the queue's only consumer.
            QueueBuffer::Fifo(ring) => unsafe { ring.consumer() }.try_pop(),
        }
    }

    /// Pop the oldest chunk.
    pub fn try_pop(&mut self) -> Result<Option<SharedChunk>, ChunkQueueError> {
        let Some(raw) = self.pop_raw() else {
            return Ok(None);
        };
        let data = RelativePointerData::from_raw(raw);
        // SAFETY: every queued entry owns one reference.
        match unsafe { SharedChunk::from_relative(&self.queue.registry, data) } {
            Some(chunk) => Ok(Some(chunk)),
            None => Err(ChunkQueueError::InvalidChunk(data)),
        }
    }

    /// Pop and release everything queued.
    pub fn clear(&mut self) {
        while let Some(raw) = self.pop_raw() {
            self.queue.release_raw(raw);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.size() == 0
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.queue.size()
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.queue.capacity()
    }

    /// Change the capacity while the queue is empty.
    ///
    /// Only safely-overflowing queues can resize, within the storage reserved
    /// at creation; a `RejectNewest` queue keeps its creation capacity.
    pub fn set_capacity(&mut self, capacity: u32) -> bool {
        match &self.queue.buffer {
            QueueBuffer::Sofi(sofi) => sofi.set_capacity(capacity),
            QueueBuffer::Fifo(ring) => capacity == ring.capacity(),
        }
    }

    /// Whether chunks were lost since the last call. Clears the flag.
    pub fn has_lost_chunks(&self) -> bool {
        self.queue.header().lost_chunks.swap(0, Ordering::AcqRel) != 0
    }

    /// Notify `condition_variable` at `index` on every push.
    pub fn attach_condition_variable(
        &mut self,
        condition_variable: RelativePointerData,
        index: u32,
    ) -> Result<(), ChunkQueueError> {
        if index >= MAX_NOTIFIERS {
            return Err(ChunkQueueError::NotificationIndexOutOfRange { index });
        }
        let header = self.queue.header();
        header.notification_index.store(index, Ordering::Release);
        header
            .condition_variable
            .store(condition_variable.to_raw(), Ordering::Release);
        Ok(())
    }

    pub fn detach_condition_variable(&mut self) {
        let header = self.queue.header();
        header
            .condition_variable
            .store(RelativePointerData::NULL.to_raw(), Ordering::Release);
        header
            .notification_index
            .store(NO_NOTIFICATION_INDEX, Ordering::Release);
    }

    pub fn is_condition_variable_attached(&self) -> bool {
        !RelativePointerData::from_raw(self.queue.header().condition_variable.load(Ordering::Acquire))
            .is_null()
    }
}

impl fmt::Debug for ChunkQueuePopper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkQueuePopper")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chunkpipe_pool::{MePooConfig, MePooEntry, MemoryManager};
    use shm_primitives::HeapRegion;

    pub(crate) fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// A segment with one pool at offset 0 and a port area after it.
    pub(crate) struct Fixture {
        pub(crate) owner: HeapRegion,
        pub(crate) registry: Arc<SegmentRegistry>,
        pub(crate) mm: MemoryManager,
        pub(crate) next_offset: usize,
    }

    impl Fixture {
        pub(crate) fn new(payload_size: u32, chunk_count: u32) -> Self {
            init_tracing();
            let config =
                MePooConfig::from_entries([MePooEntry::new(payload_size, chunk_count)]).unwrap();
            let pool_size = MemoryManager::required_size(&config).unwrap();
            let owner = HeapRegion::new_zeroed(pool_size + 64 * 1024);
            let registry = Arc::new(SegmentRegistry::new());
            registry
                .register(0, owner.region().as_ptr(), owner.len())
                .unwrap();
            let mm = unsafe { MemoryManager::init(owner.region(), 0, 0, &config) }.unwrap();
            Self {
                owner,
                registry,
                mm,
                next_offset: align_up(pool_size, 64),
            }
        }

        pub(crate) fn alloc_offset(&mut self, size: usize) -> usize {
            let offset = self.next_offset;
            self.next_offset = align_up(offset + size, 64);
            offset
        }

        pub(crate) fn queue(&mut self, config: ChunkQueueConfig) -> (ChunkQueuePusher, ChunkQueuePopper) {
            let offset = self.alloc_offset(chunk_queue_size(&config));
            unsafe { create_chunk_queue(self.owner.region(), offset, 0, self.registry.clone(), &config) }
                .unwrap()
        }

        pub(crate) fn condition_variable(&mut self) -> RelativePointerData {
            let offset = self.alloc_offset(size_of::<ConditionVariableData>());
            unsafe {
                ConditionVariableData::init(self.owner.region().offset(offset) as *mut ConditionVariableData)
            };
            RelativePointerData::new(0, offset as u64).unwrap()
        }

        pub(crate) fn chunk(&self, value: u8) -> SharedChunk {
            let mut chunk = self.mm.allocate_default(1).unwrap();
            chunk.payload_mut().unwrap()[0] = value;
            chunk
        }

        pub(crate) fn used_chunks(&self) -> u32 {
            self.mm.pool_info(0).unwrap().used_chunks
        }
    }

    fn pop_value(popper: &mut ChunkQueuePopper) -> Option<u8> {
        popper.try_pop().unwrap().map(|c| c.payload()[0])
    }

    #[test]
    fn fifo_order_and_capacity() {
        let mut fx = Fixture::new(8, 8);
        let (mut tx, mut rx) = fx.queue(ChunkQueueConfig::new(3, QueueFullPolicy::RejectNewest));
        for v in 1..=3 {
            assert_eq!(tx.push(fx.chunk(v)), PushOutcome::Queued);
        }
        assert_eq!(rx.size(), 3);
        assert_eq!(pop_value(&mut rx), Some(1));
        assert_eq!(pop_value(&mut rx), Some(2));
        assert_eq!(pop_value(&mut rx), Some(3));
        assert_eq!(pop_value(&mut rx), None);
        assert_eq!(fx.used_chunks(), 0);
    }

    #[test]
    fn reject_newest_releases_the_new_chunk() {
        let mut fx = Fixture::new(8, 8);
        let (mut tx, mut rx) = fx.queue(ChunkQueueConfig::new(2, QueueFullPolicy::RejectNewest));
        tx.push(fx.chunk(1));
        tx.push(fx.chunk(2));
        assert_eq!(tx.push(fx.chunk(3)), PushOutcome::Rejected);
        assert_eq!(fx.used_chunks(), 2);
        assert!(rx.has_lost_chunks());
        assert!(!rx.has_lost_chunks());
        assert_eq!(pop_value(&mut rx), Some(1));
        assert_eq!(pop_value(&mut rx), Some(2));
    }

    #[test]
    fn discard_oldest_releases_the_evicted_chunk() {
        let mut fx = Fixture::new(8, 8);
        let (mut tx, mut rx) =
            fx.queue(ChunkQueueConfig::new(2, QueueFullPolicy::DiscardOldestData));
        tx.push(fx.chunk(1));
        tx.push(fx.chunk(2));
        assert_eq!(tx.push(fx.chunk(3)), PushOutcome::QueuedDiscardedOldest);
        assert_eq!(fx.used_chunks(), 2);
        assert!(rx.has_lost_chunks());
        assert_eq!(pop_value(&mut rx), Some(2));
        assert_eq!(pop_value(&mut rx), Some(3));
        assert_eq!(fx.used_chunks(), 0);
    }

    #[test]
    fn clear_releases_everything() {
        let mut fx = Fixture::new(8, 8);
        let (mut tx, mut rx) = fx.queue(ChunkQueueConfig::default());
        for v in 0..5 {
            tx.push(fx.chunk(v));
        }
        assert_eq!(fx.used_chunks(), 5);
        rx.clear();
        assert!(rx.is_empty());
        assert_eq!(fx.used_chunks(), 0);
    }

    #[test]
    fn set_capacity_only_when_empty() {
        let mut fx = Fixture::new(8, 8);
        let config = ChunkQueueConfig {
            capacity: 2,
            max_capacity: 4,
            full_policy: QueueFullPolicy::DiscardOldestData,
        };
        let (mut tx, mut rx) = fx.queue(config);
        tx.push(fx.chunk(1));
        assert!(!rx.set_capacity(4));
        rx.clear();
        assert!(!rx.set_capacity(5));
        assert!(rx.set_capacity(4));
        assert_eq!(rx.capacity(), 4);

        let (_tx, mut fifo) = fx.queue(ChunkQueueConfig::new(2, QueueFullPolicy::RejectNewest));
        assert!(!fifo.set_capacity(3));
        assert!(fifo.set_capacity(2));
    }

    #[test]
    fn push_notifies_attached_condition_variable() {
        let mut fx = Fixture::new(8, 8);
        let cv = fx.condition_variable();
        let (mut tx, mut rx) = fx.queue(ChunkQueueConfig::default());
        rx.attach_condition_variable(cv, 9).unwrap();
        assert!(rx.is_condition_variable_attached());

        tx.push(fx.chunk(1));
        let data = fx.registry.resolve::<ConditionVariableData>(cv).unwrap();
        let listener = crate::condition::ConditionListener::new(unsafe { data.as_ref() });
        assert!(listener.wait().unwrap().contains(9));

        rx.detach_condition_variable();
        tx.push(fx.chunk(2));
        assert!(!listener.was_notified());
    }

    #[test]
    fn attach_by_id_reaches_the_same_queue() {
        let mut fx = Fixture::new(8, 8);
        let (tx, mut rx) = fx.queue(ChunkQueueConfig::default());
        let id = tx.id();
        drop(tx);
        let mut tx = unsafe { ChunkQueuePusher::attach(fx.registry.clone(), id) }.unwrap();
        tx.push(fx.chunk(42));
        assert_eq!(pop_value(&mut rx), Some(42));

        let bogus = QueueId(RelativePointerData::new(0, 64).unwrap());
        assert!(unsafe { ChunkQueuePusher::attach(fx.registry.clone(), bogus) }.is_err());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(ChunkQueueConfig::new(0, QueueFullPolicy::RejectNewest).validate().is_err());
        assert!(
            ChunkQueueConfig::new(MAX_QUEUE_CAPACITY + 1, QueueFullPolicy::RejectNewest)
                .validate()
                .is_err()
        );
        assert!(ChunkQueueConfig::default().validate().is_ok());
    }
}
