//! Sending side of a port: allocation, stamping and delivery.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chunkpipe_pool::{AllocationError, ChunkHeader, MemoryManager, SharedChunk};
use parking_lot::Mutex;

use crate::chunk_distributor::ChunkDistributor;

/// Most chunks one sender may hold allocated but not yet sent.
pub const MAX_CHUNKS_ALLOCATED_PER_SENDER: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderConfig {
    pub max_chunks_allocated: u32,
    /// Chunks kept for late-joining receivers.
    pub history_capacity: usize,
    /// Stamped into every chunk header as the origin.
    pub origin_id: u64,
    /// Keep the last sent chunk so [`ChunkSender::try_get_previous_chunk`]
    /// can reuse it.
    pub retain_last_chunk: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_chunks_allocated: MAX_CHUNKS_ALLOCATED_PER_SENDER,
            history_capacity: 0,
            origin_id: 0,
            retain_last_chunk: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSendError {
    /// [`SenderConfig::max_chunks_allocated`] chunks are already out.
    TooManyChunksAllocatedInParallel,
    Allocation(AllocationError),
}

impl fmt::Display for ChunkSendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyChunksAllocatedInParallel => {
                write!(f, "too many chunks allocated in parallel")
            }
            Self::Allocation(e) => write!(f, "allocation failed: {e}"),
        }
    }
}

impl std::error::Error for ChunkSendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Allocation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AllocationError> for ChunkSendError {
    fn from(e: AllocationError) -> Self {
        Self::Allocation(e)
    }
}

/// Allocates chunks from a memory manager and delivers them to every queue
/// connected to its distributor.
pub struct ChunkSender {
    memory_manager: MemoryManager,
    distributor: ChunkDistributor,
    config: SenderConfig,
    allocated: AtomicU32,
    next_sequence: AtomicU64,
    last: Mutex<Option<SharedChunk>>,
}

impl ChunkSender {
    pub fn new(memory_manager: MemoryManager, config: SenderConfig) -> Self {
        Self {
            memory_manager,
            distributor: ChunkDistributor::new(config.history_capacity),
            config,
            allocated: AtomicU32::new(0),
            next_sequence: AtomicU64::new(0),
            last: Mutex::new(None),
        }
    }

    #[inline]
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    #[inline]
    pub fn distributor(&self) -> &ChunkDistributor {
        &self.distributor
    }

    #[inline]
    pub fn memory_manager(&self) -> &MemoryManager {
        &self.memory_manager
    }

    /// Chunks allocated and not yet sent or released.
    #[inline]
    pub fn allocated_chunks(&self) -> u32 {
        self.allocated.load(Ordering::Acquire)
    }

    fn reserve(&self) -> Result<(), ChunkSendError> {
        let max = self.config.max_chunks_allocated;
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| ChunkSendError::TooManyChunksAllocatedInParallel)
    }

    fn unreserve(&self) {
        let prev = self.allocated.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "allocated chunk counter underflow");
    }

    fn stamp(&self, chunk: &mut SharedChunk) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let stamped = chunk.stamp_origin(self.config.origin_id, sequence);
        debug_assert!(stamped, "stamping a shared chunk");
    }

    /// Allocate a chunk for `payload_size` bytes aligned to `alignment`.
    pub fn try_allocate(
        &self,
        payload_size: u32,
        alignment: u32,
    ) -> Result<AllocatedChunk<'_>, ChunkSendError> {
        self.reserve()?;
        let mut chunk = match self.memory_manager.allocate(payload_size, alignment) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.unreserve();
                return Err(e.into());
            }
        };
        self.stamp(&mut chunk);
        Ok(AllocatedChunk {
            sender: self,
            chunk: Some(chunk),
        })
    }

    /// Reuse the last sent chunk if nobody else holds it any more.
    pub fn try_get_previous_chunk(&self) -> Option<AllocatedChunk<'_>> {
        let mut last = self.last.lock();
        if !last.as_ref().is_some_and(SharedChunk::is_unique) {
            return None;
        }
        self.reserve().ok()?;
        let mut chunk = last.take()?;
        self.stamp(&mut chunk);
        Some(AllocatedChunk {
            sender: self,
            chunk: Some(chunk),
        })
    }

    /// Drop the retained last chunk and the history.
    pub fn release_all(&self) {
        self.last.lock().take();
        self.distributor.clear_history();
    }

    fn deliver(&self, chunk: SharedChunk) -> usize {
        if self.config.retain_last_chunk {
            *self.last.lock() = Some(chunk.clone());
        }
        self.distributor.deliver_to_all_stored_queues(chunk)
    }
}

impl fmt::Debug for ChunkSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkSender")
            .field("config", &self.config)
            .field("allocated", &self.allocated_chunks())
            .field("distributor", &self.distributor)
            .finish()
    }
}

/// A chunk allocated by a [`ChunkSender`] and not yet sent.
///
/// Dropping it returns the chunk to its pool.
pub struct AllocatedChunk<'a> {
    sender: &'a ChunkSender,
    chunk: Option<SharedChunk>,
}

impl AllocatedChunk<'_> {
    fn chunk(&self) -> &SharedChunk {
        match &self.chunk {
            Some(chunk) => chunk,
            None => unreachable!("allocated chunk already consumed"),
        }
    }

    pub fn header(&self) -> &ChunkHeader {
        self.chunk().header()
    }

    pub fn payload(&self) -> &[u8] {
        self.chunk().payload()
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        match &mut self.chunk {
            // SAFETY: the chunk is unpublished, this guard is its only holder.
            Some(chunk) => unsafe { chunk.payload_mut_unchecked() },
            None => unreachable!("allocated chunk already consumed"),
        }
    }

    #[inline]
    pub fn sequence_number(&self) -> u64 {
        self.header().sequence_number
    }

    fn take(mut self) -> SharedChunk {
        self.sender.unreserve();
        match self.chunk.take() {
            Some(chunk) => chunk,
            None => unreachable!("allocated chunk already consumed"),
        }
    }

    /// Deliver to every connected queue. Returns how many accepted it.
    pub fn send(self) -> usize {
        let sender = self.sender;
        sender.deliver(self.take())
    }

    /// Store in the history without delivering.
    pub fn push_to_history(self) {
        let sender = self.sender;
        sender.distributor.add_to_history_without_delivery(self.take());
    }

    /// Give the chunk back without sending it.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for AllocatedChunk<'_> {
    fn drop(&mut self) {
        if self.chunk.take().is_some() {
            self.sender.unreserve();
        }
    }
}

impl fmt::Debug for AllocatedChunk<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedChunk").field("chunk", &self.chunk).finish()
    }
}
