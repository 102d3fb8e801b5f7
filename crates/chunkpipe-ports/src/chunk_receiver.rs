//! Receiving side of a port.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use chunkpipe_pool::{ChunkHeader, SharedChunk};
use parking_lot::Mutex;
use shm_primitives::RelativePointerData;

use crate::chunk_queue::{ChunkQueueError, ChunkQueuePopper, QueueId};
use crate::condition::ConditionVariable;

/// Most chunks one receiver may hold at once.
pub const MAX_CHUNKS_HELD_PER_RECEIVER: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub max_chunks_held: u32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_chunks_held: MAX_CHUNKS_HELD_PER_RECEIVER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkReceiveError {
    /// [`ReceiverConfig::max_chunks_held`] chunks are already held. Nothing
    /// was popped.
    TooManyChunksHeldInParallel,
    /// The queue held a pointer that does not name a live chunk.
    InvalidChunk(RelativePointerData),
    Queue(ChunkQueueError),
}

impl fmt::Display for ChunkReceiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyChunksHeldInParallel => write!(f, "too many chunks held in parallel"),
            Self::InvalidChunk(ptr) => write!(f, "received invalid chunk {ptr:?}"),
            Self::Queue(e) => write!(f, "chunk queue failure: {e}"),
        }
    }
}

impl std::error::Error for ChunkReceiveError {}

/// Pops chunks from its queue and hands them out as guards.
pub struct ChunkReceiver {
    popper: Mutex<ChunkQueuePopper>,
    config: ReceiverConfig,
    held: AtomicU32,
}

impl ChunkReceiver {
    pub fn new(popper: ChunkQueuePopper, config: ReceiverConfig) -> Self {
        Self {
            popper: Mutex::new(popper),
            config,
            held: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn queue_id(&self) -> QueueId {
        self.popper.lock().id()
    }

    /// Chunks currently held through [`ReceivedChunk`] guards.
    #[inline]
    pub fn held_chunks(&self) -> u32 {
        self.held.load(Ordering::Acquire)
    }

    /// Take the oldest queued chunk.
    pub fn try_get(&self) -> Result<Option<ReceivedChunk<'_>>, ChunkReceiveError> {
        let max = self.config.max_chunks_held;
        if self
            .held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            return Err(ChunkReceiveError::TooManyChunksHeldInParallel);
        }

        match self.popper.lock().try_pop() {
            Ok(Some(chunk)) => Ok(Some(ReceivedChunk {
                receiver: self,
                chunk,
            })),
            Ok(None) => {
                self.unhold();
                Ok(None)
            }
            Err(ChunkQueueError::InvalidChunk(ptr)) => {
                self.unhold();
                tracing::warn!(chunk = ?ptr, "invalid chunk received");
                Err(ChunkReceiveError::InvalidChunk(ptr))
            }
            Err(e) => {
                self.unhold();
                tracing::warn!(error = %e, "chunk queue failure");
                Err(ChunkReceiveError::Queue(e))
            }
        }
    }

    fn unhold(&self) {
        let prev = self.held.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "held chunk counter underflow");
    }

    pub fn has_new_chunks(&self) -> bool {
        !self.popper.lock().is_empty()
    }

    /// Whether chunks were lost since the last call. Clears the flag.
    pub fn has_lost_chunks(&self) -> bool {
        self.popper.lock().has_lost_chunks()
    }

    /// Release everything still queued.
    pub fn clear(&self) {
        self.popper.lock().clear();
    }

    pub fn set_queue_capacity(&self, capacity: u32) -> bool {
        self.popper.lock().set_capacity(capacity)
    }

    /// Have every push into this receiver's queue notify `condition_variable`
    /// at `index`.
    pub fn attach_condition_variable(
        &self,
        condition_variable: &ConditionVariable,
        index: u32,
    ) -> Result<(), ChunkQueueError> {
        self.popper
            .lock()
            .attach_condition_variable(condition_variable.relative(), index)
    }

    pub fn detach_condition_variable(&self) {
        self.popper.lock().detach_condition_variable();
    }

    pub fn is_condition_variable_attached(&self) -> bool {
        self.popper.lock().is_condition_variable_attached()
    }
}

impl Drop for ChunkReceiver {
    fn drop(&mut self) {
        self.popper.get_mut().clear();
    }
}

impl fmt::Debug for ChunkReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkReceiver")
            .field("popper", &*self.popper.lock())
            .field("held", &self.held_chunks())
            .finish()
    }
}

/// A chunk taken from a [`ChunkReceiver`]. Dropping it releases the
/// reference.
pub struct ReceivedChunk<'a> {
    receiver: &'a ChunkReceiver,
    chunk: SharedChunk,
}

impl ReceivedChunk<'_> {
    #[inline]
    pub fn header(&self) -> &ChunkHeader {
        self.chunk.header()
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.chunk.payload()
    }

    #[inline]
    pub fn chunk(&self) -> &SharedChunk {
        &self.chunk
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ReceivedChunk<'_> {
    fn drop(&mut self) {
        self.receiver.unhold();
    }
}

impl fmt::Debug for ReceivedChunk<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedChunk").field("chunk", &self.chunk).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_queue::tests::Fixture;
    use crate::chunk_queue::{ChunkQueueConfig, QueueFullPolicy};

    #[test]
    fn receive_in_order_and_release() {
        let mut fx = Fixture::new(8, 8);
        let (mut tx, rx) = fx.queue(ChunkQueueConfig::default());
        let receiver = ChunkReceiver::new(rx, ReceiverConfig::default());
        assert!(!receiver.has_new_chunks());
        assert!(receiver.try_get().unwrap().is_none());

        tx.push(fx.chunk(1));
        tx.push(fx.chunk(2));
        assert!(receiver.has_new_chunks());

        let a = receiver.try_get().unwrap().unwrap();
        let b = receiver.try_get().unwrap().unwrap();
        assert_eq!((a.payload()[0], b.payload()[0]), (1, 2));
        assert_eq!(receiver.held_chunks(), 2);
        a.release();
        drop(b);
        assert_eq!(receiver.held_chunks(), 0);
        assert_eq!(fx.used_chunks(), 0);
    }

    #[test]
    fn held_limit_checked_before_popping() {
        let mut fx = Fixture::new(8, 8);
        let (mut tx, rx) = fx.queue(ChunkQueueConfig::default());
        let receiver = ChunkReceiver::new(rx, ReceiverConfig { max_chunks_held: 1 });
        tx.push(fx.chunk(1));
        tx.push(fx.chunk(2));

        let first = receiver.try_get().unwrap().unwrap();
        assert_eq!(
            receiver.try_get().unwrap_err(),
            ChunkReceiveError::TooManyChunksHeldInParallel
        );
        assert_eq!(fx.used_chunks(), 2);
        drop(first);
        assert_eq!(receiver.try_get().unwrap().unwrap().payload()[0], 2);
    }

    #[test]
    fn lost_chunks_are_reported_once() {
        let mut fx = Fixture::new(8, 8);
        let (mut tx, rx) = fx.queue(ChunkQueueConfig::new(1, QueueFullPolicy::RejectNewest));
        let receiver = ChunkReceiver::new(rx, ReceiverConfig::default());
        tx.push(fx.chunk(1));
        tx.push(fx.chunk(2));
        assert!(receiver.has_lost_chunks());
        assert!(!receiver.has_lost_chunks());
    }

    #[test]
    fn dropping_the_receiver_drains_its_queue() {
        let mut fx = Fixture::new(8, 8);
        let (mut tx, rx) = fx.queue(ChunkQueueConfig::default());
        let receiver = ChunkReceiver::new(rx, ReceiverConfig::default());
        for v in 0..4 {
            tx.push(fx.chunk(v));
        }
        assert_eq!(fx.used_chunks(), 4);
        drop(receiver);
        assert_eq!(fx.used_chunks(), 0);
    }
}
