//! Sender-side fan-out of chunks to every connected queue, with a history
//! of recent chunks for late joiners.

use std::collections::VecDeque;
use std::fmt;

use chunkpipe_pool::SharedChunk;
use parking_lot::Mutex;

use crate::chunk_queue::{ChunkQueuePusher, PushOutcome, QueueId};

/// Most queues one distributor delivers to.
pub const MAX_QUEUES_PER_DISTRIBUTOR: usize = 256;

/// Largest history a distributor keeps.
pub const MAX_HISTORY_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDistributorError {
    /// Already delivering to [`MAX_QUEUES_PER_DISTRIBUTOR`] queues.
    QueueContainerOverflow,
    /// No stored queue has this id.
    UnknownQueue(QueueId),
}

impl fmt::Display for ChunkDistributorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueContainerOverflow => {
                write!(f, "distributor already holds {MAX_QUEUES_PER_DISTRIBUTOR} queues")
            }
            Self::UnknownQueue(id) => write!(f, "{id} is not connected"),
        }
    }
}

impl std::error::Error for ChunkDistributorError {}

struct DistributorState {
    queues: Vec<ChunkQueuePusher>,
    history: VecDeque<SharedChunk>,
}

/// Delivers each chunk to all stored queues.
///
/// Every queue gets its own reference; the history keeps one more per stored
/// chunk. Registration and delivery share one lock, so a late joiner sees
/// either a chunk in its history or in its queue, never both or neither.
pub struct ChunkDistributor {
    state: Mutex<DistributorState>,
    history_capacity: usize,
}

impl ChunkDistributor {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            state: Mutex::new(DistributorState {
                queues: Vec::new(),
                history: VecDeque::with_capacity(history_capacity.min(MAX_HISTORY_CAPACITY)),
            }),
            history_capacity: history_capacity.min(MAX_HISTORY_CAPACITY),
        }
    }

    #[inline]
    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    /// Start delivering to `queue`, first handing it up to `request_history`
    /// of the most recent chunks, oldest first.
    ///
    /// Adding a queue that is already stored does nothing.
    pub fn add_queue(
        &self,
        mut queue: ChunkQueuePusher,
        request_history: usize,
    ) -> Result<(), ChunkDistributorError> {
        let mut state = self.state.lock();
        let id = queue.id();
        if state.queues.iter().any(|q| q.id() == id) {
            tracing::debug!(queue = %id, "queue already connected");
            return Ok(());
        }
        if state.queues.len() >= MAX_QUEUES_PER_DISTRIBUTOR {
            tracing::warn!(queue = %id, "distributor queue container overflow");
            return Err(ChunkDistributorError::QueueContainerOverflow);
        }

        let replay = request_history.min(state.history.len());
        let skip = state.history.len() - replay;
        for chunk in state.history.iter().skip(skip) {
            queue.push(chunk.clone());
        }
        tracing::debug!(queue = %id, replay, "queue connected");
        state.queues.push(queue);
        Ok(())
    }

    /// Stop delivering to `id`. Returns whether it was stored.
    pub fn remove_queue(&self, id: QueueId) -> bool {
        let mut state = self.state.lock();
        let before = state.queues.len();
        state.queues.retain(|q| q.id() != id);
        let removed = state.queues.len() != before;
        if removed {
            tracing::debug!(queue = %id, "queue disconnected");
        }
        removed
    }

    pub fn remove_all_queues(&self) {
        self.state.lock().queues.clear();
    }

    pub fn has_stored_queues(&self) -> bool {
        !self.state.lock().queues.is_empty()
    }

    pub fn queue_count(&self) -> usize {
        self.state.lock().queues.len()
    }

    /// Push `chunk` into every stored queue and record it in the history.
    /// Returns how many queues accepted it.
    pub fn deliver_to_all_stored_queues(&self, chunk: SharedChunk) -> usize {
        let mut state = self.state.lock();
        let mut delivered = 0;
        for queue in state.queues.iter_mut() {
            if queue.push(chunk.clone()).is_queued() {
                delivered += 1;
            }
        }
        tracing::trace!(
            chunk = ?chunk.relative(),
            delivered,
            queues = state.queues.len(),
            "chunk delivered"
        );
        self.push_history(&mut state, chunk);
        delivered
    }

    /// Push `chunk` into the stored queue `id` only. The history is untouched.
    pub fn deliver_to_queue(
        &self,
        id: QueueId,
        chunk: SharedChunk,
    ) -> Result<PushOutcome, ChunkDistributorError> {
        let mut state = self.state.lock();
        let queue = state
            .queues
            .iter_mut()
            .find(|q| q.id() == id)
            .ok_or(ChunkDistributorError::UnknownQueue(id))?;
        Ok(queue.push(chunk))
    }

    /// Record `chunk` for late joiners without delivering it.
    pub fn add_to_history_without_delivery(&self, chunk: SharedChunk) {
        let mut state = self.state.lock();
        self.push_history(&mut state, chunk);
    }

    pub fn history_size(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Release every chunk in the history.
    pub fn clear_history(&self) {
        self.state.lock().history.clear();
    }

    fn push_history(&self, state: &mut DistributorState, chunk: SharedChunk) {
        if self.history_capacity == 0 {
            return;
        }
        if state.history.len() == self.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(chunk);
    }
}

impl fmt::Debug for ChunkDistributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChunkDistributor")
            .field("queues", &state.queues.len())
            .field("history", &state.history.len())
            .field("history_capacity", &self.history_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_queue::tests::Fixture;
    use crate::chunk_queue::{ChunkQueueConfig, ChunkQueuePopper, QueueFullPolicy};

    fn values(popper: &mut ChunkQueuePopper) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = popper.try_pop().unwrap() {
            out.push(chunk.payload()[0]);
        }
        out
    }

    #[test]
    fn delivers_one_reference_per_queue() {
        let mut fx = Fixture::new(8, 8);
        let dist = ChunkDistributor::new(0);
        let (tx1, mut rx1) = fx.queue(ChunkQueueConfig::default());
        let (tx2, mut rx2) = fx.queue(ChunkQueueConfig::default());
        dist.add_queue(tx1, 0).unwrap();
        dist.add_queue(tx2, 0).unwrap();

        let chunk = fx.chunk(7);
        let probe = chunk.clone();
        assert_eq!(dist.deliver_to_all_stored_queues(chunk), 2);
        assert_eq!(probe.ref_count(), 3);
        drop(probe);

        assert_eq!(values(&mut rx1), [7]);
        assert_eq!(values(&mut rx2), [7]);
        assert_eq!(fx.used_chunks(), 0);
    }

    #[test]
    fn no_queues_drops_the_reference() {
        let fx = Fixture::new(8, 8);
        let dist = ChunkDistributor::new(0);
        assert_eq!(dist.deliver_to_all_stored_queues(fx.chunk(1)), 0);
        assert_eq!(fx.used_chunks(), 0);
    }

    #[test]
    fn late_joiner_gets_requested_history() {
        let mut fx = Fixture::new(8, 8);
        let dist = ChunkDistributor::new(3);
        for v in 1..=4 {
            dist.deliver_to_all_stored_queues(fx.chunk(v));
        }
        assert_eq!(dist.history_size(), 3);
        assert_eq!(fx.used_chunks(), 3);

        let (tx, mut rx) = fx.queue(ChunkQueueConfig::default());
        dist.add_queue(tx, 2).unwrap();
        assert_eq!(values(&mut rx), [3, 4]);

        let (tx, mut rx) = fx.queue(ChunkQueueConfig::default());
        dist.add_queue(tx, 10).unwrap();
        assert_eq!(values(&mut rx), [2, 3, 4]);

        dist.clear_history();
        assert_eq!(fx.used_chunks(), 0);
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let mut fx = Fixture::new(8, 8);
        let dist = ChunkDistributor::new(0);
        let (tx, mut rx) = fx.queue(ChunkQueueConfig::default());
        let id = tx.id();
        let again = unsafe { ChunkQueuePusher::attach(fx.registry.clone(), id) }.unwrap();
        dist.add_queue(tx, 0).unwrap();
        dist.add_queue(again, 0).unwrap();
        assert_eq!(dist.queue_count(), 1);

        dist.deliver_to_all_stored_queues(fx.chunk(5));
        assert_eq!(values(&mut rx), [5]);
    }

    #[test]
    fn remove_and_targeted_delivery() {
        let mut fx = Fixture::new(8, 8);
        let dist = ChunkDistributor::new(0);
        let (tx1, mut rx1) = fx.queue(ChunkQueueConfig::default());
        let (tx2, mut rx2) = fx.queue(ChunkQueueConfig::default());
        let (id1, id2) = (tx1.id(), tx2.id());
        dist.add_queue(tx1, 0).unwrap();
        dist.add_queue(tx2, 0).unwrap();

        assert_eq!(dist.deliver_to_queue(id2, fx.chunk(9)), Ok(PushOutcome::Queued));
        assert!(dist.remove_queue(id1));
        assert!(!dist.remove_queue(id1));
        assert_eq!(
            dist.deliver_to_queue(id1, fx.chunk(1)),
            Err(ChunkDistributorError::UnknownQueue(id1))
        );
        assert_eq!(dist.deliver_to_all_stored_queues(fx.chunk(10)), 1);
        assert!(values(&mut rx1).is_empty());
        assert_eq!(values(&mut rx2), [9, 10]);

        dist.remove_all_queues();
        assert!(!dist.has_stored_queues());
        assert_eq!(fx.used_chunks(), 0);
    }

    #[test]
    fn history_without_delivery() {
        let mut fx = Fixture::new(8, 8);
        let dist = ChunkDistributor::new(2);
        let (tx, mut rx) = fx.queue(ChunkQueueConfig::new(4, QueueFullPolicy::RejectNewest));
        dist.add_queue(tx, 0).unwrap();
        dist.add_to_history_without_delivery(fx.chunk(1));
        assert!(values(&mut rx).is_empty());
        assert_eq!(dist.history_size(), 1);
    }
}
