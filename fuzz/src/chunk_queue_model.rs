//! Chunk queue checker: every chunk reference ends up either queued or back
//! in its pool, whatever the overflow policy.

use std::collections::VecDeque;
use std::sync::Arc;

use chunkpipe_pool::{MePooConfig, MePooEntry, MemoryManager};
use chunkpipe_ports::{ChunkQueueConfig, PushOutcome, QueueFullPolicy, chunk_queue_size, create_chunk_queue};
use shm_primitives::{HeapRegion, SegmentRegistry, align_up};

pub const POOL_CHUNKS: u32 = 16;
pub const MAX_CAPACITY: u32 = 8;

#[derive(Clone, Copy, Debug)]
pub enum QueueOp {
    /// Allocate a chunk tagged with the value and push it.
    Send(u8),
    /// Pop one chunk and release it.
    Receive,
    /// Pop and release everything.
    Clear,
}

pub fn execute_and_verify(capacity: u32, discard_oldest: bool, ops: &[QueueOp]) -> Result<(), String> {
    let capacity = capacity.clamp(1, MAX_CAPACITY);
    let policy = if discard_oldest {
        QueueFullPolicy::DiscardOldestData
    } else {
        QueueFullPolicy::RejectNewest
    };
    let pools = MePooConfig::from_entries([MePooEntry::new(8, POOL_CHUNKS)]).map_err(|e| e.to_string())?;
    let pool_size = MemoryManager::required_size(&pools).map_err(|e| e.to_string())?;
    let queue_config = ChunkQueueConfig::new(capacity, policy);
    let queue_offset = align_up(pool_size, 64);
    let owner = HeapRegion::new_zeroed(queue_offset + chunk_queue_size(&queue_config));
    let registry = Arc::new(SegmentRegistry::new());
    registry
        .register(0, owner.region().as_ptr(), owner.len())
        .map_err(|e| e.to_string())?;
    let mm = unsafe { MemoryManager::init(owner.region(), 0, 0, &pools) }.map_err(|e| e.to_string())?;
    let (mut tx, mut rx) =
        unsafe { create_chunk_queue(owner.region(), queue_offset, 0, registry.clone(), &queue_config) }
            .map_err(|e| e.to_string())?;

    let mut expected: VecDeque<u8> = VecDeque::new();
    for (i, op) in ops.iter().enumerate() {
        match *op {
            QueueOp::Send(value) => {
                let mut chunk = match mm.allocate_default(1) {
                    Ok(chunk) => chunk,
                    Err(e) => return Err(format!("op {i}: allocation failed with {} queued: {e}", expected.len())),
                };
                let Some(payload) = chunk.payload_mut() else {
                    return Err(format!("op {i}: fresh chunk is shared"));
                };
                payload[0] = value;
                let full = expected.len() == capacity as usize;
                let outcome = tx.push(chunk);
                let want = match (full, policy) {
                    (false, _) => PushOutcome::Queued,
                    (true, QueueFullPolicy::DiscardOldestData) => PushOutcome::QueuedDiscardedOldest,
                    (true, QueueFullPolicy::RejectNewest) => PushOutcome::Rejected,
                };
                if outcome != want {
                    return Err(format!("op {i}: push gave {outcome:?}, expected {want:?}"));
                }
                match outcome {
                    PushOutcome::Queued => expected.push_back(value),
                    PushOutcome::QueuedDiscardedOldest => {
                        expected.pop_front();
                        expected.push_back(value);
                    }
                    PushOutcome::Rejected => {}
                }
                if outcome.lost_chunk() != rx.has_lost_chunks() {
                    return Err(format!("op {i}: lost flag disagrees with {outcome:?}"));
                }
            }
            QueueOp::Receive => {
                let got = rx
                    .try_pop()
                    .map_err(|e| format!("op {i}: {e}"))?
                    .map(|chunk| chunk.payload()[0]);
                let want = expected.pop_front();
                if got != want {
                    return Err(format!("op {i}: popped {got:?}, expected {want:?}"));
                }
            }
            QueueOp::Clear => {
                rx.clear();
                expected.clear();
            }
        }

        let used = mm.pool_info(0).map(|info| info.used_chunks).unwrap_or(u32::MAX);
        if used as usize != expected.len() {
            return Err(format!("after op {i}: {used} chunks in use, {} queued", expected.len()));
        }
    }
    Ok(())
}
