//! Free-list checker: no index handed out twice, none lost.

use std::collections::BTreeSet;

use shm_primitives::{HeapRegion, IndexList};

pub const MAX_CAPACITY: u32 = 64;

#[derive(Clone, Copy, Debug)]
pub enum IndexListOp {
    Pop,
    /// Push back the n-th currently allocated index (modulo the count).
    Push(u8),
}

pub fn execute_and_verify(capacity: u32, ops: &[IndexListOp]) -> Result<(), String> {
    let capacity = capacity.clamp(1, MAX_CAPACITY);
    let owner = HeapRegion::new_zeroed(IndexList::required_size(capacity));
    let list = unsafe { IndexList::init(owner.region(), 0, capacity) };
    let mut allocated: Vec<u32> = Vec::new();
    let mut free: BTreeSet<u32> = (0..capacity).collect();

    for (i, op) in ops.iter().enumerate() {
        match *op {
            IndexListOp::Pop => match list.pop() {
                Some(index) => {
                    if !free.remove(&index) {
                        return Err(format!("op {i}: popped {index}, which was not free"));
                    }
                    allocated.push(index);
                }
                None if !free.is_empty() => {
                    return Err(format!("op {i}: empty pop with {} free indices", free.len()));
                }
                None => {}
            },
            IndexListOp::Push(n) => {
                if allocated.is_empty() {
                    continue;
                }
                let index = allocated.swap_remove(n as usize % allocated.len());
                list.push(index);
                free.insert(index);
            }
        }
        if list.free_count() as usize != free.len() {
            return Err(format!(
                "after op {i}: free_count {} but {} indices free",
                list.free_count(),
                free.len()
            ));
        }
    }

    // Drain: exactly the free set comes back.
    let mut drained = BTreeSet::new();
    while let Some(index) = list.pop() {
        if !drained.insert(index) {
            return Err(format!("drain: {index} popped twice"));
        }
    }
    if drained != free {
        return Err(format!("drain: got {drained:?}, expected {free:?}"));
    }
    Ok(())
}
