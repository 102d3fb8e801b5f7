//! Safely-overflowing FIFO checker: order kept, oldest evicted on overflow.

use std::collections::VecDeque;

use shm_primitives::{HeapRegion, Sofi};

pub const MAX_CAPACITY: u32 = 32;

#[derive(Clone, Copy, Debug)]
pub enum SofiOp {
    Push(u64),
    Pop,
    /// Try to change the capacity; only allowed while empty.
    SetCapacity(u8),
}

pub fn execute_and_verify(capacity: u32, ops: &[SofiOp]) -> Result<(), String> {
    let mut capacity = capacity.clamp(1, MAX_CAPACITY);
    let owner = HeapRegion::new_zeroed(Sofi::required_size(MAX_CAPACITY));
    let sofi = unsafe { Sofi::init(owner.region(), 0, capacity, MAX_CAPACITY) };
    let mut producer = unsafe { sofi.producer() };
    let consumer = sofi.consumer();
    let mut expected: VecDeque<u64> = VecDeque::new();

    for (i, op) in ops.iter().enumerate() {
        match *op {
            SofiOp::Push(value) => {
                let evicted = producer.push(value);
                let expected_evicted = if expected.len() == capacity as usize {
                    expected.pop_front()
                } else {
                    None
                };
                expected.push_back(value);
                if evicted != expected_evicted {
                    return Err(format!(
                        "op {i}: push evicted {evicted:?}, expected {expected_evicted:?}"
                    ));
                }
            }
            SofiOp::Pop => {
                let got = consumer.pop();
                let want = expected.pop_front();
                if got != want {
                    return Err(format!("op {i}: popped {got:?}, expected {want:?}"));
                }
            }
            SofiOp::SetCapacity(raw) => {
                let requested = raw as u32 % (MAX_CAPACITY + 2);
                let allowed = expected.is_empty() && (1..=MAX_CAPACITY).contains(&requested);
                if sofi.set_capacity(requested) != allowed {
                    return Err(format!(
                        "op {i}: set_capacity({requested}) with {} queued disagreed",
                        expected.len()
                    ));
                }
                if allowed {
                    capacity = requested;
                }
            }
        }
        if sofi.size() != expected.len() as u64 {
            return Err(format!(
                "after op {i}: size {} but {} expected",
                sofi.size(),
                expected.len()
            ));
        }
        if sofi.capacity() != capacity {
            return Err(format!("after op {i}: capacity {} != {capacity}", sofi.capacity()));
        }
    }
    Ok(())
}
