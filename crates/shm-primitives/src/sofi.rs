//! Safely-overflowing FIFO: one producer, any number of consumers.
//!
//! Values are `u64` words (packed relative pointers in practice) stored in
//! atomic slots, so a consumer racing the producer reads a stale word at
//! worst, never a torn one; its read-position CAS then fails and it retries.
//!
//! The ring keeps `capacity + 1` slots in use. When a push leaves no free
//! slot for the next push, the producer itself advances the read position
//! and hands the evicted (oldest) value back to the caller. If a consumer
//! wins that race instead, nothing is evicted.

use core::mem::size_of;

use crate::region::Region;
use crate::sync::{AtomicU32, AtomicU64, Ordering, spin_loop};

const INTERNAL_SIZE_ADD_ON: u32 = 1;

/// SoFi header (192 bytes).
#[repr(C)]
pub struct SofiHeader {
    pub write_pos: AtomicU64,
    _pad1: [u8; 56],

    pub read_pos: AtomicU64,
    _pad2: [u8; 56],

    /// Slots currently in use (`capacity + 1`); changes only while empty.
    pub internal_size: AtomicU32,
    /// Largest capacity the reserved slot storage allows.
    pub max_capacity: u32,
    _pad3: [u8; 56],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<SofiHeader>() == 192);

/// A view of a SoFi queue in a shared memory region.
#[derive(Clone)]
pub struct Sofi {
    region: Region,
    header_offset: usize,
    slots_offset: usize,
}

unsafe impl Send for Sofi {}
unsafe impl Sync for Sofi {}

impl Sofi {
    /// Bytes needed for a queue that may grow up to `max_capacity`.
    pub const fn required_size(max_capacity: u32) -> usize {
        size_of::<SofiHeader>()
            + (max_capacity as usize + INTERNAL_SIZE_ADD_ON as usize) * size_of::<AtomicU64>()
    }

    /// Initialize a queue holding up to `capacity` values, with storage
    /// reserved for `max_capacity`.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during initialization.
    pub unsafe fn init(region: Region, header_offset: usize, capacity: u32, max_capacity: u32) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        assert!(capacity <= max_capacity, "capacity exceeds max_capacity");
        assert!(max_capacity < u32::MAX, "max_capacity too large");
        assert!(
            header_offset.is_multiple_of(64),
            "header_offset must be 64-byte aligned"
        );
        assert!(
            header_offset + Self::required_size(max_capacity) <= region.len(),
            "region too small for sofi"
        );

        let slots_offset = header_offset + size_of::<SofiHeader>();
        unsafe {
            let header = region.offset(header_offset) as *mut SofiHeader;
            core::ptr::write(
                header,
                SofiHeader {
                    write_pos: AtomicU64::new(0),
                    _pad1: [0; 56],
                    read_pos: AtomicU64::new(0),
                    _pad2: [0; 56],
                    internal_size: AtomicU32::new(capacity + INTERNAL_SIZE_ADD_ON),
                    max_capacity,
                    _pad3: [0; 56],
                },
            );
            let slots = region.offset(slots_offset) as *mut AtomicU64;
            for i in 0..(max_capacity + INTERNAL_SIZE_ADD_ON) as usize {
                core::ptr::write(slots.add(i), AtomicU64::new(0));
            }
        }

        Self {
            region,
            header_offset,
            slots_offset,
        }
    }

    /// Attach to an initialized queue.
    ///
    /// # Safety
    ///
    /// The region must contain a queue initialized with [`Sofi::init`].
    pub unsafe fn attach(region: Region, header_offset: usize) -> Result<Self, &'static str> {
        if !header_offset.is_multiple_of(64) {
            return Err("header_offset must be 64-byte aligned");
        }
        if header_offset + size_of::<SofiHeader>() > region.len() {
            return Err("region too small for sofi header");
        }
        let header = unsafe { region.get::<SofiHeader>(header_offset) };
        let size = header.internal_size.load(Ordering::Relaxed);
        if size <= INTERNAL_SIZE_ADD_ON || size - INTERNAL_SIZE_ADD_ON > header.max_capacity {
            return Err("invalid sofi capacity");
        }
        if header_offset + Self::required_size(header.max_capacity) > region.len() {
            return Err("region too small for sofi");
        }
        Ok(Self {
            region,
            header_offset,
            slots_offset: header_offset + size_of::<SofiHeader>(),
        })
    }

    #[inline]
    fn header(&self) -> &SofiHeader {
        unsafe { self.region.get::<SofiHeader>(self.header_offset) }
    }

    #[inline]
    fn slot(&self, pos: u64, size: u32) -> &AtomicU64 {
        let index = (pos % size as u64) as usize;
        unsafe { &*(self.region.offset(self.slots_offset) as *const AtomicU64).add(index) }
    }

    /// Producer handle.
    ///
    /// # Safety
    ///
    /// At most one producer may push at any time, across all processes.
    pub unsafe fn producer(&self) -> SofiProducer<'_> {
        SofiProducer { sofi: self }
    }

    /// Consumer handle. Any number may pop concurrently.
    pub fn consumer(&self) -> SofiConsumer<'_> {
        SofiConsumer { sofi: self }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().internal_size.load(Ordering::Relaxed) - INTERNAL_SIZE_ADD_ON
    }

    #[inline]
    pub fn max_capacity(&self) -> u32 {
        self.header().max_capacity
    }

    /// Number of queued values (a consistent snapshot of both positions).
    pub fn size(&self) -> u64 {
        let header = self.header();
        loop {
            let read = header.read_pos.load(Ordering::Relaxed);
            let write = header.write_pos.load(Ordering::Relaxed);
            if header.write_pos.load(Ordering::Relaxed) == write
                && header.read_pos.load(Ordering::Relaxed) == read
            {
                return write.saturating_sub(read);
            }
            spin_loop();
        }
    }

    pub fn is_empty(&self) -> bool {
        let header = self.header();
        loop {
            // Read position first: the producer may advance it on overflow.
            let read = header.read_pos.load(Ordering::Acquire);
            let write = header.write_pos.load(Ordering::Acquire);
            if header.read_pos.load(Ordering::Acquire) == read {
                return write == read;
            }
            spin_loop();
        }
    }

    /// Change the capacity. Only succeeds while the queue is empty and the
    /// new capacity fits the reserved storage. The read and write positions
    /// are kept, so an empty queue stays empty under the new size.
    ///
    /// Must not race with a push.
    pub fn set_capacity(&self, capacity: u32) -> bool {
        let header = self.header();
        if capacity == 0 || capacity > header.max_capacity || !self.is_empty() {
            return false;
        }
        header
            .internal_size
            .store(capacity + INTERNAL_SIZE_ADD_ON, Ordering::Release);
        true
    }
}

/// The single pushing side of a [`Sofi`].
pub struct SofiProducer<'a> {
    sofi: &'a Sofi,
}

impl SofiProducer<'_> {
    /// Push a value. Returns the evicted oldest value when the queue was full.
    pub fn push(&mut self, value: u64) -> Option<u64> {
        let header = self.sofi.header();
        let size = header.internal_size.load(Ordering::Relaxed);

        let write = header.write_pos.load(Ordering::Relaxed);
        let next_write = write + 1;

        self.sofi.slot(write, size).store(value, Ordering::Relaxed);
        header.write_pos.store(next_write, Ordering::Release);

        let read = header.read_pos.load(Ordering::Acquire);
        if next_write < read + size as u64 {
            return None;
        }

        // No free slot for the next push: evict the oldest unless a consumer
        // took it meanwhile.
        match header
            .read_pos
            .compare_exchange(read, read + 1, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => Some(self.sofi.slot(read, size).load(Ordering::Relaxed)),
            Err(_) => None,
        }
    }
}

/// A popping side of a [`Sofi`]; cheap to create, safe to share.
#[derive(Clone, Copy)]
pub struct SofiConsumer<'a> {
    sofi: &'a Sofi,
}

impl SofiConsumer<'_> {
    /// Pop the oldest value.
    pub fn pop(&self) -> Option<u64> {
        let header = self.sofi.header();
        let size = header.internal_size.load(Ordering::Relaxed);
        let mut read = header.read_pos.load(Ordering::Acquire);

        loop {
            if read == header.write_pos.load(Ordering::Acquire) {
                return None;
            }
            let value = self.sofi.slot(read, size).load(Ordering::Relaxed);
            match header.read_pos.compare_exchange_weak(
                read,
                read + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(value),
                Err(current) => read = current,
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sofi.is_empty()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::region::HeapRegion;
    use alloc::vec::Vec;

    fn sofi(capacity: u32, max_capacity: u32) -> (HeapRegion, Sofi) {
        let owner = HeapRegion::new_zeroed(4096);
        let sofi = unsafe { Sofi::init(owner.region(), 0, capacity, max_capacity) };
        (owner, sofi)
    }

    #[test]
    fn pops_in_push_order() {
        let (_owner, sofi) = sofi(4, 16);
        let mut tx = unsafe { sofi.producer() };
        for v in 1..=3 {
            assert_eq!(tx.push(v), None);
        }
        assert_eq!(sofi.size(), 3);
        let rx = sofi.consumer();
        let out: Vec<u64> = core::iter::from_fn(|| rx.pop()).collect();
        assert_eq!(out, [1, 2, 3]);
        assert!(sofi.is_empty());
    }

    #[test]
    fn overflow_evicts_the_oldest() {
        let (_owner, sofi) = sofi(3, 16);
        let mut tx = unsafe { sofi.producer() };
        assert_eq!(tx.push(1), None);
        assert_eq!(tx.push(2), None);
        assert_eq!(tx.push(3), None);
        assert_eq!(tx.push(4), Some(1));
        assert_eq!(tx.push(5), Some(2));
        assert_eq!(sofi.size(), 3);

        let rx = sofi.consumer();
        let out: Vec<u64> = core::iter::from_fn(|| rx.pop()).collect();
        assert_eq!(out, [3, 4, 5]);
    }

    #[test]
    fn capacity_one_keeps_only_the_newest() {
        let (_owner, sofi) = sofi(1, 1);
        let mut tx = unsafe { sofi.producer() };
        assert_eq!(tx.push(10), None);
        assert_eq!(tx.push(11), Some(10));
        assert_eq!(sofi.consumer().pop(), Some(11));
        assert_eq!(sofi.consumer().pop(), None);
    }

    #[test]
    fn set_capacity_requires_empty_and_reserved_storage() {
        let (_owner, sofi) = sofi(2, 8);
        let mut tx = unsafe { sofi.producer() };
        tx.push(1);
        assert!(!sofi.set_capacity(4));
        assert_eq!(sofi.consumer().pop(), Some(1));
        assert!(!sofi.set_capacity(9));
        assert!(!sofi.set_capacity(0));
        assert!(sofi.set_capacity(8));
        assert_eq!(sofi.capacity(), 8);
        for v in 0..8 {
            assert_eq!(tx.push(v), None);
        }
        assert_eq!(tx.push(8), Some(0));
    }

    #[test]
    fn set_capacity_keeps_positions() {
        let (_owner, sofi) = sofi(4, 8);
        let mut tx = unsafe { sofi.producer() };
        let rx = sofi.consumer();
        for v in 0..5 {
            tx.push(v);
            assert_eq!(rx.pop(), Some(v));
        }
        assert!(sofi.set_capacity(3));
        assert_eq!(sofi.header().write_pos.load(Ordering::Relaxed), 5);
        assert_eq!(sofi.header().read_pos.load(Ordering::Relaxed), 5);

        for v in 10..13 {
            assert_eq!(tx.push(v), None);
        }
        assert_eq!(tx.push(13), Some(10));
        let out: Vec<u64> = core::iter::from_fn(|| rx.pop()).collect();
        assert_eq!(out, [11, 12, 13]);
    }

    #[test]
    fn attach_sees_pushed_values() {
        let (owner, sofi) = sofi(4, 4);
        unsafe { sofi.producer() }.push(42);
        let other = unsafe { Sofi::attach(owner.region(), 0) }.unwrap();
        assert_eq!(other.capacity(), 4);
        assert_eq!(other.consumer().pop(), Some(42));
    }

    #[test]
    fn racing_consumers_see_each_value_once() {
        use std::collections::HashSet;
        use std::sync::{Arc, Mutex};

        const N: u64 = 5_000;
        let owner = Arc::new(HeapRegion::new_zeroed(4096));
        let sofi = Arc::new(unsafe { Sofi::init(owner.region(), 0, 8, 8) });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(core::sync::atomic::AtomicBool::new(false));

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let sofi = sofi.clone();
                let owner = owner.clone();
                let seen = seen.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let _keep = owner;
                    let rx = sofi.consumer();
                    let mut local = Vec::new();
                    loop {
                        match rx.pop() {
                            Some(v) => local.push(v),
                            None if done.load(core::sync::atomic::Ordering::Acquire) => break,
                            None => std::thread::yield_now(),
                        }
                    }
                    seen.lock().unwrap().extend(local);
                })
            })
            .collect();

        let mut evicted = Vec::new();
        let mut tx = unsafe { sofi.producer() };
        for v in 0..N {
            if let Some(old) = tx.push(v) {
                evicted.push(old);
            }
        }
        done.store(true, core::sync::atomic::Ordering::Release);
        for c in consumers {
            c.join().unwrap();
        }
        let rx = sofi.consumer();
        while let Some(v) = rx.pop() {
            seen.lock().unwrap().push(v);
        }

        let mut all = seen.lock().unwrap().clone();
        all.extend(evicted);
        assert_eq!(all.len() as u64, N);
        let unique: HashSet<u64> = all.into_iter().collect();
        assert_eq!(unique.len() as u64, N);
    }
}
