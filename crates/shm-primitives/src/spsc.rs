//! Single-producer single-consumer FIFO in a shared memory region.
//!
//! Positions are monotonically increasing `u64` counters; the slot of a
//! position is `pos % capacity`, so any non-zero capacity works. The ring is
//! full when `write - read == capacity` and empty when `write == read`.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr;

use crate::region::Region;
use crate::sync::{AtomicU64, Ordering};

/// SPSC ring header (192 bytes, cache-line aligned fields).
#[repr(C)]
pub struct SpscRingHeader {
    /// Producer publication position (written by producer, read by consumer).
    pub write_pos: AtomicU64,
    _pad1: [u8; 56],

    /// Consumer position (written by consumer, read by producer).
    pub read_pos: AtomicU64,
    _pad2: [u8; 56],

    /// Ring capacity (immutable after init).
    pub capacity: u32,
    _pad3: [u8; 60],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<SpscRingHeader>() == 192);

impl SpscRingHeader {
    pub fn init(&mut self, capacity: u32) {
        assert!(capacity > 0, "capacity must be > 0");
        self.write_pos = AtomicU64::new(0);
        self._pad1 = [0; 56];
        self.read_pos = AtomicU64::new(0);
        self._pad2 = [0; 56];
        self.capacity = capacity;
        self._pad3 = [0; 60];
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        read >= write
    }

    #[inline]
    pub fn len(&self) -> u64 {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        write.saturating_sub(read)
    }
}

/// A wait-free SPSC ring of `Copy` entries in a shared memory region.
///
/// The ring itself is only a view; exactly one thread (or process) may act as
/// producer and exactly one as consumer at any time.
pub struct SpscRing<T> {
    region: Region,
    header_offset: usize,
    entries_offset: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for SpscRing<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region,
            header_offset: self.header_offset,
            entries_offset: self.entries_offset,
            _marker: PhantomData,
        }
    }
}

unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T: Copy> SpscRing<T> {
    /// Bytes needed for a ring of `capacity` entries, header included.
    pub const fn required_size(capacity: u32) -> usize {
        size_of::<SpscRingHeader>() + capacity as usize * size_of::<T>()
    }

    /// Initialize a new ring in the region.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during initialization.
    pub unsafe fn init(region: Region, header_offset: usize, capacity: u32) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        assert!(
            header_offset.is_multiple_of(64),
            "header_offset must be 64-byte aligned"
        );
        assert!(align_of::<T>() <= 64, "entry alignment must be <= 64");

        let entries_offset = header_offset + size_of::<SpscRingHeader>();
        let required = header_offset + Self::required_size(capacity);
        assert!(required <= region.len(), "region too small for ring");

        let header = unsafe { region.get_mut::<SpscRingHeader>(header_offset) };
        header.init(capacity);

        Self {
            region,
            header_offset,
            entries_offset,
            _marker: PhantomData,
        }
    }

    /// Attach to an existing ring in the region.
    ///
    /// # Safety
    ///
    /// The region must contain a valid, initialized ring header.
    pub unsafe fn attach(region: Region, header_offset: usize) -> Result<Self, &'static str> {
        if !header_offset.is_multiple_of(64) {
            return Err("header_offset must be 64-byte aligned");
        }
        if header_offset + size_of::<SpscRingHeader>() > region.len() {
            return Err("region too small for ring header");
        }

        let entries_offset = header_offset + size_of::<SpscRingHeader>();
        let header = unsafe { region.get::<SpscRingHeader>(header_offset) };
        let capacity = header.capacity;
        if capacity == 0 {
            return Err("invalid ring capacity");
        }
        if header_offset + Self::required_size(capacity) > region.len() {
            return Err("region too small for ring");
        }

        Ok(Self {
            region,
            header_offset,
            entries_offset,
            _marker: PhantomData,
        })
    }

    #[inline]
    fn header(&self) -> &SpscRingHeader {
        unsafe { self.region.get::<SpscRingHeader>(self.header_offset) }
    }

    #[inline]
    unsafe fn entry_ptr(&self, slot: usize) -> *mut T {
        let base = unsafe { self.region.offset(self.entries_offset) };
        unsafe { base.add(slot * size_of::<T>()) as *mut T }
    }

    /// Split into producer and consumer handles.
    pub fn split(&self) -> (SpscProducer<'_, T>, SpscConsumer<'_, T>) {
        (SpscProducer { ring: self }, SpscConsumer { ring: self })
    }

    /// Producer handle alone.
    ///
    /// # Safety
    ///
    /// No other producer handle for this ring may be used concurrently, in
    /// this process or any other.
    pub unsafe fn producer(&self) -> SpscProducer<'_, T> {
        SpscProducer { ring: self }
    }

    /// Consumer handle alone.
    ///
    /// # Safety
    ///
    /// No other consumer handle for this ring may be used concurrently, in
    /// this process or any other.
    pub unsafe fn consumer(&self) -> SpscConsumer<'_, T> {
        SpscConsumer { ring: self }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.header().is_empty()
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.header().len()
    }
}

/// Producer handle for the ring.
pub struct SpscProducer<'a, T> {
    ring: &'a SpscRing<T>,
}

/// Consumer handle for the ring.
pub struct SpscConsumer<'a, T> {
    ring: &'a SpscRing<T>,
}

/// Result of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Ok,
    WouldBlock,
}

impl PushResult {
    #[inline]
    pub fn is_would_block(self) -> bool {
        matches!(self, PushResult::WouldBlock)
    }
}

impl<T: Copy> SpscProducer<'_, T> {
    /// Try to push an entry; `WouldBlock` when the ring is full.
    pub fn try_push(&mut self, entry: T) -> PushResult {
        let header = self.ring.header();
        let capacity = header.capacity as u64;

        // Only this producer writes write_pos.
        let write = header.write_pos.load(Ordering::Relaxed);
        let read = header.read_pos.load(Ordering::Acquire);
        if write.wrapping_sub(read) >= capacity {
            return PushResult::WouldBlock;
        }

        let slot = (write % capacity) as usize;
        unsafe { ptr::write(self.ring.entry_ptr(slot), entry) };

        header
            .write_pos
            .store(write.wrapping_add(1), Ordering::Release);

        PushResult::Ok
    }

    /// Push an entry, returning `false` when the ring is full.
    #[inline]
    pub fn push(&mut self, entry: T) -> bool {
        self.try_push(entry) == PushResult::Ok
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.available_capacity() == 0
    }

    /// Number of entries that can be pushed (approximate).
    #[inline]
    pub fn available_capacity(&self) -> u64 {
        let header = self.ring.header();
        let capacity = header.capacity as u64;
        let write = header.write_pos.load(Ordering::Relaxed);
        let read = header.read_pos.load(Ordering::Acquire);
        capacity.saturating_sub(write.wrapping_sub(read))
    }
}

impl<T: Copy> SpscConsumer<'_, T> {
    /// Try to pop the oldest entry.
    pub fn try_pop(&mut self) -> Option<T> {
        let header = self.ring.header();
        let read = header.read_pos.load(Ordering::Relaxed);
        let write = header.write_pos.load(Ordering::Acquire);

        if read == write {
            return None;
        }

        let slot = (read % header.capacity as u64) as usize;
        let entry = unsafe { ptr::read(self.ring.entry_ptr(slot)) };
        header
            .read_pos
            .store(read.wrapping_add(1), Ordering::Release);

        Some(entry)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Number of entries available to pop (approximate).
    #[inline]
    pub fn len(&self) -> u64 {
        self.ring.len()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::region::HeapRegion;
    use alloc::vec::Vec;

    #[test]
    fn fifo_order_with_non_power_of_two_capacity() {
        let owner = HeapRegion::new_zeroed(4096);
        let ring: SpscRing<u64> = unsafe { SpscRing::init(owner.region(), 0, 3) };
        let (mut tx, mut rx) = ring.split();

        let mut out = Vec::new();
        for round in 0..5u64 {
            assert!(tx.push(round * 10));
            assert!(tx.push(round * 10 + 1));
            out.push(rx.try_pop().unwrap());
            out.push(rx.try_pop().unwrap());
        }
        assert_eq!(out, [0, 1, 10, 11, 20, 21, 30, 31, 40, 41]);
        assert!(rx.try_pop().is_none());
    }

    #[test]
    fn full_ring_rejects_and_keeps_contents() {
        let owner = HeapRegion::new_zeroed(4096);
        let ring: SpscRing<u64> = unsafe { SpscRing::init(owner.region(), 0, 3) };
        let (mut tx, mut rx) = ring.split();

        assert!(tx.push(1));
        assert!(tx.push(2));
        assert!(tx.push(3));
        assert!(tx.is_full());
        assert!(tx.try_push(4).is_would_block());
        assert_eq!(ring.len(), 3);

        assert_eq!(rx.try_pop(), Some(1));
        assert_eq!(tx.available_capacity(), 1);
        assert!(tx.push(4));
        assert_eq!(rx.try_pop(), Some(2));
        assert_eq!(rx.try_pop(), Some(3));
        assert_eq!(rx.try_pop(), Some(4));
        assert!(rx.is_empty());
    }

    #[test]
    fn attach_shares_positions() {
        let owner = HeapRegion::new_zeroed(4096);
        let ring: SpscRing<u32> = unsafe { SpscRing::init(owner.region(), 64, 5) };
        let (mut tx, _) = ring.split();
        assert!(tx.push(7));

        let attached: SpscRing<u32> = unsafe { SpscRing::attach(owner.region(), 64) }.unwrap();
        assert_eq!(attached.capacity(), 5);
        let (_, mut rx) = attached.split();
        assert_eq!(rx.try_pop(), Some(7));
        assert!(ring.is_empty());
    }

    #[test]
    fn threaded_transfer_preserves_order() {
        use std::sync::Arc;

        const N: u64 = 10_000;
        let owner = Arc::new(HeapRegion::new_zeroed(4096));
        let ring: Arc<SpscRing<u64>> = Arc::new(unsafe { SpscRing::init(owner.region(), 0, 7) });

        let producer_ring = ring.clone();
        let producer_owner = owner.clone();
        let producer = std::thread::spawn(move || {
            let _keep = producer_owner;
            let mut tx = unsafe { producer_ring.producer() };
            for i in 0..N {
                while !tx.push(i) {
                    std::thread::yield_now();
                }
            }
        });

        let mut rx = unsafe { ring.consumer() };
        let mut expected = 0;
        while expected < N {
            match rx.try_pop() {
                Some(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
    }
}
