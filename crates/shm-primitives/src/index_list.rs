//! Lock-free LIFO of `u32` slot indices (a Treiber stack over an index array).
//!
//! Memory layout at the list offset:
//!
//! ```text
//! +-----------------------------+
//! | IndexListHeader (64 bytes)  |  capacity, head = (tag << 32) | index
//! +-----------------------------+
//! | links[capacity] (AtomicU32) |  links[i] = index below i on the stack
//! +-----------------------------+
//! ```
//!
//! The next-links live in their own array instead of inside the slots they
//! describe, so a slot's payload can be handed out without clobbering the
//! list. The head tag is bumped by every push and pop, which makes a stale
//! `(index, next)` pair fail its CAS instead of corrupting the stack (ABA),
//! without needing a double-width CAS.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::region::Region;
use crate::sync::{AtomicU32, AtomicU64, Ordering, spin_loop};

/// Sentinel index marking the bottom of the stack.
pub const FREE_LIST_END: u32 = u32::MAX;

/// Largest capacity an index list supports (the sentinel is reserved).
pub const MAX_INDEX_LIST_CAPACITY: u32 = u32::MAX - 1;

/// Index list header (64 bytes, cache-line aligned).
#[repr(C, align(64))]
pub struct IndexListHeader {
    pub capacity: u32,
    _pad: u32,

    /// Stack head: index (low 32 bits) + tag (high 32 bits).
    pub head: AtomicU64,

    /// Number of indices currently on the stack (never below the true count).
    pub free_count: AtomicU32,

    _pad2: [u8; 44],
}

#[cfg(not(feature = "loom"))]
static_assertions::const_assert_eq!(size_of::<IndexListHeader>(), 64);

impl IndexListHeader {
    fn init(&mut self, capacity: u32) {
        self.capacity = capacity;
        self._pad = 0;
        self.head = AtomicU64::new(pack_head(FREE_LIST_END, 0));
        self.free_count = AtomicU32::new(0);
        self._pad2 = [0; 44];
    }
}

/// A view of an index list living in a region.
pub struct IndexList {
    header: NonNull<IndexListHeader>,
    links: NonNull<AtomicU32>,
}

unsafe impl Send for IndexList {}
unsafe impl Sync for IndexList {}

impl IndexList {
    /// Bytes needed for a list of `capacity` indices.
    pub const fn required_size(capacity: u32) -> usize {
        size_of::<IndexListHeader>() + capacity as usize * size_of::<AtomicU32>()
    }

    /// Initialize a list at `offset` holding every index `0..capacity`.
    ///
    /// Indices are popped in ascending order on a fresh list.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during initialization.
    pub unsafe fn init(region: Region, offset: usize, capacity: u32) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        assert!(
            capacity <= MAX_INDEX_LIST_CAPACITY,
            "capacity collides with the list sentinel"
        );
        assert!(offset.is_multiple_of(64), "offset must be 64-byte aligned");
        assert!(
            offset + Self::required_size(capacity) <= region.len(),
            "region too small for index list"
        );

        let header = unsafe { region.get_mut::<IndexListHeader>(offset) };
        header.init(capacity);

        let list = unsafe { Self::from_raw(region.offset(offset) as *mut IndexListHeader) };
        for i in 0..capacity {
            let next = if i + 1 < capacity { i + 1 } else { FREE_LIST_END };
            // SAFETY: fresh memory, exclusively owned.
            unsafe { core::ptr::write(list.link_ptr(i), AtomicU32::new(next)) };
        }
        list.header()
            .free_count
            .store(capacity, Ordering::Relaxed);
        list.header()
            .head
            .store(pack_head(0, 0), Ordering::Release);
        list
    }

    /// Attach to an initialized list at `offset`.
    ///
    /// # Safety
    ///
    /// The region must contain a list initialized with [`IndexList::init`].
    pub unsafe fn attach(region: Region, offset: usize) -> Result<Self, &'static str> {
        if !offset.is_multiple_of(64) {
            return Err("offset must be 64-byte aligned");
        }
        if offset + size_of::<IndexListHeader>() > region.len() {
            return Err("region too small for index list header");
        }
        let header = unsafe { region.get::<IndexListHeader>(offset) };
        if header.capacity == 0 || header.capacity > MAX_INDEX_LIST_CAPACITY {
            return Err("invalid index list capacity");
        }
        if offset + Self::required_size(header.capacity) > region.len() {
            return Err("region too small for index list");
        }
        Ok(unsafe { Self::from_raw(region.offset(offset) as *mut IndexListHeader) })
    }

    /// Build a view from a pointer to an initialized header.
    ///
    /// # Safety
    ///
    /// `header` must point to an initialized list header followed by its
    /// link array, valid for as long as the view is used.
    pub unsafe fn from_raw(header: *mut IndexListHeader) -> Self {
        assert!(!header.is_null(), "index list header must not be null");
        // SAFETY: checked above.
        let header = unsafe { NonNull::new_unchecked(header) };
        // The link array directly follows the 64-byte header.
        let links = unsafe { header.cast::<u8>().add(size_of::<IndexListHeader>()) };
        Self {
            header,
            links: links.cast(),
        }
    }

    #[inline]
    fn header(&self) -> &IndexListHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn link_ptr(&self, index: u32) -> *mut AtomicU32 {
        unsafe { self.links.as_ptr().add(index as usize) }
    }

    #[inline]
    fn link(&self, index: u32) -> &AtomicU32 {
        debug_assert!(index < self.header().capacity);
        unsafe { &*self.link_ptr(index) }
    }

    /// Pop a free index, or `None` if the stack is empty.
    ///
    /// Never blocks: retries only while another thread won the CAS.
    pub fn pop(&self) -> Option<u32> {
        let header = self.header();

        loop {
            let old_head = header.head.load(Ordering::Acquire);
            let (index, tag) = unpack_head(old_head);
            if index == FREE_LIST_END {
                return None;
            }

            let next = self.link(index).load(Ordering::Acquire);
            let new_head = pack_head(next, tag.wrapping_add(1));

            if header
                .head
                .compare_exchange_weak(old_head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                header.free_count.fetch_sub(1, Ordering::Relaxed);
                return Some(index);
            }
            spin_loop();
        }
    }

    /// Push an index back.
    ///
    /// Pushing an index that is already on the stack corrupts the list; the
    /// owner of the slots guarantees every index is pushed once per pop.
    pub fn push(&self, index: u32) {
        let header = self.header();
        assert!(index < header.capacity, "index {index} out of range");

        header.free_count.fetch_add(1, Ordering::Relaxed);
        loop {
            let old_head = header.head.load(Ordering::Acquire);
            let (old_index, tag) = unpack_head(old_head);

            self.link(index).store(old_index, Ordering::Release);
            let new_head = pack_head(index, tag.wrapping_add(1));

            if header
                .head
                .compare_exchange_weak(old_head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            spin_loop();
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    /// Approximate number of free indices.
    #[inline]
    pub fn free_count(&self) -> u32 {
        self.header().free_count.load(Ordering::Relaxed)
    }
}

#[inline]
fn pack_head(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | (index as u64)
}

#[inline]
fn unpack_head(packed: u64) -> (u32, u32) {
    (packed as u32, (packed >> 32) as u32)
}
