//! Raw views over a contiguous block of (usually shared) memory.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

/// A borrowed view of a memory block: base pointer plus length.
///
/// A `Region` does not own its memory. Whoever created it (an mmap, a
/// [`HeapRegion`], a test fixture) must keep the memory alive for as long as
/// any view derived from it is in use.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: a Region is only a pointer + length. All structures placed in it
// synchronize through atomics.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a view over `len` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for the whole
    /// lifetime of every view derived from this region.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        assert!(!base.is_null(), "region base must not be null");
        // SAFETY: checked above.
        let base = unsafe { NonNull::new_unchecked(base) };
        Self { base, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if `ptr` points into this region.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr - start < self.len
    }

    /// Byte offset of `ptr` from the region base, if it lies inside.
    #[inline]
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        if self.contains(ptr) {
            Some(ptr as usize - self.base.as_ptr() as usize)
        } else {
            None
        }
    }

    /// Pointer to the byte at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be `<= len`.
    #[inline]
    pub unsafe fn offset(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len, "offset {offset} out of region ({})", self.len);
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Reference to a `T` placed at `offset`.
    ///
    /// # Safety
    ///
    /// A valid, initialized `T` must live at `offset`.
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        self.check_placement::<T>(offset);
        unsafe { &*(self.offset(offset) as *const T) }
    }

    /// Mutable reference to a `T` placed at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the bytes at `offset` (as
    /// during initialization) and they must be valid for `T`, or about to be
    /// fully overwritten.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn get_mut<T>(&self, offset: usize) -> &mut T {
        self.check_placement::<T>(offset);
        unsafe { &mut *(self.offset(offset) as *mut T) }
    }

    /// A sub-view of `len` bytes starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> Option<Region> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: the range lies inside this region.
        let base = unsafe { self.base.as_ptr().add(offset) };
        Some(Region {
            base: NonNull::new(base)?,
            len,
        })
    }

    #[inline]
    fn check_placement<T>(&self, offset: usize) {
        assert!(
            offset + size_of::<T>() <= self.len,
            "value at {offset} does not fit region of {} bytes",
            self.len
        );
        assert!(
            (self.base.as_ptr() as usize + offset).is_multiple_of(align_of::<T>()),
            "value at {offset} is misaligned"
        );
    }
}

#[cfg(any(test, feature = "alloc"))]
pub use heap::HeapRegion;

#[cfg(any(test, feature = "alloc"))]
mod heap {
    use super::Region;
    use alloc::alloc::{Layout, alloc_zeroed, dealloc};
    use core::ptr::NonNull;

    /// Zeroed, page-aligned heap memory standing in for a shared mapping.
    ///
    /// Used by tests and by single-process deployments.
    pub struct HeapRegion {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    // SAFETY: the allocation is owned and only reached through Region views.
    unsafe impl Send for HeapRegion {}
    unsafe impl Sync for HeapRegion {}

    impl HeapRegion {
        pub const ALIGN: usize = 4096;

        pub fn new_zeroed(len: usize) -> Self {
            assert!(len > 0, "heap region must not be empty");
            let Ok(layout) = Layout::from_size_align(len, Self::ALIGN) else {
                panic!("heap region of {len} bytes exceeds the address space");
            };
            // SAFETY: layout has a non-zero size.
            let ptr = unsafe { alloc_zeroed(layout) };
            let ptr = NonNull::new(ptr).unwrap_or_else(|| alloc::alloc::handle_alloc_error(layout));
            Self { ptr, layout }
        }

        pub fn region(&self) -> Region {
            // SAFETY: the allocation lives as long as self.
            unsafe { Region::from_raw(self.ptr.as_ptr(), self.layout.size()) }
        }

        pub fn len(&self) -> usize {
            self.layout.size()
        }

        pub fn is_empty(&self) -> bool {
            self.layout.size() == 0
        }
    }

    impl Drop for HeapRegion {
        fn drop(&mut self) {
            // SAFETY: allocated in new_zeroed with the same layout.
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}
