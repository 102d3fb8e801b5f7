//! Owning handle to one reference of a chunk.

use std::fmt;
use std::ptr::NonNull;

use shm_primitives::{RelativePointerData, SegmentOwner, SegmentRegistry};

use crate::chunk_header::ChunkHeader;
use crate::config::MAX_NUMBER_OF_MEMPOOLS;
use crate::mem_pool::{MemPool, MemPoolHeader};

/// One counted reference to a chunk in shared memory.
///
/// Cloning takes another reference, dropping gives it back; the last drop
/// returns the slot to its pool. The handle can cross process boundaries as
/// a relative pointer with [`into_relative`](Self::into_relative) and
/// [`from_relative`](Self::from_relative), which move the reference instead
/// of counting it again.
///
/// A handle keeps the owner of its segment alive, so it stays valid after
/// the segment handle it came from is dropped.
pub struct SharedChunk {
    header: NonNull<ChunkHeader>,
    /// Dropped after the reference is released.
    owner: Option<SegmentOwner>,
}

// SAFETY: the reference count is atomic and the payload is only mutable
// while the handle is the sole reference.
unsafe impl Send for SharedChunk {}
unsafe impl Sync for SharedChunk {}

impl SharedChunk {
    /// Adopt a reference the caller owns.
    ///
    /// # Safety
    ///
    /// `header` must be a live chunk and the caller must transfer one of its
    /// references to the new handle. Without an `owner`, the caller keeps the
    /// segment mapped for as long as the handle lives.
    pub unsafe fn from_header(header: NonNull<ChunkHeader>, owner: Option<SegmentOwner>) -> Self {
        Self { header, owner }
    }

    #[inline]
    pub fn header(&self) -> &ChunkHeader {
        // SAFETY: we hold a reference, so the chunk is live.
        unsafe { self.header.as_ref() }
    }

    #[inline]
    pub fn header_ptr(&self) -> NonNull<ChunkHeader> {
        self.header
    }

    /// The user payload.
    pub fn payload(&self) -> &[u8] {
        let header = self.header();
        // SAFETY: the payload lies inside the chunk.
        unsafe {
            std::slice::from_raw_parts(header.payload_ptr(), header.user_payload_size as usize)
        }
    }

    /// The user payload for writing, only while this is the sole reference.
    pub fn payload_mut(&mut self) -> Option<&mut [u8]> {
        if !self.is_unique() {
            return None;
        }
        let header = self.header();
        let (ptr, len) = (header.payload_ptr(), header.user_payload_size as usize);
        // SAFETY: sole reference, nobody else can read or write the chunk.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }

    /// The user payload for writing without checking the reference count.
    ///
    /// # Safety
    ///
    /// No other holder may read or write the payload while the returned
    /// slice lives.
    pub unsafe fn payload_mut_unchecked(&mut self) -> &mut [u8] {
        let header = self.header();
        let (ptr, len) = (header.payload_ptr(), header.user_payload_size as usize);
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }

    /// Stamp sender metadata. Does nothing and returns `false` unless this is
    /// the sole reference.
    pub fn stamp_origin(&mut self, origin_id: u64, sequence_number: u64) -> bool {
        if !self.is_unique() {
            return false;
        }
        // SAFETY: sole reference.
        let header = unsafe { self.header.as_mut() };
        header.origin_id = origin_id;
        header.sequence_number = sequence_number;
        true
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.header().reference_count()
    }

    #[inline]
    pub fn is_unique(&self) -> bool {
        self.ref_count() == 1
    }

    #[inline]
    pub fn relative(&self) -> RelativePointerData {
        self.header().relative()
    }

    /// Whether both handles refer to the same chunk.
    #[inline]
    pub fn ptr_eq(&self, other: &SharedChunk) -> bool {
        self.header == other.header
    }

    /// Give up this handle and return the reference as a relative pointer.
    /// The reference stays counted until [`from_relative`](Self::from_relative)
    /// adopts it again.
    pub fn into_relative(self) -> RelativePointerData {
        let relative = self.relative();
        std::mem::forget(self);
        relative
    }

    /// Adopt a reference previously produced by
    /// [`into_relative`](Self::into_relative), possibly in another process.
    ///
    /// Returns `None` if `data` does not resolve, or does not name a live
    /// chunk header in a slot of the pool it claims. The reference is not
    /// released in that case.
    ///
    /// # Safety
    ///
    /// `data` must carry a counted reference that the caller now owns.
    pub unsafe fn from_relative(
        registry: &SegmentRegistry,
        data: RelativePointerData,
    ) -> Option<Self> {
        // Owner first: once held, the segment cannot be unmapped under us.
        let owner = registry.owner(data.id()).ok()?;
        let header = registry.resolve::<ChunkHeader>(data)?;
        // SAFETY: resolved inside a registered segment.
        let header_ref = unsafe { header.as_ref() };
        if header_ref.self_ref != data.to_raw() || header_ref.reference_count() == 0 {
            return None;
        }
        let chunk_end = data.offset().checked_add(header_ref.chunk_size as u64)?;
        let payload_end = header_ref.user_payload_offset as u64 + header_ref.user_payload_size as u64;
        if payload_end > header_ref.chunk_size as u64 {
            return None;
        }
        registry.resolve_raw(
            RelativePointerData::new(data.id(), chunk_end - 1)?,
            1,
        )?;

        if header_ref.pool_index as usize >= MAX_NUMBER_OF_MEMPOOLS {
            return None;
        }
        let pool_offset = (data.offset() as i64).checked_add(header_ref.pool_header_offset)?;
        let pool_data = RelativePointerData::new(data.id(), u64::try_from(pool_offset).ok()?)?;
        let pool_header = registry.resolve::<MemPoolHeader>(pool_data)?;
        // SAFETY: resolved and aligned inside the same registered segment.
        let pool = unsafe { MemPool::from_header_ptr(pool_header.as_ptr() as *const u8) };
        if pool.pool_index() != header_ref.pool_index
            || header_ref.slot_index >= pool.chunk_count()
            || pool.chunk_ptr(header_ref.slot_index) != header
        {
            return None;
        }
        Some(Self { header, owner })
    }
}

impl Clone for SharedChunk {
    fn clone(&self) -> Self {
        // SAFETY: we hold a reference.
        unsafe { self.header().add_reference() };
        Self {
            header: self.header,
            owner: self.owner.clone(),
        }
    }
}

impl Drop for SharedChunk {
    fn drop(&mut self) {
        // SAFETY: we hold exactly one reference and never touch it again.
        unsafe { self.header.as_ref().release() };
    }
}

impl fmt::Debug for SharedChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedChunk")
            .field("relative", &self.relative())
            .field("header", self.header())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MePooConfig, MePooEntry};
    use crate::memory_manager::MemoryManager;
    use shm_primitives::HeapRegion;

    fn setup() -> (HeapRegion, SegmentRegistry, MemoryManager) {
        let config = MePooConfig::from_entries([MePooEntry::new(64, 4)]).unwrap();
        let size = MemoryManager::required_size(&config).unwrap();
        let owner = HeapRegion::new_zeroed(size);
        let registry = SegmentRegistry::new();
        registry.register(1, owner.region().as_ptr(), size).unwrap();
        let mm = unsafe { MemoryManager::init(owner.region(), 0, 1, &config) }.unwrap();
        (owner, registry, mm)
    }

    #[test]
    fn payload_is_writable_only_while_unique() {
        let (_owner, _registry, mm) = setup();
        let mut chunk = mm.allocate_default(8).unwrap();
        chunk.payload_mut().unwrap().copy_from_slice(b"abcdefgh");
        assert!(chunk.stamp_origin(7, 1));

        let reader = chunk.clone();
        assert!(chunk.payload_mut().is_none());
        assert!(!chunk.stamp_origin(7, 2));
        assert_eq!(reader.payload(), b"abcdefgh");
        assert_eq!(reader.header().origin_id, 7);
        assert_eq!(reader.header().sequence_number, 1);
        assert!(reader.ptr_eq(&chunk));
    }

    #[test]
    fn relative_round_trip_moves_the_reference() {
        let (_owner, registry, mm) = setup();
        let chunk = mm.allocate_default(16).unwrap();
        let raw = chunk.clone().into_relative();
        assert_eq!(chunk.ref_count(), 2);

        let adopted = unsafe { SharedChunk::from_relative(&registry, raw) }.unwrap();
        assert!(adopted.ptr_eq(&chunk));
        assert_eq!(chunk.ref_count(), 2);
        drop(adopted);
        assert_eq!(chunk.ref_count(), 1);
    }

    #[test]
    fn from_relative_rejects_bad_pointers() {
        let (_owner, registry, mm) = setup();
        let chunk = mm.allocate_default(16).unwrap();
        let good = chunk.relative();

        let shifted = RelativePointerData::new(good.id(), good.offset() + 8).unwrap();
        assert!(unsafe { SharedChunk::from_relative(&registry, shifted) }.is_none());

        let unknown = RelativePointerData::new(9, good.offset()).unwrap();
        assert!(unsafe { SharedChunk::from_relative(&registry, unknown) }.is_none());

        let free_slot = unsafe { mm.pool(0).unwrap().chunk_ptr(3).as_ref() }.relative();
        assert!(unsafe { SharedChunk::from_relative(&registry, free_slot) }.is_none());
        assert_eq!(chunk.ref_count(), 1);
    }

    #[test]
    fn from_relative_checks_the_pool() {
        let (_owner, registry, mm) = setup();
        let chunk = mm.allocate_default(16).unwrap();
        let raw = chunk.relative();
        let header = chunk.header_ptr().as_ptr();

        unsafe { (*header).pool_index = 1 };
        assert!(unsafe { SharedChunk::from_relative(&registry, raw) }.is_none());
        unsafe { (*header).pool_index = MAX_NUMBER_OF_MEMPOOLS as u16 };
        assert!(unsafe { SharedChunk::from_relative(&registry, raw) }.is_none());
        unsafe { (*header).pool_index = 0 };

        unsafe { (*header).slot_index += 1 };
        assert!(unsafe { SharedChunk::from_relative(&registry, raw) }.is_none());
        unsafe { (*header).slot_index -= 1 };
        assert_eq!(chunk.ref_count(), 1);
    }

    #[test]
    fn clones_across_threads_release_once() {
        let (_owner, _registry, mm) = setup();
        let chunk = mm.allocate_default(8).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = chunk.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        drop(c.clone());
                    }
                    drop(c);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(chunk.ref_count(), 1);
        drop(chunk);
        assert_eq!(mm.pool_info(0).unwrap().used_chunks, 0);
    }
}
