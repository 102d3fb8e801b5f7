//! Position-independent pointers into registered shared memory segments.
//!
//! A segment may be mapped at a different base address in every process, so
//! shared structures never store absolute addresses. They store a
//! [`RelativePointerData`] word instead: a 16-bit segment id plus a 48-bit
//! byte offset, resolved against a process-local [`SegmentRegistry`].

use core::any::Any;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Identifier of a registered segment.
pub type SegmentId = u16;

/// Number of slots in a [`SegmentRegistry`].
pub const MAX_SEGMENTS: usize = 256;

/// Whatever keeps a segment's memory mapped. Handles that point into a
/// segment hold one so the mapping outlives them.
pub type SegmentOwner = Arc<dyn Any + Send + Sync>;

/// Reserved segment id of the null pointer.
pub const NULL_POINTER_ID: SegmentId = SegmentId::MAX;

const OFFSET_BITS: u32 = 48;

/// Reserved offset of the null pointer; never a valid offset.
pub const NULL_POINTER_OFFSET: u64 = (1 << OFFSET_BITS) - 1;

/// Largest offset a relative pointer can carry.
pub const MAX_OFFSET: u64 = NULL_POINTER_OFFSET - 1;

/// Segment id and offset packed into one `u64`: id in the upper 16 bits,
/// offset in the lower 48.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RelativePointerData(u64);

impl RelativePointerData {
    pub const NULL: Self = Self(((NULL_POINTER_ID as u64) << OFFSET_BITS) | NULL_POINTER_OFFSET);

    /// Pack `id` and `offset`. Offsets above [`MAX_OFFSET`] do not fit.
    pub const fn new(id: SegmentId, offset: u64) -> Option<Self> {
        if offset > MAX_OFFSET || id == NULL_POINTER_ID {
            return None;
        }
        Some(Self(((id as u64) << OFFSET_BITS) | offset))
    }

    #[inline]
    pub const fn id(self) -> SegmentId {
        (self.0 >> OFFSET_BITS) as SegmentId
    }

    #[inline]
    pub const fn offset(self) -> u64 {
        self.0 & NULL_POINTER_OFFSET
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.offset() == NULL_POINTER_OFFSET
    }

    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl Default for RelativePointerData {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for RelativePointerData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("RelativePointerData(null)");
        }
        f.debug_struct("RelativePointerData")
            .field("id", &self.id())
            .field("offset", &self.offset())
            .finish()
    }
}

/// A [`RelativePointerData`] that remembers what it points at.
#[repr(transparent)]
pub struct RelativePointer<T> {
    data: RelativePointerData,
    _marker: PhantomData<*const T>,
}

impl<T> Clone for RelativePointer<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RelativePointer<T> {}

impl<T> PartialEq for RelativePointer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl<T> Eq for RelativePointer<T> {}

impl<T> fmt::Debug for RelativePointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.data, f)
    }
}

// SAFETY: the pointer carries no address, only an id/offset pair.
unsafe impl<T> Send for RelativePointer<T> {}
unsafe impl<T> Sync for RelativePointer<T> {}

impl<T> RelativePointer<T> {
    pub const fn null() -> Self {
        Self::from_data(RelativePointerData::NULL)
    }

    pub const fn from_data(data: RelativePointerData) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub const fn data(self) -> RelativePointerData {
        self.data
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.data.is_null()
    }

    /// Resolve to a local pointer, checking that a whole `T` fits the segment.
    pub fn resolve(self, registry: &SegmentRegistry) -> Option<NonNull<T>> {
        registry.resolve::<T>(self.data)
    }
}

/// Error returned by [`SegmentRegistry`] mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// The id does not fit the registry table (or is the null id).
    IdOutOfRange { id: SegmentId },
    /// Another segment is registered under this id.
    AlreadyRegistered { id: SegmentId },
    /// The base address is null.
    NullBase,
    /// The segment is larger than a relative pointer can address.
    SegmentTooLarge { len: usize },
    /// No free id left.
    Full,
    /// Nothing is registered under this id, or its owner is going away.
    NotRegistered { id: SegmentId },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdOutOfRange { id } => write!(f, "segment id {id} out of range"),
            Self::AlreadyRegistered { id } => write!(f, "segment id {id} already registered"),
            Self::NullBase => write!(f, "segment base address is null"),
            Self::SegmentTooLarge { len } => {
                write!(f, "segment of {len} bytes exceeds the relative pointer range")
            }
            Self::Full => write!(f, "all {MAX_SEGMENTS} segment ids are in use"),
            Self::NotRegistered { id } => write!(f, "segment id {id} is not registered"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Process-local table from segment id to local base address.
///
/// Lookups are lock-free atomic loads. Registration and removal are rare and
/// serialized by a mutex. A segment must be unregistered before its mapping
/// goes away; registering it with an owner ([`register_owned`]) lets the
/// owner unregister it from its own `Drop`.
///
/// [`register_owned`]: Self::register_owned
pub struct SegmentRegistry {
    bases: [AtomicUsize; MAX_SEGMENTS],
    lens: [AtomicUsize; MAX_SEGMENTS],
    /// Weak so the registry never keeps a mapping alive on its own.
    owners: Mutex<[Option<Weak<dyn Any + Send + Sync>>; MAX_SEGMENTS]>,
}

impl Default for SegmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SegmentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered = self
            .bases
            .iter()
            .filter(|b| b.load(Ordering::Relaxed) != 0)
            .count();
        f.debug_struct("SegmentRegistry")
            .field("registered", &registered)
            .finish()
    }
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self {
            bases: [const { AtomicUsize::new(0) }; MAX_SEGMENTS],
            lens: [const { AtomicUsize::new(0) }; MAX_SEGMENTS],
            owners: Mutex::new([const { None }; MAX_SEGMENTS]),
        }
    }

    /// Register `len` bytes at `base` under `id`.
    pub fn register(&self, id: SegmentId, base: *mut u8, len: usize) -> Result<(), RegistryError> {
        self.insert(id, base, len, None)
    }

    /// Register `len` bytes at `base` under `id`, kept mapped by `owner`.
    ///
    /// The registry only holds `owner` weakly. [`owner`](Self::owner) hands
    /// out strong references to handles that point into the segment.
    pub fn register_owned(
        &self,
        id: SegmentId,
        base: *mut u8,
        len: usize,
        owner: &SegmentOwner,
    ) -> Result<(), RegistryError> {
        self.insert(id, base, len, Some(Arc::downgrade(owner)))
    }

    fn insert(
        &self,
        id: SegmentId,
        base: *mut u8,
        len: usize,
        owner: Option<Weak<dyn Any + Send + Sync>>,
    ) -> Result<(), RegistryError> {
        let slot = id as usize;
        if slot >= MAX_SEGMENTS || id == NULL_POINTER_ID {
            return Err(RegistryError::IdOutOfRange { id });
        }
        if base.is_null() {
            return Err(RegistryError::NullBase);
        }
        if len as u64 > MAX_OFFSET {
            return Err(RegistryError::SegmentTooLarge { len });
        }

        let mut owners = self.owners.lock();
        if self.bases[slot].load(Ordering::Relaxed) != 0 {
            tracing::warn!(id, "segment id already registered");
            return Err(RegistryError::AlreadyRegistered { id });
        }
        owners[slot] = owner;
        // Length first: a reader that sees the base also sees its length.
        self.lens[slot].store(len, Ordering::Relaxed);
        self.bases[slot].store(base as usize, Ordering::Release);
        tracing::debug!(id, base = ?base, len, "segment registered");
        Ok(())
    }

    /// Register under the lowest free id and return it.
    pub fn register_any(&self, base: *mut u8, len: usize) -> Result<SegmentId, RegistryError> {
        if base.is_null() {
            return Err(RegistryError::NullBase);
        }
        if len as u64 > MAX_OFFSET {
            return Err(RegistryError::SegmentTooLarge { len });
        }

        let owners = self.owners.lock();
        let Some(slot) = self
            .bases
            .iter()
            .position(|b| b.load(Ordering::Relaxed) == 0)
        else {
            tracing::warn!("segment registry full");
            return Err(RegistryError::Full);
        };
        debug_assert!(owners[slot].is_none());
        self.lens[slot].store(len, Ordering::Relaxed);
        self.bases[slot].store(base as usize, Ordering::Release);
        let id = slot as SegmentId;
        tracing::debug!(id, base = ?base, len, "segment registered");
        Ok(id)
    }

    /// Remove the registration of `id`. Returns whether one existed.
    pub fn unregister(&self, id: SegmentId) -> bool {
        let slot = id as usize;
        if slot >= MAX_SEGMENTS {
            return false;
        }
        let mut owners = self.owners.lock();
        owners[slot] = None;
        self.remove(id)
    }

    /// Unregister `id` only if it is still registered to the owner at
    /// `owner`. Owners call this from `Drop`, where a failed or replaced
    /// registration must be left alone.
    pub fn unregister_owned(&self, id: SegmentId, owner: *const ()) -> bool {
        let slot = id as usize;
        if slot >= MAX_SEGMENTS {
            return false;
        }
        let mut owners = self.owners.lock();
        let matches = owners[slot]
            .as_ref()
            .is_some_and(|weak| weak.as_ptr() as *const () == owner);
        if !matches {
            return false;
        }
        owners[slot] = None;
        self.remove(id)
    }

    /// Caller holds the owners lock.
    fn remove(&self, id: SegmentId) -> bool {
        let slot = id as usize;
        let was = self.bases[slot].swap(0, Ordering::AcqRel) != 0;
        self.lens[slot].store(0, Ordering::Relaxed);
        if was {
            tracing::debug!(id, "segment unregistered");
        }
        was
    }

    /// A strong reference to the owner of `id`, to hold while pointing into
    /// the segment. `Ok(None)` for segments registered without an owner.
    pub fn owner(&self, id: SegmentId) -> Result<Option<SegmentOwner>, RegistryError> {
        let slot = id as usize;
        if slot >= MAX_SEGMENTS {
            return Err(RegistryError::IdOutOfRange { id });
        }
        let owners = self.owners.lock();
        if self.bases[slot].load(Ordering::Acquire) == 0 {
            return Err(RegistryError::NotRegistered { id });
        }
        match &owners[slot] {
            None => Ok(None),
            // A dead owner is mid-drop and about to unmap.
            Some(weak) => weak
                .upgrade()
                .map(Some)
                .ok_or(RegistryError::NotRegistered { id }),
        }
    }

    /// Local base address of `id`, if registered.
    pub fn base_of(&self, id: SegmentId) -> Option<NonNull<u8>> {
        let slot = id as usize;
        if slot >= MAX_SEGMENTS {
            return None;
        }
        NonNull::new(self.bases[slot].load(Ordering::Acquire) as *mut u8)
    }

    /// Resolve `data` to a local address with at least `size` bytes in range.
    pub fn resolve_raw(&self, data: RelativePointerData, size: usize) -> Option<NonNull<u8>> {
        if data.is_null() {
            return None;
        }
        let slot = data.id() as usize;
        if slot >= MAX_SEGMENTS {
            return None;
        }
        let base = self.bases[slot].load(Ordering::Acquire);
        if base == 0 {
            return None;
        }
        let len = self.lens[slot].load(Ordering::Relaxed) as u64;
        let end = data.offset().checked_add(size as u64)?;
        if end > len {
            return None;
        }
        NonNull::new((base + data.offset() as usize) as *mut u8)
    }

    /// Resolve `data` to a `T`, checking bounds and alignment.
    pub fn resolve<T>(&self, data: RelativePointerData) -> Option<NonNull<T>> {
        let ptr = self.resolve_raw(data, core::mem::size_of::<T>())?;
        if !(ptr.as_ptr() as usize).is_multiple_of(core::mem::align_of::<T>()) {
            return None;
        }
        Some(ptr.cast())
    }

    /// Express `ptr`, which must lie in segment `id`, as a relative pointer.
    pub fn to_relative<T>(&self, id: SegmentId, ptr: *const T) -> Option<RelativePointerData> {
        let slot = id as usize;
        if slot >= MAX_SEGMENTS {
            return None;
        }
        let base = self.bases[slot].load(Ordering::Acquire);
        if base == 0 {
            return None;
        }
        let len = self.lens[slot].load(Ordering::Relaxed);
        let addr = ptr as usize;
        if addr < base || addr - base >= len {
            return None;
        }
        RelativePointerData::new(id, (addr - base) as u64)
    }

    /// Find the segment containing `ptr`.
    pub fn find_segment<T>(&self, ptr: *const T) -> Option<SegmentId> {
        let addr = ptr as usize;
        (0..MAX_SEGMENTS).find_map(|slot| {
            let base = self.bases[slot].load(Ordering::Acquire);
            let len = self.lens[slot].load(Ordering::Relaxed);
            (base != 0 && addr >= base && addr - base < len).then_some(slot as SegmentId)
        })
    }

    /// Like [`to_relative`](Self::to_relative) without knowing the segment.
    pub fn to_relative_any<T>(&self, ptr: *const T) -> Option<RelativePointerData> {
        let id = self.find_segment(ptr)?;
        self.to_relative(id, ptr)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    #[test]
    fn packing_keeps_id_and_offset() {
        let data = RelativePointerData::new(7, 0x1234_5678_9abc).unwrap();
        assert_eq!(data.id(), 7);
        assert_eq!(data.offset(), 0x1234_5678_9abc);
        assert!(!data.is_null());
        assert_eq!(RelativePointerData::from_raw(data.to_raw()), data);
    }

    #[test]
    fn null_is_distinguished() {
        assert!(RelativePointerData::NULL.is_null());
        assert!(RelativePointerData::default().is_null());
        assert!(RelativePointerData::new(0, NULL_POINTER_OFFSET).is_none());
        assert!(RelativePointerData::new(NULL_POINTER_ID, 0).is_none());
        assert!(RelativePointerData::new(0, 0).is_some_and(|d| !d.is_null()));
    }

    #[test]
    fn resolve_round_trip() {
        let owner = HeapRegion::new_zeroed(4096);
        let registry = SegmentRegistry::new();
        registry.register(3, owner.region().as_ptr(), 4096).unwrap();

        let target = unsafe { owner.region().offset(256) } as *const u64;
        let data = registry.to_relative(3, target).unwrap();
        assert_eq!(data.offset(), 256);
        let back = registry.resolve::<u64>(data).unwrap();
        assert_eq!(back.as_ptr() as *const u64, target);
        assert_eq!(registry.to_relative_any(target), Some(data));
    }

    #[test]
    fn unknown_or_out_of_range_resolves_to_none() {
        let owner = HeapRegion::new_zeroed(4096);
        let registry = SegmentRegistry::new();
        registry.register(1, owner.region().as_ptr(), 4096).unwrap();

        assert!(registry.resolve_raw(RelativePointerData::new(2, 0).unwrap(), 1).is_none());
        assert!(registry.resolve_raw(RelativePointerData::new(1, 4096).unwrap(), 1).is_none());
        assert!(registry.resolve::<u64>(RelativePointerData::new(1, 4092).unwrap()).is_none());
        assert!(registry.resolve::<u64>(RelativePointerData::new(1, 4).unwrap()).is_none());
        assert!(registry.resolve_raw(RelativePointerData::NULL, 0).is_none());
    }

    #[test]
    fn registration_errors() {
        let owner = HeapRegion::new_zeroed(64);
        let base = owner.region().as_ptr();
        let registry = SegmentRegistry::new();

        assert_eq!(
            registry.register(MAX_SEGMENTS as SegmentId, base, 64),
            Err(RegistryError::IdOutOfRange { id: MAX_SEGMENTS as SegmentId })
        );
        assert_eq!(registry.register(0, core::ptr::null_mut(), 64), Err(RegistryError::NullBase));
        registry.register(0, base, 64).unwrap();
        assert_eq!(registry.register(0, base, 64), Err(RegistryError::AlreadyRegistered { id: 0 }));

        assert!(registry.unregister(0));
        assert!(!registry.unregister(0));
        assert!(registry.base_of(0).is_none());
    }

    #[test]
    fn register_any_picks_lowest_free_id() {
        let owner = HeapRegion::new_zeroed(64);
        let base = owner.region().as_ptr();
        let registry = SegmentRegistry::new();
        registry.register(0, base, 64).unwrap();
        assert_eq!(registry.register_any(base, 64), Ok(1));
        registry.unregister(0);
        assert_eq!(registry.register_any(base, 64), Ok(0));

        for _ in 2..MAX_SEGMENTS {
            registry.register_any(base, 64).unwrap();
        }
        assert_eq!(registry.register_any(base, 64), Err(RegistryError::Full));
    }

    #[test]
    fn owner_lives_as_long_as_its_holders() {
        let memory = HeapRegion::new_zeroed(64);
        let base = memory.region().as_ptr();
        let registry = SegmentRegistry::new();
        let owner: SegmentOwner = Arc::new(memory);
        registry.register_owned(4, base, 64, &owner).unwrap();

        let held = registry.owner(4).unwrap().unwrap();
        assert!(Arc::ptr_eq(&held, &owner));
        drop(held);

        let raw = Arc::as_ptr(&owner) as *const ();
        drop(owner);
        assert_eq!(registry.owner(4).unwrap_err(), RegistryError::NotRegistered { id: 4 });
        assert!(registry.unregister_owned(4, raw));
        assert!(registry.base_of(4).is_none());
    }

    #[test]
    fn unregister_owned_ignores_other_owners() {
        let memory = HeapRegion::new_zeroed(64);
        let base = memory.region().as_ptr();
        let registry = SegmentRegistry::new();
        let first: SegmentOwner = Arc::new(());
        let second: SegmentOwner = Arc::new(());
        registry.register_owned(2, base, 64, &first).unwrap();
        assert_eq!(
            registry.register_owned(2, base, 64, &second),
            Err(RegistryError::AlreadyRegistered { id: 2 })
        );
        assert!(!registry.unregister_owned(2, Arc::as_ptr(&second) as *const ()));
        assert!(registry.base_of(2).is_some());

        registry.register(3, base, 64).unwrap();
        assert!(registry.owner(3).unwrap().is_none());
        assert!(!registry.unregister_owned(3, Arc::as_ptr(&first) as *const ()));
        assert_eq!(registry.owner(9).unwrap_err(), RegistryError::NotRegistered { id: 9 });
    }

    #[test]
    fn typed_pointer_resolves() {
        let owner = HeapRegion::new_zeroed(128);
        let registry = SegmentRegistry::new();
        registry.register(9, owner.region().as_ptr(), 128).unwrap();
        let ptr: RelativePointer<u32> = RelativePointer::from_data(RelativePointerData::new(9, 64).unwrap());
        let resolved = ptr.resolve(&registry).unwrap();
        unsafe { resolved.as_ptr().write(5) };
        assert_eq!(unsafe { *owner.region().get::<u32>(64) }, 5);
        assert!(RelativePointer::<u32>::null().resolve(&registry).is_none());
    }
}
