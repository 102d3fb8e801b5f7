//! Lock-free primitives for shared memory IPC.
//!
//! This crate provides `no_std`-compatible, lock-free data structures designed
//! to live inside memory-mapped regions shared between processes. Nothing in
//! them stores an absolute address; cross-structure references go through
//! [`RelativePointerData`].
//!
//! # Primitives
//!
//! - [`IndexList`]: Treiber stack of `u32` indices with a tagged head for ABA
//!   protection, used as the free-list of fixed-size slot pools
//! - [`SpscRing`]: single-producer single-consumer FIFO of `Copy` entries
//! - [`Sofi`]: single-producer multi-consumer FIFO that evicts its oldest
//!   entry instead of rejecting a push when full
//! - [`SegmentRegistry`] / [`RelativePointerData`] (`std`): position
//!   independent pointers resolved against per-process segment bases
//! - [`ShmSemaphore`] (`std`): futex-backed counting semaphore usable across
//!   processes
//!
//! # Loom Testing
//!
//! Enable the `loom` feature for concurrency verification of the lock-free
//! algorithms across thread interleavings.
//!
//! ```text
//! cargo test -p shm-primitives --features loom
//! ```

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod index_list;
pub mod region;
pub mod sofi;
pub mod spsc;
pub mod sync;

#[cfg(feature = "std")]
pub mod futex;
#[cfg(feature = "std")]
pub mod relative_ptr;
#[cfg(feature = "std")]
pub mod semaphore;

pub use index_list::{FREE_LIST_END, IndexList, IndexListHeader};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::{Region, align_up};
pub use sofi::{Sofi, SofiConsumer, SofiHeader, SofiProducer};
pub use spsc::{PushResult, SpscConsumer, SpscProducer, SpscRing, SpscRingHeader};

#[cfg(feature = "std")]
pub use relative_ptr::{
    MAX_SEGMENTS, NULL_POINTER_OFFSET, RegistryError, RelativePointer, RelativePointerData,
    SegmentId, SegmentOwner, SegmentRegistry,
};
#[cfg(feature = "std")]
pub use semaphore::{SEMAPHORE_MAX_VALUE, SemaphoreError, SemaphoreWait, ShmSemaphore};
