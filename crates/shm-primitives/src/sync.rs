//! Atomics used by the shared-memory structures.
//!
//! Real atomics normally, loom's model-checked atomics under `--features loom`.

#[cfg(feature = "loom")]
mod imp {
    pub use loom::hint::spin_loop;
    pub use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    pub use loom::thread;
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub use core::hint::spin_loop;
    pub use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    #[cfg(any(test, feature = "std"))]
    pub use std::thread;
}

pub use imp::*;
