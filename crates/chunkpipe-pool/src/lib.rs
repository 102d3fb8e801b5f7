//! Shared-memory chunk pools.
//!
//! A [`MemoryManager`] carves a segment area into size-classed [`MemPool`]s.
//! Every slot starts with a [`ChunkHeader`] carrying an atomic reference
//! count; [`SharedChunk`] is the safe handle to one reference. Any process
//! that maps the segment can release a chunk: the header knows how far back
//! its pool header lives, so no lookup table is needed.
//!
//! ```text
//! MemoryManager ──► MemPool[0] (smallest chunks) ──► IndexList free-list
//!               ──► MemPool[1]                      + chunk slots
//!               ──► ...
//! ```

pub mod chunk_header;
pub mod config;
pub mod mem_pool;
pub mod memory_manager;
pub mod shared_chunk;

pub use chunk_header::{
    CHUNK_DEFAULT_PAYLOAD_ALIGNMENT, CHUNK_HEADER_VERSION, ChunkHeader, ChunkSettings,
    ChunkSettingsError,
};
pub use config::{MAX_NUMBER_OF_MEMPOOLS, MePooConfig, MePooConfigError, MePooEntry};
pub use mem_pool::{MemPool, MemPoolHeader, MemPoolInfo};
pub use memory_manager::{AllocationError, LayoutError, MemoryManager, MemoryManagerHeader};
pub use shared_chunk::SharedChunk;
