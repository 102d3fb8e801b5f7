//! Pool configuration.

use std::fmt;

use crate::chunk_header::{CHUNK_DEFAULT_PAYLOAD_ALIGNMENT, ChunkSettings};
use crate::mem_pool::CHUNK_MEMORY_ALIGNMENT;

/// Upper bound on pools per memory manager.
pub const MAX_NUMBER_OF_MEMPOOLS: usize = 32;

/// One size class: chunks able to hold `payload_size` bytes with the default
/// alignment, `chunk_count` of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MePooEntry {
    pub payload_size: u32,
    pub chunk_count: u32,
}

impl MePooEntry {
    pub const fn new(payload_size: u32, chunk_count: u32) -> Self {
        Self {
            payload_size,
            chunk_count,
        }
    }

    /// Slot size of this entry's pool.
    pub fn chunk_size(&self) -> Result<u32, MePooConfigError> {
        let settings = ChunkSettings::new(self.payload_size, CHUNK_DEFAULT_PAYLOAD_ALIGNMENT)
            .map_err(|_| MePooConfigError::PayloadTooLarge {
                payload_size: self.payload_size,
            })?;
        settings
            .required_chunk_size()
            .checked_next_multiple_of(CHUNK_MEMORY_ALIGNMENT as u32)
            .ok_or(MePooConfigError::PayloadTooLarge {
                payload_size: self.payload_size,
            })
    }
}

/// Ordered list of size classes, smallest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MePooConfig {
    entries: Vec<MePooEntry>,
}

impl Default for MePooConfig {
    /// Small, medium and large chunks, enough for tests and demos.
    fn default() -> Self {
        Self {
            entries: vec![
                MePooEntry::new(128, 256),
                MePooEntry::new(1024, 64),
                MePooEntry::new(16 * 1024, 16),
                MePooEntry::new(128 * 1024, 4),
            ],
        }
    }
}

impl MePooConfig {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a size class. Payload sizes must strictly increase.
    pub fn add_pool(&mut self, entry: MePooEntry) -> Result<&mut Self, MePooConfigError> {
        if entry.chunk_count == 0 {
            return Err(MePooConfigError::EmptyPool {
                payload_size: entry.payload_size,
            });
        }
        if self.entries.len() >= MAX_NUMBER_OF_MEMPOOLS {
            return Err(MePooConfigError::TooManyPools);
        }
        entry.chunk_size()?;
        if let Some(last) = self.entries.last()
            && entry.payload_size <= last.payload_size
        {
            return Err(MePooConfigError::NotStrictlyIncreasing {
                previous: last.payload_size,
                next: entry.payload_size,
            });
        }
        self.entries.push(entry);
        Ok(self)
    }

    /// Build from entries, validating their order.
    pub fn from_entries(
        entries: impl IntoIterator<Item = MePooEntry>,
    ) -> Result<Self, MePooConfigError> {
        let mut config = Self::new();
        for entry in entries {
            config.add_pool(entry)?;
        }
        Ok(config)
    }

    pub fn entries(&self) -> &[MePooEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MePooConfigError {
    /// Payload sizes must strictly increase from one pool to the next.
    NotStrictlyIncreasing { previous: u32, next: u32 },
    /// A pool without chunks.
    EmptyPool { payload_size: u32 },
    /// More than [`MAX_NUMBER_OF_MEMPOOLS`] pools.
    TooManyPools,
    /// The chunk for this payload does not fit a `u32`.
    PayloadTooLarge { payload_size: u32 },
}

impl fmt::Display for MePooConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStrictlyIncreasing { previous, next } => write!(
                f,
                "pool payload sizes must strictly increase: {next} follows {previous}"
            ),
            Self::EmptyPool { payload_size } => {
                write!(f, "pool for {payload_size} byte payloads has no chunks")
            }
            Self::TooManyPools => write!(f, "more than {MAX_NUMBER_OF_MEMPOOLS} pools"),
            Self::PayloadTooLarge { payload_size } => {
                write!(f, "payload size {payload_size} too large for a chunk")
            }
        }
    }
}

impl std::error::Error for MePooConfigError {}
