use std::fmt;
use std::io;

use chunkpipe_pool::LayoutError;
use chunkpipe_ports::{ChunkQueueError, ConditionError};
use shm_primitives::RegistryError;

/// Errors from creating, opening or carving up a segment.
#[derive(Debug)]
pub enum SegmentError {
    Io(io::Error),
    /// The segment header is missing, foreign or from an incompatible version.
    InvalidHeader(&'static str),
    /// Pool layout or configuration problem.
    Layout(LayoutError),
    Registry(RegistryError),
    /// The port area cannot fit another `requested` bytes.
    PortAreaExhausted { requested: usize, available: usize },
    Queue(ChunkQueueError),
    Condition(ConditionError),
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::InvalidHeader(what) => write!(f, "invalid segment header: {what}"),
            Self::Layout(e) => write!(f, "layout error: {e}"),
            Self::Registry(e) => write!(f, "registry error: {e}"),
            Self::PortAreaExhausted {
                requested,
                available,
            } => write!(
                f,
                "port area exhausted: requested {requested} bytes, {available} available"
            ),
            Self::Queue(e) => write!(f, "queue error: {e}"),
            Self::Condition(e) => write!(f, "condition variable error: {e}"),
        }
    }
}

impl std::error::Error for SegmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Layout(e) => Some(e),
            Self::Registry(e) => Some(e),
            Self::Queue(e) => Some(e),
            Self::Condition(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SegmentError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<LayoutError> for SegmentError {
    fn from(e: LayoutError) -> Self {
        Self::Layout(e)
    }
}

impl From<RegistryError> for SegmentError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl From<ChunkQueueError> for SegmentError {
    fn from(e: ChunkQueueError) -> Self {
        Self::Queue(e)
    }
}

impl From<ConditionError> for SegmentError {
    fn from(e: ConditionError) -> Self {
        Self::Condition(e)
    }
}
