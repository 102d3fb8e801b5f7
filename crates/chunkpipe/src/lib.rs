//! Zero-copy publish/subscribe over shared memory.
//!
//! A [`Segment`] holds the chunk pools and the port area. Publishers
//! allocate a chunk, write it in place and hand a relative pointer to every
//! subscribed queue; subscribers read in place and release. The chunk goes
//! back to its pool when the last reference is dropped, in whichever process
//! that happens.
//!
//! ```no_run
//! use std::sync::Arc;
//! use chunkpipe::{ChunkQueueConfig, ReceiverConfig, Segment, SegmentConfig, SegmentRegistry, SenderConfig};
//!
//! let registry = Arc::new(SegmentRegistry::new());
//! let segment = Segment::create("/dev/shm/demo", registry, &SegmentConfig::default())?;
//!
//! let receiver = segment.create_receiver(&ChunkQueueConfig::default(), ReceiverConfig::default())?;
//! let sender = segment.create_sender(SenderConfig::default());
//! let pusher = unsafe {
//!     chunkpipe::ChunkQueuePusher::attach(segment.registry().clone(), receiver.queue_id())?
//! };
//! sender.distributor().add_queue(pusher, 0)?;
//!
//! let mut chunk = sender.try_allocate(5, 1)?;
//! chunk.payload_mut().copy_from_slice(b"hello");
//! chunk.send();
//!
//! if let Some(chunk) = receiver.try_get()? {
//!     assert_eq!(chunk.payload(), b"hello");
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod error;
pub mod mapping;
pub mod segment;

pub use error::SegmentError;
pub use mapping::{MappedSegment, SegmentMemory};
pub use segment::{
    DEFAULT_PORT_AREA_SIZE, SEGMENT_MAGIC, SEGMENT_VERSION, Segment, SegmentConfig, SegmentHeader,
    SegmentLayout,
};

pub use chunkpipe_pool::{
    AllocationError, ChunkHeader, ChunkSettings, MePooConfig, MePooEntry, MemPoolInfo,
    MemoryManager, SharedChunk,
};
pub use chunkpipe_ports::{
    AllocatedChunk, ChunkDistributor, ChunkQueueConfig, ChunkQueuePopper, ChunkQueuePusher,
    ChunkReceiveError, ChunkReceiver, ChunkSendError, ChunkSender, ConditionListener,
    ConditionNotifier, ConditionVariable, DiscoveryRequest, NotificationSet, PublisherPort,
    PushOutcome, QueueFullPolicy, QueueId, ReceivedChunk, ReceiverConfig, SenderConfig,
    SubscribeState, SubscriberPort, SubscriptionEvent, WaitOutcome,
};
pub use shm_primitives::{RelativePointerData, SegmentId, SegmentRegistry};
