//! Ports for shared-memory chunk exchange.
//!
//! A [`ChunkSender`] allocates chunks and fans them out through its
//! [`ChunkDistributor`] into the [`chunk_queue`]s of every connected
//! [`ChunkReceiver`]. Pushing into a queue can notify a shared
//! [`ConditionVariable`], which is how a receiver blocks until data arrives.
//!
//! ```text
//! ChunkSender ──► ChunkDistributor ──► ChunkQueuePusher ══ shm ══ ChunkQueuePopper ──► ChunkReceiver
//!                        │                     │
//!                     history                notify ──► ConditionVariable ──► ConditionListener
//! ```

pub mod chunk_distributor;
pub mod chunk_queue;
pub mod chunk_receiver;
pub mod chunk_sender;
pub mod condition;
pub mod publisher;
pub mod subscriber;

pub use chunk_distributor::{
    ChunkDistributor, ChunkDistributorError, MAX_HISTORY_CAPACITY, MAX_QUEUES_PER_DISTRIBUTOR,
};
pub use chunk_queue::{
    CHUNK_QUEUE_MAGIC, ChunkQueueConfig, ChunkQueueError, ChunkQueueHeader, ChunkQueuePopper,
    ChunkQueuePusher, DEFAULT_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY, PushOutcome, QueueFullPolicy,
    QueueId, chunk_queue_size, create_chunk_queue,
};
pub use chunk_receiver::{
    ChunkReceiveError, ChunkReceiver, MAX_CHUNKS_HELD_PER_RECEIVER, ReceivedChunk, ReceiverConfig,
};
pub use chunk_sender::{
    AllocatedChunk, ChunkSendError, ChunkSender, MAX_CHUNKS_ALLOCATED_PER_SENDER, SenderConfig,
};
pub use condition::{
    ConditionError, ConditionListener, ConditionNotifier, ConditionVariable,
    ConditionVariableData, MAX_NOTIFIERS, NotificationSet, WaitOutcome,
};
pub use publisher::PublisherPort;
pub use subscriber::{
    DiscoveryRequest, SubscribeState, SubscriberPort, SubscriptionError, SubscriptionEvent,
};
