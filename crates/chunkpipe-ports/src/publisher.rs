//! Publisher side of the subscription handshake.

use std::fmt;
use std::sync::Arc;

use shm_primitives::SegmentRegistry;

use crate::chunk_queue::ChunkQueuePusher;
use crate::chunk_sender::ChunkSender;
use crate::subscriber::{DiscoveryRequest, SubscriptionEvent};

/// Sending port that connects subscriber queues on request.
pub struct PublisherPort {
    sender: ChunkSender,
    registry: Arc<SegmentRegistry>,
    offered: bool,
}

impl PublisherPort {
    pub fn new(sender: ChunkSender, registry: Arc<SegmentRegistry>) -> Self {
        Self {
            sender,
            registry,
            offered: false,
        }
    }

    #[inline]
    pub fn sender(&self) -> &ChunkSender {
        &self.sender
    }

    #[inline]
    pub fn is_offered(&self) -> bool {
        self.offered
    }

    /// Start accepting subscriptions. Returns the announcement to broadcast.
    pub fn offer(&mut self) -> SubscriptionEvent {
        self.offered = true;
        tracing::debug!("publisher offered");
        SubscriptionEvent::Offer
    }

    /// Disconnect every queue and stop accepting subscriptions.
    pub fn stop_offer(&mut self) -> SubscriptionEvent {
        self.offered = false;
        self.sender.distributor().remove_all_queues();
        tracing::debug!("publisher stopped offering");
        SubscriptionEvent::StopOffer
    }

    /// Answer a subscriber's request.
    ///
    /// # Safety
    ///
    /// A `Subscribe` request must name a queue whose only producer is this
    /// publisher, in a segment that stays registered while it is connected.
    pub unsafe fn handle_request(&self, request: DiscoveryRequest) -> SubscriptionEvent {
        match request {
            DiscoveryRequest::Subscribe {
                queue,
                history_request,
            } => {
                if !self.offered {
                    return SubscriptionEvent::Nack;
                }
                let pusher = match unsafe { ChunkQueuePusher::attach(self.registry.clone(), queue) } {
                    Ok(pusher) => pusher,
                    Err(e) => {
                        tracing::warn!(%queue, error = %e, "cannot attach subscriber queue");
                        return SubscriptionEvent::Nack;
                    }
                };
                match self.sender.distributor().add_queue(pusher, history_request) {
                    Ok(()) => SubscriptionEvent::Ack,
                    Err(_) => SubscriptionEvent::Nack,
                }
            }
            DiscoveryRequest::Unsubscribe { queue } => {
                if self.sender.distributor().remove_queue(queue) {
                    SubscriptionEvent::Ack
                } else {
                    SubscriptionEvent::Nack
                }
            }
        }
    }
}

impl fmt::Debug for PublisherPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherPort")
            .field("offered", &self.offered)
            .field("sender", &self.sender)
            .finish()
    }
}
