//! Subscription handshake of a single-producer subscriber port.
//!
//! The user side only sets a request flag ([`SubscriberPort::subscribe`],
//! [`SubscriberPort::unsubscribe`]). The discovery side polls
//! [`SubscriberPort::poll_discovery_request`] for what to send to the
//! publisher and feeds the answers back through
//! [`SubscriberPort::handle_event`].
//!
//! ```text
//!                 subscribe                 Ack
//! NotSubscribed ────────────► SubscribeRequested ──────► Subscribed
//!      ▲                        │  ▲                       │   │
//!      │ unsubscribe       Nack │  │ Offer       StopOffer │   │ unsubscribe
//!      │                        ▼  │                       │   ▼
//!      └──────────────────── WaitForOffer ◄────────────────┘  UnsubscribeRequested
//!      ▲                                                              │
//!      └──────────────────────────── Ack / Nack ──────────────────────┘
//! ```

use std::fmt;

use crate::chunk_queue::QueueId;
use crate::chunk_receiver::{ChunkReceiveError, ChunkReceiver, ReceivedChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscribeState {
    #[default]
    NotSubscribed,
    SubscribeRequested,
    Subscribed,
    UnsubscribeRequested,
    /// The publisher refused or went away; subscribe again on its next offer.
    WaitForOffer,
}

/// Answers and announcements from the publisher side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Ack,
    Nack,
    Offer,
    StopOffer,
}

/// What the subscriber asks the publisher for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryRequest {
    Subscribe {
        queue: QueueId,
        /// How many history chunks to replay into the queue.
        history_request: usize,
    },
    Unsubscribe {
        queue: QueueId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionError {
    /// `event` makes no sense in `state`. The state is unchanged.
    UnexpectedEvent {
        state: SubscribeState,
        event: SubscriptionEvent,
    },
}

impl fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEvent { state, event } => {
                write!(f, "unexpected {event:?} while {state:?}")
            }
        }
    }
}

impl std::error::Error for SubscriptionError {}

/// Receiving port with its subscription state.
pub struct SubscriberPort {
    receiver: ChunkReceiver,
    state: SubscribeState,
    subscribe_requested: bool,
    history_request: usize,
}

impl SubscriberPort {
    pub fn new(receiver: ChunkReceiver, history_request: usize) -> Self {
        Self {
            receiver,
            state: SubscribeState::NotSubscribed,
            subscribe_requested: false,
            history_request,
        }
    }

    #[inline]
    pub fn state(&self) -> SubscribeState {
        self.state
    }

    #[inline]
    pub fn receiver(&self) -> &ChunkReceiver {
        &self.receiver
    }

    #[inline]
    pub fn queue_id(&self) -> QueueId {
        self.receiver.queue_id()
    }

    pub fn subscribe(&mut self) {
        self.subscribe_requested = true;
    }

    pub fn unsubscribe(&mut self) {
        self.subscribe_requested = false;
    }

    /// Chunks are only delivered while subscribed, or until an unsubscribe
    /// is acknowledged.
    pub fn is_subscribed(&self) -> bool {
        matches!(
            self.state,
            SubscribeState::Subscribed | SubscribeState::UnsubscribeRequested
        )
    }

    fn transition(&mut self, next: SubscribeState) {
        tracing::debug!(queue = %self.queue_id(), from = ?self.state, to = ?next, "subscription state");
        if next == SubscribeState::NotSubscribed {
            self.receiver.clear();
        }
        self.state = next;
    }

    fn subscribe_request(&self) -> DiscoveryRequest {
        DiscoveryRequest::Subscribe {
            queue: self.queue_id(),
            history_request: self.history_request,
        }
    }

    /// Act on the pending user request, returning the message for the
    /// publisher if one is due.
    pub fn poll_discovery_request(&mut self) -> Option<DiscoveryRequest> {
        match (self.subscribe_requested, self.state) {
            (true, SubscribeState::NotSubscribed) => {
                self.transition(SubscribeState::SubscribeRequested);
                Some(self.subscribe_request())
            }
            (false, SubscribeState::Subscribed) => {
                self.transition(SubscribeState::UnsubscribeRequested);
                Some(DiscoveryRequest::Unsubscribe {
                    queue: self.queue_id(),
                })
            }
            (false, SubscribeState::WaitForOffer) => {
                self.transition(SubscribeState::NotSubscribed);
                None
            }
            _ => None,
        }
    }

    /// Feed an answer or announcement from the publisher side.
    pub fn handle_event(
        &mut self,
        event: SubscriptionEvent,
    ) -> Result<Option<DiscoveryRequest>, SubscriptionError> {
        use SubscribeState as S;
        use SubscriptionEvent as E;

        let next = match (self.state, event) {
            (S::WaitForOffer, E::Offer) => {
                self.transition(S::SubscribeRequested);
                return Ok(Some(self.subscribe_request()));
            }
            (S::Subscribed, E::StopOffer) => S::WaitForOffer,
            (S::SubscribeRequested, E::Ack) => S::Subscribed,
            (S::SubscribeRequested, E::Nack) => S::WaitForOffer,
            (S::UnsubscribeRequested, E::Ack | E::Nack) => S::NotSubscribed,
            (state, event) => {
                tracing::warn!(queue = %self.queue_id(), ?state, ?event, "unexpected subscription event");
                return Err(SubscriptionError::UnexpectedEvent { state, event });
            }
        };
        self.transition(next);
        Ok(None)
    }

    pub fn try_get(&self) -> Result<Option<ReceivedChunk<'_>>, ChunkReceiveError> {
        self.receiver.try_get()
    }

    pub fn has_new_chunks(&self) -> bool {
        self.receiver.has_new_chunks()
    }

    pub fn has_lost_chunks(&self) -> bool {
        self.receiver.has_lost_chunks()
    }
}

impl fmt::Debug for SubscriberPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberPort")
            .field("state", &self.state)
            .field("subscribe_requested", &self.subscribe_requested)
            .field("receiver", &self.receiver)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_queue::ChunkQueueConfig;
    use crate::chunk_queue::tests::Fixture;
    use crate::chunk_receiver::ReceiverConfig;

    fn port(fx: &mut Fixture) -> SubscriberPort {
        let (_tx, rx) = fx.queue(ChunkQueueConfig::default());
        SubscriberPort::new(ChunkReceiver::new(rx, ReceiverConfig::default()), 1)
    }

    #[test]
    fn subscribe_ack_unsubscribe_ack() {
        let mut fx = Fixture::new(8, 4);
        let mut port = port(&mut fx);
        assert_eq!(port.poll_discovery_request(), None);

        port.subscribe();
        let queue = port.queue_id();
        assert_eq!(
            port.poll_discovery_request(),
            Some(DiscoveryRequest::Subscribe {
                queue,
                history_request: 1
            })
        );
        assert_eq!(port.state(), SubscribeState::SubscribeRequested);
        assert_eq!(port.poll_discovery_request(), None);

        assert_eq!(port.handle_event(SubscriptionEvent::Ack), Ok(None));
        assert!(port.is_subscribed());

        port.unsubscribe();
        assert_eq!(
            port.poll_discovery_request(),
            Some(DiscoveryRequest::Unsubscribe { queue })
        );
        assert!(port.is_subscribed());
        port.handle_event(SubscriptionEvent::Ack).unwrap();
        assert_eq!(port.state(), SubscribeState::NotSubscribed);
    }

    #[test]
    fn nack_waits_for_the_next_offer() {
        let mut fx = Fixture::new(8, 4);
        let mut port = port(&mut fx);
        port.subscribe();
        port.poll_discovery_request();
        port.handle_event(SubscriptionEvent::Nack).unwrap();
        assert_eq!(port.state(), SubscribeState::WaitForOffer);

        let request = port.handle_event(SubscriptionEvent::Offer).unwrap();
        assert!(matches!(request, Some(DiscoveryRequest::Subscribe { .. })));
        assert_eq!(port.state(), SubscribeState::SubscribeRequested);
    }

    #[test]
    fn stop_offer_then_unsubscribe_returns_to_idle() {
        let mut fx = Fixture::new(8, 4);
        let mut port = port(&mut fx);
        port.subscribe();
        port.poll_discovery_request();
        port.handle_event(SubscriptionEvent::Ack).unwrap();
        port.handle_event(SubscriptionEvent::StopOffer).unwrap();
        assert_eq!(port.state(), SubscribeState::WaitForOffer);

        port.unsubscribe();
        assert_eq!(port.poll_discovery_request(), None);
        assert_eq!(port.state(), SubscribeState::NotSubscribed);
    }

    #[test]
    fn unexpected_events_leave_state_alone() {
        let mut fx = Fixture::new(8, 4);
        let mut port = port(&mut fx);
        for event in [
            SubscriptionEvent::Ack,
            SubscriptionEvent::Nack,
            SubscriptionEvent::Offer,
            SubscriptionEvent::StopOffer,
        ] {
            assert_eq!(
                port.handle_event(event),
                Err(SubscriptionError::UnexpectedEvent {
                    state: SubscribeState::NotSubscribed,
                    event
                })
            );
        }
        assert_eq!(port.state(), SubscribeState::NotSubscribed);
    }
}
