use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::CoupleError;
use crate::signal::{Announcement, PeerId, SignalMessage};

/// Message relay connecting the local endpoint to its peers.
///
/// Delivery is best-effort and at-least-once: in order per sender, with no
/// ordering across senders, and duplicates possible. Implementations must
/// tolerate concurrent sends from independent sessions.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Identity messages to this endpoint are addressed to.
    fn local_peer(&self) -> &PeerId;

    /// Directed send to one peer.
    async fn send(&self, to: &PeerId, message: SignalMessage) -> Result<(), CoupleError>;

    /// Messages addressed to the local endpoint by `from`, in delivery
    /// order. Dropping the receiver unsubscribes.
    fn subscribe(&self, from: &PeerId) -> mpsc::UnboundedReceiver<SignalMessage>;

    /// Broadcast discovery metadata to every other endpoint.
    async fn announce(&self, metadata: serde_json::Value) -> Result<(), CoupleError>;

    /// Announcements broadcast by other endpoints.
    fn announcements(&self) -> mpsc::UnboundedReceiver<Announcement>;
}

#[derive(Default)]
struct Endpoint {
    /// Live subscriptions of this endpoint, keyed by the remote sender.
    subscriptions: HashMap<PeerId, mpsc::UnboundedSender<SignalMessage>>,
    /// Messages that arrived before the matching subscription existed.
    mailbox: HashMap<PeerId, Vec<SignalMessage>>,
    announce_subs: Vec<mpsc::UnboundedSender<Announcement>>,
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<PeerId, Endpoint>,
}

/// In-process signalling relay.
///
/// Routes directed messages between registered endpoints, in order per
/// sender, and broadcasts announcements. Messages sent before the receiving
/// side subscribes are held back and replayed on subscription, the way a
/// real relay would queue for a briefly absent peer.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or fetch) the endpoint for `peer`.
    pub fn endpoint(&self, peer: impl Into<PeerId>) -> Arc<MemoryChannel> {
        let peer = peer.into();
        self.state.lock().endpoints.entry(peer.clone()).or_default();
        Arc::new(MemoryChannel {
            peer,
            state: Arc::clone(&self.state),
        })
    }
}

/// One endpoint of a [`MemoryHub`].
pub struct MemoryChannel {
    peer: PeerId,
    state: Arc<Mutex<HubState>>,
}

#[async_trait]
impl SignalChannel for MemoryChannel {
    fn local_peer(&self) -> &PeerId {
        &self.peer
    }

    async fn send(&self, to: &PeerId, message: SignalMessage) -> Result<(), CoupleError> {
        let mut state = self.state.lock();
        let Some(endpoint) = state.endpoints.get_mut(to) else {
            return Err(CoupleError::ChannelUnavailable(format!(
                "no endpoint registered for {to}"
            )));
        };
        match endpoint.subscriptions.get(&self.peer) {
            Some(tx) => {
                if tx.send(message).is_err() {
                    // Receiver dropped: the peer unsubscribed.
                    endpoint.subscriptions.remove(&self.peer);
                }
            }
            None => {
                endpoint
                    .mailbox
                    .entry(self.peer.clone())
                    .or_default()
                    .push(message);
            }
        }
        Ok(())
    }

    fn subscribe(&self, from: &PeerId) -> mpsc::UnboundedReceiver<SignalMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let endpoint = state.endpoints.entry(self.peer.clone()).or_default();
        if let Some(held) = endpoint.mailbox.remove(from) {
            for message in held {
                let _ = tx.send(message);
            }
        }
        endpoint.subscriptions.insert(from.clone(), tx);
        rx
    }

    async fn announce(&self, metadata: serde_json::Value) -> Result<(), CoupleError> {
        let announcement = Announcement {
            peer: self.peer.clone(),
            metadata,
        };
        let mut state = self.state.lock();
        for (peer, endpoint) in state.endpoints.iter_mut() {
            if *peer == self.peer {
                continue;
            }
            endpoint
                .announce_subs
                .retain(|tx| tx.send(announcement.clone()).is_ok());
        }
        Ok(())
    }

    fn announcements(&self) -> mpsc::UnboundedReceiver<Announcement> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state
            .endpoints
            .entry(self.peer.clone())
            .or_default()
            .announce_subs
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SessionId;

    fn bye(raw: u64) -> SignalMessage {
        SignalMessage::Bye {
            session_id: SessionId::from_raw(raw),
        }
    }

    #[tokio::test]
    async fn delivers_in_order_per_sender() {
        let hub = MemoryHub::new();
        let alice = hub.endpoint("alice");
        let bob = hub.endpoint("bob");
        let mut from_alice = bob.subscribe(&"alice".into());

        for raw in 0..10 {
            alice.send(&"bob".into(), bye(raw)).await.expect("send");
        }
        for raw in 0..10 {
            assert_eq!(from_alice.recv().await, Some(bye(raw)));
        }
    }

    #[tokio::test]
    async fn holds_messages_until_subscription() {
        let hub = MemoryHub::new();
        let alice = hub.endpoint("alice");
        let bob = hub.endpoint("bob");

        alice.send(&"bob".into(), bye(1)).await.expect("send");
        alice.send(&"bob".into(), bye(2)).await.expect("send");

        let mut from_alice = bob.subscribe(&"alice".into());
        assert_eq!(from_alice.recv().await, Some(bye(1)));
        assert_eq!(from_alice.recv().await, Some(bye(2)));
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails() {
        let hub = MemoryHub::new();
        let alice = hub.endpoint("alice");
        let err = alice
            .send(&"nobody".into(), bye(1))
            .await
            .expect_err("unknown peer");
        assert!(matches!(err, CoupleError::ChannelUnavailable(_)));
    }

    #[tokio::test]
    async fn announcements_reach_everyone_else() {
        let hub = MemoryHub::new();
        let alice = hub.endpoint("alice");
        let bob = hub.endpoint("bob");
        let carol = hub.endpoint("carol");

        let mut alice_rx = alice.announcements();
        let mut bob_rx = bob.announcements();
        let mut carol_rx = carol.announcements();

        alice
            .announce(serde_json::json!({ "room": "lobby" }))
            .await
            .expect("announce");

        let seen = bob_rx.recv().await.expect("bob announcement");
        assert_eq!(seen.peer, PeerId::from("alice"));
        assert_eq!(seen.metadata["room"], "lobby");
        assert_eq!(carol_rx.recv().await.expect("carol announcement").peer, "alice".into());
        assert!(alice_rx.try_recv().is_err(), "sender must not hear itself");
    }
}
