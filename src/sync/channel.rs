// Event channel contract for palaver
// The push transport is a collaborator, not part of the engine: anything
// that can deliver named events for an identity-bound connection plugs in
// here. Reconnect policy lives on this side of the seam too.

use async_trait::async_trait;
use log::{info, warn};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};
use crate::models::WireMessage;

/// Inbound named events, already decoded by the transport.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// `newMessage`: a full message addressed to or from the identity.
    Message(WireMessage),
    /// `getOnlineUsers`: the full array of online contact ids.
    Presence(Vec<String>),
    /// The transport lost the connection.
    Closed,
}

/// An established, identity-bound event channel.
///
/// Implementations must release the underlying transport when dropped;
/// the engine force-closes by dropping the channel.
#[async_trait]
pub trait EventChannel: Send {
    /// Next event, or None once the channel is finished for good.
    async fn recv(&mut self) -> Option<ChannelEvent>;
}

/// Opens event channels. Retry and backoff are this collaborator's
/// responsibility; the engine calls `connect` once per session attempt
/// and only reacts to the outcome.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, identity_id: &str) -> Result<Box<dyn EventChannel>>;
}

/// Wraps any connector with bounded exponential backoff.
pub struct ReconnectingConnector<C> {
    inner: C,
    max_attempts: u32,
}

impl<C: ChannelConnector> ReconnectingConnector<C> {
    pub fn new(inner: C, max_attempts: u32) -> Self {
        ReconnectingConnector {
            inner,
            max_attempts: max_attempts.max(1),
        }
    }
}

#[async_trait]
impl<C: ChannelConnector> ChannelConnector for ReconnectingConnector<C> {
    async fn connect(&self, identity_id: &str) -> Result<Box<dyn EventChannel>> {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match self.inner.connect(identity_id).await {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    warn!(
                        "Channel connect failed (attempt {}/{}): {}",
                        attempt, self.max_attempts, e
                    );
                    last_error = Some(e);
                }
            }
            if attempt < self.max_attempts {
                let jitter = rand::thread_rng().gen_range(0..250);
                let backoff = Duration::from_millis(500 * 2u64.pow(attempt) + jitter);
                info!("Retrying channel connect in {:?}", backoff);
                tokio::time::sleep(backoff).await;
            }
        }
        Err(last_error.unwrap_or(SyncError::ChannelClosed))
    }
}

/// In-process loopback channel. Production deployments plug a real
/// transport into `ChannelConnector`; this one backs the test suite and
/// the binary's channel-less mode.
pub struct InProcessChannel {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[async_trait]
impl EventChannel for InProcessChannel {
    async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }
}

type HubSlot = Arc<Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>>;

/// The far end of the loopback: what a test (or demo server) uses to
/// push events at the engine.
#[derive(Clone)]
pub struct InProcessHub {
    slot: HubSlot,
    connected_identity: Arc<Mutex<Option<String>>>,
}

impl InProcessHub {
    pub fn push_message(&self, message: WireMessage) -> bool {
        self.push(ChannelEvent::Message(message))
    }

    pub fn push_presence(&self, ids: Vec<String>) -> bool {
        self.push(ChannelEvent::Presence(ids))
    }

    /// Simulate a transport drop. The engine will reconnect through the
    /// connector, which refreshes the hub's sender slot.
    pub fn drop_connection(&self) {
        self.push(ChannelEvent::Closed);
        *self.slot.lock().unwrap() = None;
    }

    /// The identity id the most recent connect was bound to.
    pub fn connected_identity(&self) -> Option<String> {
        self.connected_identity.lock().unwrap().clone()
    }

    fn push(&self, event: ChannelEvent) -> bool {
        let slot = self.slot.lock().unwrap();
        match slot.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

/// Connector side of the loopback pair.
pub struct InProcessConnector {
    slot: HubSlot,
    connected_identity: Arc<Mutex<Option<String>>>,
}

impl InProcessConnector {
    /// A connected connector/hub pair sharing one event slot.
    pub fn pair() -> (InProcessConnector, InProcessHub) {
        let slot: HubSlot = Arc::new(Mutex::new(None));
        let connected_identity = Arc::new(Mutex::new(None));
        (
            InProcessConnector {
                slot: slot.clone(),
                connected_identity: connected_identity.clone(),
            },
            InProcessHub {
                slot,
                connected_identity,
            },
        )
    }
}

#[async_trait]
impl ChannelConnector for InProcessConnector {
    async fn connect(&self, identity_id: &str) -> Result<Box<dyn EventChannel>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.slot.lock().unwrap() = Some(tx);
        *self.connected_identity.lock().unwrap() = Some(identity_id.to_string());
        info!("In-process channel connected for identity {}", identity_id);
        Ok(Box::new(InProcessChannel { rx }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn loopback_delivers_events_in_order() {
        let (connector, hub) = InProcessConnector::pair();
        let mut channel = connector.connect("me").await.unwrap();
        assert_eq!(hub.connected_identity().as_deref(), Some("me"));

        hub.push_presence(vec!["alice".into()]);
        hub.push_message(WireMessage {
            id: "m1".into(),
            sender_id: "alice".into(),
            receiver_id: "me".into(),
            text: Some("hi".into()),
            image: None,
            created_at: Utc::now(),
        });

        assert!(matches!(channel.recv().await, Some(ChannelEvent::Presence(ids)) if ids == vec!["alice".to_string()]));
        assert!(matches!(channel.recv().await, Some(ChannelEvent::Message(m)) if m.id == "m1"));
    }

    #[tokio::test]
    async fn dropped_connection_surfaces_closed() {
        let (connector, hub) = InProcessConnector::pair();
        let mut channel = connector.connect("me").await.unwrap();

        hub.drop_connection();
        assert!(matches!(channel.recv().await, Some(ChannelEvent::Closed)));
        assert!(!hub.push_presence(vec![]), "hub must reject pushes while disconnected");
    }
}
