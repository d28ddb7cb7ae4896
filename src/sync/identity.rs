// Identity lifecycle for palaver
// Holds the authenticated identity; everything downstream keys its
// validity off the epoch counter bumped on every transition.

use log::{info, warn};
use tokio::sync::mpsc;

use crate::models::Identity;

#[derive(Debug, Clone, PartialEq)]
pub enum IdentityEvent {
    SignedIn(Identity),
    SignedOut,
}

/// The authenticated local user and its lifecycle.
///
/// Each transition (null → identity, identity → null, identity A →
/// identity B) bumps the epoch. Async results stamped with an older epoch
/// are discarded on arrival, which is what keeps a stale channel or a
/// late history response from leaking state across identities.
pub struct IdentityContext {
    current: Option<Identity>,
    epoch: u64,
    subscribers: Vec<mpsc::Sender<IdentityEvent>>,
}

impl IdentityContext {
    pub fn new() -> Self {
        IdentityContext {
            current: None,
            epoch: 0,
            subscribers: Vec::new(),
        }
    }

    pub fn current(&self) -> Option<&Identity> {
        self.current.as_ref()
    }

    pub fn id(&self) -> Option<&str> {
        self.current.as_ref().map(|i| i.id.as_str())
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Install an identity. Re-setting the same identity is a no-op; a
    /// different identity (or a first sign-in) bumps the epoch and fires
    /// the change notification.
    pub fn set(&mut self, identity: Identity) -> u64 {
        if self.current.as_ref().map(|i| i.id.as_str()) == Some(identity.id.as_str()) {
            return self.epoch;
        }
        info!("Identity set to {} ({})", identity.display_name, identity.id);
        self.current = Some(identity.clone());
        self.epoch += 1;
        self.notify(IdentityEvent::SignedIn(identity));
        self.epoch
    }

    /// Drop the identity. No-op when already signed out.
    pub fn clear(&mut self) {
        if self.current.is_none() {
            return;
        }
        info!("Identity cleared");
        self.current = None;
        self.epoch += 1;
        self.notify(IdentityEvent::SignedOut);
    }

    pub fn subscribe(&mut self) -> mpsc::Receiver<IdentityEvent> {
        let (tx, rx) = mpsc::channel(16);
        self.subscribers.push(tx);
        rx
    }

    fn notify(&mut self, event: IdentityEvent) {
        let mut to_remove = Vec::new();
        for (i, tx) in self.subscribers.iter().enumerate() {
            if let Err(e) = tx.try_send(event.clone()) {
                match e {
                    mpsc::error::TrySendError::Closed(_) => to_remove.push(i),
                    mpsc::error::TrySendError::Full(_) => {
                        warn!("Identity subscriber channel full; notification dropped");
                    }
                }
            }
        }
        for i in to_remove.into_iter().rev() {
            self.subscribers.remove(i);
        }
    }
}

impl Default for IdentityContext {
    fn default() -> Self {
        Self::new()
    }
}
