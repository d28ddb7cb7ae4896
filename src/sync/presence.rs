// Presence tracking for palaver
// The server pushes the full set of online contact ids; membership is
// replaced wholesale, never patched, so a missed event cannot leave the
// set diverged.

use log::{debug, warn};
use std::collections::HashSet;
use tokio::sync::mpsc;

/// Current set of reachable contact identifiers.
pub struct PresenceTracker {
    online: HashSet<String>,
    subscribers: Vec<mpsc::Sender<Vec<String>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        PresenceTracker {
            online: HashSet::new(),
            subscribers: Vec::new(),
        }
    }

    /// Replace the whole set atomically. Subscribers are notified after
    /// every snapshot; the return value says whether membership changed.
    pub fn apply_snapshot(&mut self, ids: Vec<String>) -> bool {
        let next: HashSet<String> = ids.into_iter().collect();
        let changed = next != self.online;
        if changed {
            debug!("Presence snapshot applied: {} contacts online", next.len());
        }
        self.online = next;
        self.notify_subscribers();
        changed
    }

    pub fn is_online(&self, id: &str) -> bool {
        self.online.contains(id)
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Forget all presence. Used on identity loss; a fresh snapshot on the
    /// next connect rebuilds the set.
    pub fn clear(&mut self) {
        self.online.clear();
        self.notify_subscribers();
    }

    /// Subscribe to snapshot notifications. Each notification carries the
    /// full current membership.
    pub fn subscribe(&mut self) -> mpsc::Receiver<Vec<String>> {
        let (tx, rx) = mpsc::channel(16);
        self.subscribers.push(tx);
        rx
    }

    fn notify_subscribers(&mut self) {
        let snapshot: Vec<String> = self.online.iter().cloned().collect();
        let mut to_remove = Vec::new();

        for (i, tx) in self.subscribers.iter().enumerate() {
            if let Err(e) = tx.try_send(snapshot.clone()) {
                match e {
                    mpsc::error::TrySendError::Closed(_) => to_remove.push(i),
                    mpsc::error::TrySendError::Full(_) => {
                        warn!("Presence subscriber channel full; notification dropped");
                    }
                }
            }
        }

        for i in to_remove.into_iter().rev() {
            self.subscribers.remove(i);
        }
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
