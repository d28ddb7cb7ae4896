// Conversation state for palaver
// Per-contact ordered message logs, merged from history fetches, push
// events, and optimistic local sends.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::models::{DeliveryState, Message, SendPayload, WireMessage};

/// Push events for a conversation that is not materialized yet are parked
/// here until its history arrives. Oldest entries are dropped beyond the
/// cap; a later history fetch re-derives anything lost.
const UNMATERIALIZED_BUFFER_CAP: usize = 64;

/// Issued by `begin_load`; only the newest outstanding token may apply
/// its result. A token for a superseded selection is rejected on arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadToken {
    contact_id: String,
    seq: u64,
}

impl LoadToken {
    pub fn contact_id(&self) -> &str {
        &self.contact_id
    }
}

/// Outcome of a send request, as seen by the store.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// The server accepted the message and assigned it an id/timestamp.
    Delivered(WireMessage),
    /// The request failed; the optimistic entry stays visible as Failed.
    Failed,
}

/// Per-contact ordered, deduplicated message logs.
///
/// Every mutation funnels through the engine's routing path or its send
/// path, so the store itself needs no internal locking.
pub struct ConversationStore {
    identity_id: Option<String>,
    logs: HashMap<String, Vec<Message>>,
    unmaterialized: HashMap<String, VecDeque<Message>>,
    load_seq: u64,
    latest_load: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        ConversationStore {
            identity_id: None,
            logs: HashMap::new(),
            unmaterialized: HashMap::new(),
            load_seq: 0,
            latest_load: 0,
        }
    }

    /// Bind the store to an identity. Must be called before any message
    /// flows; the id decides which side of a message is "the contact".
    pub fn set_identity(&mut self, identity_id: &str) {
        self.identity_id = Some(identity_id.to_string());
    }

    /// Drop everything: logs, buffers, in-flight load guards. Called on
    /// identity loss so no conversation leaks across identities.
    pub fn purge_all(&mut self) {
        let count = self.logs.len();
        self.identity_id = None;
        self.logs.clear();
        self.unmaterialized.clear();
        // Invalidate any in-flight load result without reissuing tokens
        self.load_seq += 1;
        self.latest_load = self.load_seq;
        if count > 0 {
            info!("Purged {} conversations", count);
        }
    }

    /// Start a history load for a contact. The returned token supersedes
    /// every earlier outstanding token.
    pub fn begin_load(&mut self, contact_id: &str) -> LoadToken {
        self.load_seq += 1;
        self.latest_load = self.load_seq;
        debug!("History load {} started for contact {}", self.load_seq, contact_id);
        LoadToken {
            contact_id: contact_id.to_string(),
            seq: self.load_seq,
        }
    }

    /// Apply a finished history fetch. Replaces the contact's log with the
    /// fetched baseline, folds in buffered push events and any local
    /// entries that still lack a server id, and returns true.
    ///
    /// A stale token (a newer load was issued since) is discarded and
    /// returns false; the caller must not treat that as an error.
    pub fn complete_load(&mut self, token: &LoadToken, history: Vec<WireMessage>) -> bool {
        if token.seq != self.latest_load {
            debug!(
                "Discarding stale history result for contact {} (load {} superseded by {})",
                token.contact_id, token.seq, self.latest_load
            );
            return false;
        }

        let mut log: Vec<Message> = Vec::with_capacity(history.len());
        for wire in history {
            let message = Message::from_wire(wire);
            if !contains_server_id(&log, &message) {
                insert_ordered(&mut log, message);
            }
        }

        // Local entries with no server id yet survive the replacement
        if let Some(previous) = self.logs.remove(&token.contact_id) {
            for message in previous {
                if message.server_id.is_none() {
                    insert_ordered(&mut log, message);
                }
            }
        }

        // Fold in push events that arrived before the history did
        if let Some(buffered) = self.unmaterialized.remove(&token.contact_id) {
            for message in buffered {
                if !contains_server_id(&log, &message) {
                    insert_ordered(&mut log, message);
                }
            }
        }

        info!(
            "Conversation with {} materialized: {} messages",
            token.contact_id,
            log.len()
        );
        self.logs.insert(token.contact_id.clone(), log);
        true
    }

    /// Merge one push-delivered message. Idempotent on server id; inserts
    /// at the `created_at` position so late arrivals cannot corrupt order.
    ///
    /// Returns the contact id the message belongs to when it changed any
    /// state (inserted or buffered), None when it was absorbed as a
    /// duplicate or no identity is bound.
    pub fn apply_incoming(&mut self, wire: WireMessage) -> Option<String> {
        let me = self.identity_id.as_deref()?;
        let contact_id = if wire.sender_id == me {
            wire.receiver_id.clone()
        } else {
            wire.sender_id.clone()
        };

        let message = Message::from_wire(wire);

        match self.logs.get_mut(&contact_id) {
            Some(log) => {
                if contains_server_id(log, &message) {
                    debug!(
                        "Duplicate message {} for contact {} absorbed",
                        message.server_id.as_deref().unwrap_or("?"),
                        contact_id
                    );
                    return None;
                }
                insert_ordered(log, message);
                Some(contact_id)
            }
            None => {
                let buffer = self.unmaterialized.entry(contact_id.clone()).or_default();
                if buffer
                    .iter()
                    .any(|m| m.server_id == message.server_id && m.server_id.is_some())
                {
                    return None;
                }
                buffer.push_back(message);
                if buffer.len() > UNMATERIALIZED_BUFFER_CAP {
                    buffer.pop_front();
                    warn!(
                        "Push buffer for contact {} overflowed; oldest entry dropped",
                        contact_id
                    );
                }
                Some(contact_id)
            }
        }
    }

    /// Record a locally originated message before the network has seen it.
    /// Returns the entry's local key for later reconciliation.
    pub fn send_optimistic(&mut self, receiver_id: &str, payload: &SendPayload) -> Option<String> {
        let me = self.identity_id.as_deref()?;
        let message = Message {
            local_key: Uuid::new_v4().to_string(),
            server_id: None,
            sender_id: me.to_string(),
            receiver_id: receiver_id.to_string(),
            text: payload.text.clone(),
            image_ref: payload.image.clone(),
            created_at: Utc::now(),
            delivery_state: DeliveryState::Pending,
        };
        let local_key = message.local_key.clone();

        let log = self.logs.entry(receiver_id.to_string()).or_default();
        insert_ordered(log, message);
        debug!("Optimistic message {} appended for {}", local_key, receiver_id);
        Some(local_key)
    }

    /// Settle an optimistic entry.
    ///
    /// Success adopts the server's id and timestamp (server clock wins,
    /// so the entry is re-sorted, not just patched). If a push event
    /// already delivered the same server id, the optimistic entry is
    /// absorbed rather than duplicated. Failure flips the entry to
    /// Failed; it never silently vanishes.
    pub fn reconcile_send(&mut self, local_key: &str, outcome: SendOutcome) {
        let Some((contact_id, index)) = self.find_by_local_key(local_key) else {
            // Entry purged (identity switch) or never existed; the result
            // is discarded on arrival.
            debug!("Reconcile for unknown local key {} discarded", local_key);
            return;
        };

        match outcome {
            SendOutcome::Delivered(wire) => {
                let log = self.logs.get_mut(&contact_id).expect("log exists");
                let echoed = log
                    .iter()
                    .any(|m| m.server_id.as_deref() == Some(wire.id.as_str()));
                let mut entry = log.remove(index);
                if echoed {
                    // The push echo won the race; drop the optimistic copy
                    debug!(
                        "Optimistic entry {} absorbed into echoed message {}",
                        local_key, wire.id
                    );
                    return;
                }
                entry.server_id = Some(wire.id);
                entry.created_at = wire.created_at;
                entry.delivery_state = DeliveryState::Sent;
                insert_ordered(log, entry);
            }
            SendOutcome::Failed => {
                let log = self.logs.get_mut(&contact_id).expect("log exists");
                log[index].delivery_state = DeliveryState::Failed;
                warn!("Send {} to {} failed; entry kept for retry", local_key, contact_id);
            }
        }
    }

    /// Recover a failed entry's payload and flip it back to Pending so the
    /// engine can resend it. None if the key is unknown or not Failed.
    pub fn retry_failed(&mut self, local_key: &str) -> Option<(String, SendPayload)> {
        let (contact_id, index) = self.find_by_local_key(local_key)?;
        let log = self.logs.get_mut(&contact_id)?;
        let entry = &mut log[index];
        if entry.delivery_state != DeliveryState::Failed {
            return None;
        }
        entry.delivery_state = DeliveryState::Pending;
        let payload = SendPayload {
            text: entry.text.clone(),
            image: entry.image_ref.clone(),
        };
        Some((contact_id, payload))
    }

    /// The ordered log for a contact. Empty when not materialized.
    pub fn messages(&self, contact_id: &str) -> &[Message] {
        self.logs.get(contact_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_materialized(&self, contact_id: &str) -> bool {
        self.logs.contains_key(contact_id)
    }

    /// Most recent message known for a contact, materialized or buffered.
    /// Drives the directory's last-message summary.
    pub fn tail(&self, contact_id: &str) -> Option<&Message> {
        if let Some(log) = self.logs.get(contact_id) {
            return log.last();
        }
        self.unmaterialized.get(contact_id).and_then(|b| b.back())
    }

    fn find_by_local_key(&self, local_key: &str) -> Option<(String, usize)> {
        for (contact_id, log) in &self.logs {
            if let Some(index) = log.iter().position(|m| m.local_key == local_key) {
                return Some((contact_id.clone(), index));
            }
        }
        None
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

fn contains_server_id(log: &[Message], message: &Message) -> bool {
    match message.server_id.as_deref() {
        Some(id) => log.iter().any(|m| m.server_id.as_deref() == Some(id)),
        None => false,
    }
}

// Insert keeping created_at order; equal timestamps keep arrival order.
fn insert_ordered(log: &mut Vec<Message>, message: Message) {
    let index = log.partition_point(|m| m.created_at <= message.created_at);
    log.insert(index, message);
}
