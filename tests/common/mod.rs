// Common test utilities for integration tests
// This module contains shared code for all integration tests

// Standard library imports
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

// External crate imports
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::LevelFilter;
use tokio::sync::Notify;

// Import the crate functionality
use palaver::api::ChatApi;
use palaver::error::{Result, SyncError};
use palaver::models::{Contact, Identity, SendPayload, WireMessage};
use palaver::sync::channel::{InProcessConnector, InProcessHub};
use palaver::sync::SyncEngine;

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub fn identity(id: &str, name: &str) -> Identity {
    Identity {
        id: id.to_string(),
        display_name: name.to_string(),
        avatar_url: None,
    }
}

pub fn contact(id: &str, name: &str) -> Contact {
    Contact {
        id: id.to_string(),
        display_name: name.to_string(),
        avatar_url: None,
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn wire(id: &str, from: &str, to: &str, text: &str, secs: i64) -> WireMessage {
    WireMessage {
        id: id.to_string(),
        sender_id: from.to_string(),
        receiver_id: to.to_string(),
        text: Some(text.to_string()),
        image: None,
        created_at: at(secs),
    }
}

/// Poll an async condition until it holds or the deadline passes.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// An engine wired to a scripted REST collaborator and a loopback
/// channel. The hub is the test's handle for pushing channel events.
pub fn build_engine(api: Arc<ScriptedApi>) -> (SyncEngine, InProcessHub) {
    let (connector, hub) = InProcessConnector::pair();
    (SyncEngine::new(api, Arc::new(connector)), hub)
}

/// A fully scripted REST collaborator. Responses are set up before the
/// scenario runs; per-contact gates let a test hold a history response
/// in flight while others resolve.
pub struct ScriptedApi {
    identity: Mutex<Option<Identity>>,
    contacts: Mutex<Vec<Contact>>,
    histories: Mutex<HashMap<String, Vec<WireMessage>>>,
    history_gates: Mutex<HashMap<String, Arc<Notify>>>,
    send_queue: Mutex<VecDeque<std::result::Result<WireMessage, ()>>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        ScriptedApi {
            identity: Mutex::new(None),
            contacts: Mutex::new(Vec::new()),
            histories: Mutex::new(HashMap::new()),
            history_gates: Mutex::new(HashMap::new()),
            send_queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_identity(&self, identity: Identity) {
        *self.identity.lock().unwrap() = Some(identity);
    }

    pub fn set_contacts(&self, contacts: Vec<Contact>) {
        *self.contacts.lock().unwrap() = contacts;
    }

    pub fn set_history(&self, contact_id: &str, messages: Vec<WireMessage>) {
        self.histories
            .lock()
            .unwrap()
            .insert(contact_id.to_string(), messages);
    }

    /// Hold the next history fetch for this contact until the returned
    /// notify is triggered.
    pub fn gate_history(&self, contact_id: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.history_gates
            .lock()
            .unwrap()
            .insert(contact_id.to_string(), gate.clone());
        gate
    }

    pub fn queue_send_ok(&self, wire: WireMessage) {
        self.send_queue.lock().unwrap().push_back(Ok(wire));
    }

    pub fn queue_send_fail(&self) {
        self.send_queue.lock().unwrap().push_back(Err(()));
    }
}

#[async_trait]
impl ChatApi for ScriptedApi {
    async fn check_session(&self) -> Result<Identity> {
        self.identity
            .lock()
            .unwrap()
            .clone()
            .ok_or(SyncError::Unauthenticated)
    }

    async fn logout(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch_contacts(&self) -> Result<Vec<Contact>> {
        Ok(self.contacts.lock().unwrap().clone())
    }

    async fn fetch_history(&self, contact_id: &str) -> Result<Vec<WireMessage>> {
        let gate = self.history_gates.lock().unwrap().remove(contact_id);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(contact_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, _contact_id: &str, _payload: &SendPayload) -> Result<WireMessage> {
        match self.send_queue.lock().unwrap().pop_front() {
            Some(Ok(wire)) => Ok(wire),
            Some(Err(())) | None => Err(SyncError::Api {
                status: 500,
                message: "scripted send failure".to_string(),
            }),
        }
    }
}
