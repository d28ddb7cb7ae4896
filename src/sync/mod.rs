// Synchronization engine for palaver
// Owns the channel lifecycle, routes push events into the presence and
// conversation stores, and carries the optimistic send path.

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;

pub mod channel;
pub mod conversation;
pub mod directory;
pub mod identity;
pub mod presence;

use crate::api::ChatApi;
use crate::error::{Result, SyncError};
use crate::models::{DirectoryEntry, Identity, Message, SendPayload};
use channel::{ChannelConnector, ChannelEvent, EventChannel};
use conversation::{ConversationStore, SendOutcome};
use directory::ContactDirectory;
use identity::{IdentityContext, IdentityEvent};
use presence::PresenceTracker;

/// Channel lifecycle as the engine sees it. Transport-internal retries
/// all happen under `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Disconnected,
    Connecting,
    Connected,
}

// Everything a routing loop needs, cloned per session.
struct SessionContext {
    epoch: u64,
    identity_id: String,
    connector: Arc<dyn ChannelConnector>,
    identity: Arc<TokioMutex<IdentityContext>>,
    presence: Arc<TokioMutex<PresenceTracker>>,
    conversations: Arc<TokioMutex<ConversationStore>>,
    directory: Arc<TokioMutex<ContactDirectory>>,
    state: Arc<std::sync::Mutex<EngineState>>,
}

/// The synchronization engine.
///
/// One engine serves one identity session at a time. All store mutation
/// funnels through the routing loop and the send path, so the stores see
/// one ordered stream of changes per session.
pub struct SyncEngine {
    api: Arc<dyn ChatApi>,
    connector: Arc<dyn ChannelConnector>,
    identity: Arc<TokioMutex<IdentityContext>>,
    presence: Arc<TokioMutex<PresenceTracker>>,
    conversations: Arc<TokioMutex<ConversationStore>>,
    directory: Arc<TokioMutex<ContactDirectory>>,
    state: Arc<std::sync::Mutex<EngineState>>,
    routing_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(api: Arc<dyn ChatApi>, connector: Arc<dyn ChannelConnector>) -> Self {
        SyncEngine {
            api,
            connector,
            identity: Arc::new(TokioMutex::new(IdentityContext::new())),
            presence: Arc::new(TokioMutex::new(PresenceTracker::new())),
            conversations: Arc::new(TokioMutex::new(ConversationStore::new())),
            directory: Arc::new(TokioMutex::new(ContactDirectory::new())),
            state: Arc::new(std::sync::Mutex::new(EngineState::Disconnected)),
            routing_task: std::sync::Mutex::new(None),
        }
    }

    /// Resolve the session cookie to an identity and bring the session
    /// up: contacts fetched, channel connected, routing loop running.
    pub async fn sign_in(&self) -> Result<Identity> {
        let identity = self.api.check_session().await?;
        self.start_session(identity.clone()).await?;
        Ok(identity)
    }

    /// Invalidate the session server-side (best effort) and tear down
    /// all local state for it.
    pub async fn sign_out(&self) {
        if let Err(e) = self.api.logout().await {
            warn!("Logout request failed: {}", e);
        }
        self.identity.lock().await.clear();
        self.stop_session().await;
    }

    /// Materialize the conversation with a contact: fetch its history
    /// and replace the log. A result arriving for a superseded selection
    /// or a dead identity is discarded silently.
    pub async fn select_contact(&self, contact_id: &str) -> Result<()> {
        let epoch = self.current_epoch().await.ok_or(SyncError::NotConnected("no identity"))?;
        let token = self.conversations.lock().await.begin_load(contact_id);

        let history = self.api.fetch_history(contact_id).await?;

        if self.current_epoch().await != Some(epoch) {
            debug!("History for {} arrived after identity change; discarded", contact_id);
            return Ok(());
        }
        let applied = self.conversations.lock().await.complete_load(&token, history);
        if applied {
            self.directory.lock().await.mark_dirty();
        }
        Ok(())
    }

    /// Optimistic send: the entry is visible in the log before this
    /// returns; the network settlement happens in the background and
    /// always lands in `reconcile_send`.
    pub async fn send(&self, contact_id: &str, payload: SendPayload) -> Result<String> {
        if payload.is_empty() {
            return Err(SyncError::EmptyPayload);
        }
        let epoch = self.current_epoch().await.ok_or(SyncError::NotConnected("no identity"))?;

        let local_key = self
            .conversations
            .lock()
            .await
            .send_optimistic(contact_id, &payload)
            .ok_or(SyncError::NotConnected("no identity"))?;
        self.directory.lock().await.mark_dirty();

        self.spawn_settle(epoch, contact_id.to_string(), local_key.clone(), payload);
        Ok(local_key)
    }

    /// Resend a failed entry through the normal settle path. Returns
    /// false when the key is unknown or the entry is not in Failed state.
    pub async fn retry_send(&self, local_key: &str) -> Result<bool> {
        let epoch = self.current_epoch().await.ok_or(SyncError::NotConnected("no identity"))?;

        let retry = self.conversations.lock().await.retry_failed(local_key);
        match retry {
            Some((contact_id, payload)) => {
                self.directory.lock().await.mark_dirty();
                self.spawn_settle(epoch, contact_id, local_key.to_string(), payload);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Refetch the contact list. This is the retry affordance for a
    /// failed initial load.
    pub async fn refresh_contacts(&self) -> Result<usize> {
        let epoch = self.current_epoch().await.ok_or(SyncError::NotConnected("no identity"))?;
        let contacts = self.api.fetch_contacts().await?;
        if self.current_epoch().await != Some(epoch) {
            return Ok(0);
        }
        let count = contacts.len();
        self.directory.lock().await.set_contacts(contacts);
        Ok(count)
    }

    /// Reattempt the channel connect for the current identity after the
    /// transport gave up.
    pub async fn reconnect(&self) -> Result<()> {
        let (epoch, identity_id) = {
            let identity = self.identity.lock().await;
            match identity.current() {
                Some(i) => (identity.epoch(), i.id.clone()),
                None => return Err(SyncError::NotConnected("no identity")),
            }
        };
        self.connect_channel(epoch, identity_id).await
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    pub async fn current_identity(&self) -> Option<Identity> {
        self.identity.lock().await.current().cloned()
    }

    pub async fn is_online(&self, contact_id: &str) -> bool {
        self.presence.lock().await.is_online(contact_id)
    }

    pub async fn online_count(&self) -> usize {
        self.presence.lock().await.online_count()
    }

    /// Snapshot of a conversation's ordered log.
    pub async fn messages(&self, contact_id: &str) -> Vec<Message> {
        self.conversations.lock().await.messages(contact_id).to_vec()
    }

    /// The display-ordered directory.
    pub async fn directory_entries(&self) -> Vec<DirectoryEntry> {
        let presence = self.presence.lock().await;
        let conversations = self.conversations.lock().await;
        let mut directory = self.directory.lock().await;
        directory.list(&presence, &conversations).to_vec()
    }

    /// Case-insensitive name search over the directory.
    pub async fn search_contacts(&self, term: &str) -> Vec<DirectoryEntry> {
        let presence = self.presence.lock().await;
        let conversations = self.conversations.lock().await;
        let mut directory = self.directory.lock().await;
        directory.search(term, &presence, &conversations)
    }

    pub async fn subscribe_identity(&self) -> tokio::sync::mpsc::Receiver<IdentityEvent> {
        self.identity.lock().await.subscribe()
    }

    pub async fn subscribe_presence(&self) -> tokio::sync::mpsc::Receiver<Vec<String>> {
        self.presence.lock().await.subscribe()
    }

    async fn current_epoch(&self) -> Option<u64> {
        let identity = self.identity.lock().await;
        identity.current().map(|_| identity.epoch())
    }

    async fn start_session(&self, identity: Identity) -> Result<()> {
        {
            let ctx = self.identity.lock().await;
            if ctx.id() == Some(identity.id.as_str()) {
                debug!("Session for {} already running", identity.id);
                return Ok(());
            }
        }

        // A different identity was active: purge it first. Cross-identity
        // leakage is a correctness bug, not a cosmetic one.
        self.stop_session().await;

        let identity_id = identity.id.clone();
        let epoch = self.identity.lock().await.set(identity);
        self.conversations.lock().await.set_identity(&identity_id);

        match self.api.fetch_contacts().await {
            Ok(contacts) => self.directory.lock().await.set_contacts(contacts),
            // The directory stays empty; refresh_contacts is the retry
            Err(e) => warn!("Initial contact fetch failed: {}", e),
        }

        self.connect_channel(epoch, identity_id).await
    }

    async fn stop_session(&self) {
        let task = self.routing_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            // Wait until the loop has actually stopped so it cannot
            // route one more event into the stores we are about to purge
            let _ = task.await;
        }
        *self.state.lock().unwrap() = EngineState::Disconnected;
        self.presence.lock().await.clear();
        self.conversations.lock().await.purge_all();
        self.directory.lock().await.clear();
    }

    async fn connect_channel(&self, epoch: u64, identity_id: String) -> Result<()> {
        *self.state.lock().unwrap() = EngineState::Connecting;
        let channel = match self.connector.connect(&identity_id).await {
            Ok(channel) => channel,
            Err(e) => {
                *self.state.lock().unwrap() = EngineState::Disconnected;
                return Err(e);
            }
        };
        *self.state.lock().unwrap() = EngineState::Connected;
        info!("Event channel connected for identity {}", identity_id);

        let context = SessionContext {
            epoch,
            identity_id,
            connector: self.connector.clone(),
            identity: self.identity.clone(),
            presence: self.presence.clone(),
            conversations: self.conversations.clone(),
            directory: self.directory.clone(),
            state: self.state.clone(),
        };

        let task = tokio::spawn(routing_loop(channel, context));
        if let Some(previous) = self.routing_task.lock().unwrap().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn spawn_settle(&self, epoch: u64, contact_id: String, local_key: String, payload: SendPayload) {
        let api = self.api.clone();
        let identity = self.identity.clone();
        let conversations = self.conversations.clone();
        let directory = self.directory.clone();

        tokio::spawn(async move {
            let outcome = match api.send_message(&contact_id, &payload).await {
                Ok(wire) => SendOutcome::Delivered(wire),
                Err(e) => {
                    warn!("Send to {} failed: {}", contact_id, e);
                    SendOutcome::Failed
                }
            };

            // Identity changed while the request was in flight: the store
            // was purged, the result is dead on arrival.
            if identity.lock().await.epoch() != epoch {
                debug!("Send settlement for {} discarded after identity change", local_key);
                return;
            }
            conversations.lock().await.reconcile_send(&local_key, outcome);
            directory.lock().await.mark_dirty();
        });
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(task) = self.routing_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

// One loop per identity session. Consumes channel events until the
// session ends; a transport drop flips the state to Connecting and asks
// the connector (which owns retry policy) for a fresh channel.
async fn routing_loop(mut channel: Box<dyn EventChannel>, context: SessionContext) {
    loop {
        let event = channel.recv().await;

        // The session this loop was spawned for may be over
        if context.identity.lock().await.epoch() != context.epoch {
            debug!("Routing loop for epoch {} ending: identity changed", context.epoch);
            return;
        }

        match event {
            Some(ChannelEvent::Message(wire)) => {
                let me = context.identity_id.as_str();
                if wire.sender_id != me && wire.receiver_id != me {
                    debug!("Message {} not addressed to this identity; dropped", wire.id);
                    continue;
                }
                let changed = context.conversations.lock().await.apply_incoming(wire);
                if changed.is_some() {
                    context.directory.lock().await.mark_dirty();
                }
            }
            Some(ChannelEvent::Presence(ids)) => {
                let changed = context.presence.lock().await.apply_snapshot(ids);
                if changed {
                    context.directory.lock().await.mark_dirty();
                }
            }
            Some(ChannelEvent::Closed) | None => {
                // Transient drop: keep all higher-level state. History
                // refetch plus a fresh presence snapshot reconcile it
                // after reconnect.
                *context.state.lock().unwrap() = EngineState::Connecting;
                warn!("Event channel lost; reconnecting");
                match context.connector.connect(&context.identity_id).await {
                    Ok(fresh) => {
                        if context.identity.lock().await.epoch() != context.epoch {
                            return;
                        }
                        channel = fresh;
                        *context.state.lock().unwrap() = EngineState::Connected;
                        info!("Event channel reconnected");
                    }
                    Err(e) => {
                        error!("Channel reconnect failed: {}", e);
                        *context.state.lock().unwrap() = EngineState::Disconnected;
                        return;
                    }
                }
            }
        }
    }
}
