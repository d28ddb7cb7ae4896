// Contact directory for palaver
// The sidebar's view of the world: every known contact annotated with
// presence and its most recent message, ordered for display.

use log::debug;
use std::cmp::Ordering;

use crate::models::{Contact, DirectoryEntry};
use crate::sync::conversation::ConversationStore;
use crate::sync::presence::PresenceTracker;

/// Known contacts plus their derived annotations.
///
/// Presence and conversation-tail changes only mark the projection dirty;
/// the sorted entry list is rebuilt lazily on the next read. A burst of N
/// messages therefore costs one recomputation, not N.
pub struct ContactDirectory {
    contacts: Vec<Contact>,
    entries: Vec<DirectoryEntry>,
    dirty: bool,
}

impl ContactDirectory {
    pub fn new() -> Self {
        ContactDirectory {
            contacts: Vec::new(),
            entries: Vec::new(),
            dirty: false,
        }
    }

    /// Install the fetched contact list.
    pub fn set_contacts(&mut self, contacts: Vec<Contact>) {
        debug!("Directory holds {} contacts", contacts.len());
        self.contacts = contacts;
        self.dirty = true;
    }

    /// Note that presence or some conversation tail changed. O(1).
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear(&mut self) {
        self.contacts.clear();
        self.entries.clear();
        self.dirty = false;
    }

    /// The display-ordered directory: contacts with conversations first,
    /// newest activity on top; contacts without any messages after them,
    /// ordered by name.
    pub fn list(
        &mut self,
        presence: &PresenceTracker,
        conversations: &ConversationStore,
    ) -> &[DirectoryEntry] {
        self.ensure_fresh(presence, conversations);
        &self.entries
    }

    /// Case-insensitive substring match on display names. Does not mutate
    /// the underlying order.
    pub fn search(
        &mut self,
        term: &str,
        presence: &PresenceTracker,
        conversations: &ConversationStore,
    ) -> Vec<DirectoryEntry> {
        self.ensure_fresh(presence, conversations);
        let needle = term.to_lowercase();
        self.entries
            .iter()
            .filter(|entry| entry.contact.display_name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    fn ensure_fresh(&mut self, presence: &PresenceTracker, conversations: &ConversationStore) {
        if !self.dirty {
            return;
        }

        let mut entries: Vec<DirectoryEntry> = self
            .contacts
            .iter()
            .map(|contact| {
                let tail = conversations.tail(&contact.id);
                DirectoryEntry {
                    is_online: presence.is_online(&contact.id),
                    last_message_preview: tail.map(|m| m.preview()),
                    last_message_at: tail.map(|m| m.created_at),
                    contact: contact.clone(),
                }
            })
            .collect();

        entries.sort_by(|a, b| match (a.last_message_at, b.last_message_at) {
            (Some(a_at), Some(b_at)) => b_at.cmp(&a_at),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a
                .contact
                .display_name
                .to_lowercase()
                .cmp(&b.contact.display_name.to_lowercase()),
        });

        self.entries = entries;
        self.dirty = false;
    }
}

impl Default for ContactDirectory {
    fn default() -> Self {
        Self::new()
    }
}
