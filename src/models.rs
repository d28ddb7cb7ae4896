use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// The authenticated local user. Exists only while a session is live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "fullName")]
    pub display_name: String,
    #[serde(rename = "profilePic", default, deserialize_with = "empty_string_as_none")]
    pub avatar_url: Option<String>,
}

/// A peer the current identity may message. Immutable once fetched;
/// presence and last-message annotations live on DirectoryEntry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "fullName")]
    pub display_name: String,
    #[serde(rename = "profilePic", default, deserialize_with = "empty_string_as_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending, // Locally originated, awaiting server acknowledgment
    Sent,    // Accepted by the server (all history/push messages ingest as Sent)
    Failed,  // Send request failed; entry stays visible for retry
}

/// A message as it travels over the wire (history fetch, push event,
/// send acknowledgment). No local bookkeeping fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "senderId")]
    pub sender_id: String,
    #[serde(rename = "receiverId")]
    pub receiver_id: String,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub image: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// One entry in a conversation log.
///
/// `local_key` is the stable UI identity of the entry; it is minted at
/// optimistic send time, or on ingest for server-originated messages.
/// `server_id` is the merge key once the server has accepted the message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub local_key: String,
    pub server_id: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: Option<String>,
    pub image_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
}

impl Message {
    /// Ingest a server-originated message. Mints a fresh local key.
    pub fn from_wire(wire: WireMessage) -> Self {
        Message {
            local_key: Uuid::new_v4().to_string(),
            server_id: Some(wire.id),
            sender_id: wire.sender_id,
            receiver_id: wire.receiver_id,
            text: wire.text,
            image_ref: wire.image,
            created_at: wire.created_at,
            delivery_state: DeliveryState::Sent,
        }
    }

    /// Short text stand-in for list previews.
    pub fn preview(&self) -> String {
        match &self.text {
            Some(text) => text.clone(),
            None => "[image]".to_string(),
        }
    }
}

/// Outgoing message content. At least one of text/image must be present.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SendPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl SendPayload {
    pub fn text(text: &str) -> Self {
        SendPayload {
            text: Some(text.to_string()),
            image: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, str::is_empty) && self.image.is_none()
    }
}

/// Read-only projection for the contact list: contact plus its presence
/// flag and most-recent-message summary.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub contact: Contact,
    pub is_online: bool,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

// The original server sends "" where a field is absent.
fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}
