use thiserror::Error;

/// Errors surfaced by the synchronization engine and its REST collaborator.
///
/// Stale results and duplicate events are not represented here: both are
/// absorbed silently by the stores.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A history, send, or directory request failed to complete.
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The session cookie is missing or expired (HTTP 401).
    #[error("session is not authenticated")]
    Unauthenticated,

    /// The server rejected the request with an application error body.
    #[error("server error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The event channel closed and could not be reopened.
    #[error("event channel closed")]
    ChannelClosed,

    /// An operation that needs a live session was issued without one.
    #[error("not connected: {0}")]
    NotConnected(&'static str),

    /// A send was issued with neither text nor an image.
    #[error("message payload is empty")]
    EmptyPayload,
}

pub type Result<T> = std::result::Result<T, SyncError>;
