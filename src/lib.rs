// Re-export needed modules for testing
pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod sync;

// Re-export main types for convenience
pub use error::SyncError;
pub use models::*;
pub use sync::SyncEngine;
