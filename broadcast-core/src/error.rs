//! Error types for the broadcast engine

use std::path::PathBuf;

use crate::types::{ItemRef, SiteId};

/// Result type for broadcast operations
pub type Result<T> = std::result::Result<T, BroadcastError>;

/// Errors that can occur while propagating or cascading content
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("Item not found: {0}")]
    NotFound(ItemRef),

    #[error("Site not found: {0}")]
    SiteNotFound(SiteId),

    #[error("Attachment source {path:?} is unreadable: {reason}")]
    AttachmentSource { path: PathBuf, reason: String },

    #[error("Item creation rejected on site {site}: {reason}")]
    ItemCreation { site: SiteId, reason: String },

    #[error("Item {0} is a linked child and cannot be broadcast")]
    LinkedChild(ItemRef),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Registry encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for BroadcastError {
    fn from(e: toml::de::Error) -> Self {
        BroadcastError::Config(e.to_string())
    }
}

impl From<regex::Error> for BroadcastError {
    fn from(e: regex::Error) -> Self {
        BroadcastError::Config(format!("bad pattern: {}", e))
    }
}
