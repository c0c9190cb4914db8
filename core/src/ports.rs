//! Outbound collaborator ports: notifier and asset store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A message for the notification service.
///
/// Rendering and delivery happen elsewhere; the engine only names the
/// template and supplies the data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Recipient address
    pub recipient: String,
    /// Subject line
    pub subject: String,
    /// Template identifier
    pub template: String,
    /// Template data
    pub payload: serde_json::Value,
}

/// Notification delivery failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Notification failed: {0}")]
pub struct NotifyError(pub String);

/// Fire-and-forget notification sink
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Hand a notification over for delivery
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// A binary upload, such as a photographed bank transfer receipt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upload {
    /// Original file name
    pub file_name: String,
    /// MIME type
    pub content_type: String,
    /// File contents
    pub bytes: Vec<u8>,
}

/// Errors from the asset store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssetError {
    /// The store refused the upload
    #[error("Upload rejected: {0}")]
    Rejected(String),

    /// The store could not be reached
    #[error("Asset store unavailable: {0}")]
    Unavailable(String),
}

/// Binary storage returning stable URL references
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Store `upload` and return its URL
    async fn store(&self, upload: &Upload) -> Result<String, AssetError>;
}
