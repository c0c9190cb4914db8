//! Recording notifier and in-memory asset store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use async_trait::async_trait;
use boxoffice_core::ports::{AssetError, AssetStore, Notification, Notifier, NotifyError, Upload};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Notifier that keeps every delivered notification
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    attempts: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl RecordingNotifier {
    /// Create a notifier that accepts everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every notification until reset
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delivered notifications, in order
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    /// Templates of delivered notifications, in order
    #[must_use]
    pub fn templates(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|notification| notification.template)
            .collect()
    }

    /// Calls to `notify`, delivered or not
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError("mail relay unavailable".into()));
        }
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}

/// Asset store that keeps uploads in memory and returns `memory://` URLs
#[derive(Debug, Clone, Default)]
pub struct InMemoryAssetStore {
    uploads: Arc<Mutex<Vec<Upload>>>,
    failures_left: Arc<AtomicUsize>,
}

impl InMemoryAssetStore {
    /// Create an empty asset store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` uploads with `Unavailable`
    pub fn fail_times(&self, times: usize) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    /// Stored uploads, in order
    #[must_use]
    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn store(&self, upload: &Upload) -> Result<String, AssetError> {
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AssetError::Unavailable("connection refused".into()));
        }
        if upload.bytes.is_empty() {
            return Err(AssetError::Rejected("empty file".into()));
        }

        let mut uploads = self.uploads.lock().unwrap();
        uploads.push(upload.clone());
        Ok(format!("memory://assets/{}/{}", uploads.len(), upload.file_name))
    }
}
