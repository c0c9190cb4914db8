//! Job handlers and their registry.
//!
//! Delivery is at-least-once: every handler must be safe to run again for a
//! job that already succeeded. The lifecycle's deadline operations re-check
//! the transaction's status, which makes redelivery a no-op.

use crate::lifecycle::{TimerOutcome, TransactionLifecycle};
use async_trait::async_trait;
use boxoffice_core::EngineError;
use boxoffice_core::jobs::{JobKind, ScheduledJob};
use std::collections::HashMap;
use std::sync::Arc;

/// Runs one kind of job
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Kind this handler is registered for
    fn kind(&self) -> JobKind;

    /// Execute `job`. An error makes the worker retry it.
    async fn handle(&self, job: &ScheduledJob) -> Result<TimerOutcome, EngineError>;
}

/// `expire-transaction`: payment deadline
pub struct ExpireTransactionHandler {
    lifecycle: Arc<TransactionLifecycle>,
}

impl ExpireTransactionHandler {
    /// Creates a new `ExpireTransactionHandler`
    #[must_use]
    pub const fn new(lifecycle: Arc<TransactionLifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl JobHandler for ExpireTransactionHandler {
    fn kind(&self) -> JobKind {
        JobKind::ExpireTransaction
    }

    async fn handle(&self, job: &ScheduledJob) -> Result<TimerOutcome, EngineError> {
        self.lifecycle.expire(job.payload.uuid).await
    }
}

/// `organization-response`: organizer response deadline
pub struct OrganizationResponseHandler {
    lifecycle: Arc<TransactionLifecycle>,
}

impl OrganizationResponseHandler {
    /// Creates a new `OrganizationResponseHandler`
    #[must_use]
    pub const fn new(lifecycle: Arc<TransactionLifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl JobHandler for OrganizationResponseHandler {
    fn kind(&self) -> JobKind {
        JobKind::OrganizationResponse
    }

    async fn handle(&self, job: &ScheduledJob) -> Result<TimerOutcome, EngineError> {
        self.lifecycle.cancel_unanswered(job.payload.uuid).await
    }
}

/// `organizer-followup`: reminder after acceptance
pub struct OrganizerFollowupHandler {
    lifecycle: Arc<TransactionLifecycle>,
}

impl OrganizerFollowupHandler {
    /// Creates a new `OrganizerFollowupHandler`
    #[must_use]
    pub const fn new(lifecycle: Arc<TransactionLifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl JobHandler for OrganizerFollowupHandler {
    fn kind(&self) -> JobKind {
        JobKind::OrganizerFollowup
    }

    async fn handle(&self, job: &ScheduledJob) -> Result<TimerOutcome, EngineError> {
        self.lifecycle.send_followup(job.payload.uuid).await
    }
}

/// Handlers keyed by [`JobKind`]
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// An empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the lifecycle's three handlers
    #[must_use]
    pub fn for_lifecycle(lifecycle: &Arc<TransactionLifecycle>) -> Self {
        Self::new()
            .with(Arc::new(ExpireTransactionHandler::new(Arc::clone(lifecycle))))
            .with(Arc::new(OrganizationResponseHandler::new(Arc::clone(
                lifecycle,
            ))))
            .with(Arc::new(OrganizerFollowupHandler::new(Arc::clone(lifecycle))))
    }

    /// Register `handler`, replacing any handler of the same kind
    #[must_use]
    pub fn with(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Register `handler`, replacing any handler of the same kind
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Handler for `kind`
    #[must_use]
    pub fn get(&self, kind: JobKind) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&kind)
    }

    /// Registered kinds
    pub fn kinds(&self) -> impl Iterator<Item = JobKind> + '_ {
        self.handlers.keys().copied()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}
