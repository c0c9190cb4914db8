//! Persistence ports.
//!
//! The engine talks to the relational store through two traits:
//!
//! - [`TransactionStore`]: entry point; opens units of work and serves
//!   read-only queries.
//! - [`UnitOfWork`]: one atomic unit. Every mutation is a conditional update
//!   that reports whether it applied. Dropping a unit without calling
//!   [`UnitOfWork::commit`] rolls everything back.
//!
//! # Conditional updates
//!
//! Implementations must express each `bool`-returning mutation as a single
//! guarded statement, never as a read followed by a write:
//!
//! ```text
//! reserve_stock:  UPDATE tickets SET remaining_qty = remaining_qty - $n
//!                 WHERE id = $id AND remaining_qty >= $n
//! transition:     UPDATE transactions SET status = $to
//!                 WHERE uuid = $uuid AND status = $from
//! ```
//!
//! # Lock order
//!
//! Units that touch several rows take them in one global order: tickets by
//! ascending id, then the voucher, then the coupon, then the point balance.

use crate::jobs::JobRequest;
use crate::types::{
    EventId, EventOwnership, Money, OrganizerId, PointBalance, ReferralCoupon, Ticket, TicketId,
    Transaction, TransactionDetail, TransactionId, TransactionStatus, UserContact, UserId,
    Voucher,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from the persistence layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Stored data could not be mapped to a domain type
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Insert collided with an existing row
    #[error("Duplicate key: {0}")]
    Duplicate(String),
}

/// A compare-and-swap on a transaction's status
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    /// Transaction to update
    pub uuid: TransactionId,
    /// Status the row must currently have
    pub from: TransactionStatus,
    /// Status to write
    pub to: TransactionStatus,
    /// Proof reference to write alongside (proof submission only)
    pub payment_proof: Option<String>,
    /// Timestamp for `updated_at`
    pub at: DateTime<Utc>,
}

/// One atomic unit of work against the relational store.
///
/// All methods take `&mut self` so a unit is used by one task at a time.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Load a ticket
    async fn find_ticket(&mut self, id: TicketId) -> Result<Option<Ticket>, StoreError>;

    /// Decrement stock by `qty` iff at least `qty` remain. Returns whether it applied.
    async fn reserve_stock(&mut self, id: TicketId, qty: u32) -> Result<bool, StoreError>;

    /// Increment stock by `qty`
    async fn release_stock(&mut self, id: TicketId, qty: u32) -> Result<(), StoreError>;

    /// Load a referral coupon
    async fn find_coupon(&mut self, code: &str) -> Result<Option<ReferralCoupon>, StoreError>;

    /// Mark a coupon claimed iff it is currently unclaimed
    async fn claim_coupon(&mut self, code: &str) -> Result<bool, StoreError>;

    /// Mark a coupon unclaimed
    async fn unclaim_coupon(&mut self, code: &str) -> Result<(), StoreError>;

    /// Load a voucher and lock it until the unit ends.
    ///
    /// The lock serializes per-buyer reuse checks on the same code.
    async fn find_voucher(&mut self, code: &str) -> Result<Option<Voucher>, StoreError>;

    /// Whether `user_id` holds a non-compensated transaction for `event_id`
    /// that used voucher `code`
    async fn voucher_used_by(
        &mut self,
        code: &str,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<bool, StoreError>;

    /// Decrement a voucher's quota by one iff it is positive
    async fn take_voucher(&mut self, code: &str) -> Result<bool, StoreError>;

    /// Increment a voucher's quota by one
    async fn restore_voucher(&mut self, code: &str) -> Result<(), StoreError>;

    /// Load a user's point balance
    async fn find_points(&mut self, user_id: UserId) -> Result<Option<PointBalance>, StoreError>;

    /// Debit `amount` points iff the balance covers it
    async fn debit_points(&mut self, user_id: UserId, amount: Money) -> Result<bool, StoreError>;

    /// Credit `amount` points, leaving the balance's expiry unchanged
    async fn credit_points(&mut self, user_id: UserId, amount: Money) -> Result<(), StoreError>;

    /// Insert a new transaction and its lines
    async fn insert_transaction(
        &mut self,
        transaction: &Transaction,
        details: &[TransactionDetail],
    ) -> Result<(), StoreError>;

    /// Load a transaction
    async fn find_transaction(
        &mut self,
        uuid: TransactionId,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Load a transaction's lines
    async fn find_details(
        &mut self,
        uuid: TransactionId,
    ) -> Result<Vec<TransactionDetail>, StoreError>;

    /// Apply `change` iff the row still has `change.from`
    async fn transition_status(&mut self, change: &StatusChange) -> Result<bool, StoreError>;

    /// Set the compensation marker iff it is not set yet
    async fn mark_compensated(
        &mut self,
        uuid: TransactionId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Distinct owners of the events referenced by a transaction's lines
    async fn event_owners(&mut self, uuid: TransactionId) -> Result<Vec<OrganizerId>, StoreError>;

    /// Enqueue a delayed job that becomes visible when this unit commits.
    ///
    /// A job whose (kind, transaction) key is already queued is left alone.
    async fn enqueue_job(&mut self, request: &JobRequest) -> Result<(), StoreError>;

    /// Make every change of this unit durable
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Entry point to the relational store
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Open a new atomic unit of work
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    /// Load a transaction with its lines
    async fn get_transaction(
        &self,
        uuid: TransactionId,
    ) -> Result<Option<(Transaction, Vec<TransactionDetail>)>, StoreError>;

    /// A buyer's transactions, newest first
    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Transaction>, StoreError>;

    /// Transactions touching any event the organizer owns, newest first
    async fn list_by_organizer(
        &self,
        organizer_id: OrganizerId,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Σ total of the organizer's `DONE` transactions
    async fn organizer_revenue(&self, organizer_id: OrganizerId) -> Result<Money, StoreError>;

    /// Notification recipient for a buyer
    async fn user_contact(&self, user_id: UserId) -> Result<Option<UserContact>, StoreError>;

    /// Events referenced by a transaction's lines
    async fn transaction_events(
        &self,
        uuid: TransactionId,
    ) -> Result<Vec<EventOwnership>, StoreError>;
}
