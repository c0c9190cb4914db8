//! In-memory relational store.
//!
//! [`InMemoryStore`] keeps every table in one struct behind a
//! `tokio::sync::Mutex`. A unit of work holds the owned guard for its whole
//! lifetime and mutates a working copy; `commit` writes the copy back and
//! dropping the unit discards it. Units are therefore fully serialised,
//! which gives the same outcomes as conditional updates under row locks.
//!
//! Jobs enqueued through a unit are buffered and handed to the attached
//! [`InMemoryJobQueue`] on commit, so they never outlive a rolled-back unit.

#![allow(clippy::missing_panics_doc)]

use crate::queue::InMemoryJobQueue;
use async_trait::async_trait;
use boxoffice_core::jobs::{JobQueue, JobRequest};
use boxoffice_core::store::{StatusChange, StoreError, TransactionStore, UnitOfWork};
use boxoffice_core::types::{
    EventId, EventOwnership, Money, OrganizerId, PointBalance, ReferralCoupon, Ticket, TicketId,
    Transaction, TransactionDetail, TransactionId, TransactionStatus, UserContact, UserId,
    Voucher,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Debug, Default)]
struct Tables {
    events: HashMap<EventId, EventOwnership>,
    users: HashMap<UserId, UserContact>,
    tickets: HashMap<TicketId, Ticket>,
    coupons: HashMap<String, ReferralCoupon>,
    vouchers: HashMap<String, Voucher>,
    points: HashMap<UserId, PointBalance>,
    transactions: HashMap<TransactionId, Transaction>,
    details: HashMap<TransactionId, Vec<TransactionDetail>>,
}

impl Tables {
    fn owners_of(&self, uuid: TransactionId) -> Vec<OrganizerId> {
        self.events_of(uuid)
            .into_iter()
            .map(|event| event.organizer_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn events_of(&self, uuid: TransactionId) -> Vec<EventOwnership> {
        let event_ids: BTreeSet<EventId> = self
            .details
            .get(&uuid)
            .into_iter()
            .flatten()
            .filter_map(|detail| self.tickets.get(&detail.ticket_id))
            .map(|ticket| ticket.event_id)
            .collect();
        event_ids
            .into_iter()
            .filter_map(|id| self.events.get(&id).cloned())
            .collect()
    }

    fn newest_first(mut transactions: Vec<Transaction>) -> Vec<Transaction> {
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        transactions
    }
}

/// In-memory [`TransactionStore`] for tests
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    fail_commits: Arc<AtomicBool>,
    commits: Arc<AtomicUsize>,
    jobs: Arc<OnceLock<InMemoryJobQueue>>,
}

impl InMemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver jobs enqueued by units to `queue` when they commit.
    ///
    /// Only the first attached queue is kept.
    pub fn attach_queue(&self, queue: InMemoryJobQueue) {
        let _ = self.jobs.set(queue);
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    /// Insert or replace an event
    pub async fn add_event(&self, event: EventOwnership) {
        self.tables.lock().await.events.insert(event.event_id, event);
    }

    /// Insert or replace a user
    pub async fn add_user(&self, user: UserContact) {
        self.tables.lock().await.users.insert(user.user_id, user);
    }

    /// Insert or replace a ticket
    pub async fn add_ticket(&self, ticket: Ticket) {
        self.tables.lock().await.tickets.insert(ticket.id, ticket);
    }

    /// Insert or replace a referral coupon
    pub async fn add_coupon(&self, coupon: ReferralCoupon) {
        self.tables
            .lock()
            .await
            .coupons
            .insert(coupon.code.clone(), coupon);
    }

    /// Insert or replace a voucher
    pub async fn add_voucher(&self, voucher: Voucher) {
        self.tables
            .lock()
            .await
            .vouchers
            .insert(voucher.code.clone(), voucher);
    }

    /// Insert or replace a point balance
    pub async fn add_points(&self, balance: PointBalance) {
        self.tables
            .lock()
            .await
            .points
            .insert(balance.user_id, balance);
    }

    /// Insert a transaction directly, bypassing the lifecycle
    pub async fn add_transaction(&self, transaction: Transaction, details: Vec<TransactionDetail>) {
        let mut tables = self.tables.lock().await;
        tables.details.insert(transaction.uuid, details);
        tables.transactions.insert(transaction.uuid, transaction);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Units left for a ticket
    pub async fn remaining(&self, id: TicketId) -> Option<u32> {
        self.tables
            .lock()
            .await
            .tickets
            .get(&id)
            .map(|ticket| ticket.remaining_qty)
    }

    /// Current state of a coupon
    pub async fn coupon(&self, code: &str) -> Option<ReferralCoupon> {
        self.tables.lock().await.coupons.get(code).cloned()
    }

    /// Current state of a voucher
    pub async fn voucher(&self, code: &str) -> Option<Voucher> {
        self.tables.lock().await.vouchers.get(code).cloned()
    }

    /// Current point balance of a user
    pub async fn points(&self, user_id: UserId) -> Option<Money> {
        self.tables
            .lock()
            .await
            .points
            .get(&user_id)
            .map(|balance| balance.amount)
    }

    /// Current state of a transaction
    pub async fn transaction(&self, uuid: TransactionId) -> Option<Transaction> {
        self.tables.lock().await.transactions.get(&uuid).cloned()
    }

    /// Number of stored transactions
    pub async fn transaction_count(&self) -> usize {
        self.tables.lock().await.transactions.len()
    }

    /// Number of successful commits
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------

    /// Make every subsequent commit fail (and roll back) until reset
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryUnit {
            guard,
            working,
            fail_commit: Arc::clone(&self.fail_commits),
            commits: Arc::clone(&self.commits),
            queue: self.jobs.get().cloned(),
            pending_jobs: Vec::new(),
        }))
    }

    async fn get_transaction(
        &self,
        uuid: TransactionId,
    ) -> Result<Option<(Transaction, Vec<TransactionDetail>)>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.transactions.get(&uuid).map(|transaction| {
            let details = tables.details.get(&uuid).cloned().unwrap_or_default();
            (transaction.clone(), details)
        }))
    }

    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Transaction>, StoreError> {
        let tables = self.tables.lock().await;
        let mine = tables
            .transactions
            .values()
            .filter(|transaction| transaction.user_id == user_id)
            .cloned()
            .collect();
        Ok(Tables::newest_first(mine))
    }

    async fn list_by_organizer(
        &self,
        organizer_id: OrganizerId,
    ) -> Result<Vec<Transaction>, StoreError> {
        let tables = self.tables.lock().await;
        let touching = tables
            .transactions
            .values()
            .filter(|transaction| tables.owners_of(transaction.uuid).contains(&organizer_id))
            .cloned()
            .collect();
        Ok(Tables::newest_first(touching))
    }

    async fn organizer_revenue(&self, organizer_id: OrganizerId) -> Result<Money, StoreError> {
        let tables = self.tables.lock().await;
        tables
            .transactions
            .values()
            .filter(|transaction| transaction.status == TransactionStatus::Done)
            .filter(|transaction| tables.owners_of(transaction.uuid).contains(&organizer_id))
            .try_fold(Money::ZERO, |sum, transaction| {
                sum.checked_add(transaction.total_amount)
            })
            .ok_or_else(|| StoreError::Corrupt("revenue overflows".into()))
    }

    async fn user_contact(&self, user_id: UserId) -> Result<Option<UserContact>, StoreError> {
        Ok(self.tables.lock().await.users.get(&user_id).cloned())
    }

    async fn transaction_events(
        &self,
        uuid: TransactionId,
    ) -> Result<Vec<EventOwnership>, StoreError> {
        Ok(self.tables.lock().await.events_of(uuid))
    }
}

struct InMemoryUnit {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
    fail_commit: Arc<AtomicBool>,
    commits: Arc<AtomicUsize>,
    queue: Option<InMemoryJobQueue>,
    pending_jobs: Vec<JobRequest>,
}

impl InMemoryUnit {
    /// Hand buffered jobs to the queue, withdrawing the ones this unit
    /// created if any of them is refused.
    async fn flush_jobs(&mut self) -> Result<(), StoreError> {
        let Some(queue) = self.queue.clone() else {
            return Ok(());
        };

        let mut created = Vec::new();
        for request in std::mem::take(&mut self.pending_jobs) {
            let key = request.key();
            let fresh = queue.find(key).is_none();
            match queue.schedule(request).await {
                Ok(_) if fresh => created.push(key),
                Ok(_) => {},
                Err(e) => {
                    for key in created {
                        let _ = queue.cancel(key).await;
                    }
                    return Err(StoreError::Database(e.to_string()));
                },
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnit {
    async fn find_ticket(&mut self, id: TicketId) -> Result<Option<Ticket>, StoreError> {
        Ok(self.working.tickets.get(&id).cloned())
    }

    async fn reserve_stock(&mut self, id: TicketId, qty: u32) -> Result<bool, StoreError> {
        match self.working.tickets.get_mut(&id) {
            Some(ticket) if ticket.remaining_qty >= qty => {
                ticket.remaining_qty -= qty;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn release_stock(&mut self, id: TicketId, qty: u32) -> Result<(), StoreError> {
        if let Some(ticket) = self.working.tickets.get_mut(&id) {
            ticket.remaining_qty = ticket.remaining_qty.saturating_add(qty);
        }
        Ok(())
    }

    async fn find_coupon(&mut self, code: &str) -> Result<Option<ReferralCoupon>, StoreError> {
        Ok(self.working.coupons.get(code).cloned())
    }

    async fn claim_coupon(&mut self, code: &str) -> Result<bool, StoreError> {
        match self.working.coupons.get_mut(code) {
            Some(coupon) if !coupon.is_claimed => {
                coupon.is_claimed = true;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn unclaim_coupon(&mut self, code: &str) -> Result<(), StoreError> {
        if let Some(coupon) = self.working.coupons.get_mut(code) {
            coupon.is_claimed = false;
        }
        Ok(())
    }

    async fn find_voucher(&mut self, code: &str) -> Result<Option<Voucher>, StoreError> {
        Ok(self.working.vouchers.get(code).cloned())
    }

    async fn voucher_used_by(
        &mut self,
        code: &str,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<bool, StoreError> {
        Ok(self.working.transactions.values().any(|transaction| {
            transaction.user_id == user_id
                && transaction.event_id == event_id
                && transaction.voucher_used.as_deref() == Some(code)
                && transaction.compensated_at.is_none()
        }))
    }

    async fn take_voucher(&mut self, code: &str) -> Result<bool, StoreError> {
        match self.working.vouchers.get_mut(code) {
            Some(voucher) if voucher.remaining_qty > 0 => {
                voucher.remaining_qty -= 1;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn restore_voucher(&mut self, code: &str) -> Result<(), StoreError> {
        if let Some(voucher) = self.working.vouchers.get_mut(code) {
            voucher.remaining_qty = voucher.remaining_qty.saturating_add(1);
        }
        Ok(())
    }

    async fn find_points(&mut self, user_id: UserId) -> Result<Option<PointBalance>, StoreError> {
        Ok(self.working.points.get(&user_id).cloned())
    }

    async fn debit_points(&mut self, user_id: UserId, amount: Money) -> Result<bool, StoreError> {
        match self.working.points.get_mut(&user_id) {
            Some(balance) if balance.amount >= amount => {
                balance.amount = balance.amount.floored_sub(amount);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn credit_points(&mut self, user_id: UserId, amount: Money) -> Result<(), StoreError> {
        let balance = self
            .working
            .points
            .entry(user_id)
            .or_insert_with(|| PointBalance {
                user_id,
                amount: Money::ZERO,
                expires_at: None,
            });
        balance.amount = balance
            .amount
            .checked_add(amount)
            .ok_or_else(|| StoreError::Corrupt("point balance overflows".into()))?;
        Ok(())
    }

    async fn insert_transaction(
        &mut self,
        transaction: &Transaction,
        details: &[TransactionDetail],
    ) -> Result<(), StoreError> {
        if self.working.transactions.contains_key(&transaction.uuid) {
            return Err(StoreError::Duplicate(transaction.uuid.to_string()));
        }
        self.working
            .transactions
            .insert(transaction.uuid, transaction.clone());
        self.working
            .details
            .insert(transaction.uuid, details.to_vec());
        Ok(())
    }

    async fn find_transaction(
        &mut self,
        uuid: TransactionId,
    ) -> Result<Option<Transaction>, StoreError> {
        Ok(self.working.transactions.get(&uuid).cloned())
    }

    async fn find_details(
        &mut self,
        uuid: TransactionId,
    ) -> Result<Vec<TransactionDetail>, StoreError> {
        Ok(self.working.details.get(&uuid).cloned().unwrap_or_default())
    }

    async fn transition_status(&mut self, change: &StatusChange) -> Result<bool, StoreError> {
        match self.working.transactions.get_mut(&change.uuid) {
            Some(transaction) if transaction.status == change.from => {
                transaction.status = change.to;
                transaction.updated_at = change.at;
                if let Some(proof) = &change.payment_proof {
                    transaction.payment_proof = Some(proof.clone());
                }
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn mark_compensated(
        &mut self,
        uuid: TransactionId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        match self.working.transactions.get_mut(&uuid) {
            Some(transaction) if transaction.compensated_at.is_none() => {
                transaction.compensated_at = Some(at);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn event_owners(&mut self, uuid: TransactionId) -> Result<Vec<OrganizerId>, StoreError> {
        Ok(self.working.owners_of(uuid))
    }

    async fn enqueue_job(&mut self, request: &JobRequest) -> Result<(), StoreError> {
        if self.queue.is_none() {
            return Err(StoreError::Database("no job queue attached".into()));
        }
        self.pending_jobs.push(request.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(StoreError::Database("injected commit failure".into()));
        }
        self.flush_jobs().await?;
        let working = std::mem::take(&mut self.working);
        *self.guard = working;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ticket(qty: u32) -> Ticket {
        Ticket {
            id: TicketId::new(1),
            event_id: EventId::new(1),
            price: Money::new(100),
            remaining_qty: qty,
        }
    }

    #[tokio::test]
    async fn dropped_unit_rolls_back() {
        let store = InMemoryStore::new();
        store.add_ticket(ticket(3)).await;

        {
            let mut uow = store.begin().await.unwrap();
            assert!(uow.reserve_stock(TicketId::new(1), 2).await.unwrap());
        }

        assert_eq!(store.remaining(TicketId::new(1)).await, Some(3));
    }

    #[tokio::test]
    async fn committed_unit_persists() {
        let store = InMemoryStore::new();
        store.add_ticket(ticket(3)).await;

        let mut uow = store.begin().await.unwrap();
        assert!(uow.reserve_stock(TicketId::new(1), 3).await.unwrap());
        assert!(!uow.reserve_stock(TicketId::new(1), 1).await.unwrap());
        uow.commit().await.unwrap();

        assert_eq!(store.remaining(TicketId::new(1)).await, Some(0));
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn failed_commit_discards_changes() {
        let store = InMemoryStore::new();
        store.add_ticket(ticket(3)).await;
        store.fail_commits(true);

        let mut uow = store.begin().await.unwrap();
        uow.reserve_stock(TicketId::new(1), 1).await.unwrap();
        assert!(uow.commit().await.is_err());

        assert_eq!(store.remaining(TicketId::new(1)).await, Some(3));
    }

    fn expiry_job(uuid: TransactionId) -> JobRequest {
        JobRequest {
            kind: boxoffice_core::jobs::JobKind::ExpireTransaction,
            payload: boxoffice_core::jobs::JobPayload { uuid },
            run_at: Utc::now(),
            max_attempts: 3,
            backoff: std::time::Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn enqueued_jobs_follow_the_unit() {
        let store = InMemoryStore::new();
        let queue = InMemoryJobQueue::new();
        store.attach_queue(queue.clone());

        {
            let mut uow = store.begin().await.unwrap();
            uow.enqueue_job(&expiry_job(TransactionId::new())).await.unwrap();
            assert!(queue.is_empty());
        }
        assert!(queue.is_empty());

        let uuid = TransactionId::new();
        let mut uow = store.begin().await.unwrap();
        uow.enqueue_job(&expiry_job(uuid)).await.unwrap();
        uow.commit().await.unwrap();

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.jobs()[0].payload.uuid, uuid);
    }

    #[tokio::test]
    async fn refused_job_discards_the_unit() {
        let store = InMemoryStore::new();
        let queue = InMemoryJobQueue::new();
        store.attach_queue(queue.clone());
        store.add_ticket(ticket(3)).await;
        queue.fail_schedule_after(1);

        let mut uow = store.begin().await.unwrap();
        uow.reserve_stock(TicketId::new(1), 2).await.unwrap();
        uow.enqueue_job(&expiry_job(TransactionId::new())).await.unwrap();
        uow.enqueue_job(&expiry_job(TransactionId::new())).await.unwrap();
        assert!(uow.commit().await.is_err());

        assert_eq!(store.remaining(TicketId::new(1)).await, Some(3));
        assert!(queue.is_empty());
        assert_eq!(queue.cancelled().len(), 1);
    }

    #[tokio::test]
    async fn enqueue_without_a_queue_fails() {
        let store = InMemoryStore::new();
        let mut uow = store.begin().await.unwrap();

        assert!(uow.enqueue_job(&expiry_job(TransactionId::new())).await.is_err());
    }
}
