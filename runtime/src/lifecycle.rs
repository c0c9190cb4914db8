//! Transaction lifecycle orchestration.
//!
//! [`TransactionLifecycle`] owns the public operations on orders and the
//! deadline handlers the job worker calls. Every operation runs in one unit
//! of work; status changes are compare-and-swap updates, so racing callers
//! (an organizer rejecting while the response timer fires) get exactly one
//! winner and the loser observes `InvalidState` or a skipped timer.
//!
//! Side effects that cannot roll back (timer cancellation and buyer
//! notifications) happen after commit and never fail the operation.

use crate::compensation::{CompensationEngine, CompensationReport};
use crate::config::LifecycleConfig;
use crate::discount::DiscountResolver;
use crate::inventory::InventoryLedger;
use crate::metrics::LifecycleMetrics;
use crate::notifier::{BuyerMessage, TracingNotifier};
use crate::retry::retry_with_backoff;
use crate::scheduler::DelayedJobScheduler;
use boxoffice_core::EngineError;
use boxoffice_core::environment::{Clock, SystemClock};
use boxoffice_core::jobs::{JobKind, JobQueue};
use boxoffice_core::ports::{AssetStore, Notifier, Upload};
use boxoffice_core::store::{StatusChange, TransactionStore, UnitOfWork};
use boxoffice_core::types::{
    Money, OrderRequest, OrganizerId, ResolveAction, Transaction, TransactionDetail,
    TransactionId, TransactionRecord, TransactionStatus, Transition, UserId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Result of a deadline or reminder handler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The handler changed state or sent its reminder
    Applied,
    /// The transaction had already moved on; nothing was done
    Skipped {
        /// Status observed
        status: TransactionStatus,
    },
    /// The transaction does not exist (the order rolled back)
    Missing,
}

/// An organizer's transactions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrganizerTransactions {
    /// Transactions touching the organizer's events, newest first
    pub transactions: Vec<Transaction>,
    /// Number of transactions
    pub count: usize,
}

/// Public operations on ticket orders
pub struct TransactionLifecycle {
    store: Arc<dyn TransactionStore>,
    scheduler: DelayedJobScheduler,
    notifier: Arc<dyn Notifier>,
    assets: Option<Arc<dyn AssetStore>>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
    inventory: InventoryLedger,
    discounts: DiscountResolver,
    compensation: CompensationEngine,
}

impl TransactionLifecycle {
    /// Start building a lifecycle over `store` and `queue`.
    #[must_use]
    pub fn builder(
        store: Arc<dyn TransactionStore>,
        queue: Arc<dyn JobQueue>,
    ) -> TransactionLifecycleBuilder {
        TransactionLifecycleBuilder {
            store,
            queue,
            notifier: None,
            assets: None,
            clock: None,
            config: None,
        }
    }

    /// Static configuration
    #[must_use]
    pub const fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Place an order.
    ///
    /// Reserves stock for every line, applies the order's discounts, persists
    /// the transaction as `WAITING_FOR_PAYMENT` and enqueues both deadlines
    /// in the same unit. Any failure rolls back every reservation,
    /// consumption and deadline.
    ///
    /// # Errors
    ///
    /// - Validation: `EmptyOrder`, `InvalidQuantity`, `TicketOutsideEvent`
    /// - `TicketNotFound`, `ResourceExhausted`
    /// - `CouponInvalid`, `VoucherInvalid`, `NoPointsAvailable`
    /// - `Store` / `Queue` on backend failure
    #[tracing::instrument(
        skip_all,
        fields(user_id = %request.user_id, event_id = %request.event_id)
    )]
    pub async fn create(&self, request: OrderRequest) -> Result<TransactionRecord, EngineError> {
        match self.place_order(&request).await {
            Ok(record) => {
                LifecycleMetrics::record_order_created();
                LifecycleMetrics::record_transition(TransactionStatus::WaitingForPayment);
                tracing::info!(
                    uuid = %record.transaction.uuid,
                    total = %record.transaction.total_amount,
                    lines = record.details.len(),
                    "Order created"
                );
                Ok(record)
            },
            Err(error) => {
                LifecycleMetrics::record_order_failed(error.code());
                tracing::info!(code = error.code(), %error, "Order rejected");
                Err(error)
            },
        }
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<TransactionRecord, EngineError> {
        if request.line_items.is_empty() {
            return Err(EngineError::EmptyOrder);
        }
        if let Some(item) = request.line_items.iter().find(|item| item.qty == 0) {
            return Err(EngineError::InvalidQuantity {
                ticket_id: item.ticket_id,
            });
        }

        let now = self.clock.now();
        let uuid = TransactionId::new();
        let mut uow = self.store.begin().await?;

        let mut subtotal = Money::ZERO;
        let mut details = Vec::with_capacity(request.line_items.len());
        for item in &request.line_items {
            let ticket = uow
                .find_ticket(item.ticket_id)
                .await?
                .ok_or(EngineError::TicketNotFound(item.ticket_id))?;
            if ticket.event_id != request.event_id {
                return Err(EngineError::TicketOutsideEvent {
                    ticket_id: ticket.id,
                    event_id: request.event_id,
                });
            }

            subtotal = ticket
                .price
                .checked_mul(item.qty)
                .and_then(|line| subtotal.checked_add(line))
                .ok_or_else(|| EngineError::Invariant("order subtotal overflows".into()))?;
            details.push(TransactionDetail {
                transaction_uuid: uuid,
                ticket_id: ticket.id,
                qty: item.qty,
            });
        }

        // Ticket rows are locked in id order whatever order the buyer listed them
        let mut reservations: Vec<&TransactionDetail> = details.iter().collect();
        reservations.sort_by_key(|detail| detail.ticket_id);
        for detail in reservations {
            self.inventory
                .reserve(&mut *uow, detail.ticket_id, detail.qty)
                .await?;
        }

        let quote = self.discounts.quote(&mut *uow, request, now).await?;
        let breakdown = self
            .discounts
            .apply(&mut *uow, request.user_id, &quote, subtotal)
            .await?;

        let transaction = Transaction {
            uuid,
            user_id: request.user_id,
            event_id: request.event_id,
            subtotal: breakdown.subtotal,
            voucher_discount: breakdown.voucher,
            coupon_discount: breakdown.coupon,
            total_amount: breakdown.payable,
            status: TransactionStatus::WaitingForPayment,
            referral_coupon_used: quote.coupon.map(|(code, _)| code),
            voucher_used: quote.voucher.map(|(code, _)| code),
            use_points: request.use_points,
            points_used: breakdown.points,
            payment_proof: None,
            created_at: now,
            updated_at: now,
            compensated_at: None,
        };
        uow.insert_transaction(&transaction, &details).await?;

        for (kind, delay) in [
            (JobKind::ExpireTransaction, self.config.payment_window),
            (JobKind::OrganizationResponse, self.config.confirmation_window),
        ] {
            self.scheduler
                .schedule_within(&mut *uow, kind, uuid, delay)
                .await?;
        }
        uow.commit().await?;

        Ok(TransactionRecord {
            transaction,
            details,
        })
    }

    /// Attach a proof-of-payment reference.
    ///
    /// The payment deadline no longer applies once a proof is in, so its
    /// timer is cancelled after commit.
    ///
    /// # Errors
    ///
    /// - `EmptyPaymentProof` for a blank reference
    /// - `NotFound`
    /// - `InvalidState` unless the transaction is `WAITING_FOR_PAYMENT`
    #[tracing::instrument(skip_all, fields(%uuid))]
    pub async fn submit_payment_proof(
        &self,
        uuid: TransactionId,
        proof: &str,
    ) -> Result<Transaction, EngineError> {
        let proof = proof.trim();
        if proof.is_empty() {
            return Err(EngineError::EmptyPaymentProof);
        }

        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let transaction = load(&mut *uow, uuid).await?;

        let updated = transition(
            &mut *uow,
            &transaction,
            Transition::SubmitProof,
            Some(proof),
            now,
        )
        .await?;
        uow.commit().await?;
        self.scheduler
            .cancel_quietly(JobKind::ExpireTransaction, uuid)
            .await;

        LifecycleMetrics::record_transition(updated.status);
        tracing::info!(%uuid, "Payment proof submitted");
        Ok(updated)
    }

    /// Store a proof-of-payment file and submit its URL.
    ///
    /// The upload is retried with the lifecycle's backoff policy.
    ///
    /// # Errors
    ///
    /// - `AssetStoreUnavailable` if no asset store is configured
    /// - `NotFound`, `InvalidState` as for [`submit_payment_proof`](Self::submit_payment_proof)
    /// - `Asset` if every upload attempt failed
    #[tracing::instrument(skip_all, fields(%uuid, file = %upload.file_name))]
    pub async fn upload_payment_proof(
        &self,
        uuid: TransactionId,
        upload: Upload,
    ) -> Result<Transaction, EngineError> {
        let assets = self
            .assets
            .as_ref()
            .ok_or(EngineError::AssetStoreUnavailable)?;

        let (transaction, _) = self
            .store
            .get_transaction(uuid)
            .await?
            .ok_or(EngineError::NotFound(uuid))?;
        require_status(&transaction, Transition::SubmitProof.source())?;

        let url = retry_with_backoff(&self.config.retry, || assets.store(&upload)).await?;
        tracing::debug!(%uuid, %url, "Payment proof stored");

        self.submit_payment_proof(uuid, &url).await
    }

    /// Accept or reject a transaction waiting for confirmation.
    ///
    /// Accepting keeps the stock and enqueues the follow-up reminder;
    /// rejecting hands every consumed resource back. Both cancel the
    /// outstanding deadline timers after commit.
    ///
    /// # Errors
    ///
    /// - `NotFound`
    /// - `Unauthorized` unless the organizer owns every event in the order
    /// - `InvalidState` unless the transaction is `WAITING_CONFIRMATION`
    /// - `MissingProof` if no proof was attached
    #[tracing::instrument(skip_all, fields(%uuid, %organizer_id, ?action))]
    pub async fn resolve(
        &self,
        uuid: TransactionId,
        organizer_id: OrganizerId,
        action: ResolveAction,
    ) -> Result<Transaction, EngineError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let transaction = load(&mut *uow, uuid).await?;

        let owners = uow.event_owners(uuid).await?;
        if owners.is_empty() || owners.iter().any(|owner| *owner != organizer_id) {
            return Err(EngineError::Unauthorized { uuid, organizer_id });
        }

        let edge = action.transition();
        require_status(&transaction, edge.source())?;
        if transaction.payment_proof.is_none() {
            return Err(EngineError::MissingProof(uuid));
        }

        let updated = transition(&mut *uow, &transaction, edge, None, now).await?;

        let report = if edge.compensates() {
            Some(self.compensation.revert(&mut *uow, &updated, now).await?)
        } else {
            None
        };
        if updated.status == TransactionStatus::Done {
            self.scheduler
                .schedule_within(
                    &mut *uow,
                    JobKind::OrganizerFollowup,
                    uuid,
                    self.config.followup_delay,
                )
                .await?;
        }
        uow.commit().await?;

        if report.is_some() {
            self.cancel_deadlines(uuid).await;
        } else {
            self.scheduler
                .cancel_quietly(JobKind::OrganizationResponse, uuid)
                .await;
        }

        self.after_transition(&updated, report.as_ref()).await;
        tracing::info!(%uuid, status = %updated.status, "Transaction resolved");
        Ok(updated)
    }

    // ========================================================================
    // Deadlines
    // ========================================================================

    /// Payment deadline: expire the transaction if it still awaits payment.
    ///
    /// Safe to call any number of times.
    ///
    /// # Errors
    ///
    /// `Store` on backend failure; nothing is changed.
    #[tracing::instrument(skip_all, fields(%uuid))]
    pub async fn expire(&self, uuid: TransactionId) -> Result<TimerOutcome, EngineError> {
        let outcome = self.fire_deadline(uuid, Transition::PaymentDeadline).await?;
        if outcome == TimerOutcome::Applied {
            self.scheduler
                .cancel_quietly(JobKind::OrganizationResponse, uuid)
                .await;
        }
        Ok(outcome)
    }

    /// Organizer response deadline: cancel the transaction if it still
    /// awaits confirmation.
    ///
    /// Safe to call any number of times.
    ///
    /// # Errors
    ///
    /// `Store` on backend failure; nothing is changed.
    #[tracing::instrument(skip_all, fields(%uuid))]
    pub async fn cancel_unanswered(&self, uuid: TransactionId) -> Result<TimerOutcome, EngineError> {
        self.fire_deadline(uuid, Transition::ConfirmationDeadline)
            .await
    }

    /// Post-acceptance reminder, sent only while the transaction is `DONE`.
    ///
    /// # Errors
    ///
    /// `Store` on backend failure.
    #[tracing::instrument(skip_all, fields(%uuid))]
    pub async fn send_followup(&self, uuid: TransactionId) -> Result<TimerOutcome, EngineError> {
        let Some((transaction, _)) = self.store.get_transaction(uuid).await? else {
            tracing::warn!(%uuid, "Follow-up for unknown transaction");
            return Ok(TimerOutcome::Missing);
        };
        if transaction.status != TransactionStatus::Done {
            return Ok(TimerOutcome::Skipped {
                status: transaction.status,
            });
        }

        self.notify_buyer(BuyerMessage::Followup, &transaction).await;
        Ok(TimerOutcome::Applied)
    }

    async fn fire_deadline(
        &self,
        uuid: TransactionId,
        edge: Transition,
    ) -> Result<TimerOutcome, EngineError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;

        let Some(transaction) = uow.find_transaction(uuid).await? else {
            tracing::warn!(%uuid, ?edge, "Deadline for unknown transaction");
            return Ok(TimerOutcome::Missing);
        };
        if transaction.status != edge.source() {
            tracing::debug!(%uuid, status = %transaction.status, ?edge, "Deadline no longer applies");
            return Ok(TimerOutcome::Skipped {
                status: transaction.status,
            });
        }

        let updated = match transition(&mut *uow, &transaction, edge, None, now).await {
            Ok(updated) => updated,
            Err(EngineError::InvalidState { actual, .. }) => {
                return Ok(TimerOutcome::Skipped { status: actual });
            },
            Err(error) => return Err(error),
        };
        let report = if edge.compensates() {
            Some(self.compensation.revert(&mut *uow, &updated, now).await?)
        } else {
            None
        };
        uow.commit().await?;

        self.after_transition(&updated, report.as_ref()).await;
        tracing::info!(%uuid, status = %updated.status, "Deadline applied");
        Ok(TimerOutcome::Applied)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Load a transaction with its lines.
    ///
    /// # Errors
    ///
    /// `NotFound`, or `Store` on backend failure.
    pub async fn get_transaction(
        &self,
        uuid: TransactionId,
    ) -> Result<TransactionRecord, EngineError> {
        let (transaction, details) = self
            .store
            .get_transaction(uuid)
            .await?
            .ok_or(EngineError::NotFound(uuid))?;
        Ok(TransactionRecord {
            transaction,
            details,
        })
    }

    /// A buyer's transactions, newest first.
    ///
    /// # Errors
    ///
    /// `Store` on backend failure.
    pub async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Transaction>, EngineError> {
        Ok(self.store.list_by_user(user_id).await?)
    }

    /// Transactions touching any event the organizer owns, newest first.
    ///
    /// # Errors
    ///
    /// `Store` on backend failure.
    pub async fn list_by_organizer(
        &self,
        organizer_id: OrganizerId,
    ) -> Result<OrganizerTransactions, EngineError> {
        let transactions = self.store.list_by_organizer(organizer_id).await?;
        Ok(OrganizerTransactions {
            count: transactions.len(),
            transactions,
        })
    }

    /// Σ total of the organizer's accepted transactions.
    ///
    /// # Errors
    ///
    /// `Store` on backend failure.
    pub async fn organizer_revenue(&self, organizer_id: OrganizerId) -> Result<Money, EngineError> {
        Ok(self.store.organizer_revenue(organizer_id).await?)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn cancel_deadlines(&self, uuid: TransactionId) {
        self.cancel_jobs(
            uuid,
            &[JobKind::ExpireTransaction, JobKind::OrganizationResponse],
        )
        .await;
    }

    async fn cancel_jobs(&self, uuid: TransactionId, kinds: &[JobKind]) {
        for &kind in kinds {
            self.scheduler.cancel_quietly(kind, uuid).await;
        }
    }

    async fn after_transition(&self, transaction: &Transaction, report: Option<&CompensationReport>) {
        LifecycleMetrics::record_transition(transaction.status);
        if report.is_some_and(|report| report.applied) {
            LifecycleMetrics::record_compensation();
        }
        if let Some(message) = BuyerMessage::for_status(transaction.status) {
            self.notify_buyer(message, transaction).await;
        }
    }

    async fn notify_buyer(&self, message: BuyerMessage, transaction: &Transaction) {
        let uuid = transaction.uuid;
        let contact = match self.store.user_contact(transaction.user_id).await {
            Ok(Some(contact)) => contact,
            Ok(None) => {
                tracing::warn!(%uuid, user_id = %transaction.user_id, "No contact for buyer, notification dropped");
                return;
            },
            Err(error) => {
                tracing::warn!(%uuid, %error, "Failed to load buyer contact, notification dropped");
                return;
            },
        };
        let events = self
            .store
            .transaction_events(uuid)
            .await
            .unwrap_or_else(|error| {
                tracing::warn!(%uuid, %error, "Failed to load event names");
                Vec::new()
            });

        let notification = message.render(&contact, transaction, &events);
        if let Err(error) = self.notifier.notify(notification).await {
            tracing::warn!(%uuid, template = message.template(), %error, "Notification failed");
        }
    }
}

impl std::fmt::Debug for TransactionLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLifecycle")
            .field("config", &self.config)
            .field("has_asset_store", &self.assets.is_some())
            .finish_non_exhaustive()
    }
}

async fn load(uow: &mut dyn UnitOfWork, uuid: TransactionId) -> Result<Transaction, EngineError> {
    uow.find_transaction(uuid)
        .await?
        .ok_or(EngineError::NotFound(uuid))
}

fn require_status(
    transaction: &Transaction,
    expected: TransactionStatus,
) -> Result<(), EngineError> {
    if transaction.status == expected {
        Ok(())
    } else {
        Err(EngineError::InvalidState {
            uuid: transaction.uuid,
            expected,
            actual: transaction.status,
        })
    }
}

/// Compare-and-swap `transaction` along `edge`.
///
/// Fails with `InvalidState` carrying the status actually stored if another
/// writer moved the row first.
async fn transition(
    uow: &mut dyn UnitOfWork,
    transaction: &Transaction,
    edge: Transition,
    payment_proof: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Transaction, EngineError> {
    require_status(transaction, edge.source())?;
    let to = transaction
        .status
        .apply(edge)
        .ok_or_else(|| EngineError::Invariant(format!("{edge:?} from {}", transaction.status)))?;

    let change = StatusChange {
        uuid: transaction.uuid,
        from: transaction.status,
        to,
        payment_proof: payment_proof.map(str::to_string),
        at: now,
    };
    if !uow.transition_status(&change).await? {
        let actual = uow
            .find_transaction(transaction.uuid)
            .await?
            .map_or(transaction.status, |current| current.status);
        return Err(EngineError::InvalidState {
            uuid: transaction.uuid,
            expected: change.from,
            actual,
        });
    }

    let mut updated = transaction.clone();
    updated.status = to;
    updated.updated_at = now;
    if let Some(proof) = change.payment_proof {
        updated.payment_proof = Some(proof);
    }
    Ok(updated)
}

/// Builder for [`TransactionLifecycle`].
pub struct TransactionLifecycleBuilder {
    store: Arc<dyn TransactionStore>,
    queue: Arc<dyn JobQueue>,
    notifier: Option<Arc<dyn Notifier>>,
    assets: Option<Arc<dyn AssetStore>>,
    clock: Option<Arc<dyn Clock>>,
    config: Option<LifecycleConfig>,
}

impl TransactionLifecycleBuilder {
    /// Notification sink (default: [`TracingNotifier`])
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Asset store for proof uploads (default: none)
    #[must_use]
    pub fn asset_store(mut self, assets: Arc<dyn AssetStore>) -> Self {
        self.assets = Some(assets);
        self
    }

    /// Time source (default: [`SystemClock`])
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Deadlines and retry policy (default: [`LifecycleConfig::default`])
    #[must_use]
    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the [`TransactionLifecycle`].
    #[must_use]
    pub fn build(self) -> TransactionLifecycle {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let config = self.config.unwrap_or_default();
        let inventory = InventoryLedger::new();

        TransactionLifecycle {
            scheduler: DelayedJobScheduler::new(self.queue, Arc::clone(&clock), config.retry.clone()),
            store: self.store,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier)),
            assets: self.assets,
            clock,
            config,
            inventory,
            discounts: DiscountResolver::new(),
            compensation: CompensationEngine::new(inventory),
        }
    }
}
