//! Integration tests for the transaction lifecycle over in-memory ports
//!
//! Covers the order scenarios end to end: creation with and without
//! discounts, proof submission, organizer resolution, deadline handling
//! through the job worker, and rollback on every failure path.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

mod common;

use boxoffice_core::jobs::{JobKey, JobKind};
use boxoffice_core::ports::Upload;
use boxoffice_core::types::{
    LineItem, Money, OrderRequest, ResolveAction, TicketId, Transaction,
    TransactionDetail, TransactionId, TransactionStatus,
};
use boxoffice_core::environment::Clock;
use boxoffice_core::{CouponRejection, EngineError, ErrorKind, VoucherRejection};
use boxoffice_runtime::notifier::{
    ACCEPTED_TEMPLATE, EXPIRED_TEMPLATE, FOLLOWUP_TEMPLATE, REJECTED_TEMPLATE,
};
use boxoffice_runtime::{LifecycleConfig, RetryPolicy, TransactionLifecycle};
use boxoffice_testing::Fixture;
use chrono::TimeDelta;
use common::harness;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn key(kind: JobKind, uuid: TransactionId) -> JobKey {
    JobKey { kind, uuid }
}

// ============================================================================
// Creation
// ============================================================================

#[tokio::test]
async fn scenario_a_order_without_discounts() {
    let h = harness().await;
    let now = h.fx.clock.now();

    let record = h.lifecycle.create(Fixture::order(2)).await.unwrap();
    let tx = &record.transaction;

    assert_eq!(tx.subtotal, Money::new(200_000));
    assert_eq!(tx.total_amount, Money::new(200_000));
    assert_eq!(tx.status, TransactionStatus::WaitingForPayment);
    assert_eq!(tx.points_used, Money::ZERO);
    assert_eq!(record.details.len(), 1);
    assert_eq!(record.details[0].qty, 2);
    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, Some(8));

    let expire = h.fx.queue.find(key(JobKind::ExpireTransaction, tx.uuid)).unwrap();
    let response = h
        .fx
        .queue
        .find(key(JobKind::OrganizationResponse, tx.uuid))
        .unwrap();
    assert_eq!(expire.run_at, now + TimeDelta::hours(2));
    assert_eq!(response.run_at, now + TimeDelta::days(3));
    assert_eq!(expire.max_attempts, 3);
    assert_eq!(expire.backoff, Duration::from_secs(1));
}

#[tokio::test]
async fn scenario_b_voucher_applies_once_per_order() {
    let h = harness().await;

    let record = h
        .lifecycle
        .create(Fixture::order(2).with_voucher(Fixture::VOUCHER))
        .await
        .unwrap();

    assert_eq!(record.transaction.subtotal, Money::new(200_000));
    assert_eq!(record.transaction.voucher_discount, Money::new(30_000));
    assert_eq!(record.transaction.total_amount, Money::new(170_000));
    assert_eq!(
        record.transaction.voucher_used.as_deref(),
        Some(Fixture::VOUCHER)
    );
    assert_eq!(
        h.fx.store.voucher(Fixture::VOUCHER).await.unwrap().remaining_qty,
        4
    );
}

#[tokio::test]
async fn discounts_stack_voucher_then_coupon_then_points() {
    let h = harness().await;

    let record = h
        .lifecycle
        .create(
            Fixture::order(1)
                .with_voucher(Fixture::VOUCHER)
                .with_coupon(Fixture::COUPON)
                .with_points(),
        )
        .await
        .unwrap();
    let tx = record.transaction;

    // 100000 - 30000 - 20000 - 15000
    assert_eq!(tx.voucher_discount, Money::new(30_000));
    assert_eq!(tx.coupon_discount, Money::new(20_000));
    assert_eq!(tx.points_used, Money::new(15_000));
    assert_eq!(tx.total_amount, Money::new(35_000));
    assert_eq!(h.fx.store.points(Fixture::BUYER).await, Some(Money::ZERO));
    assert!(h.fx.store.coupon(Fixture::COUPON).await.unwrap().is_claimed);
}

#[tokio::test]
async fn discount_surplus_is_dropped_and_unneeded_points_kept() {
    let h = harness().await;
    let cheap = TicketId::new(1002);
    h.fx.ticket(cheap, Fixture::EVENT, 40_000, 5).await;

    let order = OrderRequest::new(Fixture::BUYER, Fixture::EVENT, vec![LineItem::new(cheap, 1)])
        .with_voucher(Fixture::VOUCHER)
        .with_coupon(Fixture::COUPON)
        .with_points();
    let tx = h.lifecycle.create(order).await.unwrap().transaction;

    assert_eq!(tx.voucher_discount, Money::new(30_000));
    assert_eq!(tx.coupon_discount, Money::new(10_000));
    assert_eq!(tx.points_used, Money::ZERO);
    assert_eq!(tx.total_amount, Money::ZERO);
    assert!(tx.use_points);
    assert_eq!(h.fx.store.points(Fixture::BUYER).await, Some(Fixture::POINTS));
    assert!(h.fx.store.coupon(Fixture::COUPON).await.unwrap().is_claimed);
}

#[tokio::test]
async fn multi_line_order_sums_subtotal() {
    let h = harness().await;
    let order = OrderRequest::new(
        Fixture::BUYER,
        Fixture::EVENT,
        vec![
            LineItem::new(Fixture::TICKET, 3),
            LineItem::new(Fixture::VIP_TICKET, 1),
        ],
    );

    let record = h.lifecycle.create(order).await.unwrap();

    assert_eq!(record.transaction.total_amount, Money::new(550_000));
    assert_eq!(record.details.len(), 2);
    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, Some(7));
    assert_eq!(h.fx.store.remaining(Fixture::VIP_TICKET).await, Some(0));
}

// ============================================================================
// Creation failures roll back
// ============================================================================

async fn assert_untouched(h: &common::Harness) {
    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, Some(10));
    assert_eq!(h.fx.store.remaining(Fixture::VIP_TICKET).await, Some(1));
    assert_eq!(h.fx.store.transaction_count().await, 0);
    assert!(!h.fx.store.coupon(Fixture::COUPON).await.unwrap().is_claimed);
    assert_eq!(
        h.fx.store.voucher(Fixture::VOUCHER).await.unwrap().remaining_qty,
        5
    );
    assert_eq!(h.fx.store.points(Fixture::BUYER).await, Some(Fixture::POINTS));
    assert!(h.fx.queue.is_empty());
}

#[tokio::test]
async fn validation_errors() {
    let h = harness().await;

    let empty = OrderRequest::new(Fixture::BUYER, Fixture::EVENT, vec![]);
    let err = h.lifecycle.create(empty).await.unwrap_err();
    assert!(matches!(err, EngineError::EmptyOrder));
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h.lifecycle.create(Fixture::order(0)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidQuantity { .. }));

    let foreign = OrderRequest::new(
        Fixture::BUYER,
        Fixture::EVENT,
        vec![LineItem::new(Fixture::OTHER_TICKET, 1)],
    );
    let err = h.lifecycle.create(foreign).await.unwrap_err();
    assert!(matches!(err, EngineError::TicketOutsideEvent { .. }));
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert_untouched(&h).await;
}

#[tokio::test]
async fn unknown_ticket_is_not_found() {
    let h = harness().await;
    let order = OrderRequest::new(
        Fixture::BUYER,
        Fixture::EVENT,
        vec![
            LineItem::new(Fixture::TICKET, 2),
            LineItem::new(TicketId::new(9999), 1),
        ],
    );

    let err = h.lifecycle.create(order).await.unwrap_err();

    assert!(matches!(err, EngineError::TicketNotFound(id) if id == TicketId::new(9999)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_untouched(&h).await;
}

#[tokio::test]
async fn insufficient_stock_on_any_line_rolls_back_every_line() {
    let h = harness().await;
    let order = OrderRequest::new(
        Fixture::BUYER,
        Fixture::EVENT,
        vec![
            LineItem::new(Fixture::TICKET, 2),
            LineItem::new(Fixture::VIP_TICKET, 2),
        ],
    )
    .with_voucher(Fixture::VOUCHER);

    let err = h.lifecycle.create(order).await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::ResourceExhausted { ticket_id, requested: 2 } if ticket_id == Fixture::VIP_TICKET
    ));
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_untouched(&h).await;
}

#[tokio::test]
async fn claimed_coupon_is_refused() {
    let h = harness().await;
    h.lifecycle
        .create(Fixture::order(1).with_coupon(Fixture::COUPON))
        .await
        .unwrap();

    let second = OrderRequest::new(
        Fixture::OTHER_BUYER,
        Fixture::EVENT,
        vec![LineItem::new(Fixture::TICKET, 1)],
    )
    .with_coupon(Fixture::COUPON);
    let err = h.lifecycle.create(second).await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::CouponInvalid {
            reason: CouponRejection::AlreadyClaimed,
            ..
        }
    ));
    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, Some(9));
}

#[tokio::test]
async fn unknown_and_expired_coupons_are_refused() {
    let h = harness().await;

    let err = h
        .lifecycle
        .create(Fixture::order(1).with_coupon("NOPE"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::CouponInvalid {
            reason: CouponRejection::NotFound,
            ..
        }
    ));

    h.fx.clock.advance(91 * DAY);
    let err = h
        .lifecycle
        .create(Fixture::order(1).with_coupon(Fixture::COUPON))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::CouponInvalid {
            reason: CouponRejection::Expired,
            ..
        }
    ));
}

#[tokio::test]
async fn blank_codes_are_ignored() {
    let h = harness().await;

    let tx = h
        .lifecycle
        .create(Fixture::order(1).with_coupon("  ").with_voucher(""))
        .await
        .unwrap()
        .transaction;

    assert_eq!(tx.total_amount, Money::new(100_000));
    assert_eq!(tx.referral_coupon_used, None);
    assert_eq!(tx.voucher_used, None);
}

#[tokio::test]
async fn voucher_is_single_use_per_buyer_until_compensated() {
    let h = harness().await;
    let first = h
        .lifecycle
        .create(Fixture::order(1).with_voucher(Fixture::VOUCHER))
        .await
        .unwrap()
        .transaction;

    let err = h
        .lifecycle
        .create(Fixture::order(1).with_voucher(Fixture::VOUCHER))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::VoucherInvalid {
            reason: VoucherRejection::AlreadyUsed,
            ..
        }
    ));

    // Another buyer is unaffected
    let other = OrderRequest::new(
        Fixture::OTHER_BUYER,
        Fixture::EVENT,
        vec![LineItem::new(Fixture::TICKET, 1)],
    )
    .with_voucher(Fixture::VOUCHER);
    h.lifecycle.create(other).await.unwrap();

    // Once the first order expires the voucher is usable again
    h.fx.clock.advance(2 * HOUR);
    h.lifecycle.expire(first.uuid).await.unwrap();
    h.lifecycle
        .create(Fixture::order(1).with_voucher(Fixture::VOUCHER))
        .await
        .unwrap();
}

#[tokio::test]
async fn voucher_is_scoped_to_its_event_and_window() {
    let h = harness().await;

    let other_event = OrderRequest::new(
        Fixture::BUYER,
        Fixture::OTHER_EVENT,
        vec![LineItem::new(Fixture::OTHER_TICKET, 1)],
    )
    .with_voucher(Fixture::VOUCHER);
    let err = h.lifecycle.create(other_event).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::VoucherInvalid {
            reason: VoucherRejection::NotFound,
            ..
        }
    ));

    h.fx.clock.advance(31 * DAY);
    let err = h
        .lifecycle
        .create(Fixture::order(1).with_voucher(Fixture::VOUCHER))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::VoucherInvalid {
            reason: VoucherRejection::OutsideWindow,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn exhausted_voucher_is_refused() {
    let h = harness().await;
    let mut voucher = h.fx.store.voucher(Fixture::VOUCHER).await.unwrap();
    voucher.remaining_qty = 0;
    h.fx.store.add_voucher(voucher).await;

    let err = h
        .lifecycle
        .create(Fixture::order(1).with_voucher(Fixture::VOUCHER))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::VoucherInvalid {
            reason: VoucherRejection::QuotaExhausted,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
}

#[tokio::test]
async fn points_requested_without_balance() {
    let h = harness().await;
    let order = OrderRequest::new(
        Fixture::OTHER_BUYER,
        Fixture::EVENT,
        vec![LineItem::new(Fixture::TICKET, 1)],
    )
    .with_points();

    let err = h.lifecycle.create(order).await.unwrap_err();

    assert!(matches!(err, EngineError::NoPointsAvailable(user) if user == Fixture::OTHER_BUYER));
    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, Some(10));
}

#[tokio::test]
async fn expired_points_are_not_usable() {
    let h = harness().await;
    h.fx.clock.advance(91 * DAY);

    let err = h
        .lifecycle
        .create(Fixture::order(1).with_points())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::NoPointsAvailable(_)));
}

#[tokio::test]
async fn refused_timer_rolls_the_order_back() {
    let h = harness().await;
    // First timer is accepted, the second is refused at commit
    h.fx.queue.fail_schedule_after(1);

    let err = h
        .lifecycle
        .create(
            Fixture::order(2)
                .with_coupon(Fixture::COUPON)
                .with_voucher(Fixture::VOUCHER)
                .with_points(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Store(_)));
    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert_untouched(&h).await;
    assert_eq!(h.fx.queue.cancelled().len(), 1);
}

#[tokio::test]
async fn failed_commit_leaves_no_timers() {
    let h = harness().await;
    h.fx.store.fail_commits(true);

    let err = h.lifecycle.create(Fixture::order(2)).await.unwrap_err();

    assert!(matches!(err, EngineError::Store(_)));
    h.fx.store.fail_commits(false);
    assert_untouched(&h).await;
    assert!(h.fx.queue.cancelled().is_empty());
}

#[tokio::test]
async fn lines_are_reserved_whatever_order_they_are_listed_in() {
    let h = harness().await;
    let order = OrderRequest::new(
        Fixture::BUYER,
        Fixture::EVENT,
        vec![
            LineItem::new(Fixture::VIP_TICKET, 1),
            LineItem::new(Fixture::TICKET, 3),
        ],
    );

    let record = h.lifecycle.create(order).await.unwrap();

    let lines: Vec<_> = record.details.iter().map(|d| (d.ticket_id, d.qty)).collect();
    assert_eq!(lines, vec![(Fixture::VIP_TICKET, 1), (Fixture::TICKET, 3)]);
    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, Some(7));
    assert_eq!(h.fx.store.remaining(Fixture::VIP_TICKET).await, Some(0));

    h.lifecycle.expire(record.transaction.uuid).await.unwrap();
    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, Some(10));
    assert_eq!(h.fx.store.remaining(Fixture::VIP_TICKET).await, Some(1));
}

// ============================================================================
// Proof submission
// ============================================================================

#[tokio::test]
async fn proof_moves_order_to_confirmation() {
    let h = harness().await;
    let uuid = h.lifecycle.create(Fixture::order(1)).await.unwrap().transaction.uuid;

    let tx = h
        .lifecycle
        .submit_payment_proof(uuid, " https://cdn/proof.png ")
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::WaitingConfirmation);
    assert_eq!(tx.payment_proof.as_deref(), Some("https://cdn/proof.png"));
    assert_eq!(h.fx.store.transaction(uuid).await.unwrap(), tx);
    // The payment deadline no longer applies
    assert!(h.fx.queue.find(key(JobKind::ExpireTransaction, uuid)).is_none());
    assert!(h.fx.queue.find(key(JobKind::OrganizationResponse, uuid)).is_some());
}

#[tokio::test]
async fn proof_errors() {
    let h = harness().await;
    let uuid = h.lifecycle.create(Fixture::order(1)).await.unwrap().transaction.uuid;

    let err = h.lifecycle.submit_payment_proof(uuid, "   ").await.unwrap_err();
    assert!(matches!(err, EngineError::EmptyPaymentProof));

    let err = h
        .lifecycle
        .submit_payment_proof(TransactionId::new(), "proof")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    h.lifecycle.submit_payment_proof(uuid, "proof").await.unwrap();
    let err = h.lifecycle.submit_payment_proof(uuid, "again").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            expected: TransactionStatus::WaitingForPayment,
            actual: TransactionStatus::WaitingConfirmation,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::State);
}

#[tokio::test]
async fn uploaded_proof_is_stored_and_submitted() {
    let config = LifecycleConfig {
        retry: RetryPolicy::builder()
            .initial_delay(Duration::from_millis(5))
            .build(),
        ..LifecycleConfig::default()
    };
    let h = common::harness_with(config).await;
    let uuid = h.lifecycle.create(Fixture::order(1)).await.unwrap().transaction.uuid;
    h.fx.assets.fail_times(1);

    let upload = Upload {
        file_name: "receipt.png".into(),
        content_type: "image/png".into(),
        bytes: vec![0x89, 0x50, 0x4e, 0x47],
    };
    let tx = h.lifecycle.upload_payment_proof(uuid, upload).await.unwrap();

    assert_eq!(tx.status, TransactionStatus::WaitingConfirmation);
    assert_eq!(
        tx.payment_proof.as_deref(),
        Some("memory://assets/1/receipt.png")
    );
    assert_eq!(h.fx.assets.uploads().len(), 1);
}

#[tokio::test]
async fn upload_without_asset_store_fails() {
    let fx = Fixture::seeded().await;
    let lifecycle = TransactionLifecycle::builder(fx.dyn_store(), fx.dyn_queue())
        .clock(fx.dyn_clock())
        .build();
    let uuid = lifecycle.create(Fixture::order(1)).await.unwrap().transaction.uuid;

    let upload = Upload {
        file_name: "receipt.png".into(),
        content_type: "image/png".into(),
        bytes: vec![1],
    };
    let err = lifecycle.upload_payment_proof(uuid, upload).await.unwrap_err();

    assert!(matches!(err, EngineError::AssetStoreUnavailable));
    assert_eq!(
        fx.store.transaction(uuid).await.unwrap().status,
        TransactionStatus::WaitingForPayment
    );
}

// ============================================================================
// Resolution
// ============================================================================

#[tokio::test]
async fn scenario_d_reject_releases_coupon_and_stock() {
    let h = harness().await;
    let uuid = h
        .lifecycle
        .create(Fixture::order(2).with_coupon(Fixture::COUPON))
        .await
        .unwrap()
        .transaction
        .uuid;
    h.lifecycle.submit_payment_proof(uuid, "proof").await.unwrap();
    assert!(h.fx.store.coupon(Fixture::COUPON).await.unwrap().is_claimed);

    let tx = h
        .lifecycle
        .resolve(uuid, Fixture::ORGANIZER, ResolveAction::Reject)
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::Rejected);
    assert!(!h.fx.store.coupon(Fixture::COUPON).await.unwrap().is_claimed);
    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, Some(10));
    assert!(h.fx.store.transaction(uuid).await.unwrap().compensated_at.is_some());
    assert!(h.fx.queue.is_empty());
    assert_eq!(h.fx.notifier.templates(), vec![REJECTED_TEMPLATE.to_string()]);
}

#[tokio::test]
async fn reject_refunds_points_and_voucher() {
    let h = harness().await;
    let uuid = h
        .lifecycle
        .create(Fixture::order(1).with_voucher(Fixture::VOUCHER).with_points())
        .await
        .unwrap()
        .transaction
        .uuid;
    h.lifecycle.submit_payment_proof(uuid, "proof").await.unwrap();

    h.lifecycle
        .resolve(uuid, Fixture::ORGANIZER, ResolveAction::Reject)
        .await
        .unwrap();

    assert_eq!(h.fx.store.points(Fixture::BUYER).await, Some(Fixture::POINTS));
    assert_eq!(
        h.fx.store.voucher(Fixture::VOUCHER).await.unwrap().remaining_qty,
        5
    );
}

#[tokio::test]
async fn refund_after_points_lapse_keeps_the_expiry() {
    let h = harness().await;
    let uuid = h
        .lifecycle
        .create(Fixture::order(1).with_points())
        .await
        .unwrap()
        .transaction
        .uuid;
    h.lifecycle.submit_payment_proof(uuid, "proof").await.unwrap();
    h.fx.clock.advance(91 * DAY);

    h.lifecycle
        .resolve(uuid, Fixture::ORGANIZER, ResolveAction::Reject)
        .await
        .unwrap();

    // Credited back, but the balance lapsed while the order was open
    assert_eq!(h.fx.store.points(Fixture::BUYER).await, Some(Fixture::POINTS));
    let err = h
        .lifecycle
        .create(Fixture::order(1).with_points())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoPointsAvailable(_)));
}

#[tokio::test]
async fn accept_keeps_stock_and_schedules_followup() {
    let h = harness().await;
    let now = h.fx.clock.now();
    let uuid = h.lifecycle.create(Fixture::order(2)).await.unwrap().transaction.uuid;
    h.lifecycle.submit_payment_proof(uuid, "proof").await.unwrap();

    let tx = h
        .lifecycle
        .resolve(uuid, Fixture::ORGANIZER, ResolveAction::Accept)
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::Done);
    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, Some(8));
    let jobs = h.fx.queue.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::OrganizerFollowup);
    assert_eq!(jobs[0].run_at, now + TimeDelta::days(5));

    h.fx.clock.advance(5 * DAY);
    let summary = h.worker.run_once().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(
        h.fx.notifier.templates(),
        vec![ACCEPTED_TEMPLATE.to_string(), FOLLOWUP_TEMPLATE.to_string()]
    );

    let accepted = &h.fx.notifier.sent()[0];
    assert_eq!(accepted.recipient, "alice@example.com");
    assert_eq!(accepted.payload["amount"], 200_000);
    assert_eq!(accepted.payload["eventName"], "Jazz Night");
}

#[tokio::test]
async fn resolve_errors() {
    let h = harness().await;
    let uuid = h.lifecycle.create(Fixture::order(1)).await.unwrap().transaction.uuid;

    let err = h
        .lifecycle
        .resolve(TransactionId::new(), Fixture::ORGANIZER, ResolveAction::Accept)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let err = h
        .lifecycle
        .resolve(uuid, Fixture::ORGANIZER, ResolveAction::Accept)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            expected: TransactionStatus::WaitingConfirmation,
            actual: TransactionStatus::WaitingForPayment,
            ..
        }
    ));

    h.lifecycle.submit_payment_proof(uuid, "proof").await.unwrap();
    let err = h
        .lifecycle
        .resolve(uuid, Fixture::OTHER_ORGANIZER, ResolveAction::Reject)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized { .. }));
    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert_eq!(
        h.fx.store.transaction(uuid).await.unwrap().status,
        TransactionStatus::WaitingConfirmation
    );
}

fn stored_transaction(
    h: &common::Harness,
    status: TransactionStatus,
    proof: Option<&str>,
) -> Transaction {
    let now = h.fx.clock.now();
    Transaction {
        uuid: TransactionId::new(),
        user_id: Fixture::BUYER,
        event_id: Fixture::EVENT,
        subtotal: Money::new(150_000),
        voucher_discount: Money::ZERO,
        coupon_discount: Money::ZERO,
        total_amount: Money::new(150_000),
        status,
        referral_coupon_used: None,
        voucher_used: None,
        use_points: false,
        points_used: Money::ZERO,
        payment_proof: proof.map(str::to_string),
        created_at: now,
        updated_at: now,
        compensated_at: None,
    }
}

#[tokio::test]
async fn resolve_requires_a_proof() {
    let h = harness().await;
    let tx = stored_transaction(&h, TransactionStatus::WaitingConfirmation, None);
    let uuid = tx.uuid;
    h.fx.store
        .add_transaction(
            tx,
            vec![TransactionDetail {
                transaction_uuid: uuid,
                ticket_id: Fixture::TICKET,
                qty: 1,
            }],
        )
        .await;

    let err = h
        .lifecycle
        .resolve(uuid, Fixture::ORGANIZER, ResolveAction::Accept)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::MissingProof(id) if id == uuid));
}

#[tokio::test]
async fn organizer_must_own_every_event_in_the_order() {
    let h = harness().await;
    let tx = stored_transaction(&h, TransactionStatus::WaitingConfirmation, Some("proof"));
    let uuid = tx.uuid;
    h.fx.store
        .add_transaction(
            tx,
            vec![
                TransactionDetail {
                    transaction_uuid: uuid,
                    ticket_id: Fixture::TICKET,
                    qty: 1,
                },
                TransactionDetail {
                    transaction_uuid: uuid,
                    ticket_id: Fixture::OTHER_TICKET,
                    qty: 1,
                },
            ],
        )
        .await;

    for organizer in [Fixture::ORGANIZER, Fixture::OTHER_ORGANIZER] {
        let err = h
            .lifecycle
            .resolve(uuid, organizer, ResolveAction::Accept)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized { .. }));
    }
}

#[tokio::test]
async fn notifier_failure_does_not_undo_the_transition() {
    let h = harness().await;
    let uuid = h.lifecycle.create(Fixture::order(1)).await.unwrap().transaction.uuid;
    h.lifecycle.submit_payment_proof(uuid, "proof").await.unwrap();
    h.fx.notifier.fail(true);

    let tx = h
        .lifecycle
        .resolve(uuid, Fixture::ORGANIZER, ResolveAction::Reject)
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::Rejected);
    assert_eq!(
        h.fx.store.transaction(uuid).await.unwrap().status,
        TransactionStatus::Rejected
    );
    assert_eq!(h.fx.notifier.attempts(), 1);
    assert!(h.fx.notifier.sent().is_empty());
}

// ============================================================================
// Deadlines
// ============================================================================

#[tokio::test]
async fn scenario_c_unpaid_order_expires() {
    let h = harness().await;
    let uuid = h.lifecycle.create(Fixture::order(2)).await.unwrap().transaction.uuid;
    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, Some(8));

    // Not due yet
    h.fx.clock.advance(HOUR);
    assert_eq!(h.worker.run_once().await.unwrap().claimed, 0);

    h.fx.clock.advance(HOUR);
    let summary = h.worker.run_once().await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(
        h.fx.store.transaction(uuid).await.unwrap().status,
        TransactionStatus::Expired
    );
    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, Some(10));
    assert_eq!(h.fx.store.points(Fixture::BUYER).await, Some(Fixture::POINTS));
    assert!(!h.fx.store.coupon(Fixture::COUPON).await.unwrap().is_claimed);
    assert!(h.fx.queue.is_empty());
    assert_eq!(h.fx.notifier.templates(), vec![EXPIRED_TEMPLATE.to_string()]);
}

#[tokio::test]
async fn unanswered_order_is_canceled_after_confirmation_window() {
    let h = harness().await;
    let uuid = h
        .lifecycle
        .create(Fixture::order(1).with_points())
        .await
        .unwrap()
        .transaction
        .uuid;
    h.lifecycle.submit_payment_proof(uuid, "proof").await.unwrap();

    h.fx.clock.advance(3 * DAY);
    h.worker.run_once().await.unwrap();

    let tx = h.fx.store.transaction(uuid).await.unwrap();
    assert_eq!(tx.status, TransactionStatus::Canceled);
    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, Some(10));
    assert_eq!(h.fx.store.points(Fixture::BUYER).await, Some(Fixture::POINTS));
}

#[tokio::test]
async fn followup_is_skipped_unless_done() {
    let h = harness().await;
    let tx = stored_transaction(&h, TransactionStatus::Rejected, Some("proof"));
    let uuid = tx.uuid;
    h.fx.store.add_transaction(tx, vec![]).await;

    let outcome = h.lifecycle.send_followup(uuid).await.unwrap();

    assert_eq!(
        outcome,
        boxoffice_runtime::TimerOutcome::Skipped {
            status: TransactionStatus::Rejected
        }
    );
    assert!(h.fx.notifier.sent().is_empty());
}

#[tokio::test]
async fn terminal_orders_ignore_every_operation() {
    use boxoffice_runtime::TimerOutcome;

    let h = harness().await;
    let mut terminal = Vec::new();
    for (action, status) in [
        (Some(ResolveAction::Reject), TransactionStatus::Rejected),
        (None, TransactionStatus::Canceled),
        (Some(ResolveAction::Accept), TransactionStatus::Done),
    ] {
        let uuid = h
            .lifecycle
            .create(Fixture::order(1).with_points())
            .await
            .unwrap()
            .transaction
            .uuid;
        h.lifecycle.submit_payment_proof(uuid, "proof").await.unwrap();
        match action {
            Some(action) => {
                h.lifecycle
                    .resolve(uuid, Fixture::ORGANIZER, action)
                    .await
                    .unwrap();
            },
            None => {
                h.lifecycle.cancel_unanswered(uuid).await.unwrap();
            },
        }
        terminal.push((uuid, status));
    }

    let stock = h.fx.store.remaining(Fixture::TICKET).await;
    let points = h.fx.store.points(Fixture::BUYER).await;
    let notified = h.fx.notifier.attempts();
    assert_eq!(stock, Some(9));

    for (uuid, status) in terminal {
        let err = h
            .lifecycle
            .submit_payment_proof(uuid, "again")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { actual, .. } if actual == status));

        for action in [ResolveAction::Accept, ResolveAction::Reject] {
            let err = h
                .lifecycle
                .resolve(uuid, Fixture::ORGANIZER, action)
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidState { actual, .. } if actual == status));
        }

        assert_eq!(
            h.lifecycle.expire(uuid).await.unwrap(),
            TimerOutcome::Skipped { status }
        );
        assert_eq!(
            h.lifecycle.cancel_unanswered(uuid).await.unwrap(),
            TimerOutcome::Skipped { status }
        );
        assert_eq!(h.fx.store.transaction(uuid).await.unwrap().status, status);
    }

    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, stock);
    assert_eq!(h.fx.store.points(Fixture::BUYER).await, points);
    assert_eq!(h.fx.notifier.attempts(), notified);
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn queries() {
    let h = harness().await;
    let first = h.lifecycle.create(Fixture::order(1)).await.unwrap().transaction.uuid;
    h.fx.clock.advance(Duration::from_secs(60));
    let second = h.lifecycle.create(Fixture::order(2)).await.unwrap().transaction.uuid;
    let other = OrderRequest::new(
        Fixture::OTHER_BUYER,
        Fixture::OTHER_EVENT,
        vec![LineItem::new(Fixture::OTHER_TICKET, 1)],
    );
    h.lifecycle.create(other).await.unwrap();

    let record = h.lifecycle.get_transaction(second).await.unwrap();
    assert_eq!(record.details[0].qty, 2);
    assert!(matches!(
        h.lifecycle.get_transaction(TransactionId::new()).await,
        Err(EngineError::NotFound(_))
    ));

    let mine: Vec<_> = h
        .lifecycle
        .list_by_user(Fixture::BUYER)
        .await
        .unwrap()
        .into_iter()
        .map(|tx| tx.uuid)
        .collect();
    assert_eq!(mine, vec![second, first]);

    let organizer = h.lifecycle.list_by_organizer(Fixture::ORGANIZER).await.unwrap();
    assert_eq!(organizer.count, 2);
    assert_eq!(organizer.transactions[0].uuid, second);

    // Only accepted transactions count as revenue
    assert_eq!(
        h.lifecycle.organizer_revenue(Fixture::ORGANIZER).await.unwrap(),
        Money::ZERO
    );
    h.lifecycle.submit_payment_proof(first, "proof").await.unwrap();
    h.lifecycle
        .resolve(first, Fixture::ORGANIZER, ResolveAction::Accept)
        .await
        .unwrap();
    assert_eq!(
        h.lifecycle.organizer_revenue(Fixture::ORGANIZER).await.unwrap(),
        Money::new(100_000)
    );
    assert_eq!(
        h.lifecycle
            .organizer_revenue(Fixture::OTHER_ORGANIZER)
            .await
            .unwrap(),
        Money::ZERO
    );
}
