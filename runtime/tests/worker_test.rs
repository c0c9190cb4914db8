//! Job worker delivery, retry and dead-letter behavior

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

mod common;

use async_trait::async_trait;
use boxoffice_core::EngineError;
use boxoffice_core::environment::Clock;
use boxoffice_core::jobs::{JobKey, JobKind, JobPayload, JobQueue, JobRequest, ScheduledJob};
use boxoffice_core::types::{TransactionId, TransactionStatus};
use boxoffice_runtime::handlers::ExpireTransactionHandler;
use boxoffice_runtime::{HandlerRegistry, JobHandler, TimerOutcome};
use boxoffice_testing::Fixture;
use chrono::TimeDelta;
use common::{harness, worker_for};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::watch;

const PAYMENT_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);

struct FailingHandler {
    calls: AtomicU32,
}

#[async_trait]
impl JobHandler for FailingHandler {
    fn kind(&self) -> JobKind {
        JobKind::ExpireTransaction
    }

    async fn handle(&self, _job: &ScheduledJob) -> Result<TimerOutcome, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::Invariant("handler exploded".into()))
    }
}

#[tokio::test]
async fn redelivered_job_is_harmless() {
    let h = harness().await;
    let uuid = h.lifecycle.create(Fixture::order(2)).await.unwrap().transaction.uuid;
    let job = h
        .fx
        .queue
        .find(JobKey {
            kind: JobKind::ExpireTransaction,
            uuid,
        })
        .unwrap();
    h.fx.clock.advance(PAYMENT_WINDOW);

    assert_eq!(h.worker.run_once().await.unwrap().completed, 1);

    // Same job delivered a second time
    let handler = ExpireTransactionHandler::new(Arc::clone(&h.lifecycle));
    let outcome = handler.handle(&job).await.unwrap();

    assert_eq!(
        outcome,
        TimerOutcome::Skipped {
            status: TransactionStatus::Expired
        }
    );
    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, Some(10));
    assert_eq!(h.fx.notifier.sent().len(), 1);
}

#[tokio::test]
async fn abandoned_lease_is_reclaimed() {
    let h = harness().await;
    let uuid = h.lifecycle.create(Fixture::order(1)).await.unwrap().transaction.uuid;
    h.fx.clock.advance(PAYMENT_WINDOW);
    let now = h.fx.clock.now();

    // A worker leases the job and dies
    let leased = h
        .fx
        .queue
        .claim_due(now, 10, now + TimeDelta::minutes(1))
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(h.worker.run_once().await.unwrap().claimed, 0);

    h.fx.clock.advance(Duration::from_secs(2 * 60));
    let summary = h.worker.run_once().await.unwrap();

    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(
        h.fx.store.transaction(uuid).await.unwrap().status,
        TransactionStatus::Expired
    );
}

#[tokio::test]
async fn failing_job_backs_off_then_dead_letters() {
    let h = harness().await;
    let handler = Arc::new(FailingHandler {
        calls: AtomicU32::new(0),
    });
    let worker = worker_for(&h.fx, HandlerRegistry::new().with(handler.clone()));
    let uuid = h.lifecycle.create(Fixture::order(1)).await.unwrap().transaction.uuid;
    let key = JobKey {
        kind: JobKind::ExpireTransaction,
        uuid,
    };
    h.fx.clock.advance(PAYMENT_WINDOW);

    assert_eq!(worker.run_once().await.unwrap().retried, 1);
    let job = h.fx.queue.find(key).unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.run_at, h.fx.clock.now() + TimeDelta::seconds(1));
    assert_eq!(job.last_error.as_deref(), Some("invariant violated: handler exploded"));

    // Not due until the backoff elapses
    assert_eq!(worker.run_once().await.unwrap().claimed, 0);

    h.fx.clock.advance(Duration::from_secs(1));
    assert_eq!(worker.run_once().await.unwrap().retried, 1);
    let job = h.fx.queue.find(key).unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.run_at, h.fx.clock.now() + TimeDelta::seconds(2));

    h.fx.clock.advance(Duration::from_secs(2));
    assert_eq!(worker.run_once().await.unwrap().dead_lettered, 1);

    assert!(h.fx.queue.find(key).is_none());
    let dead = h.fx.queue.dead();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.attempts, 3);
    assert_eq!(dead[0].job.key(), key);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.fx.queue.dead_letters(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn job_without_handler_is_dead_lettered_at_once() {
    let h = harness().await;
    let worker = worker_for(&h.fx, HandlerRegistry::new());
    h.lifecycle.create(Fixture::order(1)).await.unwrap();
    h.fx.clock.advance(PAYMENT_WINDOW);

    let summary = worker.run_once().await.unwrap();

    assert_eq!(summary.dead_lettered, 1);
    let dead = h.fx.queue.dead();
    assert_eq!(dead[0].job.attempts, 1);
    assert!(dead[0].error.contains("no handler"));
}

#[tokio::test]
async fn response_deadline_skips_unpaid_order() {
    let h = harness().await;
    let uuid = h.lifecycle.create(Fixture::order(1)).await.unwrap().transaction.uuid;
    let response = JobKey {
        kind: JobKind::OrganizationResponse,
        uuid,
    };
    h.fx.queue.reschedule(response, h.fx.clock.now());

    let summary = h.worker.run_once().await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(
        h.fx.store.transaction(uuid).await.unwrap().status,
        TransactionStatus::WaitingForPayment
    );
    assert_eq!(h.fx.store.remaining(Fixture::TICKET).await, Some(9));
    assert!(h.fx.queue.find(response).is_none());
}

#[tokio::test]
async fn job_for_missing_transaction_completes() {
    let h = harness().await;
    h.fx.queue
        .schedule(JobRequest {
            kind: JobKind::ExpireTransaction,
            payload: JobPayload {
                uuid: TransactionId::new(),
            },
            run_at: h.fx.clock.now(),
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        })
        .await
        .unwrap();

    let summary = h.worker.run_once().await.unwrap();

    assert_eq!(summary.completed, 1);
    assert!(h.fx.queue.is_empty());
    assert!(h.fx.queue.dead().is_empty());
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let h = harness().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = worker_for(&h.fx, HandlerRegistry::for_lifecycle(&h.lifecycle));

    let running = tokio::spawn(async move { worker.run(shutdown_rx).await });
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("worker did not stop")
        .unwrap();
}
