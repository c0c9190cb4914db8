//! # Boxoffice Runtime
//!
//! Orchestration of ticket orders on top of the ports in `boxoffice-core`.
//!
//! ## Core Components
//!
//! - **TransactionLifecycle**: create, submit proof, resolve, deadlines, queries
//! - **InventoryLedger**: conditional stock reserve/release
//! - **DiscountResolver**: voucher, coupon and point validation and consumption
//! - **CompensationEngine**: hands consumed resources back exactly once
//! - **DelayedJobScheduler** / **JobWorker**: keyed deferred jobs with retry
//!   and dead-lettering
//!
//! ## Example
//!
//! ```ignore
//! use boxoffice_runtime::{HandlerRegistry, JobWorker, TransactionLifecycle};
//!
//! let lifecycle = Arc::new(
//!     TransactionLifecycle::builder(store, Arc::clone(&queue))
//!         .notifier(notifier)
//!         .build(),
//! );
//!
//! let record = lifecycle.create(order).await?;
//! lifecycle.submit_payment_proof(record.transaction.uuid, "https://…").await?;
//!
//! let worker = JobWorker::new(
//!     queue,
//!     HandlerRegistry::for_lifecycle(&lifecycle),
//!     clock,
//!     WorkerConfig::default(),
//! );
//! worker.run(shutdown_rx).await;
//! ```

/// Stacked discount validation and consumption
pub mod discount;

/// Stock reservation
pub mod inventory;

/// Resource hand-back on rejection, expiry and cancellation
pub mod compensation;

/// Keyed job scheduling
pub mod scheduler;

/// Deadlines and retry settings
pub mod config;

/// Retry logic with exponential backoff
pub mod retry;

/// Buyer notifications
pub mod notifier;

/// Public order operations
pub mod lifecycle;

/// Job handlers
pub mod handlers;

/// Job polling worker
pub mod worker;

/// Prometheus metrics for observability
pub mod metrics;

pub use compensation::{CompensationEngine, CompensationReport};
pub use config::LifecycleConfig;
pub use discount::{DiscountQuote, DiscountResolver};
pub use handlers::{HandlerRegistry, JobHandler};
pub use inventory::InventoryLedger;
pub use lifecycle::{OrganizerTransactions, TimerOutcome, TransactionLifecycle};
pub use notifier::TracingNotifier;
pub use retry::RetryPolicy;
pub use scheduler::DelayedJobScheduler;
pub use worker::{JobWorker, TickSummary, WorkerConfig};
