//! # Boxoffice Core
//!
//! Domain types and ports for the Boxoffice transaction engine.
//!
//! This crate holds everything about ticket orders that does not perform I/O:
//!
//! - **Types**: tickets, transactions, coupons, vouchers, point balances
//! - **Status machine**: which transitions are allowed from which status
//! - **Discounts**: order-level voucher → coupon → points arithmetic
//! - **Errors**: the stable error taxonomy of the public operations
//! - **Ports**: store, job queue, notifier, asset store and clock traits
//!
//! ## Lifecycle
//!
//! ```text
//! WAITING_FOR_PAYMENT ──proof──▶ WAITING_CONFIRMATION ──accept──▶ DONE
//!         │                              ├──reject──▶ REJECTED  (compensated)
//!         └──payment deadline──▶ EXPIRED └──response deadline──▶ CANCELED
//!                               (compensated)               (compensated)
//! ```
//!
//! Implementations of the ports live in `boxoffice-postgres` (production) and
//! `boxoffice-testing` (in-memory). The orchestration lives in
//! `boxoffice-runtime`.

pub use chrono::{DateTime, Utc};

pub mod discount;
pub mod error;
pub mod jobs;
pub mod ports;
pub mod store;
pub mod types;

pub use error::{CouponRejection, EngineError, ErrorKind, VoucherRejection};

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// through constructors; time is one of them.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use boxoffice_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let earlier = clock.now();
    /// assert!(clock.now() >= earlier);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
