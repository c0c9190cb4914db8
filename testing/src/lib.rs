//! # Boxoffice Testing
//!
//! Testing utilities for the Boxoffice transaction engine.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - In-memory implementations of every port: [`InMemoryStore`],
//!   [`InMemoryJobQueue`], [`RecordingNotifier`], [`InMemoryAssetStore`]
//! - A seeded [`Fixture`] with events, organizers, buyers and tickets
//! - proptest strategies for domain values
//!
//! ## Example
//!
//! ```ignore
//! use boxoffice_testing::Fixture;
//! use boxoffice_runtime::TransactionLifecycle;
//!
//! #[tokio::test]
//! async fn order_reserves_stock() {
//!     let fx = Fixture::seeded().await;
//!     let lifecycle = TransactionLifecycle::builder(fx.dyn_store(), fx.dyn_queue())
//!         .clock(fx.dyn_clock())
//!         .build();
//!
//!     lifecycle.create(Fixture::order(2)).await.unwrap();
//!     assert_eq!(fx.store.remaining(Fixture::TICKET).await, Some(8));
//! }
//! ```

use boxoffice_core::environment::Clock;
use chrono::{DateTime, Utc};

pub mod fixture;
pub mod ports;
pub mod queue;
pub mod store;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use boxoffice_testing::mocks::FixedClock;
    /// use boxoffice_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(epoch())
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the code under test.
    ///
    /// ```
    /// use boxoffice_testing::mocks::ManualClock;
    /// use boxoffice_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::default();
    /// let start = clock.now();
    /// clock.advance(Duration::from_secs(60));
    /// assert_eq!((clock.now() - start).num_seconds(), 60);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock stopped at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward
        ///
        /// # Panics
        ///
        /// Panics if `by` does not fit a `chrono::TimeDelta`.
        #[allow(clippy::unwrap_used, clippy::expect_used)]
        pub fn advance(&self, by: Duration) {
            let delta = chrono::TimeDelta::from_std(by).expect("advance fits TimeDelta");
            let mut time = self.time.lock().unwrap();
            *time += delta;
        }

        /// Jump to `time`
        ///
        /// # Panics
        ///
        /// Panics if the clock's lock is poisoned.
        #[allow(clippy::unwrap_used)]
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap() = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(epoch())
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    #[allow(clippy::expect_used)]
    fn epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }
}

/// Test helpers and utilities
pub mod helpers {
    /// Install a `tracing` subscriber that writes to the test output.
    ///
    /// Honors `RUST_LOG`; safe to call from every test.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "boxoffice=debug".into()),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use boxoffice_core::discount::DiscountOffer;
    use boxoffice_core::types::{LineItem, Money, TicketId};
    use proptest::prelude::*;

    /// Non-negative amounts up to `max`
    pub fn money(max: i64) -> impl Strategy<Value = Money> {
        (0..=max).prop_map(Money::new)
    }

    /// Any combination of voucher, coupon and points, each possibly absent
    pub fn discount_offer(max: i64) -> impl Strategy<Value = DiscountOffer> {
        let part = move || prop_oneof![Just(Money::ZERO), money(max)];
        (part(), part(), part()).prop_map(|(voucher, coupon, points)| DiscountOffer {
            voucher,
            coupon,
            points,
        })
    }

    /// 1..=`max_lines` line items over tickets `1..=tickets`
    pub fn line_items(
        tickets: i64,
        max_qty: u32,
        max_lines: usize,
    ) -> impl Strategy<Value = Vec<LineItem>> {
        prop::collection::vec(
            (1..=tickets, 1..=max_qty)
                .prop_map(|(id, qty)| LineItem::new(TicketId::new(id), qty)),
            1..=max_lines,
        )
    }
}

// Re-export commonly used items
pub use fixture::Fixture;
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use ports::{InMemoryAssetStore, RecordingNotifier};
pub use queue::InMemoryJobQueue;
pub use store::InMemoryStore;
