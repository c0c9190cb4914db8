//! `PostgreSQL` adapters for Boxoffice.
//!
//! This crate implements the persistence ports of `boxoffice-core` on top of
//! sqlx:
//!
//! - [`PostgresStore`]: the relational store. Each unit of work is one
//!   database transaction; every guarded mutation is a single conditional
//!   `UPDATE`, so concurrent orders never oversell.
//! - [`PostgresJobQueue`]: durable delayed jobs leased with
//!   `FOR UPDATE SKIP LOCKED`, at most one live job per key.
//! - [`DeadLetterQueue`]: operator view of jobs that exhausted their retries.
//!
//! Schema lives in `migrations/` and is applied with [`migrate`].
//!
//! # Example
//!
//! ```ignore
//! use boxoffice_postgres::{PostgresJobQueue, PostgresStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresStore::new("postgres://localhost/boxoffice").await?;
//!     boxoffice_postgres::migrate(store.pool()).await?;
//!     let queue = PostgresJobQueue::new(store.pool().clone());
//!     Ok(())
//! }
//! ```

mod dead_letter_queue;
mod queue;
mod store;

pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, FailedJob};
pub use queue::PostgresJobQueue;
pub use store::{PgUnitOfWork, PostgresStore};

/// Apply the embedded migrations.
///
/// # Errors
///
/// Returns the migration error if any migration fails to apply.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
