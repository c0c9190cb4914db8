//! Relational store over a `PgPool`.

use crate::queue::{backoff_to_db, to_i32};
use async_trait::async_trait;
use boxoffice_core::jobs::{JobRequest, QueueError};
use boxoffice_core::store::{StatusChange, StoreError, TransactionStore, UnitOfWork};
use boxoffice_core::types::{
    EventId, EventOwnership, Money, OrganizerId, PointBalance, ReferralCoupon, Ticket, TicketId,
    Transaction, TransactionDetail, TransactionId, UserContact, UserId, Voucher,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use uuid::Uuid;

const TRANSACTION_COLUMNS: &str = r"
    uuid, user_id, event_id, subtotal, voucher_discount, coupon_discount,
    total_amount, status, referral_coupon_used, voucher_used, use_points,
    points_used, payment_proof, created_at, updated_at, compensated_at
";

/// Transactions that reference at least one event owned by `$1`
const OWNED_BY: &str = r"
    SELECT d.transaction_uuid
    FROM transaction_details d
    JOIN tickets k ON k.id = d.ticket_id
    JOIN events e ON e.id = k.event_id
    WHERE e.organizer_id = $1
";

/// `PostgreSQL` implementation of [`TransactionStore`].
///
/// Cheap to clone; clones share the pool.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to `database_url` with a default pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .connect(database_url)
            .await
            .map_err(db_error)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionStore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self.pool.begin().await.map_err(db_error)?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn get_transaction(
        &self,
        uuid: TransactionId,
    ) -> Result<Option<(Transaction, Vec<TransactionDetail>)>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE uuid = $1"
        ))
        .bind(*uuid.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let transaction = row_to_transaction(&row)?;

        let rows = sqlx::query(
            r"
            SELECT transaction_uuid, ticket_id, qty
            FROM transaction_details
            WHERE transaction_uuid = $1
            ORDER BY line_no
            ",
        )
        .bind(*uuid.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        let details = rows.iter().map(row_to_detail).collect::<Result<_, _>>()?;

        Ok(Some((transaction, details)))
    }

    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            "
        ))
        .bind(user_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_transaction).collect()
    }

    async fn list_by_organizer(
        &self,
        organizer_id: OrganizerId,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE uuid IN ({OWNED_BY})
            ORDER BY created_at DESC
            "
        ))
        .bind(organizer_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_transaction).collect()
    }

    async fn organizer_revenue(&self, organizer_id: OrganizerId) -> Result<Money, StoreError> {
        let total: i64 = sqlx::query_scalar(&format!(
            r"
            SELECT COALESCE(SUM(total_amount), 0)::BIGINT FROM transactions
            WHERE status = 'DONE' AND uuid IN ({OWNED_BY})
            "
        ))
        .bind(organizer_id.get())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(Money::new(total))
    }

    async fn user_contact(&self, user_id: UserId) -> Result<Option<UserContact>, StoreError> {
        let row = sqlx::query("SELECT id, email, full_name FROM users WHERE id = $1")
            .bind(user_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(|row| {
            Ok(UserContact {
                user_id: UserId::new(col(&row, "id")?),
                email: col(&row, "email")?,
                full_name: col(&row, "full_name")?,
            })
        })
        .transpose()
    }

    async fn transaction_events(
        &self,
        uuid: TransactionId,
    ) -> Result<Vec<EventOwnership>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT DISTINCT e.id, e.organizer_id, e.name
            FROM transaction_details d
            JOIN tickets k ON k.id = d.ticket_id
            JOIN events e ON e.id = k.event_id
            WHERE d.transaction_uuid = $1
            ORDER BY e.id
            ",
        )
        .bind(*uuid.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| {
                Ok(EventOwnership {
                    event_id: EventId::new(col(row, "id")?),
                    organizer_id: OrganizerId::new(col(row, "organizer_id")?),
                    name: col(row, "name")?,
                })
            })
            .collect()
    }
}

/// One database transaction.
///
/// Dropping it without [`UnitOfWork::commit`] rolls back.
pub struct PgUnitOfWork {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PgUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgUnitOfWork").finish_non_exhaustive()
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn find_ticket(&mut self, id: TicketId) -> Result<Option<Ticket>, StoreError> {
        let row = sqlx::query("SELECT id, event_id, price, remaining_qty FROM tickets WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_error)?;

        row.map(|row| {
            Ok(Ticket {
                id: TicketId::new(col(&row, "id")?),
                event_id: EventId::new(col(&row, "event_id")?),
                price: Money::new(col(&row, "price")?),
                remaining_qty: qty_from_db(col(&row, "remaining_qty")?)?,
            })
        })
        .transpose()
    }

    async fn reserve_stock(&mut self, id: TicketId, qty: u32) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE tickets SET remaining_qty = remaining_qty - $2
            WHERE id = $1 AND remaining_qty >= $2
            ",
        )
        .bind(id.get())
        .bind(qty_to_db(qty)?)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_stock(&mut self, id: TicketId, qty: u32) -> Result<(), StoreError> {
        sqlx::query("UPDATE tickets SET remaining_qty = remaining_qty + $2 WHERE id = $1")
            .bind(id.get())
            .bind(qty_to_db(qty)?)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn find_coupon(&mut self, code: &str) -> Result<Option<ReferralCoupon>, StoreError> {
        let row = sqlx::query(
            "SELECT code, amount, is_claimed, expires_at FROM referral_coupons WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            Ok(ReferralCoupon {
                code: col(&row, "code")?,
                amount: Money::new(col(&row, "amount")?),
                is_claimed: col(&row, "is_claimed")?,
                expires_at: col(&row, "expires_at")?,
            })
        })
        .transpose()
    }

    async fn claim_coupon(&mut self, code: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE referral_coupons SET is_claimed = TRUE WHERE code = $1 AND NOT is_claimed",
        )
        .bind(code)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn unclaim_coupon(&mut self, code: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE referral_coupons SET is_claimed = FALSE WHERE code = $1")
            .bind(code)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn find_voucher(&mut self, code: &str) -> Result<Option<Voucher>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT code, event_id, discount_amount, remaining_qty, starts_at, ends_at
            FROM vouchers WHERE code = $1
            FOR UPDATE
            ",
        )
        .bind(code)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            Ok(Voucher {
                code: col(&row, "code")?,
                event_id: EventId::new(col(&row, "event_id")?),
                discount_amount: Money::new(col(&row, "discount_amount")?),
                remaining_qty: qty_from_db(col(&row, "remaining_qty")?)?,
                starts_at: col(&row, "starts_at")?,
                ends_at: col(&row, "ends_at")?,
            })
        })
        .transpose()
    }

    async fn voucher_used_by(
        &mut self,
        code: &str,
        user_id: UserId,
        event_id: EventId,
    ) -> Result<bool, StoreError> {
        sqlx::query_scalar(
            r"
            SELECT EXISTS (
                SELECT 1 FROM transactions
                WHERE voucher_used = $1 AND user_id = $2 AND event_id = $3
                  AND compensated_at IS NULL
            )
            ",
        )
        .bind(code)
        .bind(user_id.get())
        .bind(event_id.get())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_error)
    }

    async fn take_voucher(&mut self, code: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE vouchers SET remaining_qty = remaining_qty - 1
            WHERE code = $1 AND remaining_qty > 0
            ",
        )
        .bind(code)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn restore_voucher(&mut self, code: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE vouchers SET remaining_qty = remaining_qty + 1 WHERE code = $1")
            .bind(code)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn find_points(&mut self, user_id: UserId) -> Result<Option<PointBalance>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, amount, expires_at FROM point_balances WHERE user_id = $1",
        )
        .bind(user_id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            Ok(PointBalance {
                user_id: UserId::new(col(&row, "user_id")?),
                amount: Money::new(col(&row, "amount")?),
                expires_at: col(&row, "expires_at")?,
            })
        })
        .transpose()
    }

    async fn debit_points(&mut self, user_id: UserId, amount: Money) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE point_balances SET amount = amount - $2
            WHERE user_id = $1 AND amount >= $2
            ",
        )
        .bind(user_id.get())
        .bind(amount.amount())
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn credit_points(&mut self, user_id: UserId, amount: Money) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO point_balances (user_id, amount) VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET amount = point_balances.amount + EXCLUDED.amount
            ",
        )
        .bind(user_id.get())
        .bind(amount.amount())
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn insert_transaction(
        &mut self,
        transaction: &Transaction,
        details: &[TransactionDetail],
    ) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r"
            INSERT INTO transactions ({TRANSACTION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "
        ))
        .bind(*transaction.uuid.as_uuid())
        .bind(transaction.user_id.get())
        .bind(transaction.event_id.get())
        .bind(transaction.subtotal.amount())
        .bind(transaction.voucher_discount.amount())
        .bind(transaction.coupon_discount.amount())
        .bind(transaction.total_amount.amount())
        .bind(transaction.status.as_str())
        .bind(transaction.referral_coupon_used.as_deref())
        .bind(transaction.voucher_used.as_deref())
        .bind(transaction.use_points)
        .bind(transaction.points_used.amount())
        .bind(transaction.payment_proof.as_deref())
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .bind(transaction.compensated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        for (line_no, detail) in details.iter().enumerate() {
            let line_no = i32::try_from(line_no)
                .map_err(|_| StoreError::Corrupt(format!("line number {line_no} out of range")))?;
            sqlx::query(
                r"
                INSERT INTO transaction_details (transaction_uuid, line_no, ticket_id, qty)
                VALUES ($1, $2, $3, $4)
                ",
            )
            .bind(*detail.transaction_uuid.as_uuid())
            .bind(line_no)
            .bind(detail.ticket_id.get())
            .bind(qty_to_db(detail.qty)?)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error)?;
        }

        Ok(())
    }

    async fn find_transaction(
        &mut self,
        uuid: TransactionId,
    ) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE uuid = $1"
        ))
        .bind(*uuid.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error)?;

        row.as_ref().map(row_to_transaction).transpose()
    }

    async fn find_details(
        &mut self,
        uuid: TransactionId,
    ) -> Result<Vec<TransactionDetail>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT transaction_uuid, ticket_id, qty
            FROM transaction_details
            WHERE transaction_uuid = $1
            ORDER BY line_no
            ",
        )
        .bind(*uuid.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_detail).collect()
    }

    async fn transition_status(&mut self, change: &StatusChange) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE transactions
            SET status = $3,
                payment_proof = COALESCE($4, payment_proof),
                updated_at = $5
            WHERE uuid = $1 AND status = $2
            ",
        )
        .bind(*change.uuid.as_uuid())
        .bind(change.from.as_str())
        .bind(change.to.as_str())
        .bind(change.payment_proof.as_deref())
        .bind(change.at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_compensated(
        &mut self,
        uuid: TransactionId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE transactions SET compensated_at = $2
            WHERE uuid = $1 AND compensated_at IS NULL
            ",
        )
        .bind(*uuid.as_uuid())
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn event_owners(&mut self, uuid: TransactionId) -> Result<Vec<OrganizerId>, StoreError> {
        let owners: Vec<i64> = sqlx::query_scalar(
            r"
            SELECT DISTINCT e.organizer_id
            FROM transaction_details d
            JOIN tickets k ON k.id = d.ticket_id
            JOIN events e ON e.id = k.event_id
            WHERE d.transaction_uuid = $1
            ",
        )
        .bind(*uuid.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error)?;

        Ok(owners.into_iter().map(OrganizerId::new).collect())
    }

    async fn enqueue_job(&mut self, request: &JobRequest) -> Result<(), StoreError> {
        let max_attempts = to_i32(request.max_attempts).map_err(queue_error)?;
        let backoff_ms = backoff_to_db(request.backoff).map_err(queue_error)?;

        let result = sqlx::query(
            r"
            INSERT INTO scheduled_jobs (id, kind, transaction_uuid, run_at, max_attempts, backoff_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (kind, transaction_uuid) DO NOTHING
            ",
        )
        .bind(Uuid::new_v4())
        .bind(request.kind.as_str())
        .bind(*request.payload.uuid.as_uuid())
        .bind(request.run_at)
        .bind(max_attempts)
        .bind(backoff_ms)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            tracing::debug!(key = %request.key(), "Job already scheduled");
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(db_error)
    }
}

fn row_to_transaction(row: &PgRow) -> Result<Transaction, StoreError> {
    let status: String = col(row, "status")?;
    Ok(Transaction {
        uuid: TransactionId::from_uuid(col(row, "uuid")?),
        user_id: UserId::new(col(row, "user_id")?),
        event_id: EventId::new(col(row, "event_id")?),
        subtotal: Money::new(col(row, "subtotal")?),
        voucher_discount: Money::new(col(row, "voucher_discount")?),
        coupon_discount: Money::new(col(row, "coupon_discount")?),
        total_amount: Money::new(col(row, "total_amount")?),
        status: status
            .parse()
            .map_err(|e: boxoffice_core::types::UnknownStatus| StoreError::Corrupt(e.to_string()))?,
        referral_coupon_used: col(row, "referral_coupon_used")?,
        voucher_used: col(row, "voucher_used")?,
        use_points: col(row, "use_points")?,
        points_used: Money::new(col(row, "points_used")?),
        payment_proof: col(row, "payment_proof")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
        compensated_at: col(row, "compensated_at")?,
    })
}

fn row_to_detail(row: &PgRow) -> Result<TransactionDetail, StoreError> {
    Ok(TransactionDetail {
        transaction_uuid: TransactionId::from_uuid(col(row, "transaction_uuid")?),
        ticket_id: TicketId::new(col(row, "ticket_id")?),
        qty: qty_from_db(col(row, "qty")?)?,
    })
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Corrupt(format!("{name}: {e}")))
}

fn qty_to_db(qty: u32) -> Result<i32, StoreError> {
    i32::try_from(qty).map_err(|_| StoreError::Corrupt(format!("quantity {qty} out of range")))
}

fn qty_from_db(qty: i32) -> Result<u32, StoreError> {
    u32::try_from(qty).map_err(|_| StoreError::Corrupt(format!("negative quantity {qty}")))
}

fn queue_error(error: QueueError) -> StoreError {
    StoreError::Corrupt(error.to_string())
}

fn db_error(error: sqlx::Error) -> StoreError {
    match error.as_database_error() {
        Some(db) if db.is_unique_violation() => StoreError::Duplicate(db.message().to_string()),
        _ => StoreError::Database(error.to_string()),
    }
}
