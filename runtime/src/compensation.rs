//! Handing back everything an order consumed.

use crate::inventory::InventoryLedger;
use boxoffice_core::EngineError;
use boxoffice_core::store::UnitOfWork;
use boxoffice_core::types::{Money, Transaction};
use chrono::{DateTime, Utc};

/// What a call to [`CompensationEngine::revert`] handed back
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompensationReport {
    /// Whether anything was handed back; `false` if an earlier revert already ran
    pub applied: bool,
    /// Ticket units returned to stock
    pub units_released: u32,
    /// Coupon returned to the unclaimed pool
    pub coupon_released: Option<String>,
    /// Voucher whose quota was restored
    pub voucher_restored: Option<String>,
    /// Points credited back
    pub points_refunded: Money,
}

/// Reverts the resource consumption of a transaction.
///
/// Runs inside the same unit of work as the status change that triggers it.
/// The `compensated_at` marker is set with a conditional update first, so a
/// second revert of the same transaction is a reported no-op. Rows are then
/// touched in the same order an order takes them: tickets by id, voucher,
/// coupon, points.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompensationEngine {
    inventory: InventoryLedger,
}

impl CompensationEngine {
    /// Creates a new `CompensationEngine`
    #[must_use]
    pub const fn new(inventory: InventoryLedger) -> Self {
        Self { inventory }
    }

    /// Release stock, coupon, voucher and points consumed by `transaction`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] on backend failure; the caller's unit
    /// of work then rolls back.
    pub async fn revert(
        &self,
        uow: &mut dyn UnitOfWork,
        transaction: &Transaction,
        now: DateTime<Utc>,
    ) -> Result<CompensationReport, EngineError> {
        let uuid = transaction.uuid;

        if !uow.mark_compensated(uuid, now).await? {
            tracing::info!(%uuid, "Transaction already compensated, skipping");
            return Ok(CompensationReport::default());
        }

        let mut report = CompensationReport {
            applied: true,
            ..CompensationReport::default()
        };

        let mut details = uow.find_details(uuid).await?;
        details.sort_by_key(|detail| detail.ticket_id);
        for detail in details {
            self.inventory
                .release(uow, detail.ticket_id, detail.qty)
                .await?;
            report.units_released += detail.qty;
        }

        if let Some(code) = &transaction.voucher_used {
            uow.restore_voucher(code).await?;
            report.voucher_restored = Some(code.clone());
        }

        if let Some(code) = &transaction.referral_coupon_used {
            uow.unclaim_coupon(code).await?;
            report.coupon_released = Some(code.clone());
        }

        // The balance keeps its expiry; points refunded to a lapsed balance stay unusable
        if transaction.points_used.amount() > 0 {
            uow.credit_points(transaction.user_id, transaction.points_used)
                .await?;
            report.points_refunded = transaction.points_used;
        }

        tracing::info!(
            %uuid,
            units = report.units_released,
            coupon = ?report.coupon_released,
            voucher = ?report.voucher_restored,
            points = %report.points_refunded,
            "Transaction compensated"
        );

        Ok(report)
    }
}
