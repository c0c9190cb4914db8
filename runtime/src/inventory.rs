//! Ticket stock reservation.
//!
//! The ledger never reads stock and then writes it back: both operations are
//! single conditional statements executed inside the caller's unit of work,
//! so concurrent buyers of the last unit get exactly one winner.

use boxoffice_core::EngineError;
use boxoffice_core::store::UnitOfWork;
use boxoffice_core::types::TicketId;

/// Atomic reserve/release of `tickets.remaining_qty`
#[derive(Debug, Clone, Copy, Default)]
pub struct InventoryLedger;

impl InventoryLedger {
    /// Creates a new `InventoryLedger`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Take `qty` units of `ticket_id` out of stock.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidQuantity`] for `qty == 0`
    /// - [`EngineError::ResourceExhausted`] if fewer than `qty` units remain;
    ///   stock is left untouched
    /// - [`EngineError::Store`] on backend failure
    pub async fn reserve(
        &self,
        uow: &mut dyn UnitOfWork,
        ticket_id: TicketId,
        qty: u32,
    ) -> Result<(), EngineError> {
        if qty == 0 {
            return Err(EngineError::InvalidQuantity { ticket_id });
        }

        if uow.reserve_stock(ticket_id, qty).await? {
            tracing::debug!(%ticket_id, qty, "Stock reserved");
            Ok(())
        } else {
            tracing::info!(%ticket_id, qty, "Insufficient stock");
            Err(EngineError::ResourceExhausted {
                ticket_id,
                requested: qty,
            })
        }
    }

    /// Put `qty` units of `ticket_id` back into stock.
    ///
    /// Only compensation calls this.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] on backend failure.
    pub async fn release(
        &self,
        uow: &mut dyn UnitOfWork,
        ticket_id: TicketId,
        qty: u32,
    ) -> Result<(), EngineError> {
        if qty == 0 {
            return Ok(());
        }
        uow.release_stock(ticket_id, qty).await?;
        tracing::debug!(%ticket_id, qty, "Stock released");
        Ok(())
    }
}
