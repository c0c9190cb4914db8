//! Order-level discount arithmetic.
//!
//! Discounts are applied once per order against the subtotal, in the order
//! voucher → coupon → points. Each step is capped at what is still owed, so
//! the payable amount can never go below zero and any surplus is dropped.

use crate::error::EngineError;
use crate::types::Money;

/// Discount amounts offered to an order before capping
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiscountOffer {
    /// Voucher face value
    pub voucher: Money,
    /// Referral coupon face value
    pub coupon: Money,
    /// Points the buyer may spend
    pub points: Money,
}

/// How a subtotal was reduced to the payable amount
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscountBreakdown {
    /// Σ price × qty
    pub subtotal: Money,
    /// Voucher discount applied
    pub voucher: Money,
    /// Coupon discount applied
    pub coupon: Money,
    /// Points consumed
    pub points: Money,
    /// What the buyer pays
    pub payable: Money,
}

impl DiscountBreakdown {
    /// Total discount applied
    #[must_use]
    pub const fn total_discount(&self) -> Money {
        Money::new(self.voucher.amount() + self.coupon.amount() + self.points.amount())
    }
}

/// Apply `offer` to `subtotal`.
///
/// # Errors
///
/// Returns [`EngineError::Invariant`] if the subtotal or any offered amount is
/// negative, or if the result would be negative. Neither can happen for
/// amounts read from the store.
pub fn compose(subtotal: Money, offer: DiscountOffer) -> Result<DiscountBreakdown, EngineError> {
    for (label, amount) in [
        ("subtotal", subtotal),
        ("voucher", offer.voucher),
        ("coupon", offer.coupon),
        ("points", offer.points),
    ] {
        if amount.amount() < 0 {
            return Err(EngineError::Invariant(format!(
                "{label} amount is negative: {amount}"
            )));
        }
    }

    let voucher = offer.voucher.min(subtotal);
    let after_voucher = subtotal.floored_sub(voucher);

    let coupon = offer.coupon.min(after_voucher);
    let after_coupon = after_voucher.floored_sub(coupon);

    let points = offer.points.min(after_coupon);
    let payable = after_coupon.floored_sub(points);

    let breakdown = DiscountBreakdown {
        subtotal,
        voucher,
        coupon,
        points,
        payable,
    };

    if payable.amount() < 0 || breakdown.total_discount().checked_add(payable) != Some(subtotal) {
        return Err(EngineError::Invariant(format!(
            "discounts {} do not reconcile with subtotal {subtotal}",
            breakdown.total_discount()
        )));
    }

    Ok(breakdown)
}
