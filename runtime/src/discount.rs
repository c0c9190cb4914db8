//! Coupon, voucher and loyalty-point resolution.
//!
//! Resolution happens in two steps inside the order's unit of work:
//!
//! 1. [`DiscountResolver::quote`] validates every requested discount and
//!    reads its face value.
//! 2. [`DiscountResolver::apply`] caps the amounts against the subtotal
//!    ([`compose`]) and consumes them with conditional updates. A consumer
//!    that lost a race to another order fails the same way validation would.

use boxoffice_core::discount::{DiscountBreakdown, DiscountOffer, compose};
use boxoffice_core::store::UnitOfWork;
use boxoffice_core::types::{EventId, Money, OrderRequest, UserId};
use boxoffice_core::{CouponRejection, EngineError, VoucherRejection};
use chrono::{DateTime, Utc};

/// Discounts validated for one order, before capping
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscountQuote {
    /// Coupon code and face value
    pub coupon: Option<(String, Money)>,
    /// Voucher code and face value
    pub voucher: Option<(String, Money)>,
    /// Usable point balance, zero if points were not requested
    pub points: Money,
}

impl DiscountQuote {
    /// Face values as an offer for [`compose`]
    #[must_use]
    pub fn offer(&self) -> DiscountOffer {
        DiscountOffer {
            voucher: self.voucher.as_ref().map_or(Money::ZERO, |(_, amount)| *amount),
            coupon: self.coupon.as_ref().map_or(Money::ZERO, |(_, amount)| *amount),
            points: self.points,
        }
    }
}

/// Validates and composes stacked discounts
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscountResolver;

impl DiscountResolver {
    /// Creates a new `DiscountResolver`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Face value of a referral coupon, or zero if none was given.
    ///
    /// # Errors
    ///
    /// [`EngineError::CouponInvalid`] if the coupon is missing, claimed or expired.
    pub async fn resolve_coupon(
        &self,
        uow: &mut dyn UnitOfWork,
        code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Money, EngineError> {
        let Some(code) = code else {
            return Ok(Money::ZERO);
        };

        let reject = |reason| EngineError::CouponInvalid {
            code: code.to_string(),
            reason,
        };

        let coupon = uow
            .find_coupon(code)
            .await?
            .ok_or_else(|| reject(CouponRejection::NotFound))?;

        if coupon.is_claimed {
            return Err(reject(CouponRejection::AlreadyClaimed));
        }
        if coupon.expires_at.is_some_and(|expiry| expiry <= now) {
            return Err(reject(CouponRejection::Expired));
        }

        Ok(coupon.amount)
    }

    /// Discount of a voucher for this buyer and event, or zero if none was given.
    ///
    /// # Errors
    ///
    /// [`EngineError::VoucherInvalid`] if the voucher is missing or scoped to
    /// another event, its quota is used up, `now` is outside its window, or
    /// the buyer already holds a live order with it.
    pub async fn resolve_voucher(
        &self,
        uow: &mut dyn UnitOfWork,
        code: Option<&str>,
        user_id: UserId,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> Result<Money, EngineError> {
        let Some(code) = code else {
            return Ok(Money::ZERO);
        };

        let reject = |reason| EngineError::VoucherInvalid {
            code: code.to_string(),
            reason,
        };

        let voucher = uow
            .find_voucher(code)
            .await?
            .filter(|voucher| voucher.event_id == event_id)
            .ok_or_else(|| reject(VoucherRejection::NotFound))?;

        if voucher.remaining_qty == 0 {
            return Err(reject(VoucherRejection::QuotaExhausted));
        }
        if !voucher.is_valid_at(now) {
            return Err(reject(VoucherRejection::OutsideWindow));
        }
        if uow.voucher_used_by(code, user_id, event_id).await? {
            return Err(reject(VoucherRejection::AlreadyUsed));
        }

        Ok(voucher.discount_amount)
    }

    /// Usable, unexpired points, or zero if the buyer did not ask for them.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoPointsAvailable`] if points were requested and none are usable.
    pub async fn resolve_points(
        &self,
        uow: &mut dyn UnitOfWork,
        user_id: UserId,
        wants_points: bool,
        now: DateTime<Utc>,
    ) -> Result<Money, EngineError> {
        if !wants_points {
            return Ok(Money::ZERO);
        }

        let usable = uow
            .find_points(user_id)
            .await?
            .map_or(Money::ZERO, |balance| balance.usable_at(now));

        if usable.is_zero() {
            return Err(EngineError::NoPointsAvailable(user_id));
        }
        Ok(usable)
    }

    /// Validate every discount the order asks for.
    ///
    /// # Errors
    ///
    /// The first validation failure among voucher, coupon and points.
    pub async fn quote(
        &self,
        uow: &mut dyn UnitOfWork,
        request: &OrderRequest,
        now: DateTime<Utc>,
    ) -> Result<DiscountQuote, EngineError> {
        let voucher_code = normalized(request.voucher_code.as_deref());
        let coupon_code = normalized(request.referral_coupon.as_deref());

        let voucher = self
            .resolve_voucher(uow, voucher_code, request.user_id, request.event_id, now)
            .await?;
        let coupon = self.resolve_coupon(uow, coupon_code, now).await?;
        let points = self
            .resolve_points(uow, request.user_id, request.use_points, now)
            .await?;

        Ok(DiscountQuote {
            coupon: coupon_code.map(|code| (code.to_string(), coupon)),
            voucher: voucher_code.map(|code| (code.to_string(), voucher)),
            points,
        })
    }

    /// Cap the quote against `subtotal` and consume the discounts.
    ///
    /// The coupon is claimed and the voucher quota taken whenever they were
    /// requested, even if capping leaves nothing of their value; only the
    /// points actually needed are debited.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Invariant`] if the amounts do not reconcile
    /// - the matching `*Invalid` / `NoPointsAvailable` error if a concurrent
    ///   order consumed the discount first
    pub async fn apply(
        &self,
        uow: &mut dyn UnitOfWork,
        user_id: UserId,
        quote: &DiscountQuote,
        subtotal: Money,
    ) -> Result<DiscountBreakdown, EngineError> {
        let breakdown = compose(subtotal, quote.offer())?;

        if let Some((code, _)) = &quote.voucher {
            if !uow.take_voucher(code).await? {
                return Err(EngineError::VoucherInvalid {
                    code: code.clone(),
                    reason: VoucherRejection::QuotaExhausted,
                });
            }
        }

        if let Some((code, _)) = &quote.coupon {
            if !uow.claim_coupon(code).await? {
                return Err(EngineError::CouponInvalid {
                    code: code.clone(),
                    reason: CouponRejection::AlreadyClaimed,
                });
            }
        }

        if !breakdown.points.is_zero() && !uow.debit_points(user_id, breakdown.points).await? {
            return Err(EngineError::NoPointsAvailable(user_id));
        }

        Ok(breakdown)
    }
}

fn normalized(code: Option<&str>) -> Option<&str> {
    code.map(str::trim).filter(|code| !code.is_empty())
}
