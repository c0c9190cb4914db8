//! Error taxonomy of the public operations.
//!
//! Every [`EngineError`] maps to one stable [`ErrorKind`] and one stable
//! machine-readable code, so the HTTP layer can translate without matching on
//! messages.

use crate::jobs::QueueError;
use crate::ports::AssetError;
use crate::store::StoreError;
use crate::types::{
    EventId, OrganizerId, TicketId, TransactionId, TransactionStatus, UserId,
};
use std::fmt;
use thiserror::Error;

/// Coarse error category exposed to callers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input
    Validation,
    /// Missing ticket, transaction, coupon, voucher or user
    NotFound,
    /// Operation invalid for the current status
    State,
    /// Actor does not own the referenced event
    Authorization,
    /// Insufficient stock, exhausted voucher, no points
    ResourceExhausted,
    /// Would break an arithmetic invariant; unreachable by construction
    Invariant,
    /// Store, queue or asset backend failure
    Infrastructure,
}

impl ErrorKind {
    /// Stable name of the category
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "ValidationError",
            Self::NotFound => "NotFoundError",
            Self::State => "StateError",
            Self::Authorization => "AuthorizationError",
            Self::ResourceExhausted => "ResourceExhaustedError",
            Self::Invariant => "InvariantError",
            Self::Infrastructure => "InfrastructureError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a referral coupon was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CouponRejection {
    /// No coupon with that code
    NotFound,
    /// Held by another transaction
    AlreadyClaimed,
    /// Past its expiry
    Expired,
}

impl fmt::Display for CouponRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "not found",
            Self::AlreadyClaimed => "already claimed",
            Self::Expired => "expired",
        })
    }
}

/// Why a voucher was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoucherRejection {
    /// No voucher with that code for this event
    NotFound,
    /// Quota used up
    QuotaExhausted,
    /// Outside `[starts_at, ends_at)`
    OutsideWindow,
    /// The buyer already holds a live order with this voucher
    AlreadyUsed,
}

impl fmt::Display for VoucherRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "not found",
            Self::QuotaExhausted => "quota exhausted",
            Self::OutsideWindow => "outside validity window",
            Self::AlreadyUsed => "already used by this user",
        })
    }
}

/// Errors returned by the transaction engine's public operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Order has no line items
    #[error("order must contain at least one line item")]
    EmptyOrder,

    /// Line item with a zero quantity
    #[error("line item for ticket {ticket_id} has zero quantity")]
    InvalidQuantity {
        /// Offending ticket
        ticket_id: TicketId,
    },

    /// Ticket belongs to another event than the order's scope
    #[error("ticket {ticket_id} does not belong to event {event_id}")]
    TicketOutsideEvent {
        /// Offending ticket
        ticket_id: TicketId,
        /// Order's event scope
        event_id: EventId,
    },

    /// Blank proof-of-payment reference
    #[error("payment proof reference must not be empty")]
    EmptyPaymentProof,

    /// Ticket does not exist
    #[error("ticket {0} not found")]
    TicketNotFound(TicketId),

    /// Transaction does not exist
    #[error("transaction {0} not found")]
    NotFound(TransactionId),

    /// Not enough stock for a line item
    #[error("insufficient stock for ticket {ticket_id}: requested {requested}")]
    ResourceExhausted {
        /// Ticket that ran out
        ticket_id: TicketId,
        /// Units requested
        requested: u32,
    },

    /// Referral coupon refused
    #[error("referral coupon {code} is invalid: {reason}")]
    CouponInvalid {
        /// Coupon code
        code: String,
        /// Why
        reason: CouponRejection,
    },

    /// Voucher refused
    #[error("voucher {code} is invalid: {reason}")]
    VoucherInvalid {
        /// Voucher code
        code: String,
        /// Why
        reason: VoucherRejection,
    },

    /// Points requested but none usable
    #[error("user {0} has no usable points")]
    NoPointsAvailable(UserId),

    /// Operation not allowed in the transaction's current status
    #[error("transaction {uuid} is {actual}, operation requires {expected}")]
    InvalidState {
        /// Transaction
        uuid: TransactionId,
        /// Status the operation requires
        expected: TransactionStatus,
        /// Status observed
        actual: TransactionStatus,
    },

    /// Organizer resolution attempted before any proof exists
    #[error("transaction {0} has no payment proof")]
    MissingProof(TransactionId),

    /// Organizer does not own every event in the order
    #[error("organizer {organizer_id} may not resolve transaction {uuid}")]
    Unauthorized {
        /// Transaction
        uuid: TransactionId,
        /// Acting organizer
        organizer_id: OrganizerId,
    },

    /// Arithmetic invariant would break
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Proof upload requested but no asset store is wired in
    #[error("asset store is not configured")]
    AssetStoreUnavailable,

    /// Asset store failure
    #[error("asset store error: {0}")]
    Asset(#[from] AssetError),

    /// Persistence failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Job queue failure
    #[error("job queue error: {0}")]
    Queue(#[from] QueueError),
}

impl EngineError {
    /// Category of this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyOrder
            | Self::InvalidQuantity { .. }
            | Self::TicketOutsideEvent { .. }
            | Self::EmptyPaymentProof
            | Self::CouponInvalid {
                reason: CouponRejection::Expired,
                ..
            }
            | Self::VoucherInvalid {
                reason: VoucherRejection::OutsideWindow,
                ..
            } => ErrorKind::Validation,
            Self::TicketNotFound(_)
            | Self::NotFound(_)
            | Self::CouponInvalid {
                reason: CouponRejection::NotFound,
                ..
            }
            | Self::VoucherInvalid {
                reason: VoucherRejection::NotFound,
                ..
            } => ErrorKind::NotFound,
            Self::InvalidState { .. } | Self::MissingProof(_) => ErrorKind::State,
            Self::Unauthorized { .. } => ErrorKind::Authorization,
            Self::ResourceExhausted { .. }
            | Self::NoPointsAvailable(_)
            | Self::CouponInvalid {
                reason: CouponRejection::AlreadyClaimed,
                ..
            }
            | Self::VoucherInvalid {
                reason: VoucherRejection::QuotaExhausted | VoucherRejection::AlreadyUsed,
                ..
            } => ErrorKind::ResourceExhausted,
            Self::Invariant(_) => ErrorKind::Invariant,
            Self::AssetStoreUnavailable | Self::Asset(_) | Self::Store(_) | Self::Queue(_) => {
                ErrorKind::Infrastructure
            },
        }
    }

    /// Stable machine-readable code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::EmptyOrder => "EMPTY_ORDER",
            Self::InvalidQuantity { .. } => "INVALID_QUANTITY",
            Self::TicketOutsideEvent { .. } => "TICKET_OUTSIDE_EVENT",
            Self::EmptyPaymentProof => "EMPTY_PAYMENT_PROOF",
            Self::TicketNotFound(_) => "TICKET_NOT_FOUND",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            Self::CouponInvalid { .. } => "COUPON_INVALID",
            Self::VoucherInvalid { .. } => "VOUCHER_INVALID",
            Self::NoPointsAvailable(_) => "NO_POINTS_AVAILABLE",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::MissingProof(_) => "MISSING_PROOF",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::Invariant(_) => "INVARIANT_VIOLATED",
            Self::AssetStoreUnavailable => "ASSET_STORE_UNAVAILABLE",
            Self::Asset(_) => "ASSET_STORE_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Queue(_) => "QUEUE_ERROR",
        }
    }
}
