//! Domain types for the transaction engine.
//!
//! This module contains identifiers, money, the persisted entities (tickets,
//! transactions, coupons, vouchers, point balances) and the transaction status
//! machine. Everything here is plain data: no I/O, no clocks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(i64);

        impl $name {
            #[doc = concat!("Creates a `", stringify!($name), "` from its database key")]
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the inner database key
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a ticket type (a priced, stocked row for one event)
    TicketId
);
numeric_id!(
    /// Identifier of an event
    EventId
);
numeric_id!(
    /// Identifier of a buyer
    UserId
);
numeric_id!(
    /// Identifier of an organizer (owner of events)
    OrganizerId
);

/// Unique identifier for a transaction (the order's public identity)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Creates a new random `TransactionId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `TransactionId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Money
// ============================================================================

/// An amount in the smallest unit of the single supported currency.
///
/// Arithmetic is explicit: callers choose between checked operations (order
/// totals) and flooring operations (discount application).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    /// Zero
    pub const ZERO: Self = Self(0);

    /// Creates an amount
    #[must_use]
    pub const fn new(amount: i64) -> Self {
        Self(amount)
    }

    /// Get the raw amount
    #[must_use]
    pub const fn amount(self) -> i64 {
        self.0
    }

    /// Whether the amount is exactly zero
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// `self + other`, or `None` on overflow
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// `self - other`, or `None` on overflow
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// `self × qty`, or `None` on overflow
    #[must_use]
    pub const fn checked_mul(self, qty: u32) -> Option<Self> {
        match self.0.checked_mul(qty as i64) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// `self - other`, floored at zero
    #[must_use]
    pub const fn floored_sub(self, other: Self) -> Self {
        let v = self.0.saturating_sub(other.0);
        if v < 0 { Self::ZERO } else { Self(v) }
    }

    /// The smaller of two amounts
    #[must_use]
    pub const fn min(self, other: Self) -> Self {
        if self.0 <= other.0 { self } else { other }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Transaction status machine
// ============================================================================

/// Lifecycle status of a transaction.
///
/// ```text
/// WAITING_FOR_PAYMENT ──submit proof──▶ WAITING_CONFIRMATION ──accept──▶ DONE
///        │                                   │        └──reject──▶ REJECTED
///        └──payment deadline──▶ EXPIRED       └──response deadline──▶ CANCELED
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Created, stock reserved, waiting for the buyer's proof of payment
    WaitingForPayment,
    /// Proof uploaded, waiting for the organizer
    WaitingConfirmation,
    /// Accepted by the organizer
    Done,
    /// Rejected by the organizer
    Rejected,
    /// Payment deadline passed without proof
    Expired,
    /// Organizer did not answer before the response deadline
    Canceled,
}

impl TransactionStatus {
    /// Every status, in lifecycle order
    pub const ALL: [Self; 6] = [
        Self::WaitingForPayment,
        Self::WaitingConfirmation,
        Self::Done,
        Self::Rejected,
        Self::Expired,
        Self::Canceled,
    ];

    /// Database / wire representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WaitingForPayment => "WAITING_FOR_PAYMENT",
            Self::WaitingConfirmation => "WAITING_CONFIRMATION",
            Self::Done => "DONE",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Canceled => "CANCELED",
        }
    }

    /// No transition is permitted out of a terminal status
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Rejected | Self::Expired | Self::Canceled
        )
    }

    /// Status reached by applying `transition`, or `None` if it is not allowed
    #[must_use]
    pub const fn apply(self, transition: Transition) -> Option<Self> {
        if matches!(
            (self, transition.source()),
            (Self::WaitingForPayment, Self::WaitingForPayment)
                | (Self::WaitingConfirmation, Self::WaitingConfirmation)
        ) {
            Some(transition.target())
        } else {
            None
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status string is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown transaction status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TransactionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// The five edges of the status machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Buyer uploaded a proof of payment
    SubmitProof,
    /// Organizer accepted the payment
    Accept,
    /// Organizer rejected the payment
    Reject,
    /// The `expire-transaction` timer fired
    PaymentDeadline,
    /// The `organization-response` timer fired
    ConfirmationDeadline,
}

impl Transition {
    /// Every transition
    pub const ALL: [Self; 5] = [
        Self::SubmitProof,
        Self::Accept,
        Self::Reject,
        Self::PaymentDeadline,
        Self::ConfirmationDeadline,
    ];

    /// The only status this transition may start from
    #[must_use]
    pub const fn source(self) -> TransactionStatus {
        match self {
            Self::SubmitProof | Self::PaymentDeadline => TransactionStatus::WaitingForPayment,
            Self::Accept | Self::Reject | Self::ConfirmationDeadline => {
                TransactionStatus::WaitingConfirmation
            },
        }
    }

    /// The status this transition lands in
    #[must_use]
    pub const fn target(self) -> TransactionStatus {
        match self {
            Self::SubmitProof => TransactionStatus::WaitingConfirmation,
            Self::Accept => TransactionStatus::Done,
            Self::Reject => TransactionStatus::Rejected,
            Self::PaymentDeadline => TransactionStatus::Expired,
            Self::ConfirmationDeadline => TransactionStatus::Canceled,
        }
    }

    /// Whether landing in the target status hands reserved resources back
    #[must_use]
    pub const fn compensates(self) -> bool {
        matches!(
            self,
            Self::Reject | Self::PaymentDeadline | Self::ConfirmationDeadline
        )
    }
}

/// Organizer decision on a transaction waiting for confirmation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveAction {
    /// Payment is valid, keep the tickets
    Accept,
    /// Payment is invalid, hand everything back
    Reject,
}

impl ResolveAction {
    /// The status-machine edge for this decision
    #[must_use]
    pub const fn transition(self) -> Transition {
        match self {
            Self::Accept => Transition::Accept,
            Self::Reject => Transition::Reject,
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A priced ticket type with a finite stock
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket id
    pub id: TicketId,
    /// Event the ticket admits to
    pub event_id: EventId,
    /// Unit price
    pub price: Money,
    /// Units still for sale; never negative
    pub remaining_qty: u32,
}

/// Ownership and display data of an event, read-only to the engine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOwnership {
    /// Event id
    pub event_id: EventId,
    /// Organizer that owns the event
    pub organizer_id: OrganizerId,
    /// Display name
    pub name: String,
}

/// Where to send a buyer's notifications
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContact {
    /// User id
    pub user_id: UserId,
    /// Email address
    pub email: String,
    /// Full name for greetings
    pub full_name: String,
}

/// A single-use referral coupon
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralCoupon {
    /// Coupon code
    pub code: String,
    /// Discount granted
    pub amount: Money,
    /// Held by a live or completed transaction
    pub is_claimed: bool,
    /// Coupon is unusable after this instant
    pub expires_at: Option<DateTime<Utc>>,
}

/// An event-scoped promotional voucher with a finite quota
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    /// Voucher code
    pub code: String,
    /// Event the voucher is valid for
    pub event_id: EventId,
    /// Discount granted per order
    pub discount_amount: Money,
    /// Uses left
    pub remaining_qty: u32,
    /// Start of the validity window (inclusive)
    pub starts_at: DateTime<Utc>,
    /// End of the validity window (exclusive)
    pub ends_at: DateTime<Utc>,
}

impl Voucher {
    /// Whether `now` falls inside `[starts_at, ends_at)`
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now < self.ends_at
    }
}

/// Loyalty points held by a user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointBalance {
    /// Owner
    pub user_id: UserId,
    /// Points, worth one currency unit each
    pub amount: Money,
    /// Points are unusable after this instant
    pub expires_at: Option<DateTime<Utc>>,
}

impl PointBalance {
    /// Points that may be spent at `now`
    #[must_use]
    pub fn usable_at(&self, now: DateTime<Utc>) -> Money {
        match self.expires_at {
            Some(expiry) if expiry <= now => Money::ZERO,
            _ if self.amount.amount() > 0 => self.amount,
            _ => Money::ZERO,
        }
    }
}

/// A purchase order and its lifecycle status.
///
/// Only `status`, `payment_proof`, `updated_at` and `compensated_at` change
/// after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Public identity
    pub uuid: TransactionId,
    /// Buyer
    pub user_id: UserId,
    /// Event scope the order was placed against
    pub event_id: EventId,
    /// Σ price × qty before discounts
    pub subtotal: Money,
    /// Voucher discount actually applied
    pub voucher_discount: Money,
    /// Coupon discount actually applied
    pub coupon_discount: Money,
    /// Amount the buyer has to pay
    pub total_amount: Money,
    /// Current status
    pub status: TransactionStatus,
    /// Referral coupon claimed by this order
    pub referral_coupon_used: Option<String>,
    /// Voucher consumed by this order
    pub voucher_used: Option<String>,
    /// Whether the buyer asked to spend points
    pub use_points: bool,
    /// Points actually debited
    pub points_used: Money,
    /// Opaque proof-of-payment reference
    pub payment_proof: Option<String>,
    /// When the order was placed
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    /// Set once when consumed resources were handed back
    pub compensated_at: Option<DateTime<Utc>>,
}

/// One ticket line of a transaction; fixed at creation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDetail {
    /// Owning transaction
    pub transaction_uuid: TransactionId,
    /// Ticket bought
    pub ticket_id: TicketId,
    /// Units bought
    pub qty: u32,
}

/// A transaction together with its lines
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// The transaction row
    pub transaction: Transaction,
    /// Its ticket lines
    pub details: Vec<TransactionDetail>,
}

// ============================================================================
// Requests
// ============================================================================

/// A (ticket, quantity) pair within one purchase order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Ticket to buy
    pub ticket_id: TicketId,
    /// Units to buy
    pub qty: u32,
}

impl LineItem {
    /// Creates a line item
    #[must_use]
    pub const fn new(ticket_id: TicketId, qty: u32) -> Self {
        Self { ticket_id, qty }
    }
}

/// A buyer's purchase intent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Buyer
    pub user_id: UserId,
    /// Event scope for ticket and voucher validation
    pub event_id: EventId,
    /// What to buy
    pub line_items: Vec<LineItem>,
    /// Referral coupon to claim
    pub referral_coupon: Option<String>,
    /// Voucher to apply
    pub voucher_code: Option<String>,
    /// Spend loyalty points
    pub use_points: bool,
}

impl OrderRequest {
    /// An order without discounts
    #[must_use]
    pub const fn new(user_id: UserId, event_id: EventId, line_items: Vec<LineItem>) -> Self {
        Self {
            user_id,
            event_id,
            line_items,
            referral_coupon: None,
            voucher_code: None,
            use_points: false,
        }
    }

    /// Attach a referral coupon
    #[must_use]
    pub fn with_coupon(mut self, code: impl Into<String>) -> Self {
        self.referral_coupon = Some(code.into());
        self
    }

    /// Attach a voucher
    #[must_use]
    pub fn with_voucher(mut self, code: impl Into<String>) -> Self {
        self.voucher_code = Some(code.into());
        self
    }

    /// Spend loyalty points
    #[must_use]
    pub const fn with_points(mut self) -> Self {
        self.use_points = true;
        self
    }
}
