//! A seeded world of events, buyers, tickets and discounts.

use crate::mocks::ManualClock;
use crate::ports::{InMemoryAssetStore, RecordingNotifier};
use crate::queue::InMemoryJobQueue;
use crate::store::InMemoryStore;
use boxoffice_core::environment::Clock;
use boxoffice_core::jobs::JobQueue;
use boxoffice_core::ports::{AssetStore, Notifier};
use boxoffice_core::store::TransactionStore;
use boxoffice_core::types::{
    EventId, EventOwnership, LineItem, Money, OrderRequest, OrganizerId, PointBalance,
    ReferralCoupon, Ticket, TicketId, UserContact, UserId, Voucher,
};
use chrono::TimeDelta;
use std::sync::Arc;

/// In-memory ports sharing one manual clock.
///
/// Every field is a cheap handle: clones observe the same state. Jobs
/// enqueued through store units land in [`Self::queue`].
#[derive(Debug, Clone)]
pub struct Fixture {
    /// Relational store
    pub store: InMemoryStore,
    /// Job queue
    pub queue: InMemoryJobQueue,
    /// Notification sink
    pub notifier: RecordingNotifier,
    /// Proof upload store
    pub assets: InMemoryAssetStore,
    /// Time source, starts at 2025-01-01T00:00:00Z
    pub clock: ManualClock,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    /// Event owned by [`Self::ORGANIZER`]
    pub const EVENT: EventId = EventId::new(1);
    /// Event owned by [`Self::OTHER_ORGANIZER`]
    pub const OTHER_EVENT: EventId = EventId::new(2);
    /// Owner of [`Self::EVENT`]
    pub const ORGANIZER: OrganizerId = OrganizerId::new(10);
    /// Owner of [`Self::OTHER_EVENT`]
    pub const OTHER_ORGANIZER: OrganizerId = OrganizerId::new(20);
    /// Buyer with points
    pub const BUYER: UserId = UserId::new(100);
    /// Buyer without points
    pub const OTHER_BUYER: UserId = UserId::new(101);
    /// 100000 per unit, 10 in stock, for [`Self::EVENT`]
    pub const TICKET: TicketId = TicketId::new(1000);
    /// 250000 per unit, 1 in stock, for [`Self::EVENT`]
    pub const VIP_TICKET: TicketId = TicketId::new(1001);
    /// 50000 per unit, 10 in stock, for [`Self::OTHER_EVENT`]
    pub const OTHER_TICKET: TicketId = TicketId::new(2000);
    /// Referral coupon worth 20000
    pub const COUPON: &'static str = "REF-ALICE";
    /// Voucher worth 30000 on [`Self::EVENT`], quota 5
    pub const VOUCHER: &'static str = "EARLYBIRD";
    /// Points held by [`Self::BUYER`]
    pub const POINTS: Money = Money::new(15_000);

    /// Empty ports
    #[must_use]
    pub fn new() -> Self {
        let store = InMemoryStore::new();
        let queue = InMemoryJobQueue::new();
        store.attach_queue(queue.clone());
        Self {
            store,
            queue,
            notifier: RecordingNotifier::default(),
            assets: InMemoryAssetStore::default(),
            clock: ManualClock::default(),
        }
    }

    /// Ports seeded with the constants above
    pub async fn seeded() -> Self {
        let fx = Self::new();
        let now = fx.clock.now();

        for (event_id, organizer_id, name) in [
            (Self::EVENT, Self::ORGANIZER, "Jazz Night"),
            (Self::OTHER_EVENT, Self::OTHER_ORGANIZER, "Rock Fest"),
        ] {
            fx.store
                .add_event(EventOwnership {
                    event_id,
                    organizer_id,
                    name: name.to_string(),
                })
                .await;
        }

        for (user_id, email, full_name) in [
            (Self::BUYER, "alice@example.com", "Alice Buyer"),
            (Self::OTHER_BUYER, "bob@example.com", "Bob Buyer"),
        ] {
            fx.store
                .add_user(UserContact {
                    user_id,
                    email: email.to_string(),
                    full_name: full_name.to_string(),
                })
                .await;
        }

        fx.ticket(Self::TICKET, Self::EVENT, 100_000, 10).await;
        fx.ticket(Self::VIP_TICKET, Self::EVENT, 250_000, 1).await;
        fx.ticket(Self::OTHER_TICKET, Self::OTHER_EVENT, 50_000, 10)
            .await;

        fx.store
            .add_coupon(ReferralCoupon {
                code: Self::COUPON.to_string(),
                amount: Money::new(20_000),
                is_claimed: false,
                expires_at: Some(now + TimeDelta::days(90)),
            })
            .await;

        fx.store
            .add_voucher(Voucher {
                code: Self::VOUCHER.to_string(),
                event_id: Self::EVENT,
                discount_amount: Money::new(30_000),
                remaining_qty: 5,
                starts_at: now - TimeDelta::days(1),
                ends_at: now + TimeDelta::days(30),
            })
            .await;

        fx.store
            .add_points(PointBalance {
                user_id: Self::BUYER,
                amount: Self::POINTS,
                expires_at: Some(now + TimeDelta::days(90)),
            })
            .await;

        fx
    }

    /// Add or replace a ticket
    pub async fn ticket(&self, id: TicketId, event_id: EventId, price: i64, qty: u32) {
        self.store
            .add_ticket(Ticket {
                id,
                event_id,
                price: Money::new(price),
                remaining_qty: qty,
            })
            .await;
    }

    /// [`Self::BUYER`] orders `qty` units of [`Self::TICKET`]
    #[must_use]
    pub fn order(qty: u32) -> OrderRequest {
        OrderRequest::new(
            Self::BUYER,
            Self::EVENT,
            vec![LineItem::new(Self::TICKET, qty)],
        )
    }

    /// The store as a port
    #[must_use]
    pub fn dyn_store(&self) -> Arc<dyn TransactionStore> {
        Arc::new(self.store.clone())
    }

    /// The queue as a port
    #[must_use]
    pub fn dyn_queue(&self) -> Arc<dyn JobQueue> {
        Arc::new(self.queue.clone())
    }

    /// The notifier as a port
    #[must_use]
    pub fn dyn_notifier(&self) -> Arc<dyn Notifier> {
        Arc::new(self.notifier.clone())
    }

    /// The asset store as a port
    #[must_use]
    pub fn dyn_assets(&self) -> Arc<dyn AssetStore> {
        Arc::new(self.assets.clone())
    }

    /// The clock as a port
    #[must_use]
    pub fn dyn_clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }
}
