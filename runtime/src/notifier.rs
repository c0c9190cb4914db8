//! Buyer notifications.

use async_trait::async_trait;
use boxoffice_core::ports::{Notification, Notifier, NotifyError};
use boxoffice_core::types::{EventOwnership, Transaction, TransactionStatus, UserContact};
use serde_json::json;

/// Template of the acceptance email
pub const ACCEPTED_TEMPLATE: &str = "accepted-transaction-email";
/// Template of the rejection email
pub const REJECTED_TEMPLATE: &str = "rejected-transaction-email";
/// Template of the payment-deadline email
pub const EXPIRED_TEMPLATE: &str = "expired-transaction-email";
/// Template of the organizer-timeout email
pub const CANCELED_TEMPLATE: &str = "canceled-transaction-email";
/// Template of the post-acceptance reminder
pub const FOLLOWUP_TEMPLATE: &str = "transaction-followup-email";

/// Buyer-facing message kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuyerMessage {
    /// Organizer accepted the payment
    Accepted,
    /// Organizer rejected the payment
    Rejected,
    /// No proof before the payment deadline
    Expired,
    /// Organizer did not answer in time
    Canceled,
    /// Reminder after acceptance
    Followup,
}

impl BuyerMessage {
    /// The message announcing that a transaction reached `status`
    #[must_use]
    pub const fn for_status(status: TransactionStatus) -> Option<Self> {
        match status {
            TransactionStatus::Done => Some(Self::Accepted),
            TransactionStatus::Rejected => Some(Self::Rejected),
            TransactionStatus::Expired => Some(Self::Expired),
            TransactionStatus::Canceled => Some(Self::Canceled),
            TransactionStatus::WaitingForPayment | TransactionStatus::WaitingConfirmation => None,
        }
    }

    /// Template identifier
    #[must_use]
    pub const fn template(self) -> &'static str {
        match self {
            Self::Accepted => ACCEPTED_TEMPLATE,
            Self::Rejected => REJECTED_TEMPLATE,
            Self::Expired => EXPIRED_TEMPLATE,
            Self::Canceled => CANCELED_TEMPLATE,
            Self::Followup => FOLLOWUP_TEMPLATE,
        }
    }

    /// Subject line
    #[must_use]
    pub const fn subject(self) -> &'static str {
        match self {
            Self::Accepted => "Your transaction has been accepted",
            Self::Rejected => "Your transaction has been rejected",
            Self::Expired => "Your transaction has expired",
            Self::Canceled => "Your transaction has been canceled",
            Self::Followup => "How was your event?",
        }
    }

    /// Render the notification for `transaction`.
    ///
    /// `events` are the events referenced by the order; their names are
    /// joined for the `eventName` field.
    #[must_use]
    pub fn render(
        self,
        contact: &UserContact,
        transaction: &Transaction,
        events: &[EventOwnership],
    ) -> Notification {
        let event_name = events
            .iter()
            .map(|event| event.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        Notification {
            recipient: contact.email.clone(),
            subject: self.subject().to_string(),
            template: self.template().to_string(),
            payload: json!({
                "fullName": contact.full_name,
                "transactionId": transaction.uuid,
                "amount": transaction.total_amount.amount(),
                "eventName": event_name,
                "transactionDate": transaction.created_at,
            }),
        }
    }
}

/// Notifier that writes one structured log line per notification
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        tracing::info!(
            recipient = %notification.recipient,
            template = %notification.template,
            subject = %notification.subject,
            payload = %notification.payload,
            "Notification dispatched"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use boxoffice_core::types::{EventId, Money, OrganizerId, TransactionId, UserId};
    use chrono::Utc;

    fn transaction() -> Transaction {
        let now = Utc::now();
        Transaction {
            uuid: TransactionId::new(),
            user_id: UserId::new(7),
            event_id: EventId::new(1),
            subtotal: Money::new(200_000),
            voucher_discount: Money::new(30_000),
            coupon_discount: Money::ZERO,
            total_amount: Money::new(170_000),
            status: TransactionStatus::Done,
            referral_coupon_used: None,
            voucher_used: Some("EARLY".into()),
            use_points: false,
            points_used: Money::ZERO,
            payment_proof: Some("https://assets/proof.png".into()),
            created_at: now,
            updated_at: now,
            compensated_at: None,
        }
    }

    #[test]
    fn only_terminal_statuses_have_a_message() {
        assert_eq!(
            BuyerMessage::for_status(TransactionStatus::Done),
            Some(BuyerMessage::Accepted)
        );
        assert_eq!(
            BuyerMessage::for_status(TransactionStatus::Canceled),
            Some(BuyerMessage::Canceled)
        );
        assert_eq!(BuyerMessage::for_status(TransactionStatus::WaitingForPayment), None);
    }

    #[test]
    fn render_fills_template_payload() {
        let contact = UserContact {
            user_id: UserId::new(7),
            email: "buyer@example.com".into(),
            full_name: "Sam Buyer".into(),
        };
        let events = vec![EventOwnership {
            event_id: EventId::new(1),
            organizer_id: OrganizerId::new(3),
            name: "Jazz Night".into(),
        }];
        let transaction = transaction();

        let notification = BuyerMessage::Accepted.render(&contact, &transaction, &events);

        assert_eq!(notification.recipient, "buyer@example.com");
        assert_eq!(notification.template, ACCEPTED_TEMPLATE);
        assert_eq!(notification.payload["fullName"], "Sam Buyer");
        assert_eq!(notification.payload["amount"], 170_000);
        assert_eq!(notification.payload["eventName"], "Jazz Night");
        assert_eq!(
            notification.payload["transactionId"],
            transaction.uuid.to_string()
        );
    }

    #[tokio::test]
    async fn tracing_notifier_never_fails() {
        let notification = Notification {
            recipient: "buyer@example.com".into(),
            subject: "s".into(),
            template: FOLLOWUP_TEMPLATE.into(),
            payload: serde_json::Value::Null,
        };
        assert!(TracingNotifier.notify(notification).await.is_ok());
    }
}
