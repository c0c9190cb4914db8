//! Static deadlines and retry settings of the lifecycle.

use crate::retry::RetryPolicy;
use std::time::Duration;

/// Deadlines are configuration, never per-request.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleConfig {
    /// Time from order creation until `expire-transaction` fires
    pub payment_window: Duration,
    /// Time from order creation until `organization-response` fires
    pub confirmation_window: Duration,
    /// Time from acceptance until `organizer-followup` fires
    pub followup_delay: Duration,
    /// Attempts and backoff of every scheduled job
    pub retry: RetryPolicy,
}

impl LifecycleConfig {
    /// 2 hours
    pub const DEFAULT_PAYMENT_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);
    /// 3 days
    pub const DEFAULT_CONFIRMATION_WINDOW: Duration = Duration::from_secs(3 * 24 * 60 * 60);
    /// 5 days
    pub const DEFAULT_FOLLOWUP_DELAY: Duration = Duration::from_secs(5 * 24 * 60 * 60);
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            payment_window: Self::DEFAULT_PAYMENT_WINDOW,
            confirmation_window: Self::DEFAULT_CONFIRMATION_WINDOW,
            followup_delay: Self::DEFAULT_FOLLOWUP_DELAY,
            retry: RetryPolicy::default(),
        }
    }
}
