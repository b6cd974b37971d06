//! Canonical subscription event kinds shared by every store adapter.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of lifecycle signals a billing platform can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Purchased,
    Renewed,
    /// Auto-renew disabled; entitlement continues until period end.
    Canceled,
    Expired,
    GracePeriodEntered,
    Recovered,
    /// Refund or revocation; entitlement ends immediately.
    Revoked,
    Paused,
    Restarted,
    /// Immediate user-initiated cancellation. Never produced by a store adapter.
    CanceledImmediately,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Purchased => "purchased",
            EventKind::Renewed => "renewed",
            EventKind::Canceled => "canceled",
            EventKind::Expired => "expired",
            EventKind::GracePeriodEntered => "grace_period_entered",
            EventKind::Recovered => "recovered",
            EventKind::Revoked => "revoked",
            EventKind::Paused => "paused",
            EventKind::Restarted => "restarted",
            EventKind::CanceledImmediately => "canceled_immediately",
        }
    }

    /// Kinds that can carry a charge and therefore a payment record.
    pub fn is_chargeable(&self) -> bool {
        matches!(
            self,
            EventKind::Purchased | EventKind::Renewed | EventKind::Recovered
        )
    }

    /// Kinds allowed to shorten `current_period_end`.
    pub fn may_shorten_period(&self) -> bool {
        matches!(self, EventKind::Revoked | EventKind::CanceledImmediately)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_revocation_and_immediate_cancel_shorten() {
        assert!(EventKind::Revoked.may_shorten_period());
        assert!(EventKind::CanceledImmediately.may_shorten_period());
        assert!(!EventKind::Canceled.may_shorten_period());
        assert!(!EventKind::Expired.may_shorten_period());
    }

    #[test]
    fn serde_name_matches_as_str() {
        let json = serde_json::to_string(&EventKind::GracePeriodEntered).unwrap();
        assert_eq!(json, format!("\"{}\"", EventKind::GracePeriodEntered.as_str()));
    }
}
