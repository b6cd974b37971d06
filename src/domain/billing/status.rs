//! Subscription status state machine.
//!
//! This is the single transition table for the ledger. Store adapters
//! produce an [`EventKind`]; [`SubscriptionStatus::resolve`] turns it into a
//! target status and the [`StateMachine`] impl validates the move.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::foundation::{StateMachine, ValidationError};

use super::{EventKind, Store};

/// Lifecycle status of one subscription row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Free trial; entitled until the trial period ends.
    Trial,

    /// Paid and entitled until `current_period_end`.
    Active,

    /// Renewal failed; the store granted a window to recover payment.
    /// Still entitled until the window closes.
    Grace,

    /// Auto-renew disabled. Entitled until `current_period_end`.
    PendingCancellation,

    /// Ended immediately at the user's request. Terminal.
    Canceled,

    /// Period (or grace window) elapsed without renewal. Terminal.
    Expired,

    /// Refunded or revoked by the store. Terminal.
    Refunded,

    /// Mobile-store pause. Not entitled while paused.
    Paused,
}

/// What an incoming event does to a subscription in a given status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Move to the target status (which may equal the current one, e.g. renewal).
    Transition(SubscriptionStatus),
    /// Keep the status; the event may still update flags such as auto-renew.
    Keep,
    /// The row is terminal and the event starts a new billing relationship.
    Supersede,
    /// Late signal for a terminal row; nothing to apply.
    Ignore,
    /// The event is not valid for this status.
    Reject,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 8] = [
        SubscriptionStatus::Trial,
        SubscriptionStatus::Active,
        SubscriptionStatus::Grace,
        SubscriptionStatus::PendingCancellation,
        SubscriptionStatus::Canceled,
        SubscriptionStatus::Expired,
        SubscriptionStatus::Refunded,
        SubscriptionStatus::Paused,
    ];

    /// Statuses that grant entitlement while the period has not ended.
    pub fn grants_entitlement(&self) -> bool {
        use SubscriptionStatus::*;
        matches!(self, Trial | Active | Grace | PendingCancellation)
    }

    /// Statuses the reconciliation worker re-validates against the store.
    pub fn needs_reconciliation(&self) -> bool {
        use SubscriptionStatus::*;
        matches!(self, Active | Grace | PendingCancellation)
    }

    pub fn as_str(&self) -> &'static str {
        use SubscriptionStatus::*;
        match self {
            Trial => "trial",
            Active => "active",
            Grace => "grace",
            PendingCancellation => "pending_cancellation",
            Canceled => "canceled",
            Expired => "expired",
            Refunded => "refunded",
            Paused => "paused",
        }
    }

    /// Maps an event onto this status.
    ///
    /// `is_trial` marks events that start or continue a free trial.
    pub fn resolve(&self, kind: EventKind, store: Store, is_trial: bool) -> Resolution {
        use EventKind as K;
        use Resolution::*;
        use SubscriptionStatus::*;

        if self.is_terminal() {
            return if kind.is_chargeable() { Supersede } else { Ignore };
        }

        match (kind, *self) {
            (K::Purchased | K::Renewed | K::Recovered, Trial) if is_trial => Keep,
            (K::Purchased | K::Renewed | K::Recovered, _) => Transition(Active),

            (K::Canceled, Trial | Active) => Transition(PendingCancellation),
            (K::Canceled, Grace | PendingCancellation | Paused) => Keep,

            (K::Restarted, PendingCancellation) if is_trial => Transition(Trial),
            (K::Restarted, PendingCancellation) => Transition(Active),
            (K::Restarted, _) => Keep,

            (K::GracePeriodEntered, Trial | Active | PendingCancellation) => Transition(Grace),
            (K::GracePeriodEntered, Grace) => Keep,
            (K::GracePeriodEntered, Paused) => Reject,

            (K::Paused, Active) if store.supports_pause() => Transition(Paused),
            (K::Paused, Paused) => Keep,
            (K::Paused, _) => Reject,

            (K::Expired, _) => Transition(Expired),
            (K::Revoked, _) => Transition(Refunded),
            (K::CanceledImmediately, _) => Transition(Canceled),

            (K::Canceled | K::GracePeriodEntered, Canceled | Expired | Refunded) => Ignore,
        }
    }
}

impl StateMachine for SubscriptionStatus {
    fn valid_transitions(&self) -> Vec<Self> {
        use SubscriptionStatus::*;
        match self {
            Trial => vec![Active, PendingCancellation, Grace, Expired, Refunded, Canceled],
            // Active -> Active is a renewal
            Active => vec![Active, PendingCancellation, Grace, Paused, Expired, Refunded, Canceled],
            Grace => vec![Active, Expired, Refunded, Canceled],
            PendingCancellation => vec![Active, Trial, Grace, Expired, Refunded, Canceled],
            Paused => vec![Active, Expired, Refunded, Canceled],
            Canceled | Expired | Refunded => vec![],
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubscriptionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                ValidationError::invalid_format("status", format!("unknown status '{}'", s))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SubscriptionStatus::*;

    const KINDS: [EventKind; 10] = [
        EventKind::Purchased,
        EventKind::Renewed,
        EventKind::Canceled,
        EventKind::Expired,
        EventKind::GracePeriodEntered,
        EventKind::Recovered,
        EventKind::Revoked,
        EventKind::Paused,
        EventKind::Restarted,
        EventKind::CanceledImmediately,
    ];

    #[test]
    fn every_resolved_transition_is_in_the_table() {
        for status in SubscriptionStatus::ALL {
            for kind in KINDS {
                for store in Store::ALL {
                    for is_trial in [false, true] {
                        if let Resolution::Transition(target) = status.resolve(kind, store, is_trial) {
                            assert!(
                                status.can_transition_to(&target),
                                "{:?} --{:?}--> {:?} missing from table",
                                status,
                                kind,
                                target
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        assert!(Canceled.is_terminal());
        assert!(Expired.is_terminal());
        assert!(Refunded.is_terminal());
        assert!(!Grace.is_terminal());
        assert!(!Paused.is_terminal());
    }

    #[test]
    fn first_charge_moves_trial_to_active() {
        assert_eq!(
            Trial.resolve(EventKind::Renewed, Store::Mobile, false),
            Resolution::Transition(Active)
        );
    }

    #[test]
    fn trial_continuation_keeps_trial() {
        assert_eq!(Trial.resolve(EventKind::Purchased, Store::AppStore, true), Resolution::Keep);
    }

    #[test]
    fn auto_renew_off_moves_active_to_pending_cancellation() {
        assert_eq!(
            Active.resolve(EventKind::Canceled, Store::AppStore, false),
            Resolution::Transition(PendingCancellation)
        );
    }

    #[test]
    fn grace_recovers_to_active_and_expires() {
        assert_eq!(
            Grace.resolve(EventKind::Recovered, Store::Mobile, false),
            Resolution::Transition(Active)
        );
        assert_eq!(
            Grace.resolve(EventKind::Expired, Store::Mobile, false),
            Resolution::Transition(Expired)
        );
    }

    #[test]
    fn revoke_from_any_non_terminal_refunds() {
        for status in [Trial, Active, Grace, PendingCancellation, Paused] {
            assert_eq!(
                status.resolve(EventKind::Revoked, Store::AppStore, false),
                Resolution::Transition(Refunded)
            );
        }
    }

    #[test]
    fn pause_is_mobile_only() {
        assert_eq!(
            Active.resolve(EventKind::Paused, Store::Mobile, false),
            Resolution::Transition(Paused)
        );
        assert_eq!(Active.resolve(EventKind::Paused, Store::AppStore, false), Resolution::Reject);
        assert_eq!(
            Paused.resolve(EventKind::Recovered, Store::Mobile, false),
            Resolution::Transition(Active)
        );
    }

    #[test]
    fn restart_reactivates_pending_cancellation() {
        assert_eq!(
            PendingCancellation.resolve(EventKind::Restarted, Store::Mobile, false),
            Resolution::Transition(Active)
        );
    }

    #[test]
    fn canceled_is_only_reachable_by_immediate_cancellation() {
        for status in SubscriptionStatus::ALL {
            for kind in KINDS {
                if let Resolution::Transition(Canceled) = status.resolve(kind, Store::Web, false) {
                    assert_eq!(kind, EventKind::CanceledImmediately);
                }
            }
        }
    }

    #[test]
    fn terminal_rows_supersede_on_new_charges_and_ignore_the_rest() {
        assert_eq!(Expired.resolve(EventKind::Purchased, Store::AppStore, false), Resolution::Supersede);
        assert_eq!(Refunded.resolve(EventKind::Renewed, Store::Mobile, false), Resolution::Supersede);
        assert_eq!(Expired.resolve(EventKind::Canceled, Store::Mobile, false), Resolution::Ignore);
        assert_eq!(Canceled.resolve(EventKind::Expired, Store::Web, false), Resolution::Ignore);
    }

    #[test]
    fn entitlement_statuses() {
        assert!(Trial.grants_entitlement());
        assert!(PendingCancellation.grants_entitlement());
        assert!(!Paused.grants_entitlement());
        assert!(!Refunded.grants_entitlement());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in SubscriptionStatus::ALL {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
        }
    }
}
