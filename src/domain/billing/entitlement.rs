//! Entitlement projection written to the user collaborator.

use serde::{Deserialize, Serialize};

use crate::domain::foundation::{SubscriptionId, Timestamp, UserId};

use super::Subscription;

/// Derived "may this user use premium features" flag.
///
/// Never the source of truth: recomputed from every live subscription of the
/// user whenever any of them changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub user_id: UserId,
    pub is_entitled: bool,
    pub expires_at: Option<Timestamp>,
    /// The subscription granting the furthest-reaching entitlement.
    pub subscription_id: Option<SubscriptionId>,
    pub computed_at: Timestamp,
}

impl Entitlement {
    pub fn none(user_id: UserId, now: Timestamp) -> Self {
        Self {
            user_id,
            is_entitled: false,
            expires_at: None,
            subscription_id: None,
            computed_at: now,
        }
    }

    /// Projects entitlement from a user's subscriptions.
    ///
    /// Rows owned by other users are ignored.
    pub fn project<'a>(
        user_id: &UserId,
        subscriptions: impl IntoIterator<Item = &'a Subscription>,
        now: Timestamp,
    ) -> Self {
        let best = subscriptions
            .into_iter()
            .filter(|s| &s.user_id == user_id && s.is_entitled_at(now))
            .max_by_key(|s| s.effective_end());

        match best {
            Some(sub) => Self {
                user_id: user_id.clone(),
                is_entitled: true,
                expires_at: Some(sub.effective_end()),
                subscription_id: Some(sub.id),
                computed_at: now,
            },
            None => Self::none(user_id.clone(), now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::billing::subscription::test_support::{active, event, new_subscription};
    use crate::domain::billing::{EventKind, Store};

    #[test]
    fn no_subscriptions_means_not_entitled() {
        let user = UserId::new("user-1").unwrap();
        let e = Entitlement::project(&user, std::iter::empty(), Timestamp::now());
        assert!(!e.is_entitled);
        assert!(e.expires_at.is_none());
    }

    #[test]
    fn picks_the_furthest_reaching_subscription() {
        let now = Timestamp::now();
        let short = active(now);
        let long = Subscription::open(
            new_subscription(Store::AppStore, "1000", now.plus_days(365), now),
            now,
        );
        let e = Entitlement::project(&short.user_id.clone(), [&short, &long], now);
        assert!(e.is_entitled);
        assert_eq!(e.subscription_id, Some(long.id));
        assert_eq!(e.expires_at, Some(now.plus_days(365)));
    }

    #[test]
    fn refunded_subscription_grants_nothing() {
        let now = Timestamp::now();
        let mut sub = active(now);
        sub.apply(&event(&sub, EventKind::Revoked, now), now).unwrap();
        let e = Entitlement::project(&sub.user_id.clone(), [&sub], now);
        assert!(!e.is_entitled);
    }

    #[test]
    fn other_users_rows_are_ignored() {
        let now = Timestamp::now();
        let sub = active(now);
        let other = UserId::new("user-2").unwrap();
        assert!(!Entitlement::project(&other, [&sub], now).is_entitled);
    }
}
