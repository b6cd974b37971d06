//! Subscription aggregate.
//!
//! One row per billing relationship with a store. Rows are mutated in place
//! for renewals; when a terminal row receives a new charge for the same
//! correlation key, a successor row is opened and linked through
//! `supersedes` / `superseded_by`.
//!
//! # Invariants
//!
//! - exactly one correlation key, matching `store`
//! - `current_period_end` never decreases, except on revoke/immediate cancel
//! - an entitled status is never left in place once its end has passed
//! - `status` changes only through [`Subscription::apply`]

use serde::{Deserialize, Serialize};

use crate::domain::foundation::{
    Money, ProductId, StateMachine, SubscriptionId, Timestamp, UserId,
};

use super::notification::NormalizedEvent;
use super::{BillingError, EventKind, Resolution, Store, StoreRef, SubscriptionStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub store: Store,
    pub product_id: ProductId,
    pub store_product_id: Option<String>,
    pub correlation: StoreRef,
    pub start_date: Timestamp,
    /// Authoritative expiry.
    pub current_period_end: Timestamp,
    pub trial_end_date: Option<Timestamp>,
    pub grace_period_end: Option<Timestamp>,
    pub(crate) status: SubscriptionStatus,
    pub auto_renewing: bool,
    pub price: Money,
    pub validation_attempts: u32,
    /// Store-reported time of the newest event applied to this row.
    pub last_validated_at: Option<Timestamp>,
    pub supersedes: Option<SubscriptionId>,
    pub superseded_by: Option<SubscriptionId>,
    /// Optimistic concurrency version, bumped by the ledger store on commit.
    pub version: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Everything needed to open a subscription row.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: UserId,
    pub product_id: ProductId,
    pub store_product_id: Option<String>,
    pub correlation: StoreRef,
    pub price: Money,
    pub period_end: Timestamp,
    pub is_trial: bool,
    pub auto_renewing: bool,
    pub event_time: Timestamp,
    pub supersedes: Option<SubscriptionId>,
}

/// What [`Subscription::apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Fields and possibly status changed.
    Applied {
        previous: SubscriptionStatus,
        current: SubscriptionStatus,
    },
    /// The event carried nothing new for this row.
    Unchanged(SubscriptionStatus),
    /// Older than `last_validated_at`; logged, not applied.
    Stale(SubscriptionStatus),
    /// Row is terminal and the event starts a new relationship.
    Supersede,
}

impl Subscription {
    /// Opens a new row for a first purchase (or a purchase after a terminal row).
    ///
    /// A purchase whose period has already ended opens as `expired`.
    pub fn open(new: NewSubscription, now: Timestamp) -> Self {
        let status = if new.is_trial {
            SubscriptionStatus::Trial
        } else {
            SubscriptionStatus::Active
        };
        let mut subscription = Self {
            id: SubscriptionId::new(),
            user_id: new.user_id,
            store: new.correlation.store(),
            product_id: new.product_id,
            store_product_id: new.store_product_id,
            correlation: new.correlation,
            start_date: new.event_time,
            current_period_end: new.period_end,
            trial_end_date: new.is_trial.then_some(new.period_end),
            grace_period_end: None,
            status,
            auto_renewing: new.auto_renewing,
            price: new.price,
            validation_attempts: 0,
            last_validated_at: Some(new.event_time),
            supersedes: new.supersedes,
            superseded_by: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        subscription.settle(now);
        subscription
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    /// Not superseded by a newer row for the same correlation key.
    pub fn is_live(&self) -> bool {
        self.superseded_by.is_none()
    }

    /// End of entitlement: the grace window while in grace, else the period end.
    pub fn effective_end(&self) -> Timestamp {
        match (self.status, self.grace_period_end) {
            (SubscriptionStatus::Grace, Some(grace_end)) => grace_end.max(self.current_period_end),
            _ => self.current_period_end,
        }
    }

    pub fn is_entitled_at(&self, now: Timestamp) -> bool {
        self.is_live() && self.status.grants_entitlement() && self.effective_end() > now
    }

    /// Entitled status whose end has passed: the expiration sweep's target.
    pub fn is_overdue_at(&self, now: Timestamp) -> bool {
        self.is_live() && self.status.grants_entitlement() && self.effective_end() <= now
    }

    /// Applies one normalized event through the transition table.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` when the table rejects the event for the current status.
    pub fn apply(&mut self, event: &NormalizedEvent, now: Timestamp) -> Result<ApplyOutcome, BillingError> {
        let previous = self.status;

        if let Some(last) = self.last_validated_at {
            if event.event_time < last {
                return Ok(ApplyOutcome::Stale(previous));
            }
        }

        let target = match previous.resolve(event.kind, self.store, event.is_trial) {
            Resolution::Supersede => return Ok(ApplyOutcome::Supersede),
            Resolution::Ignore => return Ok(ApplyOutcome::Unchanged(previous)),
            Resolution::Reject => {
                return Err(BillingError::InvalidTransition {
                    from: previous,
                    kind: event.kind,
                })
            }
            Resolution::Keep => previous,
            Resolution::Transition(target) => {
                previous
                    .transition_to(target)
                    .map_err(|_| BillingError::InvalidTransition {
                        from: previous,
                        kind: event.kind,
                    })?
            }
        };

        let before = self.clone();
        self.status = target;
        self.apply_fields(event, target, now);
        self.settle(now);

        self.last_validated_at = Some(match self.last_validated_at {
            Some(last) => last.max(event.event_time),
            None => event.event_time,
        });

        if self.same_state_as(&before) {
            *self = before;
            return Ok(ApplyOutcome::Unchanged(previous));
        }

        self.updated_at = now;
        Ok(ApplyOutcome::Applied {
            previous,
            current: self.status,
        })
    }

    fn apply_fields(&mut self, event: &NormalizedEvent, target: SubscriptionStatus, now: Timestamp) {
        if event.kind.may_shorten_period() {
            let cutoff = event.event_time.min(now);
            self.current_period_end = self.current_period_end.min(cutoff);
        } else if let Some(expires_at) = event.expires_at {
            self.current_period_end = self.current_period_end.max(expires_at);
        }

        if target == SubscriptionStatus::Grace {
            if let Some(grace_end) = event.grace_period_end {
                self.grace_period_end = Some(match self.grace_period_end {
                    Some(existing) => existing.max(grace_end),
                    None => grace_end,
                });
            }
        } else {
            self.grace_period_end = None;
        }

        if target == SubscriptionStatus::Trial && event.is_trial {
            if let Some(expires_at) = event.expires_at {
                self.trial_end_date = Some(expires_at);
            }
        }

        self.auto_renewing = match (event.auto_renewing, event.kind) {
            (Some(flag), _) => flag,
            (None, EventKind::Canceled) => false,
            (None, EventKind::Restarted) => true,
            (None, EventKind::Expired | EventKind::Revoked | EventKind::CanceledImmediately) => false,
            (None, _) => self.auto_renewing,
        };

        if let Some(product) = &event.store_product_id {
            self.store_product_id = Some(product.clone());
        }

        if event.kind.is_chargeable() {
            if let Some(amount) = &event.amount {
                if !amount.is_zero() {
                    self.price = amount.clone();
                }
            }
        }
    }

    /// Never leaves an entitled status in place past its end.
    fn settle(&mut self, now: Timestamp) {
        if self.status.grants_entitlement() && self.effective_end() <= now {
            self.status = SubscriptionStatus::Expired;
            self.grace_period_end = None;
            self.auto_renewing = false;
        }
    }

    fn same_state_as(&self, other: &Subscription) -> bool {
        self.status == other.status
            && self.current_period_end == other.current_period_end
            && self.grace_period_end == other.grace_period_end
            && self.trial_end_date == other.trial_end_date
            && self.auto_renewing == other.auto_renewing
            && self.store_product_id == other.store_product_id
            && self.price == other.price
    }

    /// Opens the row that replaces this terminal one.
    pub fn successor(&self, event: &NormalizedEvent, fallback_price: Money, now: Timestamp) -> Subscription {
        Subscription::open(
            NewSubscription {
                user_id: self.user_id.clone(),
                product_id: self.product_id.clone(),
                store_product_id: event
                    .store_product_id
                    .clone()
                    .or_else(|| self.store_product_id.clone()),
                correlation: self.correlation.clone(),
                price: event.amount.clone().filter(|a| !a.is_zero()).unwrap_or(fallback_price),
                period_end: event.expires_at.unwrap_or(self.current_period_end),
                is_trial: event.is_trial,
                auto_renewing: event.auto_renewing.unwrap_or(true),
                event_time: event.event_time,
                supersedes: Some(self.id),
            },
            now,
        )
    }

    /// Marks this row as replaced by `successor`.
    pub fn supersede_with(&mut self, successor: SubscriptionId, now: Timestamp) {
        self.superseded_by = Some(successor);
        self.updated_at = now;
    }

    /// Records a failed store validation during reconciliation.
    pub fn record_validation_failure(&mut self, now: Timestamp) {
        self.validation_attempts = self.validation_attempts.saturating_add(1);
        self.updated_at = now;
    }

    /// Records a successful store validation that found no drift.
    pub fn record_validation_success(&mut self, now: Timestamp) {
        self.validation_attempts = 0;
        self.updated_at = now;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn new_subscription(store: Store, key: &str, period_end: Timestamp, event_time: Timestamp) -> NewSubscription {
        NewSubscription {
            user_id: UserId::new("user-1").unwrap(),
            product_id: ProductId::new("premium_monthly").unwrap(),
            store_product_id: Some("premium_monthly".into()),
            correlation: StoreRef::for_store(store, key).unwrap(),
            price: Money::new(499, "EUR").unwrap(),
            period_end,
            is_trial: false,
            auto_renewing: true,
            event_time,
            supersedes: None,
        }
    }

    pub fn active(now: Timestamp) -> Subscription {
        Subscription::open(new_subscription(Store::Mobile, "tok-1", now.plus_days(30), now.minus_days(1)), now)
    }

    pub fn event(sub: &Subscription, kind: EventKind, at: Timestamp) -> NormalizedEvent {
        NormalizedEvent::synthesized(kind, sub.correlation.clone(), at)
    }
}
