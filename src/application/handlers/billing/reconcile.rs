//! Reconciler - corrects drift between the ledger and the stores.
//!
//! Webhooks are best-effort: stores drop, delay and reorder them. The
//! reconciler asks the store for its authoritative view of a subscription,
//! derives the lifecycle events that would bring the local row there, and
//! routes them through the [`TransactionProcessor`] like any other event.
//!
//! It also recovers orphans: notifications for correlation keys this system
//! never saw a purchase for.

use std::sync::Arc;

use crate::domain::billing::{
    BillingError, EventKind, EventOutcome, EventSource, NormalizedEvent, Store, StoreRef,
    Subscription, SubscriptionStatus,
};
use crate::domain::foundation::{StateMachine, Timestamp, UserId};
use crate::ports::{ProductCatalog, StoreClients, StoreLifecycle, StoreSubscriptionState};

use super::processor::{PaymentEvent, ProcessOutcome, SubscriptionRef, TransactionProcessor};

/// Result of reconciling one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileResult {
    InSync,
    Corrected {
        applied: usize,
        status: SubscriptionStatus,
    },
    /// Drift was found but every correction was skipped by the ledger.
    Unresolved { status: SubscriptionStatus },
}

impl ReconcileResult {
    pub fn expired(&self) -> bool {
        matches!(
            self,
            ReconcileResult::Corrected {
                status: SubscriptionStatus::Expired,
                ..
            }
        )
    }
}

/// Time stamped on corrections for `local`.
///
/// Never earlier than the newest event already applied, or the row would
/// classify the correction as stale and skip it.
fn correction_time(local: &Subscription, now: Timestamp) -> Timestamp {
    local.last_validated_at.map_or(now, |last| last.max(now))
}

/// Events that move `local` to the store-reported `state`, in order.
///
/// Empty when they already agree, or when no valid path leads there.
pub fn drift_events(local: &Subscription, state: &StoreSubscriptionState, now: Timestamp) -> Vec<NormalizedEvent> {
    let at = correction_time(local, now);
    let event = |kind: EventKind| NormalizedEvent::synthesized(kind, local.correlation.clone(), at);
    let status = local.status();
    let mut events = Vec::new();

    match state.lifecycle {
        StoreLifecycle::Revoked => {
            if !status.is_terminal() {
                events.push(event(EventKind::Revoked));
            }
        }
        StoreLifecycle::Expired | StoreLifecycle::OnHold => {
            if !status.is_terminal() {
                events.push(event(EventKind::Expired).with_expires_at(state.expires_at));
            }
        }
        StoreLifecycle::Paused => match status {
            SubscriptionStatus::Paused => {}
            // a terminal row is only reopened by a new purchase
            _ if status.is_terminal() => {}
            _ if !local.store.supports_pause() => {
                tracing::warn!(
                    subscription_id = %local.id,
                    store = %local.store,
                    status = %status,
                    "Store reports a pause it does not support, leaving row unchanged"
                );
            }
            _ => {
                // pause is only reachable from active; other live rows are reactivated first
                let reactivate = match status {
                    SubscriptionStatus::Grace => Some(EventKind::Recovered),
                    SubscriptionStatus::PendingCancellation => Some(EventKind::Restarted),
                    SubscriptionStatus::Trial => Some(EventKind::Renewed),
                    _ => None,
                };
                if let Some(kind) = reactivate {
                    events.push(event(kind).with_auto_renewing(state.auto_renewing));
                }
                events.push(event(EventKind::Paused).with_expires_at(state.expires_at));
            }
        },
        StoreLifecycle::InGracePeriod => {
            let grace_end = state.grace_period_end.unwrap_or(state.expires_at);
            let behind = local.grace_period_end.map(|end| end < grace_end).unwrap_or(true);
            if status != SubscriptionStatus::Grace || behind {
                events.push(
                    event(EventKind::GracePeriodEntered)
                        .with_expires_at(state.expires_at)
                        .with_grace_period_end(Some(grace_end)),
                );
            }
        }
        StoreLifecycle::Active => {
            let extended = state.expires_at > local.current_period_end;
            let suspended = matches!(status, SubscriptionStatus::Grace | SubscriptionStatus::Paused);

            if extended || suspended {
                let kind = if suspended { EventKind::Recovered } else { EventKind::Renewed };
                let mut renewal = event(kind)
                    .with_expires_at(state.expires_at)
                    .with_auto_renewing(state.auto_renewing);
                renewal.is_trial = state.is_trial();
                renewal.store_product_id = state.store_product_id.clone();
                if let (Some(txn), Some(amount)) = (&state.latest_transaction_id, &state.amount) {
                    if extended && !state.is_trial() {
                        renewal = renewal.with_transaction(txn.clone(), amount.clone());
                    }
                }
                events.push(renewal);
                // the renewal leaves the row active, so only the store flag matters
                if !state.auto_renewing {
                    events.push(event(EventKind::Canceled));
                }
            } else if !state.auto_renewing
                && matches!(status, SubscriptionStatus::Active | SubscriptionStatus::Trial)
            {
                events.push(event(EventKind::Canceled));
            } else if state.auto_renewing && status == SubscriptionStatus::PendingCancellation {
                events.push(event(EventKind::Restarted).with_auto_renewing(true));
            }
        }
    }

    events
}

pub struct Reconciler {
    processor: Arc<TransactionProcessor>,
    clients: StoreClients,
    catalog: Arc<dyn ProductCatalog>,
}

impl Reconciler {
    pub fn new(
        processor: Arc<TransactionProcessor>,
        clients: StoreClients,
        catalog: Arc<dyn ProductCatalog>,
    ) -> Self {
        Self {
            processor,
            clients,
            catalog,
        }
    }

    /// Brings one subscription in line with its store.
    ///
    /// Store failures are recorded on the subscription (`processing_error`
    /// entry, bumped `validation_attempts`) before the error is returned.
    pub async fn reconcile_subscription(&self, local: &Subscription) -> Result<ReconcileResult, BillingError> {
        let now = self.processor.clock().now();

        let events = if local.store.supports_remote_validation() {
            let client = self.clients.require(local.store)?;
            match client
                .validate_subscription(local.store_product_id.as_deref(), &local.correlation)
                .await
            {
                Ok(state) => drift_events(local, &state, now),
                Err(err) => {
                    let err = BillingError::from(err);
                    tracing::warn!(
                        subscription_id = %local.id,
                        store = %local.store,
                        error = %err,
                        "Store validation failed"
                    );
                    self.processor
                        .record_validation_failure(local.id, EventSource::Reconciliation, &err.to_string())
                        .await?;
                    return Err(err);
                }
            }
        } else if local.effective_end() <= now {
            vec![NormalizedEvent::synthesized(
                EventKind::Expired,
                local.correlation.clone(),
                correction_time(local, now),
            )]
        } else {
            Vec::new()
        };

        if events.is_empty() {
            if local.validation_attempts > 0 {
                self.processor.record_validation_success(local.id).await?;
            }
            return Ok(ReconcileResult::InSync);
        }

        let mut status = local.status();
        let mut applied = 0;
        for event in events {
            tracing::info!(
                subscription_id = %local.id,
                store = %local.store,
                kind = %event.kind,
                "Correcting drift"
            );
            let outcome = self
                .processor
                .apply_lifecycle_event(SubscriptionRef::Id(local.id), event, EventSource::Reconciliation)
                .await?;
            status = outcome.subscription.status();
            if outcome.outcome == EventOutcome::Applied && !outcome.already_applied {
                applied += 1;
            }
        }

        if local.validation_attempts > 0 {
            self.processor.record_validation_success(local.id).await?;
        }
        if applied == 0 {
            tracing::warn!(
                subscription_id = %local.id,
                store = %local.store,
                status = %status,
                "Drift detected but no correction applied"
            );
            return Ok(ReconcileResult::Unresolved { status });
        }
        Ok(ReconcileResult::Corrected { applied, status })
    }

    /// Validates an unknown correlation key with its store and, when the
    /// store reports a live paid subscription with a known owner, opens it.
    ///
    /// `event_time` should be the time of the notification that revealed the
    /// orphan so that notification still applies afterwards.
    pub async fn reconcile_orphan(
        &self,
        correlation: &StoreRef,
        store_product_id: Option<&str>,
        owner_hint: Option<UserId>,
        event_time: Timestamp,
    ) -> Result<ProcessOutcome, BillingError> {
        let store = correlation.store();
        if !store.supports_remote_validation() {
            return Err(BillingError::SubscriptionNotFound(correlation.to_string()));
        }
        let client = self.clients.require(store)?;
        let state = client
            .validate_subscription(store_product_id, correlation)
            .await
            .map_err(BillingError::from)?;

        if !matches!(
            state.lifecycle,
            StoreLifecycle::Active | StoreLifecycle::InGracePeriod | StoreLifecycle::Paused
        ) {
            return Err(BillingError::SubscriptionNotFound(format!(
                "{} has no live store subscription",
                correlation
            )));
        }

        let product_ref = state
            .store_product_id
            .as_deref()
            .or(store_product_id)
            .ok_or_else(|| BillingError::ProductNotFound(format!("{} reports no product", correlation)))?;
        let product = self
            .catalog
            .find_by_store_product(store, product_ref)
            .await?
            .ok_or_else(|| BillingError::ProductNotFound(product_ref.to_string()))?;

        let user_id = state
            .account_ref
            .clone()
            .or(owner_hint)
            .ok_or_else(|| BillingError::UserNotFound(format!("{} carries no account reference", correlation)))?;

        let mut event = NormalizedEvent::synthesized(EventKind::Purchased, correlation.clone(), event_time)
            .with_expires_at(state.expires_at)
            .with_auto_renewing(state.auto_renewing);
        event.is_trial = state.is_trial();
        event.store_product_id = Some(product_ref.to_string());
        if let (Some(txn), Some(amount), false) = (&state.latest_transaction_id, &state.amount, state.is_trial()) {
            event = event.with_transaction(txn.clone(), amount.clone());
        }

        tracing::info!(
            correlation = %correlation,
            user_id = %user_id,
            product_id = %product.id,
            "Recovering orphaned store subscription"
        );

        self.processor
            .apply_payment_event(PaymentEvent {
                user_id,
                product_id: product.id,
                event,
                source: EventSource::Reconciliation,
            })
            .await
    }

    pub fn supports(&self, store: Store) -> bool {
        !store.supports_remote_validation() || self.clients.for_store(store).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::billing::NewSubscription;
    use crate::domain::foundation::{Money, ProductId};
    use crate::ports::StorePaymentState;

    fn local(now: Timestamp) -> Subscription {
        Subscription::open(
            NewSubscription {
                user_id: UserId::new("user-1").unwrap(),
                product_id: ProductId::new("premium_monthly").unwrap(),
                store_product_id: Some("premium_monthly".into()),
                correlation: StoreRef::for_store(Store::Mobile, "tok-1").unwrap(),
                price: Money::new(499, "EUR").unwrap(),
                period_end: now.plus_days(10),
                is_trial: false,
                auto_renewing: true,
                event_time: now.minus_days(20),
                supersedes: None,
            },
            now,
        )
    }

    fn state(lifecycle: StoreLifecycle, expires_at: Timestamp, auto_renewing: bool) -> StoreSubscriptionState {
        StoreSubscriptionState {
            lifecycle,
            expires_at,
            auto_renewing,
            payment_state: StorePaymentState::Received,
            grace_period_end: None,
            latest_transaction_id: Some("GPA.2".into()),
            amount: Some(Money::new(499, "EUR").unwrap()),
            account_ref: None,
            store_product_id: None,
        }
    }

    fn kinds(events: &[NormalizedEvent]) -> Vec<EventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn agreeing_state_has_no_drift() {
        let now = Timestamp::now();
        let sub = local(now);
        let s = state(StoreLifecycle::Active, sub.current_period_end, true);
        assert!(drift_events(&sub, &s, now).is_empty());
    }

    #[test]
    fn later_store_expiry_is_a_renewal_with_its_charge() {
        let now = Timestamp::now();
        let sub = local(now);
        let s = state(StoreLifecycle::Active, now.plus_days(40), true);
        let events = drift_events(&sub, &s, now);
        assert_eq!(kinds(&events), vec![EventKind::Renewed]);
        assert_eq!(events[0].expires_at, Some(now.plus_days(40)));
        assert_eq!(events[0].transaction_id.as_deref(), Some("GPA.2"));
    }

    #[test]
    fn disabled_auto_renew_is_a_cancel() {
        let now = Timestamp::now();
        let sub = local(now);
        let s = state(StoreLifecycle::Active, sub.current_period_end, false);
        assert_eq!(kinds(&drift_events(&sub, &s, now)), vec![EventKind::Canceled]);
    }

    #[test]
    fn renewal_and_cancel_are_both_emitted() {
        let now = Timestamp::now();
        let sub = local(now);
        let s = state(StoreLifecycle::Active, now.plus_days(40), false);
        assert_eq!(
            kinds(&drift_events(&sub, &s, now)),
            vec![EventKind::Renewed, EventKind::Canceled]
        );
    }

    #[test]
    fn expired_on_hold_and_revoked_states() {
        let now = Timestamp::now();
        let sub = local(now);
        assert_eq!(
            kinds(&drift_events(&sub, &state(StoreLifecycle::OnHold, now, false), now)),
            vec![EventKind::Expired]
        );
        assert_eq!(
            kinds(&drift_events(&sub, &state(StoreLifecycle::Revoked, now, false), now)),
            vec![EventKind::Revoked]
        );
    }

    #[test]
    fn grace_state_carries_grace_end() {
        let now = Timestamp::now();
        let sub = local(now);
        let mut s = state(StoreLifecycle::InGracePeriod, sub.current_period_end, true);
        s.grace_period_end = Some(sub.current_period_end.plus_days(7));
        let events = drift_events(&sub, &s, now);
        assert_eq!(kinds(&events), vec![EventKind::GracePeriodEntered]);
        assert_eq!(events[0].grace_period_end, Some(sub.current_period_end.plus_days(7)));
    }
    #[test]
    fn corrections_are_never_older_than_the_last_applied_event() {
        let now = Timestamp::now();
        let mut sub = local(now);
        sub.last_validated_at = Some(now.plus_secs(3_600));
        let events = drift_events(&sub, &state(StoreLifecycle::Active, sub.current_period_end, false), now);
        assert_eq!(kinds(&events), vec![EventKind::Canceled]);
        assert_eq!(events[0].event_time, now.plus_secs(3_600));
    }

    #[test]
    fn pause_reactivates_suspended_rows_first() {
        let now = Timestamp::now();
        let paused = state(StoreLifecycle::Paused, now.plus_days(10), true);
        for (status, bridge) in [
            (SubscriptionStatus::Grace, EventKind::Recovered),
            (SubscriptionStatus::PendingCancellation, EventKind::Restarted),
            (SubscriptionStatus::Trial, EventKind::Renewed),
        ] {
            let mut sub = local(now);
            sub.status = status;
            assert_eq!(kinds(&drift_events(&sub, &paused, now)), vec![bridge, EventKind::Paused]);
        }
        assert_eq!(kinds(&drift_events(&local(now), &paused, now)), vec![EventKind::Paused]);
    }

    #[test]
    fn pause_on_a_store_without_pause_is_left_alone() {
        let now = Timestamp::now();
        let mut sub = local(now);
        sub.store = Store::Web;
        sub.correlation = StoreRef::for_store(Store::Web, "sub_1").unwrap();
        let paused = state(StoreLifecycle::Paused, now.plus_days(10), true);
        assert!(drift_events(&sub, &paused, now).is_empty());
    }
}

