//! TransactionProcessor - the only writer of the subscription ledger.
//!
//! Every webhook, reconciliation correction, sweep expiry and user or
//! operator action ends up here. Each call becomes one atomic unit:
//! subscription rows, at most one payment record, the entitlement projection
//! and the event log entries are committed together or not at all.
//!
//! # Guarantees
//!
//! - a payment key `(store, store_transaction_id)` is booked at most once;
//!   replays return the existing record with `already_applied = true`
//! - calls for the same correlation key are serialized in-process
//! - aborted units (version conflicts, storage failures) are retried up to
//!   `max_attempts` times before the error surfaces

use std::sync::Arc;
use std::time::Duration;

use crate::domain::billing::{
    ApplyOutcome, BillingError, Entitlement, EventKind, EventOutcome, EventSource,
    NewSubscription, NormalizedEvent, PaymentKey, PaymentRecord, Product, StoreRef, Subscription,
    SubscriptionEvent, SubscriptionStatus, TransactionType,
};
use crate::domain::foundation::{ProductId, SubscriptionId, Timestamp, UserId};
use crate::ports::{Clock, CommitOutcome, LedgerStore, LedgerWrite, ProductCatalog};

use super::keyed_lock::KeyedLocks;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Attempts per call when the unit aborts (first try included).
    pub max_attempts: u32,
    /// Linear backoff step between attempts.
    pub retry_backoff: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(25),
        }
    }
}

/// A normalized event that may move money or open a subscription.
///
/// The owner and product are resolved by the caller; store, correlation key,
/// amount, period end, transaction id, event time, notification id and raw
/// payload travel in `event`.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub user_id: UserId,
    pub product_id: ProductId,
    pub event: NormalizedEvent,
    pub source: EventSource,
}

/// How a lifecycle event addresses its subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionRef {
    Id(SubscriptionId),
    Correlation(StoreRef),
}

/// Result of one processed event.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// The row the event ended on (the successor when a row was superseded).
    pub subscription: Subscription,
    pub previous_status: Option<SubscriptionStatus>,
    pub outcome: EventOutcome,
    pub payment_record: Option<PaymentRecord>,
    /// The payment key was already booked; nothing was written.
    pub already_applied: bool,
    /// Projection written by this unit, if one was committed.
    pub entitlement: Option<Entitlement>,
}

enum Target {
    Existing(Subscription),
    New { user_id: UserId, product: Product },
}

struct Plan {
    write: LedgerWrite,
    subscription: Subscription,
    previous_status: Option<SubscriptionStatus>,
    outcome: EventOutcome,
    payment: Option<PaymentRecord>,
}

pub struct TransactionProcessor {
    ledger: Arc<dyn LedgerStore>,
    catalog: Arc<dyn ProductCatalog>,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks,
    config: ProcessorConfig,
}

impl TransactionProcessor {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        catalog: Arc<dyn ProductCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_config(ledger, catalog, clock, ProcessorConfig::default())
    }

    pub fn with_config(
        ledger: Arc<dyn LedgerStore>,
        catalog: Arc<dyn ProductCatalog>,
        clock: Arc<dyn Clock>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            ledger,
            catalog,
            clock,
            locks: KeyedLocks::new(),
            config,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Applies an event that may open a subscription or book a charge.
    ///
    /// # Errors
    ///
    /// - `ProductNotFound` if a new subscription references an unknown product
    /// - `UserNotFound` if the owner does not exist
    /// - `SubscriptionNotFound` for a non-chargeable event with no live row
    /// - `InvalidTransition` if the transition table rejects the event
    /// - `DuplicateNotification` if the notification id is already logged
    /// - `TransactionAborted` once retries are exhausted
    pub async fn apply_payment_event(&self, cmd: PaymentEvent) -> Result<ProcessOutcome, BillingError> {
        let _guard = self.locks.lock(&cmd.event.correlation.to_string()).await;

        let mut attempt = 1;
        loop {
            match self.payment_once(&cmd).await {
                Err(BillingError::TransactionAborted(reason)) if attempt < self.config.max_attempts => {
                    tracing::warn!(
                        correlation = %cmd.event.correlation,
                        kind = %cmd.event.kind,
                        attempt,
                        reason = %reason,
                        "Ledger unit aborted, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Applies a lifecycle event to an existing subscription.
    ///
    /// # Errors
    ///
    /// - `SubscriptionNotFound` if the reference matches no row
    /// - `InvalidTransition` if the transition table rejects the event
    /// - `DuplicateNotification` if the notification id is already logged
    /// - `TransactionAborted` once retries are exhausted
    pub async fn apply_lifecycle_event(
        &self,
        subscription: SubscriptionRef,
        event: NormalizedEvent,
        source: EventSource,
    ) -> Result<ProcessOutcome, BillingError> {
        let _guard = self.locks.lock(&event.correlation.to_string()).await;

        let mut attempt = 1;
        loop {
            match self.lifecycle_once(&subscription, &event, source).await {
                Err(BillingError::TransactionAborted(reason)) if attempt < self.config.max_attempts => {
                    tracing::warn!(
                        correlation = %event.correlation,
                        kind = %event.kind,
                        attempt,
                        reason = %reason,
                        "Ledger unit aborted, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Records a failed store validation: a `processing_error` entry and a
    /// bumped `validation_attempts`, in one unit.
    pub async fn record_validation_failure(
        &self,
        subscription_id: SubscriptionId,
        source: EventSource,
        message: &str,
    ) -> Result<(), BillingError> {
        let correlation = self.load(&subscription_id).await?.correlation;
        let _guard = self.locks.lock(&correlation.to_string()).await;
        let now = self.clock.now();
        let mut sub = self.load(&subscription_id).await?;
        let entry = SubscriptionEvent::processing_error(&sub, source, message, now);
        sub.record_validation_failure(now);

        let write = LedgerWrite::new(sub.user_id.clone(), now).update(sub).event(entry);
        self.ledger.commit(write).await?;
        Ok(())
    }

    /// Resets `validation_attempts` after a validation that found no drift.
    pub async fn record_validation_success(&self, subscription_id: SubscriptionId) -> Result<(), BillingError> {
        let correlation = self.load(&subscription_id).await?.correlation;
        let _guard = self.locks.lock(&correlation.to_string()).await;
        let now = self.clock.now();
        let mut sub = self.load(&subscription_id).await?;
        if sub.validation_attempts == 0 {
            return Ok(());
        }
        sub.record_validation_success(now);
        self.ledger
            .commit(LedgerWrite::new(sub.user_id.clone(), now).update(sub))
            .await?;
        Ok(())
    }

    async fn payment_once(&self, cmd: &PaymentEvent) -> Result<ProcessOutcome, BillingError> {
        let now = self.clock.now();
        let event = &cmd.event;

        if let Some(existing) = self.booked_payment(event).await? {
            return self.already_applied(existing).await;
        }

        let target = match self.ledger.find_live_by_correlation(&event.correlation).await? {
            Some(sub) if sub.user_id != cmd.user_id => {
                return Err(BillingError::Validation(format!(
                    "{} belongs to another user",
                    event.correlation
                )))
            }
            Some(sub) => Target::Existing(sub),
            None if event.kind.is_chargeable() => {
                let product = self
                    .catalog
                    .find_by_id(&cmd.product_id)
                    .await?
                    .ok_or_else(|| BillingError::ProductNotFound(cmd.product_id.to_string()))?;
                Target::New {
                    user_id: cmd.user_id.clone(),
                    product,
                }
            }
            None => return Err(BillingError::SubscriptionNotFound(event.correlation.to_string())),
        };

        let plan = self.plan(target, event, cmd.source, now).await?;
        self.commit(plan).await
    }

    async fn lifecycle_once(
        &self,
        subscription: &SubscriptionRef,
        event: &NormalizedEvent,
        source: EventSource,
    ) -> Result<ProcessOutcome, BillingError> {
        let now = self.clock.now();
        let sub = self.resolve(subscription).await?;
        if sub.correlation != event.correlation {
            return Err(BillingError::Validation(format!(
                "event for {} cannot be applied to subscription {}",
                event.correlation, sub.id
            )));
        }

        if let Some(existing) = self.booked_payment(event).await? {
            return self.already_applied(existing).await;
        }

        let plan = self.plan(Target::Existing(sub), event, source, now).await?;
        self.commit(plan).await
    }

    async fn plan(
        &self,
        target: Target,
        event: &NormalizedEvent,
        source: EventSource,
        now: Timestamp,
    ) -> Result<Plan, BillingError> {
        match target {
            Target::New { user_id, product } => {
                let sub = Subscription::open(
                    NewSubscription {
                        user_id: user_id.clone(),
                        product_id: product.id.clone(),
                        store_product_id: event
                            .store_product_id
                            .clone()
                            .or_else(|| product.store_product_id(event.store).map(str::to_string)),
                        correlation: event.correlation.clone(),
                        price: event
                            .amount
                            .clone()
                            .filter(|a| !a.is_zero())
                            .unwrap_or_else(|| product.price.clone()),
                        period_end: event
                            .expires_at
                            .unwrap_or_else(|| product.period_end_from(event.event_time)),
                        is_trial: event.is_trial,
                        auto_renewing: event.auto_renewing.unwrap_or(true),
                        event_time: event.event_time,
                        supersedes: None,
                    },
                    now,
                );
                let payment = payment_for(&sub, event, now);
                let entry = SubscriptionEvent::for_event(&sub, None, event, source, EventOutcome::Applied, now);
                Ok(Plan {
                    write: LedgerWrite::new(user_id, now)
                        .insert(sub.clone())
                        .with_payment(payment.clone())
                        .event(entry),
                    subscription: sub,
                    previous_status: None,
                    outcome: EventOutcome::Applied,
                    payment,
                })
            }
            Target::Existing(mut sub) => {
                let previous = sub.status();
                let owner = sub.user_id.clone();

                let applied = match sub.apply(event, now) {
                    Ok(applied) => applied,
                    Err(err) => {
                        let entry =
                            SubscriptionEvent::for_event(&sub, Some(previous), event, source, EventOutcome::Rejected, now);
                        if let CommitOutcome::DuplicateNotification(id) =
                            self.ledger.commit(LedgerWrite::new(owner, now).event(entry)).await?
                        {
                            return Err(BillingError::DuplicateNotification(id));
                        }
                        tracing::warn!(
                            subscription_id = %sub.id,
                            status = %previous,
                            kind = %event.kind,
                            "Event rejected by transition table"
                        );
                        return Err(err);
                    }
                };

                match applied {
                    ApplyOutcome::Applied { .. } => {
                        let payment = payment_for(&sub, event, now);
                        let entry =
                            SubscriptionEvent::for_event(&sub, Some(previous), event, source, EventOutcome::Applied, now);
                        Ok(Plan {
                            write: LedgerWrite::new(owner, now)
                                .update(sub.clone())
                                .with_payment(payment.clone())
                                .event(entry),
                            subscription: sub,
                            previous_status: Some(previous),
                            outcome: EventOutcome::Applied,
                            payment,
                        })
                    }
                    ApplyOutcome::Unchanged(_) | ApplyOutcome::Stale(_) => {
                        let outcome = if matches!(applied, ApplyOutcome::Stale(_)) {
                            EventOutcome::Stale
                        } else {
                            EventOutcome::NoChange
                        };
                        let payment = payment_for(&sub, event, now);
                        let entry = SubscriptionEvent::for_event(&sub, Some(previous), event, source, outcome, now);
                        Ok(Plan {
                            write: LedgerWrite::new(owner, now)
                                .with_payment(payment.clone())
                                .event(entry),
                            subscription: sub,
                            previous_status: Some(previous),
                            outcome,
                            payment,
                        })
                    }
                    ApplyOutcome::Supersede => {
                        let successor = sub.successor(event, sub.price.clone(), now);
                        sub.supersede_with(successor.id, now);
                        let payment = payment_for(&successor, event, now);
                        let closing = SubscriptionEvent::for_event(
                            &sub,
                            Some(previous),
                            event,
                            source,
                            EventOutcome::Superseded,
                            now,
                        )
                        .without_notification_id();
                        let opening =
                            SubscriptionEvent::for_event(&successor, None, event, source, EventOutcome::Applied, now);
                        tracing::info!(
                            subscription_id = %sub.id,
                            successor_id = %successor.id,
                            kind = %event.kind,
                            "Terminal subscription superseded by a new row"
                        );
                        Ok(Plan {
                            write: LedgerWrite::new(owner, now)
                                .update(sub)
                                .insert(successor.clone())
                                .with_payment(payment.clone())
                                .event(closing)
                                .event(opening),
                            subscription: successor,
                            previous_status: Some(previous),
                            outcome: EventOutcome::Applied,
                            payment,
                        })
                    }
                }
            }
        }
    }

    async fn commit(&self, plan: Plan) -> Result<ProcessOutcome, BillingError> {
        match self.ledger.commit(plan.write).await? {
            CommitOutcome::Committed { entitlement } => {
                let subscription = self
                    .ledger
                    .find_subscription(&plan.subscription.id)
                    .await?
                    .unwrap_or(plan.subscription);
                tracing::info!(
                    subscription_id = %subscription.id,
                    user_id = %subscription.user_id,
                    status = %subscription.status(),
                    outcome = plan.outcome.as_str(),
                    entitled = entitlement.is_entitled,
                    payment = plan.payment.is_some(),
                    "Ledger unit committed"
                );
                Ok(ProcessOutcome {
                    subscription,
                    previous_status: plan.previous_status,
                    outcome: plan.outcome,
                    payment_record: plan.payment,
                    already_applied: false,
                    entitlement: Some(entitlement),
                })
            }
            CommitOutcome::DuplicatePayment(existing) => self.already_applied(existing).await,
            CommitOutcome::DuplicateNotification(id) => Err(BillingError::DuplicateNotification(id)),
        }
    }

    async fn booked_payment(&self, event: &NormalizedEvent) -> Result<Option<PaymentRecord>, BillingError> {
        match payment_key(event) {
            Some((key, _)) => Ok(self.ledger.find_payment(&key).await?),
            None => Ok(None),
        }
    }

    async fn already_applied(&self, existing: PaymentRecord) -> Result<ProcessOutcome, BillingError> {
        let subscription = self.load(&existing.subscription_id).await?;
        tracing::info!(
            subscription_id = %subscription.id,
            payment_key = %existing.key,
            "Payment already booked, nothing to apply"
        );
        Ok(ProcessOutcome {
            previous_status: Some(subscription.status()),
            subscription,
            outcome: EventOutcome::NoChange,
            payment_record: Some(existing),
            already_applied: true,
            entitlement: None,
        })
    }

    async fn load(&self, id: &SubscriptionId) -> Result<Subscription, BillingError> {
        self.ledger
            .find_subscription(id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))
    }

    /// Finds the live row a reference points to, following supersession.
    async fn resolve(&self, reference: &SubscriptionRef) -> Result<Subscription, BillingError> {
        match reference {
            SubscriptionRef::Id(id) => {
                let sub = self.load(id).await?;
                if sub.is_live() {
                    return Ok(sub);
                }
                Ok(self
                    .ledger
                    .find_live_by_correlation(&sub.correlation)
                    .await?
                    .unwrap_or(sub))
            }
            SubscriptionRef::Correlation(correlation) => self
                .ledger
                .find_live_by_correlation(correlation)
                .await?
                .ok_or_else(|| BillingError::SubscriptionNotFound(correlation.to_string())),
        }
    }
}

/// Payment key and type booked for an event, if it moves money.
fn payment_key(event: &NormalizedEvent) -> Option<(PaymentKey, TransactionType)> {
    if !event.has_financial_impact() {
        return None;
    }
    let transaction_id = event.transaction_id.as_deref()?;
    if event.kind.is_chargeable() {
        Some((PaymentKey::new(event.store, transaction_id), TransactionType::Charge))
    } else if event.kind == EventKind::Revoked {
        Some((PaymentKey::refund_of(event.store, transaction_id), TransactionType::Refund))
    } else {
        None
    }
}

fn payment_for(sub: &Subscription, event: &NormalizedEvent, now: Timestamp) -> Option<PaymentRecord> {
    let (key, transaction_type) = payment_key(event)?;
    let amount = event.amount.clone()?;
    Some(PaymentRecord::completed(
        sub.user_id.clone(),
        sub.id,
        key,
        transaction_type,
        amount,
        event.event_time,
        now,
    ))
}
