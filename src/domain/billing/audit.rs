//! Append-only subscription event log entries.
//!
//! Every state change, every ignored or stale notification, every
//! reconciliation failure and every worker tally is recorded here. Together
//! with the in-place subscription rows this is enough to rebuild the full
//! history of any subscription.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

use crate::domain::foundation::{
    SubscriptionEventId, SubscriptionId, Timestamp, UserId, ValidationError,
};

use super::notification::NormalizedEvent;
use super::{Subscription, SubscriptionStatus};

/// Who caused the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Webhook,
    Reconciliation,
    ExpirationSweep,
    UserAction,
    Operator,
    System,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Webhook => "webhook",
            EventSource::Reconciliation => "reconciliation",
            EventSource::ExpirationSweep => "expiration_sweep",
            EventSource::UserAction => "user_action",
            EventSource::Operator => "operator",
            EventSource::System => "system",
        }
    }
}

impl FromStr for EventSource {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            EventSource::Webhook,
            EventSource::Reconciliation,
            EventSource::ExpirationSweep,
            EventSource::UserAction,
            EventSource::Operator,
            EventSource::System,
        ]
        .into_iter()
        .find(|source| source.as_str() == s)
        .ok_or_else(|| ValidationError::invalid_format("source", format!("unknown source '{}'", s)))
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    /// This row was closed and replaced by a successor row.
    Superseded,
    Stale,
    NoChange,
    Rejected,
    ProcessingError,
    /// System-level entries such as worker tallies.
    Recorded,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Superseded => "superseded",
            EventOutcome::Stale => "stale",
            EventOutcome::NoChange => "no_change",
            EventOutcome::Rejected => "rejected",
            EventOutcome::ProcessingError => "processing_error",
            EventOutcome::Recorded => "recorded",
        }
    }
}

impl FromStr for EventOutcome {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            EventOutcome::Applied,
            EventOutcome::Superseded,
            EventOutcome::Stale,
            EventOutcome::NoChange,
            EventOutcome::Rejected,
            EventOutcome::ProcessingError,
            EventOutcome::Recorded,
        ]
        .into_iter()
        .find(|outcome| outcome.as_str() == s)
        .ok_or_else(|| ValidationError::invalid_format("outcome", format!("unknown outcome '{}'", s)))
    }
}

impl fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub id: SubscriptionEventId,
    pub subscription_id: Option<SubscriptionId>,
    pub user_id: Option<UserId>,
    /// Event kind (`renewed`, `expired`, ...) or system kind (`reconciliation.completed`).
    pub kind: String,
    pub source: EventSource,
    pub outcome: EventOutcome,
    pub previous_status: Option<SubscriptionStatus>,
    pub new_status: Option<SubscriptionStatus>,
    /// Store-issued notification id; unique when present.
    pub notification_id: Option<String>,
    pub payload: Value,
    pub occurred_at: Timestamp,
    pub recorded_at: Timestamp,
}

impl SubscriptionEvent {
    /// Entry for a normalized event applied (or deliberately not applied) to a row.
    pub fn for_event(
        subscription: &Subscription,
        previous_status: Option<SubscriptionStatus>,
        event: &NormalizedEvent,
        source: EventSource,
        outcome: EventOutcome,
        now: Timestamp,
    ) -> Self {
        Self {
            id: SubscriptionEventId::new(),
            subscription_id: Some(subscription.id),
            user_id: Some(subscription.user_id.clone()),
            kind: event.kind.as_str().to_string(),
            source,
            outcome,
            previous_status,
            new_status: Some(subscription.status()),
            notification_id: event.notification_id.clone(),
            payload: serde_json::to_value(event).unwrap_or(Value::Null),
            occurred_at: event.event_time,
            recorded_at: now,
        }
    }

    /// Entry recording a per-subscription failure (e.g. store validation error).
    pub fn processing_error(
        subscription: &Subscription,
        source: EventSource,
        message: &str,
        now: Timestamp,
    ) -> Self {
        Self {
            id: SubscriptionEventId::new(),
            subscription_id: Some(subscription.id),
            user_id: Some(subscription.user_id.clone()),
            kind: "processing_error".to_string(),
            source,
            outcome: EventOutcome::ProcessingError,
            previous_status: Some(subscription.status()),
            new_status: Some(subscription.status()),
            notification_id: None,
            payload: json!({ "error": message }),
            occurred_at: now,
            recorded_at: now,
        }
    }

    /// System-level entry not tied to one subscription.
    pub fn system(kind: impl Into<String>, source: EventSource, payload: Value, now: Timestamp) -> Self {
        Self {
            id: SubscriptionEventId::new(),
            subscription_id: None,
            user_id: None,
            kind: kind.into(),
            source,
            outcome: EventOutcome::Recorded,
            previous_status: None,
            new_status: None,
            notification_id: None,
            payload,
            occurred_at: now,
            recorded_at: now,
        }
    }

    /// Drops the dedup key, for entries that must not claim a notification id.
    pub fn without_notification_id(mut self) -> Self {
        self.notification_id = None;
        self
    }
}
