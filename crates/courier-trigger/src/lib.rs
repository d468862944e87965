//! Document-change to webhook-event translation.
//!
//! The host platform calls [`Trigger::translate`] synchronously with each
//! batch of document transactions. The trigger classifies every transaction
//! against the closed event-kind set, evaluates each subscription's scope
//! filter, builds the canonical payload, and emits one pending [`Event`] per
//! `(transaction, matching subscription)` pair. The returned events are the
//! caller's to persist; the trigger knows nothing about delivery state.
//!
//! Translation must never take the host transaction down with it: every
//! per-subscription branch runs inside an error boundary that logs and
//! drops only that branch.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use courier_clock::SharedClock;
use courier_types::{
    ChangeAction, DocumentClass, EnvelopeData, EnvelopeEvent, Event, EventEnvelope, EventKind,
    EventStatus, Subscription,
};
use serde_json::Value;
use uuid::Uuid;

/// Workspace identity exposed by the host.
#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    pub id: String,
    pub name: String,
}

/// What a transaction did to its document.
#[derive(Debug, Clone)]
pub enum TxDetail {
    /// Document creation, with the created attributes.
    Created { attributes: Value },
    /// Document update, with the set of field changes.
    Updated { operations: Value },
    /// Document removal.
    Removed,
}

/// One document-change transaction from the host platform.
#[derive(Debug, Clone)]
pub struct ChangeTx {
    pub class: DocumentClass,
    pub object_id: String,
    pub modified_by: String,
    pub space: String,
    pub detail: TxDetail,
}

impl ChangeTx {
    pub fn action(&self) -> ChangeAction {
        match self.detail {
            TxDetail::Created { .. } => ChangeAction::Created,
            TxDetail::Updated { .. } => ChangeAction::Updated,
            TxDetail::Removed => ChangeAction::Deleted,
        }
    }
}

/// Parse a raw class name from the host; unobserved classes yield `None`
/// and the embedder drops those transactions before translation.
pub fn observed_class(raw: &str) -> Option<DocumentClass> {
    raw.parse().ok()
}

/// Read access into the host platform, scoped to the current transaction
/// batch.
pub trait PlatformControl {
    fn workspace(&self) -> &WorkspaceInfo;

    /// Current (post-transaction) state of a document, if available.
    fn current_object(&self, class: DocumentClass, object_id: &str) -> Result<Option<Value>>;

    /// Snapshot of a removed document, where the host exposes one.
    fn removed_object(&self, class: DocumentClass, object_id: &str) -> Option<Value>;
}

/// Owning project of a transaction's document, for project-scope filters.
///
/// A `Project`'s own id; the transaction `space` for the rest of the
/// tracker family; `None` for classes outside it.
fn owning_project(tx: &ChangeTx) -> Option<&str> {
    match tx.class {
        DocumentClass::Project => Some(&tx.object_id),
        DocumentClass::Issue | DocumentClass::Component | DocumentClass::Milestone => {
            Some(&tx.space)
        }
        DocumentClass::ChatMessage => None,
    }
}

/// Bookkeeping fields stripped from update operation sets before they reach
/// receivers.
const BOOKKEEPING_FIELDS: [&str; 2] = ["modifiedOn", "modifiedBy"];

fn strip_bookkeeping(operations: &Value) -> Value {
    match operations {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !BOOKKEEPING_FIELDS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// The change-to-event translator.
pub struct Trigger {
    clock: SharedClock,
}

impl Trigger {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    /// Translate a transaction batch into pending events.
    ///
    /// `subscriptions` is the full set loaded by the caller; disabled
    /// entries are skipped here regardless. The newest-first ordering is a
    /// freshness hint only; correctness does not depend on it.
    pub fn translate(
        &self,
        batch: &[ChangeTx],
        control: &dyn PlatformControl,
        subscriptions: &[Subscription],
    ) -> Vec<Event> {
        let now = self.clock.now();
        let mut subs: Vec<&Subscription> =
            subscriptions.iter().filter(|s| s.enabled).collect();
        subs.sort_by(|a, b| b.modified_on.cmp(&a.modified_on));

        let mut events = Vec::new();
        for tx in batch {
            let kind = EventKind::new(tx.class, tx.action());
            for sub in &subs {
                match self.event_for(tx, kind, sub, control, now) {
                    Ok(Some(event)) => events.push(event),
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(
                            subscription = %sub.id,
                            object_id = %tx.object_id,
                            kind = %kind,
                            error = %format!("{error:#}"),
                            "dropping subscription branch"
                        );
                    }
                }
            }
        }
        events
    }

    fn event_for(
        &self,
        tx: &ChangeTx,
        kind: EventKind,
        sub: &Subscription,
        control: &dyn PlatformControl,
        now: DateTime<Utc>,
    ) -> Result<Option<Event>> {
        if !sub.wants(kind) {
            return Ok(None);
        }

        // Scope filters are conjunctive: both must pass when both are set.
        if let Some(space) = &sub.space
            && *space != tx.space
        {
            return Ok(None);
        }
        if let Some(projects) = &sub.projects
            && let Some(project) = owning_project(tx)
            && !projects.iter().any(|p| p == project)
        {
            return Ok(None);
        }

        let event_id = Uuid::new_v4().to_string();
        let payload = self.build_envelope(tx, kind, control, now, &event_id)?;

        Ok(Some(Event {
            id: event_id,
            kind,
            object_id: tx.object_id.clone(),
            object_class: tx.class,
            subscription_id: sub.id.clone(),
            payload,
            status: EventStatus::Pending,
            attempts: 0,
            created_on: now,
            last_attempted_on: None,
            next_attempt_after: now,
            last_error: None,
        }))
    }

    fn build_envelope(
        &self,
        tx: &ChangeTx,
        kind: EventKind,
        control: &dyn PlatformControl,
        now: DateTime<Utc>,
        event_id: &str,
    ) -> Result<EventEnvelope> {
        let action = tx.action();
        let (object, operations) = match &tx.detail {
            TxDetail::Created { attributes } => {
                let object = control
                    .current_object(tx.class, &tx.object_id)
                    .context("resolving created object state")?
                    .or_else(|| Some(attributes.clone()));
                (object, None)
            }
            TxDetail::Updated { operations } => {
                let object = control
                    .current_object(tx.class, &tx.object_id)
                    .context("resolving post-update object state")?;
                (object, Some(strip_bookkeeping(operations)))
            }
            TxDetail::Removed => (control.removed_object(tx.class, &tx.object_id), None),
        };

        Ok(EventEnvelope {
            event: EnvelopeEvent {
                id: event_id.to_string(),
                timestamp: now.timestamp_millis(),
                kind,
                action,
                object_id: tx.object_id.clone(),
                object_class: tx.class,
            },
            workspace: control.workspace().name.clone(),
            modified_by: tx.modified_by.clone(),
            data: EnvelopeData { action, object, operations },
        })
    }
}
