//! # Conflict Resolution
//!
//! Decides which version of a record survives when a remote change meets a
//! local copy that differs from it.
//!
//! ## Features
//!
//! - **Pure Transitions**: the outcome depends only on the two timestamps and the strategy
//! - **Fail-Safe**: unparseable timestamps always resolve to the remote version
//! - **Field Merge**: timestamp ties keep user-authored fields from the local copy
//! - **Audit Trail**: every resolution produces an audit line
//!
//! ## States
//!
//! `Detected` is the entry state. It moves to exactly one of `LocalWins`,
//! `RemoteWins`, `Merged` or `ManualPending`:
//!
//! | Strategy | local < remote | local = remote | local > remote |
//! |---|---|---|---|
//! | last-write-wins | RemoteWins | Merged | LocalWins |
//! | remote-wins | RemoteWins | RemoteWins | RemoteWins |
//! | local-wins | LocalWins | LocalWins | LocalWins |
//! | manual | ManualPending | ManualPending | ManualPending |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::shared::timestamp::{record_updated_at, to_canonical, UPDATED_AT_FIELD};

/// Conflict resolution strategies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Keep the version with the later `updated_at`, merge on ties
    #[default]
    LastWriteWins,
    /// Always prefer remote changes
    RemoteWins,
    /// Always prefer local changes
    LocalWins,
    /// Flag the record for manual resolution
    Manual,
}

/// States of a single conflict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    Detected,
    LocalWins,
    RemoteWins,
    Merged,
    ManualPending,
}

impl ConflictState {
    /// Whether the resolution writes new data to the local store
    pub fn applies_remote(&self) -> bool {
        matches!(self, ConflictState::RemoteWins | ConflictState::Merged)
    }
}

/// Transition out of `Detected`
pub fn transition(
    local: Option<DateTime<Utc>>,
    remote: Option<DateTime<Utc>>,
    strategy: ConflictStrategy,
) -> ConflictState {
    let (Some(local), Some(remote)) = (local, remote) else {
        return ConflictState::RemoteWins;
    };

    match strategy {
        ConflictStrategy::RemoteWins => ConflictState::RemoteWins,
        ConflictStrategy::LocalWins => ConflictState::LocalWins,
        ConflictStrategy::Manual => ConflictState::ManualPending,
        ConflictStrategy::LastWriteWins => match local.cmp(&remote) {
            std::cmp::Ordering::Less => ConflictState::RemoteWins,
            std::cmp::Ordering::Greater => ConflictState::LocalWins,
            std::cmp::Ordering::Equal => ConflictState::Merged,
        },
    }
}

/// Field-level merge: remote values win except for `user_fields`, which
/// keep the local value when the local copy has one
pub fn merge_fields(local: &Value, remote: &Value, user_fields: &[String]) -> Value {
    let mut merged = local.as_object().cloned().unwrap_or_default();
    if let Some(remote) = remote.as_object() {
        for (key, value) in remote {
            if user_fields.iter().any(|f| f == key) && merged.contains_key(key) {
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub state: ConflictState,
    /// Payload to store; `None` when the local copy stays untouched
    pub data: Option<Value>,
    /// Absolute distance between the two timestamps
    pub skew: Option<chrono::Duration>,
    /// Human-readable audit line
    pub audit: String,
}

impl Resolution {
    /// Whether the skew is large enough to tell the user about
    pub fn exceeds_skew(&self, threshold: chrono::Duration) -> bool {
        self.skew.map(|s| s > threshold).unwrap_or(false)
            && matches!(self.state, ConflictState::RemoteWins | ConflictState::LocalWins)
    }
}

/// Resolve a conflict between a local payload and a remote payload
pub fn resolve(
    table: &str,
    record_id: &str,
    local: &Value,
    remote: &Value,
    user_fields: &[String],
    strategy: ConflictStrategy,
) -> Resolution {
    let local_ts = record_updated_at(local);
    let remote_ts = record_updated_at(remote);
    let state = transition(local_ts, remote_ts, strategy);

    let data = match state {
        ConflictState::RemoteWins => Some(never_older(remote.clone(), local_ts, remote_ts)),
        ConflictState::Merged => Some(merge_fields(local, remote, user_fields)),
        ConflictState::LocalWins | ConflictState::ManualPending | ConflictState::Detected => None,
    };

    let skew = match (local_ts, remote_ts) {
        (Some(l), Some(r)) => Some((r - l).abs()),
        _ => None,
    };

    let audit = format!(
        "{}/{}: {:?} -> {:?} (strategy {:?}, local {}, remote {})",
        table,
        record_id,
        ConflictState::Detected,
        state,
        strategy,
        local_ts.as_ref().map(to_canonical).unwrap_or_else(|| "invalid".into()),
        remote_ts.as_ref().map(to_canonical).unwrap_or_else(|| "invalid".into()),
    );

    Resolution {
        state,
        data,
        skew,
        audit,
    }
}

/// Keep `updated_at` from moving backwards when an older remote version wins
fn never_older(
    mut data: Value,
    local: Option<DateTime<Utc>>,
    remote: Option<DateTime<Utc>>,
) -> Value {
    if let (Some(local), Some(remote)) = (local, remote) {
        if local > remote {
            if let Some(object) = data.as_object_mut() {
                object.insert(UPDATED_AT_FIELD.into(), Value::String(to_canonical(&local)));
            }
        }
    }
    data
}
