//! Hash-chained append-only audit log.
//!
//! Single-writer: a process-wide mutex serializes `append`.  The cached
//! `last_hash` is seeded from the persisted tail on first use and only
//! advances after the store accepts the entry.  Callers must not hold other
//! locks while awaiting `append`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::store::{HistorianStore, StoreError};

/// `previous_hash` of the first entry in a chain.
pub const GENESIS: &str = "GENESIS";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditActor {
    pub user_id: Option<String>,
    pub device_id: Option<String>,
}

impl AuditActor {
    pub fn device(device_id: impl Into<String>) -> Self {
        AuditActor {
            user_id: None,
            device_id: Some(device_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditAction {
    Create,
    Read,
    Update,
    Delete,
    Export,
    Ingest,
    Archive,
    Other(String),
}

impl AuditAction {
    pub fn as_str(&self) -> &str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Read => "READ",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::Export => "EXPORT",
            AuditAction::Ingest => "INGEST",
            AuditAction::Archive => "ARCHIVE",
            AuditAction::Other(verb) => verb,
        }
    }
}

/// One persisted chain entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub actor: Option<AuditActor>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub checksum: String,
    pub previous_hash: String,
}

impl AuditEntry {
    /// Recompute the checksum from the stored fields.
    pub fn compute_checksum(&self) -> String {
        canonical_checksum(
            self.timestamp,
            &self.action,
            &self.resource_type,
            self.resource_id.as_deref(),
            self.actor.as_ref(),
            self.old_value.as_ref(),
            self.new_value.as_ref(),
            self.reason.as_deref(),
            &self.previous_hash,
        )
    }
}

/// What to append; everything else (id, timestamp, hashes) is assigned by
/// the chain.
#[derive(Debug, Clone, Default)]
pub struct AuditEvent {
    pub action: Option<AuditAction>,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub actor: Option<AuditActor>,
    pub reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, resource_type: impl Into<String>) -> Self {
        AuditEvent {
            action: Some(action),
            resource_type: resource_type.into(),
            ..AuditEvent::default()
        }
    }

    pub fn resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn new_value(mut self, value: serde_json::Value) -> Self {
        self.new_value = Some(value);
        self
    }

    pub fn old_value(mut self, value: serde_json::Value) -> Self {
        self.old_value = Some(value);
        self
    }

    pub fn actor(mut self, actor: AuditActor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A verification finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditViolation {
    pub id: i64,
    pub kind: ViolationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// `previous_hash` does not equal the prior entry's checksum.
    ChainBreak,
    /// Stored checksum does not match the recomputed one.
    ChecksumMismatch,
}

/// The process-wide chain head.
pub struct AuditChain {
    store: Arc<dyn HistorianStore>,
    last_hash: Mutex<Option<String>>,
}

impl AuditChain {
    pub fn new(store: Arc<dyn HistorianStore>) -> Self {
        AuditChain {
            store,
            last_hash: Mutex::new(None),
        }
    }

    /// Append one entry.  Persistence failure leaves `last_hash` untouched
    /// and propagates; the chain never advances past an unpersisted entry.
    pub async fn append(&self, event: AuditEvent) -> Result<AuditEntry, StoreError> {
        let mut last_hash = self.last_hash.lock().await;
        let previous_hash = match last_hash.as_ref() {
            Some(h) => h.clone(),
            None => self
                .store
                .audit_tail_checksum()
                .await?
                .unwrap_or_else(|| GENESIS.to_owned()),
        };

        let action = event
            .action
            .unwrap_or(AuditAction::Other("UNKNOWN".to_owned()));
        let mut entry = AuditEntry {
            id: 0,
            timestamp: Utc::now(),
            actor: event.actor,
            action: action.as_str().to_owned(),
            resource_type: event.resource_type,
            resource_id: event.resource_id,
            old_value: event.old_value,
            new_value: event.new_value,
            reason: event.reason,
            metadata: event.metadata,
            checksum: String::new(),
            previous_hash,
        };
        entry.checksum = entry.compute_checksum();

        let persisted = self.store.append_audit(entry).await?;
        *last_hash = Some(persisted.checksum.clone());
        Ok(persisted)
    }

    /// Walk entries in ascending id, re-deriving the chain.  Read-only.
    pub async fn verify(
        &self,
        from_id: Option<i64>,
        to_id: Option<i64>,
    ) -> Result<Vec<AuditViolation>, StoreError> {
        let entries = self.store.load_audit_range(from_id, to_id).await?;
        let mut violations = Vec::new();
        let Some(first) = entries.first() else { return Ok(violations) };

        // Seed the expected tail: GENESIS at the chain head, otherwise the
        // stored checksum of the entry just before the range.
        let mut expected_prev = if first.id <= 1 {
            GENESIS.to_owned()
        } else {
            self.store
                .load_audit_range(Some(first.id - 1), Some(first.id - 1))
                .await?
                .first()
                .map(|e| e.checksum.clone())
                .unwrap_or_else(|| GENESIS.to_owned())
        };

        for entry in &entries {
            if entry.previous_hash != expected_prev {
                violations.push(AuditViolation {
                    id: entry.id,
                    kind: ViolationKind::ChainBreak,
                });
            }
            let recomputed = entry.compute_checksum();
            if recomputed != entry.checksum {
                violations.push(AuditViolation {
                    id: entry.id,
                    kind: ViolationKind::ChecksumMismatch,
                });
            }
            // The chain continues from the recomputed value, so a tampered
            // entry also breaks its successor.
            expected_prev = recomputed;
        }
        Ok(violations)
    }
}

/// SHA-256 over the canonical JSON of the checksummed field subset:
/// UTF-8, no whitespace, keys in this declaration order.
#[allow(clippy::too_many_arguments)]
fn canonical_checksum(
    timestamp: DateTime<Utc>,
    action: &str,
    resource_type: &str,
    resource_id: Option<&str>,
    actor: Option<&AuditActor>,
    old: Option<&serde_json::Value>,
    new: Option<&serde_json::Value>,
    reason: Option<&str>,
    previous_hash: &str,
) -> String {
    #[derive(Serialize)]
    struct Canonical<'a> {
        timestamp: String,
        action: &'a str,
        resource_type: &'a str,
        resource_id: Option<&'a str>,
        actor: Option<&'a AuditActor>,
        old: Option<&'a serde_json::Value>,
        new: Option<&'a serde_json::Value>,
        reason: Option<&'a str>,
        previous_hash: &'a str,
    }
    let canonical = Canonical {
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        action,
        resource_type,
        resource_id,
        actor,
        old,
        new,
        reason,
        previous_hash,
    };
    let bytes = serde_json::to_vec(&canonical).expect("canonical entry serializes");
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_checksum_is_order_stable_and_input_sensitive() {
        let t = Utc::now();
        let a = canonical_checksum(t, "INGEST", "telemetry_batch", None, None, None, None, None, GENESIS);
        let b = canonical_checksum(t, "INGEST", "telemetry_batch", None, None, None, None, None, GENESIS);
        assert_eq!(a, b);

        let c = canonical_checksum(t, "INGEST", "event_batch", None, None, None, None, None, GENESIS);
        assert_ne!(a, c);

        let d = canonical_checksum(t, "INGEST", "telemetry_batch", None, None, None, None, None, "other");
        assert_ne!(a, d);
    }

    #[test]
    fn entry_checksum_ignores_metadata() {
        let mut entry = AuditEntry {
            id: 1,
            timestamp: Utc::now(),
            actor: None,
            action: "CREATE".to_owned(),
            resource_type: "stream".to_owned(),
            resource_id: Some("telemetry".to_owned()),
            old_value: None,
            new_value: Some(serde_json::json!({ "subjects": ["telemetry.>"] })),
            reason: None,
            metadata: None,
            checksum: String::new(),
            previous_hash: GENESIS.to_owned(),
        };
        let a = entry.compute_checksum();
        entry.metadata = Some(serde_json::json!({ "operator": "night-shift" }));
        assert_eq!(a, entry.compute_checksum());

        entry.new_value = Some(serde_json::json!({ "subjects": ["tampered.>"] }));
        assert_ne!(a, entry.compute_checksum());
    }
}
