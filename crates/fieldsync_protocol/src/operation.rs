//! Queued mutation intents.

use crate::conflict::ConflictId;
use crate::messages::SubmitRequest;
use crate::resource::{Record, ResourceKey, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Client-generated operation identifier, stable across retries.
///
/// The server deduplicates submissions by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Create a new resource under a provisional id.
    Create,
    /// Patch fields of an existing resource.
    Update,
    /// Delete a resource.
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Where an operation is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Waiting to be submitted, or waiting to be retried.
    Pending,
    /// Accepted by the server.
    Applied,
    /// Definitively refused by the server.
    Rejected {
        /// The server's reason.
        reason: String,
    },
    /// Parked until the named conflict is resolved.
    Conflicted {
        /// The pending conflict.
        conflict_id: ConflictId,
    },
}

impl OperationStatus {
    /// Returns true for `Applied`, `Rejected` and `Conflicted`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Pending)
    }

    /// Short lowercase label.
    pub fn label(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Applied => "applied",
            OperationStatus::Rejected { .. } => "rejected",
            OperationStatus::Conflicted { .. } => "conflicted",
        }
    }
}

/// What a caller supplies to enqueue a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationInput {
    /// Kind of mutation.
    pub kind: OperationKind,
    /// Logical collection name.
    pub resource_type: String,
    /// Resource id; provisional for Create.
    pub resource_id: String,
    /// Full record for Create, patch for Update, `None` for Delete.
    pub payload: Option<Record>,
    /// Version the caller last observed; `None` for Create and for
    /// resources that only exist locally.
    pub base_version: Option<Version>,
    /// The authoritative record at `base_version`.
    pub base_payload: Option<Record>,
}

impl OperationInput {
    /// A Create of a full record.
    pub fn create(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        payload: Record,
    ) -> Self {
        Self {
            kind: OperationKind::Create,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            payload: Some(payload),
            base_version: None,
            base_payload: None,
        }
    }

    /// An Update applying `patch` on top of the observed base.
    pub fn update(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        patch: Record,
        base_version: Option<Version>,
        base_payload: Option<Record>,
    ) -> Self {
        Self {
            kind: OperationKind::Update,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            payload: Some(patch),
            base_version,
            base_payload,
        }
    }

    /// A Delete of the observed base.
    pub fn delete(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        base_version: Option<Version>,
        base_payload: Option<Record>,
    ) -> Self {
        Self {
            kind: OperationKind::Delete,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            payload: None,
            base_version,
            base_payload,
        }
    }

    /// Returns the resource key.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type.clone(), self.resource_id.clone())
    }
}

/// A queued mutation intent with its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Idempotency key.
    pub operation_id: OperationId,
    /// Queue sequence number; orders operations on the device.
    pub seq: u64,
    /// Kind of mutation.
    pub kind: OperationKind,
    /// Logical collection name.
    pub resource_type: String,
    /// Resource id.
    pub resource_id: String,
    /// Full record for Create, patch for Update, `None` for Delete.
    pub payload: Option<Record>,
    /// Version the operation was formed against.
    pub base_version: Option<Version>,
    /// Authoritative record at `base_version`.
    pub base_payload: Option<Record>,
    /// Client timestamp at enqueue.
    pub enqueued_at: Timestamp,
    /// Failed submission attempts so far.
    pub attempt_count: u32,
    /// Last transient failure.
    pub last_error: Option<String>,
    /// Earliest time of the next attempt.
    pub next_attempt_at: Option<Timestamp>,
    /// Lifecycle state.
    pub status: OperationStatus,
}

impl Operation {
    /// Builds a pending operation from caller input.
    pub fn from_input(
        input: OperationInput,
        operation_id: OperationId,
        seq: u64,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            operation_id,
            seq,
            kind: input.kind,
            resource_type: input.resource_type,
            resource_id: input.resource_id,
            payload: input.payload,
            base_version: input.base_version,
            base_payload: input.base_payload,
            enqueued_at,
            attempt_count: 0,
            last_error: None,
            next_attempt_at: None,
            status: OperationStatus::Pending,
        }
    }

    /// Returns the resource key.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type.clone(), self.resource_id.clone())
    }

    /// Returns true unless the operation is still pending.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The message sent to the server for this operation.
    pub fn to_request(&self) -> SubmitRequest {
        SubmitRequest {
            operation_id: self.operation_id,
            resource_type: self.resource_type.clone(),
            resource_id: self.resource_id.clone(),
            kind: self.kind,
            payload: self.payload.clone(),
            base_version: self.base_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{from_cbor, to_cbor};
    use serde_json::json;

    fn patch() -> Record {
        serde_json::from_value(json!({"status": "inspected", "notes": null})).unwrap()
    }

    #[test]
    fn operation_survives_cbor() {
        let input = OperationInput::update("farm-plot", "plot-3", patch(), Some(Version(5)), None);
        let mut op = Operation::from_input(input, OperationId::new(), 12, 1_700_000_000_000);
        op.attempt_count = 2;
        op.last_error = Some("timeout".into());
        op.status = OperationStatus::Rejected {
            reason: "missing boundary".into(),
        };

        let decoded: Operation = from_cbor(&to_cbor(&op).unwrap()).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn terminal_states() {
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(OperationStatus::Applied.is_terminal());
        assert!(OperationStatus::Conflicted {
            conflict_id: ConflictId::new()
        }
        .is_terminal());
    }

    #[test]
    fn request_carries_identity_and_base() {
        let input = OperationInput::delete("gps-coordinate", "pt-9", Some(Version(3)), None);
        let op = Operation::from_input(input, OperationId::new(), 1, 0);

        let request = op.to_request();
        assert_eq!(request.operation_id, op.operation_id);
        assert_eq!(request.kind, OperationKind::Delete);
        assert_eq!(request.base_version, Some(Version(3)));
        assert!(request.payload.is_none());
    }
}
