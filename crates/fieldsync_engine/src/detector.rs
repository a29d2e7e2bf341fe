//! Conflict detection.
//!
//! The detector runs when the server refuses an operation's base version.
//! It classifies the operation against the server's current state:
//!
//! | Operation | Server state            | Verdict                              |
//! |-----------|-------------------------|--------------------------------------|
//! | Create    | absent                  | Clean                                |
//! | Create    | present                 | AutoResolved(NoOp)                   |
//! | any       | version == base         | Clean                                |
//! | Delete    | absent                  | AutoResolved(NoOp)                   |
//! | Update    | disjoint field changes  | AutoResolved(Submit) on the new base |
//! | otherwise |                         | policy decision, or Conflict         |

use fieldsync_protocol::{
    apply_patch, changed_fields, Conflict, ConflictId, ConflictPolicy, ConflictResolution,
    Operation, OperationKind, Record, ResourceSnapshot, Timestamp,
};
use serde_json::Value;
use std::collections::BTreeSet;

/// How an operation should proceed after a version mismatch.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Submit as is.
    Clean,
    /// Proceed without asking anyone.
    AutoResolved(Resolution),
    /// Park the operation until someone decides.
    Conflict(Conflict),
}

/// An automatic resolution.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The server already reflects the intent; mark applied.
    NoOp,
    /// Submit this rewritten operation instead.
    Submit(Operation),
    /// Drop the local intent and adopt the server's state. The conflict
    /// is recorded already resolved.
    KeepRemote(Conflict),
}

/// Classifies operations against the server's current state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector {
    policy: ConflictPolicy,
}

impl ConflictDetector {
    /// Creates a detector with a policy for overlapping changes.
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    /// The policy for overlapping changes.
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Classifies `op` against `server`.
    pub fn check(
        &self,
        op: &Operation,
        server: Option<&ResourceSnapshot>,
        now: Timestamp,
    ) -> Verdict {
        if let (Some(remote), Some(base)) = (server, op.base_version) {
            if remote.version == base && op.kind != OperationKind::Create {
                return Verdict::Clean;
            }
        }

        match op.kind {
            OperationKind::Create => match server {
                None => Verdict::Clean,
                Some(_) => Verdict::AutoResolved(Resolution::NoOp),
            },
            OperationKind::Delete => self.check_delete(op, server, now),
            OperationKind::Update => self.check_update(op, server, now),
        }
    }

    fn check_delete(
        &self,
        op: &Operation,
        server: Option<&ResourceSnapshot>,
        now: Timestamp,
    ) -> Verdict {
        let Some(remote) = server else {
            return Verdict::AutoResolved(Resolution::NoOp);
        };

        if op.base_payload.as_ref() == Some(&remote.payload) {
            return Verdict::AutoResolved(Resolution::Submit(rebase(op, remote)));
        }

        let fields = remote_changes(op, remote).into_iter().collect();
        self.decide(op, server, fields, now)
    }

    fn check_update(
        &self,
        op: &Operation,
        server: Option<&ResourceSnapshot>,
        now: Timestamp,
    ) -> Verdict {
        let patch = op.payload.clone().unwrap_or_default();

        let Some(remote) = server else {
            let fields = patch.keys().cloned().collect();
            return self.decide(op, None, fields, now);
        };

        let remote_changed = remote_changes(op, remote);
        let overlapping: Vec<String> = patch
            .iter()
            .filter(|(field, desired)| {
                remote_changed.contains(*field) && !agrees(remote.payload.get(*field), desired)
            })
            .map(|(field, _)| field.clone())
            .collect();

        if overlapping.is_empty() {
            return Verdict::AutoResolved(Resolution::Submit(rebase(op, remote)));
        }
        self.decide(op, server, overlapping, now)
    }

    fn decide(
        &self,
        op: &Operation,
        server: Option<&ResourceSnapshot>,
        conflicting_fields: Vec<String>,
        now: Timestamp,
    ) -> Verdict {
        let remote_at = server.map(|s| s.updated_at);
        match (self.policy.resolve(op.enqueued_at, remote_at), server) {
            (None, _) => Verdict::Conflict(build_conflict(op, server, conflicting_fields, now)),
            (Some(ConflictResolution::KeepRemote), _) => {
                let mut conflict = build_conflict(op, server, conflicting_fields, now);
                conflict.resolution = ConflictResolution::KeepRemote;
                Verdict::AutoResolved(Resolution::KeepRemote(conflict))
            }
            (Some(_), Some(remote)) => {
                Verdict::AutoResolved(Resolution::Submit(rebase(op, remote)))
            }
            (Some(_), None) => match recreate(op) {
                Some(op) => Verdict::AutoResolved(Resolution::Submit(op)),
                None => Verdict::AutoResolved(Resolution::NoOp),
            },
        }
    }
}

/// Fields the server changed since the operation's base. Without a known
/// base every remote field counts as changed.
fn remote_changes(op: &Operation, remote: &ResourceSnapshot) -> BTreeSet<String> {
    match &op.base_payload {
        Some(base) => changed_fields(base, &remote.payload),
        None => remote.payload.keys().cloned().collect(),
    }
}

/// Returns true if the server value already equals what the patch wants.
fn agrees(remote: Option<&Value>, desired: &Value) -> bool {
    match remote {
        None => desired.is_null(),
        Some(value) => value == desired,
    }
}

/// The operation re-based on the server's current version.
fn rebase(op: &Operation, remote: &ResourceSnapshot) -> Operation {
    Operation {
        base_version: Some(remote.version),
        base_payload: Some(remote.payload.clone()),
        ..op.clone()
    }
}

/// The operation turned into a Create of its intended record, for a
/// resource the server no longer has. A Delete has nothing to re-create.
fn recreate(op: &Operation) -> Option<Operation> {
    if op.kind == OperationKind::Delete {
        return None;
    }
    let base = op.base_payload.clone().unwrap_or_default();
    let record: Record = match &op.payload {
        Some(patch) if op.kind == OperationKind::Update => apply_patch(&base, patch),
        Some(payload) => payload.clone(),
        None => base,
    };
    Some(Operation {
        kind: OperationKind::Create,
        payload: Some(record),
        base_version: None,
        base_payload: None,
        ..op.clone()
    })
}

fn build_conflict(
    op: &Operation,
    server: Option<&ResourceSnapshot>,
    conflicting_fields: Vec<String>,
    now: Timestamp,
) -> Conflict {
    Conflict {
        conflict_id: ConflictId::new(),
        operation_id: op.operation_id,
        kind: op.kind,
        key: op.key(),
        local_payload: op.payload.clone(),
        base_version: op.base_version,
        base_payload: op.base_payload.clone(),
        remote_payload: server.map(|s| s.payload.clone()),
        remote_version: server.map(|s| s.version),
        conflicting_fields,
        detected_at: now,
        resolution: ConflictResolution::Pending,
    }
}
