//! Conflict records and resolution policy.

use crate::operation::{OperationId, OperationKind};
use crate::resource::{Record, ResourceKey, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Conflict identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(pub Uuid);

impl ConflictId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A queued Update or Delete whose base no longer matches the server.
///
/// Both sides are preserved verbatim until someone decides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict id.
    pub conflict_id: ConflictId,
    /// The parked operation.
    pub operation_id: OperationId,
    /// Kind of the parked operation.
    pub kind: OperationKind,
    /// Resource in dispute.
    pub key: ResourceKey,
    /// The operation's payload (patch for Update, `None` for Delete).
    pub local_payload: Option<Record>,
    /// Version the operation was formed against.
    pub base_version: Option<Version>,
    /// Authoritative record at `base_version`, if it was known.
    pub base_payload: Option<Record>,
    /// Server's current record; `None` if the server no longer has it.
    pub remote_payload: Option<Record>,
    /// Server's current version.
    pub remote_version: Option<Version>,
    /// Fields both sides changed to different values.
    pub conflicting_fields: Vec<String>,
    /// When the conflict was detected.
    pub detected_at: Timestamp,
    /// Current resolution.
    pub resolution: ConflictResolution,
}

impl Conflict {
    /// Returns true once a resolution other than `Pending` is recorded.
    pub fn is_resolved(&self) -> bool {
        !matches!(self.resolution, ConflictResolution::Pending)
    }

    /// Returns true if the server no longer has the resource.
    pub fn is_remote_deleted(&self) -> bool {
        self.remote_version.is_none()
    }
}

/// Resolution for a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Awaiting a decision.
    Pending,
    /// Re-apply the local intent on top of the server's version.
    KeepLocal,
    /// Discard the local intent and adopt the server's record.
    KeepRemote,
    /// Replace the record with this merged value.
    Merged(Record),
}

/// Policy for conflicts on overlapping fields.
///
/// Field-disjoint edits are always merged; the policy only applies when
/// both sides changed the same field to different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Park the conflict for an explicit decision.
    #[default]
    Manual,
    /// The server's record always wins.
    ServerWins,
    /// The local intent always wins.
    ClientWins,
    /// The later of the local enqueue time and the server's update time
    /// wins; a tie goes to the server.
    LastWriteWins,
}

impl ConflictPolicy {
    /// Returns true if this policy never parks conflicts.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }

    /// Picks `KeepLocal` or `KeepRemote`, or `None` when a decision is
    /// required.
    pub fn resolve(
        &self,
        local_at: Timestamp,
        remote_at: Option<Timestamp>,
    ) -> Option<ConflictResolution> {
        match self {
            ConflictPolicy::Manual => None,
            ConflictPolicy::ServerWins => Some(ConflictResolution::KeepRemote),
            ConflictPolicy::ClientWins => Some(ConflictResolution::KeepLocal),
            ConflictPolicy::LastWriteWins => match remote_at {
                Some(remote_at) if remote_at >= local_at => Some(ConflictResolution::KeepRemote),
                _ => Some(ConflictResolution::KeepLocal),
            },
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictPolicy::Manual => "manual",
            ConflictPolicy::ServerWins => "server-wins",
            ConflictPolicy::ClientWins => "client-wins",
            ConflictPolicy::LastWriteWins => "last-write-wins",
        };
        f.write_str(name)
    }
}
