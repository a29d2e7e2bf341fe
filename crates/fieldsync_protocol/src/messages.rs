//! Messages exchanged with the system of record.

use crate::codec::{from_cbor, to_cbor};
use crate::error::ProtocolResult;
use crate::operation::{OperationId, OperationKind};
use crate::resource::{Record, ResourceKey, ResourceSnapshot, Version};
use serde::{Deserialize, Serialize};

/// Submission of one operation to its resource type's endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Idempotency key.
    pub operation_id: OperationId,
    /// Logical collection.
    pub resource_type: String,
    /// Resource id; provisional for Create.
    pub resource_id: String,
    /// Kind of mutation.
    pub kind: OperationKind,
    /// Full record, patch, or `None` for Delete.
    pub payload: Option<Record>,
    /// Version the client formed the mutation against.
    pub base_version: Option<Version>,
}

impl SubmitRequest {
    /// Returns the resource key.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type.clone(), self.resource_id.clone())
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// The server's answer to a [`SubmitRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubmitResponse {
    /// The mutation is now part of the authoritative state.
    Applied {
        /// Final resource id (differs from a provisional id after Create).
        resource_id: String,
        /// New authoritative version.
        version: Version,
        /// Record after the mutation; `None` after Delete.
        payload: Option<Record>,
        /// True if this operation id had already been applied and the
        /// stored outcome is being returned again.
        replayed: bool,
    },
    /// The mutation is invalid and will never be accepted.
    Rejected {
        /// Human-readable reason.
        reason: String,
    },
    /// The base version does not match; carries the current state.
    VersionMismatch {
        /// Current record, or `None` if the resource does not exist.
        current: Option<ResourceSnapshot>,
    },
}

impl SubmitResponse {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// Request for a resource's current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Logical collection.
    pub resource_type: String,
    /// Resource id.
    pub resource_id: String,
}

impl FetchRequest {
    /// Creates a request for `key`.
    pub fn for_key(key: &ResourceKey) -> Self {
        Self {
            resource_type: key.resource_type.clone(),
            resource_id: key.resource_id.clone(),
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// The server's answer to a [`FetchRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// Current state, or `None` if the resource does not exist.
    pub current: Option<ResourceSnapshot>,
}

impl FetchResponse {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mismatch_carries_server_state() {
        let payload: Record =
            serde_json::from_value(json!({"status": "approved", "acres": 2.5})).unwrap();
        let response = SubmitResponse::VersionMismatch {
            current: Some(ResourceSnapshot {
                key: ResourceKey::new("farmer-record", "f-1"),
                version: Version(6),
                payload: payload.clone(),
                updated_at: 1_700_000_000_123,
            }),
        };

        let decoded = SubmitResponse::decode(&response.encode().unwrap()).unwrap();
        match decoded {
            SubmitResponse::VersionMismatch { current: Some(s) } => {
                assert_eq!(s.version, Version(6));
                assert_eq!(s.payload, payload);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn request_with_null_patch_field() {
        let patch: Record = serde_json::from_value(json!({"notes": null})).unwrap();
        let request = SubmitRequest {
            operation_id: OperationId::new(),
            resource_type: "farm-plot".into(),
            resource_id: "plot-1".into(),
            kind: OperationKind::Update,
            payload: Some(patch),
            base_version: Some(Version(2)),
        };

        let decoded = SubmitRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.key().to_string(), "farm-plot:plot-1");
    }
}
