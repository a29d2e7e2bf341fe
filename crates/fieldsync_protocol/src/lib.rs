//! # fieldsync Protocol
//!
//! Types shared by the offline engine and the system of record.
//!
//! This crate provides:
//! - [`Operation`] and [`OperationInput`] for queued mutation intents
//! - [`Conflict`], [`ConflictResolution`] and [`ConflictPolicy`]
//! - [`ResourceSnapshot`] and field-level record helpers
//! - Submit and fetch messages with CBOR encoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod conflict;
mod error;
mod messages;
mod operation;
mod resource;

pub use codec::{from_cbor, to_cbor};
pub use conflict::{Conflict, ConflictId, ConflictPolicy, ConflictResolution};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{FetchRequest, FetchResponse, SubmitRequest, SubmitResponse};
pub use operation::{Operation, OperationId, OperationInput, OperationKind, OperationStatus};
pub use resource::{
    apply_patch, changed_fields, is_valid_resource_type, replacement_patch, Record, ResourceKey,
    ResourceSnapshot, Timestamp, Version,
};
