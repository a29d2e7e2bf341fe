//! # fieldsync Engine
//!
//! Offline-first data sync for field clients.
//!
//! This crate provides:
//! - A durable local store of cached resources with optimistic views
//! - A durable operation queue of mutation intents
//! - Conflict detection against the server's current state
//! - A sync orchestrator with retry, backoff and cancellation
//! - A status publisher for UI consumers
//! - An HTTP transport abstraction
//!
//! ## Architecture
//!
//! User actions never talk to the server. They are written to the
//! operation queue and applied to the local store, then the orchestrator
//! drains the queue when connectivity allows:
//!
//! ```text
//! create/update/delete ──▶ OperationQueue ──▶ SyncEngine ──▶ RemoteApi
//!          │                                     │
//!          └──────────▶ LocalStore ◀─────────────┘
//!                           │
//!                    StatusPublisher ──▶ listeners
//! ```
//!
//! Both stores are append-only journals replayed on open, so a crash at
//! any point leaves the last acknowledged state intact.
//!
//! ## Key Invariants
//!
//! - An operation is durable before `enqueue` returns
//! - Operations on the same resource are submitted in enqueue order
//! - Every submit carries the operation id, so retries are idempotent
//! - An operation leaves the queue only on an explicit server answer
//! - A conflict is never resolved silently under the manual policy
//! - At most one sync pass runs at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod connectivity;
mod data_dir;
mod detector;
mod error;
mod http;
mod local_store;
mod orchestrator;
mod queue;
mod status;
#[cfg(test)]
mod testing;
mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetryConfig, SyncConfig};
pub use connectivity::Connectivity;
pub use data_dir::{operations_path, resources_path, DataDir};
pub use detector::{ConflictDetector, Resolution, Verdict};
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpResponse, HttpTransport, LoopbackClient, LoopbackServer};
pub use local_store::{replay, store_record_name, CachedResource, LocalStore};
pub use orchestrator::{PassOutcome, SyncEngine, SyncReport, SyncStats, PROVISIONAL_ID_PREFIX};
pub use queue::{
    queue_record_name, AppliedOutcome, OperationQueue, Rejection, SETTLED_RETENTION,
};
pub use status::{
    PersistentError, StatusPublisher, Subscription, SyncProgress, SyncSnapshot, SyncState,
};
pub use transport::{MockRemote, MockReply, RemoteApi};

pub use fieldsync_protocol::{
    Conflict, ConflictId, ConflictPolicy, ConflictResolution, Operation, OperationId,
    OperationInput, OperationKind, OperationStatus, Record, ResourceKey, ResourceSnapshot,
    Timestamp, Version,
};
