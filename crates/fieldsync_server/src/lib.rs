//! # fieldsync Server
//!
//! Reference in-memory system of record for fieldsync clients.
//!
//! This crate provides:
//! - Submit and fetch endpoints per resource type
//! - Idempotent handling by operation id
//! - Optimistic concurrency with version mismatches carrying current state
//! - Required-field validation and id assignment
//!
//! # Protocol
//!
//! ```text
//! POST /sync/{resource_type}/submit   200 applied | 409 mismatch | 422 rejected
//! POST /sync/{resource_type}/fetch    200 with the current state, if any
//! ```
//!
//! Bodies are CBOR. The server is used by integration tests and local
//! development; it keeps everything in memory.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;
mod store;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use server::SyncServer;
pub use store::ResourceStore;
