//! Main reference server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::store::ResourceStore;
use fieldsync_protocol::{
    FetchRequest, FetchResponse, Record, ResourceKey, ResourceSnapshot, SubmitRequest,
    SubmitResponse, Version,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// An in-memory system of record.
///
/// Implements the submit and fetch endpoints with idempotency by
/// operation id, optimistic concurrency on versions, per-type
/// required-field validation and id assignment for provisional ids. Test
/// helpers simulate concurrent edits by other users and outages.
///
/// # Example
///
/// ```
/// use fieldsync_server::{SyncServer, ServerConfig};
///
/// let server = SyncServer::new(ServerConfig::default());
/// let (status, _body) = server.handle_post("/sync/farm-plot/fetch", &[]);
/// assert_eq!(status, 400);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
    submissions: Mutex<Vec<SubmitRequest>>,
    outage_after: Mutex<Option<usize>>,
}

impl SyncServer {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(ResourceStore::new()))
    }

    /// Creates a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<ResourceStore>) -> Self {
        let context = Arc::new(HandlerContext::new(config, store));
        let handler = RequestHandler::new(Arc::clone(&context));
        Self {
            handler,
            context,
            submissions: Mutex::new(Vec::new()),
            outage_after: Mutex::new(None),
        }
    }

    /// Handles a submit request.
    pub fn handle_submit(&self, request: &SubmitRequest) -> SubmitResponse {
        self.submissions.lock().push(request.clone());
        self.handler.handle_submit(request)
    }

    /// Handles a fetch request.
    pub fn handle_fetch(&self, request: &FetchRequest) -> FetchResponse {
        self.handler.handle_fetch(request)
    }

    /// Handles an HTTP POST with a CBOR body, returning status and body.
    ///
    /// `200` applied or fetched, `409` version mismatch, `422` rejected,
    /// `503` during a simulated outage, `4xx` for malformed requests.
    pub fn handle_post(&self, path: &str, body: &[u8]) -> (u16, Vec<u8>) {
        if self.in_outage() {
            return (503, b"service unavailable".to_vec());
        }
        match self.route(path, body) {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_server_error() {
                    warn!(path, error = %e, "request failed");
                }
                (e.status(), e.to_string().into_bytes())
            }
        }
    }

    fn route(&self, path: &str, body: &[u8]) -> ServerResult<(u16, Vec<u8>)> {
        let mut segments = path.trim_matches('/').split('/');
        let (Some("sync"), Some(resource_type), Some(action), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(ServerError::UnknownEndpoint(path.to_string()));
        };

        match action {
            "submit" => {
                let request = SubmitRequest::decode(body)?;
                check_type(resource_type, &request.resource_type)?;
                let response = self.handle_submit(&request);
                let status = match response {
                    SubmitResponse::Applied { .. } => 200,
                    SubmitResponse::VersionMismatch { .. } => 409,
                    SubmitResponse::Rejected { .. } => 422,
                };
                Ok((status, response.encode()?))
            }
            "fetch" => {
                let request = FetchRequest::decode(body)?;
                check_type(resource_type, &request.resource_type)?;
                Ok((200, self.handle_fetch(&request).encode()?))
            }
            _ => Err(ServerError::UnknownEndpoint(path.to_string())),
        }
    }

    fn in_outage(&self) -> bool {
        let mut outage = self.outage_after.lock();
        match outage.as_mut() {
            Some(0) => true,
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        }
    }

    /// Answers the next `requests` POSTs normally, then `503` until
    /// [`SyncServer::end_outage`].
    pub fn schedule_outage(&self, requests: usize) {
        *self.outage_after.lock() = Some(requests);
    }

    /// Ends a simulated outage.
    pub fn end_outage(&self) {
        *self.outage_after.lock() = None;
    }

    /// Creates or overwrites a resource as another user would.
    pub fn seed(&self, resource_type: &str, resource_id: &str, payload: Record) -> ResourceSnapshot {
        self.context
            .store
            .put(ResourceKey::new(resource_type, resource_id), payload)
    }

    /// Patches a resource as another user would.
    pub fn update_remote(&self, key: &ResourceKey, patch: &Record) -> Option<ResourceSnapshot> {
        self.context.store.patch(key, patch)
    }

    /// Deletes a resource as another user would.
    pub fn delete_remote(&self, key: &ResourceKey) -> Option<Version> {
        self.context.store.remove(key)
    }

    /// Returns the current state of a resource.
    pub fn resource(&self, key: &ResourceKey) -> Option<ResourceSnapshot> {
        self.context.store.get(key)
    }

    /// Live resources of one type.
    pub fn resources(&self, resource_type: &str) -> Vec<ResourceSnapshot> {
        self.context.store.list(resource_type)
    }

    /// Every submit received, in arrival order.
    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.submissions.lock().clone()
    }

    /// Number of distinct operations applied or rejected.
    pub fn settled_count(&self) -> usize {
        self.context.store.settled_count()
    }

    /// The configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }
}

fn check_type(path_type: &str, request_type: &str) -> ServerResult<()> {
    if path_type == request_type {
        Ok(())
    } else {
        Err(ServerError::InvalidRequest(format!(
            "endpoint is for {path_type}, request is for {request_type}"
        )))
    }
}
