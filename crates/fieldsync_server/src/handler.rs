//! Request handlers for the submit and fetch endpoints.

use crate::config::ServerConfig;
use crate::store::ResourceStore;
use fieldsync_protocol::{
    apply_patch, is_valid_resource_type, FetchRequest, FetchResponse, OperationKind, Record,
    ResourceKey, SubmitRequest, SubmitResponse,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Authoritative state (shared across all handlers).
    pub store: Arc<ResourceStore>,
    /// Serializes submits so check-then-write is atomic.
    submit_lock: Mutex<()>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, store: Arc<ResourceStore>) -> Self {
        Self {
            config,
            store,
            submit_lock: Mutex::new(()),
        }
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a submit request.
    ///
    /// An operation id that was applied or rejected before gets the same
    /// answer again without touching state. Version mismatches are not
    /// remembered, so a client may resubmit the same operation on a newer
    /// base.
    pub fn handle_submit(&self, request: &SubmitRequest) -> SubmitResponse {
        let _guard = self.context.submit_lock.lock();
        let store = &self.context.store;

        if let Some(previous) = store.settled(&request.operation_id) {
            debug!(operation = %request.operation_id, "replaying settled operation");
            return match previous {
                SubmitResponse::Applied {
                    resource_id,
                    version,
                    payload,
                    ..
                } => SubmitResponse::Applied {
                    resource_id,
                    version,
                    payload,
                    replayed: true,
                },
                other => other,
            };
        }

        let response = match self.validate(request) {
            Err(reason) => SubmitResponse::Rejected { reason },
            Ok(()) => match request.kind {
                OperationKind::Create => self.create(request),
                OperationKind::Update => self.update(request),
                OperationKind::Delete => self.delete(request),
            },
        };

        match &response {
            SubmitResponse::Applied {
                resource_id,
                version,
                ..
            } => {
                info!(
                    operation = %request.operation_id,
                    resource_type = %request.resource_type,
                    resource_id = %resource_id,
                    %version,
                    kind = %request.kind,
                    "operation applied"
                );
                store.record_settled(request.operation_id, response.clone());
            }
            SubmitResponse::Rejected { reason } => {
                info!(operation = %request.operation_id, reason = %reason, "operation rejected");
                store.record_settled(request.operation_id, response.clone());
            }
            SubmitResponse::VersionMismatch { current } => {
                debug!(
                    operation = %request.operation_id,
                    base = ?request.base_version,
                    current = ?current.as_ref().map(|s| s.version),
                    "version mismatch"
                );
            }
        }
        response
    }

    /// Handles a fetch request.
    pub fn handle_fetch(&self, request: &FetchRequest) -> FetchResponse {
        let key = ResourceKey::new(request.resource_type.as_str(), request.resource_id.as_str());
        FetchResponse {
            current: self.context.store.get(&key),
        }
    }

    fn validate(&self, request: &SubmitRequest) -> Result<(), String> {
        if request.resource_type.is_empty() || request.resource_id.is_empty() {
            return Err("resource type and id are required".into());
        }
        if !is_valid_resource_type(&request.resource_type) {
            return Err(format!("invalid resource type {:?}", request.resource_type));
        }
        match (request.kind, &request.payload) {
            (OperationKind::Create | OperationKind::Update, None) => {
                Err(format!("{} requires a payload", request.kind))
            }
            (OperationKind::Create, Some(payload)) => self.check_required(request, payload),
            _ => Ok(()),
        }
    }

    fn check_required(&self, request: &SubmitRequest, record: &Record) -> Result<(), String> {
        let missing: Vec<&str> = self
            .context
            .config
            .required_for(&request.resource_type)
            .iter()
            .filter(|field| record.get(*field).map_or(true, |v| v.is_null()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required fields: {}", missing.join(", ")))
        }
    }

    fn create(&self, request: &SubmitRequest) -> SubmitResponse {
        let config = &self.context.config;
        let store = &self.context.store;
        let payload = request.payload.clone().unwrap_or_default();

        let provisional = request
            .resource_id
            .starts_with(config.provisional_prefix.as_str());
        let resource_id = if provisional && config.assign_ids {
            store.assign_id(&request.resource_type)
        } else {
            request.resource_id.clone()
        };

        let key = ResourceKey::new(request.resource_type.as_str(), resource_id.as_str());
        if let Some(current) = store.get(&key) {
            return SubmitResponse::VersionMismatch {
                current: Some(current),
            };
        }

        let snapshot = store.put(key, payload);
        SubmitResponse::Applied {
            resource_id,
            version: snapshot.version,
            payload: Some(snapshot.payload),
            replayed: false,
        }
    }

    fn update(&self, request: &SubmitRequest) -> SubmitResponse {
        let store = &self.context.store;
        let key = request.key();
        let Some(current) = store.get(&key) else {
            return SubmitResponse::VersionMismatch { current: None };
        };
        if request.base_version != Some(current.version) {
            return SubmitResponse::VersionMismatch {
                current: Some(current),
            };
        }

        let patch = request.payload.clone().unwrap_or_default();
        let updated = apply_patch(&current.payload, &patch);
        if let Err(reason) = self.check_required(request, &updated) {
            return SubmitResponse::Rejected { reason };
        }

        let snapshot = store.put(key, updated);
        SubmitResponse::Applied {
            resource_id: request.resource_id.clone(),
            version: snapshot.version,
            payload: Some(snapshot.payload),
            replayed: false,
        }
    }

    fn delete(&self, request: &SubmitRequest) -> SubmitResponse {
        let store = &self.context.store;
        let key = request.key();
        let Some(current) = store.get(&key) else {
            return SubmitResponse::VersionMismatch { current: None };
        };
        if request.base_version != Some(current.version) {
            return SubmitResponse::VersionMismatch {
                current: Some(current),
            };
        }

        match store.remove(&key) {
            Some(version) => SubmitResponse::Applied {
                resource_id: request.resource_id.clone(),
                version,
                payload: None,
                replayed: false,
            },
            None => SubmitResponse::VersionMismatch { current: None },
        }
    }
}
