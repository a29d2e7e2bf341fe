//! Remote API abstraction.

use crate::error::{SyncError, SyncResult};
use fieldsync_protocol::{
    FetchRequest, FetchResponse, ResourceKey, ResourceSnapshot, SubmitRequest, SubmitResponse,
    Version,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

/// The system of record.
///
/// One logical endpoint per resource type. Implementations report
/// transport failures as retryable [`SyncError`]s; only an explicit
/// [`SubmitResponse::Rejected`] is definitive.
pub trait RemoteApi: Send + Sync {
    /// Submits one operation.
    fn submit(
        &self,
        request: &SubmitRequest,
    ) -> impl Future<Output = SyncResult<SubmitResponse>> + Send;

    /// Fetches a resource's current state.
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = SyncResult<FetchResponse>> + Send;
}

impl<T: RemoteApi> RemoteApi for Arc<T> {
    fn submit(
        &self,
        request: &SubmitRequest,
    ) -> impl Future<Output = SyncResult<SubmitResponse>> + Send {
        (**self).submit(request)
    }

    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = SyncResult<FetchResponse>> + Send {
        (**self).fetch(request)
    }
}

/// A scripted reply for [`MockRemote`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with this response.
    Respond(SubmitResponse),
    /// Fail with a retryable transport error.
    Fail(String),
    /// Never answer.
    Hang,
}

/// A scripted remote for testing.
///
/// Replies are consumed in order; once the script is empty every submit
/// is applied at version 1, echoing the request.
#[derive(Debug, Default)]
pub struct MockRemote {
    script: Mutex<VecDeque<MockReply>>,
    submitted: Mutex<Vec<SubmitRequest>>,
    fetch_responses: Mutex<HashMap<ResourceKey, Option<ResourceSnapshot>>>,
    fail_fetch: Mutex<Option<String>>,
}

impl MockRemote {
    /// Creates a mock with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a reply to the script.
    pub fn push_reply(&self, reply: MockReply) {
        self.script.lock().push_back(reply);
    }

    /// Appends a response to the script.
    pub fn push_response(&self, response: SubmitResponse) {
        self.push_reply(MockReply::Respond(response));
    }

    /// Sets what a fetch of `key` returns.
    pub fn set_fetch_response(&self, key: ResourceKey, current: Option<ResourceSnapshot>) {
        self.fetch_responses.lock().insert(key, current);
    }

    /// Makes fetches fail, or succeed again with `None`.
    pub fn set_fetch_failure(&self, error: Option<String>) {
        *self.fail_fetch.lock() = error;
    }

    /// Every request received so far, in order.
    pub fn submitted(&self) -> Vec<SubmitRequest> {
        self.submitted.lock().clone()
    }
}

impl RemoteApi for MockRemote {
    async fn submit(&self, request: &SubmitRequest) -> SyncResult<SubmitResponse> {
        self.submitted.lock().push(request.clone());
        let reply = self.script.lock().pop_front();
        match reply {
            Some(MockReply::Respond(response)) => Ok(response),
            Some(MockReply::Fail(message)) => Err(SyncError::transport_retryable(message)),
            Some(MockReply::Hang) => std::future::pending().await,
            None => Ok(SubmitResponse::Applied {
                resource_id: request.resource_id.clone(),
                version: request.base_version.map_or(Version(1), Version::next),
                payload: request.payload.clone(),
                replayed: false,
            }),
        }
    }

    async fn fetch(&self, request: &FetchRequest) -> SyncResult<FetchResponse> {
        if let Some(message) = self.fail_fetch.lock().clone() {
            return Err(SyncError::transport_retryable(message));
        }
        let key = ResourceKey::new(request.resource_type.clone(), request.resource_id.clone());
        let current = self.fetch_responses.lock().get(&key).cloned().flatten();
        Ok(FetchResponse { current })
    }
}
