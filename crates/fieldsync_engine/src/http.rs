//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via [`HttpClient`] so any HTTP
//! library can carry the CBOR-encoded messages. Each resource type has its
//! own endpoints:
//!
//! ```text
//! POST {base_url}/sync/{resource_type}/submit   SubmitRequest -> SubmitResponse
//! POST {base_url}/sync/{resource_type}/fetch    FetchRequest  -> FetchResponse
//! ```
//!
//! Status mapping for submit: `200`, `409` and `422` carry a
//! [`SubmitResponse`]; `408` and `429` are retryable; any other `4xx` is a
//! definitive rejection; `5xx` is a server error and is retried.

use crate::error::{SyncError, SyncResult};
use crate::transport::RemoteApi;
use fieldsync_protocol::{
    is_valid_resource_type, FetchRequest, FetchResponse, SubmitRequest, SubmitResponse,
};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Status and body of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP client abstraction.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request. `Err` means no response was received.
    fn post(
        &self,
        url: &str,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<HttpResponse, String>> + Send;
}

/// [`RemoteApi`] over HTTP with CBOR bodies.
pub struct HttpTransport<C: HttpClient> {
    base_url: String,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport for the server at `base_url`.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last transport error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn endpoint(&self, resource_type: &str, action: &str) -> SyncResult<String> {
        if !is_valid_resource_type(resource_type) {
            return Err(SyncError::InvalidInput(format!(
                "resource type {resource_type:?} is not a valid path segment"
            )));
        }
        Ok(format!("{}/sync/{}/{}", self.base_url, resource_type, action))
    }

    async fn post(&self, url: String, body: Vec<u8>) -> SyncResult<HttpResponse> {
        match self.client.post(&url, body).await {
            Ok(response) => {
                *self.last_error.write() = None;
                Ok(response)
            }
            Err(e) => {
                *self.last_error.write() = Some(e.clone());
                Err(SyncError::transport_retryable(e))
            }
        }
    }
}

fn decode_failure(e: impl std::fmt::Display) -> SyncError {
    SyncError::Protocol(format!("failed to decode response: {e}"))
}

impl<C: HttpClient> RemoteApi for HttpTransport<C> {
    async fn submit(&self, request: &SubmitRequest) -> SyncResult<SubmitResponse> {
        let url = match self.endpoint(&request.resource_type, "submit") {
            Ok(url) => url,
            Err(e) => return Ok(SubmitResponse::Rejected { reason: e.to_string() }),
        };
        let body = request.encode()?;
        let response = self.post(url, body).await?;

        match response.status {
            200 | 409 | 422 => SubmitResponse::decode(&response.body).map_err(decode_failure),
            408 | 429 => Err(SyncError::transport_retryable(format!(
                "HTTP {}",
                response.status
            ))),
            400..=499 => Ok(SubmitResponse::Rejected {
                reason: format!("HTTP {}: {}", response.status, response.body_text()),
            }),
            500..=599 => Err(SyncError::ServerError(format!(
                "HTTP {}: {}",
                response.status,
                response.body_text()
            ))),
            status => Err(SyncError::Protocol(format!("unexpected HTTP status {status}"))),
        }
    }

    async fn fetch(&self, request: &FetchRequest) -> SyncResult<FetchResponse> {
        let url = self.endpoint(&request.resource_type, "fetch")?;
        let body = request.encode()?;
        let response = self.post(url, body).await?;

        match response.status {
            200 => FetchResponse::decode(&response.body).map_err(decode_failure),
            404 => Ok(FetchResponse { current: None }),
            500..=599 => Err(SyncError::ServerError(format!(
                "HTTP {}: {}",
                response.status,
                response.body_text()
            ))),
            status => Err(SyncError::transport_fatal(format!(
                "fetch failed with HTTP {status}: {}",
                response.body_text()
            ))),
        }
    }
}

/// A server that can answer loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST to `path` (starting at `/sync/`).
    fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse;
}

/// An [`HttpClient`] that routes requests straight to an in-process
/// server, with a switch to simulate losing the network.
pub struct LoopbackClient<S: LoopbackServer> {
    server: Arc<S>,
    reachable: AtomicBool,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a client connected to `server`.
    pub fn new(server: Arc<S>) -> Self {
        Self {
            server,
            reachable: AtomicBool::new(true),
        }
    }

    /// Makes every request fail, or succeed again.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, String> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err("network unreachable".into());
        }
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);
        Ok(self.server.handle_post(path, &body))
    }
}

impl<S: LoopbackServer> HttpClient for Arc<LoopbackClient<S>> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, String> {
        (**self).post(url, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_protocol::{OperationId, OperationKind, Version};
    use parking_lot::Mutex;

    struct CannedServer {
        response: Mutex<HttpResponse>,
        paths: Mutex<Vec<String>>,
    }

    impl CannedServer {
        fn new(status: u16, body: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(HttpResponse::new(status, body)),
                paths: Mutex::new(Vec::new()),
            })
        }
    }

    impl LoopbackServer for CannedServer {
        fn handle_post(&self, path: &str, _body: &[u8]) -> HttpResponse {
            self.paths.lock().push(path.to_string());
            self.response.lock().clone()
        }
    }

    fn request() -> SubmitRequest {
        SubmitRequest {
            operation_id: OperationId::new(),
            resource_type: "inspection".into(),
            resource_id: "temp-1".into(),
            kind: OperationKind::Create,
            payload: None,
            base_version: None,
        }
    }

    #[tokio::test]
    async fn routes_to_resource_type_endpoint() {
        let applied = SubmitResponse::Applied {
            resource_id: "inspection-1".into(),
            version: Version(1),
            payload: None,
            replayed: false,
        };
        let server = CannedServer::new(200, applied.encode().unwrap());
        let transport = HttpTransport::new(
            "https://portal.example/",
            LoopbackClient::new(Arc::clone(&server)),
        );

        assert_eq!(transport.submit(&request()).await.unwrap(), applied);
        assert_eq!(
            server.paths.lock().as_slice(),
            ["/sync/inspection/submit".to_string()]
        );
    }

    #[tokio::test]
    async fn client_errors_are_definitive() {
        let server = CannedServer::new(400, b"missing farmer id".to_vec());
        let transport = HttpTransport::new("http://x", LoopbackClient::new(server));

        match transport.submit(&request()).await.unwrap() {
            SubmitResponse::Rejected { reason } => assert!(reason.contains("missing farmer id")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_errors_and_throttling_are_retryable() {
        for status in [503, 429, 408] {
            let server = CannedServer::new(status, Vec::new());
            let transport = HttpTransport::new("http://x", LoopbackClient::new(server));
            let err = transport.submit(&request()).await.unwrap_err();
            assert!(err.is_retryable(), "status {status}");
        }
    }

    #[tokio::test]
    async fn unreachable_network_is_retryable() {
        let server = CannedServer::new(200, Vec::new());
        let client = Arc::new(LoopbackClient::new(server));
        client.set_reachable(false);
        let transport = HttpTransport::new("http://x", Arc::clone(&client));

        let err = transport.submit(&request()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.last_error().as_deref(), Some("network unreachable"));
    }

    #[tokio::test]
    async fn unsafe_resource_types_never_reach_the_wire() {
        let server = CannedServer::new(200, Vec::new());
        let transport = HttpTransport::new("http://x", LoopbackClient::new(Arc::clone(&server)));

        let mut submit = request();
        submit.resource_type = "inspection/../admin".into();
        assert!(matches!(
            transport.submit(&submit).await.unwrap(),
            SubmitResponse::Rejected { .. }
        ));

        let fetch = transport
            .fetch(&FetchRequest {
                resource_type: "farm plot".into(),
                resource_id: "p-1".into(),
            })
            .await;
        assert!(matches!(fetch, Err(SyncError::InvalidInput(_))));
        assert!(server.paths.lock().is_empty());
    }

    #[tokio::test]
    async fn fetch_not_found_is_absent() {
        let server = CannedServer::new(404, Vec::new());
        let transport = HttpTransport::new("http://x", LoopbackClient::new(server));
        let response = transport
            .fetch(&FetchRequest {
                resource_type: "inspection".into(),
                resource_id: "i-1".into(),
            })
            .await
            .unwrap();
        assert!(response.current.is_none());
    }
}
