//! Control-plane API of a running microVM: one session over the jail's Unix
//! socket, and one small client per REST resource.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use futures_util::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::{
    Request,
    body::Bytes,
    header::{ACCEPT, CONTENT_TYPE, HOST},
};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;

use crate::HarnessError;

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub method: &'static str,
    pub path: String,
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into a [`HarnessError::CallFailure`].
    pub fn error_for_status(self) -> anyhow::Result<Self> {
        if self.ok() {
            return Ok(self);
        }
        Err(HarnessError::CallFailure {
            method: self.method.to_string(),
            path: self.path,
            status: self.status,
            body: self.body,
        }
        .into())
    }

    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_str(&self.body)
            .with_context(|| format!("decode {} {} response body", self.method, self.path))
    }
}

/// Whatever carries a request to the VMM. The harness only ever needs the
/// status code and the raw body back.
pub trait ApiTransport: Send + Sync + fmt::Debug {
    fn send<'a>(
        &'a self,
        method: &'static str,
        path: &'a str,
        body: Option<String>,
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, anyhow::Result<ApiResponse>>;
}

/// HTTP/1.1 over the VMM's API socket, one connection per request.
#[derive(Debug, Clone)]
pub struct UnixSocketTransport {
    socket_path: PathBuf,
}

impl UnixSocketTransport {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn roundtrip(
        &self,
        method: &'static str,
        path: &str,
        body: Option<String>,
    ) -> anyhow::Result<ApiResponse> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("connect {}", self.socket_path.display()))?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .with_context(|| format!("http handshake on {}", self.socket_path.display()))?;
        let socket = self.socket_path.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(socket = %socket.display(), error = %e, "api connection closed");
            }
        });

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, "localhost")
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .with_context(|| format!("build {method} {path}"))?;
        let response = sender
            .send_request(request)
            .await
            .with_context(|| format!("send {method} {path}"))?;

        let status = response.status().as_u16();
        let raw = response
            .into_body()
            .collect()
            .await
            .with_context(|| format!("read {method} {path} response body"))?
            .to_bytes();

        Ok(ApiResponse {
            method,
            path: path.to_string(),
            status,
            body: String::from_utf8_lossy(&raw).into_owned(),
        })
    }
}

impl ApiTransport for UnixSocketTransport {
    fn send<'a>(
        &'a self,
        method: &'static str,
        path: &'a str,
        body: Option<String>,
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, anyhow::Result<ApiResponse>> {
        Box::pin(async move {
            let fut = self.roundtrip(method, path, body);
            match timeout {
                Some(t) => tokio::time::timeout(t, fut)
                    .await
                    .map_err(|_| anyhow::anyhow!("{method} {path} timed out after {t:?}"))?,
                None => fut.await,
            }
        })
    }
}

/// One session shared by every resource client of a microVM.
#[derive(Debug)]
pub struct ApiSession {
    transport: Arc<dyn ApiTransport>,
    timeout: Duration,
    timed: AtomicBool,
}

impl ApiSession {
    pub fn new(transport: Arc<dyn ApiTransport>) -> Self {
        Self {
            transport,
            timeout: crate::support::api_timeout(),
            timed: AtomicBool::new(true),
        }
    }

    /// Drop the per-request timeout, e.g. before a snapshot of a large guest.
    pub fn untime(&self) {
        self.timed.store(false, Ordering::SeqCst);
    }

    pub fn is_timed(&self) -> bool {
        self.timed.load(Ordering::SeqCst)
    }

    pub async fn request(
        &self,
        method: &'static str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> anyhow::Result<ApiResponse> {
        let body = body.map(|b| b.to_string());
        let timeout = self.is_timed().then_some(self.timeout);
        tracing::debug!(method, path, "api request");
        self.transport.send(method, path, body, timeout).await
    }
}

/// Client for one REST resource path.
#[derive(Debug, Clone)]
pub struct Resource {
    session: Arc<ApiSession>,
    path: &'static str,
}

impl Resource {
    fn new(session: &Arc<ApiSession>, path: &'static str) -> Self {
        Self {
            session: session.clone(),
            path,
        }
    }

    pub fn path(&self) -> &'static str {
        self.path
    }

    fn sub_path(&self, id: &str) -> String {
        format!("{}/{}", self.path.trim_end_matches('/'), id)
    }

    pub async fn get(&self) -> anyhow::Result<ApiResponse> {
        self.session.request("GET", self.path, None).await
    }

    pub async fn put(&self, body: &serde_json::Value) -> anyhow::Result<ApiResponse> {
        self.session.request("PUT", self.path, Some(body)).await
    }

    pub async fn patch(&self, body: &serde_json::Value) -> anyhow::Result<ApiResponse> {
        self.session.request("PATCH", self.path, Some(body)).await
    }

    /// `PUT <path>/<id>`, for resources keyed by id (drives, interfaces).
    pub async fn put_id(&self, id: &str, body: &serde_json::Value) -> anyhow::Result<ApiResponse> {
        self.session.request("PUT", &self.sub_path(id), Some(body)).await
    }

    pub async fn patch_id(&self, id: &str, body: &serde_json::Value) -> anyhow::Result<ApiResponse> {
        self.session.request("PATCH", &self.sub_path(id), Some(body)).await
    }
}

/// Every resource client of one microVM, built together once the API socket
/// path is known.
#[derive(Debug, Clone)]
pub struct ApiClients {
    pub session: Arc<ApiSession>,
    pub actions: Resource,
    pub balloon: Resource,
    pub boot: Resource,
    pub desc_inst: Resource,
    pub drive: Resource,
    pub full_cfg: Resource,
    pub logger: Resource,
    pub machine_cfg: Resource,
    pub metrics: Resource,
    pub mmds: Resource,
    pub mmds_config: Resource,
    pub network: Resource,
    pub snapshot_create: Resource,
    pub snapshot_load: Resource,
    pub version: Resource,
    pub vm: Resource,
    pub vsock: Resource,
}

impl ApiClients {
    pub fn new(transport: Arc<dyn ApiTransport>) -> Self {
        let session = Arc::new(ApiSession::new(transport));
        Self {
            actions: Resource::new(&session, "/actions"),
            balloon: Resource::new(&session, "/balloon"),
            boot: Resource::new(&session, "/boot-source"),
            desc_inst: Resource::new(&session, "/"),
            drive: Resource::new(&session, "/drives"),
            full_cfg: Resource::new(&session, "/vm/config"),
            logger: Resource::new(&session, "/logger"),
            machine_cfg: Resource::new(&session, "/machine-config"),
            metrics: Resource::new(&session, "/metrics"),
            mmds: Resource::new(&session, "/mmds"),
            mmds_config: Resource::new(&session, "/mmds/config"),
            network: Resource::new(&session, "/network-interfaces"),
            snapshot_create: Resource::new(&session, "/snapshot/create"),
            snapshot_load: Resource::new(&session, "/snapshot/load"),
            version: Resource::new(&session, "/version"),
            vm: Resource::new(&session, "/vm"),
            vsock: Resource::new(&session, "/vsock"),
            session,
        }
    }

    pub fn unix_socket(socket_path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(UnixSocketTransport::new(socket_path)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::{collections::HashMap, sync::Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct RecordedCall {
        pub method: &'static str,
        pub path: String,
        pub body: Option<serde_json::Value>,
    }

    /// Records every request and answers with canned statuses/bodies.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingTransport {
        pub calls: Mutex<Vec<RecordedCall>>,
        responses: Mutex<HashMap<(String, String), (u16, String)>>,
    }

    impl RecordingTransport {
        pub(crate) fn respond(&self, method: &str, path: &str, status: u16, body: &str) {
            self.responses
                .lock()
                .unwrap()
                .insert((method.to_string(), path.to_string()), (status, body.to_string()));
        }

        pub(crate) fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ApiTransport for RecordingTransport {
        fn send<'a>(
            &'a self,
            method: &'static str,
            path: &'a str,
            body: Option<String>,
            _timeout: Option<Duration>,
        ) -> BoxFuture<'a, anyhow::Result<ApiResponse>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(RecordedCall {
                    method,
                    path: path.to_string(),
                    body: body.as_deref().map(|b| serde_json::from_str(b).unwrap()),
                });
                let (status, body) = self
                    .responses
                    .lock()
                    .unwrap()
                    .get(&(method.to_string(), path.to_string()))
                    .cloned()
                    .unwrap_or((204, String::new()));
                Ok(ApiResponse {
                    method,
                    path: path.to_string(),
                    status,
                    body,
                })
            })
        }
    }
}
