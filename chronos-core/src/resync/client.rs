//! HTTP client for the peer resync API.
//!
//! Request execution is injected through [`RequestBackend`] so tests can
//! script peers without a network; the production backend wraps a shared
//! `reqwest` client. Transport failures are folded into HTTP-style status
//! codes (timeout 504, connect 503, other 502) so the coordinator deals in
//! one vocabulary.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cluster::config::ResyncConfig;
use crate::resync::wire::ReferenceBatch;
use crate::timer::NodeAddr;

/// HTTP method of a peer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    /// GET
    Get,
    /// PUT
    Put,
    /// POST
    Post,
    /// DELETE
    Delete,
}

/// A request to one peer. Each call builds its own request, so concurrent
/// resync runs never share mutable state.
#[derive(Debug, Clone)]
pub struct PeerRequest {
    /// Peer to contact, as `host:port`.
    pub server: NodeAddr,
    /// Path plus query string.
    pub path: String,
    /// HTTP method.
    pub method: RequestMethod,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// Optional body.
    pub body: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Status and raw body of a peer response.
#[derive(Debug, Clone)]
pub struct PeerResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw body; empty when the peer sent none.
    pub body: String,
}

/// Failure to obtain any HTTP response from a peer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request did not complete within its timeout.
    #[error("request to {server} timed out")]
    Timeout {
        /// Peer that timed out.
        server: NodeAddr,
    },
    /// No connection could be established.
    #[error("could not connect to {server}")]
    Connect {
        /// Unreachable peer.
        server: NodeAddr,
    },
    /// Any other transport-level failure.
    #[error("transport failure talking to {server}: {reason}")]
    Other {
        /// Peer involved.
        server: NodeAddr,
        /// Underlying failure.
        reason: String,
    },
}

impl TransportError {
    /// HTTP-style status code standing in for this failure.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Timeout { .. } => 504,
            Self::Connect { .. } => 503,
            Self::Other { .. } => 502,
        }
    }
}

/// Capability that turns a [`PeerRequest`] into a [`PeerResponse`].
///
/// This is the seam tests replace: the coordinator and replicator only ever
/// talk to peers through it.
#[async_trait::async_trait]
pub trait RequestBackend: Send + Sync {
    /// Executes one request.
    async fn execute(&self, request: PeerRequest) -> Result<PeerResponse, TransportError>;
}

/// Production backend over a shared `reqwest` connection pool.
#[derive(Default)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    /// Builds a backend with its own connection pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RequestBackend for HttpBackend {
    async fn execute(&self, request: PeerRequest) -> Result<PeerResponse, TransportError> {
        let url = format!("http://{}{}", request.server, request.path);
        let server = request.server;
        let mut builder = match request.method {
            RequestMethod::Get => self.client.get(&url),
            RequestMethod::Put => self.client.put(&url),
            RequestMethod::Post => self.client.post(&url),
            RequestMethod::Delete => self.client.delete(&url),
        }
        .timeout(request.timeout);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout {
                    server: server.clone(),
                }
            } else if err.is_connect() {
                TransportError::Connect {
                    server: server.clone(),
                }
            } else {
                TransportError::Other {
                    server: server.clone(),
                    reason: err.to_string(),
                }
            }
        })?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(PeerResponse { status, body })
    }
}

/// Client for the two peer operations resync needs: paging timers out of a
/// peer and dropping timer references on it.
pub struct PeerClient {
    backend: Arc<dyn RequestBackend>,
    config: ResyncConfig,
}

impl PeerClient {
    /// Header naming the page-size cap on resync GETs.
    pub const RANGE_HEADER: &'static str = "Range";

    /// Builds a client from a backend and tuning knobs.
    pub fn new(backend: Arc<dyn RequestBackend>, config: ResyncConfig) -> Self {
        Self { backend, config }
    }

    /// Path of the resync query for `target`'s timers.
    #[must_use]
    pub fn resync_path(target: &NodeAddr, view_id: &str, time_from: Option<u64>) -> String {
        let mut path =
            format!("/timers?node-for-replicas={target};cluster-view-id={view_id}");
        if let Some(time_from) = time_from {
            path.push_str(&format!(";time-from={time_from}"));
        }
        path
    }

    /// Fetches one page of timers for `target` from `peer`.
    ///
    /// 200 is a final page, 206 a partial one. Transport failures are
    /// retried within the configured bound and then reported as their
    /// status-code stand-ins with an empty body.
    pub async fn get_timers(
        &self,
        peer: &NodeAddr,
        target: &NodeAddr,
        view_id: &str,
        time_from: Option<u64>,
    ) -> (u16, String) {
        let request = PeerRequest {
            server: peer.clone(),
            path: Self::resync_path(target, view_id, time_from),
            method: RequestMethod::Get,
            headers: vec![(
                Self::RANGE_HEADER.to_string(),
                self.config.max_timers_in_response.to_string(),
            )],
            body: None,
            timeout: self.config.request_timeout,
        };
        match self.execute_with_retries(request, false).await {
            Ok(response) => (response.status, response.body),
            Err(err) => {
                warn!(peer = %peer, "resync GET failed: {err}");
                (err.status_code(), String::new())
            }
        }
    }

    /// Drops a batch of timer references on `peer`.
    ///
    /// Retried on 5xx up to the configured bound; 4xx is terminal. The
    /// returned status is informational only, peers tolerate orphaned
    /// references, which expire with their timers.
    pub async fn delete_references(&self, peer: &NodeAddr, batch: &ReferenceBatch) -> u16 {
        let Ok(body) = serde_json::to_string(batch) else {
            return 500;
        };
        let request = PeerRequest {
            server: peer.clone(),
            path: "/timers/references".to_string(),
            method: RequestMethod::Delete,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(body),
            timeout: self.config.request_timeout,
        };
        match self.execute_with_retries(request, true).await {
            Ok(response) => response.status,
            Err(err) => {
                debug!(peer = %peer, "reference drop failed: {err}");
                err.status_code()
            }
        }
    }

    async fn execute_with_retries(
        &self,
        request: PeerRequest,
        retry_on_5xx: bool,
    ) -> Result<PeerResponse, TransportError> {
        let mut attempts_left = self.config.retries;
        loop {
            match self.backend.execute(request.clone()).await {
                Ok(response) => {
                    if retry_on_5xx && response.status >= 500 && attempts_left > 0 {
                        debug!(
                            peer = %request.server,
                            status = response.status,
                            "retrying after server error"
                        );
                    } else {
                        return Ok(response);
                    }
                }
                Err(err) => {
                    if attempts_left == 0 {
                        return Err(err);
                    }
                    debug!(peer = %request.server, "retrying after transport error: {err}");
                }
            }
            attempts_left -= 1;
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }
}
