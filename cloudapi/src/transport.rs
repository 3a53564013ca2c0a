use std::{net::IpAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use reqwest::{StatusCode, Url};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::{codes, unpack, ErrorSink, Request, Severity};

/// Tunables for a [Transport].
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Base URL of the remote service.
    pub base_url: Url,
    /// No network is needed; `connect` returns immediately.
    pub offline: bool,
    /// Initial connect timeout, and the step it grows by after each failure.
    pub base_timeout: Duration,
    /// Upper bound for the connect timeout.
    pub max_timeout: Duration,
    /// Consecutive failed sends after which the connection is dropped even
    /// if it still looks healthy.
    pub max_failures: u32,
    /// Pause between connect attempts.
    pub retry_pause: Duration,
    /// Ask the server to keep the connection open.
    pub keep_alive: bool,
    /// Severity used for transport failures reported to the sink.
    pub error_severity: Severity,
}

impl TransportConfig {
    /// Configuration with the default timeouts for the given service.
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            offline: false,
            base_timeout: Duration::from_secs(6),
            max_timeout: Duration::from_secs(30),
            max_failures: 5,
            retry_pause: Duration::from_secs(1),
            keep_alive: true,
            error_severity: Severity::Info,
        }
    }
}

enum Failure {
    Request(reqwest::Error),
    Read(reqwest::Error),
    Status(StatusCode, String),
    Body(crate::Error),
}

impl Failure {
    fn code(&self) -> u32 {
        match self {
            Failure::Request(_) => codes::REQUEST_FAILED,
            Failure::Read(_) => codes::READ_FAILED,
            Failure::Status(..) => codes::BAD_STATUS,
            Failure::Body(_) => codes::INVALID_JSON,
        }
    }

    fn message(&self) -> String {
        match self {
            Failure::Request(e) => format!("error during HTTP request: {}", e),
            Failure::Read(e) => format!("error reading response: {}", e),
            Failure::Status(status, body) => {
                format!("server responded with {}, full response: {}", status, body)
            }
            Failure::Body(e) => e.to_string(),
        }
    }

    /// Whether the underlying connection can no longer be trusted.
    fn breaks_connection(&self) -> bool {
        matches!(self, Failure::Request(_) | Failure::Read(_))
    }
}

/// Request/response client for the remote service, holding a single
/// reusable connection. Errors never escape: they are reported on the
/// [ErrorSink] and turned into `None`.
pub struct Transport {
    config: TransportConfig,
    client: Option<reqwest::Client>,
    timeout: Duration,
    failures: u32,
    local_ip: Option<IpAddr>,
    sink: Arc<dyn ErrorSink>,
    cancel: CancellationToken,
}

impl Transport {
    /// Create a disconnected transport. The connection is made lazily on the
    /// first send, or explicitly with [Transport::connect].
    pub fn new(config: TransportConfig, sink: Arc<dyn ErrorSink>, cancel: CancellationToken) -> Self {
        Self {
            timeout: config.base_timeout,
            config,
            client: None,
            failures: 0,
            local_ip: None,
            sink,
            cancel,
        }
    }

    /// Whether a connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Local address the last successful connect originated from.
    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }

    /// Current connect timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Connect, retrying with a linearly growing timeout until connected,
    /// cancelled, or offline. Returns whether a connection is held.
    pub async fn connect(&mut self) -> bool {
        if self.client.is_some() {
            return true;
        }

        tracing::debug!(url = self.config.base_url.as_str(), "connecting");
        while !self.cancel.is_cancelled() {
            if self.config.offline {
                tracing::debug!("offline, not connecting");
                return false;
            }

            match self.probe().await {
                Ok(client) => {
                    tracing::info!(
                        url = self.config.base_url.as_str(),
                        local_ip = format!("{:?}", self.local_ip),
                        "connected"
                    );
                    self.client = Some(client);
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        url = self.config.base_url.as_str(),
                        error = format!("{:?}", e),
                        "connection failed"
                    );
                    self.sink.report(
                        codes::CONNECT_FAILED,
                        format!("error during HTTP connection: {}", e),
                        self.config.error_severity,
                    );
                    self.timeout = (self.timeout + self.config.base_timeout).min(self.config.max_timeout);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = tokio::time::sleep(self.config.retry_pause) => {}
                    }
                }
            }
        }
        false
    }

    async fn probe(&mut self) -> Result<reqwest::Client> {
        let url = &self.config.base_url;
        let host = url.host_str().ok_or_else(|| anyhow!("{} has no host", url))?.to_owned();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("{} has no port", url))?;

        let stream = tokio::select! {
            _ = self.cancel.cancelled() => anyhow::bail!("cancelled"),
            r = tokio::time::timeout(self.timeout, TcpStream::connect((host.as_str(), port))) => {
                r.map_err(|_| anyhow!("timed out after {:?}", self.timeout))??
            }
        };
        self.local_ip = stream.local_addr().ok().map(|addr| addr.ip());
        drop(stream);

        Ok(reqwest::Client::builder()
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .pool_max_idle_per_host(1)
            .build()?)
    }

    /// Drop the connection; the next send reconnects.
    pub fn close(&mut self) {
        if self.client.take().is_some() {
            tracing::debug!("connection closed");
        }
    }

    /// Perform one exchange. Returns the unpacked reply, or `None` if
    /// anything went wrong.
    pub async fn send(&mut self, path: &str, body: &Map<String, Value>) -> Option<Map<String, Value>> {
        if !self.connect().await {
            return None;
        }
        let client = self.client.clone()?;

        let url = match self.config.base_url.join(path) {
            Ok(url) => url,
            Err(e) => {
                self.sink.report(
                    codes::REQUEST_FAILED,
                    format!("bad request path {}: {}", path, e),
                    self.config.error_severity,
                );
                return None;
            }
        };

        let mut request = client.post(url).json(body);
        if self.config.keep_alive {
            request = request.header(reqwest::header::CONNECTION, "keep-alive");
        }

        tracing::trace!(path = path, body = format!("{:?}", body), "sending");
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            r = exchange(request) => r,
        };

        match outcome {
            Ok(reply) => {
                self.failures = 0;
                Some(reply)
            }
            Err(failure) => {
                tracing::warn!(path = path, error = failure.message(), "request failed");
                self.sink
                    .report(failure.code(), failure.message(), self.config.error_severity);
                if failure.breaks_connection() {
                    self.client = None;
                }
                self.failures += 1;
                if self.failures >= self.config.max_failures {
                    tracing::info!(failures = self.failures, "too many failed requests, forcing reconnect");
                    self.client = None;
                    self.failures = 0;
                }
                None
            }
        }
    }

    /// Pack and send a typed request.
    pub async fn pack_and_send(&mut self, request: &Request, extra: Map<String, Value>) -> Option<Map<String, Value>> {
        let packed = request.pack(extra);
        self.send(packed.path, &packed.body).await
    }

    /// Pack and send a request given by kind name. An unknown kind is
    /// reported on the sink and nothing is sent.
    pub async fn pack_and_send_named(
        &mut self,
        kind: &str,
        fields: Map<String, Value>,
        extra: Map<String, Value>,
    ) -> Option<Map<String, Value>> {
        match Request::from_fields(kind, fields) {
            Ok(request) => self.pack_and_send(&request, extra).await,
            Err(e) => {
                tracing::error!(kind = kind, error = e.to_string(), "can not pack request");
                self.sink.report(codes::UNKNOWN_TARGET, e.to_string(), Severity::Blocking);
                None
            }
        }
    }
}

async fn exchange(request: reqwest::RequestBuilder) -> std::result::Result<Map<String, Value>, Failure> {
    let response = request.send().await.map_err(Failure::Request)?;
    let status = response.status();
    let body = response.bytes().await.map_err(Failure::Read)?;
    if status != StatusCode::OK {
        return Err(Failure::Status(status, String::from_utf8_lossy(&body).into_owned()));
    }
    unpack(&body).map_err(Failure::Body)
}
