/// Liveness probing for a single backend
///
/// A backend is considered healthy only when the full probe ladder passes:
/// TCP dial, server greeting read (which also yields the server version), and
/// the HTTP status endpoint. An optional schema probe can additionally demote
/// a reachable backend to `SchemaOutdated`.
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Buf;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::{BackendHealth, BackendInfo, BackendStatus};

/// Greeting payloads larger than this are not a server handshake.
const MAX_GREETING_LEN: usize = 1024;

/// First payload byte of the initial handshake frame.
const PROTOCOL_VERSION: u8 = 0x0a;

/// First payload byte of a server error frame.
const ERR_HEADER: u8 = 0xff;

/// Errors from a single probe step; folded into `BackendHealth.ping_err`
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("dial failed: {0}")]
    Dial(io::Error),

    #[error("greeting read failed: {0}")]
    Read(io::Error),

    #[error("malformed server greeting")]
    Greeting,

    #[error("server refused handshake")]
    Refused,

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("status probe failed: {0}")]
    Status(reqwest::Error),

    #[error("status probe returned HTTP {0}")]
    StatusCode(u16),
}

/// Probe timing and endpoint knobs
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Budget for TCP dial plus greeting read
    pub dial_timeout: Duration,
    /// Additional budget for the HTTP status probe
    pub http_timeout: Duration,
    /// Path of the status endpoint on the status port
    pub status_path: String,
    /// Optional schema-freshness endpoint; non-200 demotes to SchemaOutdated
    pub schema_path: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(3),
            http_timeout: Duration::from_secs(2),
            status_path: "/status".to_string(),
            schema_path: None,
        }
    }
}

/// Health probe contract: a pure function of address and info at call time
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, addr: &str, info: &BackendInfo) -> BackendHealth;
}

/// Probe ladder over the SQL port and the HTTP status port
pub struct DefaultHealthCheck {
    cfg: HealthCheckConfig,
    client: reqwest::Client,
}

impl DefaultHealthCheck {
    pub fn new(cfg: HealthCheckConfig) -> Self {
        let client = reqwest::Client::builder().build().unwrap_or_default();
        Self { cfg, client }
    }

    /// Dial the SQL port and read the server's initial handshake frame,
    /// returning the version string it advertises.
    async fn read_server_version(&self, addr: &str) -> Result<String, ProbeError> {
        let deadline = self.cfg.dial_timeout;
        match timeout(deadline, self.dial_and_read(addr)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(deadline)),
        }
    }

    async fn dial_and_read(&self, addr: &str) -> Result<String, ProbeError> {
        let mut stream = TcpStream::connect(addr).await.map_err(ProbeError::Dial)?;

        // Frame header: 3-byte little-endian payload length plus sequence id.
        let mut header = [0u8; 4];
        stream
            .read_exact(&mut header)
            .await
            .map_err(ProbeError::Read)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        if len == 0 || len > MAX_GREETING_LEN {
            return Err(ProbeError::Greeting);
        }

        let mut payload = vec![0u8; len];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(ProbeError::Read)?;
        parse_greeting(&payload)
    }

    /// GET an endpoint on the status port; anything but HTTP 200 is a
    /// failure. Each probe step carries its own budget, so a slow status
    /// endpoint cannot eat into the schema probe's allotment or vice versa.
    async fn probe_status(&self, info: &BackendInfo, path: &str) -> Result<(), ProbeError> {
        let url = format!("http://{}:{}{}", info.ip, info.status_port, path);
        let resp = self
            .client
            .get(&url)
            .timeout(self.cfg.dial_timeout + self.cfg.http_timeout)
            .send()
            .await
            .map_err(ProbeError::Status)?;
        let code = resp.status();
        if code.as_u16() != 200 {
            return Err(ProbeError::StatusCode(code.as_u16()));
        }
        Ok(())
    }
}

/// Extract the version string from an initial handshake payload.
fn parse_greeting(payload: &[u8]) -> Result<String, ProbeError> {
    let mut buf = payload;
    if !buf.has_remaining() {
        return Err(ProbeError::Greeting);
    }
    match buf.get_u8() {
        PROTOCOL_VERSION => {}
        // A server at capacity greets with an error frame instead.
        ERR_HEADER => return Err(ProbeError::Refused),
        _ => return Err(ProbeError::Greeting),
    }
    let version_end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProbeError::Greeting)?;
    let version = std::str::from_utf8(&buf[..version_end])
        .map_err(|_| ProbeError::Greeting)?
        .to_string();
    Ok(version)
}

#[async_trait]
impl HealthCheck for DefaultHealthCheck {
    async fn check(&self, addr: &str, info: &BackendInfo) -> BackendHealth {
        let server_version = match self.read_server_version(addr).await {
            Ok(version) => version,
            Err(e) => {
                debug!(backend = %addr, error = %e, "sql probe failed");
                return BackendHealth::unreachable(e.to_string());
            }
        };

        if let Err(e) = self.probe_status(info, &self.cfg.status_path).await {
            debug!(backend = %addr, error = %e, "status probe failed");
            return BackendHealth::unreachable(e.to_string());
        }

        if let Some(schema_path) = &self.cfg.schema_path {
            if let Err(e) = self.probe_status(info, schema_path).await {
                debug!(backend = %addr, error = %e, "schema probe failed");
                return BackendHealth {
                    status: BackendStatus::SchemaOutdated,
                    server_version,
                    ping_err: Some(e.to_string()),
                };
            }
        }

        BackendHealth::healthy(server_version)
    }
}
