/// Backend health model and probing
///
/// This module owns everything the router needs to know about fleet health:
/// the static backend descriptors, the per-backend health verdicts, the
/// snapshot type published by the observer, and the probing machinery itself.
pub mod check;
pub mod fetcher;
pub mod observer;

use std::collections::HashMap;
use std::fmt;

/// Health status of a backend as seen by the probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendStatus {
    /// All probes passed; the backend accepts new connections
    Healthy,
    /// TCP dial, greeting read, or status probe failed
    #[default]
    CannotConnect,
    /// The backend is reachable but its schema is behind the cluster
    SchemaOutdated,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendStatus::Healthy => write!(f, "healthy"),
            BackendStatus::CannotConnect => write!(f, "down"),
            BackendStatus::SchemaOutdated => write!(f, "schema outdated"),
        }
    }
}

impl BackendStatus {
    /// Whether new connections may be routed to a backend in this status.
    /// Backends in any non-healthy status may be recycled at any moment.
    pub fn routable(&self) -> bool {
        matches!(self, BackendStatus::Healthy)
    }
}

/// Static descriptor for one backend address, produced by the fetcher
#[derive(Debug, Clone, Default)]
pub struct BackendInfo {
    /// IP or hostname the status endpoint listens on
    pub ip: String,
    /// Port of the HTTP status endpoint
    pub status_port: u16,
    /// Free-form labels from the cluster registry
    pub labels: HashMap<String, String>,
}

/// One probe round's verdict for a single backend
///
/// Two healths are equal iff status, server version, and the failure message
/// all match; the router relies on this to skip no-op updates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackendHealth {
    pub status: BackendStatus,
    /// Version string read from the server greeting; empty when unreachable
    pub server_version: String,
    /// Message of the last probe failure, if any
    pub ping_err: Option<String>,
}

impl BackendHealth {
    pub fn healthy(server_version: impl Into<String>) -> Self {
        Self {
            status: BackendStatus::Healthy,
            server_version: server_version.into(),
            ping_err: None,
        }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            status: BackendStatus::CannotConnect,
            server_version: String::new(),
            ping_err: Some(reason.into()),
        }
    }
}

impl fmt::Display for BackendHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)?;
        if !self.server_version.is_empty() {
            write!(f, ", version {}", self.server_version)?;
        }
        if let Some(err) = &self.ping_err {
            write!(f, ", err: {}", err)?;
        }
        Ok(())
    }
}

/// One observer tick's complete view of fleet health
///
/// Either a global observation failure (`error` set, backends meaningless) or
/// a complete mapping that contains every backend the fleet knew in that
/// tick. Addresses that disappeared do not appear; consumers treat them as
/// unreachable.
#[derive(Debug, Clone, Default)]
pub struct HealthResult {
    backends: HashMap<String, BackendHealth>,
    error: Option<String>,
}

impl HealthResult {
    pub fn new(backends: HashMap<String, BackendHealth>) -> Self {
        Self {
            backends,
            error: None,
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            backends: HashMap::new(),
            error: Some(error.into()),
        }
    }

    pub fn backends(&self) -> &HashMap<String, BackendHealth> {
        &self.backends
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
