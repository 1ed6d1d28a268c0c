/// Backend membership fetching
///
/// The observer treats the fetcher as the source of truth for *who exists*;
/// the health checks determine *who works*.
use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use super::BackendInfo;

/// Errors from fetching the current cluster membership
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("backend registry unavailable: {0}")]
    Unavailable(String),

    #[error("invalid backend address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },
}

/// Source of the current set of backend addresses
#[async_trait]
pub trait BackendFetcher: Send + Sync {
    /// Returns the currently known cluster membership keyed by SQL address.
    async fn get_backend_list(&self) -> Result<HashMap<String, BackendInfo>, FetchError>;
}

/// Fetcher backed by a fixed address list from the configuration
///
/// Used when no cluster registry integration is wired in. The status endpoint
/// is assumed to live on the same host as the SQL port.
#[derive(Debug)]
pub struct StaticFetcher {
    backends: HashMap<String, BackendInfo>,
}

impl StaticFetcher {
    /// Builds the fetcher from `host:port` SQL addresses, deriving each
    /// status address from the host plus the shared status port.
    pub fn new(addrs: &[String], status_port: u16) -> Result<Self, FetchError> {
        let mut backends = HashMap::with_capacity(addrs.len());
        for addr in addrs {
            let ip = addr
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .ok_or_else(|| FetchError::InvalidAddress {
                    addr: addr.clone(),
                    reason: "expected host:port".to_string(),
                })?;
            backends.insert(
                addr.clone(),
                BackendInfo {
                    ip,
                    status_port,
                    labels: HashMap::new(),
                },
            );
        }
        Ok(Self { backends })
    }
}

#[async_trait]
impl BackendFetcher for StaticFetcher {
    async fn get_backend_list(&self) -> Result<HashMap<String, BackendInfo>, FetchError> {
        Ok(self.backends.clone())
    }
}
