pub mod config;
pub mod error;
/// Puente - score-based connection router for SQL database proxies
///
/// Puente decides which backend every client connection is attached to and
/// keeps that assignment balanced while the fleet changes shape. Two
/// subsystems cooperate:
/// 1. Health observer: probes every backend (TCP dial, server greeting, HTTP
///    status endpoint) and publishes complete health snapshots.
/// 2. Score router: consumes the snapshot stream, orders backends by load
///    score, hands out backends to new connections, and migrates attached
///    connections away from busy or draining backends via redirects.
pub mod health;
pub mod metrics;
pub mod router;

pub use config::Config;
pub use error::{RouterError, RouterResult};
pub use health::check::{DefaultHealthCheck, HealthCheck, HealthCheckConfig};
pub use health::fetcher::{BackendFetcher, StaticFetcher};
pub use health::observer::{BackendObserver, ObserverConfig};
pub use health::{BackendHealth, BackendInfo, BackendStatus, HealthResult};
pub use router::score::{BalanceConfig, ScoreBasedRouter};
pub use router::{BackendInst, BackendSelector, ConnEventReceiver, RedirectableConn};
