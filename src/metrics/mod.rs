/// Metric sinks for routing decisions and backend state
///
/// Only the recording side lives here; exposition is wired by the embedding
/// process.
use metrics::{counter, gauge, histogram};
use tokio::time::Instant;

/// Update the per-backend attached-connection gauge.
pub fn record_backend_conns(backend: &str, conns: usize) {
    gauge!("router_backend_connections", "backend" => backend.to_string()).set(conns as f64);
}

/// Record one finished connection migration.
pub fn record_migration(from: &str, to: &str, succeed: bool, started: Option<Instant>) {
    let labels = [
        ("from", from.to_string()),
        ("to", to.to_string()),
        ("result", if succeed { "succeed" } else { "fail" }.to_string()),
    ];
    counter!("router_migrations_total", &labels).increment(1);
    if let Some(started) = started {
        histogram!("router_migration_duration_seconds", &labels)
            .record(started.elapsed().as_secs_f64());
    }
}

/// Record the health verdict for a backend.
pub fn record_backend_healthy(backend: &str, healthy: bool) {
    let val = if healthy { 1.0 } else { 0.0 };
    gauge!("router_backend_healthy", "backend" => backend.to_string()).set(val);
}
