/// Score-based routing and rebalancing
///
/// One control task serializes health application and rebalance ticks;
/// selection and data-plane callbacks run on any task and serialize on the
/// registry lock. Critical sections are CPU-only.
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::registry::{BackendRegistry, ConnWrapper, RedirectPhase};
use super::{BackendInst, BackendSelector, ConnEventReceiver, RedirectableConn};
use crate::error::{RouterError, RouterResult};
use crate::health::observer::BackendObserver;
use crate::health::{BackendHealth, BackendStatus, HealthResult};
use crate::metrics;

/// Rebalance cadence and thresholds
#[derive(Debug, Clone)]
pub struct BalanceConfig {
    /// Rebalance tick period
    pub rebalance_interval: Duration,
    /// Redirects emitted per tick at most
    pub max_redirects_per_tick: usize,
    /// Busiest/idlest score ratio below which the fleet counts as balanced;
    /// must be above 1.0
    pub max_score_ratio: f64,
    /// Minimum gap before retrying a failed redirect on the same connection
    pub redirect_fail_cooldown: Duration,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            rebalance_interval: Duration::from_millis(10),
            max_redirects_per_tick: 100,
            max_score_ratio: 1.2,
            redirect_fail_cooldown: Duration::from_secs(3),
        }
    }
}

/// State behind the registry lock
struct RouterInner {
    registry: BackendRegistry,
    /// Latched global observation failure; selection fails fast while set
    observe_error: Option<String>,
    /// Version of an arbitrary healthy backend; approximate during rolling
    /// upgrades
    server_version: String,
}

/// Routes connections to the idlest healthy backend and keeps the fleet
/// balanced by redirecting connections away from busy or draining backends
pub struct ScoreBasedRouter {
    weak: Weak<ScoreBasedRouter>,
    cfg: BalanceConfig,
    inner: Mutex<RouterInner>,
    observer: Mutex<Option<Arc<BackendObserver>>>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScoreBasedRouter {
    pub fn new(cfg: BalanceConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            cfg,
            inner: Mutex::new(RouterInner {
                registry: BackendRegistry::new(),
                observe_error: None,
                server_version: String::new(),
            }),
            observer: Mutex::new(None),
            shutdown_tx,
            loop_handle: Mutex::new(None),
        })
    }

    fn shared(&self) -> Arc<Self> {
        // A &self can only be obtained through a live Arc.
        self.weak.upgrade().expect("router already dropped")
    }

    /// Subscribes to the observer and spawns the control loop. Calling twice
    /// is a no-op.
    pub fn init(&self, observer: &Arc<BackendObserver>) {
        let mut handle = self.loop_handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let health_rx = observer.subscribe("score_router");
        *self.observer.lock().unwrap() = Some(Arc::clone(observer));
        let router = self.shared();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // Failing to rebalance is worse than a restart, so the loop is not
        // panic-guarded.
        *handle = Some(tokio::spawn(async move {
            router.control_loop(health_rx, &mut shutdown_rx).await;
        }));
    }

    /// Fresh stateless selection handle for one client connection
    pub fn get_backend_selector(&self) -> BackendSelector {
        BackendSelector::new(self.shared())
    }

    /// Hint the observer to re-probe immediately.
    pub fn refresh_backend(&self) {
        if let Some(observer) = self.observer.lock().unwrap().as_ref() {
            observer.refresh();
        }
    }

    /// Total connections attached across all backends
    pub fn conn_count(&self) -> usize {
        self.inner.lock().unwrap().registry.conn_count()
    }

    /// Server version of an arbitrary healthy backend
    pub fn server_version(&self) -> String {
        self.inner.lock().unwrap().server_version.clone()
    }

    /// Stops the control loop and waits for it to exit. Idempotent. The
    /// router does not own the client connections; they outlive it.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "router control loop aborted");
            }
        }
    }

    async fn control_loop(
        &self,
        mut health_rx: broadcast::Receiver<HealthResult>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.cfg.rebalance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut subscribed = true;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                result = health_rx.recv(), if subscribed => match result {
                    Ok(snapshot) => self.update_backend_health(snapshot),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(dropped = n, "router lagging behind health snapshots");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("health subscription closed");
                        subscribed = false;
                    }
                },
                _ = ticker.tick() => self.rebalance(self.cfg.max_redirects_per_tick),
            }
        }
        debug!("router control loop stopped");
    }

    /// Selection: scan from the idle tail toward the busy head and reserve
    /// the first healthy backend not excluded by the caller.
    pub(crate) fn route_once(&self, excluded: &[BackendInst]) -> RouterResult<BackendInst> {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(cause) = &inner.observe_error {
                return Err(RouterError::Observe(cause.clone()));
            }
            for idx in (0..inner.registry.len()).rev() {
                let backend = inner.registry.get(idx);
                if !backend.status().routable() {
                    continue;
                }
                if excluded.iter().any(|ex| ex.addr() == backend.addr()) {
                    continue;
                }
                inner.registry.get_mut(idx).conn_score += 1;
                let inst = inner.registry.get(idx).inst();
                inner.registry.adjust(idx, false);
                return Ok(inst);
            }
        }
        // The health result may be outdated during a rolling restart; ask
        // for a fresh round before the caller retries.
        self.refresh_backend();
        Err(RouterError::NoBackend)
    }

    /// Commits or rolls back a selection reservation.
    pub(crate) fn on_create_conn(
        &self,
        backend: BackendInst,
        conn: Option<&Arc<dyn RedirectableConn>>,
        succeed: bool,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let registry = &mut inner.registry;
        let idx = registry.ensure(backend.addr());
        match conn {
            Some(conn) if succeed => {
                registry.add_conn(idx, ConnWrapper::new(Arc::clone(conn)));
                conn.set_event_receiver(self.shared());
            }
            _ => {
                if succeed {
                    warn!(backend = %backend.addr(), "finish without a connection, rolling back");
                }
                registry.get_mut(idx).conn_score -= 1;
                registry.adjust(idx, true);
            }
        }
    }

    /// Applies one health snapshot to the registry.
    pub(crate) fn update_backend_health(&self, result: HealthResult) {
        let mut inner = self.inner.lock().unwrap();
        inner.observe_error = result.error().map(str::to_string);
        if inner.observe_error.is_some() {
            return;
        }

        // The snapshot is complete: a registered backend missing from it has
        // been removed from the fleet.
        let mut healths = result.backends().clone();
        for backend in inner.registry.backends() {
            if !healths.contains_key(backend.addr()) {
                healths.insert(
                    backend.addr().to_string(),
                    BackendHealth::unreachable("removed from backend list"),
                );
            }
        }

        let mut server_version = String::new();
        for (addr, health) in healths {
            match inner.registry.lookup(&addr) {
                None => {
                    if health.status != BackendStatus::CannotConnect {
                        info!(backend = %addr, prev = "none", cur = %health, "backend health changed");
                        server_version = health.server_version.clone();
                        inner.registry.insert(&addr, health);
                    }
                }
                Some(idx) => {
                    if inner.registry.get(idx).health() != &health {
                        info!(
                            backend = %addr,
                            prev = %inner.registry.get(idx).health(),
                            cur = %health,
                            "backend health changed"
                        );
                        if health.status != BackendStatus::CannotConnect {
                            server_version = health.server_version.clone();
                        }
                        inner.registry.get_mut(idx).set_health(health);
                        inner.registry.adjust(idx, true);
                    }
                }
            }
        }
        if !server_version.is_empty() {
            inner.server_version = server_version;
        }
    }

    /// One rebalance tick: migrate up to `max_num` connections from the
    /// busiest backend holding connections to the idlest one.
    pub(crate) fn rebalance(&self, max_num: usize) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..max_num {
            let registry = &mut inner.registry;
            let Some(busiest_idx) = registry.backends().iter().position(|b| !b.conns.is_empty())
            else {
                break;
            };
            let idlest_idx = registry.len() - 1;
            if busiest_idx == idlest_idx {
                break;
            }
            let busiest_score = registry.get(busiest_idx).score();
            let idlest_score = registry.get(idlest_idx).score();
            if (busiest_score as f64) / (idlest_score as f64 + 1.0) < self.cfg.max_score_ratio {
                break;
            }

            let cooldown = self.cfg.redirect_fail_cooldown;
            let Some(conn_pos) = registry
                .get(busiest_idx)
                .conns
                .iter()
                .position(|c| match c.phase {
                    // Still waiting for the previous redirect's outcome.
                    RedirectPhase::RedirectNotify => false,
                    // Failed recently; it would probably fail again.
                    RedirectPhase::RedirectFail => {
                        c.last_redirect.map_or(true, |at| at + cooldown <= now)
                    }
                    _ => true,
                })
            else {
                break;
            };

            let busiest_addr = registry.get(busiest_idx).addr().to_string();
            let idlest_addr = registry.get(idlest_idx).addr().to_string();
            let target = registry.get(idlest_idx).inst();

            // Mark the connection before the score swap shifts positions.
            let conn = {
                let wrapper = &mut registry.get_mut(busiest_idx).conns[conn_pos];
                wrapper.phase = RedirectPhase::RedirectNotify;
                wrapper.last_redirect = Some(now);
                wrapper.redirecting_to = Some(idlest_addr.clone());
                Arc::clone(&wrapper.conn)
            };
            debug!(
                conn_id = conn.connection_id(),
                from = %busiest_addr,
                to = %idlest_addr,
                from_score = busiest_score,
                to_score = idlest_score,
                "redirecting connection"
            );

            registry.get_mut(busiest_idx).conn_score -= 1;
            registry.adjust(busiest_idx, true);
            if let Some(idx) = registry.lookup(&idlest_addr) {
                registry.get_mut(idx).conn_score += 1;
                registry.adjust(idx, false);
            }

            // Fire and forget: the data plane migrates on the connection's
            // own task and reports through the event receiver.
            conn.redirect(&target);
        }
    }

    fn on_redirect_finished(
        &self,
        from: &str,
        to: &str,
        conn: &Arc<dyn RedirectableConn>,
        succeed: bool,
    ) {
        let conn_id = conn.connection_id();
        let mut inner = self.inner.lock().unwrap();
        let registry = &mut inner.registry;
        registry.ensure(from);
        registry.ensure(to);
        // The second ensure may have shifted positions.
        let Some(from_idx) = registry.lookup(from) else {
            return;
        };
        let Some(conn_pos) = registry
            .get(from_idx)
            .conns
            .iter()
            .position(|c| c.conn.connection_id() == conn_id)
        else {
            warn!(conn_id, backend = %from, "redirect result for a connection not in the list");
            registry.adjust(from_idx, true);
            if let Some(to_idx) = registry.lookup(to) {
                registry.adjust(to_idx, true);
            }
            return;
        };
        let started = registry.get(from_idx).conns[conn_pos].last_redirect;

        if succeed {
            if let Some(mut wrapper) = registry.remove_conn(from_idx, conn_id) {
                wrapper.phase = RedirectPhase::RedirectEnd;
                wrapper.redirecting_to = None;
                let to_idx = registry.ensure(to);
                registry.add_conn(to_idx, wrapper);
            }
        } else {
            {
                let wrapper = &mut registry.get_mut(from_idx).conns[conn_pos];
                wrapper.phase = RedirectPhase::RedirectFail;
                wrapper.redirecting_to = None;
            }
            // Cancel the score swap done when the redirect was emitted.
            registry.get_mut(from_idx).conn_score += 1;
            registry.adjust(from_idx, false);
            if let Some(to_idx) = registry.lookup(to) {
                registry.get_mut(to_idx).conn_score -= 1;
                registry.adjust(to_idx, true);
            }
        }
        metrics::record_migration(from, to, succeed, started);
    }

    fn handle_conn_closed(&self, addr: &str, conn: &Arc<dyn RedirectableConn>) {
        let conn_id = conn.connection_id();
        let mut inner = self.inner.lock().unwrap();
        let registry = &mut inner.registry;
        // The owner recorded at attach time outranks the caller's view.
        let owner = conn_owner(conn).unwrap_or_else(|| addr.to_string());
        let idx = registry.ensure(&owner);
        let Some(conn_pos) = registry
            .get(idx)
            .conns
            .iter()
            .position(|c| c.conn.connection_id() == conn_id)
        else {
            warn!(conn_id, backend = %addr, "closed connection unknown to the router");
            registry.adjust(idx, true);
            return;
        };

        match registry.get_mut(idx).conns[conn_pos].redirecting_to.take() {
            Some(target) => {
                // The connection's score half moved to the redirect target
                // when the redirect was emitted; release it there.
                if let Some(target_idx) = registry.lookup(&target) {
                    registry.get_mut(target_idx).conn_score -= 1;
                    registry.adjust(target_idx, true);
                }
            }
            None => {
                registry.get_mut(idx).conn_score -= 1;
            }
        }
        if let Some(idx) = registry.lookup(&owner) {
            registry.remove_conn(idx, conn_id);
        }
        conn.set_value(None);
    }
}

impl ConnEventReceiver for ScoreBasedRouter {
    fn on_redirect_succeed(
        &self,
        from: &str,
        to: &str,
        conn: &Arc<dyn RedirectableConn>,
    ) -> RouterResult<()> {
        self.on_redirect_finished(from, to, conn, true);
        Ok(())
    }

    fn on_redirect_fail(
        &self,
        from: &str,
        to: &str,
        conn: &Arc<dyn RedirectableConn>,
    ) -> RouterResult<()> {
        self.on_redirect_finished(from, to, conn, false);
        Ok(())
    }

    fn on_conn_closed(&self, addr: &str, conn: &Arc<dyn RedirectableConn>) -> RouterResult<()> {
        self.handle_conn_closed(addr, conn);
        Ok(())
    }
}

/// Owner backend address stored in the connection's opaque slot
fn conn_owner(conn: &Arc<dyn RedirectableConn>) -> Option<String> {
    conn.value()
        .and_then(|value| value.downcast_ref::<String>().cloned())
}
