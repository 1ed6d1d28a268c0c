/// Score-ordered backend and connection bookkeeping
///
/// The registry is the single shared structure behind the router's lock: a
/// vector of backends kept sorted by score descending (head busiest, tail
/// idlest), each holding the connections attached to it. Every mutation
/// reestablishes the order by bubbling the changed backend past strictly
/// better or worse neighbors only, so backends with equal scores never churn.
use std::sync::Arc;

use tokio::time::Instant;
use tracing::warn;

use super::{BackendInst, RedirectableConn};
use crate::health::{BackendHealth, BackendStatus};
use crate::metrics;

/// Score added to unroutable backends so they sort to the head of the list
/// and the rebalance loop drains them before balancing healthy ones.
const DRAIN_PENALTY: i64 = 10_000_000;

/// Per-connection position in the redirect state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectPhase {
    /// Never redirected; eligible
    #[default]
    NotRedirected,
    /// A redirect was emitted and its outcome has not arrived yet; blocks
    /// further redirects
    RedirectNotify,
    /// The last redirect failed; eligible again after the cooldown
    RedirectFail,
    /// The last redirect succeeded; eligible
    RedirectEnd,
}

/// One attached connection, owned by exactly one backend at a time
pub(crate) struct ConnWrapper {
    pub conn: Arc<dyn RedirectableConn>,
    pub phase: RedirectPhase,
    /// When the most recent redirect was emitted
    pub last_redirect: Option<Instant>,
    /// Address of the redirect target while `phase == RedirectNotify`. Kept
    /// as an address rather than a reference so backend removal cannot leave
    /// it dangling.
    pub redirecting_to: Option<String>,
}

impl ConnWrapper {
    pub fn new(conn: Arc<dyn RedirectableConn>) -> Self {
        Self {
            conn,
            phase: RedirectPhase::NotRedirected,
            last_redirect: None,
            redirecting_to: None,
        }
    }
}

/// One live backend with its attached connections and pending reservations
pub(crate) struct BackendWrapper {
    inst: BackendInst,
    health: BackendHealth,
    /// Incoming intentions: incremented on selection and redirect targeting
    /// before a connection materializes, decremented on failure or close
    pub conn_score: i64,
    pub conns: Vec<ConnWrapper>,
}

impl BackendWrapper {
    fn new(addr: &str) -> Self {
        Self {
            inst: BackendInst::new(addr),
            health: BackendHealth::default(),
            conn_score: 0,
            conns: Vec::new(),
        }
    }

    pub fn addr(&self) -> &str {
        self.inst.addr()
    }

    pub fn status(&self) -> BackendStatus {
        self.health.status
    }

    pub fn health(&self) -> &BackendHealth {
        &self.health
    }

    pub fn set_health(&mut self, health: BackendHealth) {
        let healthy = health.status == BackendStatus::Healthy;
        self.inst.set_healthy(healthy);
        metrics::record_backend_healthy(self.addr(), healthy);
        self.health = health;
    }

    /// Shared handle given to selectors and connections
    pub fn inst(&self) -> BackendInst {
        self.inst.clone()
    }

    /// Load estimate used for ordering and rebalance decisions
    ///
    /// `conn_score` counts attached connections plus pending intentions; at
    /// steady state it equals the conn list length. Unroutable backends carry
    /// the drain penalty on top, which floats them to the busy end of the
    /// list so their connections migrate away first.
    pub fn score(&self) -> i64 {
        let penalty = match self.health.status {
            BackendStatus::Healthy => 0,
            BackendStatus::CannotConnect | BackendStatus::SchemaOutdated => DRAIN_PENALTY,
        };
        penalty + self.conn_score
    }
}

/// The ordered backend list with its primitive mutations
///
/// Indices are positions in the sorted order and shift on every mutation;
/// callers re-derive them by address lookup after any call that re-sorts.
#[derive(Default)]
pub(crate) struct BackendRegistry {
    backends: Vec<BackendWrapper>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn get(&self, idx: usize) -> &BackendWrapper {
        &self.backends[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut BackendWrapper {
        &mut self.backends[idx]
    }

    pub fn backends(&self) -> &[BackendWrapper] {
        &self.backends
    }

    pub fn lookup(&self, addr: &str) -> Option<usize> {
        self.backends.iter().position(|b| b.addr() == addr)
    }

    /// Insert a new backend with the given health and bubble it into place.
    pub fn insert(&mut self, addr: &str, health: BackendHealth) -> usize {
        let mut backend = BackendWrapper::new(addr);
        backend.set_health(health);
        self.backends.push(backend);
        self.bubble(self.backends.len() - 1)
    }

    /// Look up a backend, reinserting it defensively as unreachable when a
    /// lifecycle event references an address the registry no longer holds.
    pub fn ensure(&mut self, addr: &str) -> usize {
        match self.lookup(addr) {
            Some(idx) => idx,
            None => {
                warn!(backend = %addr, "backend not found in the router, reinserting");
                self.insert(addr, BackendHealth::default())
            }
        }
    }

    /// Attach a connection, record the owner address in the connection's
    /// opaque slot, and re-sort. Returns the backend's new index.
    pub fn add_conn(&mut self, idx: usize, wrapper: ConnWrapper) -> usize {
        let backend = &mut self.backends[idx];
        wrapper
            .conn
            .set_value(Some(Arc::new(backend.addr().to_string())));
        backend.conns.push(wrapper);
        metrics::record_backend_conns(backend.addr(), backend.conns.len());
        self.bubble(idx)
    }

    /// Detach a connection by id, re-sort, and attempt empty-unhealthy
    /// removal of the backend.
    pub fn remove_conn(&mut self, idx: usize, conn_id: u64) -> Option<ConnWrapper> {
        let backend = &mut self.backends[idx];
        let pos = backend
            .conns
            .iter()
            .position(|c| c.conn.connection_id() == conn_id)?;
        let wrapper = backend.conns.remove(pos);
        metrics::record_backend_conns(backend.addr(), backend.conns.len());
        self.adjust(idx, true);
        Some(wrapper)
    }

    /// Reestablish order after the backend at `idx` changed score. With
    /// `remove_if_empty`, first try removing an unreachable backend with no
    /// connections and no pending reservations. Returns the new index, or
    /// None when the backend was removed.
    pub fn adjust(&mut self, idx: usize, remove_if_empty: bool) -> Option<usize> {
        if remove_if_empty && self.remove_if_empty(idx) {
            return None;
        }
        Some(self.bubble(idx))
    }

    fn remove_if_empty(&mut self, idx: usize) -> bool {
        let backend = &self.backends[idx];
        if backend.status() == BackendStatus::CannotConnect
            && backend.conns.is_empty()
            && backend.conn_score <= 0
        {
            self.backends.remove(idx);
            return true;
        }
        false
    }

    /// Bubble toward the head past strictly lower scores, else toward the
    /// tail past strictly higher scores. Equal scores do not move, keeping
    /// the order stable and the tail deterministic.
    fn bubble(&mut self, mut idx: usize) -> usize {
        let score = self.backends[idx].score();
        let start = idx;
        while idx > 0 && self.backends[idx - 1].score() < score {
            self.backends.swap(idx - 1, idx);
            idx -= 1;
        }
        if idx != start {
            return idx;
        }
        while idx + 1 < self.backends.len() && self.backends[idx + 1].score() > score {
            self.backends.swap(idx, idx + 1);
            idx += 1;
        }
        idx
    }

    /// Total attached connections across the fleet
    pub fn conn_count(&self) -> usize {
        self.backends.iter().map(|b| b.conns.len()).sum()
    }

    /// Asserts the order and removal invariants; test support.
    #[cfg(test)]
    pub fn assert_invariants(&self) {
        let mut prev = i64::MAX;
        for backend in &self.backends {
            assert!(
                backend.status() != BackendStatus::CannotConnect
                    || !backend.conns.is_empty()
                    || backend.conn_score > 0,
                "empty unreachable backend {} kept in the list",
                backend.addr()
            );
            let score = backend.score();
            assert!(
                prev >= score,
                "backend list out of order at {}: {} < {}",
                backend.addr(),
                prev,
                score
            );
            prev = score;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::ConnEventReceiver;
    use std::any::Any;
    use std::sync::Mutex;

    struct StubConn {
        id: u64,
        value: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    }

    impl StubConn {
        fn new(id: u64) -> Arc<dyn RedirectableConn> {
            Arc::new(Self {
                id,
                value: Mutex::new(None),
            })
        }
    }

    impl RedirectableConn for StubConn {
        fn connection_id(&self) -> u64 {
            self.id
        }

        fn addr(&self) -> String {
            String::new()
        }

        fn set_event_receiver(&self, _receiver: Arc<dyn ConnEventReceiver>) {}

        fn redirect(&self, _target: &BackendInst) {}

        fn set_value(&self, value: Option<Arc<dyn Any + Send + Sync>>) {
            *self.value.lock().unwrap() = value;
        }

        fn value(&self) -> Option<Arc<dyn Any + Send + Sync>> {
            self.value.lock().unwrap().clone()
        }
    }

    fn healthy() -> BackendHealth {
        BackendHealth::healthy("8.0.11")
    }

    #[test]
    fn test_insert_keeps_descending_order() {
        let mut registry = BackendRegistry::new();
        registry.insert("a", healthy());
        registry.insert("b", healthy());
        registry.insert("c", healthy());
        registry.assert_invariants();
        assert_eq!(registry.len(), 3);

        // Load up "c" and watch it bubble to the head.
        let idx = registry.lookup("c").unwrap();
        registry.get_mut(idx).conn_score = 5;
        let new_idx = registry.adjust(idx, false).unwrap();
        assert_eq!(new_idx, 0);
        assert_eq!(registry.get(0).addr(), "c");
        registry.assert_invariants();
    }

    #[test]
    fn test_equal_scores_do_not_move() {
        let mut registry = BackendRegistry::new();
        registry.insert("a", healthy());
        registry.insert("b", healthy());
        registry.insert("c", healthy());

        // All scores equal: adjusting any backend must not reorder.
        let order: Vec<String> = registry
            .backends()
            .iter()
            .map(|b| b.addr().to_string())
            .collect();
        for addr in ["a", "b", "c"] {
            let idx = registry.lookup(addr).unwrap();
            registry.adjust(idx, false);
        }
        let after: Vec<String> = registry
            .backends()
            .iter()
            .map(|b| b.addr().to_string())
            .collect();
        assert_eq!(order, after);
    }

    #[test]
    fn test_bubble_down_on_score_drop() {
        let mut registry = BackendRegistry::new();
        registry.insert("a", healthy());
        registry.insert("b", healthy());
        registry.get_mut(registry.lookup("a").unwrap()).conn_score = 4;
        registry.adjust(registry.lookup("a").unwrap(), false);
        registry.get_mut(registry.lookup("b").unwrap()).conn_score = 2;
        registry.adjust(registry.lookup("b").unwrap(), false);
        assert_eq!(registry.get(0).addr(), "a");

        let idx = registry.lookup("a").unwrap();
        registry.get_mut(idx).conn_score = 1;
        registry.adjust(idx, false);
        assert_eq!(registry.get(0).addr(), "b");
        assert_eq!(registry.get(1).addr(), "a");
        registry.assert_invariants();
    }

    #[test]
    fn test_empty_unreachable_backend_is_removed() {
        let mut registry = BackendRegistry::new();
        registry.insert("a", healthy());
        let idx = registry.lookup("a").unwrap();
        registry
            .get_mut(idx)
            .set_health(BackendHealth::unreachable("probe failed"));

        assert!(registry.adjust(idx, true).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unreachable_backend_with_conns_is_kept() {
        let mut registry = BackendRegistry::new();
        registry.insert("a", healthy());
        let idx = registry.lookup("a").unwrap();
        registry.add_conn(idx, ConnWrapper::new(StubConn::new(1)));

        let idx = registry.lookup("a").unwrap();
        registry
            .get_mut(idx)
            .set_health(BackendHealth::unreachable("probe failed"));
        assert!(registry.adjust(idx, true).is_some());
        assert_eq!(registry.len(), 1);

        // Dropping the connection triggers removal.
        let idx = registry.lookup("a").unwrap();
        let removed = registry.remove_conn(idx, 1);
        assert!(removed.is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_conn_records_owner() {
        let mut registry = BackendRegistry::new();
        registry.insert("a", healthy());
        let conn = StubConn::new(7);
        // The selection reserved a slot before the connection materialized.
        registry.get_mut(0).conn_score += 1;
        registry.add_conn(0, ConnWrapper::new(Arc::clone(&conn)));

        let owner = conn.value().unwrap();
        let owner = owner.downcast_ref::<String>().unwrap();
        assert_eq!(owner, "a");
        assert_eq!(registry.conn_count(), 1);
        assert_eq!(registry.get(0).score(), 1);
    }

    #[test]
    fn test_unroutable_backend_sorts_to_head() {
        let mut registry = BackendRegistry::new();
        registry.insert("a", healthy());
        registry.insert("b", healthy());
        let idx = registry.lookup("b").unwrap();
        registry.get_mut(idx).conn_score = 3;
        registry
            .get_mut(idx)
            .set_health(BackendHealth::unreachable("probe failed"));
        registry.adjust(idx, true);

        // The dead backend outranks any healthy load.
        let idx = registry.lookup("a").unwrap();
        registry.get_mut(idx).conn_score = 100;
        registry.adjust(idx, false);
        assert_eq!(registry.get(0).addr(), "b");
        registry.assert_invariants();
    }

    #[test]
    fn test_ensure_reinserts_unknown_address() {
        let mut registry = BackendRegistry::new();
        let idx = registry.ensure("ghost");
        assert_eq!(registry.get(idx).status(), BackendStatus::CannotConnect);
        assert_eq!(registry.len(), 1);

        // A second ensure finds the reinserted entry.
        assert_eq!(registry.ensure("ghost"), idx);
    }
}
