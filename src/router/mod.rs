/// Connection routing across a dynamic backend fleet
///
/// The router consumes the observer's health stream, keeps backends ordered
/// by load score, hands backends to new connections through
/// [`BackendSelector`], and migrates attached connections through the
/// [`RedirectableConn`] / [`ConnEventReceiver`] contracts implemented by the
/// proxy data plane.
pub mod registry;
pub mod score;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::RouterResult;
use self::score::ScoreBasedRouter;

/// Shared handle to one routable backend
///
/// The router and every holder (selectors, in-flight connections) see the
/// same instance, so a health flip is visible to all of them immediately.
#[derive(Clone)]
pub struct BackendInst {
    inner: Arc<BackendInstInner>,
}

struct BackendInstInner {
    addr: String,
    healthy: AtomicBool,
}

impl BackendInst {
    pub(crate) fn new(addr: &str) -> Self {
        Self {
            inner: Arc::new(BackendInstInner {
                addr: addr.to_string(),
                healthy: AtomicBool::new(false),
            }),
        }
    }

    /// SQL address of the backend
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Whether the backend passed its latest probe round
    pub fn healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire)
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.inner.healthy.store(healthy, Ordering::Release);
    }
}

impl fmt::Debug for BackendInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendInst")
            .field("addr", &self.inner.addr)
            .field("healthy", &self.healthy())
            .finish()
    }
}

/// Receiver for connection lifecycle events, implemented by the router and
/// invoked by the proxy data plane
pub trait ConnEventReceiver: Send + Sync {
    /// The connection finished migrating from `from` to `to`.
    fn on_redirect_succeed(
        &self,
        from: &str,
        to: &str,
        conn: &Arc<dyn RedirectableConn>,
    ) -> RouterResult<()>;

    /// The migration from `from` to `to` failed; the connection stays where
    /// it was.
    fn on_redirect_fail(
        &self,
        from: &str,
        to: &str,
        conn: &Arc<dyn RedirectableConn>,
    ) -> RouterResult<()>;

    /// The client connection closed while attached to `addr`.
    fn on_conn_closed(&self, addr: &str, conn: &Arc<dyn RedirectableConn>) -> RouterResult<()>;
}

/// A live client session the data plane can migrate between backends
pub trait RedirectableConn: Send + Sync {
    fn connection_id(&self) -> u64;

    /// Address of the backend the session is currently attached to
    fn addr(&self) -> String;

    fn set_event_receiver(&self, receiver: Arc<dyn ConnEventReceiver>);

    /// Begin migrating the session to `target`. Must not block: the data
    /// plane performs the migration on the connection's own task and reports
    /// the outcome through the event receiver.
    fn redirect(&self, target: &BackendInst);

    /// Opaque per-connection slot. The router stores the address of the
    /// backend that currently owns the connection's registry entry.
    fn set_value(&self, value: Option<Arc<dyn Any + Send + Sync>>);

    fn value(&self) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Per-client selection handle
///
/// `next` reserves a backend (bumping its score so concurrent selections
/// spread out); `finish` either commits the reservation with the real
/// connection or rolls it back.
pub struct BackendSelector {
    router: Arc<ScoreBasedRouter>,
    picked: Option<BackendInst>,
}

impl BackendSelector {
    pub(crate) fn new(router: Arc<ScoreBasedRouter>) -> Self {
        Self {
            router,
            picked: None,
        }
    }

    /// Returns the idlest healthy backend not in `excluded` and reserves one
    /// connection slot on it.
    pub fn next(&mut self, excluded: &[BackendInst]) -> RouterResult<BackendInst> {
        let backend = self.router.route_once(excluded)?;
        self.picked = Some(backend.clone());
        Ok(backend)
    }

    /// Commits or rolls back the reservation made by the last `next`. A
    /// successful finish attaches `conn` to the reserved backend and
    /// registers the router as its event receiver.
    pub fn finish(&mut self, conn: Option<&Arc<dyn RedirectableConn>>, succeed: bool) {
        if let Some(backend) = self.picked.take() {
            self.router.on_create_conn(backend, conn, succeed);
        }
    }
}
