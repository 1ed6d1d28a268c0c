/// Fleet-wide health observation
///
/// One background task drives the probe ladder for every known backend on a
/// fixed cadence, diffs the outcome against the previous round, and publishes
/// complete snapshots to subscribers.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::check::HealthCheck;
use super::fetcher::BackendFetcher;
use super::{BackendHealth, HealthResult};

/// Snapshots buffered per subscriber before the oldest is dropped
const SUBSCRIBER_BUFFER: usize = 16;

/// Observer cadence and fan-out knobs
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Probe round period
    pub check_interval: Duration,
    /// Maximum concurrent probes within one round
    pub parallelism: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(3),
            parallelism: 16,
        }
    }
}

/// Periodically probes the fleet and broadcasts health snapshots
pub struct BackendObserver {
    state: Arc<ObserverState>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct ObserverState {
    fetcher: Arc<dyn BackendFetcher>,
    check: Arc<dyn HealthCheck>,
    cfg: ObserverConfig,
    sender: Mutex<Option<broadcast::Sender<HealthResult>>>,
    refresh: Notify,
}

impl BackendObserver {
    pub fn new(
        fetcher: Arc<dyn BackendFetcher>,
        check: Arc<dyn HealthCheck>,
        cfg: ObserverConfig,
    ) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(ObserverState {
                fetcher,
                check,
                cfg,
                sender: Mutex::new(Some(tx)),
                refresh: Notify::new(),
            }),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Spawns the observation task. Calling twice is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let state = Arc::clone(&self.state);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(async move {
            state.observe_loop(&mut shutdown_rx).await;
        }));
    }

    /// Registers a subscriber. Each subscriber receives every snapshot in
    /// emission order; a subscriber that falls behind loses the oldest
    /// buffered snapshots rather than blocking the observer.
    pub fn subscribe(&self, name: &str) -> broadcast::Receiver<HealthResult> {
        let sender = self.state.sender.lock().unwrap();
        match sender.as_ref() {
            Some(tx) => {
                info!(subscriber = name, "health subscriber registered");
                tx.subscribe()
            }
            None => {
                warn!(subscriber = name, "subscribe after close");
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    /// Requests an immediate out-of-cycle probe round. Calls arriving within
    /// one round coalesce into a single extra round.
    pub fn refresh(&self) {
        self.state.refresh.notify_one();
    }

    /// Stops the observation task and closes all subscriber channels.
    /// Idempotent.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "observer task aborted");
            }
        }
        self.state.sender.lock().unwrap().take();
    }
}

impl ObserverState {
    async fn observe_loop(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut prev: HashMap<String, BackendHealth> = HashMap::new();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {}
                _ = self.refresh.notified() => {
                    // An explicit refresh stands in for the next tick.
                    ticker.reset();
                }
            }
            let result = self.observe_once(&mut prev).await;
            let sender = self.sender.lock().unwrap();
            if let Some(tx) = sender.as_ref() {
                // Send only fails when no subscriber exists yet.
                let _ = tx.send(result);
            }
        }
        debug!("observer loop stopped");
    }

    /// One full probe round: fetch membership, fan out checks, diff, build
    /// the snapshot.
    async fn observe_once(&self, prev: &mut HashMap<String, BackendHealth>) -> HealthResult {
        let backends = match self.fetcher.get_backend_list().await {
            Ok(backends) => backends,
            Err(e) => {
                warn!(error = %e, "backend fetch failed");
                return HealthResult::with_error(e.to_string());
            }
        };

        let healths: HashMap<String, BackendHealth> = stream::iter(backends)
            .map(|(addr, info)| {
                let check = Arc::clone(&self.check);
                async move {
                    let health = check.check(&addr, &info).await;
                    (addr, health)
                }
            })
            .buffer_unordered(self.cfg.parallelism.max(1))
            .collect()
            .await;

        for (addr, health) in &healths {
            match prev.get(addr) {
                Some(old) if old == health => {}
                Some(old) => {
                    info!(backend = %addr, prev = %old, cur = %health, "backend health changed");
                }
                None => {
                    info!(backend = %addr, prev = "none", cur = %health, "backend discovered");
                }
            }
        }
        for addr in prev.keys() {
            if !healths.contains_key(addr) {
                info!(backend = %addr, "backend left the fleet");
            }
        }
        *prev = healths.clone();

        HealthResult::new(healths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::fetcher::FetchError;
    use crate::health::{BackendInfo, BackendStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockFetcher {
        addrs: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl MockFetcher {
        fn new(addrs: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                addrs: Mutex::new(addrs.iter().map(|s| s.to_string()).collect()),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl BackendFetcher for MockFetcher {
        async fn get_backend_list(&self) -> Result<HashMap<String, BackendInfo>, FetchError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(FetchError::Unavailable("mock fetch error".to_string()));
            }
            Ok(self
                .addrs
                .lock()
                .unwrap()
                .iter()
                .map(|addr| (addr.clone(), BackendInfo::default()))
                .collect())
        }
    }

    struct MockCheck {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthCheck for MockCheck {
        async fn check(&self, _addr: &str, _info: &BackendInfo) -> BackendHealth {
            self.calls.fetch_add(1, Ordering::Relaxed);
            BackendHealth::healthy("8.0.11")
        }
    }

    fn new_observer(fetcher: Arc<MockFetcher>) -> (BackendObserver, Arc<MockCheck>) {
        let check = Arc::new(MockCheck {
            calls: AtomicUsize::new(0),
        });
        let observer = BackendObserver::new(
            fetcher,
            Arc::clone(&check) as Arc<dyn HealthCheck>,
            ObserverConfig {
                check_interval: Duration::from_millis(20),
                parallelism: 4,
            },
        );
        (observer, check)
    }

    #[tokio::test]
    async fn test_snapshots_are_complete() {
        let fetcher = MockFetcher::new(&["a:4000", "b:4000"]);
        let (observer, _) = new_observer(fetcher);
        let mut rx = observer.subscribe("test");
        observer.start();

        let result = rx.recv().await.unwrap();
        assert!(result.error().is_none());
        assert_eq!(result.backends().len(), 2);
        assert_eq!(
            result.backends()["a:4000"].status,
            BackendStatus::Healthy
        );
        observer.close().await;
    }

    #[tokio::test]
    async fn test_fetch_error_is_published() {
        let fetcher = MockFetcher::new(&["a:4000"]);
        fetcher.fail.store(true, Ordering::Relaxed);
        let (observer, _) = new_observer(Arc::clone(&fetcher));
        let mut rx = observer.subscribe("test");
        observer.start();

        let result = rx.recv().await.unwrap();
        assert!(result.error().unwrap().contains("mock fetch error"));

        // Next clean round clears the error.
        fetcher.fail.store(false, Ordering::Relaxed);
        let mut result = rx.recv().await.unwrap();
        while result.error().is_some() {
            result = rx.recv().await.unwrap();
        }
        assert_eq!(result.backends().len(), 1);
        observer.close().await;
    }

    #[tokio::test]
    async fn test_refresh_triggers_immediate_round() {
        let fetcher = MockFetcher::new(&["a:4000"]);
        let check = Arc::new(MockCheck {
            calls: AtomicUsize::new(0),
        });
        let observer = BackendObserver::new(
            fetcher,
            Arc::clone(&check) as Arc<dyn HealthCheck>,
            ObserverConfig {
                check_interval: Duration::from_secs(3600),
                parallelism: 4,
            },
        );
        let mut rx = observer.subscribe("test");
        observer.start();

        // The first round fires immediately on start.
        rx.recv().await.unwrap();
        let before = check.calls.load(Ordering::Relaxed);

        // With an hour-long interval, only a refresh can produce another one.
        observer.refresh();
        rx.recv().await.unwrap();
        assert!(check.calls.load(Ordering::Relaxed) > before);
        observer.close().await;
    }

    #[tokio::test]
    async fn test_close_ends_subscription() {
        let fetcher = MockFetcher::new(&["a:4000"]);
        let (observer, _) = new_observer(fetcher);
        let mut rx = observer.subscribe("test");
        observer.start();
        rx.recv().await.unwrap();

        observer.close().await;
        // Drain whatever was buffered, then expect Closed.
        loop {
            match rx.recv().await {
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        // Subscribing after close yields an already-closed channel.
        let mut late = observer.subscribe("late");
        assert!(matches!(
            late.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
