// Editor port discovery: polls candidate ports around the base port

use crate::config::{BridgeConfig, DiscoveryConfig};
use crate::sync::lock;
use crate::transport::PeerClient;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type DiscoveredCallback = Arc<dyn Fn(u16) -> BoxFuture<'static, ()> + Send + Sync>;
type LostCallback = Arc<dyn Fn() + Send + Sync>;

static SHARED: OnceLock<Arc<Discovery>> = OnceLock::new();

/// Snapshot of discovery state for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryStatus {
    pub running: bool,
    pub scanning: bool,
    pub active_timers: usize,
    pub connected: bool,
    pub interval_ms: u64,
    pub base_port: u16,
    pub candidate_ports: Vec<u16>,
}

pub struct Discovery {
    this: Weak<Discovery>,
    client: Arc<PeerClient>,
    base_port: u16,
    config: DiscoveryConfig,
    development: bool,
    running: AtomicBool,
    scan_lock: AsyncMutex<()>,
    active_timers: Arc<AtomicUsize>,
    timer: Mutex<Option<CancellationToken>>,
    on_discovered: Mutex<Option<DiscoveredCallback>>,
    on_connection_lost: Mutex<Option<LostCallback>>,
    waiters: Mutex<Vec<oneshot::Sender<u16>>>,
}

impl Discovery {
    /// The process-wide instance. The first call creates it; later calls
    /// return the same instance and ignore their arguments.
    pub fn shared(client: Arc<PeerClient>, config: &BridgeConfig) -> Arc<Self> {
        let discovery = SHARED.get_or_init(|| {
            Self::new(
                client.clone(),
                config.peer.port,
                config.discovery.clone(),
                config.development,
            )
        });
        if !Arc::ptr_eq(&discovery.client, &client) {
            debug!("Discovery already initialized, reusing existing instance");
        }
        discovery.clone()
    }

    pub(crate) fn new(
        client: Arc<PeerClient>,
        base_port: u16,
        config: DiscoveryConfig,
        development: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            client,
            base_port,
            config,
            development,
            running: AtomicBool::new(false),
            scan_lock: AsyncMutex::new(()),
            active_timers: Arc::new(AtomicUsize::new(0)),
            timer: Mutex::new(None),
            on_discovered: Mutex::new(None),
            on_connection_lost: Mutex::new(None),
            waiters: Mutex::new(Vec::new()),
        })
    }

    pub fn client(&self) -> &Arc<PeerClient> {
        &self.client
    }

    /// Callback run with the port of a newly found editor.
    pub fn set_on_discovered<F, Fut>(&self, callback: F)
    where
        F: Fn(u16) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *lock(&self.on_discovered) = Some(Arc::new(move |port| callback(port).boxed()));
    }

    pub fn set_on_connection_lost<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.on_connection_lost) = Some(Arc::new(callback));
    }

    /// Start polling. A no-op when already running.
    pub fn start(&self) {
        let mut timer = lock(&self.timer);
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Discovery already running");
            return;
        }

        let token = CancellationToken::new();
        *timer = Some(token.clone());
        drop(timer);

        let active = self.active_timers.fetch_add(1, Ordering::SeqCst) + 1;
        if self.development {
            debug!(active_timers = active, "Discovery timer started");
            if active > 1 {
                error!(active_timers = active, "More than one discovery timer is active");
            }
        }
        info!(
            base_port = self.base_port,
            interval_ms = self.config.interval_ms,
            "Starting editor discovery"
        );

        let this = self.this.clone();
        let active_timers = self.active_timers.clone();
        let interval = self.config.interval();
        let development = self.development;
        tokio::spawn(async move {
            let _timer = TimerGuard {
                active_timers,
                development,
            };
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(discovery) = this.upgrade() else {
                            break;
                        };
                        discovery.tick().await;
                    }
                }
            }
        });
    }

    /// Stop polling. A no-op when already stopped.
    pub fn stop(&self) {
        let mut timer = lock(&self.timer);
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = timer.take() {
            token.cancel();
        }
        drop(timer);

        if self.development {
            debug!("Discovery timer stopped");
        }
        info!("Editor discovery stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_lock.try_lock().is_err()
    }

    /// Run one discovery tick now, after any scan already in progress.
    /// Returns whether the client is connected afterwards.
    ///
    /// While discovery is stopped this only checks the existing session; it
    /// never opens a new one.
    pub async fn force_discovery(&self) -> bool {
        debug!("Forcing discovery");
        let scan = self.scan_lock.lock().await;
        self.tick_locked().await;
        drop(scan);
        self.client.is_connected()
    }

    /// Restart polling after a lost session and forward the loss.
    pub fn handle_connection_lost(&self) {
        info!("Editor connection lost, restarting discovery");
        if !self.is_running() {
            self.start();
        }
        self.notify_connection_lost();
    }

    /// Register a one-shot waiter resolved with the port of the next
    /// discovered editor. Dropping the receiver unregisters it.
    pub fn register_waiter(&self) -> oneshot::Receiver<u16> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = lock(&self.waiters);
        waiters.retain(|waiter| !waiter.is_closed());
        waiters.push(tx);
        rx
    }

    /// Forget waiters whose receivers are gone.
    pub fn prune_waiters(&self) {
        lock(&self.waiters).retain(|waiter| !waiter.is_closed());
    }

    pub fn waiter_count(&self) -> usize {
        lock(&self.waiters).len()
    }

    pub fn status(&self) -> DiscoveryStatus {
        DiscoveryStatus {
            running: self.is_running(),
            scanning: self.is_scanning(),
            active_timers: self.active_timers.load(Ordering::SeqCst),
            connected: self.client.is_connected(),
            interval_ms: self.config.interval_ms,
            base_port: self.base_port,
            candidate_ports: self.config.candidate_ports(self.base_port),
        }
    }

    async fn tick(&self) {
        let Ok(_scan) = self.scan_lock.try_lock() else {
            debug!("Discovery scan already in progress, skipping tick");
            return;
        };
        self.tick_locked().await;
    }

    async fn tick_locked(&self) {
        if self.client.is_connected() {
            if self.client.test_connection().await {
                debug!(port = self.client.port(), "Editor connection healthy");
                self.stop();
                return;
            }
            warn!(port = self.client.port(), "Editor connection unhealthy, rescanning");
            self.notify_connection_lost();
        }

        self.scan().await;
    }

    async fn scan(&self) -> Option<u16> {
        for port in self.config.candidate_ports(self.base_port) {
            if !self.is_running() {
                debug!("Discovery stopped, abandoning scan");
                return None;
            }
            if !probe_port(self.client.host(), port, self.config.probe_timeout()).await {
                continue;
            }
            // Stopped while the connect attempt was in flight.
            if !self.is_running() {
                debug!(port, "Discovery stopped, ignoring responsive port");
                return None;
            }

            info!(port, "Editor discovered");
            self.client.update_port(port);

            let callback = lock(&self.on_discovered).clone();
            if let Some(callback) = callback {
                callback(port).await;
            }

            self.resolve_waiters(port);
            return Some(port);
        }
        None
    }

    fn resolve_waiters(&self, port: u16) {
        let waiters: Vec<_> = lock(&self.waiters).drain(..).collect();
        for waiter in waiters {
            let _ = waiter.send(port);
        }
    }

    fn notify_connection_lost(&self) {
        let callback = lock(&self.on_connection_lost).clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Whether something accepts TCP connections on `host:port`.
pub async fn probe_port(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

struct TimerGuard {
    active_timers: Arc<AtomicUsize>,
    development: bool,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        let remaining = self.active_timers.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.development {
            debug!(active_timers = remaining, "Discovery timer exited");
        }
    }
}
