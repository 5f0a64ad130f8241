use crate::discovery::Discovery;
use crate::error::{BridgeError, BridgeResult};
use crate::transport::PeerClient;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ConnectionCoordinator {
    client: Arc<PeerClient>,
    discovery: Arc<Discovery>,
    initialized: AtomicBool,
}

impl ConnectionCoordinator {
    pub fn new(client: Arc<PeerClient>, discovery: Arc<Discovery>) -> Self {
        Self {
            client,
            discovery,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &Arc<PeerClient> {
        &self.client
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Wire discovery to the client and start looking for the editor.
    ///
    /// `on_established` runs each time discovery finds the editor and a
    /// session is up. Only the first call has any effect.
    pub fn initialize<F, Fut>(&self, on_established: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("Connection coordinator already initialized");
            return;
        }

        let client = self.client.clone();
        let discovery = Arc::downgrade(&self.discovery);
        let on_established = Arc::new(on_established);
        self.discovery.set_on_discovered(move |port| {
            let client = client.clone();
            let discovery = discovery.clone();
            let on_established = on_established.clone();
            async move {
                let Some(discovery) = discovery.upgrade() else {
                    return;
                };
                if let Err(e) = client.ensure_connected().await {
                    warn!(port, error = %e, "Failed to connect to discovered editor");
                    return;
                }
                // Stopped while the session was being opened.
                if !discovery.is_running() {
                    info!(port, "Discovery stopped during connect, dropping session");
                    client.disconnect();
                    return;
                }
                on_established().await;
                discovery.stop();
            }
        });

        self.discovery.set_on_connection_lost(|| {
            warn!("Editor connection lost, waiting for it to come back");
        });

        let discovery = Arc::downgrade(&self.discovery);
        self.client.set_connection_lost_handler(move || {
            if let Some(discovery) = discovery.upgrade() {
                discovery.handle_connection_lost();
            }
        });

        self.discovery.start();
    }

    /// Run `callback` after every freshly established session. A forced
    /// discovery tick runs first, after the scan that found the editor.
    pub fn setup_reconnection_callback<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let discovery = Arc::downgrade(&self.discovery);
        let callback = Arc::new(callback);
        self.client.on_reconnect(move || {
            let Some(discovery) = discovery.upgrade() else {
                return;
            };
            let callback = callback.clone();
            tokio::spawn(async move {
                discovery.force_discovery().await;
                callback().await;
            });
        });
    }

    /// Wait until a healthy session exists, or fail with
    /// [`BridgeError::ConnectionTimeout`].
    pub async fn wait_for_connection(&self, timeout: Duration) -> BridgeResult<()> {
        if self.client.is_connected() {
            return Ok(());
        }

        self.discovery.start();
        let waiter = self.discovery.register_waiter();
        if self.client.is_connected() {
            return Ok(());
        }

        let client = self.client.clone();
        let wait = async move {
            waiter.await.map_err(|_| BridgeError::ConnectionClosed)?;
            client.ensure_connected().await
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                self.discovery.prune_waiters();
                let timeout_ms = timeout.as_millis() as u64;
                warn!(timeout_ms, "Timed out waiting for editor connection");
                Err(BridgeError::ConnectionTimeout { timeout_ms })
            }
        }
    }

    /// Stop discovery and close the session.
    pub fn disconnect(&self) {
        self.discovery.stop();
        self.client.disconnect();
        info!("Connection coordinator disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscoveryConfig, TimeoutConfig};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpSocket, TcpStream};

    fn timeouts() -> TimeoutConfig {
        TimeoutConfig {
            network_ms: 1_000,
            health_check_ms: 200,
            connect_ms: 500,
            initialize_wait_ms: 1_000,
        }
    }

    fn discovery_config() -> DiscoveryConfig {
        DiscoveryConfig {
            interval_ms: 50,
            probe_timeout_ms: 100,
            port_offsets: vec![0],
        }
    }

    async fn spawn_echo_peer(listener: TcpListener) {
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let request: Value = serde_json::from_str(&line).unwrap();
                        let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": {}});
                        let mut bytes = serde_json::to_vec(&reply).unwrap();
                        bytes.push(b'\n');
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
    }

    fn coordinator(port: u16) -> ConnectionCoordinator {
        let client = PeerClient::new("127.0.0.1", port, timeouts());
        let discovery = Discovery::new(client.clone(), port, discovery_config(), false);
        ConnectionCoordinator::new(client, discovery)
    }

    #[tokio::test]
    async fn test_wait_for_connection_times_out_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let coordinator = coordinator(port);
        let err = coordinator
            .wait_for_connection(Duration::from_millis(150))
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::ConnectionTimeout { timeout_ms: 150 }));
        assert!(err.is_timeout());
        assert_eq!(coordinator.discovery().waiter_count(), 0);
        coordinator.disconnect();
    }

    #[tokio::test]
    async fn test_initialize_connects_and_stops_discovery() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        spawn_echo_peer(listener).await;

        let coordinator = coordinator(port);
        let established = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let established = established.clone();
            coordinator.initialize(move || {
                let established = established.clone();
                async move {
                    established.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        coordinator
            .wait_for_connection(Duration::from_secs(2))
            .await
            .unwrap();
        assert!(coordinator.is_connected());

        for _ in 0..50 {
            if !coordinator.discovery().is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!coordinator.discovery().is_running());
        assert_eq!(established.load(Ordering::SeqCst), 1);

        coordinator.disconnect();
        assert!(!coordinator.is_connected());
    }

    #[tokio::test]
    async fn test_reconnection_callback_runs_after_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        spawn_echo_peer(listener).await;

        let coordinator = coordinator(port);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        coordinator.setup_reconnection_callback(move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
            }
        });

        coordinator.client().connect().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        coordinator.client().disconnect();
        coordinator.client().connect().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        coordinator.disconnect();
    }

    #[tokio::test]
    async fn test_reconnection_callback_follows_discovery_tick() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        spawn_echo_peer(listener).await;

        let coordinator = coordinator(port);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        {
            let discovery = coordinator.discovery().clone();
            coordinator.setup_reconnection_callback(move || {
                let tx = tx.clone();
                let discovery = discovery.clone();
                async move {
                    let _ = tx.send((discovery.is_scanning(), discovery.is_running()));
                }
            });
        }
        coordinator.initialize(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let (scanning, running) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!scanning);
        assert!(!running);
        assert!(coordinator.is_connected());

        coordinator.disconnect();
    }

    /// A listener with a full accept queue: connects to it hang.
    async fn saturated_listener() -> (TcpListener, Vec<TcpStream>, u16) {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut held = Vec::new();
        while held.len() < 16 {
            match tokio::time::timeout(Duration::from_millis(100), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => held.push(stream),
                _ => break,
            }
        }
        (listener, held, addr.port())
    }

    #[tokio::test]
    async fn test_disconnect_during_scan_keeps_session_closed() {
        let (_stalled, _held, base_port) = saturated_listener().await;
        let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_port = peer.local_addr().unwrap().port();
        spawn_echo_peer(peer).await;

        let client = PeerClient::new("127.0.0.1", base_port, timeouts());
        let config = DiscoveryConfig {
            interval_ms: 50,
            probe_timeout_ms: 300,
            port_offsets: vec![0, i32::from(peer_port) - i32::from(base_port)],
        };
        let discovery = Discovery::new(client.clone(), base_port, config, false);
        let coordinator = ConnectionCoordinator::new(client.clone(), discovery);

        let established = Arc::new(AtomicUsize::new(0));
        {
            let established = established.clone();
            coordinator.initialize(move || {
                let established = established.clone();
                async move {
                    established.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        // The first attempt is still hanging on the saturated port.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coordinator.discovery().is_scanning());
        coordinator.disconnect();

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!client.is_connected());
        assert_eq!(client.port(), base_port);
        assert_eq!(established.load(Ordering::SeqCst), 0);
        assert!(!coordinator.discovery().is_running());
    }

    #[tokio::test]
    async fn test_wait_for_connection_when_already_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        spawn_echo_peer(listener).await;

        let coordinator = coordinator(port);
        coordinator.client().connect().await.unwrap();

        coordinator
            .wait_for_connection(Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!coordinator.discovery().is_running());
    }
}
