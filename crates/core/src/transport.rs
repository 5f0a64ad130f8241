// TCP client for the editor peer

use crate::codec::{next_request_id, FrameCodec, PeerRequest};
use crate::config::{BridgeConfig, TimeoutConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::router::Router;
use crate::sync::lock;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

/// Peer method names.
pub mod methods {
    pub const PING: &str = "ping";
    pub const GET_TOOL_DETAILS: &str = "get-tool-details";
    pub const SET_CLIENT_NAME: &str = "set-client-name";
}

/// Payload of the liveness probe.
pub const CONNECTION_TEST_MESSAGE: &str = "connection_test";

/// Callback run after a session is established.
pub type ReconnectSubscriber = Arc<dyn Fn() + Send + Sync>;

/// Callback run when an established session is lost.
pub type ConnectionLostHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type FrameWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

struct Session {
    id: u64,
    writer: Arc<tokio::sync::Mutex<FrameWriter>>,
    reader: JoinHandle<()>,
}

struct Inner {
    state: ConnectionState,
    session: Option<Session>,
}

/// Owns at most one session with the editor. Losing a session fails every
/// pending request and escalates to the connection-lost handler once.
pub struct PeerClient {
    this: Weak<PeerClient>,
    host: String,
    port: AtomicU16,
    timeouts: TimeoutConfig,
    router: Arc<Router>,
    inner: Mutex<Inner>,
    next_session_id: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    reconnect_subscribers: Mutex<Vec<ReconnectSubscriber>>,
    connection_lost: Mutex<Option<ConnectionLostHandler>>,
}

impl PeerClient {
    pub fn new(host: impl Into<String>, port: u16, timeouts: TimeoutConfig) -> Arc<Self> {
        let host = host.into();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            host,
            port: AtomicU16::new(port),
            timeouts,
            router: Arc::new(Router::new()),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                session: None,
            }),
            next_session_id: AtomicU64::new(1),
            connect_lock: tokio::sync::Mutex::new(()),
            reconnect_subscribers: Mutex::new(Vec::new()),
            connection_lost: Mutex::new(None),
        })
    }

    pub fn from_config(config: &BridgeConfig) -> Arc<Self> {
        Self::new(
            config.peer.host.clone(),
            config.peer.port,
            config.timeouts.clone(),
        )
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    /// Point the client at a different port. Takes effect on the next connect.
    pub fn update_port(&self, port: u16) {
        let previous = self.port.swap(port, Ordering::SeqCst);
        if previous != port {
            debug!(previous, port, "Peer port updated");
        }
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn is_connected(&self) -> bool {
        let inner = lock(&self.inner);
        inner.state == ConnectionState::Connected && inner.session.is_some()
    }

    pub fn pending_request_count(&self) -> usize {
        self.router.pending_count()
    }

    /// Register a handler for a peer notification. Last registration wins.
    pub fn on_notification<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.router.on_notification(method, handler);
    }

    pub fn off_notification(&self, method: &str) -> bool {
        self.router.off_notification(method)
    }

    /// Add a subscriber that runs after every successful connect, in
    /// registration order.
    pub fn on_reconnect<F>(&self, subscriber: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.reconnect_subscribers).push(Arc::new(subscriber));
    }

    /// Install the single handler for an unexpected session loss.
    pub fn set_connection_lost_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *lock(&self.connection_lost) = Some(Arc::new(handler));
    }

    /// Open a session to the current host and port.
    ///
    /// Returns once the TCP connection is established. Reconnect subscribers
    /// have run by the time this returns.
    pub async fn connect(&self) -> BridgeResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let port = self.port();
        lock(&self.inner).state = ConnectionState::Connecting;
        debug!(host = %self.host, port, "Connecting to editor");

        let connect = TcpStream::connect((self.host.as_str(), port));
        let stream = match tokio::time::timeout(self.timeouts.connect(), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(self.connect_failed(port, source)),
            Err(_) => {
                let source = std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect timed out after {}ms", self.timeouts.connect_ms),
                );
                return Err(self.connect_failed(port, source));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        self.install_session(stream);
        info!(host = %self.host, port, "Connected to editor");

        self.run_reconnect_subscribers();
        Ok(())
    }

    /// Make sure a healthy session exists, probing the current one first.
    pub async fn ensure_connected(&self) -> BridgeResult<()> {
        if self.is_connected() {
            if self.test_connection().await {
                return Ok(());
            }
            warn!(port = self.port(), "Editor connection failed health check, reconnecting");
            self.disconnect();
        }
        self.connect().await
    }

    /// Liveness probe: a `ping` bounded by the health-check timeout.
    pub async fn test_connection(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let params = json!({ "Message": CONNECTION_TEST_MESSAGE });
        match self
            .request(methods::PING, params, self.timeouts.health_check())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Connection test failed");
                false
            }
        }
    }

    /// Tear down the session without treating it as a loss.
    ///
    /// Pending requests fail with "Connection closed". Safe to call when
    /// already disconnected.
    pub fn disconnect(&self) {
        let session = {
            let mut inner = lock(&self.inner);
            inner.state = ConnectionState::Disconnected;
            inner.session.take()
        };

        if let Some(session) = session {
            session.reader.abort();
            info!(session = session.id, "Disconnected from editor");
        }

        let cancelled = self.router.fail_all(|| BridgeError::ConnectionClosed);
        if cancelled > 0 {
            debug!(cancelled, "Cancelled pending requests on disconnect");
        }
    }

    /// Send a request and wait for its response.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> BridgeResult<Value> {
        let (session_id, writer) = {
            let inner = lock(&self.inner);
            match inner.session.as_ref() {
                Some(session) if inner.state == ConnectionState::Connected => {
                    (session.id, session.writer.clone())
                }
                _ => return Err(BridgeError::NotConnected),
            }
        };

        let id = next_request_id();
        let request = PeerRequest::new(id, method, params);
        let pending = self.router.register(id, method);

        let sent = {
            let mut writer = writer.lock().await;
            writer.send(&request).await
        };
        if let Err(e) = sent {
            self.router.cancel(id);
            warn!(method, error = %e, "Failed to write request to editor");
            self.handle_session_lost(session_id, "write failed");
            return Err(BridgeError::Io(e));
        }

        debug!(method, request_id = id, "Request sent");
        self.router.await_response(pending, timeout).await
    }

    pub async fn ping(&self, message: &str) -> BridgeResult<Value> {
        self.request(
            methods::PING,
            json!({ "Message": message }),
            self.timeouts.network(),
        )
        .await
    }

    /// Invoke a peer capability with its arguments passed through verbatim.
    pub async fn execute_tool(&self, name: &str, params: Value) -> BridgeResult<Value> {
        self.request(name, params, self.timeouts.network()).await
    }

    /// Fetch the raw capability descriptor list.
    pub async fn fetch_tool_details(&self, include_development_only: bool) -> BridgeResult<Value> {
        self.request(
            methods::GET_TOOL_DETAILS,
            json!({ "IncludeDevelopmentOnly": include_development_only }),
            self.timeouts.network(),
        )
        .await
    }

    /// Tell the peer which MCP client it is serving. Failures are logged.
    pub async fn set_client_name(&self, name: &str) {
        if !self.is_connected() {
            debug!(client_name = name, "Not connected, client name will be sent on reconnect");
            return;
        }
        match self
            .request(
                methods::SET_CLIENT_NAME,
                json!({ "ClientName": name }),
                self.timeouts.network(),
            )
            .await
        {
            Ok(_) => info!(client_name = name, "Client name sent to editor"),
            Err(e) => warn!(client_name = name, error = %e, "Failed to send client name"),
        }
    }

    fn connect_failed(&self, port: u16, source: std::io::Error) -> BridgeError {
        lock(&self.inner).state = ConnectionState::Disconnected;
        debug!(host = %self.host, port, error = %source, "Editor connection failed");
        BridgeError::ConnectFailed {
            host: self.host.clone(),
            port,
            source,
        }
    }

    fn install_session(&self, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);

        let router = self.router.clone();
        let client = self.this.clone();
        let reader = tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, FrameCodec::new());
            let reason = loop {
                match frames.next().await {
                    Some(Ok(message)) => router.route(message),
                    Some(Err(e)) => {
                        warn!(error = %e, "Editor connection read error");
                        break "read error";
                    }
                    None => break "closed by peer",
                }
            };
            if let Some(client) = client.upgrade() {
                client.handle_session_lost(session_id, reason);
            }
        });

        let mut inner = lock(&self.inner);
        inner.state = ConnectionState::Connected;
        inner.session = Some(Session {
            id: session_id,
            writer: Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                write_half,
                FrameCodec::new(),
            ))),
            reader,
        });
    }

    fn run_reconnect_subscribers(&self) {
        let subscribers = lock(&self.reconnect_subscribers).clone();
        for subscriber in subscribers {
            subscriber();
        }
    }

    // Only the caller that takes the session escalates, so repeated triggers
    // for one session collapse into a single loss.
    fn handle_session_lost(&self, session_id: u64, reason: &str) {
        let session = {
            let mut inner = lock(&self.inner);
            match inner.session.as_ref() {
                Some(session) if session.id == session_id => {
                    inner.state = ConnectionState::Disconnected;
                    inner.session.take()
                }
                _ => None,
            }
        };
        let Some(session) = session else {
            return;
        };

        warn!(session = session.id, reason, "Editor connection lost");
        session.reader.abort();
        let cancelled = self.router.fail_all(|| BridgeError::ConnectionClosed);
        if cancelled > 0 {
            debug!(cancelled, "Cancelled pending requests after connection loss");
        }

        let handler = lock(&self.connection_lost).clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.inner).session.take() {
            session.reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::Notify;

    fn fast_timeouts() -> TimeoutConfig {
        TimeoutConfig {
            network_ms: 1_000,
            health_check_ms: 100,
            connect_ms: 500,
            initialize_wait_ms: 1_000,
        }
    }

    /// Fake editor that answers every request through `respond`.
    async fn spawn_peer<F>(respond: F) -> (u16, Arc<AtomicUsize>)
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let respond = Arc::new(respond);

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let respond = respond.clone();
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let request: Value = serde_json::from_str(&line).unwrap();
                        if let Some(reply) = respond(&request) {
                            let mut bytes = serde_json::to_vec(&reply).unwrap();
                            bytes.push(b'\n');
                            if write_half.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });

        (port, accepted)
    }

    fn echo(request: &Value) -> Option<Value> {
        Some(json!({"jsonrpc": "2.0", "id": request["id"], "result": request["params"]}))
    }

    async fn connected_client(port: u16) -> Arc<PeerClient> {
        let client = PeerClient::new("127.0.0.1", port, fast_timeouts());
        client.connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_connect_and_ping() {
        let (port, _) = spawn_peer(echo).await;
        let client = connected_client(port).await;

        assert_eq!(client.state(), ConnectionState::Connected);
        let reply = client.ping("hello").await.unwrap();
        assert_eq!(reply["Message"], "hello");
        assert_eq!(client.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = PeerClient::new("127.0.0.1", port, fast_timeouts());
        let err = client.connect().await.unwrap_err();

        assert!(matches!(err, BridgeError::ConnectFailed { .. }));
        assert!(err.is_transport());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_request_without_session_is_not_connected() {
        let client = PeerClient::new("127.0.0.1", 1, fast_timeouts());
        let err = client.ping("x").await.unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
    }

    #[tokio::test]
    async fn test_reconnect_subscribers_run_in_order() {
        let (port, _) = spawn_peer(echo).await;
        let client = PeerClient::new("127.0.0.1", port, fast_timeouts());
        let calls = Arc::new(Mutex::new(Vec::new()));

        for name in ["identity", "capabilities"] {
            let calls = calls.clone();
            client.on_reconnect(move || calls.lock().unwrap().push(name));
        }

        client.connect().await.unwrap();
        client.disconnect();
        client.connect().await.unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["identity", "capabilities", "identity", "capabilities"]
        );
    }

    #[tokio::test]
    async fn test_request_timeout_clears_pending_entry() {
        let (port, _) = spawn_peer(|_| None).await;
        let client = connected_client(port).await;

        let started = Instant::now();
        let err = client
            .request("slow", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.to_string().contains("timed out"));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
        assert_eq!(client.pending_request_count(), 0);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_and_escalates_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            // Read one request, then hang up without answering.
            let _ = lines.next_line().await;
        });

        let client = connected_client(port).await;
        let lost = Arc::new(AtomicUsize::new(0));
        let notified = Arc::new(Notify::new());
        {
            let lost = lost.clone();
            let notified = notified.clone();
            client.set_connection_lost_handler(move || {
                lost.fetch_add(1, Ordering::SeqCst);
                notified.notify_one();
            });
        }

        let err = client.ping("pending").await.unwrap_err();
        assert_eq!(err.to_string(), "Connection closed");

        tokio::time::timeout(Duration::from_secs(1), notified.notified())
            .await
            .unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.disconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_without_escalation() {
        let (port, _) = spawn_peer(|_| None).await;
        let client = connected_client(port).await;
        let lost = Arc::new(AtomicUsize::new(0));
        {
            let lost = lost.clone();
            client.set_connection_lost_handler(move || {
                lost.fetch_add(1, Ordering::SeqCst);
            });
        }

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.execute_tool("run-tests", json!({})).await })
        };
        while client.pending_request_count() == 0 {
            tokio::task::yield_now().await;
        }

        client.disconnect();
        client.disconnect();

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Connection closed");
        assert_eq!(lost.load(Ordering::SeqCst), 0);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_security_blocked_error_reaches_caller() {
        let (port, _) = spawn_peer(|request| {
            Some(json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {
                    "message": "blocked",
                    "data": {"type": "security_blocked", "reason": "Test execution is disabled", "command": "run-tests"}
                }
            }))
        })
        .await;
        let client = connected_client(port).await;

        let err = client.execute_tool("run-tests", json!({})).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("Test execution is disabled"));
        assert!(text.contains("(Command: run-tests)"));
        assert!(text.contains("enable the corresponding option"));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_peer_notification_reaches_handler() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"{\"method\":\"notifications/tools/list_changed\",\"params\":{\"reason\":\"compile\"}}\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let client = PeerClient::new("127.0.0.1", port, fast_timeouts());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        client.on_notification("notifications/tools/list_changed", move |params| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(params);
            }
        });
        client.connect().await.unwrap();

        let params = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(params["reason"], "compile");
    }

    #[tokio::test]
    async fn test_ensure_connected_replaces_unhealthy_session() {
        let (port, accepted) = spawn_peer(|_| None).await;
        let client = connected_client(port).await;

        assert!(!client.test_connection().await);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        client.ensure_connected().await.unwrap();

        assert!(client.is_connected());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ensure_connected_keeps_healthy_session() {
        let (port, accepted) = spawn_peer(echo).await;
        let client = connected_client(port).await;

        client.ensure_connected().await.unwrap();
        client.ensure_connected().await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_update_port() {
        let client = PeerClient::new("127.0.0.1", 7400, TimeoutConfig::default());
        client.update_port(7700);
        assert_eq!(client.port(), 7700);
        assert_eq!(client.host(), "127.0.0.1");
    }
}
