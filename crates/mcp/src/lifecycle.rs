// Process lifecycle: startup wiring, tool change propagation and shutdown

use crate::error::McpResult;
use crate::protocol::{methods, JsonRpcRequest};
use async_trait::async_trait;
use editor_bridge_core::router::in_notification_handler;
use editor_bridge_core::{
    BridgeConfig, CapabilityManager, ClientIdentity, ConnectionCoordinator, Discovery, PeerClient,
    ToolDescriptor,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where outbound MCP notifications go.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_notification(&self, notification: JsonRpcRequest) -> McpResult<()>;
}

/// Why the process is shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    Signal(&'static str),
    StdinClosed,
    Panic(String),
    Failure(String),
}

impl ShutdownCause {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Signal(_) | Self::StdinClosed => 0,
            Self::Panic(_) | Self::Failure(_) => 1,
        }
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "received {name}"),
            Self::StdinClosed => write!(f, "stdin closed"),
            Self::Panic(message) => write!(f, "panic: {message}"),
            Self::Failure(message) => write!(f, "failure: {message}"),
        }
    }
}

pub struct LifecycleCoordinator {
    this: Weak<LifecycleCoordinator>,
    config: BridgeConfig,
    connection: ConnectionCoordinator,
    capabilities: Arc<CapabilityManager>,
    identity: Arc<ClientIdentity>,
    sink: Mutex<Option<Arc<dyn NotificationSink>>>,
    started: AtomicBool,
    client_initialized: AtomicBool,
    notifying: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<Option<ShutdownCause>>,
}

impl LifecycleCoordinator {
    /// Build the bridge around the process-wide discovery instance.
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        let discovery = Discovery::shared(PeerClient::from_config(&config), &config);
        let client = discovery.client().clone();
        let connection = ConnectionCoordinator::new(client.clone(), discovery);
        let capabilities = Arc::new(CapabilityManager::new(client.clone(), config.development));
        let identity = ClientIdentity::new(client, config.client_name.clone());
        let (shutdown_tx, _) = watch::channel(None);

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            connection,
            capabilities,
            identity,
            sink: Mutex::new(None),
            started: AtomicBool::new(false),
            client_initialized: AtomicBool::new(false),
            notifying: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<PeerClient> {
        self.connection.client()
    }

    pub fn connection(&self) -> &ConnectionCoordinator {
        &self.connection
    }

    pub fn capabilities(&self) -> &Arc<CapabilityManager> {
        &self.capabilities
    }

    pub fn identity(&self) -> &Arc<ClientIdentity> {
        &self.identity
    }

    pub fn set_sink(&self, sink: Arc<dyn NotificationSink>) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Subscribe to editor tool changes and reconnects. Only the first call
    /// has any effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = self.this.clone();
        self.client()
            .on_notification(methods::TOOLS_LIST_CHANGED, move |_params| {
                let Some(lifecycle) = this.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    info!("Editor reported a tool list change");
                    lifecycle.refresh_tools().await;
                });
            });

        let this = self.this.clone();
        self.connection.setup_reconnection_callback(move || {
            let this = this.clone();
            async move {
                if let Some(lifecycle) = this.upgrade() {
                    lifecycle.refresh_tools().await;
                }
            }
        });

        debug!("Lifecycle handlers installed");
    }

    /// Handle the client's `initialize` request.
    ///
    /// Returns the tool list for clients that need it inline, `None` for
    /// clients that will ask after `list_changed`.
    pub async fn handle_initialize(&self, client_name: Option<&str>) -> Option<Vec<ToolDescriptor>> {
        if let Some(name) = client_name {
            self.identity.rename(name).await;
        }
        let synchronous = !self.identity.supports_list_changed();

        if !self.client_initialized.swap(true, Ordering::SeqCst) {
            info!(
                client_name = %self.identity.effective_name(),
                synchronous,
                "Initializing editor connection"
            );

            let this = self.this.clone();
            self.connection.initialize(move || {
                let this = this.clone();
                async move {
                    if let Some(lifecycle) = this.upgrade() {
                        lifecycle.on_connection_established().await;
                    }
                }
            });

            if synchronous {
                self.initialize_synchronously().await;
            }
        }

        synchronous.then(|| self.capabilities.list_tools())
    }

    /// Refresh the tool set and tell the client about it.
    pub async fn refresh_tools(&self) {
        self.capabilities
            .refresh_and_notify(|| self.notify_tools_changed())
            .await;
    }

    /// Send `notifications/tools/list_changed` to the client. Overlapping
    /// calls collapse into one.
    pub async fn notify_tools_changed(&self) {
        if self
            .notifying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Tool change notification already in flight");
            return;
        }

        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match sink {
            Some(sink) => {
                let notification = JsonRpcRequest::notification(methods::TOOLS_LIST_CHANGED, None);
                match sink.send_notification(notification).await {
                    Ok(()) => info!(
                        tool_count = self.capabilities.tool_count(),
                        "Sent tool list change notification"
                    ),
                    Err(e) => warn!(error = %e, "Failed to send tool list change notification"),
                }
            }
            None => debug!("No client attached, skipping tool list change notification"),
        }

        self.notifying.store(false, Ordering::SeqCst);
    }

    /// Tear everything down once. Returns the exit code for the first call
    /// and `None` afterwards.
    pub fn shutdown(&self, cause: ShutdownCause) -> Option<i32> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!(cause = %cause, "Shutdown already in progress");
            return None;
        }

        let code = cause.exit_code();
        info!(cause = %cause, exit_code = code, "Shutting down editor bridge");
        self.connection.disconnect();
        self.shutdown_tx.send_replace(Some(cause));
        Some(code)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolves with the cause of the first shutdown.
    pub async fn wait_for_shutdown(&self) -> ShutdownCause {
        let mut rx = self.shutdown_tx.subscribe();
        let cause = match rx.wait_for(Option::is_some).await {
            Ok(cause) => cause
                .clone()
                .unwrap_or_else(|| ShutdownCause::Failure("shutdown without cause".to_string())),
            Err(_) => ShutdownCause::Failure("shutdown channel closed".to_string()),
        };
        cause
    }

    /// Route SIGINT, SIGTERM and SIGHUP (Ctrl-C elsewhere) into shutdown.
    pub fn install_signal_handlers(&self) {
        let this = self.this.clone();
        tokio::spawn(async move {
            let signal = wait_for_signal().await;
            if let Some(lifecycle) = this.upgrade() {
                lifecycle.shutdown(ShutdownCause::Signal(signal));
            }
        });
    }

    /// Shut down on panics that are not contained by a notification
    /// handler. The previous hook still runs.
    pub fn install_panic_hook(&self) {
        let this = self.this.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if !in_notification_handler() {
                error!(panic = %info, "Unrecoverable panic");
                if let Some(lifecycle) = this.upgrade() {
                    lifecycle.shutdown(ShutdownCause::Panic(info.to_string()));
                }
            }
            previous(info);
        }));
    }

    async fn on_connection_established(&self) {
        self.identity.announce().await;
        self.refresh_tools().await;
    }

    async fn initialize_synchronously(&self) {
        let budget = self.config.timeouts.initialize_wait();
        match self.connection.wait_for_connection(budget).await {
            Ok(()) => {
                self.identity.announce().await;
                self.capabilities.initialize_tools().await;
                info!(
                    tool_count = self.capabilities.tool_count(),
                    "Tools loaded for synchronous client"
                );
            }
            Err(e) => {
                warn!(error = %e, "Editor not reachable during initialize, continuing without tools");
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut hangup) =
        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(terminate), Ok(hangup)) => (terminate, hangup),
            _ => {
                warn!("Failed to install unix signal handlers, listening for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
                return "SIGINT";
            }
        };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "Ctrl-C"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ShutdownCause::Signal("SIGTERM").exit_code(), 0);
        assert_eq!(ShutdownCause::StdinClosed.exit_code(), 0);
        assert_eq!(ShutdownCause::Panic("boom".into()).exit_code(), 1);
        assert_eq!(ShutdownCause::Failure("bad".into()).exit_code(), 1);
        assert_eq!(ShutdownCause::Signal("SIGHUP").to_string(), "received SIGHUP");
    }

    #[tokio::test]
    async fn test_shutdown_runs_once() {
        let lifecycle = LifecycleCoordinator::new(crate::testing::offline_config());

        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.wait_for_shutdown().await })
        };

        assert_eq!(lifecycle.shutdown(ShutdownCause::StdinClosed), Some(0));
        assert_eq!(lifecycle.shutdown(ShutdownCause::Failure("late".into())), None);
        assert!(lifecycle.is_shutting_down());

        let cause = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cause, ShutdownCause::StdinClosed);
        // Late subscribers still see the first cause.
        assert_eq!(lifecycle.wait_for_shutdown().await, ShutdownCause::StdinClosed);
    }
}
