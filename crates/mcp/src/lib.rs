// MCP (Model Context Protocol) server for the editor bridge
// Exposes the editor's capabilities as tools to agent clients over stdio

pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod server;

pub use error::{McpError, McpResult};
pub use lifecycle::{LifecycleCoordinator, NotificationSink, ShutdownCause};
pub use server::McpServer;

#[cfg(test)]
pub(crate) mod testing {
    use editor_bridge_core::config::{BridgeConfig, DiscoveryConfig, PeerConfig, TimeoutConfig};

    /// Configuration pointing at a port nothing listens on. Unit tests share
    /// the process-wide discovery instance, so they all use this.
    pub fn offline_config() -> BridgeConfig {
        BridgeConfig {
            peer: PeerConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
            },
            discovery: DiscoveryConfig {
                interval_ms: 1_000,
                probe_timeout_ms: 100,
                port_offsets: vec![0],
            },
            timeouts: TimeoutConfig {
                network_ms: 1_000,
                health_check_ms: 200,
                connect_ms: 200,
                initialize_wait_ms: 200,
            },
            development: false,
            client_name: None,
        }
    }
}
