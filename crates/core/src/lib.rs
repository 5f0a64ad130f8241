// Core of the editor bridge: peer discovery, the TCP session, request
// correlation and the editor's capability list.

pub mod capabilities;
pub mod codec;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod router;
pub mod transport;

mod sync;

pub use capabilities::{CapabilityManager, ParamType, ToolDescriptor};
pub use config::BridgeConfig;
pub use connection::ConnectionCoordinator;
pub use discovery::Discovery;
pub use error::{BridgeError, BridgeResult};
pub use identity::ClientIdentity;
pub use transport::{ConnectionState, PeerClient};
