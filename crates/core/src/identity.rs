use crate::sync::{read, write};
use crate::transport::PeerClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, info};

/// Clients that ignore `notifications/tools/list_changed`. Matched as
/// case-insensitive substrings of the client name.
pub const LIST_CHANGED_UNSUPPORTED_CLIENTS: &[&str] = &["claude", "claude-code", "gemini", "codeium"];

/// Name reported when neither the client nor the environment provides one.
pub const DEFAULT_CLIENT_NAME: &str = "MCP Client";

pub struct ClientIdentity {
    this: Weak<ClientIdentity>,
    client: Arc<PeerClient>,
    name: RwLock<Option<String>>,
    fallback: Option<String>,
    replay_registered: AtomicBool,
}

impl ClientIdentity {
    /// `fallback` is used until the client names itself.
    pub fn new(client: Arc<PeerClient>, fallback: Option<String>) -> Arc<Self> {
        let fallback = fallback.filter(|name| !name.trim().is_empty());
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            client,
            name: RwLock::new(None),
            fallback,
            replay_registered: AtomicBool::new(false),
        })
    }

    /// Record the name from `initialize.clientInfo.name`. Blank names are
    /// ignored. Returns whether the stored name changed.
    pub fn set_name(&self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        let mut current = write(&self.name);
        if current.as_deref() == Some(name) {
            return false;
        }
        info!(client_name = name, "Client name received");
        *current = Some(name.to_string());
        true
    }

    /// Record a new name and, once the editor has been told a name, send
    /// the new one straight away.
    pub async fn rename(&self, name: &str) {
        if self.set_name(name) && self.replay_registered.load(Ordering::SeqCst) {
            let name = self.effective_name();
            debug!(client_name = %name, "Client name changed, updating editor");
            self.client.set_client_name(&name).await;
        }
    }

    /// The client's own name, else the fallback.
    pub fn name(&self) -> Option<String> {
        read(&self.name).clone().or_else(|| self.fallback.clone())
    }

    /// The name sent to the editor.
    pub fn effective_name(&self) -> String {
        self.name()
            .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string())
    }

    pub fn supports_list_changed(&self) -> bool {
        match self.name() {
            Some(name) => supports_list_changed(&name),
            None => true,
        }
    }

    /// Send the name to the editor and make sure it is replayed after every
    /// reconnect. Only the first call sends; later sessions get the name
    /// from the replay subscriber.
    pub async fn announce(&self) {
        if !self.register_reconnect_replay() {
            debug!("Client already announced, reconnects replay the name");
            return;
        }
        let name = self.effective_name();
        info!(
            client_name = %name,
            list_changed = self.supports_list_changed(),
            "Announcing client to editor"
        );
        self.client.set_client_name(&name).await;
    }

    /// Register the reconnect subscriber that replays the name. Only the
    /// first call registers; returns whether this call did.
    pub fn register_reconnect_replay(&self) -> bool {
        if self.replay_registered.swap(true, Ordering::SeqCst) {
            return false;
        }
        let identity = self.this.clone();
        self.client.on_reconnect(move || {
            let Some(identity) = identity.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                let name = identity.effective_name();
                debug!(client_name = %name, "Reconnected, resending client name");
                identity.client.set_client_name(&name).await;
            });
        });
        true
    }
}

/// Whether a client with this name handles `list_changed` notifications.
pub fn supports_list_changed(client_name: &str) -> bool {
    let normalized = client_name.to_lowercase();
    !LIST_CHANGED_UNSUPPORTED_CLIENTS
        .iter()
        .any(|unsupported| normalized.contains(unsupported))
}
