// Request/response correlation and notification dispatch

use crate::codec::InboundMessage;
use crate::error::{BridgeError, BridgeResult};
use crate::sync::lock;
use serde_json::Value;
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Callback for a peer notification. Receives the notification's `params`.
pub type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

thread_local! {
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is running a notification handler. Panics
/// raised there are contained by the router and do not escape.
pub fn in_notification_handler() -> bool {
    DISPATCHING.with(Cell::get)
}

struct PendingRequest {
    method: String,
    sent_at: Instant,
    completion: oneshot::Sender<BridgeResult<Value>>,
}

/// Handle for one in-flight request, returned by [`Router::register`].
#[derive(Debug)]
pub struct PendingResponse {
    id: u64,
    method: String,
    receiver: oneshot::Receiver<BridgeResult<Value>>,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Routes decoded frames to waiting callers and notification handlers.
///
/// Every pending entry is completed at most once: whoever removes it from the
/// table (a response, the timeout, or [`Router::fail_all`]) owns completion.
#[derive(Default)]
pub struct Router {
    pending: Mutex<HashMap<u64, PendingRequest>>,
    handlers: Mutex<HashMap<String, NotificationHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a notification handler. Replaces any previous handler for
    /// the same method.
    pub fn on_notification<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        lock(&self.handlers).insert(method.into(), Arc::new(handler));
    }

    /// Remove a notification handler. Returns whether one was registered.
    pub fn off_notification(&self, method: &str) -> bool {
        lock(&self.handlers).remove(method).is_some()
    }

    /// Track a request that is about to be written to the peer.
    pub fn register(&self, id: u64, method: impl Into<String>) -> PendingResponse {
        let method = method.into();
        let (completion, receiver) = oneshot::channel();
        lock(&self.pending).insert(
            id,
            PendingRequest {
                method: method.clone(),
                sent_at: Instant::now(),
                completion,
            },
        );
        PendingResponse {
            id,
            method,
            receiver,
        }
    }

    /// Drop a pending entry without completing it.
    pub fn cancel(&self, id: u64) -> bool {
        lock(&self.pending).remove(&id).is_some()
    }

    /// Wait for the response to `pending`, failing with
    /// [`BridgeError::Timeout`] once `timeout` elapses.
    pub async fn await_response(
        &self,
        pending: PendingResponse,
        timeout: Duration,
    ) -> BridgeResult<Value> {
        let PendingResponse {
            id,
            method,
            mut receiver,
        } = pending;

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::ConnectionClosed),
            Err(_) => {
                if self.cancel(id) {
                    let timeout_ms = timeout.as_millis() as u64;
                    warn!(
                        method = %method,
                        request_id = id,
                        timeout_ms,
                        "Network timeout waiting for peer response"
                    );
                    return Err(BridgeError::Timeout { method, timeout_ms });
                }
                // Whoever claimed the entry completes it, possibly a moment later.
                debug!(request_id = id, "Response claimed the entry at the deadline");
                receiver.await.unwrap_or(Err(BridgeError::ConnectionClosed))
            }
        }
    }

    /// Route one decoded frame.
    pub fn route(&self, message: InboundMessage) {
        match message {
            InboundMessage::Notification { method, params } => {
                self.dispatch_notification(&method, params)
            }
            InboundMessage::Response { id, outcome } => self.complete(id, outcome),
            InboundMessage::Unrecognized(value) => {
                warn!(message = %value, "Dropping message that is neither a response nor a notification");
            }
        }
    }

    /// Fail every pending request with the error produced by `reason`.
    pub fn fail_all(&self, reason: impl Fn() -> BridgeError) -> usize {
        let drained: Vec<(u64, PendingRequest)> = lock(&self.pending).drain().collect();
        let count = drained.len();
        for (id, request) in drained {
            debug!(request_id = id, method = %request.method, "Cancelling pending request");
            let _ = request.completion.send(Err(reason()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        lock(&self.pending).contains_key(&id)
    }

    fn dispatch_notification(&self, method: &str, params: Value) {
        let handler = lock(&self.handlers).get(method).cloned();
        let Some(handler) = handler else {
            debug!(method, "No handler registered for notification");
            return;
        };

        DISPATCHING.with(|flag| flag.set(true));
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(params)));
        DISPATCHING.with(|flag| flag.set(false));
        if outcome.is_err() {
            error!(method, "Notification handler panicked");
        }
    }

    fn complete(&self, id: u64, outcome: Result<Value, Value>) {
        let Some(request) = lock(&self.pending).remove(&id) else {
            warn!(request_id = id, "Received response for unknown request ID");
            return;
        };

        debug!(
            request_id = id,
            method = %request.method,
            elapsed_ms = request.sent_at.elapsed().as_millis() as u64,
            "Response received"
        );

        let result = outcome.map_err(|error| BridgeError::from_error_payload(&error));
        if request.completion.send(result).is_err() {
            debug!(request_id = id, "Caller stopped waiting before the response arrived");
        }
    }
}
