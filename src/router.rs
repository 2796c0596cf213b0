//! Inbound message dispatch and outbound send validation.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::Result;
use crate::connection::ConnectionState;
use crate::error::Error;

/// Callback invoked with the decoded payload of a matching message.
pub type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// Routes decoded inbound messages to type-tagged handlers and validates
/// outbound sends against the connection state.
pub struct MessageRouter {
    /// Registered handlers by message-type tag; last registration wins
    handlers: DashMap<String, Handler>,
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::UnboundedSender<String>,
}

impl MessageRouter {
    pub(crate) fn new(
        state: watch::Receiver<ConnectionState>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            handlers: DashMap::new(),
            state,
            outbound,
        }
    }

    /// Register a handler for a message type, replacing any prior handler
    /// for the same type.
    pub fn on<F>(&self, msg_type: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.handlers.insert(msg_type.to_owned(), Arc::new(handler));
    }

    /// Decode a raw frame and invoke the handler registered for its type tag.
    ///
    /// Malformed frames are logged and dropped; this must never panic into
    /// the connection's read loop. Messages without a tag, or with a tag
    /// nobody registered for, are silently dropped.
    pub(crate) fn dispatch(&self, raw: &str) {
        let message: Value = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed inbound message");
                return;
            }
        };

        let Some(tag) = message.get("type").and_then(Value::as_str) else {
            tracing::trace!("dropping inbound message without a type tag");
            return;
        };

        // Clone out of the map so the handler runs without holding the shard lock.
        let handler = self.handlers.get(tag).map(|entry| Arc::clone(entry.value()));

        match handler {
            Some(handler) => handler(message),
            None => tracing::trace!(%tag, "no handler registered for message type"),
        }
    }

    /// Serialize and queue a payload for the open connection.
    ///
    /// Fails with a not-connected error unless the supervisor is in the
    /// `Open` state; the write itself is fire-and-forget.
    pub fn send<T: Serialize>(&self, payload: &T) -> Result<()> {
        if !self.state.borrow().is_open() {
            return Err(Error::not_connected());
        }

        let json = serde_json::to_string(payload)?;
        self.outbound.send(json).map_err(|_| Error::not_connected())
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}
