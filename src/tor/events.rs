//! Asynchronous event demultiplexer
//!
//! Routes 650 replies to one handler per event keyword (`CIRC`, `HS_DESC`,
//! ...). Each matched reply runs its handler on its own task. Handlers are
//! fire-and-forget: their outcome is not observable from here, so a handler
//! that needs to report back should carry its own channel. Replies with no
//! registered handler are dropped.

use super::reply::Reply;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Callback for one asynchronous event type
pub type EventHandler = Arc<dyn Fn(Reply) + Send + Sync>;

/// Event keyword to handler table
#[derive(Clone, Default)]
pub struct Demux {
    handlers: HashMap<String, EventHandler>,
}

impl Demux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`, returning the handler it replaces
    ///
    /// # Panics
    ///
    /// Panics if `event` is empty. Registration happens at setup time, so an
    /// empty name is a programming error rather than a runtime condition.
    pub fn handle(&mut self, event: &str, handler: EventHandler) -> Option<EventHandler> {
        assert!(!event.is_empty(), "control: empty event name");
        self.handlers.insert(event.to_string(), handler)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch replies from a connection's event channel until it closes
    ///
    /// Must be running whenever the connection can receive asynchronous
    /// replies; see [`super::control::ControlConnection`].
    pub async fn serve(self, mut events: mpsc::Receiver<Reply>) {
        while let Some(reply) = events.recv().await {
            let Some(handler) = self.handlers.get(reply.event_name()) else {
                trace!("Unhandled event: {}", reply.text);
                continue;
            };
            let handler = Arc::clone(handler);
            tokio::spawn(async move { handler(reply) });
        }
    }
}
