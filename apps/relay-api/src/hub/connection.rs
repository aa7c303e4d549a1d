//! Per-connection state shared between the transport and the hub.

use relay_common::id::{prefix, prefixed_ulid};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::events::Event;

/// Outcome of a non-blocking enqueue onto a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full; the event was discarded for this connection only.
    Dropped,
    /// The transport already stopped reading.
    Closed,
}

/// One live client stream, as held by the hub.
///
/// Owns the sending half of the bounded outbound queue. Dropping a `Client`
/// (which happens when the registry removes it) closes the queue, so the
/// transport's receiver drains whatever is left and then yields `None`.
#[derive(Debug)]
pub struct Client {
    /// Unique connection identifier (`conn_` prefixed ULID).
    pub id: String,
    pub user_id: String,
    pub workspace_id: String,
    sender: mpsc::Sender<Event>,
    done: CancellationToken,
}

impl Client {
    /// Create a connection with an outbound queue of `buffer` events.
    ///
    /// Returns the hub-side client and the receiving half the transport reads.
    pub fn new(
        workspace_id: impl Into<String>,
        user_id: impl Into<String>,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let client = Self {
            id: prefixed_ulid(prefix::CONNECTION),
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
            sender,
            done: CancellationToken::new(),
        };
        (client, receiver)
    }

    /// A non-owning handle the transport keeps for unregistering and for
    /// observing forced disconnects.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            workspace_id: self.workspace_id.clone(),
            done: self.done.clone(),
        }
    }

    /// Enqueue without waiting. Never blocks on a slow consumer.
    pub fn try_deliver(&self, event: &Event) -> Delivery {
        match self.sender.try_send(event.clone()) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Token the hub cancels to force this connection closed.
    pub(crate) fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }
}

/// Transport-side view of a registered connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: String,
    pub user_id: String,
    pub workspace_id: String,
    done: CancellationToken,
}

impl ClientHandle {
    /// Resolves once the hub has forced this connection closed.
    pub fn disconnected(&self) -> WaitForCancellationFuture<'_> {
        self.done.cancelled()
    }

    pub fn is_disconnected(&self) -> bool {
        self.done.is_cancelled()
    }
}
