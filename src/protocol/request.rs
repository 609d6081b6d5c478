//! Correlation of outgoing requests with their responses.

use crate::error::{ProtocolError, Result};
use crate::protocol::connection::ConnectionId;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// Resolves to the inner frame of the matching Response.
///
/// Fails with `RequestCancelled` if the connection goes away first.
#[derive(Debug)]
pub struct PendingResponse {
    id: Uuid,
    rx: oneshot::Receiver<Vec<u8>>,
}

impl PendingResponse {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Non-blocking check, for callers driving everything from `tick`.
    pub fn try_take(&mut self) -> Option<Result<Vec<u8>>> {
        match self.rx.try_recv() {
            Ok(frame) => Some(Ok(frame)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ProtocolError::RequestCancelled)),
        }
    }
}

impl Future for PendingResponse {
    type Output = Result<Vec<u8>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx
            .poll_unpin(cx)
            .map(|result| result.map_err(|_| ProtocolError::RequestCancelled))
    }
}

#[derive(Debug)]
struct Waiter {
    connection: ConnectionId,
    reply: oneshot::Sender<Vec<u8>>,
}

/// Requests sent and not yet answered, keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingRequests {
    waiting: HashMap<Uuid, Waiter>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Allocate a correlation id for a request sent to `connection`.
    pub fn register(&mut self, connection: ConnectionId) -> PendingResponse {
        let id = Uuid::new_v4();
        let (reply, rx) = oneshot::channel();
        self.waiting.insert(id, Waiter { connection, reply });
        PendingResponse { id, rx }
    }

    /// Complete request `id` with the inner frame of a Response from `from`.
    ///
    /// Returns false for unknown ids and for responses arriving on a
    /// connection the request was not sent to.
    pub fn complete(&mut self, id: Uuid, from: ConnectionId, inner: &[u8]) -> bool {
        match self.waiting.get(&id) {
            Some(waiter) if waiter.connection == from => {}
            Some(_) => {
                debug!(request = %id, from = %from, "Response from unexpected connection");
                return false;
            }
            None => {
                debug!(request = %id, "Response for unknown request");
                return false;
            }
        }
        match self.waiting.remove(&id) {
            // The caller may have dropped its PendingResponse; that is not an error.
            Some(waiter) => {
                let _ = waiter.reply.send(inner.to_vec());
                true
            }
            None => false,
        }
    }

    /// Forget one request; its `PendingResponse` resolves as cancelled.
    pub fn cancel(&mut self, id: Uuid) -> bool {
        self.waiting.remove(&id).is_some()
    }

    /// Move outstanding requests to a connection's new id.
    pub fn reassign(&mut self, from: ConnectionId, to: ConnectionId) {
        for waiter in self.waiting.values_mut() {
            if waiter.connection == from {
                waiter.connection = to;
            }
        }
    }

    /// Abandon every request sent to `connection`.
    pub fn cancel_connection(&mut self, connection: ConnectionId) -> usize {
        let before = self.waiting.len();
        self.waiting.retain(|_, waiter| waiter.connection != connection);
        before - self.waiting.len()
    }
}
