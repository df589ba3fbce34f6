//! Per-client duplex channel between a transport and the controller.
//!
//! A [`Link`] is handed out by the controller when a client connects. The
//! transport splits it into an [`InboundHalf`] (requests towards the
//! controller) and an [`OutboundHalf`] (responses towards the client), one per
//! pump task. Both halves share a close signal: closing either side, any
//! number of times, wakes both pumps exactly once.

use super::protocol::{Request, Response};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of both the request and the response queue.
pub const LINK_CAPACITY: usize = 25;

/// Identifier the controller assigns to each connection.
pub type ConnectionId = u64;

#[derive(Debug)]
pub struct Link {
    id: ConnectionId,
    requests: mpsc::Sender<Request>,
    responses: mpsc::Receiver<Response>,
    close: CancellationToken,
}

impl Link {
    pub(crate) fn new(
        id: ConnectionId,
        requests: mpsc::Sender<Request>,
        responses: mpsc::Receiver<Response>,
        close: CancellationToken,
    ) -> Self {
        Self {
            id,
            requests,
            responses,
            close,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The shared close signal.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    pub fn split(self) -> (InboundHalf, OutboundHalf) {
        (
            InboundHalf {
                id: self.id,
                requests: self.requests,
                close: self.close.clone(),
            },
            OutboundHalf {
                id: self.id,
                responses: self.responses,
                close: self.close,
            },
        )
    }
}

/// Request side, owned by the reader pump.
///
/// Dropping it ends the connection's request stream, which deregisters the
/// connection from the controller.
#[derive(Debug)]
pub struct InboundHalf {
    id: ConnectionId,
    requests: mpsc::Sender<Request>,
    close: CancellationToken,
}

impl InboundHalf {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a request for the controller, waiting while the queue is full.
    ///
    /// Returns `false` once the link is closed or the controller has dropped
    /// the connection.
    pub async fn push(&self, request: Request) -> bool {
        if self.close.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.close.cancelled() => false,
            sent = self.requests.send(request) => sent.is_ok(),
        }
    }

    /// Resolves when the link is closed.
    pub async fn closed(&self) {
        self.close.cancelled().await
    }

    pub fn close(&self) {
        self.close.cancel();
    }
}

/// Response side, owned by the writer pump.
#[derive(Debug)]
pub struct OutboundHalf {
    id: ConnectionId,
    responses: mpsc::Receiver<Response>,
    close: CancellationToken,
}

impl OutboundHalf {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Next response for the client, `None` once the link is closed or the
    /// controller has dropped the connection.
    pub async fn next(&mut self) -> Option<Response> {
        tokio::select! {
            biased;
            _ = self.close.cancelled() => None,
            response = self.responses.recv() => response,
        }
    }

    pub fn close(&self) {
        self.close.cancel();
    }
}
