//! Duplex message channels between parent and child proxies.
//!
//! A bus carries framed envelopes in both directions and emits exactly one
//! `Exit` event when the peer endpoint becomes unreachable. Sends resolve
//! once the transport has accepted the bytes, not when the peer processed
//! them. Two implementations:
//! - [`pipe`]: Unix-socket channel to a worker on the same host, with
//!   native OS-handle transfer (SCM_RIGHTS);
//! - [`socket`]: length-prefixed framing over TCP, no handle transfer.

pub(crate) mod pipe;
pub(crate) mod socket;

use crate::error::{ActorError, Result};
use crate::pending::PendingResponses;
use canopy_protocol::{encode_frame, CorrelationSource, Envelope, EnvelopePayload};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

/// Inbound bus event.
pub(crate) enum BusEvent {
    /// A decoded envelope, with the transferred listener when the body
    /// declared one.
    Message(Envelope, Option<TcpListener>),
    /// The peer endpoint is gone. Emitted exactly once, last.
    Exit,
}

pub(crate) struct Outbound {
    frame: Vec<u8>,
    fd: Option<OwnedFd>,
    ack: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BusKind {
    Pipe,
    Socket,
}

/// Sending half of a bus. Cloneable; writes are serialized by the
/// transport task.
#[derive(Clone)]
pub(crate) struct BusHandle {
    tx: mpsc::Sender<Outbound>,
    kind: BusKind,
}

impl BusHandle {
    fn new(tx: mpsc::Sender<Outbound>, kind: BusKind) -> Self {
        Self { tx, kind }
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let frame = encode_frame(envelope)?;
        self.dispatch(frame, None).await
    }

    /// Send an envelope together with a bound TCP listener. The listener
    /// is owned by the receiver after transfer.
    pub async fn send_with_listener(
        &self,
        envelope: &Envelope,
        listener: TcpListener,
    ) -> Result<()> {
        if self.kind != BusKind::Pipe {
            return Err(ActorError::Transport(
                "OS handle transfer is only supported between processes on the same host"
                    .to_string(),
            ));
        }
        let frame = encode_frame(envelope)?;
        let std_listener = listener.into_std()?;
        self.dispatch(frame, Some(OwnedFd::from(std_listener))).await
    }

    async fn dispatch(&self, frame: Vec<u8>, fd: Option<OwnedFd>) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(Outbound { frame, fd, ack })
            .await
            .map_err(|_| ActorError::Transport("bus is closed".to_string()))?;
        ack_rx
            .await
            .map_err(|_| ActorError::Transport("bus closed before send completed".to_string()))?
    }
}

/// A bus endpoint: sending handle plus the correlation and pending-response
/// state every proxy on this endpoint shares.
#[derive(Clone)]
pub(crate) struct BusConn {
    pub handle: BusHandle,
    pub pending: Arc<PendingResponses>,
    pub corr: Arc<CorrelationSource>,
    pub kind: BusKind,
}

impl BusConn {
    pub fn new(handle: BusHandle, kind: BusKind) -> Self {
        Self {
            handle,
            pending: PendingResponses::new(),
            corr: Arc::new(CorrelationSource::new()),
            kind,
        }
    }

    pub fn next_id(&self) -> u64 {
        self.corr.next()
    }

    /// Send a request envelope and await its correlated reply.
    pub async fn request(
        &self,
        actor_id: canopy_protocol::ActorId,
        payload: EnvelopePayload,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        let id = self.next_id();
        let rx = self.pending.register(id, timeout);
        let envelope = Envelope::new(id, actor_id, payload);
        if let Err(err) = self.handle.send(&envelope).await {
            self.pending.forget(id);
            return Err(err);
        }
        rx.await
            .map_err(|_| ActorError::Transport("bus closed while awaiting response".to_string()))?
    }

    /// Send a fire-and-forget envelope.
    pub async fn notify(
        &self,
        actor_id: canopy_protocol::ActorId,
        payload: EnvelopePayload,
    ) -> Result<()> {
        let envelope = Envelope::new(self.next_id(), actor_id, payload);
        self.handle.send(&envelope).await
    }

    /// Reply to a request envelope, reusing its correlation id.
    pub async fn respond(
        &self,
        request_id: u64,
        actor_id: canopy_protocol::ActorId,
        body: canopy_protocol::ActorResponseBody,
    ) -> Result<()> {
        let envelope = Envelope::new(request_id, actor_id, EnvelopePayload::ActorResponse(body));
        self.handle.send(&envelope).await
    }
}

/// Reconstruct a listening socket from a transferred descriptor.
fn listener_from_fd(fd: OwnedFd) -> Option<TcpListener> {
    let std_listener = std::net::TcpListener::from(fd);
    if let Err(err) = std_listener.set_nonblocking(true) {
        tracing::warn!("transferred listener rejected: {err}");
        return None;
    }
    match TcpListener::from_std(std_listener) {
        Ok(listener) => Some(listener),
        Err(err) => {
            tracing::warn!("transferred listener rejected: {err}");
            None
        }
    }
}
