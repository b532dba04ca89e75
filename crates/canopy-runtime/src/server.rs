//! Listening server: remote spawn endpoint and inter-host message
//! routing.
//!
//! Each connection starts with one envelope. A `create-actor` request
//! forks a detached worker, relays the envelope over the worker's pipe,
//! forwards the worker's single response back to the caller and closes
//! the control socket; the worker outlives the connection. Anything else
//! upgrades the connection to a persistent socket bus serving reference
//! traffic addressed to local actors.

use crate::actor::forked::{spawn_worker, worker_socket_path, ACCEPT_TIMEOUT, CREATE_TIMEOUT};
use crate::bus::{socket::spawn_socket_bus, BusConn, BusEvent, BusKind};
use crate::error::{ActorError, Result};
use crate::inbound::{self, Routed};
use crate::system::SystemShared;
use canopy_protocol::{
    read_envelope, write_envelope, ActorResponseBody, Envelope, EnvelopePayload,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Controls the listening server's lifetime. Dropping the handle aborts
/// the accept loop; `shutdown` stops it gracefully.
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            join.await.map_err(|err| {
                ActorError::Transport(format!("server task failed: {err}"))
            })?;
        }
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

pub(crate) async fn bind(
    system: Arc<SystemShared>,
    addr: SocketAddr,
) -> Result<(ServerHandle, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let join = tokio::spawn(run_accept_loop(listener, system, shutdown_rx));
    Ok((
        ServerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        },
        bound,
    ))
}

async fn run_accept_loop(
    listener: TcpListener,
    system: Arc<SystemShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(peer = %addr, "accepted connection");
                    let system = system.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(system, stream).await {
                            tracing::debug!(peer = %addr, "connection ended: {err}");
                        }
                    });
                }
                Err(err) => {
                    tracing::error!("accept error: {err}");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(system: Arc<SystemShared>, mut stream: TcpStream) -> Result<()> {
    let first = read_envelope(&mut stream).await?;

    match &first.payload {
        EnvelopePayload::CreateActor(_) => {
            let response = match relay_to_worker(first.clone()).await {
                Ok(response) => response,
                Err(err) => Envelope::new(
                    first.id,
                    first.actor_id,
                    EnvelopePayload::ActorResponse(ActorResponseBody::err(err.to_wire())),
                ),
            };
            write_envelope(&mut stream, &response).await?;
            // The worker lives on; this control socket does not.
            Ok(())
        }
        _ => {
            // Persistent connection for reference traffic.
            let (handle, mut events) = spawn_socket_bus(stream);
            let conn = BusConn::new(handle, BusKind::Socket);
            if let Routed::Unhandled(envelope) = inbound::route(&system, &conn, first, None).await {
                tracing::debug!("server ignoring {}", envelope.payload.kind());
            }
            while let Some(event) = events.recv().await {
                match event {
                    BusEvent::Message(envelope, listener) => {
                        if let Routed::Unhandled(envelope) =
                            inbound::route(&system, &conn, envelope, listener).await
                        {
                            tracing::debug!("server ignoring {}", envelope.payload.kind());
                        }
                    }
                    BusEvent::Exit => break,
                }
            }
            conn.pending.fail_all("client disconnected");
            Ok(())
        }
    }
}

/// Fork a detached worker, relay the creation envelope, return the
/// worker's single response.
async fn relay_to_worker(envelope: Envelope) -> Result<Envelope> {
    let display_name = match &envelope.payload {
        EnvelopePayload::CreateActor(body) => body
            .name
            .clone()
            .unwrap_or_else(|| body.definition.clone()),
        _ => return Err(ActorError::Transport("expected create-actor".to_string())),
    };

    let socket_path = worker_socket_path(&envelope.actor_id);
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;

    // Detached: the worker must outlive this server connection.
    let child = spawn_worker(&socket_path, &display_name, false)?;

    let (mut pipe, _) = tokio::time::timeout(ACCEPT_TIMEOUT, listener.accept())
        .await
        .map_err(|_| {
            ActorError::Transport(format!("worker \"{display_name}\" never connected"))
        })??;
    drop(listener);
    let _ = std::fs::remove_file(&socket_path);

    write_envelope(&mut pipe, &envelope).await?;
    let response = tokio::time::timeout(CREATE_TIMEOUT, read_envelope(&mut pipe))
        .await
        .map_err(|_| ActorError::Transport("worker bootstrap timed out".to_string()))??;

    drop(pipe);
    drop(child);
    Ok(response)
}

/// First non-internal IPv4 address of this host, via a UDP routing probe
/// (no packets are sent). Falls back to loopback.
pub(crate) fn public_ipv4() -> IpAddr {
    let probed = std::net::UdpSocket::bind(("0.0.0.0", 0)).and_then(|socket| {
        socket.connect(("8.8.8.8", 53))?;
        socket.local_addr()
    });
    match probed {
        Ok(addr) if !addr.ip().is_loopback() => addr.ip(),
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}
