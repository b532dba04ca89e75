//! Worker-process bootstrap.
//!
//! A forked or remote actor runs inside a worker: the current executable
//! re-spawned with [`WORKER_SOCKET_ENV`] pointing at the parent's Unix
//! socket. Binaries embedding the runtime call [`init`] first thing in
//! `main`; in a worker process it never returns.
//!
//! The worker receives one `create-actor` envelope, builds a child actor
//! system, constructs the actor in-memory inside itself, acknowledges,
//! and then dispatches envelopes until destroyed or orphaned. Destroying
//! the child system ends the process.

use crate::actor::{in_memory, peer, ActorRef};
use crate::behavior::ActorDefinition;
use crate::bus::{pipe::spawn_pipe_bus, socket::spawn_socket_bus, BusConn, BusEvent, BusKind};
use crate::config::ResolvedOptions;
use crate::error::{ActorError, Result};
use crate::inbound::{self, Routed};
use crate::marshal::ReferenceToken;
use crate::system::{destroy_shared, ActorSystem, SystemShared};
use anyhow::Context;
use canopy_protocol::{
    ActorResponseBody, CreateActorBody, Envelope, EnvelopePayload, Mode,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixStream};
use tokio::sync::mpsc;

pub const WORKER_SOCKET_ENV: &str = "CANOPY_WORKER_SOCKET";

const REMOTE_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Become a worker if this process was spawned as one. Call before any
/// other runtime setup; in a worker process this serves the parent until
/// destroyed and then exits.
pub fn init() {
    let Ok(path) = std::env::var(WORKER_SOCKET_ENV) else {
        return;
    };
    std::env::remove_var(WORKER_SOCKET_ENV);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("canopy worker: cannot build runtime: {err}");
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(async {
        match run(PathBuf::from(path)).await {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("canopy worker failed: {err:#}");
                1
            }
        }
    });
    std::process::exit(code);
}

async fn run(path: PathBuf) -> anyhow::Result<()> {
    let stream = UnixStream::connect(&path)
        .await
        .with_context(|| format!("connecting to parent socket {}", path.display()))?;
    serve_stream(stream).await
}

/// Serve one worker session over an established parent connection. The
/// core of [`init`], public so harnesses can drive the worker dispatcher
/// over an in-process socket pair.
pub async fn serve_stream(stream: UnixStream) -> anyhow::Result<()> {
    let (handle, mut events) = spawn_pipe_bus(stream);
    let conn = BusConn::new(handle, BusKind::Pipe);

    let Some(BusEvent::Message(envelope, _)) = events.recv().await else {
        anyhow::bail!("parent closed before bootstrap");
    };
    let request_id = envelope.id;
    let kind = envelope.payload.kind();
    let EnvelopePayload::CreateActor(body) = envelope.payload else {
        anyhow::bail!("expected create-actor, got {kind}");
    };

    bootstrap(conn, events, request_id, *body).await
}

async fn bootstrap(
    conn: BusConn,
    events: mpsc::Receiver<BusEvent>,
    request_id: u64,
    body: CreateActorBody,
) -> anyhow::Result<()> {
    init_tracing(body.log_level.as_deref());
    tracing::debug!(actor = %body.id, definition = %body.definition, mode = %body.mode, "worker bootstrap");

    if body.definition_format != "registered" {
        let error = ActorError::Config(format!(
            "unsupported definition format \"{}\"",
            body.definition_format
        ));
        let _ = conn
            .respond(request_id, body.id, ActorResponseBody::err(error.to_wire()))
            .await;
        anyhow::bail!("unsupported definition format");
    }

    let system = ActorSystem::for_worker(&body)?;
    let shared = system.shared().clone();

    match body.mode {
        Mode::Remote => {
            // Advertise a message socket, acknowledge through the relaying
            // server, then treat the accepted connection as the parent bus.
            let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
            let port = listener.local_addr()?.port();
            conn.respond(
                request_id,
                body.id,
                ActorResponseBody::ok(json!({"id": body.id.to_string(), "port": port})),
            )
            .await?;
            drop(events);
            drop(conn);

            let (stream, peer_addr) =
                tokio::time::timeout(REMOTE_ACCEPT_TIMEOUT, listener.accept())
                    .await
                    .context("remote parent never connected")??;
            tracing::debug!(peer = %peer_addr, "remote parent connected");
            drop(listener);

            let (handle, events) = spawn_socket_bus(stream);
            let conn = BusConn::new(handle, BusKind::Socket);
            let actor = create_local_actor(&shared, &conn, &body).await?;
            serve(shared, actor, conn, events).await
        }
        _ => {
            let actor = match create_local_actor(&shared, &conn, &body).await {
                Ok(actor) => actor,
                Err(err) => {
                    let _ = conn
                        .respond(request_id, body.id, ActorResponseBody::err(err.to_wire()))
                        .await;
                    return Err(err.into());
                }
            };
            conn.respond(
                request_id,
                body.id,
                ActorResponseBody::ok(json!({"id": body.id.to_string()})),
            )
            .await?;
            serve(shared, actor, conn, events).await
        }
    }
}

/// Construct the actor in-memory inside this worker, parented to a peer
/// proxy that routes back over the given bus.
async fn create_local_actor(
    shared: &Arc<SystemShared>,
    conn: &BusConn,
    body: &CreateActorBody,
) -> Result<ActorRef> {
    let parent = peer::from_token(
        shared,
        conn.clone(),
        ReferenceToken {
            id: body.parent.id,
            name: String::new(),
            mode: Mode::InMemory,
            host: None,
            port: None,
        },
    );

    let options = ResolvedOptions::in_memory(
        body.name.clone().unwrap_or_default(),
        body.custom_parameters.clone(),
    );
    // The actor keeps the id the parent allocated; envelopes on the bus
    // address it by that id.
    in_memory::create(
        shared.clone(),
        body.id,
        Some(parent),
        ActorDefinition::Registered(body.definition.clone()),
        &options,
    )
    .await
}

async fn serve(
    shared: Arc<SystemShared>,
    actor: ActorRef,
    conn: BusConn,
    mut events: mpsc::Receiver<BusEvent>,
) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            BusEvent::Message(envelope, listener) => {
                match inbound::route(&shared, &conn, envelope, listener).await {
                    Routed::Done => {}
                    Routed::Unhandled(envelope) => match envelope.payload {
                        EnvelopePayload::DestroyActor => {
                            if let Err(err) = actor.destroy().await {
                                tracing::warn!("actor destroy failed: {err}");
                            }
                            let reply = Envelope::new(
                                envelope.id,
                                envelope.actor_id,
                                EnvelopePayload::ActorDestroyed,
                            );
                            if conn.handle.send(&reply).await.is_err() {
                                break;
                            }
                        }
                        EnvelopePayload::ActorDestroyedAck => break,
                        other => {
                            tracing::debug!("worker ignoring {}", other.kind());
                        }
                    },
                }
            }
            BusEvent::Exit => {
                tracing::debug!("parent connection lost, shutting down");
                break;
            }
        }
    }

    if let Err(err) = actor.destroy().await {
        tracing::warn!("actor teardown failed: {err}");
    }
    let _ = destroy_shared(&shared).await;
    Ok(())
}

fn init_tracing(log_level: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.unwrap_or("info")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
