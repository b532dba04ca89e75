//! Remote actors: a worker process on another host, reached through its
//! listening server and a persistent framed TCP connection.
//!
//! Creation goes through a short-lived control connection: the server
//! relays the `create-actor` envelope to a freshly forked worker and
//! forwards the worker's single response (carrying its message-socket
//! port) back. The parent then connects the persistent socket bus.
//!
//! With `on_crash = respawn`, the proxy heartbeats the worker and, after
//! two missed pongs or a transport exit, starts a replacement from the
//! original bootstrap envelope. Sends issued while the replacement comes
//! up wait for it; pending requests fail with transport errors.

use super::forked::{build_create_body, registered_name, CREATE_TIMEOUT, DESTROY_TIMEOUT};
use super::{ActorKind, ActorRef, ActorState};
use crate::behavior::ActorDefinition;
use crate::bus::{socket::spawn_socket_bus, BusConn, BusEvent, BusKind};
use crate::config::ResolvedOptions;
use crate::error::{ActorError, Result};
use crate::inbound::{self, Routed};
use crate::system::SystemShared;
use canopy_protocol::{
    read_envelope, write_envelope, ActorId, CreateActorBody, Envelope, EnvelopePayload, Mode,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const RESPAWN_RETRY_DELAY: Duration = Duration::from_secs(1);

pub(crate) struct RemoteState {
    pub respawn: bool,
    endpoint: (String, u16),
    create_body: Mutex<CreateActorBody>,
    conn_slot: Arc<RwLock<Option<BusConn>>>,
    ping_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_pong: Arc<Mutex<Instant>>,
}

impl RemoteState {
    pub(crate) async fn conn(&self) -> Result<BusConn> {
        self.conn_slot
            .read()
            .await
            .clone()
            .ok_or_else(|| ActorError::not_ready(ActorState::Crashed))
    }
}

fn state_of(actor: &ActorRef) -> Option<&RemoteState> {
    match &actor.inner.kind {
        ActorKind::Remote(state) => Some(state),
        _ => None,
    }
}

pub(crate) async fn create(
    system: Arc<SystemShared>,
    parent: ActorRef,
    definition: ActorDefinition,
    options: &ResolvedOptions,
) -> Result<ActorRef> {
    let definition = registered_name(&definition)?;
    let endpoint = options
        .endpoints
        .first()
        .cloned()
        .ok_or_else(|| ActorError::Config("remote actor requires a host or cluster".to_string()))?;
    let id = ActorId::generate();
    let body = build_create_body(&system, id, &definition, options, Mode::Remote, parent.id());

    let actor = ActorRef::construct(
        &system,
        id,
        Some(parent),
        options.name.clone(),
        Mode::Remote,
        options.custom_parameters.clone(),
        ActorKind::Remote(RemoteState {
            respawn: options.on_crash == super::OnCrash::Respawn,
            endpoint,
            create_body: Mutex::new(body),
            conn_slot: Arc::new(RwLock::new(None)),
            ping_timeout: options.ping_timeout,
            tasks: Mutex::new(Vec::new()),
            last_pong: Arc::new(Mutex::new(Instant::now())),
        }),
    );

    if let Err(err) = attach(&system, &actor).await {
        system.actor_table.remove(&actor.id());
        actor.set_state(ActorState::Destroyed);
        return Err(err);
    }
    actor.set_state(ActorState::Ready);
    Ok(actor)
}

/// Start (or restart) the worker and wire up the persistent connection.
fn attach<'a>(
    system: &'a Arc<SystemShared>,
    actor: &'a ActorRef,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(attach_inner(system, actor))
}

async fn attach_inner(system: &Arc<SystemShared>, actor: &ActorRef) -> Result<()> {
    let state = state_of(actor)
        .ok_or_else(|| ActorError::Config("not a remote actor".to_string()))?;
    let (host, port) = state.endpoint.clone();
    let body = state
        .create_body
        .lock()
        .map_err(|_| ActorError::Config("bootstrap envelope poisoned".to_string()))?
        .clone();

    // Control connection: one create-actor in, one response out.
    let mut control = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|err| ActorError::Transport(format!("cannot reach {host}:{port}: {err}")))?;
    let request = Envelope::new(1, actor.id(), EnvelopePayload::CreateActor(Box::new(body)));
    write_envelope(&mut control, &request).await?;
    let reply = tokio::time::timeout(CREATE_TIMEOUT, read_envelope(&mut control))
        .await
        .map_err(|_| ActorError::Transport("remote create timed out".to_string()))??;
    drop(control);

    let ack = inbound::parse_create_ack(reply)?;
    let worker_port = ack
        .get("port")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| ActorError::Transport("create response lacks a worker port".to_string()))?
        as u16;

    let stream = TcpStream::connect((host.as_str(), worker_port))
        .await
        .map_err(|err| {
            ActorError::Transport(format!("cannot reach worker at {host}:{worker_port}: {err}"))
        })?;
    let (handle, events) = spawn_socket_bus(stream);
    let conn = BusConn::new(handle, BusKind::Socket);
    *state.conn_slot.write().await = Some(conn.clone());

    if let Ok(mut last_pong) = state.last_pong.lock() {
        *last_pong = Instant::now();
    }

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(run_pump(
        system.clone(),
        actor.clone(),
        conn.clone(),
        events,
    )));
    if state.respawn {
        tasks.push(tokio::spawn(run_heartbeat(
            system.clone(),
            actor.clone(),
            conn,
            state.ping_timeout,
            state.last_pong.clone(),
        )));
    }
    if let Ok(mut slot) = state.tasks.lock() {
        slot.append(&mut tasks);
    }
    Ok(())
}

async fn run_pump(
    system: Arc<SystemShared>,
    actor: ActorRef,
    conn: BusConn,
    mut events: mpsc::Receiver<BusEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            BusEvent::Message(envelope, listener) => {
                match inbound::route(&system, &conn, envelope, listener).await {
                    Routed::Done => {}
                    Routed::Unhandled(envelope) => match envelope.payload {
                        EnvelopePayload::ParentPong => {
                            if let Some(state) = state_of(&actor) {
                                if let Ok(mut last_pong) = state.last_pong.lock() {
                                    *last_pong = Instant::now();
                                }
                            }
                        }
                        EnvelopePayload::ActorDestroyed => {
                            let ack = Envelope::new(
                                envelope.id,
                                envelope.actor_id,
                                EnvelopePayload::ActorDestroyedAck,
                            );
                            let _ = conn.handle.send(&ack).await;
                            actor.set_state(ActorState::Destroyed);
                        }
                        other => {
                            tracing::debug!(actor = %actor.id(), "remote proxy ignoring {}", other.kind());
                        }
                    },
                }
            }
            BusEvent::Exit => {
                on_peer_lost(&system, &actor, &conn).await;
                break;
            }
        }
    }
}

async fn run_heartbeat(
    system: Arc<SystemShared>,
    actor: ActorRef,
    conn: BusConn,
    ping_timeout: Duration,
    last_pong: Arc<Mutex<Instant>>,
) {
    let period = (ping_timeout / 2).max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut missed = 0u32;

    loop {
        interval.tick().await;
        if actor.state() != ActorState::Ready {
            break;
        }

        let sent_at = Instant::now();
        if conn.notify(actor.id(), EnvelopePayload::ParentPing).await.is_err() {
            missed += 1;
        } else {
            tokio::time::sleep(ping_timeout / 4).await;
            let answered = last_pong
                .lock()
                .map(|pong| *pong >= sent_at)
                .unwrap_or(false);
            if answered {
                missed = 0;
            } else {
                missed += 1;
            }
        }

        if missed >= 2 {
            tracing::warn!(actor = %actor.id(), name = %actor.name(), "remote worker missed two pings");
            on_peer_lost(&system, &actor, &conn).await;
            break;
        }
    }
}

async fn on_peer_lost(system: &Arc<SystemShared>, actor: &ActorRef, conn: &BusConn) {
    conn.pending.fail_all("remote worker unreachable");

    let Some(state) = state_of(actor) else { return };
    *state.conn_slot.write().await = None;

    // Exactly one observer (pump exit or heartbeat) wins the transition.
    if !actor.crash_if_ready() {
        return;
    }

    if state.respawn {
        tokio::spawn(respawn_loop(system.clone(), actor.clone()));
    } else {
        tracing::warn!(actor = %actor.id(), name = %actor.name(), "remote worker lost");
    }
}

async fn respawn_loop(system: Arc<SystemShared>, actor: ActorRef) {
    loop {
        if matches!(actor.state(), ActorState::Destroying | ActorState::Destroyed) {
            return;
        }
        match attach(&system, &actor).await {
            Ok(()) => {
                tracing::info!(actor = %actor.id(), name = %actor.name(), "remote worker respawned");
                actor.set_state(ActorState::Ready);
                return;
            }
            Err(err) => {
                tracing::warn!(actor = %actor.id(), "respawn attempt failed: {err}");
                tokio::time::sleep(RESPAWN_RETRY_DELAY).await;
            }
        }
    }
}

pub(crate) async fn shutdown(actor: &ActorRef, state: &RemoteState) {
    if let Some(conn) = state.conn_slot.read().await.clone() {
        match conn
            .request(actor.id(), EnvelopePayload::DestroyActor, Some(DESTROY_TIMEOUT))
            .await
        {
            Ok(reply) => {
                if matches!(reply.payload, EnvelopePayload::ActorDestroyed) {
                    let ack = Envelope::new(
                        reply.id,
                        reply.actor_id,
                        EnvelopePayload::ActorDestroyedAck,
                    );
                    let _ = conn.handle.send(&ack).await;
                }
            }
            Err(err) => {
                tracing::warn!(actor = %actor.id(), "remote destroy handshake failed: {err}");
            }
        }
    }

    *state.conn_slot.write().await = None;
    if let Ok(mut tasks) = state.tasks.lock() {
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
