//! Forked actors: a worker OS process on the same host, bootstrapped over
//! a Unix-socket pipe bus.
//!
//! The parent binds a one-shot Unix listener, spawns the current
//! executable with the socket path in the environment (the worker entry
//! point picks it up, see [`crate::worker`]), and sends a single
//! `create-actor` envelope. The proxy becomes ready once the worker's
//! correlated acknowledgement arrives.

use super::{ActorKind, ActorRef, ActorState};
use crate::behavior::ActorDefinition;
use crate::bus::{pipe::spawn_pipe_bus, BusConn, BusEvent, BusKind};
use crate::config::ResolvedOptions;
use crate::error::{ActorError, Result};
use crate::inbound::{self, Routed};
use crate::system::SystemShared;
use crate::worker::WORKER_SOCKET_ENV;
use canopy_protocol::{ActorId, CreateActorBody, Envelope, EnvelopePayload, Mode, ParentInfo};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) const CREATE_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DESTROY_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_WAIT: Duration = Duration::from_secs(2);

pub(crate) struct ForkedState {
    pub conn: BusConn,
    child: Mutex<Option<Child>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    socket_path: PathBuf,
}

pub(crate) fn registered_name(definition: &ActorDefinition) -> Result<String> {
    match definition {
        ActorDefinition::Registered(name) => Ok(name.clone()),
        ActorDefinition::Inline(_) => Err(ActorError::Config(
            "clustered, forked and remote actors require a registered behaviour name".to_string(),
        )),
    }
}

pub(crate) async fn create(
    system: Arc<SystemShared>,
    parent: ActorRef,
    definition: ActorDefinition,
    options: &ResolvedOptions,
) -> Result<ActorRef> {
    let definition = registered_name(&definition)?;
    let id = ActorId::generate();
    let parent_id = parent.id();

    let socket_path = worker_socket_path(&id);
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;

    let display_name = if options.name.is_empty() {
        definition.clone()
    } else {
        options.name.clone()
    };
    let child = spawn_worker(&socket_path, &display_name, true)?;

    let (stream, _) = tokio::time::timeout(ACCEPT_TIMEOUT, listener.accept())
        .await
        .map_err(|_| {
            ActorError::Transport(format!("worker \"{display_name}\" never connected"))
        })??;
    drop(listener);
    let _ = std::fs::remove_file(&socket_path);

    let (handle, events) = spawn_pipe_bus(stream);
    let conn = BusConn::new(handle, BusKind::Pipe);

    let actor = ActorRef::construct(
        &system,
        id,
        Some(parent),
        options.name.clone(),
        Mode::Forked,
        options.custom_parameters.clone(),
        ActorKind::Forked(ForkedState {
            conn: conn.clone(),
            child: Mutex::new(Some(child)),
            pump: Mutex::new(None),
            socket_path,
        }),
    );

    let pump = tokio::spawn(run_pump(system.clone(), actor.clone(), conn.clone(), events));
    if let ActorKind::Forked(state) = &actor.inner.kind {
        if let Ok(mut slot) = state.pump.lock() {
            *slot = Some(pump);
        }
    }

    let body = build_create_body(&system, id, &definition, options, Mode::Forked, parent_id);
    let bootstrap = async {
        let reply = conn
            .request(
                id,
                EnvelopePayload::CreateActor(Box::new(body)),
                Some(CREATE_TIMEOUT),
            )
            .await?;
        inbound::parse_create_ack(reply)
    };
    if let Err(err) = bootstrap.await {
        abandon(&system, &actor).await;
        return Err(err);
    }

    actor.set_state(ActorState::Ready);
    Ok(actor)
}

/// Tear down a proxy whose worker never became ready.
async fn abandon(system: &Arc<SystemShared>, actor: &ActorRef) {
    system.actor_table.remove(&actor.id());
    actor.set_state(ActorState::Destroyed);
    if let ActorKind::Forked(state) = &actor.inner.kind {
        if let Some(mut child) = state.child.lock().ok().and_then(|mut slot| slot.take()) {
            let _ = child.kill().await;
        }
        if let Some(pump) = state.pump.lock().ok().and_then(|mut slot| slot.take()) {
            pump.abort();
        }
        let _ = std::fs::remove_file(&state.socket_path);
    }
}

pub(crate) fn worker_socket_path(id: &ActorId) -> PathBuf {
    std::env::temp_dir().join(format!("canopy-worker-{id}.sock"))
}

/// Spawn the current executable as a worker. The single argument is the
/// actor name, purely for `ps` readability; the worker finds its parent
/// through the environment.
pub(crate) fn spawn_worker(
    socket_path: &Path,
    display_name: &str,
    kill_on_drop: bool,
) -> Result<Child> {
    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.arg(display_name)
        .env(WORKER_SOCKET_ENV, socket_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(kill_on_drop);

    let mut child = cmd.spawn()?;
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(log_pipe(stdout, display_name.to_string(), "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_pipe(stderr, display_name.to_string(), "stderr"));
    }
    tracing::debug!(worker = %display_name, "spawned worker process");
    Ok(child)
}

async fn log_pipe<R>(pipe: R, worker: String, channel: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(worker = %worker, channel = channel, "{line}");
    }
}

/// Bootstrap envelope body. `parent_id` names the creating actor;
/// envelopes the worker addresses to it land on this endpoint and
/// dispatch into that actor through the system table.
pub(crate) fn build_create_body(
    system: &Arc<SystemShared>,
    id: ActorId,
    definition: &str,
    options: &ResolvedOptions,
    mode: Mode,
    parent_id: ActorId,
) -> CreateActorBody {
    CreateActorBody {
        id,
        name: if options.name.is_empty() {
            None
        } else {
            Some(options.name.clone())
        },
        definition: definition.to_string(),
        definition_format: "registered".to_string(),
        parent: ParentInfo { id: parent_id },
        mode,
        config: options.config_doc.clone(),
        resources: system.resource_names.clone(),
        marshallers: system.marshaller_names.clone(),
        marshaller_format: "registered".to_string(),
        custom_parameters: options.custom_parameters.clone(),
        custom_parameters_marshalled_types: None,
        ping_timeout: options.ping_timeout.as_millis() as u64,
        log_level: system.log_level.clone(),
        test: system.test_mode,
        clusters: system.clusters.clone(),
    }
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
                        EnvelopePayload::ActorDestroyed => {
                            // Worker shut down on its own; acknowledge and
                            // mark the proxy gone.
                            let ack = Envelope::new(
                                envelope.id,
                                envelope.actor_id,
                                EnvelopePayload::ActorDestroyedAck,
                            );
                            let _ = conn.handle.send(&ack).await;
                            actor.set_state(ActorState::Destroyed);
                        }
                        other => {
                            tracing::debug!(
                                actor = %actor.id(),
                                "forked proxy ignoring {}",
                                other.kind()
                            );
                        }
                    },
                }
            }
            BusEvent::Exit => {
                conn.pending.fail_all("forked worker exited");
                if actor.crash_if_ready() {
                    tracing::warn!(actor = %actor.id(), name = %actor.name(), "forked worker died");
                }
                break;
            }
        }
    }
}

/// Release transport resources during destroy: run the destroy handshake,
/// then reap the worker process.
pub(crate) async fn shutdown(actor: &ActorRef, state: &ForkedState) {
    match state
        .conn
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
                if let Err(err) = state.conn.handle.send(&ack).await {
                    tracing::debug!("destroy ack failed: {err}");
                }
            }
        }
        Err(err) => {
            tracing::warn!(actor = %actor.id(), "worker destroy handshake failed: {err}");
        }
    }

    let child = state.child.lock().ok().and_then(|mut slot| slot.take());
    if let Some(mut child) = child {
        match tokio::time::timeout(EXIT_WAIT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(actor = %actor.id(), "worker exited with {status}");
            }
            _ => {
                tracing::warn!(actor = %actor.id(), "worker did not exit, killing");
                let _ = child.kill().await;
            }
        }
    }

    if let Some(pump) = state.pump.lock().ok().and_then(|mut slot| slot.take()) {
        pump.abort();
    }
    let _ = std::fs::remove_file(&state.socket_path);
}
