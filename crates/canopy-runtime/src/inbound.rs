//! Inbound envelope routing shared by every bus endpoint: parent-side
//! proxy pumps, worker dispatchers, the listening server's persistent
//! connections, and cached inter-host peer connections.

use crate::actor::peer::parse_response;
use crate::bus::BusConn;
use crate::error::ActorError;
use crate::marshal;
use crate::system::SystemShared;
use canopy_protocol::{ActorResponseBody, Envelope, EnvelopePayload};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Outcome of [`route`].
pub(crate) enum Routed {
    Done,
    /// Envelope types whose handling depends on the endpoint's role
    /// (bootstrap, destroy handshake, heartbeat bookkeeping).
    Unhandled(Envelope),
}

/// Route one inbound envelope. Message and introspection requests are
/// served from the system actor table; responses complete pending
/// waiters. Handler invocations are spawned so a slow handler cannot
/// stall the endpoint's event pump (which would deadlock re-entrant
/// request cycles between the two sides).
pub(crate) fn route<'a>(
    system: &'a Arc<SystemShared>,
    conn: &'a BusConn,
    envelope: Envelope,
    listener: Option<TcpListener>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Routed> + Send + 'a>> {
    Box::pin(route_inner(system, conn, envelope, listener))
}

async fn route_inner(
    system: &Arc<SystemShared>,
    conn: &BusConn,
    envelope: Envelope,
    listener: Option<TcpListener>,
) -> Routed {
    match &envelope.payload {
        EnvelopePayload::ActorResponse(_) => {
            // A completion miss means the request already timed out; the
            // late response is dropped.
            let _ = conn.pending.complete(envelope.id, envelope);
            Routed::Done
        }
        EnvelopePayload::ActorDestroyed => {
            if conn.pending.complete(envelope.id, envelope.clone()) {
                Routed::Done
            } else {
                Routed::Unhandled(envelope)
            }
        }
        EnvelopePayload::ActorMessage(_) => {
            let system = system.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                handle_actor_message(system, conn, envelope, listener).await;
            });
            Routed::Done
        }
        EnvelopePayload::ActorTree => {
            let system = system.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                let result = match system.actor_table.get(&envelope.actor_id).map(|entry| entry.value().clone()) {
                    Some(actor) => actor.tree().await.and_then(|tree| {
                        serde_json::to_value(tree)
                            .map_err(|err| ActorError::Marshal(err.to_string()))
                    }),
                    None => Err(unknown_actor(&envelope)),
                };
                respond(&conn, &envelope, result).await;
            });
            Routed::Done
        }
        EnvelopePayload::ActorMetrics => {
            let system = system.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                let result = match system.actor_table.get(&envelope.actor_id).map(|entry| entry.value().clone()) {
                    Some(actor) => actor.metrics().await.map(Value::Object),
                    None => Err(unknown_actor(&envelope)),
                };
                respond(&conn, &envelope, result).await;
            });
            Routed::Done
        }
        EnvelopePayload::ParentPing => {
            let reply = Envelope::new(envelope.id, envelope.actor_id, EnvelopePayload::ParentPong);
            if let Err(err) = conn.handle.send(&reply).await {
                tracing::debug!("pong send failed: {err}");
            }
            Routed::Done
        }
        EnvelopePayload::ParentPong
        | EnvelopePayload::CreateActor(_)
        | EnvelopePayload::DestroyActor
        | EnvelopePayload::ActorDestroyedAck => Routed::Unhandled(envelope),
    }
}

fn unknown_actor(envelope: &Envelope) -> ActorError {
    ActorError::Transport(format!("no local actor with id {}", envelope.actor_id))
}

async fn handle_actor_message(
    system: Arc<SystemShared>,
    conn: BusConn,
    envelope: Envelope,
    listener: Option<TcpListener>,
) {
    let EnvelopePayload::ActorMessage(body) = envelope.payload.clone() else {
        return;
    };

    let target = system.actor_table.get(&envelope.actor_id).map(|entry| entry.value().clone());
    let Some(target) = target else {
        if body.receive {
            respond(&conn, &envelope, Err(unknown_actor(&envelope))).await;
        } else {
            tracing::warn!(actor = %envelope.actor_id, topic = %body.topic, "dropping message for unknown actor");
        }
        return;
    };

    let args = match marshal::unmarshal_args(
        &system,
        &conn,
        body.message,
        body.marshalled_type,
        listener,
    )
    .await
    {
        Ok(args) => args,
        Err(err) => {
            if body.receive {
                respond(&conn, &envelope, Err(err)).await;
            } else {
                tracing::warn!(topic = %body.topic, "unmarshalling failed: {err}");
            }
            return;
        }
    };

    if body.receive {
        let result = target.send_and_receive(&body.topic, args).await;
        respond(&conn, &envelope, result).await;
    } else if let Err(err) = target.send(&body.topic, args).await {
        tracing::warn!(actor = %envelope.actor_id, topic = %body.topic, "send failed: {err}");
    }
}

async fn respond(conn: &BusConn, request: &Envelope, result: crate::error::Result<Value>) {
    let body = match result {
        Ok(value) => ActorResponseBody::ok(value),
        Err(err) => ActorResponseBody::err(err.to_wire()),
    };
    if let Err(err) = conn.respond(request.id, request.actor_id, body).await {
        tracing::debug!("response send failed: {err}");
    }
}

/// Validate a create acknowledgement (the correlated `actor-response` to a
/// `create-actor` envelope) and return its body value.
pub(crate) fn parse_create_ack(envelope: Envelope) -> crate::error::Result<Value> {
    parse_response(envelope)
}
