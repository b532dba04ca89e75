//! Peer proxies: actor handles materialized from marshalled reference
//! tokens, routing envelopes over an existing bus endpoint by actor id.

use super::{ActorKind, ActorRef, ActorState, TreeNode};
use crate::bus::BusConn;
use crate::error::{ActorError, Result};
use crate::marshal::{self, ReferenceToken};
use crate::message::Msg;
use crate::system::SystemShared;
use canopy_protocol::{ActorId, ActorMessageBody, Envelope, EnvelopePayload};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

const INTROSPECTION_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct PeerState {
    pub conn: BusConn,
}

/// Materialize a reference token. A token naming a local actor resolves to
/// the local handle so round-trips behave like local calls.
pub(crate) fn from_token(
    system: &Arc<SystemShared>,
    conn: BusConn,
    token: ReferenceToken,
) -> ActorRef {
    if let Some(local) = system.actor_table.get(&token.id) {
        return local.value().clone();
    }
    let actor = ActorRef::construct_detached(
        system,
        token.id,
        None,
        token.name,
        token.mode,
        Map::new(),
        ActorKind::Peer(PeerState { conn }),
    );
    actor.set_state(ActorState::Ready);
    actor
}

/// Send a topic message over a bus endpoint, marshalling arguments and
/// correlating the response when one is expected.
pub(crate) async fn proxy_send(
    system: &Arc<SystemShared>,
    conn: &BusConn,
    target: ActorId,
    topic: &str,
    args: Vec<Msg>,
    receive: bool,
    timeout: Option<Duration>,
) -> Result<Value> {
    let (message, marshalled_type, listener) = marshal::marshal_args(system, conn, args)?;
    let body = ActorMessageBody {
        topic: topic.to_string(),
        message,
        marshalled_type,
        receive,
    };

    if receive {
        let id = conn.next_id();
        let rx = conn.pending.register(id, timeout);
        let envelope = Envelope::new(id, target, EnvelopePayload::ActorMessage(body));
        let sent = match listener {
            Some(listener) => conn.handle.send_with_listener(&envelope, listener).await,
            None => conn.handle.send(&envelope).await,
        };
        if let Err(err) = sent {
            conn.pending.forget(id);
            return Err(err);
        }
        let reply = rx
            .await
            .map_err(|_| ActorError::Transport("bus closed while awaiting response".to_string()))??;
        parse_response(reply)
    } else {
        let envelope = Envelope::new(conn.next_id(), target, EnvelopePayload::ActorMessage(body));
        match listener {
            Some(listener) => conn.handle.send_with_listener(&envelope, listener).await?,
            None => conn.handle.send(&envelope).await?,
        }
        Ok(Value::Null)
    }
}

/// Extract the value or error from an `actor-response` envelope.
pub(crate) fn parse_response(envelope: Envelope) -> Result<Value> {
    match envelope.payload {
        EnvelopePayload::ActorResponse(body) => {
            if let Some(error) = body.error {
                Err(ActorError::from_wire(error))
            } else {
                Ok(body.response.unwrap_or(Value::Null))
            }
        }
        other => Err(ActorError::Transport(format!(
            "unexpected reply envelope: {}",
            other.kind()
        ))),
    }
}

pub(crate) async fn proxy_tree(conn: &BusConn, target: ActorId) -> Result<TreeNode> {
    let reply = conn
        .request(target, EnvelopePayload::ActorTree, Some(INTROSPECTION_TIMEOUT))
        .await?;
    let value = parse_response(reply)?;
    serde_json::from_value(value)
        .map_err(|err| ActorError::Transport(format!("malformed tree response: {err}")))
}

pub(crate) async fn proxy_metrics(conn: &BusConn, target: ActorId) -> Result<Map<String, Value>> {
    let reply = conn
        .request(target, EnvelopePayload::ActorMetrics, Some(INTROSPECTION_TIMEOUT))
        .await?;
    match parse_response(reply)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(ActorError::Transport(format!(
            "malformed metrics response: {other}"
        ))),
    }
}
