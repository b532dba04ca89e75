//! Marshalling of message payloads across process and host boundaries.
//!
//! Outbound arguments pass through a pipeline: actor references become
//! tokens handled by one of the two system reference marshallers, values
//! with a declared type name go through the marshaller registered for that
//! type, plain values pass through untouched. The envelope records what
//! was done in its `marshalledType` field so the receiver can invert the
//! transformation.
//!
//! Listening sockets bypass the registry entirely: they ride the pipe
//! bus's native handle transfer and appear in the body only as a
//! `{handleType}` placeholder.

use crate::actor::{peer, ActorRef};
use crate::bus::{BusConn, BusKind};
use crate::error::{ActorError, Result};
use crate::message::Msg;
use crate::system::SystemShared;
use canopy_protocol::{
    as_handle_placeholder, handle_placeholder, ActorId, HandleType, MarshalledType, Mode,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;

/// Encoder/decoder pair registered for one or more type names.
pub trait Marshaller: Send + Sync + 'static {
    fn type_names(&self) -> Vec<String>;

    fn marshal(&self, value: &Value) -> Result<Value>;

    fn unmarshal(&self, value: Value) -> Result<Value>;
}

pub(crate) const INTER_PROCESS_REFERENCE: &str = "InterProcessReference";
pub(crate) const INTER_HOST_REFERENCE: &str = "InterHostReference";

/// Serializable pointer to an actor, valid across modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReferenceToken {
    pub id: ActorId,
    pub name: String,
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

type MarshallerFactory = Box<dyn Fn() -> Box<dyn Marshaller> + Send + Sync>;

fn registry() -> &'static DashMap<String, MarshallerFactory> {
    static REGISTRY: OnceLock<DashMap<String, MarshallerFactory>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Register a marshaller factory under a name so worker processes can
/// instantiate it from the names carried in the bootstrap envelope.
pub fn register_marshaller<F>(name: impl Into<String>, factory: F)
where
    F: Fn() -> Box<dyn Marshaller> + Send + Sync + 'static,
{
    registry().insert(name.into(), Box::new(factory));
}

pub(crate) fn resolve_marshaller(name: &str) -> Result<Box<dyn Marshaller>> {
    match registry().get(name) {
        Some(factory) => Ok(factory()),
        None => Err(ActorError::Config(format!(
            "marshaller \"{name}\" is not registered"
        ))),
    }
}

/// Marshal an outbound argument list.
///
/// Returns the wire values, the parallel `marshalledType` record, and the
/// listener to transfer out-of-band (single-listener messages only).
pub(crate) fn marshal_args(
    system: &Arc<SystemShared>,
    conn: &BusConn,
    args: Vec<Msg>,
) -> Result<(Vec<Value>, Option<MarshalledType>, Option<TcpListener>)> {
    if args.len() == 1 && matches!(args[0], Msg::Listener(_)) {
        let mut args = args;
        let listener = args.pop().and_then(Msg::take_listener);
        return Ok((
            vec![handle_placeholder(HandleType::TcpListener)],
            None,
            listener,
        ));
    }

    let mut values = Vec::with_capacity(args.len());
    let mut types: Vec<Option<String>> = Vec::with_capacity(args.len());
    let mut any_marshalled = false;

    for arg in args {
        match arg {
            Msg::Value(value) => {
                values.push(value);
                types.push(None);
            }
            Msg::Custom { type_name, value } => {
                let marshaller = system.marshallers.get(&type_name).ok_or_else(|| {
                    ActorError::Config(format!(
                        "no marshaller registered for type \"{type_name}\""
                    ))
                })?;
                values.push(marshaller.marshal(&value)?);
                types.push(Some(type_name));
                any_marshalled = true;
            }
            Msg::Ref(actor) => {
                let (token, type_name) = reference_token(system, conn, &actor)?;
                values.push(
                    serde_json::to_value(token)
                        .map_err(|err| ActorError::Marshal(err.to_string()))?,
                );
                types.push(Some(type_name.to_string()));
                any_marshalled = true;
            }
            Msg::Listener(_) => {
                return Err(ActorError::Marshal(
                    "a listening socket must be the sole message argument".to_string(),
                ));
            }
        }
    }

    let marshalled_type = if !any_marshalled {
        None
    } else if types.len() == 1 {
        Some(MarshalledType::One(types.pop().unwrap_or(None)))
    } else {
        Some(MarshalledType::Many(types))
    };
    Ok((values, marshalled_type, None))
}

fn reference_token(
    system: &Arc<SystemShared>,
    conn: &BusConn,
    actor: &ActorRef,
) -> Result<(ReferenceToken, &'static str)> {
    match conn.kind {
        BusKind::Pipe => Ok((
            ReferenceToken {
                id: actor.id(),
                name: actor.name().to_string(),
                mode: actor.mode(),
                host: None,
                port: None,
            },
            INTER_PROCESS_REFERENCE,
        )),
        BusKind::Socket => {
            let (host, port) = system.advertised_endpoint().ok_or_else(|| {
                ActorError::Config(
                    "cannot marshal an actor reference across hosts: the system is not listening"
                        .to_string(),
                )
            })?;
            Ok((
                ReferenceToken {
                    id: actor.id(),
                    name: actor.name().to_string(),
                    mode: actor.mode(),
                    host: Some(host),
                    port: Some(port),
                },
                INTER_HOST_REFERENCE,
            ))
        }
    }
}

/// Invert [`marshal_args`] on the receiving endpoint.
pub(crate) async fn unmarshal_args(
    system: &Arc<SystemShared>,
    conn: &BusConn,
    message: Vec<Value>,
    marshalled_type: Option<MarshalledType>,
    listener: Option<TcpListener>,
) -> Result<Vec<Msg>> {
    if let Some(listener) = listener {
        if message.len() == 1 && as_handle_placeholder(&message[0]).is_some() {
            return Ok(vec![Msg::Listener(listener)]);
        }
        tracing::warn!("dropping transferred listener: body carries no handle placeholder");
    }

    let count = message.len();
    let types: Vec<Option<String>> = match marshalled_type {
        None => vec![None; count],
        Some(MarshalledType::One(t)) => {
            let mut v = vec![t];
            v.resize(count, None);
            v
        }
        Some(MarshalledType::Many(mut v)) => {
            v.resize(count, None);
            v
        }
    };

    let mut args = Vec::with_capacity(count);
    for (value, type_name) in message.into_iter().zip(types) {
        let arg = match type_name.as_deref() {
            None => Msg::Value(value),
            Some(INTER_PROCESS_REFERENCE) => {
                let token: ReferenceToken = serde_json::from_value(value)
                    .map_err(|err| ActorError::Marshal(format!("bad reference token: {err}")))?;
                Msg::Ref(peer::from_token(system, conn.clone(), token))
            }
            Some(INTER_HOST_REFERENCE) => {
                let token: ReferenceToken = serde_json::from_value(value)
                    .map_err(|err| ActorError::Marshal(format!("bad reference token: {err}")))?;
                let peer_conn = match (&token.host, token.port) {
                    (Some(host), Some(port)) => system.connect_peer(host, port).await?,
                    _ => {
                        return Err(ActorError::Marshal(
                            "inter-host reference token lacks an endpoint".to_string(),
                        ))
                    }
                };
                Msg::Ref(peer::from_token(system, peer_conn, token))
            }
            Some(custom) => {
                let marshaller = system.marshallers.get(custom).ok_or_else(|| {
                    ActorError::Config(format!("no marshaller registered for type \"{custom}\""))
                })?;
                Msg::Custom {
                    type_name: custom.to_string(),
                    value: marshaller.unmarshal(value)?,
                }
            }
        };
        args.push(arg);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct PointMarshaller;

    impl Marshaller for PointMarshaller {
        fn type_names(&self) -> Vec<String> {
            vec!["Point".to_string()]
        }

        fn marshal(&self, value: &Value) -> Result<Value> {
            // Pack {x, y} as [x, y].
            let x = value["x"].as_i64().ok_or_else(|| {
                ActorError::Marshal("point is missing x".to_string())
            })?;
            let y = value["y"].as_i64().ok_or_else(|| {
                ActorError::Marshal("point is missing y".to_string())
            })?;
            Ok(json!([x, y]))
        }

        fn unmarshal(&self, value: Value) -> Result<Value> {
            let pair = value
                .as_array()
                .filter(|a| a.len() == 2)
                .ok_or_else(|| ActorError::Marshal("expected [x, y]".to_string()))?;
            Ok(json!({"x": pair[0], "y": pair[1]}))
        }
    }

    #[test]
    fn test_custom_marshaller_roundtrip() {
        let m = PointMarshaller;
        let packed = m.marshal(&json!({"x": 3, "y": 4})).unwrap();
        assert_eq!(packed, json!([3, 4]));
        let unpacked = m.unmarshal(packed).unwrap();
        assert_eq!(unpacked, json!({"x": 3, "y": 4}));
    }

    #[test]
    fn test_named_registry() {
        register_marshaller("test-point-marshaller", || Box::new(PointMarshaller));
        let m = resolve_marshaller("test-point-marshaller").unwrap();
        assert_eq!(m.type_names(), vec!["Point".to_string()]);

        assert!(matches!(
            resolve_marshaller("test-unknown-marshaller"),
            Err(ActorError::Config(_))
        ));
    }

    #[test]
    fn test_reference_token_serde() {
        let token = ReferenceToken {
            id: ActorId::generate(),
            name: "worker".to_string(),
            mode: Mode::Forked,
            host: None,
            port: None,
        };
        let value = serde_json::to_value(&token).unwrap();
        assert!(value.get("host").is_none());

        let back: ReferenceToken = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, token.id);
        assert_eq!(back.mode, Mode::Forked);
    }
}
