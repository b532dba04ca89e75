//! The envelope protocol shared by the pipe and socket transports.
//!
//! Every envelope carries a top-level `{id, actorId, type, body?}`. The
//! `id` correlates a request with its single response; `actorId` names the
//! target actor. Bodies are type-specific and travel as JSON regardless of
//! transport.

use crate::id::ActorId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Execution mode of an actor relative to its creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    InMemory,
    Forked,
    Remote,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::InMemory => write!(f, "in-memory"),
            Mode::Forked => write!(f, "forked"),
            Mode::Remote => write!(f, "remote"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-memory" => Ok(Mode::InMemory),
            "forked" => Ok(Mode::Forked),
            "remote" => Ok(Mode::Remote),
            other => Err(format!("unknown actor mode: {other}")),
        }
    }
}

/// Protocol unit carried over a bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Correlation ID, unique per sender over the bus lifetime.
    pub id: u64,
    /// Target actor.
    pub actor_id: ActorId,
    #[serde(flatten)]
    pub payload: EnvelopePayload,
}

impl Envelope {
    pub fn new(id: u64, actor_id: ActorId, payload: EnvelopePayload) -> Self {
        Self {
            id,
            actor_id,
            payload,
        }
    }
}

/// Envelope type discriminants and their bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "kebab-case")]
pub enum EnvelopePayload {
    CreateActor(Box<CreateActorBody>),
    ActorMessage(ActorMessageBody),
    ActorResponse(ActorResponseBody),
    ActorTree,
    ActorMetrics,
    DestroyActor,
    ActorDestroyed,
    ActorDestroyedAck,
    ParentPing,
    ParentPong,
}

impl EnvelopePayload {
    /// Wire name of the envelope type, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopePayload::CreateActor(_) => "create-actor",
            EnvelopePayload::ActorMessage(_) => "actor-message",
            EnvelopePayload::ActorResponse(_) => "actor-response",
            EnvelopePayload::ActorTree => "actor-tree",
            EnvelopePayload::ActorMetrics => "actor-metrics",
            EnvelopePayload::DestroyActor => "destroy-actor",
            EnvelopePayload::ActorDestroyed => "actor-destroyed",
            EnvelopePayload::ActorDestroyedAck => "actor-destroyed-ack",
            EnvelopePayload::ParentPing => "parent-ping",
            EnvelopePayload::ParentPong => "parent-pong",
        }
    }
}

/// Bootstrap request sent once to a freshly spawned worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateActorBody {
    pub id: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Registered behaviour name, resolved in the worker's own registry.
    pub definition: String,
    pub definition_format: String,
    pub parent: ParentInfo,
    pub mode: Mode,
    /// Configuration document nested children of this actor resolve
    /// their options against.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Registered resource names to instantiate in the worker.
    #[serde(default)]
    pub resources: Vec<String>,
    /// Registered marshaller names to instantiate in the worker.
    #[serde(default)]
    pub marshallers: Vec<String>,
    pub marshaller_format: String,
    #[serde(default)]
    pub custom_parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_parameters_marshalled_types: Option<HashMap<String, String>>,
    /// Heartbeat interval base, milliseconds.
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default)]
    pub test: bool,
    #[serde(default)]
    pub clusters: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ParentInfo {
    pub id: ActorId,
}

/// Topic-addressed message, optionally expecting one correlated response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorMessageBody {
    pub topic: String,
    /// Marshalled variadic arguments.
    pub message: Vec<Value>,
    /// Marshaller type names parallel to `message`: scalar for a single
    /// argument, array otherwise. Absent when nothing was marshalled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marshalled_type: Option<MarshalledType>,
    pub receive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MarshalledType {
    One(Option<String>),
    Many(Vec<Option<String>>),
}

/// Response correlated to a request by envelope `id`. Exactly one of
/// `response` / `error` is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorResponseBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ActorResponseBody {
    pub fn ok(response: Value) -> Self {
        Self {
            response: Some(response),
            error: None,
        }
    }

    pub fn err(error: WireError) -> Self {
        Self {
            response: None,
            error: Some(error),
        }
    }
}

/// Error as it crosses a process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

/// Kind of OS listening handle travelling out-of-band on the pipe bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandleType {
    TcpListener,
}

/// Placeholder substituted for a listener in an envelope body while the
/// handle itself rides the bus's native transfer facility.
pub fn handle_placeholder(handle_type: HandleType) -> Value {
    let mut map = Map::new();
    map.insert(
        "handleType".to_string(),
        serde_json::to_value(handle_type).unwrap_or(Value::Null),
    );
    Value::Object(map)
}

pub fn as_handle_placeholder(value: &Value) -> Option<HandleType> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    serde_json::from_value(map.get("handleType")?.clone()).ok()
}

/// True when the envelope's body declares an out-of-band handle, so the
/// receiving bus endpoint should attach the next transferred descriptor.
pub fn expects_handle(envelope: &Envelope) -> bool {
    match &envelope.payload {
        EnvelopePayload::ActorMessage(body) => {
            body.message.iter().any(|v| as_handle_placeholder(v).is_some())
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_id() -> ActorId {
        ActorId::generate()
    }

    #[test]
    fn test_message_envelope_wire_shape() {
        let actor_id = sample_id();
        let env = Envelope::new(
            7,
            actor_id,
            EnvelopePayload::ActorMessage(ActorMessageBody {
                topic: "greet".to_string(),
                message: vec![json!("Bob")],
                marshalled_type: None,
                receive: true,
            }),
        );

        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["id"], json!(7));
        assert_eq!(value["actorId"], json!(actor_id.to_string()));
        assert_eq!(value["type"], json!("actor-message"));
        assert_eq!(value["body"]["topic"], json!("greet"));
        assert_eq!(value["body"]["receive"], json!(true));
    }

    #[test]
    fn test_empty_body_envelope_roundtrip() {
        let env = Envelope::new(1, sample_id(), EnvelopePayload::ActorTree);
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], json!("actor-tree"));

        let back: Envelope = serde_json::from_value(value).unwrap();
        assert!(matches!(back.payload, EnvelopePayload::ActorTree));
        assert_eq!(back.id, 1);
    }

    #[test]
    fn test_marshalled_type_scalar_and_array() {
        let scalar: MarshalledType =
            serde_json::from_value(json!("InterProcessReference")).unwrap();
        assert!(matches!(scalar, MarshalledType::One(Some(_))));

        let null: MarshalledType = serde_json::from_value(json!(null)).unwrap();
        assert!(matches!(null, MarshalledType::One(None)));

        let many: MarshalledType =
            serde_json::from_value(json!([null, "PointMarshaller"])).unwrap();
        match many {
            MarshalledType::Many(types) => {
                assert_eq!(types, vec![None, Some("PointMarshaller".to_string())]);
            }
            other => panic!("expected array form, got {other:?}"),
        }
    }

    #[test]
    fn test_response_body_exclusive_fields() {
        let ok = ActorResponseBody::ok(json!(42));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value, json!({"response": 42}));

        let err = ActorResponseBody::err(WireError {
            kind: "timeout".to_string(),
            message: "Response timed out.".to_string(),
        });
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["error"]["kind"], json!("timeout"));
        assert!(value.get("response").is_none());
    }

    #[test]
    fn test_create_actor_roundtrip() {
        let body = CreateActorBody {
            id: sample_id(),
            name: Some("worker".to_string()),
            definition: "greeter".to_string(),
            definition_format: "registered".to_string(),
            parent: ParentInfo { id: sample_id() },
            mode: Mode::Forked,
            config: Map::new(),
            resources: vec!["db".to_string()],
            marshallers: vec![],
            marshaller_format: "registered".to_string(),
            custom_parameters: Map::new(),
            custom_parameters_marshalled_types: None,
            ping_timeout: 15000,
            log_level: Some("info".to_string()),
            test: false,
            clusters: HashMap::new(),
        };
        let env = Envelope::new(1, body.id, EnvelopePayload::CreateActor(Box::new(body)));

        let bytes = serde_json::to_vec(&env).unwrap();
        let back: Envelope = serde_json::from_slice(&bytes).unwrap();
        match back.payload {
            EnvelopePayload::CreateActor(body) => {
                assert_eq!(body.definition, "greeter");
                assert_eq!(body.mode, Mode::Forked);
                assert_eq!(body.resources, vec!["db".to_string()]);
            }
            other => panic!("expected create-actor, got {}", other.kind()),
        }
    }

    #[test]
    fn test_handle_placeholder_detection() {
        let placeholder = handle_placeholder(HandleType::TcpListener);
        assert_eq!(
            as_handle_placeholder(&placeholder),
            Some(HandleType::TcpListener)
        );
        assert_eq!(as_handle_placeholder(&json!({"other": 1})), None);

        let env = Envelope::new(
            2,
            sample_id(),
            EnvelopePayload::ActorMessage(ActorMessageBody {
                topic: "takeListener".to_string(),
                message: vec![placeholder],
                marshalled_type: None,
                receive: false,
            }),
        );
        assert!(expects_handle(&env));
    }

    #[test]
    fn test_mode_strings() {
        assert_eq!("forked".parse::<Mode>().unwrap(), Mode::Forked);
        assert_eq!(Mode::InMemory.to_string(), "in-memory");
        assert!("threaded".parse::<Mode>().is_err());
    }
}
