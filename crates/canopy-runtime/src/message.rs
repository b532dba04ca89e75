//! Message payloads.
//!
//! A handler receives its variadic argument list as `Vec<Msg>`, preserving
//! the distinction between plain data, values owned by a registered
//! marshaller, actor references, and transferred OS listening sockets.

use crate::actor::ActorRef;
use crate::error::{ActorError, Result};
use serde_json::Value;
use tokio::net::TcpListener;

/// One message argument.
#[derive(Debug)]
pub enum Msg {
    /// Plain JSON-able data.
    Value(Value),
    /// Data serialized through the marshaller registered for `type_name`.
    Custom { type_name: String, value: Value },
    /// An actor reference; marshalled by the system reference marshallers
    /// when it crosses a process or host boundary.
    Ref(ActorRef),
    /// A bound listening socket, transferred out-of-band (pipe bus only).
    Listener(TcpListener),
}

impl Msg {
    pub fn custom(type_name: impl Into<String>, value: Value) -> Self {
        Msg::Custom {
            type_name: type_name.into(),
            value,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Msg::Value(v) => Some(v),
            Msg::Custom { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn actor(&self) -> Option<&ActorRef> {
        match self {
            Msg::Ref(actor) => Some(actor),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value().and_then(Value::as_i64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value().and_then(Value::as_str)
    }

    pub fn take_listener(self) -> Option<TcpListener> {
        match self {
            Msg::Listener(listener) => Some(listener),
            _ => None,
        }
    }
}

impl From<Value> for Msg {
    fn from(value: Value) -> Self {
        Msg::Value(value)
    }
}

impl From<&str> for Msg {
    fn from(value: &str) -> Self {
        Msg::Value(Value::String(value.to_string()))
    }
}

impl From<String> for Msg {
    fn from(value: String) -> Self {
        Msg::Value(Value::String(value))
    }
}

impl From<i64> for Msg {
    fn from(value: i64) -> Self {
        Msg::Value(Value::from(value))
    }
}

impl From<bool> for Msg {
    fn from(value: bool) -> Self {
        Msg::Value(Value::Bool(value))
    }
}

impl From<ActorRef> for Msg {
    fn from(actor: ActorRef) -> Self {
        Msg::Ref(actor)
    }
}

impl From<TcpListener> for Msg {
    fn from(listener: TcpListener) -> Self {
        Msg::Listener(listener)
    }
}

/// Duplicate an argument list for fan-out. Listening sockets are owned by
/// exactly one receiver and cannot be duplicated.
pub(crate) fn duplicate_args(args: &[Msg]) -> Result<Vec<Msg>> {
    args.iter()
        .map(|arg| match arg {
            Msg::Value(v) => Ok(Msg::Value(v.clone())),
            Msg::Custom { type_name, value } => Ok(Msg::Custom {
                type_name: type_name.clone(),
                value: value.clone(),
            }),
            Msg::Ref(actor) => Ok(Msg::Ref(actor.clone())),
            Msg::Listener(_) => Err(ActorError::Marshal(
                "a listening socket cannot be broadcast to multiple actors".to_string(),
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accessors() {
        let msg = Msg::from(json!({"count": 3}));
        assert_eq!(msg.value().unwrap()["count"], json!(3));
        assert!(msg.actor().is_none());

        assert_eq!(Msg::from(5).as_i64(), Some(5));
        assert_eq!(Msg::from("Bob").as_str(), Some("Bob"));
    }

    #[test]
    fn test_custom_carries_type_name() {
        let msg = Msg::custom("Point", json!({"x": 1, "y": 2}));
        match &msg {
            Msg::Custom { type_name, value } => {
                assert_eq!(type_name, "Point");
                assert_eq!(value["x"], json!(1));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_args_rejects_listeners() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener).unwrap()
        };

        let args = vec![Msg::from(1), Msg::Listener(listener)];
        assert!(duplicate_args(&args).is_err());

        let plain = vec![Msg::from(1), Msg::from("x")];
        assert_eq!(duplicate_args(&plain).unwrap().len(), 2);
    }
}
