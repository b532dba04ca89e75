use crate::actor::ActorState;
use canopy_protocol::WireError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ActorError {
    #[error("{}", .state.not_ready_message())]
    NotReady { state: ActorState },

    #[error("No handler for message: topic \"{0}\"")]
    NoHandler(String),

    #[error("{0}")]
    Handler(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("Response timed out.")]
    Timeout,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("marshalling error: {0}")]
    Marshal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] canopy_protocol::CodecError),
}

pub type Result<T> = std::result::Result<T, ActorError>;

impl ActorError {
    pub fn not_ready(state: ActorState) -> Self {
        ActorError::NotReady { state }
    }

    /// Encode for an `actor-response` error body.
    pub fn to_wire(&self) -> WireError {
        let kind = match self {
            ActorError::NotReady { .. } => "not-ready",
            ActorError::NoHandler(_) => "no-handler",
            ActorError::Handler(_) => "handler",
            ActorError::Transport(_) => "transport",
            ActorError::Timeout => "timeout",
            ActorError::Config(_) => "config",
            ActorError::Marshal(_) => "marshal",
            ActorError::Io(_) | ActorError::Codec(_) => "transport",
        };
        WireError {
            kind: kind.to_string(),
            message: self.to_string(),
        }
    }

    /// Decode a peer's error body, preserving the kind where it matters
    /// to callers (timeouts, missing handlers).
    pub fn from_wire(error: WireError) -> Self {
        match error.kind.as_str() {
            "timeout" => ActorError::Timeout,
            "no-handler" => {
                // The topic is already embedded in the message text.
                ActorError::Handler(error.message)
            }
            "transport" => ActorError::Transport(error.message),
            "config" => ActorError::Config(error.message),
            "marshal" => ActorError::Marshal(error.message),
            _ => ActorError::Handler(error.message),
        }
    }
}
