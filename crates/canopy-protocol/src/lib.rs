pub mod codec;
pub mod envelope;
pub mod id;

pub use codec::{encode_frame, read_envelope, write_envelope, CodecError, FrameDecoder, MAX_FRAME_SIZE};
pub use envelope::{
    as_handle_placeholder, expects_handle, handle_placeholder, ActorMessageBody, ActorResponseBody,
    CreateActorBody, Envelope, EnvelopePayload, HandleType, MarshalledType, Mode, ParentInfo,
    WireError,
};
pub use id::{ActorId, CorrelationSource};
