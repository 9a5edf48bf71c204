mod codec;
mod framer;
mod message;

pub use codec::{
    decode_request, decode_response, encode_request, encode_request_frame, encode_response,
    encode_response_frame, encode_signature_blob, read_string, read_string_ref,
    split_signature_blob, write_string,
};
pub use framer::{Frame, Framer, MAX_FRAME_LEN};
pub use message::{
    AgentRequest, AgentResponse, Identity, MessageType, SignatureHash, SSH_AGENT_RSA_SHA2_256,
    SSH_AGENT_RSA_SHA2_512,
};

pub type Result<T> = std::result::Result<T, ProtoError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("unexpected end of frame")]
    UnexpectedEof,
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
}
