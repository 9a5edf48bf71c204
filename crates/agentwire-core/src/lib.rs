mod agent;
mod client;
mod context;
mod key;
mod openssh;
mod server;

pub use agent::{Agent, SignOptions};
pub use client::ClientEngine;
pub use context::AgentContext;
pub use key::{KeyParser, OpensshKeyParser, ParsedKey};
pub use openssh::OpensshAgent;
pub use server::{IdentityEntry, RequestId, ServerEngine, ServerEvent};

pub use agentwire_proto::{
    ProtoError, SignatureHash, SSH_AGENT_RSA_SHA2_256, SSH_AGENT_RSA_SHA2_512,
};

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("no reply from server")]
    NoReply,
    #[error("unexpected message from server")]
    UnexpectedMessage,
    #[error("wrong message type {0}")]
    WrongMessageType(u8),
    #[error("malformed agent response")]
    MalformedResponse,
    #[error("malformed OpenSSH signature format")]
    MalformedSignature,
    #[error("agent responded with failure")]
    Failure,
    #[error("invalid key data")]
    InvalidKey,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("missing implementation")]
    MissingImplementation,
    #[error("agent connection failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}
