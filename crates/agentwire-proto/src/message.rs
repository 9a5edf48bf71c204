use bytes::Bytes;

pub const SSH_AGENT_RSA_SHA2_256: u32 = 2;
pub const SSH_AGENT_RSA_SHA2_512: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Failure = 5,
    RequestIdentities = 11,
    IdentitiesAnswer = 12,
    SignRequest = 13,
    SignResponse = 14,
}

/// Hash selection carried by the RSA-SHA2 flag bits of a sign request.
/// Meaningless for key types other than `ssh-rsa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureHash {
    Sha256,
    Sha512,
}

impl SignatureHash {
    pub fn flag(self) -> u32 {
        match self {
            SignatureHash::Sha256 => SSH_AGENT_RSA_SHA2_256,
            SignatureHash::Sha512 => SSH_AGENT_RSA_SHA2_512,
        }
    }

    /// The 512 bit wins when both are set. Unknown bits are ignored.
    pub fn from_flags(flags: u32) -> Option<Self> {
        if flags & SSH_AGENT_RSA_SHA2_512 != 0 {
            Some(SignatureHash::Sha512)
        } else if flags & SSH_AGENT_RSA_SHA2_256 != 0 {
            Some(SignatureHash::Sha256)
        } else {
            None
        }
    }

    pub fn rsa_signature_format(self) -> &'static str {
        match self {
            SignatureHash::Sha256 => "rsa-sha2-256",
            SignatureHash::Sha512 => "rsa-sha2-512",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub key_blob: Vec<u8>,
    pub comment: String,
}

#[derive(Debug, Clone)]
pub enum AgentRequest {
    RequestIdentities,
    SignRequest {
        key_blob: Vec<u8>,
        data: Vec<u8>,
        flags: u32,
    },
    Unknown {
        message_type: u8,
        payload: Bytes,
    },
}

#[derive(Debug, Clone)]
pub enum AgentResponse {
    Failure,
    IdentitiesAnswer { identities: Vec<Identity> },
    SignResponse { signature_blob: Vec<u8> },
    Unknown { message_type: u8, payload: Bytes },
}
