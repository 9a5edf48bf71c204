use async_trait::async_trait;

use agentwire_proto::SignatureHash;

use crate::{AgentError, ParsedKey, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignOptions {
    /// RSA-SHA2 hash selection. Ignored for key types other than `ssh-rsa`.
    pub hash: Option<SignatureHash>,
}

impl SignOptions {
    pub fn with_hash(hash: SignatureHash) -> Self {
        Self { hash: Some(hash) }
    }
}

/// Anything that can enumerate identities and sign on their behalf: the
/// bundled OpenSSH socket adapter, or a user-supplied in-process agent.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn identities(&self) -> Result<Vec<ParsedKey>> {
        Err(AgentError::MissingImplementation)
    }

    async fn sign(&self, key: &ParsedKey, data: &[u8], options: SignOptions) -> Result<Vec<u8>> {
        let _ = (key, data, options);
        Err(AgentError::MissingImplementation)
    }
}
