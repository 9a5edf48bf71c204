use bytes::Bytes;

use crate::{AgentError, Result};

/// A public key as the engines see it: algorithm name, optional comment, and
/// the canonical SSH wire blob. Two keys are equal when their blobs are.
#[derive(Debug, Clone)]
pub struct ParsedKey {
    algorithm: String,
    comment: Option<String>,
    blob: Bytes,
}

impl ParsedKey {
    pub fn new(
        algorithm: impl Into<String>,
        blob: impl Into<Bytes>,
        comment: Option<String>,
    ) -> Self {
        Self {
            algorithm: algorithm.into(),
            comment: comment.filter(|c| !c.is_empty()),
            blob: blob.into(),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) {
        let comment = comment.into();
        self.comment = if comment.is_empty() { None } else { Some(comment) };
    }

    /// Canonical SSH public-key wire form.
    pub fn public_blob(&self) -> &[u8] {
        &self.blob
    }

    pub fn is_rsa(&self) -> bool {
        self.algorithm == "ssh-rsa"
    }
}

impl PartialEq for ParsedKey {
    fn eq(&self, other: &Self) -> bool {
        self.blob == other.blob
    }
}

impl Eq for ParsedKey {}

/// Converts raw public-key blobs into [`ParsedKey`] values. The engines never
/// look inside a blob themselves.
pub trait KeyParser: Send + Sync {
    fn parse(&self, blob: &[u8]) -> Result<ParsedKey>;
}

/// [`KeyParser`] backed by the `ssh-key` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpensshKeyParser;

impl KeyParser for OpensshKeyParser {
    fn parse(&self, blob: &[u8]) -> Result<ParsedKey> {
        let key = ssh_key::PublicKey::from_bytes(blob).map_err(|_| AgentError::InvalidKey)?;
        let comment = match key.comment() {
            "" => None,
            comment => Some(comment.to_string()),
        };
        Ok(ParsedKey::new(
            key.algorithm().as_str().to_string(),
            blob.to_vec(),
            comment,
        ))
    }
}
