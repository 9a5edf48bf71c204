use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use ssh_key::PrivateKey;
use tracing::warn;

use agentwire_core::{IdentityEntry, ParsedKey, SignatureHash};

/// In-memory set of unencrypted OpenSSH private keys, indexed by public
/// blob.
pub struct KeyVault {
    entries: HashMap<Vec<u8>, KeyEntry>,
}

struct KeyEntry {
    private_key: PrivateKey,
    comment: String,
}

impl KeyVault {
    pub fn load(paths: &[PathBuf]) -> anyhow::Result<Self> {
        let mut entries = HashMap::with_capacity(paths.len());
        for path in paths {
            let private_key = match PrivateKey::read_openssh_file(path) {
                Ok(key) => key,
                Err(err) => {
                    warn!(?err, path = %path.display(), "skipping unreadable key file");
                    continue;
                }
            };
            if private_key.is_encrypted() {
                warn!(path = %path.display(), "skipping encrypted key file");
                continue;
            }

            let public_key = private_key.public_key();
            let key_blob = public_key
                .to_bytes()
                .with_context(|| format!("encode public key from {}", path.display()))?;

            let comment = match public_key.comment() {
                "" => path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or("unknown")
                    .to_string(),
                comment => comment.to_string(),
            };

            entries.insert(key_blob, KeyEntry { private_key, comment });
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn identities(&self) -> Vec<IdentityEntry> {
        self.entries
            .iter()
            .map(|(blob, entry)| IdentityEntry::Raw {
                blob: blob.clone(),
                comment: Some(entry.comment.clone()),
            })
            .collect()
    }

    /// Raw signature bytes for the engine to wrap with the signature-format
    /// label it derived from the request flags.
    pub fn sign(
        &self,
        key: &ParsedKey,
        data: &[u8],
        hash: Option<SignatureHash>,
    ) -> anyhow::Result<Vec<u8>> {
        let entry = self
            .entries
            .get(key.public_blob())
            .ok_or_else(|| anyhow!("key not held by this agent"))?;

        if let Some(keypair) = entry.private_key.key_data().rsa() {
            return sign_rsa(keypair, data, hash);
        }

        use signature::Signer;
        let signature = entry
            .private_key
            .try_sign(data)
            .map_err(|err| anyhow!("signing failed: {err}"))?;
        Ok(signature.as_bytes().to_vec())
    }
}

fn sign_rsa(
    keypair: &ssh_key::private::RsaKeypair,
    data: &[u8],
    hash: Option<SignatureHash>,
) -> anyhow::Result<Vec<u8>> {
    use rsa::pkcs1v15::SigningKey;
    use sha1::Sha1;
    use sha2::{Sha256, Sha512};
    use signature::{SignatureEncoding, Signer};

    let signature = match hash {
        Some(SignatureHash::Sha512) => {
            let signing_key = SigningKey::<Sha512>::try_from(keypair)
                .map_err(|_| anyhow!("rsa signing key"))?;
            signing_key
                .try_sign(data)
                .map_err(|_| anyhow!("rsa sha512 sign"))?
                .to_vec()
        }
        Some(SignatureHash::Sha256) => {
            let signing_key = SigningKey::<Sha256>::try_from(keypair)
                .map_err(|_| anyhow!("rsa signing key"))?;
            signing_key
                .try_sign(data)
                .map_err(|_| anyhow!("rsa sha256 sign"))?
                .to_vec()
        }
        None => {
            let signing_key = SigningKey::<Sha1>::try_from(keypair)
                .map_err(|_| anyhow!("rsa signing key"))?;
            signing_key
                .try_sign(data)
                .map_err(|_| anyhow!("rsa sha1 sign"))?
                .to_vec()
        }
    };
    Ok(signature)
}
