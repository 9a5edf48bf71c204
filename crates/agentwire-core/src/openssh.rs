use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::debug;

use crate::{Agent, AgentError, ClientEngine, KeyParser, OpensshKeyParser, ParsedKey, Result,
    SignOptions};

#[cfg(unix)]
use tokio::net::UnixStream as AgentStream;
#[cfg(windows)]
use tokio::net::windows::named_pipe::NamedPipeClient as AgentStream;

/// Talks to an OpenSSH-compatible agent over a local stream socket (or named
/// pipe). Every request opens a fresh connection, drives a fresh client-mode
/// engine, and drops the stream once the single reply has resolved.
pub struct OpensshAgent {
    path: PathBuf,
    parser: Arc<dyn KeyParser>,
}

impl OpensshAgent {
    /// Adapter for the socket at `path` (typically the owner's reading of
    /// `SSH_AUTH_SOCK`).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_parser(path, Arc::new(OpensshKeyParser))
    }

    pub fn with_parser(path: impl Into<PathBuf>, parser: Arc<dyn KeyParser>) -> Self {
        Self { path: path.into(), parser }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn round_trip<T>(
        &self,
        issue: impl FnOnce(&mut ClientEngine) -> oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        let mut stream = connect(&self.path).await?;
        let mut engine = ClientEngine::new(self.parser.clone());
        let mut rx = issue(&mut engine);

        while let Some(frame) = engine.next_outbound() {
            if let Err(err) = stream.write_all(&frame).await {
                debug!(?err, "agent write failed");
                engine.fail_pending();
                return Err(AgentError::NoReply);
            }
        }

        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match rx.try_recv() {
                Ok(result) => return result,
                Err(oneshot::error::TryRecvError::Closed) => return Err(AgentError::NoReply),
                Err(oneshot::error::TryRecvError::Empty) => {}
            }

            buf.clear();
            let n = match stream.read_buf(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    debug!(?err, "agent read failed");
                    engine.fail_pending();
                    return Err(AgentError::NoReply);
                }
            };
            if n == 0 {
                engine.fail_pending();
                return Err(AgentError::NoReply);
            }
            if let Err(err) = engine.ingest(&buf) {
                // The head already carries the specific decode error.
                if let Ok(result) = rx.try_recv() {
                    return result;
                }
                engine.fail_pending();
                return Err(err);
            }
        }
    }
}

#[async_trait]
impl Agent for OpensshAgent {
    async fn identities(&self) -> Result<Vec<ParsedKey>> {
        self.round_trip(ClientEngine::request_identities).await
    }

    async fn sign(&self, key: &ParsedKey, data: &[u8], options: SignOptions) -> Result<Vec<u8>> {
        self.round_trip(|engine| engine.sign(key, data, options)).await
    }
}

#[cfg(unix)]
async fn connect(path: &Path) -> Result<AgentStream> {
    AgentStream::connect(path)
        .await
        .map_err(|err| AgentError::Connect(err.to_string()))
}

#[cfg(windows)]
async fn connect(path: &Path) -> Result<AgentStream> {
    use tokio::net::windows::named_pipe::ClientOptions;
    ClientOptions::new()
        .open(path.to_string_lossy().as_ref())
        .map_err(|err| AgentError::Connect(err.to_string()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use agentwire_proto::{encode_response_frame, AgentResponse, Identity};
    use tokio::net::UnixListener;

    fn ed25519_blob() -> Vec<u8> {
        ssh_key::PublicKey::from_openssh(
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICG6kjK0iJxESpkwvCTOwwcUsJcggrGhSdHyaP0JHGub",
        )
        .expect("public key")
        .to_bytes()
        .expect("key blob")
    }

    fn socket_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("agentwire-test-{name}-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn fetches_identities_over_socket() {
        let path = socket_path("identities");
        let listener = UnixListener::bind(&path).unwrap();

        let blob = ed25519_blob();
        let reply_blob = blob.clone();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 5];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request, [0, 0, 0, 1, 11]);

            let reply = encode_response_frame(&AgentResponse::IdentitiesAnswer {
                identities: vec![Identity { key_blob: reply_blob, comment: "work".into() }],
            });
            // Dribble the reply to exercise partial-read buffering.
            for chunk in reply.chunks(3) {
                stream.write_all(chunk).await.unwrap();
            }
        });

        let agent = OpensshAgent::new(&path);
        let keys = agent.identities().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].comment(), Some("work"));
        assert_eq!(keys[0].public_blob(), blob.as_slice());

        server.await.unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn early_close_reports_no_reply() {
        let path = socket_path("close");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 5];
            stream.read_exact(&mut request).await.unwrap();
            // Drop without replying.
        });

        let agent = OpensshAgent::new(&path);
        assert!(matches!(
            agent.identities().await.unwrap_err(),
            AgentError::NoReply
        ));

        server.await.unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_socket_reports_connect_error() {
        let agent = OpensshAgent::new("/nonexistent/agentwire.sock");
        assert!(matches!(
            agent.identities().await.unwrap_err(),
            AgentError::Connect(_)
        ));
    }
}
