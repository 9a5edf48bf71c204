use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::debug;

use crate::{Agent, KeyParser, OpensshAgent, OpensshKeyParser, ParsedKey, Result, SignOptions};

/// Caches the identity list of one agent and walks it with a forward-only
/// cursor, so callers can try each key once and sign with the current one.
///
/// The list is fetched at most once: concurrent [`AgentContext::init`] calls
/// share a single round trip, later calls return immediately. A failed fetch
/// leaves the cache empty and may be retried.
pub struct AgentContext {
    agent: Arc<dyn Agent>,
    parser: Arc<dyn KeyParser>,
    keys: OnceCell<Vec<ParsedKey>>,
    cursor: isize,
}

impl AgentContext {
    pub fn new(agent: Arc<dyn Agent>, parser: Arc<dyn KeyParser>) -> Self {
        Self {
            agent,
            parser,
            keys: OnceCell::new(),
            cursor: -1,
        }
    }

    /// Context over the OpenSSH socket adapter at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let parser: Arc<dyn KeyParser> = Arc::new(OpensshKeyParser);
        Self::new(Arc::new(OpensshAgent::with_parser(path, parser.clone())), parser)
    }

    pub async fn init(&self) -> Result<()> {
        self.keys
            .get_or_try_init(|| async {
                let raw = self.agent.identities().await?;
                let mut keys = Vec::with_capacity(raw.len());
                for key in raw {
                    match self.parser.parse(key.public_blob()) {
                        Ok(mut parsed) => {
                            if parsed.comment().is_none() {
                                if let Some(comment) = key.comment() {
                                    parsed.set_comment(comment);
                                }
                            }
                            keys.push(parsed);
                        }
                        Err(err) => {
                            debug!(?err, "skipping identity the key parser rejected");
                        }
                    }
                }
                Ok(keys)
            })
            .await
            .map(|_| ())
    }

    /// Advance the cursor and return the key under it, or `None` once the
    /// list is exhausted (or was never loaded).
    pub fn next_key(&mut self) -> Option<&ParsedKey> {
        let len = self.keys.get()?.len() as isize;
        if self.cursor < len {
            self.cursor += 1;
        }
        self.key_at(self.cursor)
    }

    pub fn current_key(&self) -> Option<&ParsedKey> {
        self.key_at(self.cursor)
    }

    /// Index of the current key, or -1 before the first `next_key`, after
    /// exhaustion, or before init.
    pub fn pos(&self) -> isize {
        match self.key_at(self.cursor) {
            Some(_) => self.cursor,
            None => -1,
        }
    }

    pub fn reset(&mut self) {
        self.cursor = -1;
    }

    /// The loaded identity list, if init has completed.
    pub fn identities(&self) -> Option<&[ParsedKey]> {
        self.keys.get().map(Vec::as_slice)
    }

    pub async fn sign(
        &self,
        key: &ParsedKey,
        data: &[u8],
        options: SignOptions,
    ) -> Result<Vec<u8>> {
        self.agent.sign(key, data, options).await
    }

    fn key_at(&self, cursor: isize) -> Option<&ParsedKey> {
        if cursor < 0 {
            return None;
        }
        self.keys.get()?.get(cursor as usize)
    }
}
