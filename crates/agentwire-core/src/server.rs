use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use agentwire_proto::{
    decode_request, encode_response_frame, encode_signature_blob, AgentRequest, AgentResponse,
    Frame, Framer, Identity, MessageType, SignatureHash,
};

use crate::{AgentError, KeyParser, ParsedKey, Result};

/// Handle for one inbound request, passed back to the reply methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

#[derive(Debug)]
pub enum ServerEvent {
    /// A REQUEST_IDENTITIES frame arrived.
    Identities { request: RequestId },
    /// A SIGN_REQUEST frame arrived and parsed cleanly. `hash` reflects the
    /// RSA-SHA2 flag bits for `ssh-rsa` keys and is `None` otherwise.
    Sign {
        request: RequestId,
        key: ParsedKey,
        data: Vec<u8>,
        hash: Option<SignatureHash>,
    },
}

/// One entry of an identities reply.
pub enum IdentityEntry {
    Parsed(ParsedKey),
    Commented { key: ParsedKey, comment: String },
    Raw { blob: Vec<u8>, comment: Option<String> },
}

impl From<ParsedKey> for IdentityEntry {
    fn from(key: ParsedKey) -> Self {
        IdentityEntry::Parsed(key)
    }
}

struct InboundRequest {
    id: u64,
    request_type: u8,
    /// Signature-format label to embed in the reply, set while decoding a
    /// sign request.
    sig_format: Option<String>,
    response: Option<Bytes>,
}

enum Slot {
    Live {
        request_type: u8,
        answered: bool,
        sig_format: Option<String>,
    },
    Emitted,
}

/// Server half of the agent protocol. Inbound requests surface as
/// [`ServerEvent`]s; the owner answers through the reply methods in any
/// order, and reply frames are emitted strictly in request-arrival order.
pub struct ServerEngine {
    parser: Arc<dyn KeyParser>,
    framer: Framer,
    queue: VecDeque<InboundRequest>,
    outbound: VecDeque<Bytes>,
    next_id: u64,
}

impl ServerEngine {
    pub fn new(parser: Arc<dyn KeyParser>) -> Self {
        Self {
            parser,
            framer: Framer::new(),
            queue: VecDeque::new(),
            outbound: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Feed transport bytes into the engine. Malformed or unsupported
    /// requests are answered with FAILURE internally and produce no event;
    /// only framing-level corruption is an error.
    pub fn ingest(&mut self, chunk: &[u8]) -> Result<Vec<ServerEvent>> {
        self.framer.ingest(chunk);
        let mut events = Vec::new();
        loop {
            match self.framer.next_frame()? {
                Some(frame) => {
                    if let Some(event) = self.accept(frame)? {
                        events.push(event);
                    }
                }
                None => return Ok(events),
            }
        }
    }

    /// Next encoded reply frame to write to the transport, in
    /// request-arrival order.
    pub fn next_outbound(&mut self) -> Option<Bytes> {
        self.outbound.pop_front()
    }

    /// Number of requests received but not yet emitted.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn failure_reply(&mut self, request: RequestId) -> Result<()> {
        match self.inspect(request)? {
            Slot::Emitted | Slot::Live { answered: true, .. } => Ok(()),
            Slot::Live { .. } => {
                self.complete(request, encode_response_frame(&AgentResponse::Failure));
                Ok(())
            }
        }
    }

    pub fn identities_reply(
        &mut self,
        request: RequestId,
        entries: Vec<IdentityEntry>,
    ) -> Result<()> {
        let request_type = match self.inspect(request)? {
            Slot::Emitted | Slot::Live { answered: true, .. } => return Ok(()),
            Slot::Live { request_type, .. } => request_type,
        };
        if request_type != MessageType::RequestIdentities as u8 {
            return Err(AgentError::InvalidArgument(
                "identities reply on a non-identities request",
            ));
        }

        let mut identities = Vec::with_capacity(entries.len());
        for entry in entries {
            let (key_blob, comment) = match entry {
                IdentityEntry::Parsed(key) => (
                    key.public_blob().to_vec(),
                    key.comment().unwrap_or_default().to_string(),
                ),
                IdentityEntry::Commented { key, comment } => {
                    (key.public_blob().to_vec(), comment)
                }
                IdentityEntry::Raw { blob, comment } => match self.parser.parse(&blob) {
                    Ok(key) => {
                        let comment = comment
                            .or_else(|| key.comment().map(str::to_string))
                            .unwrap_or_default();
                        (key.public_blob().to_vec(), comment)
                    }
                    Err(err) => {
                        debug!(?err, "dropping identity entry the key parser rejected");
                        continue;
                    }
                },
            };
            identities.push(Identity { key_blob, comment });
        }

        let frame = encode_response_frame(&AgentResponse::IdentitiesAnswer { identities });
        self.complete(request, frame);
        Ok(())
    }

    pub fn sign_reply(&mut self, request: RequestId, signature: &[u8]) -> Result<()> {
        let (request_type, sig_format) = match self.inspect(request)? {
            Slot::Emitted | Slot::Live { answered: true, .. } => return Ok(()),
            Slot::Live { request_type, sig_format, .. } => (request_type, sig_format),
        };
        if request_type != MessageType::SignRequest as u8 {
            return Err(AgentError::InvalidArgument("sign reply on a non-sign request"));
        }
        if signature.is_empty() {
            return Err(AgentError::InvalidArgument("empty signature blob"));
        }

        let sig_format = sig_format.unwrap_or_default();
        let frame = encode_response_frame(&AgentResponse::SignResponse {
            signature_blob: encode_signature_blob(&sig_format, signature),
        });
        self.complete(request, frame);
        Ok(())
    }

    fn accept(&mut self, frame: Frame) -> Result<Option<ServerEvent>> {
        let msg_type = frame.msg_type;
        match decode_request(msg_type, frame.payload) {
            Ok(AgentRequest::RequestIdentities) => {
                let request = self.push(msg_type, None);
                Ok(Some(ServerEvent::Identities { request }))
            }
            Ok(AgentRequest::SignRequest { key_blob, data, flags }) => {
                match self.parser.parse(&key_blob) {
                    Ok(key) => {
                        let hash = if key.is_rsa() {
                            SignatureHash::from_flags(flags)
                        } else {
                            None
                        };
                        let sig_format = match hash {
                            Some(hash) => hash.rsa_signature_format().to_string(),
                            None => key.algorithm().to_string(),
                        };
                        let request = self.push(msg_type, Some(sig_format));
                        Ok(Some(ServerEvent::Sign { request, key, data, hash }))
                    }
                    Err(err) => {
                        debug!(?err, "sign request carries an unparseable key");
                        self.reject(msg_type)?;
                        Ok(None)
                    }
                }
            }
            Ok(AgentRequest::Unknown { message_type, .. }) => {
                warn!(message_type, "unsupported request type");
                self.reject(msg_type)?;
                Ok(None)
            }
            Err(err) => {
                debug!(?err, msg_type, "malformed request body");
                self.reject(msg_type)?;
                Ok(None)
            }
        }
    }

    /// Push the request and answer it with FAILURE immediately, keeping the
    /// reply stream aligned with request arrival order.
    fn reject(&mut self, msg_type: u8) -> Result<()> {
        let request = self.push(msg_type, None);
        self.failure_reply(request)
    }

    fn push(&mut self, request_type: u8, sig_format: Option<String>) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(InboundRequest {
            id,
            request_type,
            sig_format,
            response: None,
        });
        RequestId(id)
    }

    fn inspect(&self, request: RequestId) -> Result<Slot> {
        if let Some(req) = self.queue.iter().find(|req| req.id == request.0) {
            return Ok(Slot::Live {
                request_type: req.request_type,
                answered: req.response.is_some(),
                sig_format: req.sig_format.clone(),
            });
        }
        if request.0 < self.next_id {
            // Already answered and emitted; a late duplicate reply is fine.
            return Ok(Slot::Emitted);
        }
        Err(AgentError::InvalidArgument("unknown request"))
    }

    fn complete(&mut self, request: RequestId, frame: Bytes) {
        if let Some(req) = self.queue.iter_mut().find(|req| req.id == request.0) {
            req.response = Some(frame);
        }
        self.pump();
    }

    /// Emit answered requests from the head until the first unanswered one.
    fn pump(&mut self) {
        while self.queue.front().map_or(false, |req| req.response.is_some()) {
            if let Some(req) = self.queue.pop_front() {
                if let Some(frame) = req.response {
                    self.outbound.push_back(frame);
                }
            }
        }
    }
}
