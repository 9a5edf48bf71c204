use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use agentwire_proto::{
    decode_response, encode_request_frame, split_signature_blob, AgentRequest, AgentResponse,
    Frame, Framer, Identity,
};

use crate::{AgentError, KeyParser, ParsedKey, Result, SignOptions};

enum Pending {
    Identities(oneshot::Sender<Result<Vec<ParsedKey>>>),
    Sign(oneshot::Sender<Result<Vec<u8>>>),
}

impl Pending {
    fn fail(self, err: AgentError) {
        match self {
            Pending::Identities(tx) => {
                let _ = tx.send(Err(err));
            }
            Pending::Sign(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// Client half of the agent protocol. Sans-IO: outbound request frames are
/// drained with [`ClientEngine::next_outbound`], inbound bytes are pushed
/// through [`ClientEngine::ingest`], and each request resolves its oneshot
/// receiver exactly once.
///
/// Replies are matched to requests strictly FIFO; a peer that reorders or
/// invents replies poisons the engine.
pub struct ClientEngine {
    parser: Arc<dyn KeyParser>,
    framer: Framer,
    pending: VecDeque<Pending>,
    outbound: VecDeque<Bytes>,
    poisoned: Option<AgentError>,
}

impl ClientEngine {
    pub fn new(parser: Arc<dyn KeyParser>) -> Self {
        Self {
            parser,
            framer: Framer::new(),
            pending: VecDeque::new(),
            outbound: VecDeque::new(),
            poisoned: None,
        }
    }

    /// Queue a REQUEST_IDENTITIES frame. The receiver resolves with the
    /// agent's identity list once the matching reply arrives.
    pub fn request_identities(&mut self) -> oneshot::Receiver<Result<Vec<ParsedKey>>> {
        let (tx, rx) = oneshot::channel();
        if let Some(err) = &self.poisoned {
            let _ = tx.send(Err(err.clone()));
            return rx;
        }
        self.outbound
            .push_back(encode_request_frame(&AgentRequest::RequestIdentities));
        self.pending.push_back(Pending::Identities(tx));
        rx
    }

    /// Queue a SIGN_REQUEST frame. The receiver resolves with the raw
    /// signature blob (algorithm label already stripped). The RSA-SHA2 flag
    /// bits are set only for `ssh-rsa` keys.
    pub fn sign(
        &mut self,
        key: &ParsedKey,
        data: &[u8],
        options: SignOptions,
    ) -> oneshot::Receiver<Result<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        if let Some(err) = &self.poisoned {
            let _ = tx.send(Err(err.clone()));
            return rx;
        }
        let flags = match options.hash {
            Some(hash) if key.is_rsa() => hash.flag(),
            _ => 0,
        };
        self.outbound.push_back(encode_request_frame(&AgentRequest::SignRequest {
            key_blob: key.public_blob().to_vec(),
            data: data.to_vec(),
            flags,
        }));
        self.pending.push_back(Pending::Sign(tx));
        rx
    }

    /// Next encoded request frame to write to the transport, in submission
    /// order.
    pub fn next_outbound(&mut self) -> Option<Bytes> {
        self.outbound.pop_front()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed transport bytes into the engine, dispatching any whole reply
    /// frames they complete. Errors are fatal: the engine stays poisoned and
    /// every later call observes the same error.
    pub fn ingest(&mut self, chunk: &[u8]) -> Result<()> {
        if let Some(err) = &self.poisoned {
            return Err(err.clone());
        }
        self.framer.ingest(chunk);
        loop {
            match self.framer.next_frame() {
                Ok(Some(frame)) => self.dispatch(frame)?,
                Ok(None) => return Ok(()),
                Err(err) => return Err(self.poison(err.into())),
            }
        }
    }

    /// Abort every outstanding request with `NoReply`. Called by transport
    /// owners when the stream closes, ends, or errors.
    pub fn fail_pending(&mut self) {
        self.poisoned.get_or_insert(AgentError::NoReply);
        for pending in self.pending.drain(..) {
            pending.fail(AgentError::NoReply);
        }
    }

    fn poison(&mut self, err: AgentError) -> AgentError {
        self.poisoned = Some(err.clone());
        err
    }

    fn dispatch(&mut self, frame: Frame) -> Result<()> {
        let msg_type = frame.msg_type;
        let Some(head) = self.pending.pop_front() else {
            return Err(self.poison(AgentError::UnexpectedMessage));
        };

        let response = match decode_response(msg_type, frame.payload) {
            Ok(response) => response,
            Err(err) => {
                debug!(?err, msg_type, "reply failed to decode");
                let err = AgentError::MalformedResponse;
                head.fail(err.clone());
                return Err(self.poison(err));
            }
        };

        match (head, response) {
            (head, AgentResponse::Failure) => {
                head.fail(AgentError::Failure);
                Ok(())
            }
            (Pending::Identities(tx), AgentResponse::IdentitiesAnswer { identities }) => {
                let _ = tx.send(Ok(self.parse_identities(identities)));
                Ok(())
            }
            (Pending::Sign(tx), AgentResponse::SignResponse { signature_blob }) => {
                match split_signature_blob(&signature_blob) {
                    Ok((_format, signature)) => {
                        let _ = tx.send(Ok(signature));
                        Ok(())
                    }
                    Err(err) => {
                        debug!(?err, "signature blob failed to re-parse");
                        let err = AgentError::MalformedSignature;
                        let _ = tx.send(Err(err.clone()));
                        Err(self.poison(err))
                    }
                }
            }
            (head, _) => {
                let err = AgentError::WrongMessageType(msg_type);
                head.fail(err.clone());
                Err(self.poison(err))
            }
        }
    }

    fn parse_identities(&self, identities: Vec<Identity>) -> Vec<ParsedKey> {
        let mut keys = Vec::with_capacity(identities.len());
        for identity in identities {
            match self.parser.parse(&identity.key_blob) {
                Ok(mut key) => {
                    if key.comment().is_none() {
                        key.set_comment(identity.comment);
                    }
                    keys.push(key);
                }
                Err(err) => {
                    // Unsupported key types are tolerated, not fatal.
                    debug!(?err, "skipping identity the key parser rejected");
                }
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OpensshKeyParser;
    use agentwire_proto::{encode_response_frame, SignatureHash};
    use bytes::{BufMut, BytesMut};

    fn engine() -> ClientEngine {
        ClientEngine::new(Arc::new(OpensshKeyParser))
    }

    fn ed25519_blob() -> Vec<u8> {
        ssh_key::PublicKey::from_openssh(
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICG6kjK0iJxESpkwvCTOwwcUsJcggrGhSdHyaP0JHGub",
        )
        .expect("public key")
        .to_bytes()
        .expect("key blob")
    }

    fn take_wire(engine: &mut ClientEngine) -> Vec<u8> {
        let mut wire = Vec::new();
        while let Some(frame) = engine.next_outbound() {
            wire.extend_from_slice(&frame);
        }
        wire
    }

    #[test]
    fn empty_identities_round_trip() {
        let mut engine = engine();
        let mut rx = engine.request_identities();

        assert_eq!(take_wire(&mut engine), hex::decode("000000010b").unwrap());

        engine.ingest(&hex::decode("000000050c00000000").unwrap()).unwrap();
        let keys = rx.try_recv().unwrap().unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn unparseable_identity_yields_empty_list() {
        // One "key" whose blob is the 7 bytes "ssh-rsa" and comment "a"; the
        // parser rejects the blob, so the list comes back empty.
        let mut engine = engine();
        let mut rx = engine.request_identities();
        take_wire(&mut engine);

        let reply =
            hex::decode("000000150c00000001000000077373682d7273610000000161").unwrap();
        engine.ingest(&reply).unwrap();
        assert!(rx.try_recv().unwrap().unwrap().is_empty());
    }

    #[test]
    fn identity_adopts_decoded_comment() {
        let blob = ed25519_blob();
        let mut engine = engine();
        let mut rx = engine.request_identities();
        take_wire(&mut engine);

        let reply = encode_response_frame(&AgentResponse::IdentitiesAnswer {
            identities: vec![Identity { key_blob: blob.clone(), comment: "a".into() }],
        });
        engine.ingest(&reply).unwrap();

        let keys = rx.try_recv().unwrap().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].comment(), Some("a"));
        assert_eq!(keys[0].public_blob(), blob.as_slice());
    }

    #[test]
    fn rsa_sha256_sign_request_layout() {
        let key = ParsedKey::new("ssh-rsa", vec![0xb0; 5], None);
        let data = [0xd0, 0xd1, 0xd2];
        let mut engine = engine();
        let _rx = engine.sign(&key, &data, SignOptions::with_hash(SignatureHash::Sha256));

        let wire = take_wire(&mut engine);
        let outer_len = 1 + 4 + 5 + 4 + 3 + 4;
        let mut expected = Vec::new();
        expected.extend_from_slice(&(outer_len as u32).to_be_bytes());
        expected.push(0x0d);
        expected.extend_from_slice(&5u32.to_be_bytes());
        expected.extend_from_slice(&[0xb0; 5]);
        expected.extend_from_slice(&3u32.to_be_bytes());
        expected.extend_from_slice(&data);
        expected.extend_from_slice(&2u32.to_be_bytes());
        assert_eq!(wire, expected);
    }

    #[test]
    fn hash_flags_are_zero_for_non_rsa_keys() {
        let key = ParsedKey::new("ssh-ed25519", vec![1, 2], None);
        let mut engine = engine();
        let _rx = engine.sign(&key, b"x", SignOptions::with_hash(SignatureHash::Sha512));

        let wire = take_wire(&mut engine);
        assert_eq!(&wire[wire.len() - 4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn sign_response_strips_algorithm_label() {
        let key = ParsedKey::new("ssh-rsa", vec![1], None);
        let mut engine = engine();
        let mut rx = engine.sign(&key, b"data", SignOptions::with_hash(SignatureHash::Sha256));
        take_wire(&mut engine);

        let mut inner = BytesMut::new();
        agentwire_proto::write_string(&mut inner, b"rsa-sha2-256");
        agentwire_proto::write_string(&mut inner, &[0xaa, 0xbb]);
        let reply = encode_response_frame(&AgentResponse::SignResponse {
            signature_blob: inner.to_vec(),
        });
        engine.ingest(&reply).unwrap();

        assert_eq!(rx.try_recv().unwrap().unwrap(), vec![0xaa, 0xbb]);
    }

    #[test]
    fn malformed_inner_signature_is_fatal() {
        let key = ParsedKey::new("ssh-ed25519", vec![1], None);
        let mut engine = engine();
        let mut rx = engine.sign(&key, b"data", SignOptions::default());
        take_wire(&mut engine);

        let reply = encode_response_frame(&AgentResponse::SignResponse {
            signature_blob: vec![0xff, 0xff],
        });
        let err = engine.ingest(&reply).unwrap_err();
        assert!(matches!(err, AgentError::MalformedSignature));
        assert!(matches!(
            rx.try_recv().unwrap().unwrap_err(),
            AgentError::MalformedSignature
        ));
    }

    #[test]
    fn requests_serialize_in_submission_order() {
        let key = ParsedKey::new("ssh-ed25519", vec![7; 4], None);
        let mut engine = engine();
        let _rx1 = engine.request_identities();
        let _rx2 = engine.sign(&key, b"payload", SignOptions::default());
        let _rx3 = engine.request_identities();

        let mut expected = Vec::new();
        expected.extend_from_slice(&encode_request_frame(&AgentRequest::RequestIdentities));
        expected.extend_from_slice(&encode_request_frame(&AgentRequest::SignRequest {
            key_blob: vec![7; 4],
            data: b"payload".to_vec(),
            flags: 0,
        }));
        expected.extend_from_slice(&encode_request_frame(&AgentRequest::RequestIdentities));
        assert_eq!(take_wire(&mut engine), expected);
    }

    #[test]
    fn failure_completes_head_without_poisoning() {
        let mut engine = engine();
        let mut rx1 = engine.request_identities();
        let mut rx2 = engine.request_identities();
        take_wire(&mut engine);

        engine.ingest(&hex::decode("0000000105").unwrap()).unwrap();
        assert!(matches!(rx1.try_recv().unwrap().unwrap_err(), AgentError::Failure));

        engine.ingest(&hex::decode("000000050c00000000").unwrap()).unwrap();
        assert!(rx2.try_recv().unwrap().unwrap().is_empty());
    }

    #[test]
    fn reply_with_no_outstanding_request_is_fatal() {
        let mut engine = engine();
        let err = engine.ingest(&hex::decode("0000000105").unwrap()).unwrap_err();
        assert!(matches!(err, AgentError::UnexpectedMessage));

        // Poisoned: new requests fail immediately.
        let mut rx = engine.request_identities();
        assert!(matches!(
            rx.try_recv().unwrap().unwrap_err(),
            AgentError::UnexpectedMessage
        ));
    }

    #[test]
    fn mismatched_reply_type_is_fatal() {
        let mut engine = engine();
        let mut rx = engine.request_identities();
        take_wire(&mut engine);

        let mut reply = BytesMut::new();
        reply.put_u32(1 + 4 + 2);
        reply.put_u8(14);
        agentwire_proto::write_string(&mut reply, &[0, 0]);
        let err = engine.ingest(&reply).unwrap_err();
        assert!(matches!(err, AgentError::WrongMessageType(14)));
        assert!(matches!(
            rx.try_recv().unwrap().unwrap_err(),
            AgentError::WrongMessageType(14)
        ));
    }

    #[test]
    fn truncated_reply_body_is_fatal() {
        let mut engine = engine();
        let mut rx = engine.request_identities();
        take_wire(&mut engine);

        // IDENTITIES_ANSWER claiming one key but carrying no strings.
        let err = engine.ingest(&hex::decode("000000050c00000001").unwrap()).unwrap_err();
        assert!(matches!(err, AgentError::MalformedResponse));
        assert!(matches!(
            rx.try_recv().unwrap().unwrap_err(),
            AgentError::MalformedResponse
        ));
    }

    #[test]
    fn fail_pending_sweeps_each_request_once() {
        let mut engine = engine();
        let mut rx1 = engine.request_identities();
        let mut rx2 = engine.request_identities();
        take_wire(&mut engine);

        engine.fail_pending();
        engine.fail_pending();

        assert!(matches!(rx1.try_recv().unwrap().unwrap_err(), AgentError::NoReply));
        assert!(matches!(rx2.try_recv().unwrap().unwrap_err(), AgentError::NoReply));
        assert_eq!(engine.pending_len(), 0);
    }
}
