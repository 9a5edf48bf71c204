use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AgentRequest, AgentResponse, Identity, MessageType, ProtoError, Result};
use crate::framer::MAX_FRAME_LEN;

pub fn decode_request(msg_type: u8, payload: Bytes) -> Result<AgentRequest> {
    let mut buf = payload;
    match msg_type {
        x if x == MessageType::RequestIdentities as u8 => Ok(AgentRequest::RequestIdentities),
        x if x == MessageType::SignRequest as u8 => {
            let key_blob = read_string(&mut buf)?;
            let data = read_string(&mut buf)?;
            if buf.remaining() < 4 {
                return Err(ProtoError::UnexpectedEof);
            }
            let flags = buf.get_u32();
            Ok(AgentRequest::SignRequest { key_blob, data, flags })
        }
        other => Ok(AgentRequest::Unknown {
            message_type: other,
            payload: buf,
        }),
    }
}

pub fn decode_response(msg_type: u8, payload: Bytes) -> Result<AgentResponse> {
    let mut buf = payload;
    match msg_type {
        x if x == MessageType::Failure as u8 => Ok(AgentResponse::Failure),
        x if x == MessageType::IdentitiesAnswer as u8 => {
            if buf.remaining() < 4 {
                return Err(ProtoError::UnexpectedEof);
            }
            let count = buf.get_u32();
            let mut identities = Vec::new();
            for _ in 0..count {
                let key_blob = read_string(&mut buf)?;
                let comment = read_string(&mut buf)?;
                identities.push(Identity {
                    key_blob,
                    comment: String::from_utf8_lossy(&comment).into_owned(),
                });
            }
            Ok(AgentResponse::IdentitiesAnswer { identities })
        }
        x if x == MessageType::SignResponse as u8 => {
            let signature_blob = read_string(&mut buf)?;
            Ok(AgentResponse::SignResponse { signature_blob })
        }
        other => Ok(AgentResponse::Unknown {
            message_type: other,
            payload: buf,
        }),
    }
}

pub fn encode_request(request: &AgentRequest) -> Bytes {
    let mut buf = BytesMut::new();
    match request {
        AgentRequest::RequestIdentities => buf.put_u8(MessageType::RequestIdentities as u8),
        AgentRequest::SignRequest { key_blob, data, flags } => {
            buf.reserve(1 + 4 + key_blob.len() + 4 + data.len() + 4);
            buf.put_u8(MessageType::SignRequest as u8);
            write_string(&mut buf, key_blob);
            write_string(&mut buf, data);
            buf.put_u32(*flags);
        }
        AgentRequest::Unknown { message_type, payload } => {
            buf.reserve(1 + payload.len());
            buf.put_u8(*message_type);
            buf.put_slice(payload);
        }
    }
    buf.freeze()
}

pub fn encode_response(response: &AgentResponse) -> Bytes {
    let mut buf = BytesMut::new();
    match response {
        AgentResponse::Failure => buf.put_u8(MessageType::Failure as u8),
        AgentResponse::IdentitiesAnswer { identities } => {
            buf.put_u8(MessageType::IdentitiesAnswer as u8);
            buf.put_u32(identities.len() as u32);
            for identity in identities {
                write_string(&mut buf, &identity.key_blob);
                write_string(&mut buf, identity.comment.as_bytes());
            }
        }
        AgentResponse::SignResponse { signature_blob } => {
            buf.put_u8(MessageType::SignResponse as u8);
            write_string(&mut buf, signature_blob);
        }
        AgentResponse::Unknown { message_type, payload } => {
            buf.reserve(1 + payload.len());
            buf.put_u8(*message_type);
            buf.put_slice(payload);
        }
    }
    buf.freeze()
}

pub fn encode_request_frame(request: &AgentRequest) -> Bytes {
    frame(encode_request(request))
}

pub fn encode_response_frame(response: &AgentResponse) -> Bytes {
    frame(encode_response(response))
}

fn frame(payload: Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    buf.freeze()
}

/// The two-level signature encoding used by SIGN_RESPONSE bodies:
/// `string(format) || string(signature)`.
pub fn encode_signature_blob(format: &str, signature: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + format.len() + 4 + signature.len());
    write_string(&mut buf, format.as_bytes());
    write_string(&mut buf, signature);
    buf.to_vec()
}

pub fn split_signature_blob(blob: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut cursor = blob;
    let format = read_string_ref(&mut cursor)?;
    let signature = read_string_ref(&mut cursor)?;
    let format = std::str::from_utf8(format)
        .map_err(|_| ProtoError::InvalidMessage("signature format is not utf-8"))?;
    Ok((format.to_string(), signature.to_vec()))
}

pub fn read_string(buf: &mut Bytes) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(ProtoError::UnexpectedEof);
    }
    let len = buf.get_u32() as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(len));
    }
    if buf.remaining() < len {
        return Err(ProtoError::UnexpectedEof);
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

pub fn read_string_ref<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    if buf.len() < 4 {
        return Err(ProtoError::UnexpectedEof);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    *buf = &buf[4..];
    if buf.len() < len {
        return Err(ProtoError::UnexpectedEof);
    }
    let (out, rest) = buf.split_at(len);
    *buf = rest;
    Ok(out)
}

pub fn write_string(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}
