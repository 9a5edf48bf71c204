use bytes::{Buf, Bytes, BytesMut};

use crate::{ProtoError, Result};

pub const MAX_FRAME_LEN: usize = 1024 * 1024; // 1 MiB for now

/// One whole wire frame: the message type byte plus its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Bytes,
}

/// Incremental frame parser. Bytes go in via [`Framer::ingest`] in whatever
/// chunks the transport produces; whole frames come out of
/// [`Framer::next_frame`]. Never yields a partial frame and never loses
/// bytes across chunk boundaries.
#[derive(Debug, Default)]
pub struct Framer {
    buffer: BytesMut,
    frame_len: Option<usize>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let len = match self.frame_len {
            Some(len) => len,
            None => {
                if self.buffer.len() < 4 {
                    return Ok(None);
                }
                let len = u32::from_be_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]) as usize;
                if len == 0 {
                    return Err(ProtoError::InvalidMessage("zero-length frame"));
                }
                if len > MAX_FRAME_LEN {
                    return Err(ProtoError::FrameTooLarge(len));
                }
                self.frame_len = Some(len);
                len
            }
        };

        if self.buffer.len() < 4 + len {
            return Ok(None);
        }

        self.buffer.advance(4);
        let mut frame = self.buffer.split_to(len);
        let msg_type = frame.get_u8();
        self.frame_len = None;
        if self.buffer.is_empty() {
            // Release the allocation instead of holding a drained tail.
            self.buffer = BytesMut::new();
        }
        Ok(Some(Frame { msg_type, payload: frame.freeze() }))
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(msg_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + payload.len());
        out.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
        out.push(msg_type);
        out.extend_from_slice(payload);
        out
    }

    fn drain(framer: &mut Framer) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = framer.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn whole_frame_in_one_chunk() {
        let mut framer = Framer::new();
        framer.ingest(&frame_bytes(11, &[]));
        let frames = drain(&mut framer);
        assert_eq!(frames, vec![Frame { msg_type: 11, payload: Bytes::new() }]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut chunk = frame_bytes(11, &[]);
        chunk.extend_from_slice(&frame_bytes(13, b"abc"));
        chunk.extend_from_slice(&frame_bytes(5, &[]));

        let mut framer = Framer::new();
        framer.ingest(&chunk);
        let frames = drain(&mut framer);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].msg_type, 11);
        assert_eq!(frames[1].msg_type, 13);
        assert_eq!(&frames[1].payload[..], b"abc");
        assert_eq!(frames[2].msg_type, 5);
    }

    #[test]
    fn round_trip_survives_any_chunking() {
        let mut stream = Vec::new();
        let expected: Vec<(u8, Vec<u8>)> = vec![
            (11, vec![]),
            (12, vec![0, 0, 0, 0]),
            (13, (0..37).collect()),
            (14, vec![0xff; 200]),
            (5, vec![]),
        ];
        for (msg_type, payload) in &expected {
            stream.extend_from_slice(&frame_bytes(*msg_type, payload));
        }

        for chunk_size in [1, 2, 3, 4, 5, 7, 16, 64, stream.len()] {
            let mut framer = Framer::new();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                framer.ingest(chunk);
                frames.extend(drain(&mut framer));
            }
            let got: Vec<(u8, Vec<u8>)> = frames
                .into_iter()
                .map(|frame| (frame.msg_type, frame.payload.to_vec()))
                .collect();
            assert_eq!(got, expected, "chunk_size={chunk_size}");
            assert_eq!(framer.buffered(), 0);
        }
    }

    #[test]
    fn length_field_split_across_chunks() {
        let bytes = frame_bytes(11, &[]);
        let mut framer = Framer::new();
        framer.ingest(&bytes[..2]);
        assert_eq!(framer.next_frame().unwrap(), None);
        framer.ingest(&bytes[2..4]);
        assert_eq!(framer.next_frame().unwrap(), None);
        framer.ingest(&bytes[4..]);
        assert_eq!(
            framer.next_frame().unwrap(),
            Some(Frame { msg_type: 11, payload: Bytes::new() })
        );
    }

    #[test]
    fn zero_length_frame_is_rejected() {
        let mut framer = Framer::new();
        framer.ingest(&[0, 0, 0, 0, 11]);
        assert_eq!(
            framer.next_frame().unwrap_err(),
            ProtoError::InvalidMessage("zero-length frame")
        );
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut framer = Framer::new();
        framer.ingest(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        assert!(matches!(
            framer.next_frame().unwrap_err(),
            ProtoError::FrameTooLarge(_)
        ));
    }

    #[test]
    fn unfinished_tail_is_retained() {
        let mut chunk = frame_bytes(11, &[]);
        chunk.extend_from_slice(&frame_bytes(13, b"tail")[..6]);

        let mut framer = Framer::new();
        framer.ingest(&chunk);
        let frames = drain(&mut framer);
        assert_eq!(frames.len(), 1);
        assert_eq!(framer.buffered(), 6);
    }
}
