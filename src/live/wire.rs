//! Binary wire framing for the voice-tutor protocol.
//!
//! One frame per logical message: a one-byte type tag, a big-endian
//! `u32` payload length, then the payload itself (opaque bytes for
//! `AUDIO_FRAME`/`AUDIO_CHUNK`, UTF-8 JSON for everything else).

use bytes::{Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

/// Client → server frame type tags.
pub mod client {
    pub const AUDIO_FRAME: u8 = 0x01;
    pub const INIT: u8 = 0x02;
    pub const CONFIG_UPDATE: u8 = 0x03;
    pub const IMAGE_UPLOAD: u8 = 0x04;
    pub const REQUEST_NOTES: u8 = 0x05;
    pub const SPEECH_START: u8 = 0x06;
    pub const SPEECH_END: u8 = 0x07;
    pub const BARGE_IN: u8 = 0x08;
}

/// Server → client frame type tags.
pub mod server {
    pub const CONNECTED: u8 = 0x10;
    pub const TRANSCRIPT_INTERIM: u8 = 0x11;
    pub const TRANSCRIPT_FINAL: u8 = 0x12;
    pub const AUDIO_CHUNK: u8 = 0x13;
    pub const AUDIO_COMPLETE: u8 = 0x14;
    pub const ERROR: u8 = 0x15;
    pub const NOTES: u8 = 0x16;
    pub const IMAGE_RECEIVED: u8 = 0x17;
    pub const CONFIG_UPDATED: u8 = 0x18;
    pub const LLM_DELTA: u8 = 0x19;
}

/// Header size: 1 type byte + 4 length bytes.
const HEADER_LEN: usize = 5;

/// Errors decoding a wire frame. Unknown type bytes are *not* an error
/// here — only the dispatcher (the endpoint loop) knows the full set of
/// types it is willing to accept.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than 5 bytes were available — not even a full header.
    #[error("frame shorter than the 5-byte header")]
    ShortFrame,

    /// The declared payload length didn't match what was actually
    /// available.
    #[error("declared payload length {declared} does not match available {available} bytes")]
    LengthMismatch { declared: u32, available: usize },
}

/// A decoded wire frame: a type tag plus its raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame from a type tag and raw payload bytes.
    pub fn new(frame_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Build a frame whose payload is the JSON serialization of `value`.
    pub fn json(frame_type: u8, value: &impl Serialize) -> serde_json::Result<Self> {
        Ok(Self::new(frame_type, serde_json::to_vec(value)?))
    }

    /// Deserialize this frame's payload as JSON.
    pub fn json_payload<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    /// Encode this frame to its wire representation.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&[self.frame_type]);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode exactly one frame from `bytes`. The input is expected to be a
    /// single logical message (e.g. one WebSocket binary frame) — trailing
    /// bytes beyond the declared length are treated as a length mismatch
    /// rather than silently ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::ShortFrame);
        }
        let frame_type = bytes[0];
        let declared = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let available = bytes.len() - HEADER_LEN;
        if declared as usize != available {
            return Err(FrameError::LengthMismatch { declared, available });
        }
        Ok(Self {
            frame_type,
            payload: Bytes::copy_from_slice(&bytes[HEADER_LEN..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_type_and_payload() {
        let frame = Frame::new(client::AUDIO_FRAME, Bytes::from_static(b"\x01\x02\x03"));
        let encoded = frame.encode();
        let decoded = Frame::decode(&encoded).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trip_empty_payload() {
        let frame = Frame::new(server::AUDIO_COMPLETE, Bytes::new());
        let decoded = Frame::decode(&frame.encode()).expect("decode");
        assert_eq!(decoded.payload.len(), 0);
        assert_eq!(decoded.frame_type, server::AUDIO_COMPLETE);
    }

    #[test]
    fn decode_rejects_short_input() {
        assert_eq!(Frame::decode(&[0x01, 0x00, 0x00]), Err(FrameError::ShortFrame));
        assert_eq!(Frame::decode(&[]), Err(FrameError::ShortFrame));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        // declares 10 bytes of payload but only 2 are present
        let bytes = [0x02, 0x00, 0x00, 0x00, 0x0a, 0x01, 0x02];
        assert_eq!(
            Frame::decode(&bytes),
            Err(FrameError::LengthMismatch {
                declared: 10,
                available: 2
            })
        );
    }

    #[test]
    fn decode_never_panics_on_garbage() {
        for len in 0..8 {
            let bytes = vec![0xffu8; len];
            let _ = Frame::decode(&bytes);
        }
    }

    #[test]
    fn json_payload_round_trips() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Init {
            target_language: String,
            translator_mode: bool,
        }
        let init = Init {
            target_language: "en".into(),
            translator_mode: false,
        };
        let frame = Frame::json(client::INIT, &init).expect("serialize");
        let decoded = Frame::decode(&frame.encode()).expect("decode");
        let parsed: Init = decoded.json_payload().expect("deserialize");
        assert_eq!(parsed, init);
    }

    #[test]
    fn frame_type_constants_match_wire_protocol() {
        assert_eq!(client::AUDIO_FRAME, 0x01);
        assert_eq!(client::BARGE_IN, 0x08);
        assert_eq!(server::CONNECTED, 0x10);
        assert_eq!(server::LLM_DELTA, 0x19);
    }
}
