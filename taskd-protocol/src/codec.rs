//! Message codec for IPC framing
//!
//! Frames are newline-delimited JSON: one [`IpcMessage`] object per line.
//! JSON string escaping guarantees an encoded message never contains a raw
//! `\n`, so the delimiter is unambiguous.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::IpcMessage;

/// Maximum frame size (4 MB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// How much of an offending frame to keep in a schema error
const RAW_SNIPPET_MAX: usize = 512;

/// Protocol codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The frame was well-delimited but did not validate against exactly one
    /// message variant. Carries the offending raw value.
    #[error("Schema violation: {detail} (raw: {raw:?})")]
    Schema { raw: String, detail: String },
}

impl CodecError {
    /// Schema violations leave the stream well-framed: the connection can
    /// keep reading. Framing and IO errors cannot be recovered from.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::Schema { .. })
    }
}

/// Decode one frame into a validated message, failing closed.
pub fn decode_message(frame: &[u8]) -> Result<IpcMessage, CodecError> {
    let schema_err = |detail: String| {
        let mut raw = String::from_utf8_lossy(frame).into_owned();
        if raw.len() > RAW_SNIPPET_MAX {
            let mut cut = RAW_SNIPPET_MAX;
            while !raw.is_char_boundary(cut) {
                cut -= 1;
            }
            raw.truncate(cut);
            raw.push_str("...");
        }
        CodecError::Schema { raw, detail }
    };

    let message: IpcMessage =
        serde_json::from_slice(frame).map_err(|e| schema_err(e.to_string()))?;
    message.validate_origin().map_err(schema_err)?;
    Ok(message)
}

/// Encode a message to its single-line wire form (including the trailing
/// newline). Every valid in-memory message has exactly one wire
/// representation.
pub fn encode_message(message: &IpcMessage) -> Result<Vec<u8>, CodecError> {
    // Serialization of a validated message cannot fail: all payloads are
    // plain data with total JSON representations.
    let mut data = serde_json::to_vec(message)
        .map_err(|e| CodecError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    data.push(b'\n');
    Ok(data)
}

/// Newline-delimited JSON codec for [`IpcMessage`], both directions
#[derive(Debug, Default)]
pub struct IpcCodec {
    /// Index to resume scanning for the delimiter, so repeated polls over a
    /// partial frame stay linear.
    next_index: usize,
}

impl IpcCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for IpcCodec {
    type Item = IpcMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            let Some(newline) = newline else {
                if src.len() > MAX_FRAME_SIZE {
                    return Err(CodecError::FrameTooLarge {
                        size: src.len(),
                        max: MAX_FRAME_SIZE,
                    });
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let line = src.split_to(newline + 1);
            self.next_index = 0;

            let mut frame = &line[..line.len() - 1];
            if let [head @ .., b'\r'] = frame {
                frame = head;
            }
            if frame.is_empty() {
                continue;
            }

            return decode_message(frame).map(Some);
        }
    }
}

impl Encoder<IpcMessage> for IpcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: IpcMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = encode_message(&item)?;
        dst.reserve(data.len());
        dst.put_slice(&data);
        Ok(())
    }
}
