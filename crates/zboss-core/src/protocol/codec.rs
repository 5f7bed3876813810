//! Byte-stream framing
//!
//! [`FrameCodec`] pulls complete frames out of a buffer of raw serial bytes.
//! Anything that does not look like a valid frame (bad signature, bad CRC8,
//! wrong frame type, bad CRC16) is skipped by scanning forward to the next
//! signature, so line noise never costs more than the frame it hit.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::frame::Frame;
use super::header::LlHeader;
use super::{ProtocolError, FRAME_TYPE_NCP_API_HL, LL_HEADER_SIZE, SIGNATURE};

/// Decoder/encoder for NCP frames
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a codec
    pub fn new() -> Self {
        Self
    }
}

/// Outcome of looking at the head of the buffer
enum Extract {
    Frame(Frame, usize),
    NeedMore,
}

fn signature_bytes() -> [u8; 2] {
    SIGNATURE.to_le_bytes()
}

/// Try to decode one frame at the start of `buf` without consuming anything
fn try_extract(buf: &[u8]) -> Result<Extract, ProtocolError> {
    if buf.len() < LL_HEADER_SIZE {
        return Ok(Extract::NeedMore);
    }

    if buf[0..2] != signature_bytes() {
        return Err(ProtocolError::invalid_frame("buffer does not start with signature"));
    }

    // Checks signature and CRC8, so a corrupted size never stalls the stream
    let header = LlHeader::from_bytes(&buf[..LL_HEADER_SIZE])?;

    if header.frame_type() != FRAME_TYPE_NCP_API_HL {
        return Err(ProtocolError::invalid_frame(format!(
            "unexpected frame type 0x{:02X}",
            header.frame_type()
        )));
    }

    let frame_len = header.size() as usize + 2;
    if !header.flags().is_ack() && buf.len() < frame_len {
        return Ok(Extract::NeedMore);
    }

    let (frame, used) = Frame::deserialize(buf)?;
    Ok(Extract::Frame(frame, used))
}

/// Drop bytes up to the next signature candidate
fn resync(buf: &mut BytesMut) {
    let sig = signature_bytes();
    match buf[1..].windows(2).position(|w| w == sig) {
        Some(pos) => {
            trace!(target: "zboss_core::serial", "Dropping {} bytes to resync", pos + 1);
            buf.advance(pos + 1);
        }
        None => {
            // Keep a trailing half signature; its second byte may still arrive
            let keep = usize::from(buf.last() == Some(&sig[0]) && buf.len() > 1);
            trace!(
                target: "zboss_core::serial",
                "No signature found, dropping {} bytes",
                buf.len() - keep
            );
            let len = buf.len();
            buf.advance(len - keep);
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match try_extract(buf) {
                Ok(Extract::Frame(frame, used)) => {
                    buf.advance(used);
                    return Ok(Some(frame));
                }
                Ok(Extract::NeedMore) => return Ok(None),
                Err(err) => {
                    trace!(target: "zboss_core::serial", "Invalid data in buffer: {}", err);
                    resync(buf);
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(&frame.serialize());
        Ok(())
    }
}
