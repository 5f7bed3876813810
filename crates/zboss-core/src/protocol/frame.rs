//! Frame encoding/decoding
//!
//! A frame is a low-level header optionally followed by a high-level packet:
//! - 7 bytes: low-level header (see [`LlHeader`])
//! - 2 bytes: CRC16 of the rest of the body (little-endian)
//! - 4 bytes: high-level common header (first fragment only)
//! - N bytes: payload
//!
//! Packets whose body does not fit in [`LL_BODY_SIZE_MAX`] bytes are split
//! into several frames, each acknowledged separately by the link layer.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::checksum::crc16;
use super::header::{HlCommonHeader, LlFlags, LlHeader, HL_HEADER_SIZE};
use super::{ProtocolError, LL_BODY_SIZE_MAX, LL_HEADER_SIZE};

/// Size of the CRC16 prefix of every high-level packet
pub const HL_CRC_SIZE: usize = 2;

/// High-level part of a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlPacket {
    /// Common header; `None` for continuation fragments
    pub header: Option<HlCommonHeader>,
    /// Payload following the header
    pub data: Vec<u8>,
}

impl HlPacket {
    /// Create a packet with a common header
    pub fn new(header: HlCommonHeader, data: Vec<u8>) -> Self {
        Self {
            header: Some(header),
            data,
        }
    }

    /// Create a headerless packet carrying raw continuation bytes
    pub fn continuation(data: Vec<u8>) -> Self {
        Self { header: None, data }
    }

    /// Header bytes (if any) followed by the payload, without the CRC16
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(HL_HEADER_SIZE + self.data.len());
        if let Some(header) = &self.header {
            body.extend_from_slice(&header.to_bytes());
        }
        body.extend_from_slice(&self.data);
        body
    }

    /// Serialize as CRC16 followed by the body
    pub fn serialize(&self) -> Vec<u8> {
        let body = self.body();
        let mut out = Vec::with_capacity(HL_CRC_SIZE + body.len());
        let mut crc = [0u8; HL_CRC_SIZE];
        LittleEndian::write_u16(&mut crc, crc16(&body));
        out.extend_from_slice(&crc);
        out.extend_from_slice(&body);
        out
    }

    /// Length of the serialized packet, CRC16 included
    pub fn serialized_len(&self) -> usize {
        let header_len = if self.header.is_some() {
            HL_HEADER_SIZE
        } else {
            0
        };
        HL_CRC_SIZE + header_len + self.data.len()
    }

    /// Decode a packet that starts with a common header
    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        let body = verify_crc16(data)?;
        let header = HlCommonHeader::from_bytes(body)?;
        Ok(Self::new(header, body[HL_HEADER_SIZE..].to_vec()))
    }

    /// Decode a headerless continuation packet
    pub fn deserialize_continuation(data: &[u8]) -> Result<Self, ProtocolError> {
        let body = verify_crc16(data)?;
        Ok(Self::continuation(body.to_vec()))
    }
}

impl fmt::Display for HlPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.header {
            Some(header) => write!(f, "HlPacket({}, data={})", header, hex::encode(&self.data)),
            None => write!(f, "HlPacket(data={})", hex::encode(&self.data)),
        }
    }
}

/// Check the leading CRC16 and return the bytes it covers
fn verify_crc16(data: &[u8]) -> Result<&[u8], ProtocolError> {
    if data.len() < HL_CRC_SIZE {
        return Err(ProtocolError::invalid_frame(format!(
            "high-level packet too short: {} bytes",
            data.len()
        )));
    }
    let check = LittleEndian::read_u16(&data[0..HL_CRC_SIZE]);
    let body = &data[HL_CRC_SIZE..];
    let actual = crc16(body);
    if check != actual {
        return Err(ProtocolError::invalid_frame(format!(
            "CRC16 mismatch: expected 0x{:04X}, got 0x{:04X}",
            check, actual
        )));
    }
    Ok(body)
}

/// Low-level header plus optional high-level packet; ACK frames carry none
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Low-level header
    pub ll_header: LlHeader,
    /// Packet carried by a data frame
    pub hl_packet: Option<HlPacket>,
}

impl Frame {
    /// Wrap a packet in a single, unfragmented frame.
    ///
    /// Sequence flags and the CRC8 are filled in by the link layer on send.
    /// Packets with a body over [`LL_BODY_SIZE_MAX`] bytes belong in
    /// [`Frame::fragment`].
    pub fn new(packet: HlPacket) -> Self {
        Self {
            ll_header: LlHeader::new(packet.serialized_len(), LlFlags::single()),
            hl_packet: Some(packet),
        }
    }

    /// Acknowledgement for the frame numbered `ack_seq`
    pub fn ack(ack_seq: u8, retransmit: bool) -> Self {
        let mut flags = LlFlags::from_bits(LlFlags::IS_ACK).with_ack_seq(ack_seq);
        if retransmit {
            flags = flags.with(LlFlags::RETRANSMIT);
        }
        Self {
            ll_header: LlHeader::new(0, flags).with_crc8_updated(),
            hl_packet: None,
        }
    }

    /// Whether this is an ACK frame
    pub fn is_ack(&self) -> bool {
        self.ll_header.flags().is_ack()
    }

    /// Serialize header and packet to wire bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.ll_header.to_bytes().to_vec();
        if let Some(packet) = &self.hl_packet {
            out.extend_from_slice(&packet.serialize());
        }
        out
    }

    /// Decode one frame from the start of `data`.
    ///
    /// Returns the frame and the number of bytes it occupied; anything after
    /// that is left to the caller.
    pub fn deserialize(data: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let ll_header = LlHeader::from_bytes(data)?;
        let flags = ll_header.flags();

        if flags.is_ack() {
            return Ok((
                Self {
                    ll_header,
                    hl_packet: None,
                },
                LL_HEADER_SIZE,
            ));
        }

        let body_len = ll_header.body_len();
        let end = LL_HEADER_SIZE + body_len;
        if data.len() < end {
            return Err(ProtocolError::invalid_frame(format!(
                "frame body truncated: need {} bytes, have {}",
                end,
                data.len()
            )));
        }
        let body = &data[LL_HEADER_SIZE..end];

        // A leading fragment too short to hold the common header is raw bytes
        let has_header = flags.is_first_frag()
            && (flags.is_last_frag() || body_len >= HL_CRC_SIZE + HL_HEADER_SIZE);
        let hl_packet = if has_header {
            HlPacket::deserialize(body)?
        } else {
            HlPacket::deserialize_continuation(body)?
        };

        Ok((
            Self {
                ll_header,
                hl_packet: Some(hl_packet),
            },
            end,
        ))
    }

    /// Split a packet into frames whose bodies are at most `max_body` bytes.
    ///
    /// The first fragment takes the remainder so every later one is full.
    /// `max_body` is capped at [`LL_BODY_SIZE_MAX`].
    pub fn fragment(packet: &HlPacket, max_body: usize) -> Vec<Frame> {
        let max_body = max_body.clamp(1, LL_BODY_SIZE_MAX);
        let body = packet.body();
        let total = body.len();

        if total <= max_body {
            return vec![Frame::new(packet.clone())];
        }

        let count = total.div_ceil(max_body);
        let first_len = match total % max_body {
            0 => max_body,
            rem => rem,
        };

        let mut frames = Vec::with_capacity(count);
        let mut offset = 0;
        for idx in 0..count {
            let len = if idx == 0 { first_len } else { max_body };
            let chunk = &body[offset..offset + len];
            offset += len;

            let flags = if idx == 0 {
                LlFlags::from_bits(LlFlags::FIRST_FRAG)
            } else if idx == count - 1 {
                LlFlags::from_bits(LlFlags::LAST_FRAG)
            } else {
                LlFlags::default()
            };

            let hl_packet = match packet.header {
                Some(header) if idx == 0 && len >= HL_HEADER_SIZE => {
                    HlPacket::new(header, chunk[HL_HEADER_SIZE..].to_vec())
                }
                _ => HlPacket::continuation(chunk.to_vec()),
            };

            frames.push(Frame {
                ll_header: LlHeader::new(hl_packet.serialized_len(), flags),
                hl_packet: Some(hl_packet),
            });
        }
        frames
    }

    /// Merge received fragments, in arrival order, back into one packet
    pub fn reassemble(fragments: &[Frame]) -> Result<HlPacket, ProtocolError> {
        if fragments.is_empty() {
            return Err(ProtocolError::invalid_frame("no fragments to reassemble"));
        }

        let mut body = Vec::new();
        for fragment in fragments {
            let packet = fragment
                .hl_packet
                .as_ref()
                .ok_or_else(|| ProtocolError::invalid_frame("fragment without packet"))?;
            body.extend_from_slice(&packet.body());
        }

        let mut merged = Vec::with_capacity(HL_CRC_SIZE + body.len());
        let mut crc = [0u8; HL_CRC_SIZE];
        LittleEndian::write_u16(&mut crc, crc16(&body));
        merged.extend_from_slice(&crc);
        merged.extend_from_slice(&body);

        HlPacket::deserialize(&merged)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hl_packet {
            Some(packet) => write!(f, "Frame({}, {})", self.ll_header, packet),
            None => write!(f, "Frame({})", self.ll_header),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::ControlType;

    fn rsp_header() -> HlCommonHeader {
        HlCommonHeader::new(ControlType::Rsp, 0x1234).with_version(1)
    }

    #[test]
    fn test_frame_deserialization_leaves_trailing_bytes() {
        let frame = Frame::new(HlPacket::new(rsp_header(), b"test_data".to_vec()));
        let frame = Frame {
            ll_header: frame.ll_header.with_crc8_updated(),
            ..frame
        };
        let mut bytes = frame.serialize();
        let frame_len = bytes.len();
        bytes.extend_from_slice(b"extra_data");

        let (decoded, used) = Frame::deserialize(&bytes).expect("valid frame");
        assert_eq!(used, frame_len);
        assert_eq!(decoded, frame);
        assert_eq!(&bytes[used..], b"extra_data");
    }

    #[test]
    fn test_ack_frame() {
        let ack = Frame::ack(2, false);
        let bytes = ack.serialize();
        assert_eq!(bytes.len(), LL_HEADER_SIZE);

        let (decoded, used) = Frame::deserialize(&bytes).unwrap();
        assert_eq!(used, LL_HEADER_SIZE);
        assert!(decoded.is_ack());
        assert_eq!(decoded.ll_header.flags().ack_seq(), 2);
        assert_eq!(decoded.ll_header.size(), 5);
        assert!(decoded.hl_packet.is_none());

        assert!(Frame::ack(1, true).ll_header.flags().is_retransmit());
    }

    #[test]
    fn test_small_packet_is_not_fragmented() {
        let packet = HlPacket::new(rsp_header(), vec![0x61; 10]);
        let frames = Frame::fragment(&packet, LL_BODY_SIZE_MAX);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].ll_header.flags(), LlFlags::single());
        assert_eq!(frames[0].ll_header.size() as usize, packet.serialized_len() + 5);
    }

    #[test]
    fn test_fragment_boundaries() {
        // Body exactly at the limit stays whole
        let exact = HlPacket::new(rsp_header(), vec![0x61; LL_BODY_SIZE_MAX - HL_HEADER_SIZE]);
        assert_eq!(Frame::fragment(&exact, LL_BODY_SIZE_MAX).len(), 1);

        // One byte over splits in two, first fragment takes the single byte
        let above = HlPacket::new(
            rsp_header(),
            vec![0x61; LL_BODY_SIZE_MAX + 1 - HL_HEADER_SIZE],
        );
        let frames = Frame::fragment(&above, LL_BODY_SIZE_MAX);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].hl_packet.as_ref().unwrap().body().len(), 1);
        assert_eq!(frames[1].hl_packet.as_ref().unwrap().body().len(), LL_BODY_SIZE_MAX);

        let large = HlPacket::new(
            rsp_header(),
            vec![0x61; LL_BODY_SIZE_MAX * 5 + 50 - HL_HEADER_SIZE],
        );
        assert_eq!(Frame::fragment(&large, LL_BODY_SIZE_MAX).len(), 6);
    }

    #[test]
    fn test_oversize_max_body_is_capped() {
        let packet = HlPacket::new(rsp_header(), vec![0x33; 70_000]);
        let frames = Frame::fragment(&packet, 100_000);
        assert_eq!(frames.len(), (70_000 + HL_HEADER_SIZE).div_ceil(LL_BODY_SIZE_MAX));

        let received: Vec<Frame> = frames
            .into_iter()
            .map(|frame| {
                assert!(frame.ll_header.body_len() <= LL_BODY_SIZE_MAX + HL_CRC_SIZE);
                let frame = Frame {
                    ll_header: frame.ll_header.with_crc8_updated(),
                    ..frame
                };
                Frame::deserialize(&frame.serialize()).unwrap().0
            })
            .collect();
        assert_eq!(Frame::reassemble(&received).unwrap(), packet);
    }

    #[test]
    fn test_fragment_flags_and_sizes() {
        let packet = HlPacket::new(rsp_header(), vec![0x61; LL_BODY_SIZE_MAX * 2 + 50]);
        let total = packet.body().len();
        let frames = Frame::fragment(&packet, LL_BODY_SIZE_MAX);
        assert_eq!(frames.len(), 3);

        let first_len = total % LL_BODY_SIZE_MAX;
        let first = &frames[0];
        assert_eq!(first.ll_header.flags().bits(), LlFlags::FIRST_FRAG);
        assert_eq!(first.ll_header.size() as usize, first_len + 7);
        let first_packet = first.hl_packet.as_ref().unwrap();
        assert_eq!(first_packet.header, Some(rsp_header()));
        assert_eq!(first_packet.data.len(), first_len - HL_HEADER_SIZE);

        let middle = &frames[1];
        assert_eq!(middle.ll_header.flags().bits(), 0);
        assert_eq!(middle.ll_header.size() as usize, LL_BODY_SIZE_MAX + 7);
        assert!(middle.hl_packet.as_ref().unwrap().header.is_none());

        let last = &frames[2];
        assert_eq!(last.ll_header.flags().bits(), LlFlags::LAST_FRAG);
        assert_eq!(last.ll_header.size() as usize, LL_BODY_SIZE_MAX + 7);
    }

    #[test]
    fn test_reassemble_restores_packet() {
        let packet = HlPacket::new(rsp_header(), (0..=255u8).cycle().take(700).collect());
        let frames = Frame::fragment(&packet, LL_BODY_SIZE_MAX);
        let merged = Frame::reassemble(&frames).expect("fragments reassemble");
        assert_eq!(merged, packet);
        assert_eq!(merged.serialize(), packet.serialize());
    }

    #[test]
    fn test_wire_fragments_reassemble() {
        let packet = HlPacket::new(rsp_header(), vec![0x5A; 600]);
        let received: Vec<Frame> = Frame::fragment(&packet, LL_BODY_SIZE_MAX)
            .into_iter()
            .map(|frame| {
                let frame = Frame {
                    ll_header: frame.ll_header.with_crc8_updated(),
                    ..frame
                };
                Frame::deserialize(&frame.serialize()).unwrap().0
            })
            .collect();
        assert_eq!(Frame::reassemble(&received).unwrap(), packet);
    }

    #[test]
    fn test_tiny_first_fragment_is_raw() {
        let packet = HlPacket::new(rsp_header(), vec![0x11; 10]);
        // 14-byte body split by 4: 2 + 4 + 4 + 4
        let frames = Frame::fragment(&packet, 4);
        assert_eq!(frames.len(), 4);
        assert!(frames[0].hl_packet.as_ref().unwrap().header.is_none());
        assert_eq!(Frame::reassemble(&frames).unwrap(), packet);
    }

    #[test]
    fn test_corrupted_body_is_rejected() {
        let frame = Frame::new(HlPacket::new(rsp_header(), b"payload".to_vec()));
        let frame = Frame {
            ll_header: frame.ll_header.with_crc8_updated(),
            ..frame
        };
        let mut bytes = frame.serialize();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            Frame::deserialize(&bytes),
            Err(ProtocolError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_reassemble_empty_is_error() {
        assert!(Frame::reassemble(&[]).is_err());
    }
}
