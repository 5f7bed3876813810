//! Low-level and high-level headers
//!
//! Low-level header (7 bytes, little-endian):
//! - 2 bytes: signature (`0xADDE`)
//! - 2 bytes: size (body length + 5)
//! - 1 byte: frame type (`0x06`)
//! - 1 byte: flags
//! - 1 byte: CRC8 over size, frame type and flags
//!
//! High-level common header (4 bytes):
//! - 1 byte: protocol version
//! - 1 byte: control type (request / response / indication)
//! - 2 bytes: command ID (little-endian)

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::checksum::crc8;
use super::{ProtocolError, FRAME_TYPE_NCP_API_HL, LL_HEADER_SIZE, SIGNATURE};

/// Size of the high-level common header in bytes
pub const HL_HEADER_SIZE: usize = 4;

/// Flags byte of the low-level header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LlFlags(u8);

impl LlFlags {
    /// Frame is an acknowledgement
    pub const IS_ACK: u8 = 0x01;
    /// Frame is a retransmission
    pub const RETRANSMIT: u8 = 0x02;
    /// Sequence number of this frame (bits 2-3)
    pub const PACKET_SEQ: u8 = 0x0C;
    /// Sequence number being acknowledged (bits 4-5)
    pub const ACK_SEQ: u8 = 0x30;
    /// First fragment of a packet
    pub const FIRST_FRAG: u8 = 0x40;
    /// Last fragment of a packet
    pub const LAST_FRAG: u8 = 0x80;

    /// Wrap a raw flags byte
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flags byte
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Flags of an unfragmented packet
    pub const fn single() -> Self {
        Self(Self::FIRST_FRAG | Self::LAST_FRAG)
    }

    /// Frame is an acknowledgement
    pub fn is_ack(self) -> bool {
        self.0 & Self::IS_ACK != 0
    }

    /// Frame is a retransmission
    pub fn is_retransmit(self) -> bool {
        self.0 & Self::RETRANSMIT != 0
    }

    /// First fragment, or an unfragmented packet
    pub fn is_first_frag(self) -> bool {
        self.0 & Self::FIRST_FRAG != 0
    }

    /// Last fragment, or an unfragmented packet
    pub fn is_last_frag(self) -> bool {
        self.0 & Self::LAST_FRAG != 0
    }

    /// Sequence number of this frame
    pub fn packet_seq(self) -> u8 {
        (self.0 & Self::PACKET_SEQ) >> 2
    }

    /// Sequence number this ACK acknowledges
    pub fn ack_seq(self) -> u8 {
        (self.0 & Self::ACK_SEQ) >> 4
    }

    /// Replace the packet sequence number (only the low two bits are kept)
    pub fn with_packet_seq(self, seq: u8) -> Self {
        Self((self.0 & !Self::PACKET_SEQ) | ((seq << 2) & Self::PACKET_SEQ))
    }

    /// Replace the acknowledged sequence number (only the low two bits are kept)
    pub fn with_ack_seq(self, seq: u8) -> Self {
        Self((self.0 & !Self::ACK_SEQ) | ((seq << 4) & Self::ACK_SEQ))
    }

    /// Set the given flag bits
    pub fn with(self, bits: u8) -> Self {
        Self(self.0 | bits)
    }
}

impl fmt::Display for LlFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Low-level (per physical frame) header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LlHeader {
    signature: u16,
    size: u16,
    frame_type: u8,
    flags: LlFlags,
    crc8: u8,
}

impl LlHeader {
    /// Create a header for a frame carrying `body_len` bytes after the header.
    ///
    /// The CRC8 is left at zero; call [`LlHeader::with_crc8_updated`] once the
    /// sequence flags are final.
    pub fn new(body_len: usize, flags: LlFlags) -> Self {
        debug_assert!(body_len <= u16::MAX as usize - 5, "frame body too large");
        Self {
            signature: SIGNATURE,
            size: (body_len + 5) as u16,
            frame_type: FRAME_TYPE_NCP_API_HL,
            flags,
            crc8: 0,
        }
    }

    /// Frame signature
    pub fn signature(&self) -> u16 {
        self.signature
    }

    /// Size field: body length + 5
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Body length implied by the size field
    pub fn body_len(&self) -> usize {
        (self.size as usize).saturating_sub(5)
    }

    /// Frame type
    pub fn frame_type(&self) -> u8 {
        self.frame_type
    }

    /// Flags byte
    pub fn flags(&self) -> LlFlags {
        self.flags
    }

    /// CRC8 as carried; see [`LlHeader::expected_crc8`]
    pub fn crc8(&self) -> u8 {
        self.crc8
    }

    /// Replace the signature
    pub fn with_signature(mut self, signature: u16) -> Self {
        self.signature = signature;
        self
    }

    /// Replace the size field
    pub fn with_size(mut self, size: u16) -> Self {
        self.size = size;
        self
    }

    /// Replace the frame type
    pub fn with_frame_type(mut self, frame_type: u8) -> Self {
        self.frame_type = frame_type;
        self
    }

    /// Replace the flags; the CRC8 is not updated
    pub fn with_flags(mut self, flags: LlFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Replace the CRC8
    pub fn with_crc8(mut self, crc8: u8) -> Self {
        self.crc8 = crc8;
        self
    }

    /// Recompute the CRC8 from the current size, type and flags
    pub fn with_crc8_updated(self) -> Self {
        let crc = self.expected_crc8();
        self.with_crc8(crc)
    }

    /// CRC8 the current fields should carry
    pub fn expected_crc8(&self) -> u8 {
        let bytes = self.to_bytes();
        crc8(&bytes[2..6])
    }

    /// Serialize to the 7-byte wire form
    pub fn to_bytes(&self) -> [u8; LL_HEADER_SIZE] {
        let mut out = [0u8; LL_HEADER_SIZE];
        LittleEndian::write_u16(&mut out[0..2], self.signature);
        LittleEndian::write_u16(&mut out[2..4], self.size);
        out[4] = self.frame_type;
        out[5] = self.flags.bits();
        out[6] = self.crc8;
        out
    }

    /// Parse a header, checking the signature and CRC8.
    ///
    /// The frame type is not checked here.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < LL_HEADER_SIZE {
            return Err(ProtocolError::invalid_frame(format!(
                "truncated low-level header: {} bytes",
                data.len()
            )));
        }

        let header = Self {
            signature: LittleEndian::read_u16(&data[0..2]),
            size: LittleEndian::read_u16(&data[2..4]),
            frame_type: data[4],
            flags: LlFlags::from_bits(data[5]),
            crc8: data[6],
        };

        if header.signature != SIGNATURE {
            return Err(ProtocolError::invalid_frame(format!(
                "expected frame to start with signature 0x{:04X}, got 0x{:04X}",
                SIGNATURE, header.signature
            )));
        }

        let expected = header.expected_crc8();
        if expected != header.crc8 {
            return Err(ProtocolError::invalid_frame(format!(
                "invalid frame checksum for {}: expected 0x{:02X}, got 0x{:02X}",
                header, header.crc8, expected
            )));
        }

        if header.size < 5 {
            return Err(ProtocolError::invalid_frame(format!(
                "size field {} is below the header minimum",
                header.size
            )));
        }

        Ok(header)
    }
}

impl fmt::Display for LlHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LlHeader(signature=0x{:04X}, size=0x{:04X}, frame_type=0x{:02X}, flags={}, crc8=0x{:02X})",
            self.signature, self.size, self.frame_type, self.flags, self.crc8
        )
    }
}

/// Kind of a high-level command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlType {
    /// Request sent by the host
    Req,
    /// Response to a request
    Rsp,
    /// Unsolicited indication from the NCP
    Ind,
}

impl ControlType {
    /// Wire value
    pub const fn as_u8(self) -> u8 {
        match self {
            ControlType::Req => 0x00,
            ControlType::Rsp => 0x01,
            ControlType::Ind => 0x02,
        }
    }

    /// Parse a wire value
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(ControlType::Req),
            0x01 => Ok(ControlType::Rsp),
            0x02 => Ok(ControlType::Ind),
            other => Err(ProtocolError::invalid_frame(format!(
                "unknown control type 0x{:02X}",
                other
            ))),
        }
    }
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlType::Req => "REQ",
            ControlType::Rsp => "RSP",
            ControlType::Ind => "IND",
        };
        f.write_str(name)
    }
}

/// High-level common header; `(control_type, command_id)` is the dispatch key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HlCommonHeader {
    /// Protocol version, ignored when dispatching
    pub version: u8,
    /// Request, response or indication
    pub control_type: ControlType,
    /// Command ID within its category
    pub command_id: u16,
}

impl HlCommonHeader {
    /// Header with protocol version 0
    pub const fn new(control_type: ControlType, command_id: u16) -> Self {
        Self {
            version: 0,
            control_type,
            command_id,
        }
    }

    /// Same header with another protocol version
    pub const fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Same command ID with another control type
    pub const fn with_control_type(mut self, control_type: ControlType) -> Self {
        self.control_type = control_type;
        self
    }

    /// Serialize to the 4-byte wire form
    pub fn to_bytes(&self) -> [u8; HL_HEADER_SIZE] {
        let mut out = [0u8; HL_HEADER_SIZE];
        out[0] = self.version;
        out[1] = self.control_type.as_u8();
        LittleEndian::write_u16(&mut out[2..4], self.command_id);
        out
    }

    /// Parse the 4-byte wire form
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HL_HEADER_SIZE {
            return Err(ProtocolError::invalid_frame(format!(
                "truncated high-level header: {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            version: data[0],
            control_type: ControlType::from_u8(data[1])?,
            command_id: LittleEndian::read_u16(&data[2..4]),
        })
    }
}

impl fmt::Display for HlCommonHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HlCommonHeader(version=0x{:02X}, type={}, command_id=0x{:04X})",
            self.version, self.control_type, self.command_id
        )
    }
}
