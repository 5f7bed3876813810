//! ZBOSS NCP serial protocol
//!
//! Three layers, bottom up:
//! - frame codec: low-level header with CRC8, high-level packet with CRC16,
//!   fragmentation and reassembly
//! - link layer: stop-and-wait acknowledgement over the raw byte stream
//! - command dispatch (see [`crate::connection`] and [`crate::listener`])

pub mod checksum;
pub mod codec;
mod error;
pub mod frame;
pub mod header;
pub mod link;
pub mod serial;

pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use frame::{Frame, HlPacket};
pub use header::{ControlType, HlCommonHeader, LlFlags, LlHeader};
pub use link::{FrameHandler, LinkLayer};
pub use serial::{list_ports, open_port, PortInfo};

/// Frame signature, `DE AD` on the wire
pub const SIGNATURE: u16 = 0xADDE;

/// Frame type of ZBOSS NCP API high-level frames
pub const FRAME_TYPE_NCP_API_HL: u8 = 0x06;

/// Size of the low-level header in bytes
pub const LL_HEADER_SIZE: usize = 7;

/// Maximum body carried by one physical frame
pub const LL_BODY_SIZE_MAX: usize = 247;

/// Default baud rate for NCP communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// How long the link layer waits for each frame's ACK, in milliseconds
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 1000;

/// Default end-to-end request timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
