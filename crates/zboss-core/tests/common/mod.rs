//! Fake NCP driving a `Connection` over an in-memory stream
#![allow(dead_code)]

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::Decoder;
use tracing_subscriber::EnvFilter;

use zboss_core::commands::{
    Command, CommandBuilder, CommandCatalog, CommandDef, FieldType, Param,
};
use zboss_core::commands::ncp_config::GET_MODULE_VERSION_RSP;
use zboss_core::config::ConnectionConfig;
use zboss_core::connection::Connection;
use zboss_core::protocol::{
    ControlType, Frame, FrameCodec, HlCommonHeader, HlPacket, LL_BODY_SIZE_MAX,
};

/// Command ID of the test-only bulk transfer command
pub const BULK_ID: u16 = 0x0F00;

pub static BULK_RSP: CommandDef = CommandDef {
    name: "Test.Bulk.Rsp",
    header: HlCommonHeader::new(ControlType::Rsp, BULK_ID),
    schema: &[
        Param::new("TSN", FieldType::U8),
        Param::new("StatusCat", FieldType::U8),
        Param::new("StatusCode", FieldType::U8),
        Param::new("Payload", FieldType::Remaining),
    ],
    blocking: false,
    response: None,
};

pub static BULK_REQ: CommandDef = CommandDef {
    name: "Test.Bulk.Req",
    header: HlCommonHeader::new(ControlType::Req, BULK_ID),
    schema: &[
        Param::new("TSN", FieldType::U8),
        Param::new("Payload", FieldType::Remaining),
    ],
    blocking: false,
    response: Some(&BULK_RSP),
};

/// Short timeouts so failure paths finish quickly
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        request_timeout_ms: 300,
        ack_timeout_ms: 100,
        ..ConnectionConfig::default()
    }
}

/// Connection attached to a fake NCP
pub fn connected() -> (Connection, FakeNcp) {
    connected_with(test_config())
}

/// Log to the test output; filter with `RUST_LOG=zboss_core::serial=trace`
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn connected_with(config: ConnectionConfig) -> (Connection, FakeNcp) {
    init_logging();
    let mut catalog = CommandCatalog::standard();
    catalog.register(&BULK_REQ);

    let (host, ncp) = tokio::io::duplex(64 * 1024);
    let conn = Connection::with_catalog(config, catalog);
    conn.attach(host);
    (conn, FakeNcp::new(ncp))
}

/// The NCP side of the serial link
pub struct FakeNcp {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    codec: FrameCodec,
    buffer: BytesMut,
    seq: u8,
    /// ACKs received from the host, in order
    pub acks: Vec<u8>,
}

impl FakeNcp {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            codec: FrameCodec::new(),
            buffer: BytesMut::new(),
            seq: 0,
            acks: Vec::new(),
        }
    }

    /// Next frame of any kind sent by the host
    pub async fn next_raw_frame(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer).expect("decoder never fails") {
                return frame;
            }
            let n = self
                .reader
                .read_buf(&mut self.buffer)
                .await
                .expect("read from host");
            assert!(n > 0, "host closed the stream");
        }
    }

    /// Next data frame sent by the host, acknowledged like a real NCP would
    pub async fn recv_frame(&mut self) -> Frame {
        loop {
            let frame = self.next_raw_frame().await;
            if frame.is_ack() {
                self.acks.push(frame.ll_header.flags().ack_seq());
                continue;
            }
            let seq = frame.ll_header.flags().packet_seq();
            self.write_raw(&Frame::ack(seq, false).serialize()).await;
            return frame;
        }
    }

    /// Like [`FakeNcp::recv_frame`] but without acknowledging
    pub async fn recv_frame_no_ack(&mut self) -> Frame {
        loop {
            let frame = self.next_raw_frame().await;
            if !frame.is_ack() {
                return frame;
            }
            self.acks.push(frame.ll_header.flags().ack_seq());
        }
    }

    /// Next complete packet from the host, reassembling fragments
    pub async fn recv_packet(&mut self) -> HlPacket {
        let mut fragments = Vec::new();
        loop {
            let frame = self.recv_frame().await;
            let last = frame.ll_header.flags().is_last_frag();
            fragments.push(frame);
            if last {
                return Frame::reassemble(&fragments).expect("host fragments reassemble");
            }
        }
    }

    /// Decode the next request using `def`
    pub async fn recv_request(&mut self, def: &'static CommandDef) -> Command {
        let packet = self.recv_packet().await;
        Command::from_packet(def, &packet).expect("valid request")
    }

    /// Stamp our sequence number and CRC8 on a frame
    pub fn stamp(&mut self, frame: Frame) -> Frame {
        let flags = frame.ll_header.flags().with_packet_seq(self.seq);
        self.seq = self.seq % 3 + 1;
        Frame {
            ll_header: frame.ll_header.with_flags(flags).with_crc8_updated(),
            hl_packet: frame.hl_packet,
        }
    }

    /// Wire bytes of `packet`, fragmented at `max_body`
    pub fn packet_bytes(&mut self, packet: &HlPacket, max_body: usize) -> Vec<Vec<u8>> {
        Frame::fragment(packet, max_body)
            .into_iter()
            .map(|frame| self.stamp(frame).serialize())
            .collect()
    }

    pub async fn send_packet(&mut self, packet: &HlPacket) {
        for bytes in self.packet_bytes(packet, LL_BODY_SIZE_MAX) {
            self.write_raw(&bytes).await;
        }
    }

    pub async fn send_command(&mut self, command: &Command) {
        let packet = command.to_packet().expect("complete command");
        self.send_packet(&packet).await;
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write to host");
        self.writer.flush().await.expect("flush to host");
    }

    /// Answer the next request with `response`
    pub async fn reply(&mut self, response: &Command) {
        self.recv_packet().await;
        self.send_command(response).await;
    }

    /// Wait until the host has acknowledged `count` frames in total
    pub async fn wait_for_acks(&mut self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.acks.len() < count {
                let frame = self.next_raw_frame().await;
                if frame.is_ack() {
                    self.acks.push(frame.ll_header.flags().ack_seq());
                }
            }
        })
        .await
        .expect("host acknowledged in time");
    }

    /// Drop the stream, as a real NCP does when it resets
    pub fn hang_up(self) {}
}

/// Successful `GetModuleVersion` response
pub fn version_rsp(tsn: u8) -> Command {
    CommandBuilder::new(&GET_MODULE_VERSION_RSP)
        .param("TSN", tsn)
        .param("StatusCat", 0u8)
        .param("StatusCode", 0u8)
        .param("FWVersion", 0x0102_0304u32)
        .param("StackVersion", 0x0300_0001u32)
        .param("ProtocolVersion", 0x0000_0102u32)
        .build()
        .expect("valid response")
}

/// Response packet carrying only a status, as the NCP sends on failure
pub fn status_only_packet(def: &CommandDef, tsn: u8, status: u8) -> HlPacket {
    HlPacket::new(def.header, vec![tsn, 0x01, status])
}
