//! Link layer
//!
//! Owns the serial byte stream. Outgoing frames are stamped with a packet
//! sequence number and sent one at a time, each waiting for its ACK
//! (stop-and-wait, sequence cycling 1, 2, 3 after the initial 0). Incoming
//! frames are acknowledged immediately and handed to a [`FrameHandler`].
//!
//! A frame whose ACK does not arrive within the ack timeout is logged and
//! not retransmitted; detecting the failure is left to the request timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tracing::{debug, error, trace, warn};

use super::codec::FrameCodec;
use super::frame::Frame;
use super::ProtocolError;

const SERIAL: &str = "zboss_core::serial";

/// Receiver of everything the link layer decodes
pub trait FrameHandler: Send + Sync {
    /// A non-ACK frame arrived. Returns whether anything consumed it.
    fn frame_received(&self, frame: Frame) -> Result<bool, ProtocolError>;

    /// The underlying stream closed (`None`) or failed
    fn connection_lost(&self, error: Option<ProtocolError>);
}

#[derive(Default)]
struct RxState {
    buffer: BytesMut,
    codec: FrameCodec,
    /// Sequence number of the last frame we acknowledged
    ack_seq: u8,
}

#[derive(Default)]
struct TxState {
    /// Sequence number stamped on the next outgoing frame
    pack_seq: u8,
    ack_waiter: Option<oneshot::Sender<()>>,
}

/// Stop-and-wait transport over a byte stream
pub struct LinkLayer {
    writer: mpsc::UnboundedSender<Vec<u8>>,
    handler: Mutex<Option<Arc<dyn FrameHandler>>>,
    rx: Mutex<RxState>,
    tx: Mutex<TxState>,
    /// Only one physical frame in flight
    tx_lock: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LinkLayer {
    /// Create a link whose outgoing bytes are delivered to the returned receiver.
    ///
    /// Nothing reads from a stream; feed incoming bytes with
    /// [`LinkLayer::data_received`]. [`LinkLayer::attach`] wires both sides
    /// to a real stream.
    pub fn new(
        handler: Arc<dyn FrameHandler>,
        ack_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (writer, outgoing) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            writer,
            handler: Mutex::new(Some(handler)),
            rx: Mutex::new(RxState::default()),
            tx: Mutex::new(TxState::default()),
            tx_lock: tokio::sync::Mutex::new(()),
            ack_timeout,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        (link, outgoing)
    }

    /// Run the link over `io`, spawning reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<T>(io: T, handler: Arc<dyn FrameHandler>, ack_timeout: Duration) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (link, outgoing) = Self::new(handler, ack_timeout);
        let (reader, writer) = tokio::io::split(io);

        let read_task = tokio::spawn(run_reader(Arc::downgrade(&link), reader));
        let write_task = tokio::spawn(run_writer(Arc::downgrade(&link), writer, outgoing));
        link.tasks.lock().extend([read_task, write_task]);

        link
    }

    /// Whether the link was closed or lost its stream
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sequence number the next outgoing frame will carry
    pub fn packet_seq(&self) -> u8 {
        self.tx.lock().pack_seq
    }

    /// Sequence number of the last frame acknowledged to the peer
    pub fn ack_seq(&self) -> u8 {
        self.rx.lock().ack_seq
    }

    /// Queue raw bytes for the stream
    fn write(&self, data: Vec<u8>) -> Result<(), ProtocolError> {
        trace!(target: SERIAL, "TX: {}", hex::encode(&data));
        self.writer
            .send(data)
            .map_err(|_| ProtocolError::NotConnected)
    }

    /// Send a frame and wait for its ACK.
    ///
    /// An ACK timeout is logged and otherwise ignored.
    pub async fn send(&self, frame: Frame) -> Result<(), ProtocolError> {
        let _in_flight = self.tx_lock.lock().await;

        if self.is_closed() {
            return Err(ProtocolError::NotConnected);
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let frame = {
            let mut tx = self.tx.lock();
            tx.ack_waiter = Some(ack_tx);
            let flags = frame.ll_header.flags().with_packet_seq(tx.pack_seq);
            Frame {
                ll_header: frame.ll_header.with_flags(flags).with_crc8_updated(),
                hl_packet: frame.hl_packet,
            }
        };

        let bytes = frame.serialize();
        self.write(bytes.clone())?;

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ProtocolError::NotConnected),
            Err(_) => {
                debug!(
                    target: SERIAL,
                    "No ACK after {:?} for {}",
                    self.ack_timeout,
                    hex::encode(&bytes)
                );
                self.tx.lock().ack_waiter = None;
                Ok(())
            }
        }
    }

    /// Feed bytes read from the stream
    pub fn data_received(&self, data: &[u8]) {
        let frames = {
            let mut rx = self.rx.lock();
            let RxState { buffer, codec, .. } = &mut *rx;
            buffer.extend_from_slice(data);

            let mut frames = Vec::new();
            loop {
                match codec.decode(buffer) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(err) => {
                        warn!(target: SERIAL, "Frame extraction failed: {}", err);
                        buffer.clear();
                        break;
                    }
                }
            }
            frames
        };

        for frame in frames {
            self.handle_frame(frame);
        }
    }

    fn handle_frame(&self, frame: Frame) {
        trace!(target: SERIAL, "RX: {}", hex::encode(frame.serialize()));
        let flags = frame.ll_header.flags();

        if flags.is_ack() {
            self.ack_received(flags.ack_seq());
            return;
        }

        let ack_seq = flags.packet_seq();
        self.rx.lock().ack_seq = ack_seq;
        if let Err(err) = self.write(Frame::ack(ack_seq, false).serialize()) {
            debug!(target: SERIAL, "Failed to acknowledge frame: {}", err);
        }

        if frame.hl_packet.is_none() {
            return;
        }

        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            let ll_header = frame.ll_header;
            if let Err(err) = handler.frame_received(frame) {
                error!(
                    "Received an error while passing frame {} to API: {}",
                    ll_header, err
                );
            }
        }
    }

    fn ack_received(&self, ack_seq: u8) {
        let mut tx = self.tx.lock();
        if ack_seq != tx.pack_seq {
            trace!(
                target: SERIAL,
                "Ignoring ACK {} while expecting {}",
                ack_seq,
                tx.pack_seq
            );
            return;
        }

        tx.pack_seq = tx.pack_seq % 3 + 1;
        if let Some(waiter) = tx.ack_waiter.take() {
            let _ = waiter.send(());
        }
    }

    fn reset_state(&self) {
        {
            let mut rx = self.rx.lock();
            rx.buffer.clear();
            rx.ack_seq = 0;
        }
        let mut tx = self.tx.lock();
        tx.pack_seq = 0;
        tx.ack_waiter = None;
    }

    /// The stream went away; tell the handler and stop
    pub fn connection_lost(&self, error: Option<ProtocolError>) {
        let handler = self.handler.lock().take();
        self.closed.store(true, Ordering::SeqCst);
        self.reset_state();

        if let Some(handler) = handler {
            handler.connection_lost(error);
        }
    }

    /// Close the link without notifying the handler
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.handler.lock().take();
        self.reset_state();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn run_reader<R>(link: Weak<LinkLayer>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1024];
    loop {
        let result = reader.read(&mut buf).await;
        let Some(link) = link.upgrade() else {
            break;
        };

        match result {
            Ok(0) => {
                debug!(target: SERIAL, "Serial stream closed");
                link.connection_lost(None);
                break;
            }
            Ok(n) => link.data_received(&buf[..n]),
            Err(err) => {
                warn!(target: SERIAL, "Serial read failed: {}", err);
                link.connection_lost(Some(err.into()));
                break;
            }
        }
    }
}

async fn run_writer<W>(
    link: Weak<LinkLayer>,
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(data) = outgoing.recv().await {
        let result = async {
            writer.write_all(&data).await?;
            writer.flush().await
        }
        .await;

        if let Err(err) = result {
            warn!(target: SERIAL, "Serial write failed: {}", err);
            if let Some(link) = link.upgrade() {
                link.connection_lost(Some(err.into()));
            }
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::HlPacket;
    use crate::protocol::header::{ControlType, HlCommonHeader};

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Frame>>,
        lost: AtomicBool,
        fail: bool,
    }

    impl FrameHandler for Recorder {
        fn frame_received(&self, frame: Frame) -> Result<bool, ProtocolError> {
            self.frames.lock().push(frame);
            if self.fail {
                return Err(ProtocolError::CommandDecode("boom".into()));
            }
            Ok(true)
        }

        fn connection_lost(&self, _error: Option<ProtocolError>) {
            self.lost.store(true, Ordering::SeqCst);
        }
    }

    fn incoming(seq: u8, payload: &[u8]) -> Frame {
        let frame = Frame::new(HlPacket::new(
            HlCommonHeader::new(ControlType::Ind, 0x002B),
            payload.to_vec(),
        ));
        let flags = frame.ll_header.flags().with_packet_seq(seq);
        Frame {
            ll_header: frame.ll_header.with_flags(flags).with_crc8_updated(),
            ..frame
        }
    }

    #[test]
    fn test_incoming_frame_is_acked_and_delivered() {
        let recorder = Arc::new(Recorder::default());
        let (link, mut outgoing) = LinkLayer::new(recorder.clone(), Duration::from_secs(1));

        let frame = incoming(2, &[0x01]);
        link.data_received(&frame.serialize());

        assert_eq!(recorder.frames.lock().as_slice(), &[frame]);
        assert_eq!(link.ack_seq(), 2);

        let ack = outgoing.try_recv().expect("ack written");
        let (ack, _) = Frame::deserialize(&ack).unwrap();
        assert!(ack.is_ack());
        assert_eq!(ack.ll_header.flags().ack_seq(), 2);
    }

    #[test]
    fn test_handler_errors_do_not_stop_processing() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let (link, _outgoing) = LinkLayer::new(recorder.clone(), Duration::from_secs(1));

        let mut bytes = incoming(1, &[0x01]).serialize();
        bytes.extend_from_slice(&incoming(2, &[0x02]).serialize());
        link.data_received(&bytes);

        assert_eq!(recorder.frames.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_send_advances_sequence_on_matching_ack() {
        let recorder = Arc::new(Recorder::default());
        let (link, mut outgoing) = LinkLayer::new(recorder, Duration::from_secs(1));

        let frame = Frame::new(HlPacket::new(
            HlCommonHeader::new(ControlType::Req, 0x0001),
            vec![0x01],
        ));

        let mut expected_seq = 0;
        for _ in 0..5 {
            let sender = {
                let link = link.clone();
                let frame = frame.clone();
                tokio::spawn(async move { link.send(frame).await })
            };

            let sent = outgoing.recv().await.expect("frame written");
            let (sent, _) = Frame::deserialize(&sent).unwrap();
            assert_eq!(sent.ll_header.flags().packet_seq(), expected_seq);

            // A stale ACK is ignored
            link.data_received(&Frame::ack((expected_seq + 1) % 4, false).serialize());
            assert_eq!(link.packet_seq(), expected_seq);

            link.data_received(&Frame::ack(expected_seq, false).serialize());
            sender.await.unwrap().unwrap();

            expected_seq = expected_seq % 3 + 1;
            assert_eq!(link.packet_seq(), expected_seq);
        }
    }

    #[tokio::test]
    async fn test_ack_timeout_is_not_an_error() {
        let recorder = Arc::new(Recorder::default());
        let (link, mut outgoing) = LinkLayer::new(recorder, Duration::from_millis(20));

        let frame = Frame::new(HlPacket::new(
            HlCommonHeader::new(ControlType::Req, 0x0001),
            vec![],
        ));
        link.send(frame).await.expect("timeout is swallowed");

        // Written once, never retransmitted, sequence unchanged
        assert!(outgoing.try_recv().is_ok());
        assert!(outgoing.try_recv().is_err());
        assert_eq!(link.packet_seq(), 0);
    }

    #[tokio::test]
    async fn test_closed_link_rejects_sends() {
        let recorder = Arc::new(Recorder::default());
        let (link, _outgoing) = LinkLayer::new(recorder.clone(), Duration::from_millis(20));
        link.close();

        let frame = Frame::new(HlPacket::new(
            HlCommonHeader::new(ControlType::Req, 0x0001),
            vec![],
        ));
        assert!(matches!(
            link.send(frame).await,
            Err(ProtocolError::NotConnected)
        ));
        assert!(!recorder.lost.load(Ordering::SeqCst));
    }

    #[test]
    fn test_connection_lost_notifies_handler_once() {
        let recorder = Arc::new(Recorder::default());
        let (link, _outgoing) = LinkLayer::new(recorder.clone(), Duration::from_secs(1));
        link.connection_lost(None);
        assert!(recorder.lost.load(Ordering::SeqCst));
        assert!(link.is_closed());

        // After closing, frames are no longer delivered
        link.data_received(&incoming(1, &[0x01]).serialize());
        assert!(recorder.frames.lock().is_empty());
    }
}
