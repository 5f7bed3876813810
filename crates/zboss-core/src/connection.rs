//! Connection management
//!
//! A [`Connection`] is one session with an NCP. It owns the link layer, the
//! listener registry and the reassembly buffer, and turns requests into
//! correlated, timed round trips.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::debug;

use crate::commands::ncp_config::{ResetOption, GET_MODULE_VERSION, NCP_MODULE_RESET};
use crate::commands::{Command, CommandBuilder, CommandCatalog};
use crate::config::ConnectionConfig;
use crate::listener::{
    IndicationCallback, IndicationHandle, ListenerId, Registry, ResponseFuture, SharedRegistry,
};
use crate::protocol::{
    open_port, ControlType, Frame, FrameHandler, HlPacket, LinkLayer, ProtocolError,
    LL_BODY_SIZE_MAX,
};

/// How long `reset` waits for the NCP to drop the serial connection
pub const EXPECTED_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnection attempts after a reset
pub const MAX_RESET_RECONNECT_ATTEMPTS: usize = 5;

/// Delay before each reconnection attempt
pub const RESET_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Opening the serial port
    Connecting,
    /// Connected and ready
    Connected,
    /// Last connection attempt failed
    Error,
}

/// Versions reported by `GetModuleVersion`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NcpVersion {
    /// Firmware version
    pub firmware: u32,
    /// ZBOSS stack version
    pub stack: u32,
    /// NCP protocol version
    pub protocol: u32,
}

impl NcpVersion {
    /// `major.minor.revision.commit`, one byte each, most significant first
    pub fn dotted(version: u32) -> String {
        let [major, minor, revision, commit] = version.to_be_bytes();
        format!("{}.{}.{}.{}", major, minor, revision, commit)
    }
}

impl fmt::Display for NcpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "firmware {}, stack {}, protocol {}",
            Self::dotted(self.firmware),
            Self::dotted(self.stack),
            Self::dotted(self.protocol)
        )
    }
}

type LostHook = Arc<dyn Fn(Option<&ProtocolError>) + Send + Sync>;

/// The attached link, numbered so a replaced link's late events can be told apart
struct ActiveLink {
    generation: u64,
    link: Arc<LinkLayer>,
}

struct Inner {
    config: ConnectionConfig,
    catalog: CommandCatalog,
    registry: SharedRegistry,
    link: Mutex<Option<ActiveLink>>,
    generation: AtomicU64,
    state: Mutex<ConnectionState>,
    rx_fragments: Mutex<Vec<Frame>>,
    /// Serializes requests whose definition is marked blocking
    blocking_lock: tokio::sync::Mutex<()>,
    /// Held while a reset reconnects the port
    reset_lock: tokio::sync::Mutex<()>,
    disconnected: Notify,
    lost_hook: Mutex<Option<LostHook>>,
    tsn: AtomicU8,
}

impl Inner {
    fn link(&self) -> Result<Arc<LinkLayer>, ProtocolError> {
        self.link
            .lock()
            .as_ref()
            .map(|active| active.link.clone())
            .ok_or(ProtocolError::NotConnected)
    }

    fn reset_in_progress(&self) -> bool {
        self.reset_lock.try_lock().is_err()
    }

    /// Merge fragments; returns the packet once the last one arrived
    fn collect_fragment(&self, frame: Frame) -> Result<Option<HlPacket>, ProtocolError> {
        let flags = frame.ll_header.flags();
        let mut fragments = self.rx_fragments.lock();

        if flags.is_first_frag() && !fragments.is_empty() {
            debug!("Dropping {} fragments of an incomplete packet", fragments.len());
            fragments.clear();
        }

        if !flags.is_last_frag() {
            debug!("Received fragment: {}", frame);
            fragments.push(frame);
            return Ok(None);
        }

        if fragments.is_empty() {
            return frame
                .hl_packet
                .map(Some)
                .ok_or_else(|| ProtocolError::invalid_frame("data frame without packet"));
        }

        fragments.push(frame);
        let merged = Frame::reassemble(&fragments);
        fragments.clear();
        merged.map(Some)
    }

    fn frame_received(&self, frame: Frame) -> Result<bool, ProtocolError> {
        let Some(packet) = self.collect_fragment(frame)? else {
            return Ok(false);
        };

        let header = packet
            .header
            .ok_or_else(|| ProtocolError::invalid_frame("reassembled packet without header"))?;
        let Some(def) = self.catalog.lookup(&header) else {
            debug!("Received an unknown frame: {}", packet);
            return Ok(false);
        };

        let command = Command::from_packet(def, &packet)?;
        debug!("Received command: {}", command);

        // Callbacks run after the registry lock is released
        let outcome = self.registry.lock().dispatch(&command);
        for callback in &outcome.callbacks {
            callback.invoke(&command);
        }

        if !outcome.matched {
            debug!("Command was not handled: {}", command);
        }
        Ok(outcome.matched)
    }

    fn connection_lost(&self, generation: u64, error: Option<ProtocolError>) {
        {
            let mut link = self.link.lock();
            if link.as_ref().map(|active| active.generation) != Some(generation) {
                debug!("Ignoring loss of replaced link {}", generation);
                return;
            }
            link.take();
        }

        match &error {
            Some(err) => debug!("Connection lost: {}", err),
            None => debug!("Connection closed by peer"),
        }

        self.rx_fragments.lock().clear();
        *self.state.lock() = ConnectionState::Disconnected;
        self.disconnected.notify_waiters();

        if self.reset_in_progress() {
            return;
        }
        let hook = self.lost_hook.lock().clone();
        if let Some(hook) = hook {
            hook(error.as_ref());
        }
    }
}

/// Link-layer callbacks of one attached link; weak so the link does not keep
/// the session alive
struct SessionHandler {
    inner: Weak<Inner>,
    generation: u64,
}

impl FrameHandler for SessionHandler {
    fn frame_received(&self, frame: Frame) -> Result<bool, ProtocolError> {
        match self.inner.upgrade() {
            Some(inner) => inner.frame_received(frame),
            None => Ok(false),
        }
    }

    fn connection_lost(&self, error: Option<ProtocolError>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.connection_lost(self.generation, error);
        }
    }
}

/// Session with one NCP
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a connection using the built-in command catalog
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_catalog(config, CommandCatalog::standard())
    }

    /// Create a connection that decodes with `catalog`
    pub fn with_catalog(config: ConnectionConfig, catalog: CommandCatalog) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                catalog,
                registry: Arc::new(Mutex::new(Registry::new())),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                state: Mutex::new(ConnectionState::Disconnected),
                rx_fragments: Mutex::new(Vec::new()),
                blocking_lock: tokio::sync::Mutex::new(()),
                reset_lock: tokio::sync::Mutex::new(()),
                disconnected: Notify::new(),
                lost_hook: Mutex::new(None),
                tsn: AtomicU8::new(0),
            }),
        }
    }

    /// Settings this connection was created with
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Definitions used to decode received packets
    pub fn catalog(&self) -> &CommandCatalog {
        &self.inner.catalog
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Whether a transport is attached
    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    /// Number of registered listeners of either kind
    pub fn listener_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Next transaction sequence number (wraps at 255)
    pub fn next_tsn(&self) -> u8 {
        self.inner.tsn.fetch_add(1, Ordering::Relaxed)
    }

    /// Called when the transport goes away outside of a reset
    pub fn on_connection_lost<F>(&self, hook: F)
    where
        F: Fn(Option<&ProtocolError>) + Send + Sync + 'static,
    {
        *self.inner.lost_hook.lock() = Some(Arc::new(hook));
    }

    /// Open the configured serial port
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        if self.is_connected() {
            return Err(ProtocolError::ConnectionFailed(
                "already connected".to_string(),
            ));
        }

        *self.inner.state.lock() = ConnectionState::Connecting;
        match open_port(&self.inner.config) {
            Ok(port) => {
                self.attach(port);
                debug!(
                    "Connected to {} at {} baud",
                    self.inner.config.port_name, self.inner.config.baud_rate
                );
                Ok(())
            }
            Err(err) => {
                debug!(
                    "Connection to {} failed, cleaning up",
                    self.inner.config.port_name
                );
                self.disconnect();
                *self.inner.state.lock() = ConnectionState::Error;
                Err(err)
            }
        }
    }

    /// Run the session over an already open stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<T>(&self, io: T)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handler = Arc::new(SessionHandler {
            inner: Arc::downgrade(&self.inner),
            generation,
        });
        let link = LinkLayer::attach(io, handler, self.inner.config.ack_timeout());

        let old = self
            .inner
            .link
            .lock()
            .replace(ActiveLink { generation, link });
        if let Some(old) = old {
            old.link.close();
        }
        self.inner.rx_fragments.lock().clear();
        *self.inner.state.lock() = ConnectionState::Connected;
    }

    /// Close the transport and cancel every listener.
    ///
    /// During a reset only the transport is closed.
    pub fn disconnect(&self) {
        if !self.inner.reset_in_progress() {
            self.inner.lost_hook.lock().take();
            self.inner.registry.lock().clear();
        }

        let active = self.inner.link.lock().take();
        if let Some(active) = active {
            active.link.close();
        }
        self.inner.rx_fragments.lock().clear();
        *self.inner.state.lock() = ConnectionState::Disconnected;
    }

    /// Send a request and wait for its response with the configured timeout
    pub async fn request(&self, command: &Command) -> Result<Command, ProtocolError> {
        self.request_with_timeout(command, self.inner.config.request_timeout())
            .await
    }

    /// Send a request and wait up to `timeout` for any response of its type.
    ///
    /// The response is matched on its header only, so the TSN is not
    /// checked. Requests marked blocking are serialized with each other.
    pub async fn request_with_timeout(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<Command, ProtocolError> {
        if command.kind() != ControlType::Req {
            return Err(ProtocolError::InvalidRequest(format!(
                "cannot send a command that isn't a request: {}",
                command
            )));
        }
        let pattern = command.response_pattern()?;
        let link = self.inner.link()?;

        debug!("Sending request: {}", command);
        let fragments = Frame::fragment(&command.to_packet()?, LL_BODY_SIZE_MAX);
        let mut response = self.wait_for_response(pattern);

        let _blocking = if command.is_blocking() {
            Some(self.inner.blocking_lock.lock().await)
        } else {
            None
        };

        for fragment in fragments {
            link.send(fragment).await?;
        }

        match tokio::time::timeout(timeout, &mut response).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Timeout after {:?}: {}", timeout, command);
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Future resolving with the first command matching `pattern`
    pub fn wait_for_response(&self, pattern: Command) -> ResponseFuture {
        ResponseFuture::register(&self.inner.registry, vec![pattern])
    }

    /// Future resolving with the first command matching any of `patterns`
    pub fn wait_for_responses(&self, patterns: Vec<Command>) -> Result<ResponseFuture, ProtocolError> {
        if patterns.is_empty() {
            return Err(ProtocolError::InvalidRequest(
                "at least one response pattern is required".to_string(),
            ));
        }
        Ok(ResponseFuture::register(&self.inner.registry, patterns))
    }

    /// Run `callback` for every command matching `pattern` until cancelled
    pub fn register_indication_listener(
        &self,
        pattern: Command,
        callback: IndicationCallback,
    ) -> IndicationHandle {
        IndicationHandle::register(&self.inner.registry, vec![pattern], callback)
    }

    /// Run `callback` for every command matching any of `patterns` until cancelled
    pub fn register_indication_listeners(
        &self,
        patterns: Vec<Command>,
        callback: IndicationCallback,
    ) -> Result<IndicationHandle, ProtocolError> {
        if patterns.is_empty() {
            return Err(ProtocolError::InvalidRequest(
                "at least one indication pattern is required".to_string(),
            ));
        }
        Ok(IndicationHandle::register(
            &self.inner.registry,
            patterns,
            callback,
        ))
    }

    /// Remove a listener of either kind; a pending future resolves to `Cancelled`
    pub fn remove_listener(&self, id: ListenerId) {
        self.inner.registry.lock().unregister(id);
    }

    /// Query firmware, stack and protocol versions; `None` if the NCP reports failure
    pub async fn version(&self) -> Result<Option<NcpVersion>, ProtocolError> {
        let req = CommandBuilder::new(&GET_MODULE_VERSION)
            .param("TSN", self.next_tsn())
            .build()?;
        let rsp = self.request(&req).await?;

        if rsp.get_uint("StatusCode").unwrap_or(0) != 0 {
            return Ok(None);
        }

        let field = |name: &str| -> Result<u32, ProtocolError> {
            rsp.get_uint(name)
                .map(|v| v as u32)
                .ok_or_else(|| ProtocolError::CommandDecode(format!("response lacks {}", name)))
        };
        Ok(Some(NcpVersion {
            firmware: field("FWVersion")?,
            stack: field("StackVersion")?,
            protocol: field("ProtocolVersion")?,
        }))
    }

    /// Reset the NCP.
    ///
    /// With `wait_for_reset`, waits for the NCP to drop the serial connection
    /// and reconnects. If it never disconnects the NCP sits behind an external
    /// UART and there is nothing to reconnect.
    pub async fn reset(&self, option: ResetOption, wait_for_reset: bool) -> Result<(), ProtocolError> {
        debug!("Sending a reset: {:?}", option);
        let req = CommandBuilder::new(&NCP_MODULE_RESET)
            .param("TSN", self.next_tsn())
            .param("Option", option as u8)
            .build()?;

        let _resetting = self.inner.reset_lock.lock().await;

        let disconnected = self.inner.disconnected.notified();
        tokio::pin!(disconnected);
        disconnected.as_mut().enable();

        self.inner.link()?.send(req.to_frame()?).await?;

        if !wait_for_reset {
            return Ok(());
        }

        debug!("Waiting for radio to disconnect");
        if tokio::time::timeout(EXPECTED_DISCONNECT_TIMEOUT, disconnected)
            .await
            .is_err()
        {
            debug!("Radio did not disconnect, must be using external UART");
            return Ok(());
        }

        debug!("Radio has disconnected, reconnecting");
        let mut attempt = 1;
        loop {
            tokio::time::sleep(RESET_RECONNECT_DELAY).await;
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= MAX_RESET_RECONNECT_ATTEMPTS => return Err(err),
                Err(err) => debug!("Failed to reconnect, retrying: {}", err),
            }
            attempt += 1;
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("port_name", &self.inner.config.port_name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state() {
        let conn = Connection::new(ConnectionConfig::default());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_connected());
        assert_eq!(conn.listener_count(), 0);
    }

    #[test]
    fn test_version_formatting() {
        assert_eq!(NcpVersion::dotted(0x0102_0304), "1.2.3.4");
        let version = NcpVersion {
            firmware: 0x0200_0A01,
            stack: 0,
            protocol: 0xFF00_0001,
        };
        assert_eq!(
            version.to_string(),
            "firmware 2.0.10.1, stack 0.0.0.0, protocol 255.0.0.1"
        );
    }

    #[test]
    fn test_tsn_wraps() {
        let conn = Connection::new(ConnectionConfig::default());
        for expected in 0..=255u8 {
            assert_eq!(conn.next_tsn(), expected);
        }
        assert_eq!(conn.next_tsn(), 0);
    }

    #[tokio::test]
    async fn test_request_rejects_non_requests() {
        use crate::commands::ncp_config::GET_MODULE_VERSION_RSP;

        let conn = Connection::new(ConnectionConfig::default());
        let rsp = CommandBuilder::new(&GET_MODULE_VERSION_RSP)
            .param("TSN", 1u8)
            .param("StatusCat", 0u8)
            .param("StatusCode", 0u8)
            .param("FWVersion", 0u32)
            .param("StackVersion", 0u32)
            .param("ProtocolVersion", 0u32)
            .build()
            .unwrap();
        assert!(matches!(
            conn.request(&rsp).await,
            Err(ProtocolError::InvalidRequest(_))
        ));
        assert_eq!(conn.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_request_without_transport_fails_fast() {
        let conn = Connection::new(ConnectionConfig::default());
        let req = CommandBuilder::new(&GET_MODULE_VERSION)
            .param("TSN", 1u8)
            .build()
            .unwrap();
        assert!(matches!(
            conn.request(&req).await,
            Err(ProtocolError::NotConnected)
        ));
        assert_eq!(conn.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_without_port_reports_error_state() {
        let conn = Connection::new(ConnectionConfig::default());
        assert!(conn.connect().await.is_err());
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_loss_of_replaced_link_is_ignored() {
        use std::sync::atomic::AtomicUsize;

        let conn = Connection::new(ConnectionConfig::default());
        let lost = Arc::new(AtomicUsize::new(0));
        {
            let lost = lost.clone();
            conn.on_connection_lost(move |_| {
                lost.fetch_add(1, Ordering::SeqCst);
            });
        }
        let current = |conn: &Connection| {
            conn.inner
                .link
                .lock()
                .as_ref()
                .map(|active| active.generation)
                .unwrap()
        };

        let (first, _first_peer) = tokio::io::duplex(64);
        conn.attach(first);
        let replaced = SessionHandler {
            inner: Arc::downgrade(&conn.inner),
            generation: current(&conn),
        };

        let (second, _second_peer) = tokio::io::duplex(64);
        conn.attach(second);
        let attached = SessionHandler {
            inner: Arc::downgrade(&conn.inner),
            generation: current(&conn),
        };

        // The first link reports its loss after the second was attached
        replaced.connection_lost(None);
        assert!(conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(lost.load(Ordering::SeqCst), 0);

        attached.connection_lost(None);
        assert!(!conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_pattern_lists_are_usage_errors() {
        let conn = Connection::new(ConnectionConfig::default());
        assert!(matches!(
            conn.wait_for_responses(Vec::new()),
            Err(ProtocolError::InvalidRequest(_))
        ));
        assert!(conn
            .register_indication_listeners(Vec::new(), IndicationCallback::new(|_| Ok(())))
            .is_err());
    }
}
