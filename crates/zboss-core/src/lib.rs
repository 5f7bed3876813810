//! # ZBOSS Core Library
//!
//! Host-side driver for Zigbee network co-processors running the ZBOSS NCP
//! serial protocol.
//!
//! This library provides:
//! - Frame encoding with CRC8/CRC16 checksums, fragmentation and reassembly
//! - A stop-and-wait acknowledged link layer over the serial port
//! - Typed commands with partial matching
//! - Request/response correlation and indication subscriptions
//!
//! ## Example
//!
//! ```rust,ignore
//! use zboss_core::prelude::*;
//!
//! let conn = Connection::new(ConnectionConfig::new("/dev/ttyACM0"));
//! conn.connect().await?;
//!
//! if let Some(version) = conn.version().await? {
//!     println!("NCP {}", version);
//! }
//!
//! let handle = conn.register_indication_listener(
//!     Command::pattern(&ncp_config::DEVICE_RESET_INDICATION),
//!     IndicationCallback::new(|ind| {
//!         println!("NCP reset: {}", ind);
//!         Ok(())
//!     }),
//! );
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod commands;
pub mod config;
pub mod connection;
pub mod listener;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::commands::{
        ncp_config, zdo, Command, CommandBuilder, CommandCatalog, CommandDef, FieldType, Param,
        Value,
    };
    pub use crate::config::{ConnectionConfig, FlowControlSetting};
    pub use crate::connection::{Connection, ConnectionState, NcpVersion};
    pub use crate::listener::{IndicationCallback, IndicationHandle, ResponseFuture};
    pub use crate::protocol::{Frame, HlPacket, ProtocolError};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
