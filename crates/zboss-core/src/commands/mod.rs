//! NCP commands
//!
//! Typed request/response/indication values and the built-in definitions the
//! connection itself needs. Other categories plug in through
//! [`CommandCatalog::register`].

pub mod builder;
pub mod catalog;
pub mod command;
pub mod ncp_config;
pub mod types;
pub mod zdo;

pub use builder::CommandBuilder;
pub use catalog::CommandCatalog;
pub use command::{Command, CommandDef, Param};
pub use types::{FieldType, Value};
