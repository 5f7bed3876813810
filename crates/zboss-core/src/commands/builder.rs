//! Command Builder
//!
//! Collects named parameters and validates them against a definition:
//!
//! ```rust,ignore
//! let req = CommandBuilder::new(&ncp_config::GET_MODULE_VERSION)
//!     .param("TSN", 1u8)
//!     .build()?;
//! ```

use super::command::{Command, CommandDef};
use super::types::Value;
use crate::protocol::ProtocolError;

/// Build a command one parameter at a time
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    def: &'static CommandDef,
    params: Vec<(&'static str, Value)>,
}

impl CommandBuilder {
    /// Start a command of type `def` with no parameters set
    pub fn new(def: &'static CommandDef) -> Self {
        Self {
            def,
            params: Vec::new(),
        }
    }

    /// Set a parameter; a later value for the same name wins
    pub fn param(mut self, name: &'static str, value: impl Into<Value>) -> Self {
        self.params.push((name, value.into()));
        self
    }

    /// Build a complete command
    pub fn build(self) -> Result<Command, ProtocolError> {
        Command::new(self.def, self.params)
    }

    /// Build a match pattern
    pub fn build_partial(self) -> Result<Command, ProtocolError> {
        Command::partial(self.def, self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ncp_config::{GET_LOCAL_IEEE_RSP, NCP_MODULE_RESET};

    #[test]
    fn test_build_reset_request() {
        let req = CommandBuilder::new(&NCP_MODULE_RESET)
            .param("TSN", 4u8)
            .param("Option", 2u8)
            .build()
            .unwrap();
        let packet = req.to_packet().unwrap();
        assert_eq!(packet.data, vec![4, 2]);
    }

    #[test]
    fn test_later_value_wins() {
        let req = CommandBuilder::new(&NCP_MODULE_RESET)
            .param("TSN", 4u8)
            .param("Option", 0u8)
            .param("TSN", 9u8)
            .build()
            .unwrap();
        assert_eq!(req.get_uint("TSN"), Some(9));
    }

    #[test]
    fn test_partial_pattern_on_eui64() {
        let ieee = [0x11u8, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
        let pattern = CommandBuilder::new(&GET_LOCAL_IEEE_RSP)
            .param("IEEE", ieee)
            .build_partial()
            .unwrap();
        assert!(pattern.is_partial());
        assert_eq!(pattern.get_bytes("IEEE"), Some(&ieee[..]));

        assert!(CommandBuilder::new(&GET_LOCAL_IEEE_RSP)
            .param("IEEE", vec![0u8; 4])
            .build_partial()
            .is_err());
    }
}
