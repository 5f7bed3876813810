//! Command definitions and values
//!
//! A [`CommandDef`] describes one request, response or indication: its
//! header and the ordered schema of its fields. A [`Command`] is an
//! immutable value of that shape. Partial commands leave fields unset and
//! are only usable as match patterns.

use std::fmt;

use tracing::trace;

use super::types::{FieldType, Value};
use crate::protocol::{
    ControlType, Frame, HlCommonHeader, HlPacket, ProtocolError, LL_BODY_SIZE_MAX,
};

/// One field of a command schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    /// Field name, unique within the schema
    pub name: &'static str,
    /// Wire type
    pub ty: FieldType,
    /// Optional fields trail the required ones
    pub optional: bool,
}

impl Param {
    /// Required field
    pub const fn new(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            optional: false,
        }
    }

    /// Optional trailing field, absent when the payload ends before it
    pub const fn optional(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            optional: true,
        }
    }
}

/// Static description of a command
#[derive(Debug)]
pub struct CommandDef {
    /// Qualified name, e.g. `NcpConfig.GetModuleVersion.Req`
    pub name: &'static str,
    /// Header carried by every command of this type
    pub header: HlCommonHeader,
    /// Fields in wire order
    pub schema: &'static [Param],
    /// Requests that must not overlap with other blocking requests
    pub blocking: bool,
    /// Response definition of a request
    pub response: Option<&'static CommandDef>,
}

impl CommandDef {
    /// Request, response or indication
    pub fn kind(&self) -> ControlType {
        self.header.control_type
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.schema.iter().position(|p| p.name == name)
    }
}

impl PartialEq for CommandDef {
    fn eq(&self, other: &Self) -> bool {
        same_header(&self.header, &other.header)
    }
}

impl Eq for CommandDef {}

/// Headers identify a command by control type and ID; the version byte does not
pub(crate) fn same_header(a: &HlCommonHeader, b: &HlCommonHeader) -> bool {
    a.control_type == b.control_type && a.command_id == b.command_id
}

/// Immutable command value
#[derive(Debug, Clone)]
pub struct Command {
    def: &'static CommandDef,
    values: Vec<Option<Value>>,
    partial: bool,
}

impl Command {
    /// Build a complete command, checking every parameter against the schema
    pub fn new<I, K>(def: &'static CommandDef, params: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        Self::bind(def, params, false)
    }

    /// Build a match pattern; unset fields match anything
    pub fn partial<I, K>(def: &'static CommandDef, params: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        Self::bind(def, params, true)
    }

    /// Pattern matching every command with this definition's header
    pub fn pattern(def: &'static CommandDef) -> Self {
        Self {
            def,
            values: vec![None; def.schema.len()],
            partial: true,
        }
    }

    fn bind<I, K>(def: &'static CommandDef, params: I, partial: bool) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut values: Vec<Option<Value>> = vec![None; def.schema.len()];
        let mut unknown = Vec::new();

        for (name, value) in params {
            let name = name.as_ref();
            match def.index_of(name) {
                Some(idx) => values[idx] = Some(value),
                None => unknown.push(name.to_string()),
            }
        }

        if !unknown.is_empty() {
            return Err(ProtocolError::InvalidCommand(format!(
                "{}: unexpected parameters {:?}",
                def.name, unknown
            )));
        }

        if !partial {
            let missing: Vec<&str> = def
                .schema
                .iter()
                .zip(&values)
                .filter(|(p, v)| !p.optional && v.is_none())
                .map(|(p, _)| p.name)
                .collect();
            if !missing.is_empty() {
                return Err(ProtocolError::InvalidCommand(format!(
                    "{}: missing parameters {:?}",
                    def.name, missing
                )));
            }

            // Optional parameters must be given as a prefix, without gaps
            let mut gap = None;
            for (param, value) in def.schema.iter().zip(&values) {
                if !param.optional {
                    continue;
                }
                match (value, gap) {
                    (None, None) => gap = Some(param.name),
                    (Some(_), Some(skipped)) => {
                        return Err(ProtocolError::InvalidCommand(format!(
                            "{}: optional parameter {} given without {}",
                            def.name, param.name, skipped
                        )));
                    }
                    _ => {}
                }
            }
        }

        for (param, value) in def.schema.iter().zip(&values) {
            if let Some(value) = value {
                param.ty.check(value).map_err(|err| {
                    ProtocolError::InvalidCommand(format!(
                        "{}: invalid parameter value {}={}: {}",
                        def.name, param.name, value, err
                    ))
                })?;
            }
        }

        Ok(Self {
            def,
            values,
            partial,
        })
    }

    /// Definition this command was built from
    pub fn def(&self) -> &'static CommandDef {
        self.def
    }

    /// Qualified name of the definition
    pub fn name(&self) -> &'static str {
        self.def.name
    }

    /// Header of the definition
    pub fn header(&self) -> HlCommonHeader {
        self.def.header
    }

    /// Request, response or indication
    pub fn kind(&self) -> ControlType {
        self.def.kind()
    }

    /// Whether fields may be unset; partial commands only serve as patterns
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Whether requests of this type are serialized with other blocking ones
    pub fn is_blocking(&self) -> bool {
        self.def.blocking
    }

    /// Value of a field, `None` when unset or unknown
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.def
            .index_of(name)
            .and_then(|idx| self.values[idx].as_ref())
    }

    /// Unsigned integer field
    pub fn get_uint(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(Value::as_uint)
    }

    /// Byte string or address field
    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        self.get(name).and_then(Value::as_bytes)
    }

    /// Pattern matching any response to this request
    pub fn response_pattern(&self) -> Result<Command, ProtocolError> {
        match self.def.response {
            Some(rsp) if self.kind() == ControlType::Req => Ok(Command::pattern(rsp)),
            _ => Err(ProtocolError::InvalidRequest(format!(
                "{} is not a request",
                self.def.name
            ))),
        }
    }

    /// Serialize the fields behind the common header
    pub fn to_packet(&self) -> Result<HlPacket, ProtocolError> {
        if self.partial {
            return Err(ProtocolError::InvalidCommand(format!(
                "cannot serialize a partial command: {}",
                self
            )));
        }

        let mut data = Vec::new();
        for (param, value) in self.def.schema.iter().zip(&self.values) {
            if let Some(value) = value {
                param.ty.encode(value, &mut data);
            }
        }
        Ok(HlPacket::new(self.def.header, data))
    }

    /// Unfragmented frame; sequence flags and CRC8 are set by the link layer.
    ///
    /// Commands too large for one frame must go through [`Frame::fragment`].
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let packet = self.to_packet()?;
        if packet.body().len() > LL_BODY_SIZE_MAX {
            return Err(ProtocolError::InvalidCommand(format!(
                "{}: {} byte body does not fit in one frame",
                self.def.name,
                packet.body().len()
            )));
        }
        Ok(Frame::new(packet))
    }

    /// Decode a packet carrying a `def` command
    pub fn from_packet(def: &'static CommandDef, packet: &HlPacket) -> Result<Self, ProtocolError> {
        match &packet.header {
            Some(header) if same_header(header, &def.header) => {}
            other => {
                return Err(ProtocolError::CommandDecode(format!(
                    "wrong header for {}: {:?}",
                    def.name, other
                )));
            }
        }

        let mut data = &packet.data[..];
        let mut values: Vec<Option<Value>> = Vec::with_capacity(def.schema.len());

        for param in def.schema {
            // Optional fields past the end of the payload are absent, even `Remaining`
            if param.optional && data.is_empty() {
                break;
            }
            match param.ty.decode(data) {
                Ok((value, used)) => {
                    values.push(Some(value));
                    data = &data[used..];
                }
                Err(err) => {
                    // A failed request's response stops after the status
                    if def.kind() == ControlType::Rsp && failed_status(def, &values) {
                        values.resize(def.schema.len(), None);
                        return Ok(Self {
                            def,
                            values,
                            partial: true,
                        });
                    }
                    if data.is_empty() {
                        return Err(ProtocolError::CommandDecode(format!(
                            "{}: payload truncated, required parameter {} remains",
                            def.name, param.name
                        )));
                    }
                    return Err(ProtocolError::CommandDecode(format!(
                        "{}: cannot decode {}: {}",
                        def.name, param.name, err
                    )));
                }
            }
        }

        if !data.is_empty() {
            trace!("{}: ignoring {} trailing bytes", def.name, data.len());
        }

        values.resize(def.schema.len(), None);
        Ok(Self {
            def,
            values,
            partial: false,
        })
    }

    /// Every field set in `self` equals the one in `other`; headers must match
    pub fn matches(&self, other: &Command) -> bool {
        if !same_header(&self.def.header, &other.def.header) {
            return false;
        }

        self.values
            .iter()
            .zip(&other.values)
            .all(|(expected, actual)| match expected {
                Some(expected) => actual.as_ref() == Some(expected),
                None => true,
            })
    }
}

fn failed_status(def: &CommandDef, decoded: &[Option<Value>]) -> bool {
    def.index_of("StatusCode")
        .and_then(|idx| decoded.get(idx))
        .and_then(|v| v.as_ref())
        .and_then(Value::as_uint)
        .is_some_and(|code| code != 0)
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        same_header(&self.def.header, &other.def.header) && self.values == other.values
    }
}

impl Eq for Command {}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.def.name)?;
        for (idx, (param, value)) in self.def.schema.iter().zip(&self.values).enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            match value {
                Some(value) => write!(f, "{}={}", param.name, value)?,
                None => write!(f, "{}=None", param.name)?,
            }
        }
        f.write_str(")")
    }
}
