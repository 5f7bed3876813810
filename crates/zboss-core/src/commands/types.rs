//! Field types and values
//!
//! All multi-byte integers are little-endian on the wire.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

/// Wire type of a command field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// Unsigned 8-bit integer
    U8,
    /// Unsigned 16-bit integer
    U16,
    /// Unsigned 32-bit integer
    U32,
    /// Unsigned 64-bit integer
    U64,
    /// Signed 8-bit integer
    I8,
    /// Signed 16-bit integer
    I16,
    /// Signed 32-bit integer
    I32,
    /// One byte, 0 or 1
    Bool,
    /// 8-byte IEEE address, stored in wire order
    Eui64,
    /// Bytes prefixed with a one-byte length
    ShortBytes,
    /// Bytes prefixed with a two-byte length
    LongBytes,
    /// Everything left in the payload
    Remaining,
}

/// Value of a command field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// Any unsigned integer type
    Uint(u64),
    /// Any signed integer type
    Int(i64),
    /// A boolean
    Bool(bool),
    /// Addresses and byte strings
    Bytes(Vec<u8>),
}

impl Value {
    /// Unsigned integer, if this is one
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// Signed integer, if this is one
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean, if this is one
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Bytes, if this holds any
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Uint(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Bytes(v) => write!(f, "b'{}'", hex::encode(v)),
        }
    }
}

macro_rules! value_from {
    ($variant:ident as $target:ty: $($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v as $target)
                }
            }
        )*
    };
}

value_from!(Uint as u64: u8, u16, u32, u64);
value_from!(Int as i64: i8, i16, i32, i64);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for Value {
    fn from(v: [u8; N]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl FieldType {
    /// Fixed encoded size, `None` for variable-length types
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            FieldType::U8 | FieldType::I8 | FieldType::Bool => Some(1),
            FieldType::U16 | FieldType::I16 => Some(2),
            FieldType::U32 | FieldType::I32 => Some(4),
            FieldType::U64 | FieldType::Eui64 => Some(8),
            FieldType::ShortBytes | FieldType::LongBytes | FieldType::Remaining => None,
        }
    }

    /// Check that `value` has the right shape and fits this type
    pub fn check(self, value: &Value) -> Result<(), String> {
        let fits = match (self, value) {
            (FieldType::U8, Value::Uint(v)) => *v <= u8::MAX as u64,
            (FieldType::U16, Value::Uint(v)) => *v <= u16::MAX as u64,
            (FieldType::U32, Value::Uint(v)) => *v <= u32::MAX as u64,
            (FieldType::U64, Value::Uint(_)) => true,
            (FieldType::I8, Value::Int(v)) => i8::try_from(*v).is_ok(),
            (FieldType::I16, Value::Int(v)) => i16::try_from(*v).is_ok(),
            (FieldType::I32, Value::Int(v)) => i32::try_from(*v).is_ok(),
            (FieldType::Bool, Value::Bool(_)) => true,
            (FieldType::Eui64, Value::Bytes(v)) => v.len() == 8,
            (FieldType::ShortBytes, Value::Bytes(v)) => v.len() <= u8::MAX as usize,
            (FieldType::LongBytes, Value::Bytes(v)) => v.len() <= u16::MAX as usize,
            (FieldType::Remaining, Value::Bytes(_)) => true,
            _ => {
                return Err(format!("expected {:?}, got {:?}", self, value));
            }
        };

        if fits {
            Ok(())
        } else {
            Err(format!("{} out of range for {:?}", value, self))
        }
    }

    /// Append the encoding of a value that passed [`FieldType::check`]
    pub fn encode(self, value: &Value, out: &mut Vec<u8>) {
        match (self, value) {
            (FieldType::U8, Value::Uint(v)) => out.push(*v as u8),
            (FieldType::U16, Value::Uint(v)) => {
                let mut buf = [0u8; 2];
                LittleEndian::write_u16(&mut buf, *v as u16);
                out.extend_from_slice(&buf);
            }
            (FieldType::U32, Value::Uint(v)) => {
                let mut buf = [0u8; 4];
                LittleEndian::write_u32(&mut buf, *v as u32);
                out.extend_from_slice(&buf);
            }
            (FieldType::U64, Value::Uint(v)) => {
                let mut buf = [0u8; 8];
                LittleEndian::write_u64(&mut buf, *v);
                out.extend_from_slice(&buf);
            }
            (FieldType::I8, Value::Int(v)) => out.push(*v as i8 as u8),
            (FieldType::I16, Value::Int(v)) => {
                let mut buf = [0u8; 2];
                LittleEndian::write_i16(&mut buf, *v as i16);
                out.extend_from_slice(&buf);
            }
            (FieldType::I32, Value::Int(v)) => {
                let mut buf = [0u8; 4];
                LittleEndian::write_i32(&mut buf, *v as i32);
                out.extend_from_slice(&buf);
            }
            (FieldType::Bool, Value::Bool(v)) => out.push(u8::from(*v)),
            (FieldType::ShortBytes, Value::Bytes(v)) => {
                out.push(v.len() as u8);
                out.extend_from_slice(v);
            }
            (FieldType::LongBytes, Value::Bytes(v)) => {
                let mut buf = [0u8; 2];
                LittleEndian::write_u16(&mut buf, v.len() as u16);
                out.extend_from_slice(&buf);
                out.extend_from_slice(v);
            }
            (FieldType::Eui64 | FieldType::Remaining, Value::Bytes(v)) => {
                out.extend_from_slice(v)
            }
            // Unchecked mismatches encode nothing
            _ => {}
        }
    }

    /// Decode one value from the start of `data`, returning it and the bytes used
    pub fn decode(self, data: &[u8]) -> Result<(Value, usize), String> {
        if let Some(size) = self.fixed_size() {
            if data.len() < size {
                return Err(format!(
                    "{:?} needs {} bytes, {} left",
                    self,
                    size,
                    data.len()
                ));
            }
        }

        let value = match self {
            FieldType::U8 => (Value::Uint(data[0] as u64), 1),
            FieldType::U16 => (Value::Uint(LittleEndian::read_u16(data) as u64), 2),
            FieldType::U32 => (Value::Uint(LittleEndian::read_u32(data) as u64), 4),
            FieldType::U64 => (Value::Uint(LittleEndian::read_u64(data)), 8),
            FieldType::I8 => (Value::Int(data[0] as i8 as i64), 1),
            FieldType::I16 => (Value::Int(LittleEndian::read_i16(data) as i64), 2),
            FieldType::I32 => (Value::Int(LittleEndian::read_i32(data) as i64), 4),
            FieldType::Bool => match data[0] {
                0 => (Value::Bool(false), 1),
                1 => (Value::Bool(true), 1),
                other => return Err(format!("invalid boolean 0x{:02X}", other)),
            },
            FieldType::Eui64 => (Value::Bytes(data[..8].to_vec()), 8),
            FieldType::ShortBytes => {
                let len = *data.first().ok_or("missing length prefix")? as usize;
                let bytes = data
                    .get(1..1 + len)
                    .ok_or_else(|| format!("need {} bytes, {} left", len, data.len() - 1))?;
                (Value::Bytes(bytes.to_vec()), 1 + len)
            }
            FieldType::LongBytes => {
                if data.len() < 2 {
                    return Err("missing length prefix".to_string());
                }
                let len = LittleEndian::read_u16(data) as usize;
                let bytes = data
                    .get(2..2 + len)
                    .ok_or_else(|| format!("need {} bytes, {} left", len, data.len() - 2))?;
                (Value::Bytes(bytes.to_vec()), 2 + len)
            }
            FieldType::Remaining => (Value::Bytes(data.to_vec()), data.len()),
        };
        Ok(value)
    }
}
