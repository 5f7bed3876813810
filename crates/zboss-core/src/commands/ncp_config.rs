//! NCP configuration commands
//!
//! General configuration of the NCP module: versions, reset, device role and
//! addressing.

use super::command::{CommandDef, Param};
use super::types::FieldType;
use crate::protocol::{ControlType, HlCommonHeader};

/// Every response starts with the request's TSN and a status
macro_rules! status_schema {
    ($($param:expr),* $(,)?) => {
        &[
            Param::new("TSN", FieldType::U8),
            Param::new("StatusCat", FieldType::U8),
            Param::new("StatusCode", FieldType::U8),
            $($param),*
        ]
    };
}
pub(crate) use status_schema;

/// Command IDs of the NCP configuration category
pub mod code {
    /// Firmware, stack and protocol versions
    pub const GET_MODULE_VERSION: u16 = 0x0001;
    /// Module reset
    pub const NCP_RESET: u16 = 0x0002;
    /// Read the device role
    pub const GET_ZIGBEE_ROLE: u16 = 0x0004;
    /// Write the device role
    pub const SET_ZIGBEE_ROLE: u16 = 0x0005;
    /// Short PAN ID
    pub const GET_PAN_ID: u16 = 0x0009;
    /// IEEE address of a MAC interface
    pub const GET_LOCAL_IEEE_ADDR: u16 = 0x000b;
    /// Extended PAN ID
    pub const GET_EXTENDED_PAN_ID: u16 = 0x0023;
    /// Reset indication
    pub const NCP_RESET_IND: u16 = 0x002b;
}

/// Options of `NCPModuleReset`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ResetOption {
    /// Plain reboot
    #[default]
    NoOptions = 0,
    /// Erase non-volatile memory before rebooting
    EraseNvram = 1,
    /// Restore factory settings
    FactoryReset = 2,
    /// Block reading keys back from the module
    LockReadingKeys = 3,
}

const fn req(id: u16) -> HlCommonHeader {
    HlCommonHeader::new(ControlType::Req, id)
}

const fn rsp(id: u16) -> HlCommonHeader {
    HlCommonHeader::new(ControlType::Rsp, id)
}

/// Versions, each packed as four bytes
pub static GET_MODULE_VERSION_RSP: CommandDef = CommandDef {
    name: "NcpConfig.GetModuleVersion.Rsp",
    header: rsp(code::GET_MODULE_VERSION),
    schema: status_schema![
        Param::new("FWVersion", FieldType::U32),
        Param::new("StackVersion", FieldType::U32),
        Param::new("ProtocolVersion", FieldType::U32),
    ],
    blocking: false,
    response: None,
};

/// Query the module versions
pub static GET_MODULE_VERSION: CommandDef = CommandDef {
    name: "NcpConfig.GetModuleVersion.Req",
    header: req(code::GET_MODULE_VERSION),
    schema: &[Param::new("TSN", FieldType::U8)],
    blocking: false,
    response: Some(&GET_MODULE_VERSION_RSP),
};

/// Acknowledges a reset before the module reboots
pub static NCP_MODULE_RESET_RSP: CommandDef = CommandDef {
    name: "NcpConfig.NCPModuleReset.Rsp",
    header: rsp(code::NCP_RESET),
    schema: status_schema![],
    blocking: false,
    response: None,
};

/// Reboot the module, optionally wiping state
pub static NCP_MODULE_RESET: CommandDef = CommandDef {
    name: "NcpConfig.NCPModuleReset.Req",
    header: req(code::NCP_RESET),
    schema: &[
        Param::new("TSN", FieldType::U8),
        Param::new("Option", FieldType::U8),
    ],
    blocking: false,
    response: Some(&NCP_MODULE_RESET_RSP),
};

/// Current device role
pub static GET_ZIGBEE_ROLE_RSP: CommandDef = CommandDef {
    name: "NcpConfig.GetZigbeeRole.Rsp",
    header: rsp(code::GET_ZIGBEE_ROLE),
    schema: status_schema![Param::new("DeviceRole", FieldType::U8)],
    blocking: false,
    response: None,
};

/// Query the device role
pub static GET_ZIGBEE_ROLE: CommandDef = CommandDef {
    name: "NcpConfig.GetZigbeeRole.Req",
    header: req(code::GET_ZIGBEE_ROLE),
    schema: &[Param::new("TSN", FieldType::U8)],
    blocking: false,
    response: Some(&GET_ZIGBEE_ROLE_RSP),
};

/// Status of a role change
pub static SET_ZIGBEE_ROLE_RSP: CommandDef = CommandDef {
    name: "NcpConfig.SetZigbeeRole.Rsp",
    header: rsp(code::SET_ZIGBEE_ROLE),
    schema: status_schema![],
    blocking: false,
    response: None,
};

/// Change the device role
pub static SET_ZIGBEE_ROLE: CommandDef = CommandDef {
    name: "NcpConfig.SetZigbeeRole.Req",
    header: req(code::SET_ZIGBEE_ROLE),
    schema: &[
        Param::new("TSN", FieldType::U8),
        Param::new("DeviceRole", FieldType::U8),
    ],
    blocking: false,
    response: Some(&SET_ZIGBEE_ROLE_RSP),
};

/// Current short PAN ID
pub static GET_SHORT_PAN_ID_RSP: CommandDef = CommandDef {
    name: "NcpConfig.GetShortPANID.Rsp",
    header: rsp(code::GET_PAN_ID),
    schema: status_schema![Param::new("PANID", FieldType::U16)],
    blocking: false,
    response: None,
};

/// Query the short PAN ID
pub static GET_SHORT_PAN_ID: CommandDef = CommandDef {
    name: "NcpConfig.GetShortPANID.Req",
    header: req(code::GET_PAN_ID),
    schema: &[Param::new("TSN", FieldType::U8)],
    blocking: false,
    response: Some(&GET_SHORT_PAN_ID_RSP),
};

/// IEEE address of the requested interface
pub static GET_LOCAL_IEEE_RSP: CommandDef = CommandDef {
    name: "NcpConfig.GetLocalIEEE.Rsp",
    header: rsp(code::GET_LOCAL_IEEE_ADDR),
    schema: status_schema![
        Param::new("MacInterfaceNum", FieldType::U8),
        Param::new("IEEE", FieldType::Eui64),
    ],
    blocking: false,
    response: None,
};

/// Query the IEEE address of a MAC interface
pub static GET_LOCAL_IEEE: CommandDef = CommandDef {
    name: "NcpConfig.GetLocalIEEE.Req",
    header: req(code::GET_LOCAL_IEEE_ADDR),
    schema: &[
        Param::new("TSN", FieldType::U8),
        Param::new("MacInterfaceNum", FieldType::U8),
    ],
    blocking: false,
    response: Some(&GET_LOCAL_IEEE_RSP),
};

/// Current extended PAN ID
pub static GET_EXTENDED_PAN_ID_RSP: CommandDef = CommandDef {
    name: "NcpConfig.GetExtendedPANID.Rsp",
    header: rsp(code::GET_EXTENDED_PAN_ID),
    schema: status_schema![Param::new("ExtendedPANID", FieldType::Eui64)],
    blocking: false,
    response: None,
};

/// Query the extended PAN ID; serialized with other blocking requests
pub static GET_EXTENDED_PAN_ID: CommandDef = CommandDef {
    name: "NcpConfig.GetExtendedPANID.Req",
    header: req(code::GET_EXTENDED_PAN_ID),
    schema: &[Param::new("TSN", FieldType::U8)],
    blocking: true,
    response: Some(&GET_EXTENDED_PAN_ID_RSP),
};

/// Sent by the NCP after every reset
pub static DEVICE_RESET_INDICATION: CommandDef = CommandDef {
    name: "NcpConfig.DeviceResetIndication.Ind",
    header: HlCommonHeader::new(ControlType::Ind, code::NCP_RESET_IND),
    schema: &[Param::new("ResetSrc", FieldType::U8)],
    blocking: false,
    response: None,
};

/// All definitions of this category
pub static ALL: &[&CommandDef] = &[
    &GET_MODULE_VERSION,
    &NCP_MODULE_RESET,
    &GET_ZIGBEE_ROLE,
    &SET_ZIGBEE_ROLE,
    &GET_SHORT_PAN_ID,
    &GET_LOCAL_IEEE,
    &GET_EXTENDED_PAN_ID,
    &DEVICE_RESET_INDICATION,
];
