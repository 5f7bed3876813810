//! ZDO commands

use super::command::{CommandDef, Param};
use super::ncp_config::status_schema;
use super::types::FieldType;
use crate::protocol::{ControlType, HlCommonHeader};

/// Command ID of the active endpoint query
pub const ZDO_ACTIVE_EP_REQ: u16 = 0x0206;

/// Endpoint list reported by the remote device
pub static ACTIVE_EP_RSP: CommandDef = CommandDef {
    name: "ZDO.ActiveEpReq.Rsp",
    header: HlCommonHeader::new(ControlType::Rsp, ZDO_ACTIVE_EP_REQ),
    schema: status_schema![
        Param::new("ActiveEpList", FieldType::ShortBytes),
        Param::new("NwkAddr", FieldType::U16),
    ],
    blocking: false,
    response: None,
};

/// Active endpoints of a remote device; serialized with other blocking requests
pub static ACTIVE_EP_REQ: CommandDef = CommandDef {
    name: "ZDO.ActiveEpReq.Req",
    header: HlCommonHeader::new(ControlType::Req, ZDO_ACTIVE_EP_REQ),
    schema: &[
        Param::new("TSN", FieldType::U8),
        Param::new("NwkAddr", FieldType::U16),
    ],
    blocking: true,
    response: Some(&ACTIVE_EP_RSP),
};

/// All definitions of this category
pub static ALL: &[&CommandDef] = &[&ACTIVE_EP_REQ];
