//! Serial port handling
//!
//! Discovery of candidate NCP ports and opening them as async streams.

use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

use super::ProtocolError;
use crate::config::{ConnectionConfig, FlowControlSetting};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                (Some(usb_info.vid), Some(usb_info.pid), usb_info.product)
            }
            _ => (None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

/// Sort key putting USB CDC ports (ttyACM*) first, then ttyUSB*, then the rest.
/// Numeric suffixes sort numerically.
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List serial ports an NCP might be attached to, in a stable order
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let port = PortInfo::from(info);
        map.entry(port.name.clone()).or_insert(port);
    }

    // Linux: udev may not report every device node
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        product: None,
                    });
                }
            }
        }
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

impl From<FlowControlSetting> for serialport::FlowControl {
    fn from(setting: FlowControlSetting) -> Self {
        match setting {
            FlowControlSetting::None => serialport::FlowControl::None,
            FlowControlSetting::Software => serialport::FlowControl::Software,
            FlowControlSetting::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

/// Open the NCP serial port described by `config` (8N1)
pub fn open_port(config: &ConnectionConfig) -> Result<SerialStream, ProtocolError> {
    if config.port_name.is_empty() {
        return Err(ProtocolError::ConnectionFailed(
            "no serial port configured".to_string(),
        ));
    }

    debug!(
        target: "zboss_core::serial",
        "Opening {} at {} baud, flow control {:?}",
        config.port_name,
        config.baud_rate,
        config.flow_control
    );

    tokio_serial::new(&config.port_name, config.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(config.flow_control.into())
        .open_native_async()
        .map_err(|e| ProtocolError::SerialError(e.to_string()))
}
