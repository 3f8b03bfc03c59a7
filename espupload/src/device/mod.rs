//! Serial port classification.
//!
//! WiFi modules are reached through a USB-to-UART bridge (or, on newer
//! Espressif boards, the chip's own USB serial). Ports are classified by
//! USB VID/PID so that a likely candidate can be picked without asking.

use crate::error::{Error, Result};
use crate::port::PortInfo;

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// USB bridge family behind a serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum DeviceKind {
    /// WCH CH340/CH341.
    Ch340,
    /// Silicon Labs CP2102/CP2104 family.
    Cp210x,
    /// FTDI FT232R and the multi-channel FT2232/FT4232 parts.
    Ftdi,
    /// Prolific PL2303.
    Prolific,
    /// Espressif USB serial/JTAG or USB-OTG.
    Espressif,
    /// Anything else, including ports without USB metadata.
    Unknown,
}

/// `(vid, pids, kind)`; an empty PID list matches every product of the vendor.
const BRIDGES: [(u16, &[u16], DeviceKind); 5] = [
    (0x303A, &[], DeviceKind::Espressif),
    (0x1A86, &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4], DeviceKind::Ch340),
    (0x10C4, &[0xEA60, 0xEA63, 0xEA70, 0xEA71], DeviceKind::Cp210x),
    (0x0403, &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015], DeviceKind::Ftdi),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        BRIDGES
            .iter()
            .find(|(v, pids, _)| *v == vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |&(_, _, kind)| kind)
    }

    /// Short display name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Espressif => "Espressif USB",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the port sits behind a recognised bridge.
    pub fn is_known(&self) -> bool {
        *self != Self::Unknown
    }

    /// Auto-selection rank; lower is preferred.
    fn priority(self) -> u8 {
        match self {
            Self::Espressif => 0,
            Self::Ch340 | Self::Cp210x => 1,
            Self::Ftdi | Self::Prolific => 2,
            Self::Unknown => 3,
        }
    }
}

/// An enumerated serial port plus its bridge classification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// OS device name, e.g. `/dev/ttyUSB0` or `COM3`.
    pub name: String,
    /// Bridge family.
    pub device: DeviceKind,
    /// USB vendor ID.
    pub vid: Option<u16>,
    /// USB product ID.
    pub pid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
    /// USB serial number.
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Whether this port is plausibly wired to a WiFi module.
    pub fn is_likely_module(&self) -> bool {
        self.device.is_known()
    }

    fn describe(&self) -> String {
        let mut line = self.name.clone();
        match (self.device, self.vid, self.pid) {
            (kind, _, _) if kind.is_known() => line.push_str(&format!(" [{}]", kind.name())),
            (_, Some(vid), Some(pid)) => line.push_str(&format!(" [VID:{vid:04X} PID:{pid:04X}]")),
            _ => {},
        }
        if let Some(product) = &self.product {
            line.push_str(" - ");
            line.push_str(product);
        }
        line
    }
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let device = info
            .vid
            .zip(info.pid)
            .map_or(DeviceKind::Unknown, |(vid, pid)| DeviceKind::from_vid_pid(vid, pid));
        Self {
            name: info.name,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

/// Every serial port the host reports; empty when enumeration fails.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    use crate::port::{NativePortEnumerator, PortEnumerator};

    let ports = NativePortEnumerator::list_ports().unwrap_or_else(|e| {
        debug!("Serial port enumeration failed: {e}");
        Vec::new()
    });
    ports
        .into_iter()
        .map(DetectedPort::from)
        .inspect(|p| trace!("{} classified as {:?}", p.name, p.device))
        .collect()
}

/// Without a native serial driver there is nothing to enumerate.
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the best candidate among `ports`.
///
/// Espressif native USB wins over common bridges, known bridges over
/// unknown ports; ties keep enumeration order.
pub fn select_port(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports.iter().min_by_key(|p| p.device.priority())
}

/// Enumerate and pick the best candidate.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = detect_ports();
    let best = select_port(&ports).ok_or(Error::DeviceNotFound)?;
    info!("Auto-selected {} ({})", best.name, best.device.name());
    Ok(best.clone())
}

/// Enumeration needs the `native` feature.
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::Unsupported(
        "Port enumeration requires the `native` feature".to_string(),
    ))
}

/// One display line per port: name, bridge or raw IDs, then product string.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports.iter().map(DetectedPort::describe).collect()
}
