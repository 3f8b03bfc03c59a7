//! Upload targets and link speeds.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Flash address of the application firmware.
pub const FIRMWARE_ADDRESS: u32 = 0x0000_0000;

/// Flash address of the web-files image.
pub const WEB_FILES_ADDRESS: u32 = 0x0010_0000;

/// Baud rates the loader link can run at, fastest first.
pub const UPLOAD_BAUD_RATES: [u32; 4] = [460_800, 230_400, 115_200, 74_880];

/// Link speed used unless configured otherwise.
pub const DEFAULT_UPLOAD_BAUD: u32 = 115_200;

/// What is being written to the WiFi module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum UploadTarget {
    /// Application firmware.
    #[default]
    Firmware,
    /// Firmware build bundling the web interface.
    WebFirmware,
    /// Web-files filesystem image.
    WebFiles,
}

impl UploadTarget {
    /// All targets.
    pub const ALL: [Self; 3] = [Self::Firmware, Self::WebFirmware, Self::WebFiles];

    /// Flash address the image is written to.
    #[must_use]
    pub fn address(self) -> u32 {
        match self {
            Self::Firmware | Self::WebFirmware => FIRMWARE_ADDRESS,
            Self::WebFiles => WEB_FILES_ADDRESS,
        }
    }

    /// Conventional image file name for this target.
    #[must_use]
    pub fn default_file_name(self) -> &'static str {
        match self {
            Self::Firmware => "MksWifi.bin",
            Self::WebFirmware => "MksWifi_Web.bin",
            Self::WebFiles => "MksWifiWeb.bin",
        }
    }

    /// Short name used on the command line and in config files.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Firmware => "firmware",
            Self::WebFirmware => "web-firmware",
            Self::WebFiles => "web-files",
        }
    }

    /// Get the target from its short name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "firmware" | "fw" => Some(Self::Firmware),
            "web-firmware" | "webfirmware" | "webview" => Some(Self::WebFirmware),
            "web-files" | "webfiles" | "web" => Some(Self::WebFiles),
            _ => None,
        }
    }
}

impl fmt::Display for UploadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for UploadTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| Error::Config(format!("unknown upload target '{s}'")))
    }
}

/// Whether the loader link supports `baud`.
#[must_use]
pub fn is_supported_baud(baud: u32) -> bool {
    UPLOAD_BAUD_RATES.contains(&baud)
}
