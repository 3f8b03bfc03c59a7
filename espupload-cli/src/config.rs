//! Layered TOML configuration.
//!
//! Later layers override earlier ones, field by field:
//! 1. `config.toml` in the user config dir (e.g. ~/.config/espupload/)
//! 2. `espupload.toml` in the working directory
//! 3. environment variables (ESPUPLOAD_*) and flags, applied by clap
//!
//! `--config PATH` replaces layers 1 and 2. USB devices the user chose to
//! remember live in `known_devices.toml` next to the global file.
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud = 460800
//!
//! [[serial.known_device]]
//! vid = 0x1A86
//! pid = 0x7523
//!
//! [upload]
//! target = "web-files"
//! finish = "reboot"
//! reset_after = true
//! flash_params = { value = 0x0220, mask = 0xFFFF }
//! ```

use directories::ProjectDirs;
use espupload::{FinishAction, FlashParams, UploadTarget};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const LOCAL_FILE: &str = "espupload.toml";
const GLOBAL_FILE: &str = "config.toml";
const KNOWN_DEVICES_FILE: &str = "known_devices.toml";

/// A USB bridge identified by vendor and product ID.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Whether a port with this VID/PID is this device.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        (self.vid, self.pid) == (vid, pid)
    }
}

/// `[serial]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port to use without asking.
    pub port: Option<String>,
    /// Upload baud rate.
    pub baud: Option<u32>,
    /// Bridges treated like the built-in known ones.
    #[serde(default, rename = "known_device", skip_serializing_if = "Vec::is_empty")]
    pub known_devices: Vec<UsbDevice>,
}

impl SerialSettings {
    fn overlay(&mut self, top: Self) {
        self.port = top.port.or(self.port.take());
        self.baud = top.baud.or(self.baud);
        for device in top.known_devices {
            self.add_known(device);
        }
    }

    fn add_known(&mut self, device: UsbDevice) {
        if !self.known_devices.contains(&device) {
            self.known_devices.push(device);
        }
    }

    /// Whether a VID/PID pair was remembered or configured.
    pub fn is_known(&self, vid: u16, pid: u16) -> bool {
        self.known_devices.iter().any(|d| d.matches(vid, pid))
    }
}

/// `[upload]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Default upload target.
    pub target: Option<UploadTarget>,
    /// Command sent after the last block.
    pub finish: Option<FinishAction>,
    /// Reset the module into its application afterwards.
    pub reset_after: Option<bool>,
    /// Flash-parameter override for bootable images.
    pub flash_params: Option<FlashParams>,
}

impl UploadSettings {
    fn overlay(&mut self, top: Self) {
        self.target = top.target.or(self.target);
        self.finish = top.finish.or(self.finish);
        self.reset_after = top.reset_after.or(self.reset_after);
        self.flash_params = top.flash_params.or(self.flash_params);
    }
}

/// Effective configuration after all file layers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Serial link settings.
    #[serde(default)]
    pub serial: SerialSettings,
    /// Upload defaults.
    #[serde(default)]
    pub upload: UploadSettings,
}

/// Only what `known_devices.toml` holds.
#[derive(Debug, Default, Serialize, Deserialize)]
struct KnownDevices {
    #[serde(default, rename = "known_device")]
    devices: Vec<UsbDevice>,
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    let content = fs::read_to_string(path)
        .map_err(|e| warn!("Failed to read config file {}: {e}", path.display()))
        .ok()?;
    toml::from_str(&content)
        .map_err(|e| warn!("Failed to parse config file {}: {e}", path.display()))
        .ok()
}

impl Config {
    /// Merge the global and local files plus remembered devices.
    pub fn load() -> Self {
        let layers = Self::global_path()
            .into_iter()
            .chain([PathBuf::from(LOCAL_FILE)]);

        let mut config = Self::default();
        for path in layers {
            if let Some(layer) = read_toml::<Self>(&path) {
                debug!("Loaded config layer {}", path.display());
                config.overlay(layer);
            }
        }
        config.load_known_devices();
        config
    }

    /// Load a single explicit file (`--config PATH`).
    pub fn load_from_path(path: &Path) -> Self {
        let mut config = read_toml::<Self>(path).unwrap_or_else(|| {
            warn!("Could not load config from {}, using defaults", path.display());
            Self::default()
        });
        config.load_known_devices();
        config
    }

    fn overlay(&mut self, top: Self) {
        self.serial.overlay(top.serial);
        self.upload.overlay(top.upload);
    }

    fn load_known_devices(&mut self) {
        let Some(path) = Self::known_devices_path() else {
            return;
        };
        if let Some(known) = read_toml::<KnownDevices>(&path) {
            for device in known.devices {
                self.serial.add_known(device);
            }
        }
    }

    /// Per-user configuration directory.
    pub fn global_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "espupload").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Per-user configuration file.
    pub fn global_path() -> Option<PathBuf> {
        Self::global_dir().map(|dir| dir.join(GLOBAL_FILE))
    }

    fn known_devices_path() -> Option<PathBuf> {
        Self::global_dir().map(|dir| dir.join(KNOWN_DEVICES_FILE))
    }

    /// Add a device to `known_devices.toml` so it is auto-selected next time.
    ///
    /// Only the file's own entries are rewritten; devices listed in
    /// `config.toml` or `espupload.toml` stay where they are.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };
        self.serial.add_known(device);
        let dir = Self::global_dir()
            .ok_or_else(|| anyhow::anyhow!("No user configuration directory on this system"))?;
        fs::create_dir_all(&dir)?;
        Self::append_known_device(&dir.join(KNOWN_DEVICES_FILE), device)
    }

    fn append_known_device(path: &Path, device: UsbDevice) -> anyhow::Result<()> {
        let mut known = read_toml::<KnownDevices>(path).unwrap_or_default();
        if known.devices.contains(&device) {
            return Ok(());
        }
        known.devices.push(device);
        fs::write(path, toml::to_string_pretty(&known)?)?;
        info!(
            "Saved USB device {:04X}:{:04X} to {}",
            device.vid,
            device.pid,
            path.display()
        );
        Ok(())
    }
}
