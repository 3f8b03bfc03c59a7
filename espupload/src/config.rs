//! Tunables for an upload session.

use std::time::Duration;

use crate::protocol::command::{FlashParams, SYNC_TIMEOUT};
use crate::reset::ResetLines;
use crate::target::DEFAULT_UPLOAD_BAUD;

/// What to send after the last block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FinishAction {
    /// Send nothing; the loader stays in flash mode.
    #[default]
    Skip,
    /// Send flash-end and stay in the loader.
    Stay,
    /// Send flash-end and boot the new image.
    Reboot,
}

/// Timing and behaviour of an [`UploadSession`](crate::session::UploadSession).
///
/// Durations serialise as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct UploadConfig {
    /// Link speed while talking to the loader.
    pub baud_rate: u32,
    /// Failed syncs between two hardware resets.
    pub retries_per_reset: u32,
    /// Total failed syncs before giving up.
    pub max_connect_attempts: u32,
    /// Minimum gap between two sync attempts.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub connect_interval: Duration,
    /// Minimum wait after a reset before the first sync.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub reset_settle: Duration,
    /// Time budget of one sync attempt.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub sync_timeout: Duration,
    /// Minimum gap between flash commands.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub block_interval: Duration,
    /// Progress is reported each time this many percent complete.
    pub percent_increment: u8,
    /// Command sent after the last block.
    pub finish: FinishAction,
    /// Reset the module into its application once the session ends.
    pub reset_after: bool,
    /// Flash-parameter override for bootable images at address 0.
    pub flash_params: Option<FlashParams>,
    /// Wiring of the reset and boot-select lines.
    pub reset_lines: ResetLines,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_UPLOAD_BAUD,
            retries_per_reset: 3,
            max_connect_attempts: 9,
            connect_interval: Duration::from_millis(50),
            reset_settle: Duration::from_millis(500),
            sync_timeout: SYNC_TIMEOUT,
            block_interval: Duration::from_millis(15),
            percent_increment: 5,
            finish: FinishAction::Skip,
            reset_after: true,
            flash_params: None,
            reset_lines: ResetLines::default(),
        }
    }
}

impl UploadConfig {
    /// Set the link speed.
    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the action after the last block.
    #[must_use]
    pub fn with_finish(mut self, finish: FinishAction) -> Self {
        self.finish = finish;
        self
    }

    /// Set the flash-parameter override.
    #[must_use]
    pub fn with_flash_params(mut self, flash_params: Option<FlashParams>) -> Self {
        self.flash_params = flash_params;
        self
    }

    /// Set whether the module is reset into its application afterwards.
    #[must_use]
    pub fn with_reset_after(mut self, reset_after: bool) -> Self {
        self.reset_after = reset_after;
        self
    }
}

#[cfg(feature = "serde")]
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
