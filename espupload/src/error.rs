//! Error types for espupload.

use std::io;
use thiserror::Error;

/// Result type for espupload operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a protocol exchange or a whole upload session.
///
/// `Ok(())` is the success outcome.
pub type Outcome = std::result::Result<(), UploadError>;

/// Failure kinds reported by the bootloader protocol.
///
/// Every variant displays as `"<message> error"`, which is how the
/// outcome is presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum UploadError {
    /// No complete reply arrived within the time budget.
    #[error("timeout error")]
    Timeout,

    /// Writing to the serial port failed.
    #[error("comm write error")]
    CommWrite,

    /// The connect-retry budget was exhausted without a sync reply.
    #[error("connect error")]
    ConnectFailed,

    /// The reply body had an unexpected length or a failure status.
    #[error("bad reply error")]
    BadReply,

    /// The firmware source could not be read.
    #[error("file read error")]
    FileRead,

    /// The firmware source is empty.
    #[error("empty file error")]
    EmptyFile,

    /// The reply header had the wrong direction or opcode.
    #[error("response header error")]
    ResponseHeader,

    /// A frame delimiter appeared where it must not, or was missing.
    #[error("slip frame error")]
    SlipFrame,

    /// The frame reader reached an impossible state.
    #[error("slip state error")]
    SlipState,

    /// An escape sequence was truncated or data ran out mid-frame.
    #[error("slip data error")]
    SlipData,

    /// The session was cancelled by the caller.
    #[error("cancelled error")]
    Cancelled,
}

impl UploadError {
    /// Short message for this failure, meant to be followed by `" error"`.
    pub fn message(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::CommWrite => "comm write",
            Self::ConnectFailed => "connect",
            Self::BadReply => "bad reply",
            Self::FileRead => "file read",
            Self::EmptyFile => "empty file",
            Self::ResponseHeader => "response header",
            Self::SlipFrame => "slip frame",
            Self::SlipState => "slip state",
            Self::SlipData => "slip data",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Short message for an outcome; success reads as `"no"` ("no error").
pub fn outcome_message(outcome: &Outcome) -> &'static str {
    match outcome {
        Ok(()) => "no",
        Err(e) => e.message(),
    }
}

/// Error type for espupload operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Bootloader protocol failure.
    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),

    /// An upload session is already in progress.
    #[error("An upload is already in progress")]
    Busy,

    /// No serial device was found.
    #[error("Device not found")]
    DeviceNotFound,

    /// Unsupported operation on this platform.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
