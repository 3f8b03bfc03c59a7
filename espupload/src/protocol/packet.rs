//! ESP8266 ROM loader packet format.
//!
//! ## Frame Format
//!
//! ```text
//! +------+-----------+--------+----------+-------------+-----------+------+
//! | 0xC0 | Direction | Opcode | Body len | Check value |   Body    | 0xC0 |
//! +------+-----------+--------+----------+-------------+-----------+------+
//! |  1   |     1     |   1    | 2 (LE)   |   4 (LE)    | body len  |  1   |
//! +------+-----------+--------+----------+-------------+-----------+------+
//! ```
//!
//! Everything between the delimiters is SLIP-escaped, except for sync
//! requests which go out raw in one burst so the loader's auto-baud
//! detection sees no inter-byte gaps.

use crate::clock::Clock;
use crate::error::UploadError;
use crate::port::Port;
use crate::slip::{self, Decoded};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};
use std::fmt;
use std::time::Duration;

/// Length of the packet header.
pub const HEADER_LEN: usize = 8;

/// Number of response body bytes retained (status, error code).
pub const RESPONSE_STATUS_LEN: usize = 2;

/// Largest request body the client ever sends: a flash-data header plus
/// one block.
pub const MAX_BODY_LEN: usize = 16 + crate::protocol::command::FLASH_BLOCK_SIZE;

/// Idle wait between receive polls when no byte is pending.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Packet direction flag (header byte 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// Host to loader.
    Request = 0x00,
    /// Loader to host.
    Response = 0x01,
}

/// ESP8266 ROM loader command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Start a flash write, erasing the region first.
    FlashBegin = 0x02,
    /// One block of flash data.
    FlashData = 0x03,
    /// Finish a flash write, optionally rebooting.
    FlashEnd = 0x04,
    /// Start a RAM download.
    MemBegin = 0x05,
    /// Finish a RAM download and jump to the entry point.
    MemEnd = 0x06,
    /// One block of RAM data.
    MemData = 0x07,
    /// Auto-baud synchronisation.
    Sync = 0x08,
    /// Write a 32-bit register.
    WriteReg = 0x09,
    /// Read a 32-bit register.
    ReadReg = 0x0A,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x02 => Self::FlashBegin,
            0x03 => Self::FlashData,
            0x04 => Self::FlashEnd,
            0x05 => Self::MemBegin,
            0x06 => Self::MemEnd,
            0x07 => Self::MemData,
            0x08 => Self::Sync,
            0x09 => Self::WriteReg,
            0x0A => Self::ReadReg,
            other => return Err(other),
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}(0x{:02X})", *self as u8)
    }
}

/// Decoded 8-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Direction flag, 0 for requests and 1 for responses.
    pub direction: u8,
    /// Command code.
    pub opcode: u8,
    /// Number of body bytes following the header.
    pub body_len: u16,
    /// Checksum on requests, returned value on responses.
    pub value: u32,
}

impl PacketHeader {
    /// Header for a host request.
    pub fn request(opcode: Opcode, body_len: u16, value: u32) -> Self {
        Self {
            direction: Direction::Request as u8,
            opcode: opcode as u8,
            body_len,
            value,
        }
    }

    /// Serialise to wire order.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.direction;
        buf[1] = self.opcode;
        LittleEndian::write_u16(&mut buf[2..4], self.body_len);
        LittleEndian::write_u32(&mut buf[4..8], self.value);
        buf
    }

    /// Parse from wire order.
    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            direction: buf[0],
            opcode: buf[1],
            body_len: LittleEndian::read_u16(&buf[2..4]),
            value: LittleEndian::read_u32(&buf[4..8]),
        }
    }
}

/// A fully received response packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Header as received.
    pub header: PacketHeader,
    /// First bytes of the body; only `min(body_len, 2)` are meaningful.
    pub status: [u8; RESPONSE_STATUS_LEN],
}

impl Response {
    /// Declared body length.
    pub fn body_len(&self) -> usize {
        usize::from(self.header.body_len)
    }

    /// Value field from the header.
    pub fn value(&self) -> u32 {
        self.header.value
    }

    /// Whether the loader reported success in the status byte.
    pub fn status_ok(&self) -> bool {
        self.body_len() >= RESPONSE_STATUS_LEN && self.status[0] == 0
    }
}

/// Build a complete request frame, delimiters included.
pub fn build_frame(opcode: Opcode, check_value: u32, body: &[u8]) -> Result<Vec<u8>, UploadError> {
    if body.len() > MAX_BODY_LEN {
        debug!("Request body of {} bytes exceeds {MAX_BODY_LEN}", body.len());
        return Err(UploadError::CommWrite);
    }
    let body_len = u16::try_from(body.len()).map_err(|_| UploadError::CommWrite)?;
    let header = PacketHeader::request(opcode, body_len, check_value).to_bytes();

    let mut frame = Vec::with_capacity(slip::max_encoded_len(HEADER_LEN + body.len()));
    frame.push(slip::END);
    if opcode == Opcode::Sync {
        frame.extend_from_slice(&header);
        frame.extend_from_slice(body);
    } else {
        slip::encode(&header, &mut frame);
        slip::encode(body, &mut frame);
    }
    frame.push(slip::END);
    Ok(frame)
}

/// Send one request packet.
pub fn send_packet<P: Port + ?Sized>(
    port: &mut P,
    opcode: Opcode,
    check_value: u32,
    body: &[u8],
) -> Result<(), UploadError> {
    let frame = build_frame(opcode, check_value, body)?;
    trace!(
        "Sending {opcode}: {} body bytes, {} on the wire",
        body.len(),
        frame.len()
    );
    port.write_all_bytes(&frame).map_err(|e| {
        debug!("Write of {opcode} failed: {e}");
        UploadError::CommWrite
    })
}

/// Receive progress of a [`PacketReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Waiting for the opening delimiter; other bytes are skipped.
    AwaitStart,
    /// Collecting the 8 header bytes.
    ReadHeader,
    /// Collecting the declared body bytes.
    ReadBody,
    /// Expecting the closing delimiter.
    AwaitEnd,
    /// A packet has been handed out.
    Complete,
}

/// Result of one [`PacketReader::poll`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadProgress {
    /// Not enough bytes buffered to advance.
    Pending,
    /// One byte (or escape pair) was consumed.
    Advanced,
    /// The closing delimiter was read.
    Ready(Response),
}

/// Resumable parser for one response packet.
///
/// [`poll`](Self::poll) consumes at most one byte or escape pair per call,
/// so the caller keeps control between bytes and can enforce a deadline
/// even while the link streams noise.
#[derive(Debug, Clone)]
pub struct PacketReader {
    state: ReadState,
    header: [u8; HEADER_LEN],
    header_idx: usize,
    parsed: Option<PacketHeader>,
    body_idx: usize,
    status: [u8; RESPONSE_STATUS_LEN],
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketReader {
    /// Create a reader waiting for a frame start.
    pub fn new() -> Self {
        Self {
            state: ReadState::AwaitStart,
            header: [0u8; HEADER_LEN],
            header_idx: 0,
            parsed: None,
            body_idx: 0,
            status: [0u8; RESPONSE_STATUS_LEN],
        }
    }

    /// Current state.
    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Bytes that must be buffered before the current state can advance.
    ///
    /// Header and body bytes need two so an escape pair is never split.
    fn need_bytes(&self) -> usize {
        match self.state {
            ReadState::ReadHeader | ReadState::ReadBody => 2,
            _ => 1,
        }
    }

    /// Advance by one byte (or escape pair) if enough are buffered.
    pub fn poll<P: Port + ?Sized>(&mut self, port: &mut P) -> Result<ReadProgress, UploadError> {
        if self.state == ReadState::Complete {
            return Err(UploadError::SlipState);
        }

        let available = port.bytes_available().map_err(|e| {
            trace!("bytes_available failed: {e}");
            UploadError::SlipData
        })?;
        if available < self.need_bytes() {
            return Ok(ReadProgress::Pending);
        }

        match self.state {
            ReadState::AwaitStart => {
                if slip::read_raw_byte(port)? == Some(slip::END) {
                    self.state = ReadState::ReadHeader;
                }
            },
            ReadState::ReadHeader => {
                let byte = Self::decoded(slip::decode_byte(port)?)?;
                self.header[self.header_idx] = byte;
                self.header_idx += 1;
                if self.header_idx == HEADER_LEN {
                    let header = PacketHeader::from_bytes(&self.header);
                    trace!("Response header: {header:?}");
                    self.parsed = Some(header);
                    self.state = if header.body_len == 0 {
                        ReadState::AwaitEnd
                    } else {
                        ReadState::ReadBody
                    };
                }
            },
            ReadState::ReadBody => {
                let byte = Self::decoded(slip::decode_byte(port)?)?;
                if let Some(slot) = self.status.get_mut(self.body_idx) {
                    *slot = byte;
                }
                self.body_idx += 1;
                let body_len = self.parsed.map_or(0, |h| usize::from(h.body_len));
                if self.body_idx >= body_len {
                    self.state = ReadState::AwaitEnd;
                }
            },
            ReadState::AwaitEnd => {
                if slip::read_raw_byte(port)? != Some(slip::END) {
                    return Err(UploadError::SlipFrame);
                }
                let header = self.parsed.ok_or(UploadError::SlipState)?;
                self.state = ReadState::Complete;
                return Ok(ReadProgress::Ready(Response {
                    header,
                    status: self.status,
                }));
            },
            ReadState::Complete => return Err(UploadError::SlipState),
        }
        Ok(ReadProgress::Advanced)
    }

    fn decoded(d: Decoded) -> Result<u8, UploadError> {
        d.byte().ok_or(UploadError::SlipData)
    }
}

/// Wait for the response to `expected`, polling until `timeout` elapses.
///
/// The deadline is checked on every iteration whether or not bytes are
/// pending. A response with the wrong direction or opcode is reported as
/// [`UploadError::ResponseHeader`].
pub fn receive_packet<P, C>(
    port: &mut P,
    clock: &C,
    expected: Opcode,
    timeout: Duration,
) -> Result<Response, UploadError>
where
    P: Port + ?Sized,
    C: Clock + ?Sized,
{
    let start = clock.now();
    let mut reader = PacketReader::new();

    loop {
        if clock.elapsed(start) > timeout {
            trace!("Timed out waiting for {expected} in {:?}", reader.state());
            return Err(UploadError::Timeout);
        }

        match reader.poll(port)? {
            ReadProgress::Ready(response) => {
                let header = response.header;
                if header.direction != Direction::Response as u8 || header.opcode != expected as u8
                {
                    trace!(
                        "Unexpected header: direction {} opcode 0x{:02X}, wanted {expected}",
                        header.direction, header.opcode
                    );
                    return Err(UploadError::ResponseHeader);
                }
                return Ok(response);
            },
            ReadProgress::Advanced => {},
            ReadProgress::Pending => clock.sleep(POLL_INTERVAL),
        }
    }
}
