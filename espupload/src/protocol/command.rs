//! Bootloader commands built on the packet layer.
//!
//! ## Flash-data body
//!
//! ```text
//! +-----------+----------+--------+--------+---------------------+
//! | Data size | Sequence |   0    |   0    |     Block data      |
//! +-----------+----------+--------+--------+---------------------+
//! |  4 (LE)   |  4 (LE)  | 4 (LE) | 4 (LE) |        1024         |
//! +-----------+----------+--------+--------+---------------------+
//! ```
//!
//! The header check value of a flash-data packet is the XOR of the 1024
//! block bytes seeded with [`CHECKSUM_SEED`].

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Outcome, UploadError};
use crate::port::Port;
use crate::protocol::packet::{Opcode, RESPONSE_STATUS_LEN, Response, receive_packet, send_packet};
use crate::source::FirmwareSource;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace, warn};
use std::str::FromStr;
use std::time::Duration;

/// Flash write block size.
pub const FLASH_BLOCK_SIZE: usize = 1024;

/// Length of the fixed header in front of each flash-data block.
pub const FLASH_DATA_HEADER_LEN: usize = 16;

/// Seed for the flash-data checksum.
pub const CHECKSUM_SEED: u8 = 0xEF;

/// First byte of a bootable ESP8266 image.
pub const IMAGE_MAGIC: u8 = 0xE9;

/// Offset of the 16-bit flash-parameter field in an image header.
pub const FLASH_PARAMS_OFFSET: usize = 2;

/// Immediate attempts for one flash-data block.
pub const BLOCK_WRITE_ATTEMPTS: usize = 3;

/// Re-reads allowed while the sync reply carries a foreign header.
pub const SYNC_REREADS: usize = 10;

/// Timeout for ordinary commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeout for flash-begin with a non-zero size (the erase happens there).
pub const ERASE_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for one flash-data block.
pub const BLOCK_WRITE_TIMEOUT: Duration = Duration::from_millis(200);

/// Timeout for one sync attempt.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Sync body: `07 07 12 20` followed by 32 bytes of `0x55`.
pub const SYNC_PAYLOAD: [u8; 36] = {
    let mut buf = [0x55u8; 36];
    buf[0] = 0x07;
    buf[1] = 0x07;
    buf[2] = 0x12;
    buf[3] = 0x20;
    buf
};

/// Override for the flash mode/size bits in the first image block.
///
/// Applied as `(field & !mask) | value` to the little-endian 16-bit field at
/// offset 2 of block 0 when uploading a bootable image to address 0. A zero
/// mask disables the override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashParams {
    /// Bits to set.
    pub value: u16,
    /// Bits to replace.
    pub mask: u16,
}

impl FlashParams {
    /// Whether this override changes anything.
    pub fn is_active(self) -> bool {
        self.mask != 0
    }

    /// Apply to a raw field value.
    pub fn apply(self, field: u16) -> u16 {
        if !self.is_active() {
            return field;
        }
        (field & !self.mask) | self.value
    }
}

impl FromStr for FlashParams {
    type Err = Error;

    /// Parse `VALUE:MASK`, each in hex with an optional `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, mask) = s
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("expected VALUE:MASK, got '{s}'")))?;
        let parse = |part: &str| {
            let digits = part
                .trim()
                .trim_start_matches("0x")
                .trim_start_matches("0X");
            u16::from_str_radix(digits, 16)
                .map_err(|e| Error::Config(format!("invalid hex value '{part}': {e}")))
        };
        Ok(Self {
            value: parse(value)?,
            mask: parse(mask)?,
        })
    }
}

/// A flash-data body ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashBlock {
    /// 16-byte header followed by the padded block data.
    pub body: Vec<u8>,
    /// XOR checksum of the block data.
    pub checksum: u8,
}

impl FlashBlock {
    /// The block data without the header.
    pub fn data(&self) -> &[u8] {
        &self.body[FLASH_DATA_HEADER_LEN..]
    }
}

/// XOR of every byte in `data`, starting from `seed`.
pub fn checksum(data: &[u8], seed: u8) -> u8 {
    data.iter().fold(seed, |acc, &b| acc ^ b)
}

/// Number of flash blocks needed for `size` bytes.
pub fn block_count(size: u32) -> u32 {
    size.div_ceil(FLASH_BLOCK_SIZE as u32)
}

/// Round `address` down to a block boundary.
pub fn align_to_block(address: u32) -> u32 {
    address & !(FLASH_BLOCK_SIZE as u32 - 1)
}

/// Read the next block from `source` and build its flash-data body.
///
/// A short read is only accepted at end of file, where the remainder is
/// zero-filled. Block 0 of an image uploaded to address 0 gets
/// `flash_params` patched in before the checksum is taken.
pub fn prepare_block<S: FirmwareSource + ?Sized>(
    source: &mut S,
    seq: u32,
    address: u32,
    flash_params: Option<FlashParams>,
) -> Result<FlashBlock, UploadError> {
    let mut body = vec![0u8; FLASH_DATA_HEADER_LEN + FLASH_BLOCK_SIZE];
    LittleEndian::write_u32(&mut body[0..4], FLASH_BLOCK_SIZE as u32);
    LittleEndian::write_u32(&mut body[4..8], seq);

    let data = &mut body[FLASH_DATA_HEADER_LEN..];
    let mut filled = 0;
    while filled < FLASH_BLOCK_SIZE {
        match source.read(&mut data[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
            Err(e) => {
                debug!("Read of block {seq} failed: {e}");
                return Err(UploadError::FileRead);
            },
        }
    }
    if filled < FLASH_BLOCK_SIZE {
        if source.position() != source.size() {
            debug!(
                "Short read of block {seq}: {filled} bytes at {} of {}",
                source.position(),
                source.size()
            );
            return Err(UploadError::FileRead);
        }
        trace!("Padding final block {seq} from {filled} bytes");
    }

    if let Some(params) = flash_params.filter(|p| p.is_active()) {
        if seq == 0 && address == 0 && data[0] == IMAGE_MAGIC {
            let field_range = FLASH_PARAMS_OFFSET..FLASH_PARAMS_OFFSET + 2;
            let field = LittleEndian::read_u16(&data[field_range.clone()]);
            let patched = params.apply(field);
            debug!("Patching flash parameters 0x{field:04X} -> 0x{patched:04X}");
            LittleEndian::write_u16(&mut data[field_range], patched);
        }
    }

    let checksum = checksum(data, CHECKSUM_SEED);
    Ok(FlashBlock { body, checksum })
}

/// Client for the ESP8266 ROM loader over one serial link.
pub struct Bootloader<P, C = SystemClock> {
    port: P,
    clock: C,
}

impl<P: Port, C: Clock> Bootloader<P, C> {
    /// Wrap an open port.
    pub fn new(port: P, clock: C) -> Self {
        Self { port, clock }
    }

    /// The underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// The underlying port, mutably.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// The time source.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Borrow the port and clock together.
    pub fn split_mut(&mut self) -> (&mut P, &C) {
        (&mut self.port, &self.clock)
    }

    /// Give back the port and clock.
    pub fn into_inner(self) -> (P, C) {
        (self.port, self.clock)
    }

    /// Send a request and wait for its reply.
    ///
    /// A reply whose body is not exactly the two status bytes, or whose
    /// status byte is non-zero, is a [`UploadError::BadReply`].
    pub fn command(
        &mut self,
        opcode: Opcode,
        body: &[u8],
        check_value: u32,
        timeout: Duration,
    ) -> Result<Response, UploadError> {
        send_packet(&mut self.port, opcode, check_value, body)?;
        let response = receive_packet(&mut self.port, &self.clock, opcode, timeout)?;
        check_reply(opcode, &response)?;
        Ok(response)
    }

    /// Synchronise with the loader's auto-baud detection.
    pub fn sync(&mut self, timeout: Duration) -> Outcome {
        let mut result = self
            .command(Opcode::Sync, &SYNC_PAYLOAD, 0, timeout)
            .map(drop);

        // At higher baud rates the first reply often carries another opcode.
        let mut rereads = 0;
        while result == Err(UploadError::ResponseHeader) && rereads < SYNC_REREADS {
            rereads += 1;
            trace!("Discarding foreign reply to sync ({rereads}/{SYNC_REREADS})");
            result = receive_packet(&mut self.port, &self.clock, Opcode::Sync, timeout).map(drop);
        }

        if result.is_ok() {
            let mut drained = 0usize;
            while let Ok(reply) =
                receive_packet(&mut self.port, &self.clock, Opcode::Sync, DEFAULT_TIMEOUT)
            {
                if reply.body_len() != RESPONSE_STATUS_LEN {
                    break;
                }
                drained += 1;
            }
            debug!("Sync succeeded, drained {drained} extra replies");
        }
        result
    }

    /// Start a flash write of `size` bytes at `address`.
    ///
    /// The loader erases the region before replying, so a non-empty write
    /// gets the long erase timeout.
    pub fn flash_begin(&mut self, address: u32, size: u32) -> Outcome {
        let blocks = block_count(size);
        let address = align_to_block(address);

        let mut body = [0u8; 16];
        LittleEndian::write_u32(&mut body[0..4], size);
        LittleEndian::write_u32(&mut body[4..8], blocks);
        LittleEndian::write_u32(&mut body[8..12], FLASH_BLOCK_SIZE as u32);
        LittleEndian::write_u32(&mut body[12..16], address);

        let timeout = if size != 0 {
            ERASE_TIMEOUT
        } else {
            DEFAULT_TIMEOUT
        };
        debug!("Flash begin: {size} bytes, {blocks} blocks at 0x{address:06X}");
        self.command(Opcode::FlashBegin, &body, 0, timeout).map(drop)
    }

    /// Read, prepare and send block `seq`, retrying the send up to
    /// [`BLOCK_WRITE_ATTEMPTS`] times.
    pub fn flash_write_block<S: FirmwareSource + ?Sized>(
        &mut self,
        source: &mut S,
        seq: u32,
        address: u32,
        flash_params: Option<FlashParams>,
    ) -> Outcome {
        let block = prepare_block(source, seq, address, flash_params)?;

        let mut attempt = 1;
        loop {
            let result = self
                .command(
                    Opcode::FlashData,
                    &block.body,
                    u32::from(block.checksum),
                    BLOCK_WRITE_TIMEOUT,
                )
                .map(drop);
            match result {
                Err(e) if attempt < BLOCK_WRITE_ATTEMPTS => {
                    warn!("Block {seq} attempt {attempt}/{BLOCK_WRITE_ATTEMPTS} failed: {e}");
                    attempt += 1;
                },
                other => return other,
            }
        }
    }

    /// Leave flash mode, either rebooting into the new image or staying in
    /// the loader.
    pub fn flash_finish(&mut self, reboot: bool) -> Outcome {
        let mut body = [0u8; 4];
        LittleEndian::write_u32(&mut body, u32::from(!reboot));
        self.command(Opcode::FlashEnd, &body, 0, DEFAULT_TIMEOUT)
            .map(drop)
    }
}

fn check_reply(opcode: Opcode, response: &Response) -> Result<(), UploadError> {
    if response.body_len() != RESPONSE_STATUS_LEN {
        debug!(
            "{opcode} reply carries {} body bytes, expected {RESPONSE_STATUS_LEN}",
            response.body_len()
        );
        return Err(UploadError::BadReply);
    }
    if !response.status_ok() {
        debug!(
            "{opcode} rejected: status {} error {}",
            response.status[0], response.status[1]
        );
        return Err(UploadError::BadReply);
    }
    Ok(())
}
