//! SLIP byte framing (RFC 1055) as spoken by the ESP8266 ROM loader.
//!
//! Every packet is bracketed by [`END`]. Inside a frame the two reserved
//! values are replaced by two-byte sequences, so `END` never appears in a
//! payload:
//!
//! ```text
//! 0xC0  ->  0xDB 0xDC
//! 0xDB  ->  0xDB 0xDD
//! ```

use crate::error::UploadError;
use crate::port::Port;
use log::trace;

/// Frame delimiter.
pub const END: u8 = 0xC0;
/// Escape byte.
pub const ESC: u8 = 0xDB;
/// Escaped form of [`END`].
pub const ESC_END: u8 = 0xDC;
/// Escaped form of [`ESC`].
pub const ESC_ESC: u8 = 0xDD;

/// Result of a successful [`decode_byte`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// A byte that needed no unescaping.
    Plain(u8),
    /// A byte reconstructed from an escape pair.
    Escaped(u8),
    /// Nothing was waiting in the receive buffer.
    NoData,
}

impl Decoded {
    /// The decoded byte, if any.
    pub fn byte(self) -> Option<u8> {
        match self {
            Self::Plain(b) | Self::Escaped(b) => Some(b),
            Self::NoData => None,
        }
    }
}

/// Read one byte without SLIP decoding.
///
/// Returns `None` when the receive buffer is empty.
pub fn read_raw_byte<P: Port + ?Sized>(port: &mut P) -> Result<Option<u8>, UploadError> {
    if available(port)? == 0 {
        return Ok(None);
    }
    read_one(port).map(Some)
}

/// Read one logical byte, undoing SLIP escaping.
///
/// An escape byte requires its follow-up byte to be already buffered; the
/// call never waits for it.
pub fn decode_byte<P: Port + ?Sized>(port: &mut P) -> Result<Decoded, UploadError> {
    if available(port)? == 0 {
        return Ok(Decoded::NoData);
    }

    let byte = read_one(port)?;
    match byte {
        END => Err(UploadError::SlipFrame),
        ESC => {
            if available(port)? == 0 {
                return Err(UploadError::SlipData);
            }
            match read_one(port)? {
                ESC_END => Ok(Decoded::Escaped(END)),
                ESC_ESC => Ok(Decoded::Escaped(ESC)),
                other => {
                    trace!("Invalid SLIP escape follow-up 0x{other:02X}");
                    Err(UploadError::SlipFrame)
                },
            }
        },
        b => Ok(Decoded::Plain(b)),
    }
}

/// Append the SLIP encoding of one byte to `out`.
pub fn encode_byte(byte: u8, out: &mut Vec<u8>) {
    match byte {
        END => out.extend_from_slice(&[ESC, ESC_END]),
        ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
        b => out.push(b),
    }
}

/// Append the SLIP encoding of `data` to `out` (no delimiters).
pub fn encode(data: &[u8], out: &mut Vec<u8>) {
    out.reserve(data.len());
    for &b in data {
        encode_byte(b, out);
    }
}

/// Worst-case encoded length of `len` payload bytes, delimiters included.
pub const fn max_encoded_len(len: usize) -> usize {
    len * 2 + 2
}

fn available<P: Port + ?Sized>(port: &mut P) -> Result<usize, UploadError> {
    port.bytes_available().map_err(|e| {
        trace!("bytes_available failed: {e}");
        UploadError::SlipData
    })
}

fn read_one<P: Port + ?Sized>(port: &mut P) -> Result<u8, UploadError> {
    let mut buf = [0u8; 1];
    match port.read(&mut buf) {
        Ok(1) => Ok(buf[0]),
        Ok(_) => Err(UploadError::SlipData),
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(UploadError::SlipData),
        Err(e) => {
            trace!("Read error: {e}");
            Err(UploadError::SlipData)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackPort;

    fn decode_all(encoded: &[u8]) -> Result<Vec<u8>, UploadError> {
        let mut port = LoopbackPort::with_input(encoded);
        let mut out = Vec::new();
        loop {
            match decode_byte(&mut port)? {
                Decoded::NoData => return Ok(out),
                d => out.extend(d.byte()),
            }
        }
    }

    #[test]
    fn test_encode_passthrough() {
        let mut out = Vec::new();
        encode(&[0x01, 0x02, 0x03], &mut out);
        assert_eq!(out, vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_encode_reserved_bytes() {
        let mut out = Vec::new();
        encode(&[0x01, END, 0x03, ESC], &mut out);
        assert_eq!(out, vec![0x01, ESC, ESC_END, 0x03, ESC, ESC_ESC]);
        assert!(!out.contains(&END));
    }

    #[test]
    fn test_roundtrip_with_reserved_bytes() {
        let original = vec![END, 0x00, ESC, ESC, END, 0xDC, 0xDD, 0xFF, END];
        let mut encoded = Vec::new();
        encode(&original, &mut encoded);
        assert_eq!(decode_all(&encoded).unwrap(), original);
    }

    #[test]
    fn test_roundtrip_every_byte_value() {
        let original: Vec<u8> = (0..=255u8).collect();
        let mut encoded = Vec::new();
        encode(&original, &mut encoded);
        assert!(encoded.len() <= max_encoded_len(original.len()));
        assert_eq!(decode_all(&encoded).unwrap(), original);
    }

    #[test]
    fn test_decode_reports_escaped() {
        let mut port = LoopbackPort::with_input(&[ESC, ESC_END, 0x41]);
        assert_eq!(decode_byte(&mut port), Ok(Decoded::Escaped(END)));
        assert_eq!(decode_byte(&mut port), Ok(Decoded::Plain(0x41)));
        assert_eq!(decode_byte(&mut port), Ok(Decoded::NoData));
    }

    #[test]
    fn test_decode_unexpected_delimiter() {
        let mut port = LoopbackPort::with_input(&[END]);
        assert_eq!(decode_byte(&mut port), Err(UploadError::SlipFrame));
    }

    #[test]
    fn test_decode_escape_without_follow_up() {
        let mut port = LoopbackPort::with_input(&[ESC]);
        assert_eq!(decode_byte(&mut port), Err(UploadError::SlipData));
    }

    #[test]
    fn test_decode_invalid_escape() {
        let mut port = LoopbackPort::with_input(&[ESC, 0x42]);
        assert_eq!(decode_byte(&mut port), Err(UploadError::SlipFrame));
    }

    #[test]
    fn test_read_raw_byte_keeps_delimiter() {
        let mut port = LoopbackPort::with_input(&[END]);
        assert_eq!(read_raw_byte(&mut port), Ok(Some(END)));
        assert_eq!(read_raw_byte(&mut port), Ok(None));
    }
}
