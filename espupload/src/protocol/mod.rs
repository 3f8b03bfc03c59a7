//! ESP8266 ROM loader protocol.

pub mod command;
pub mod packet;

// Re-export common types
pub use command::{Bootloader, FlashBlock, FlashParams, checksum};
pub use packet::{Direction, Opcode, PacketHeader, PacketReader, ReadProgress, ReadState, Response};
