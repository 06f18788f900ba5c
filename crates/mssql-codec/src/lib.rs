//! # mssql-codec
//!
//! Framing layer that turns raw transport reads into TDS packets.
//!
//! This crate reassembles packets across read boundaries, keeps a replay
//! snapshot for callers that may be suspended between reads, and splits
//! outbound messages into packets.
//!
//! ## Features
//!
//! - Packet reassembly across TCP segments ([`PacketReassembler`])
//! - Snapshot and replay of completed packets in non-blocking mode
//! - Immediate visibility of out-of-band attention packets
//! - Integration with tokio-util's codec framework
//! - A blocking reader over `std::io::Read` with identical output
//!
//! ## Architecture
//!
//! ```text
//! TCP Stream → RawChunk → PacketReassembler → Packet → Client
//!                               ↓
//!                           Snapshot (non-blocking mode)
//! ```
//!
//! ```rust
//! use mssql_codec::{PacketReassembler, RawChunk, ReassemblyMode};
//!
//! let mut reassembler = PacketReassembler::new(4096, ReassemblyMode::Blocking);
//! let wire = [0x04, 0x01, 0x00, 0x0A, 0x00, 0x00, 0x01, 0x00, 0xAB, 0xCD];
//!
//! reassembler.feed(RawChunk::from(&wire[..6])).unwrap();
//! assert!(reassembler.try_complete_packet().is_none());
//!
//! reassembler.feed(RawChunk::from(&wire[6..])).unwrap();
//! let packet = reassembler.try_complete_packet().unwrap();
//! assert_eq!(&packet.payload[..], &[0xAB, 0xCD]);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod framed;
pub mod packet_codec;
pub mod reassembler;

pub use error::CodecError;
pub use framed::{BlockingPacketReader, PacketReader, PacketWriter};
pub use packet_codec::{Packet, TdsCodec, encode_message};
pub use reassembler::{
    PacketReassembler, PartialPacket, RawChunk, ReassemblyMode, ReceiveBuffer, Snapshot,
};
