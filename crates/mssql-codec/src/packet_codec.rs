//! TDS packet codec implementation.

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::packet::{
    MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::reassembler::{PacketReassembler, RawChunk, ReassemblyMode};

/// A TDS packet with header and payload.
///
/// Only produced once every byte of it has arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header.
    pub header: PacketHeader,
    /// Packet payload (excluding header).
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet with the given header and payload.
    #[must_use]
    pub fn new(header: PacketHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Decode a packet from its complete wire bytes.
    pub fn from_raw(raw: Bytes) -> Result<Self, CodecError> {
        let mut cursor = raw.as_ref();
        let header = PacketHeader::decode(&mut cursor)?;
        if header.length as usize != raw.len() {
            return Err(CodecError::InvalidPacketLength {
                length: header.length as usize,
            });
        }
        Ok(Self {
            header,
            payload: raw.slice(PACKET_HEADER_SIZE..),
        })
    }

    /// Get the total packet size including header.
    #[must_use]
    pub fn total_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }

    /// Check if this is an out-of-band attention packet.
    #[must_use]
    pub fn is_attention(&self) -> bool {
        self.header.packet_type == PacketType::Attention
    }

    /// Encode the packet, header first, as it appears on the wire.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.total_size());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Split a message payload into packets of at most `packet_size` bytes.
///
/// The last packet carries `END_OF_MESSAGE`. With `reset_connection`, the
/// first packet carries `RESET_CONNECTION`. An empty payload still produces
/// one empty packet. Packet ids are assigned by [`TdsCodec`] when the
/// packets are encoded.
#[must_use]
pub fn encode_message(
    packet_type: PacketType,
    payload: &Bytes,
    packet_size: usize,
    reset_connection: bool,
) -> Vec<Packet> {
    let max_payload = packet_size.clamp(PACKET_HEADER_SIZE + 1, MAX_PACKET_SIZE) - PACKET_HEADER_SIZE;
    let total_chunks = payload.len().div_ceil(max_payload).max(1);

    (0..total_chunks)
        .map(|i| {
            let start = i * max_payload;
            let end = (start + max_payload).min(payload.len());

            let mut status = if i == total_chunks - 1 {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            // RESETCONNECTION must be on the first packet only
            if i == 0 && reset_connection {
                status |= PacketStatus::RESET_CONNECTION;
            }

            let length = (PACKET_HEADER_SIZE + end - start) as u16;
            Packet::new(
                PacketHeader::new(packet_type, status, length),
                payload.slice(start..end),
            )
        })
        .collect()
}

/// TDS packet codec for tokio-util framing.
///
/// Decoding hands every received byte to a [`PacketReassembler`], so the
/// codec yields the same packets however the transport splits the stream.
#[derive(Debug)]
pub struct TdsCodec {
    /// Maximum packet size to accept.
    max_packet_size: usize,
    /// Current packet sequence number for encoding.
    packet_id: u8,
    /// Inbound reassembly state.
    reassembler: PacketReassembler,
}

impl TdsCodec {
    /// Create a new TDS codec with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            packet_id: 1,
            reassembler: PacketReassembler::new(MAX_PACKET_SIZE, ReassemblyMode::Blocking),
        }
    }

    /// Create a new TDS codec with a custom maximum packet size.
    ///
    /// Must be called before any bytes are decoded.
    #[must_use]
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.clamp(PACKET_HEADER_SIZE, MAX_PACKET_SIZE);
        self.reassembler = PacketReassembler::new(self.max_packet_size, self.reassembler.mode());
        self
    }

    /// Select the reassembly mode.
    ///
    /// Must be called before any bytes are decoded.
    #[must_use]
    pub fn with_mode(mut self, mode: ReassemblyMode) -> Self {
        self.reassembler = PacketReassembler::new(self.max_packet_size, mode);
        self
    }

    /// Maximum packet size this codec accepts.
    #[must_use]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Inbound reassembly state.
    #[must_use]
    pub fn reassembler(&self) -> &PacketReassembler {
        &self.reassembler
    }

    /// Mutable inbound reassembly state, for snapshot replay.
    pub fn reassembler_mut(&mut self) -> &mut PacketReassembler {
        &mut self.reassembler
    }

    /// Get the next packet ID and increment the counter.
    fn next_packet_id(&mut self) -> u8 {
        let id = self.packet_id;
        self.packet_id = self.packet_id.wrapping_add(1);
        if self.packet_id == 0 {
            self.packet_id = 1;
        }
        id
    }

    /// Reset the packet ID counter.
    pub fn reset_packet_id(&mut self) {
        self.packet_id = 1;
    }
}

impl Default for TdsCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TdsCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !src.is_empty() {
            let chunk = src.split();
            self.reassembler.feed(RawChunk::from(&chunk[..]))?;
        }

        let packet = self.reassembler.try_complete_packet();
        if let Some(packet) = &packet {
            tracing::trace!(
                packet_type = ?packet.header.packet_type,
                length = packet.header.length,
                is_eom = packet.is_end_of_message(),
                "decoded TDS packet"
            );
        }
        Ok(packet)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if self.reassembler.has_partial() => Err(CodecError::ConnectionClosed),
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for TdsCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total_length = PACKET_HEADER_SIZE + item.payload.len();

        if total_length > self.max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size: total_length,
                max: self.max_packet_size,
            });
        }

        // Reserve space
        dst.reserve(total_length);

        // Create header with correct length and packet ID
        let mut header = item.header;
        header.length = total_length as u16;
        header.packet_id = self.next_packet_id();

        header.encode(dst);
        dst.put_slice(&item.payload);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length = total_length,
            packet_id = header.packet_id,
            "encoded TDS packet"
        );

        Ok(())
    }
}
