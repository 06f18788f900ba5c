//! Codec error types.

use std::io;

use tds_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised while framing or reassembling TDS packets.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// Underlying transport failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The packet header could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A header declared a total length shorter than the header itself.
    #[error("invalid packet length {length}: shorter than the 8-byte header")]
    InvalidPacketLength {
        /// Declared length.
        length: usize,
    },

    /// A header declared a packet that does not fit the negotiated size.
    #[error("packet too large: {size} bytes exceeds maximum of {max}")]
    PacketTooLarge {
        /// Declared or actual size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A raw chunk referenced bytes outside its buffer.
    #[error("chunk [{start}, {start}+{length}) exceeds buffer of {buffer_len} bytes")]
    InvalidChunk {
        /// Start offset.
        start: usize,
        /// Chunk length.
        length: usize,
        /// Length of the underlying buffer.
        buffer_len: usize,
    },

    /// A caller consumed more bytes than the receive buffer holds.
    #[error("buffer underrun: requested {requested} bytes, {available} available")]
    BufferUnderrun {
        /// Bytes requested.
        requested: usize,
        /// Bytes available.
        available: usize,
    },

    /// The transport ended in the middle of a packet.
    #[error("connection closed with a partial packet pending")]
    ConnectionClosed,
}

impl CodecError {
    /// Whether the error means the byte stream can no longer be trusted.
    ///
    /// Framing errors leave the reader at an unknown position, so the
    /// connection has to be torn down.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::BufferUnderrun { .. } | Self::InvalidChunk { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_errors_are_fatal() {
        assert!(CodecError::InvalidPacketLength { length: 4 }.is_fatal());
        assert!(CodecError::ConnectionClosed.is_fatal());
        assert!(
            !CodecError::BufferUnderrun {
                requested: 4,
                available: 2
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_protocol_error_converts() {
        let err: CodecError = ProtocolError::InvalidPacketType(0x99).into();
        assert!(matches!(err, CodecError::Protocol(_)));
        assert!(err.to_string().contains("0x99"));
    }
}
