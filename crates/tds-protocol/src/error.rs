//! Protocol-level error types.

use thiserror::Error;

use crate::feature_ext::FeatureId;

/// Errors raised while decoding packet headers or encoding login data.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Not enough bytes were available to decode a structure.
    #[error("incomplete packet: expected {expected} bytes, got {actual}")]
    IncompletePacket {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown packet type byte.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Status byte carries bits outside the defined set.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Header declares a total length below the header size.
    #[error("invalid packet length {0}: shorter than the packet header")]
    InvalidPacketLength(u16),

    /// An identifier is longer than a one-byte character count can describe.
    #[error("identifier of {len} UTF-16 code units exceeds 255")]
    IdentifierTooLong {
        /// Length in UTF-16 code units.
        len: usize,
    },

    /// The federated authentication library type cannot be encoded.
    #[error("unsupported federated authentication library: 0x{0:02X}")]
    UnsupportedFedAuthLibrary(u8),

    /// A feature was encoded without the state it depends on.
    #[error("feature prerequisite missing: {0}")]
    MissingFeatureState(&'static str),

    /// A session state slot changed in a way that cannot be replayed.
    #[error("session state {0} is not recoverable")]
    UnrecoverableSessionState(u8),

    /// A feature block wrote a different number of bytes than it announced.
    #[error("feature {feature:?} announced {computed} bytes but wrote {written}")]
    FeatureLengthMismatch {
        /// Feature whose encoders disagreed.
        feature: FeatureId,
        /// Length returned by the length pass.
        computed: usize,
        /// Bytes emitted by the write pass.
        written: usize,
    },
}
