//! # tds-protocol
//!
//! IO-agnostic pieces of the MS-TDS (Tabular Data Stream) session
//! establishment layer used by Microsoft SQL Server clients.
//!
//! This crate provides `no_std` compatible packet headers and the encoders
//! for the LOGIN7 feature extension data, including the session recovery
//! block a client sends when it reconnects a broken session.
//!
//! ## Features
//!
//! - `std` (default): Enable standard library support
//! - `alloc`: Enable allocation without full std (requires `alloc` crate)
//!
//! ## Design Philosophy
//!
//! This crate is intentionally IO-agnostic. It contains no networking logic and
//! makes no assumptions about the async runtime. Higher-level crates build upon
//! this foundation to provide packet reassembly and TLS tunnelling.
//!
//! ## Example
//!
//! ```rust
//! use tds_protocol::{FeatureContext, FeatureExtension, RequestedFeatures};
//!
//! let ctx = FeatureContext::new(RequestedFeatures::UTF8_SUPPORT);
//! let features = FeatureExtension::build(&ctx).unwrap();
//!
//! // id, dataLength DWORD, then the 0xFF terminator
//! assert_eq!(features.compute_length(), 6);
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod codec;
pub mod error;
pub mod feature_ext;
pub mod fed_auth;
pub mod packet;
mod prelude;
pub mod session_recovery;

pub use error::ProtocolError;
pub use feature_ext::{
    FeatureBlock, FeatureContext, FeatureEncoder, FeatureExtension, FeatureId,
    MAX_SUPPORTED_DATA_CLASSIFICATION_VERSION, MAX_SUPPORTED_TCE_VERSION, RequestedFeatures,
    SimpleFeature,
};
pub use fed_auth::{AuthenticationMethod, FedAuthFeature, FedAuthLibrary, FedAuthRequest};
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus,
    PacketType,
};
pub use session_recovery::{
    Collation, SessionRecoveryDiff, SessionRecoveryFeature, SessionRecoveryState,
};
