//! # mssql-tls
//!
//! TLS negotiation layer for SQL Server connections.
//!
//! This crate handles the complexity of TLS negotiation for both TDS 7.x
//! (pre-login encryption negotiation) and TDS 8.0 (strict TLS-first mode).
//!
//! ## TDS Version Differences
//!
//! ### TDS 7.x (SQL Server 2019 and earlier)
//! ```text
//! TCP Connect → PreLogin (cleartext) → TLS Handshake → Login7 (encrypted)
//! ```
//!
//! ### TDS 8.0 (SQL Server 2022+ strict mode)
//! ```text
//! TCP Connect → TLS Handshake → PreLogin (encrypted) → Login7 (encrypted)
//! ```
//!
//! In the TDS 7.x flow the handshake records do not travel bare: they are
//! carried as the payload of PreLogin packets until the handshake ends,
//! after which the same transport carries unframed TLS. That cut-over is
//! handled by [`TlsPreloginWrapper`]. [`TlsConnector::negotiate`] picks the
//! flow from the configuration's `strict_mode` setting.
//!
//! ## Features
//!
//! - TLS 1.2 and TLS 1.3 support via rustls
//! - Server certificate validation
//! - Hostname verification
//! - Custom certificate authority support
//! - PreLogin encapsulation with blocking and async IO
//!
//! ## Security
//!
//! By default, this crate validates server certificates using the Mozilla
//! root certificate store. The `TrustServerCertificate` option disables
//! validation but logs a warning - this should only be used for development.
//!
//! ```rust,ignore
//! use mssql_tls::{TlsConfig, TlsConnector, TlsVersion};
//!
//! let tls_config = TlsConfig::new()
//!     .min_protocol_version(TlsVersion::Tls12)
//!     .with_prelogin_packet_size(4096);
//!
//! let connector = TlsConnector::new(tls_config)?;
//! let tls_stream = connector.negotiate(tcp_stream, "db.example.com").await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod error;
pub mod prelogin_wrapper;

pub use config::{TlsConfig, TlsVersion};
pub use connector::{TlsConnector, TlsNegotiationMode};
pub use error::TlsError;
pub use prelogin_wrapper::{HandshakePhase, TlsPreloginWrapper};

// Re-export tokio-rustls stream type for convenience
pub use tokio_rustls::client::TlsStream;
