//! TLS-related error types.

use thiserror::Error;

/// Errors that can occur during TLS operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsError {
    /// TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// Hostname verification failed.
    #[error("hostname verification failed: expected {expected}, got {actual}")]
    HostnameVerification {
        /// Expected hostname.
        expected: String,
        /// Actual hostname from certificate.
        actual: String,
    },

    /// Invalid certificate format.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// IO error during TLS operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The pre-login encapsulation was already switched to pass-through.
    #[error("TLS handshake already finished")]
    HandshakeAlreadyFinished,

    /// Handshake bytes were still in flight at the cut-over.
    #[error(
        "handshake data not drained: {read_buffered} bytes of an inbound packet unread, \
         {write_pending} bytes unflushed"
    )]
    UndrainedHandshakeData {
        /// Header or payload bytes of a partially read packet.
        read_buffered: usize,
        /// Framed bytes not yet written to the transport.
        write_pending: usize,
    },
}
