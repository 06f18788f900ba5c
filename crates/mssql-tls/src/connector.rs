//! TLS connector for establishing encrypted connections.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector as TokioTlsConnector;

use crate::config::{TlsConfig, TlsVersion};
use crate::error::TlsError;
use crate::prelogin_wrapper::TlsPreloginWrapper;

// =============================================================================
// Dangerous Certificate Verifier (for TrustServerCertificate=true)
// =============================================================================

/// A certificate verifier that accepts any server certificate.
///
/// **WARNING:** This is insecure and should only be used for development/testing.
/// Using this verifier exposes the connection to man-in-the-middle attacks.
#[derive(Debug)]
struct DangerousServerCertVerifier;

impl ServerCertVerifier for DangerousServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // Accept any certificate without validation
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        // Support all common signature schemes
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

// =============================================================================
// Negotiation Mode
// =============================================================================

/// Where the TLS handshake sits relative to the PreLogin exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsNegotiationMode {
    /// TDS 7.x: handshake records travel as PreLogin packet payloads, and
    /// the transport carries bare TLS only after the handshake.
    Encapsulated,

    /// TDS 8.0 strict: the handshake is the first traffic on the transport.
    Strict,
}

impl TlsNegotiationMode {
    /// Mode for the `strict_mode` setting of a [`TlsConfig`].
    #[must_use]
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            Self::Strict
        } else {
            Self::Encapsulated
        }
    }

    /// Whether TLS starts before any TDS packet.
    #[must_use]
    pub fn is_tls_first(&self) -> bool {
        matches!(self, Self::Strict)
    }
}

// =============================================================================
// TLS Connector
// =============================================================================

/// TLS connector for SQL Server connections.
///
/// This handles both TDS 7.x style (TLS after pre-login) and TDS 8.0
/// strict mode (TLS before any TDS traffic).
pub struct TlsConnector {
    config: TlsConfig,
    inner: TokioTlsConnector,
}

impl TlsConnector {
    /// Create a new TLS connector with the given configuration.
    pub fn new(config: TlsConfig) -> Result<Self, TlsError> {
        let client_config = Self::build_client_config(&config)?;
        let inner = TokioTlsConnector::from(Arc::new(client_config));

        Ok(Self { config, inner })
    }

    /// Build the rustls client configuration.
    fn build_client_config(config: &TlsConfig) -> Result<ClientConfig, TlsError> {
        // Select protocol versions
        let versions: Vec<&'static rustls::SupportedProtocolVersion> =
            Self::select_versions(config);

        // Handle TrustServerCertificate mode (dangerous - development only)
        if config.trust_server_certificate {
            tracing::warn!(
                "TrustServerCertificate is enabled - certificate validation is DISABLED. \
                 This is insecure and should only be used for development/testing. \
                 Connections are vulnerable to man-in-the-middle attacks."
            );

            let client_config = ClientConfig::builder_with_protocol_versions(&versions)
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(DangerousServerCertVerifier))
                .with_no_client_auth();

            return Ok(client_config);
        }

        // Build root certificate store for normal validation
        let root_store = Self::build_root_store(config)?;

        // Build the client config with proper certificate validation
        let builder = ClientConfig::builder_with_protocol_versions(&versions)
            .with_root_certificates(root_store);

        Ok(builder.with_no_client_auth())
    }

    /// Build the root certificate store.
    fn build_root_store(config: &TlsConfig) -> Result<RootCertStore, TlsError> {
        let mut root_store = RootCertStore::empty();

        if config.root_certificates.is_empty() {
            // Use system root certificates
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            // Use custom root certificates
            for cert in &config.root_certificates {
                root_store
                    .add(cert.clone())
                    .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
            }
        }

        Ok(root_store)
    }

    /// Select TLS protocol versions based on configuration.
    fn select_versions(config: &TlsConfig) -> Vec<&'static rustls::SupportedProtocolVersion> {
        let versions: Vec<_> = [TlsVersion::Tls12, TlsVersion::Tls13]
            .into_iter()
            .filter(|v| config.min_protocol_version <= *v && *v <= config.max_protocol_version)
            .map(|v| v.to_rustls())
            .collect();

        if versions.is_empty() {
            // Fallback to TLS 1.2 if no versions match
            return vec![&rustls::version::TLS12];
        }

        versions
    }

    /// Resolve the SNI name, preferring the configured override.
    fn server_name(&self, server_name: &str) -> Result<ServerName<'static>, TlsError> {
        let server_name = self.config.server_name.as_deref().unwrap_or(server_name);

        ServerName::try_from(server_name.to_string()).map_err(|_| TlsError::HostnameVerification {
            expected: server_name.to_string(),
            actual: "invalid DNS name".to_string(),
        })
    }

    /// Connect and perform TLS handshake over the given stream.
    ///
    /// This is the TDS 8.0 strict flow: TLS records go straight onto the
    /// transport.
    ///
    /// # Arguments
    ///
    /// * `stream` - The underlying TCP stream
    /// * `server_name` - The server hostname for SNI and certificate validation
    pub async fn connect<S>(&self, stream: S, server_name: &str) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let dns_name = self.server_name(server_name)?;

        tracing::debug!(server_name = ?dns_name, "performing TLS handshake");

        let tls_stream = self
            .inner
            .connect(dns_name, stream)
            .await
            .map_err(|e| TlsError::HandshakeFailed(e.to_string()))?;

        tracing::debug!("TLS handshake completed successfully");

        Ok(tls_stream)
    }

    /// Perform the TDS 7.x handshake with TLS records carried in PreLogin
    /// packets.
    ///
    /// The returned stream has already switched its wrapper to
    /// pass-through, so everything written afterwards is plain TLS.
    pub async fn connect_prelogin<S>(
        &self,
        stream: S,
        server_name: &str,
    ) -> Result<TlsStream<TlsPreloginWrapper<S>>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let dns_name = self.server_name(server_name)?;
        let wrapper = TlsPreloginWrapper::with_packet_size(stream, self.config.prelogin_packet_size);

        tracing::debug!(
            server_name = ?dns_name,
            packet_size = wrapper.packet_size(),
            "performing TLS handshake inside PreLogin packets"
        );

        let mut tls_stream = self
            .inner
            .connect(dns_name, wrapper)
            .await
            .map_err(|e| TlsError::HandshakeFailed(e.to_string()))?;

        tls_stream.get_mut().0.finish_handshake()?;

        tracing::debug!("TLS handshake completed successfully");

        Ok(tls_stream)
    }

    /// Handshake over `stream` in the mode the configuration selects.
    ///
    /// Both modes return the stream behind a [`TlsPreloginWrapper`]; in
    /// strict mode it is switched to pass-through before the first byte, so
    /// nothing is ever framed.
    pub async fn negotiate<S>(
        &self,
        stream: S,
        server_name: &str,
    ) -> Result<TlsStream<TlsPreloginWrapper<S>>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mode = self.negotiation_mode();
        tracing::debug!(?mode, "negotiating TLS");

        match mode {
            TlsNegotiationMode::Encapsulated => self.connect_prelogin(stream, server_name).await,
            TlsNegotiationMode::Strict => {
                let mut wrapper = TlsPreloginWrapper::new(stream);
                wrapper.finish_handshake()?;
                self.connect(wrapper, server_name).await
            }
        }
    }

    /// The negotiation mode selected by the configuration.
    #[must_use]
    pub fn negotiation_mode(&self) -> TlsNegotiationMode {
        TlsNegotiationMode::from_strict(self.config.strict_mode)
    }

    /// Get the underlying configuration.
    #[must_use]
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
