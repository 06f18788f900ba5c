//! Federated authentication feature block.
//!
//! Only the encoding of the request lives here. Acquiring the token is the
//! job of the authentication layer, which hands over the finished bytes.
//!
//! The block data starts with an options byte:
//!
//! ```text
//!  7 6 5 4 3 2 1 0
//! +-------------+-+
//! |   library   |R|   R = fed-auth required echo from pre-login
//! +-------------+-+
//! ```
//!
//! followed by a workflow byte for MSAL, or a little-endian token length and
//! the token itself for a security token.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::feature_ext::{FeatureBlock, FeatureContext, FeatureEncoder, FeatureId, RequestedFeatures};

/// Federated authentication library announced in the options byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FedAuthLibrary {
    /// Windows Live ID. Not supported by this client.
    LiveId = 0x00,
    /// A token obtained out of band.
    SecurityToken = 0x01,
    /// Microsoft Authentication Library; the server drives the workflow.
    Msal = 0x02,
    /// Reserved value meaning "no library".
    Reserved = 0x7F,
}

impl FedAuthLibrary {
    /// Create a library from a raw value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::LiveId),
            0x01 => Ok(Self::SecurityToken),
            0x02 => Ok(Self::Msal),
            0x7F => Ok(Self::Reserved),
            _ => Err(ProtocolError::UnsupportedFedAuthLibrary(value)),
        }
    }
}

/// Authentication method selected on the connection, as seen by MSAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AuthenticationMethod {
    /// Username and password.
    Password,
    /// Integrated Windows authentication.
    Integrated,
    /// Interactive browser sign-in.
    Interactive,
    /// Application id and secret or certificate.
    ServicePrincipal,
    /// Device code flow.
    DeviceCodeFlow,
    /// Managed identity of the host.
    ManagedIdentity,
    /// Default credential chain.
    Default,
    /// Workload identity federation.
    WorkloadIdentity,
    /// Caller-supplied token credential.
    TokenCredential,
}

impl AuthenticationMethod {
    /// Workflow byte written after the options byte.
    #[must_use]
    pub const fn workflow(self) -> u8 {
        match self {
            Self::Password | Self::ServicePrincipal => 0x01,
            Self::Integrated => 0x02,
            Self::Interactive
            | Self::DeviceCodeFlow
            | Self::ManagedIdentity
            | Self::Default
            | Self::WorkloadIdentity
            | Self::TokenCredential => 0x03,
        }
    }
}

/// Federated authentication parameters for the login packet.
#[derive(Clone, PartialEq, Eq)]
pub struct FedAuthRequest {
    /// Library type.
    pub library: FedAuthLibrary,
    /// Workflow for MSAL.
    pub method: Option<AuthenticationMethod>,
    /// Echo of the server's pre-login FEDAUTHREQUIRED option.
    pub fed_auth_required: bool,
    /// Access token for [`FedAuthLibrary::SecurityToken`].
    pub token: Bytes,
}

impl FedAuthRequest {
    /// Request an MSAL-driven workflow.
    #[must_use]
    pub fn msal(method: AuthenticationMethod) -> Self {
        Self {
            library: FedAuthLibrary::Msal,
            method: Some(method),
            fed_auth_required: false,
            token: Bytes::new(),
        }
    }

    /// Send a pre-acquired access token.
    ///
    /// The token is expected to be UTF-16LE encoded already.
    #[must_use]
    pub fn security_token(token: impl Into<Bytes>) -> Self {
        Self {
            library: FedAuthLibrary::SecurityToken,
            method: None,
            fed_auth_required: false,
            token: token.into(),
        }
    }

    /// Echo the server's FEDAUTHREQUIRED pre-login option.
    #[must_use]
    pub fn with_fed_auth_required(mut self, required: bool) -> Self {
        self.fed_auth_required = required;
        self
    }

    /// The options byte.
    #[must_use]
    pub const fn options(&self) -> u8 {
        ((self.library as u8) << 1) | self.fed_auth_required as u8
    }
}

impl core::fmt::Debug for FedAuthRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FedAuthRequest")
            .field("library", &self.library)
            .field("method", &self.method)
            .field("fed_auth_required", &self.fed_auth_required)
            .field("token", &format_args!("<{} bytes>", self.token.len()))
            .finish()
    }
}

/// Encoder for the federated authentication block.
#[derive(Debug, Clone, Copy, Default)]
pub struct FedAuthFeature;

impl FeatureEncoder for FedAuthFeature {
    fn feature_id(&self) -> FeatureId {
        FeatureId::FedAuth
    }

    fn flag(&self) -> RequestedFeatures {
        RequestedFeatures::FED_AUTH
    }

    fn build(&self, ctx: &FeatureContext<'_>) -> Result<FeatureBlock, ProtocolError> {
        ctx.require(RequestedFeatures::FED_AUTH, "federated authentication not requested")?;
        let request = ctx
            .fed_auth
            .ok_or(ProtocolError::MissingFeatureState("federated authentication parameters"))?;

        let data = match request.library {
            FedAuthLibrary::Msal => {
                let method = request
                    .method
                    .ok_or(ProtocolError::MissingFeatureState("MSAL authentication method"))?;
                let mut buf = BytesMut::with_capacity(2);
                buf.put_u8(request.options());
                buf.put_u8(method.workflow());
                buf
            }
            FedAuthLibrary::SecurityToken => {
                let mut buf = BytesMut::with_capacity(5 + request.token.len());
                buf.put_u8(request.options());
                buf.put_u32_le(request.token.len() as u32);
                buf.put_slice(&request.token);
                buf
            }
            other => return Err(ProtocolError::UnsupportedFedAuthLibrary(other as u8)),
        };

        Ok(FeatureBlock::new(FeatureId::FedAuth, data.freeze()))
    }
}
