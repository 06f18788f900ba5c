//! LOGIN7 feature extension blocks.
//!
//! Each optional capability the client announces during login is written as
//!
//! ```text
//! +----+----------------+------------------+
//! | id | dataLength LE  | data             |
//! | u8 |      u32       | dataLength bytes |
//! +----+----------------+------------------+
//! ```
//!
//! and the sequence is closed by a single `0xFF` terminator byte.
//!
//! The login writer must know the exact size of the feature data before it
//! writes it, because the LOGIN7 fixed header carries offsets. Every
//! [`FeatureEncoder`] therefore builds a [`FeatureBlock`] once, and both the
//! announced length and the written bytes are derived from that single value.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::fed_auth::{FedAuthFeature, FedAuthRequest};
use crate::prelude::*;
use crate::session_recovery::{SessionRecoveryFeature, SessionRecoveryState};

/// Size of the id byte plus the `dataLength` DWORD.
pub const FEATURE_HEADER_SIZE: usize = 5;

/// Highest column encryption (Always Encrypted) version this client speaks.
pub const MAX_SUPPORTED_TCE_VERSION: u8 = 0x03;

/// Highest data classification version this client speaks.
pub const MAX_SUPPORTED_DATA_CLASSIFICATION_VERSION: u8 = 0x02;

/// Feature extension types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FeatureId {
    /// Session recovery.
    SessionRecovery = 0x01,
    /// Federated authentication.
    FedAuth = 0x02,
    /// Column encryption.
    ColumnEncryption = 0x04,
    /// Global transactions.
    GlobalTransactions = 0x05,
    /// Azure SQL Support for DB.
    AzureSqlSupport = 0x08,
    /// Data classification.
    DataClassification = 0x09,
    /// UTF-8 support.
    Utf8Support = 0x0A,
    /// Azure SQL DNS Caching.
    AzureSqlDnsCaching = 0x0B,
    /// Terminator.
    Terminator = 0xFF,
}

bitflags! {
    /// Capabilities requested by the connection for the login packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequestedFeatures: u16 {
        /// Connection resiliency (reconnect with session state).
        const SESSION_RECOVERY = 0x0001;
        /// Federated authentication.
        const FED_AUTH = 0x0002;
        /// Always Encrypted.
        const COLUMN_ENCRYPTION = 0x0004;
        /// Distributed transactions across Azure SQL databases.
        const GLOBAL_TRANSACTIONS = 0x0008;
        /// Sensitivity classification metadata.
        const DATA_CLASSIFICATION = 0x0010;
        /// UTF-8 collations.
        const UTF8_SUPPORT = 0x0020;
        /// Server-provided DNS caching hints.
        const AZURE_SQL_DNS_CACHING = 0x0040;
    }
}

/// Negotiation state a feature encoder reads from.
///
/// Encoders never mutate the state they are given.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureContext<'a> {
    /// Capabilities the connection asks for.
    pub requested: RequestedFeatures,
    /// Federated authentication parameters, if any.
    pub fed_auth: Option<&'a FedAuthRequest>,
    /// Session state of the connection being recovered, if any.
    pub session: Option<&'a SessionRecoveryState>,
}

impl<'a> FeatureContext<'a> {
    /// Create a context requesting the given capabilities.
    #[must_use]
    pub fn new(requested: RequestedFeatures) -> Self {
        Self {
            requested,
            fed_auth: None,
            session: None,
        }
    }

    /// Attach federated authentication parameters.
    #[must_use]
    pub fn with_fed_auth(mut self, fed_auth: &'a FedAuthRequest) -> Self {
        self.fed_auth = Some(fed_auth);
        self
    }

    /// Attach the session state of a connection being recovered.
    #[must_use]
    pub fn with_session(mut self, session: &'a SessionRecoveryState) -> Self {
        self.session = Some(session);
        self
    }

    /// Fail unless `flag` was requested.
    pub(crate) fn require(
        &self,
        flag: RequestedFeatures,
        what: &'static str,
    ) -> Result<(), ProtocolError> {
        if self.requested.contains(flag) {
            Ok(())
        } else {
            Err(ProtocolError::MissingFeatureState(what))
        }
    }
}

/// One fully built feature block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureBlock {
    /// Feature ID.
    pub id: FeatureId,
    /// Feature data.
    pub data: Bytes,
}

impl FeatureBlock {
    /// Create a block with the given data.
    #[must_use]
    pub fn new(id: FeatureId, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// Create a block with no data.
    #[must_use]
    pub fn empty(id: FeatureId) -> Self {
        Self::new(id, Bytes::new())
    }

    /// Value of the `dataLength` field.
    #[must_use]
    pub fn data_length(&self) -> usize {
        self.data.len()
    }

    /// Total encoded size, including the id byte and the length DWORD.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FEATURE_HEADER_SIZE + self.data.len()
    }

    /// Encode the block.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.id as u8);
        dst.put_u32_le(self.data.len() as u32);
        dst.put_slice(&self.data);
    }
}

/// An encoder for one capability block.
pub trait FeatureEncoder: Send + Sync {
    /// Feature this encoder writes.
    fn feature_id(&self) -> FeatureId;

    /// Request flag that enables this feature.
    fn flag(&self) -> RequestedFeatures;

    /// Build the block for the given state.
    fn build(&self, ctx: &FeatureContext<'_>) -> Result<FeatureBlock, ProtocolError>;

    /// Exact number of bytes [`write`](Self::write) will emit for `ctx`,
    /// including the id byte and the length DWORD.
    fn compute_length(&self, ctx: &FeatureContext<'_>) -> Result<usize, ProtocolError> {
        Ok(self.build(ctx)?.encoded_len())
    }

    /// Write the block and return the number of bytes written.
    fn write(&self, ctx: &FeatureContext<'_>, dst: &mut BytesMut) -> Result<usize, ProtocolError> {
        let block = self.build(ctx)?;
        let start = dst.len();
        block.encode(dst);
        Ok(dst.len() - start)
    }
}

/// A capability announced by its id and an optional version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleFeature {
    id: FeatureId,
    flag: RequestedFeatures,
    version: Option<u8>,
}

impl SimpleFeature {
    /// UTF-8 support: no data.
    pub const UTF8_SUPPORT: Self = Self {
        id: FeatureId::Utf8Support,
        flag: RequestedFeatures::UTF8_SUPPORT,
        version: None,
    };

    /// Global transactions: no data.
    pub const GLOBAL_TRANSACTIONS: Self = Self {
        id: FeatureId::GlobalTransactions,
        flag: RequestedFeatures::GLOBAL_TRANSACTIONS,
        version: None,
    };

    /// Azure SQL DNS caching: no data.
    pub const AZURE_SQL_DNS_CACHING: Self = Self {
        id: FeatureId::AzureSqlDnsCaching,
        flag: RequestedFeatures::AZURE_SQL_DNS_CACHING,
        version: None,
    };

    /// Column encryption at the highest supported version.
    pub const COLUMN_ENCRYPTION: Self = Self::column_encryption(MAX_SUPPORTED_TCE_VERSION);

    /// Data classification at the highest supported version.
    pub const DATA_CLASSIFICATION: Self =
        Self::data_classification(MAX_SUPPORTED_DATA_CLASSIFICATION_VERSION);

    /// Column encryption announcing a specific version.
    #[must_use]
    pub const fn column_encryption(version: u8) -> Self {
        Self {
            id: FeatureId::ColumnEncryption,
            flag: RequestedFeatures::COLUMN_ENCRYPTION,
            version: Some(version),
        }
    }

    /// Data classification announcing a specific version.
    #[must_use]
    pub const fn data_classification(version: u8) -> Self {
        Self {
            id: FeatureId::DataClassification,
            flag: RequestedFeatures::DATA_CLASSIFICATION,
            version: Some(version),
        }
    }

    /// Announced version, if the capability is versioned.
    #[must_use]
    pub const fn version(&self) -> Option<u8> {
        self.version
    }
}

impl FeatureEncoder for SimpleFeature {
    fn feature_id(&self) -> FeatureId {
        self.id
    }

    fn flag(&self) -> RequestedFeatures {
        self.flag
    }

    fn build(&self, _ctx: &FeatureContext<'_>) -> Result<FeatureBlock, ProtocolError> {
        Ok(match self.version {
            Some(version) => FeatureBlock::new(self.id, vec![version]),
            None => FeatureBlock::empty(self.id),
        })
    }
}

/// Encoders in the order their blocks appear on the wire.
static FEATURE_ORDER: [&dyn FeatureEncoder; 7] = [
    &SessionRecoveryFeature,
    &FedAuthFeature,
    &SimpleFeature::COLUMN_ENCRYPTION,
    &SimpleFeature::GLOBAL_TRANSACTIONS,
    &SimpleFeature::DATA_CLASSIFICATION,
    &SimpleFeature::UTF8_SUPPORT,
    &SimpleFeature::AZURE_SQL_DNS_CACHING,
];

/// The complete feature extension data of a LOGIN7 packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeatureExtension {
    blocks: Vec<FeatureBlock>,
}

impl FeatureExtension {
    /// Build the blocks for every capability requested in `ctx`.
    pub fn build(ctx: &FeatureContext<'_>) -> Result<Self, ProtocolError> {
        let mut blocks = Vec::new();
        for encoder in FEATURE_ORDER.iter() {
            if ctx.requested.contains(encoder.flag()) {
                blocks.push(encoder.build(ctx)?);
            }
        }
        Ok(Self { blocks })
    }

    /// Built blocks in wire order.
    #[must_use]
    pub fn blocks(&self) -> &[FeatureBlock] {
        &self.blocks
    }

    /// Whether no capability was requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total encoded size including the terminator.
    #[must_use]
    pub fn compute_length(&self) -> usize {
        self.blocks.iter().map(FeatureBlock::encoded_len).sum::<usize>() + 1
    }

    /// Write every block followed by the terminator.
    ///
    /// Returns the number of bytes written, which always equals
    /// [`compute_length`](Self::compute_length).
    pub fn write(&self, dst: &mut BytesMut) -> Result<usize, ProtocolError> {
        let start = dst.len();
        for block in &self.blocks {
            let before = dst.len();
            block.encode(dst);
            check_written(block.id, block.encoded_len(), dst.len() - before)?;
        }
        dst.put_u8(FeatureId::Terminator as u8);

        let written = dst.len() - start;
        check_written(FeatureId::Terminator, self.compute_length(), written)?;
        Ok(written)
    }

    /// Encode into a new buffer.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.compute_length());
        self.write(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Compare the bytes a writer emitted with the length it announced.
pub(crate) fn check_written(
    feature: FeatureId,
    computed: usize,
    written: usize,
) -> Result<(), ProtocolError> {
    debug_assert_eq!(computed, written, "feature {feature:?} length mismatch");
    if computed == written {
        Ok(())
    } else {
        Err(ProtocolError::FeatureLengthMismatch {
            feature,
            computed,
            written,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unversioned_features_have_no_data() {
        let ctx = FeatureContext::default();
        for feature in [
            SimpleFeature::UTF8_SUPPORT,
            SimpleFeature::GLOBAL_TRANSACTIONS,
            SimpleFeature::AZURE_SQL_DNS_CACHING,
        ] {
            let mut buf = BytesMut::new();
            let written = feature.write(&ctx, &mut buf).unwrap();
            assert_eq!(written, 5);
            assert_eq!(feature.compute_length(&ctx).unwrap(), written);
            assert_eq!(&buf[1..], &[0, 0, 0, 0]);
        }
    }

    #[test]
    fn test_versioned_features_carry_one_byte() {
        let ctx = FeatureContext::default();
        let mut buf = BytesMut::new();
        SimpleFeature::COLUMN_ENCRYPTION.write(&ctx, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x04, 0x01, 0x00, 0x00, 0x00, 0x03]);

        buf.clear();
        SimpleFeature::DATA_CLASSIFICATION.write(&ctx, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x09, 0x01, 0x00, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn test_empty_extension_is_terminator_only() {
        let ext = FeatureExtension::build(&FeatureContext::default()).unwrap();
        assert!(ext.is_empty());
        assert_eq!(ext.compute_length(), 1);
        assert_eq!(&ext.to_bytes().unwrap()[..], &[0xFF]);
    }

    #[test]
    fn test_extension_order_is_fixed() {
        let ctx = FeatureContext::new(
            RequestedFeatures::UTF8_SUPPORT
                | RequestedFeatures::SESSION_RECOVERY
                | RequestedFeatures::GLOBAL_TRANSACTIONS,
        );
        let ext = FeatureExtension::build(&ctx).unwrap();
        let ids: Vec<_> = ext.blocks().iter().map(|b| b.id).collect();
        assert_eq!(
            ids,
            vec![
                FeatureId::SessionRecovery,
                FeatureId::GlobalTransactions,
                FeatureId::Utf8Support,
            ]
        );

        let bytes = ext.to_bytes().unwrap();
        assert_eq!(bytes.len(), ext.compute_length());
        assert_eq!(bytes.len(), 5 + 5 + 5 + 1);
        assert_eq!(bytes[bytes.len() - 1], 0xFF);
    }

    #[test]
    fn test_fed_auth_requested_without_parameters() {
        let ctx = FeatureContext::new(RequestedFeatures::FED_AUTH);
        assert!(matches!(
            FeatureExtension::build(&ctx),
            Err(ProtocolError::MissingFeatureState(_))
        ));
    }

    #[test]
    fn test_check_written_accepts_matching_length() {
        assert!(check_written(FeatureId::Utf8Support, 5, 5).is_ok());
    }
}
