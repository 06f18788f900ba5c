//! Length agreement tests for the LOGIN7 feature encoders.
//!
//! Every encoder announces its size before it writes. These tests generate
//! arbitrary negotiation state and check that the announced and written
//! sizes never diverge.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::BytesMut;
use proptest::prelude::*;
use tds_protocol::{
    AuthenticationMethod, Collation, FeatureContext, FeatureEncoder, FeatureExtension,
    FedAuthFeature, FedAuthRequest, ProtocolError, RequestedFeatures, SessionRecoveryFeature,
    SessionRecoveryState, SimpleFeature,
};

// ============================================================================
// Strategies
// ============================================================================

fn identifier() -> impl Strategy<Value = Option<String>> {
    proptest::option::of("[a-zA-Z0-9_ äöü]{0,40}")
}

fn collation() -> impl Strategy<Value = Option<Collation>> {
    proptest::option::of((any::<u32>(), any::<u8>()).prop_map(|(i, s)| Collation::new(i, s)))
}

fn slot_data() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        proptest::collection::vec(any::<u8>(), 0..8),
        proptest::collection::vec(any::<u8>(), 250..300),
    ]
}

fn session_state() -> impl Strategy<Value = SessionRecoveryState> {
    (
        identifier(),
        identifier(),
        collation(),
        identifier(),
        identifier(),
        collation(),
        proptest::collection::vec((any::<u8>(), slot_data()), 0..6),
        proptest::collection::vec((any::<u8>(), slot_data()), 0..6),
    )
        .prop_map(|(db, lang, coll, new_db, new_lang, new_coll, initial, updates)| {
            let mut state = SessionRecoveryState::new(db, lang, coll);
            for (id, data) in initial {
                state.set_initial_state(id, data);
            }
            for (id, data) in updates {
                state.update_state(id, data, true);
            }
            if let Some(db) = new_db {
                state.set_database(db);
            }
            if let Some(lang) = new_lang {
                state.set_language(lang);
            }
            if let Some(coll) = new_coll {
                state.set_collation(coll);
            }
            state
        })
}

fn auth_method() -> impl Strategy<Value = AuthenticationMethod> {
    prop_oneof![
        Just(AuthenticationMethod::Password),
        Just(AuthenticationMethod::Integrated),
        Just(AuthenticationMethod::Interactive),
        Just(AuthenticationMethod::ServicePrincipal),
        Just(AuthenticationMethod::DeviceCodeFlow),
        Just(AuthenticationMethod::ManagedIdentity),
        Just(AuthenticationMethod::Default),
        Just(AuthenticationMethod::WorkloadIdentity),
        Just(AuthenticationMethod::TokenCredential),
    ]
}

fn fed_auth_request() -> impl Strategy<Value = FedAuthRequest> {
    prop_oneof![
        (auth_method(), any::<bool>())
            .prop_map(|(m, r)| FedAuthRequest::msal(m).with_fed_auth_required(r)),
        (proptest::collection::vec(any::<u8>(), 0..512), any::<bool>())
            .prop_map(|(t, r)| FedAuthRequest::security_token(t).with_fed_auth_required(r)),
    ]
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn session_recovery_length_matches_written(state in session_state()) {
        let ctx = FeatureContext::new(RequestedFeatures::SESSION_RECOVERY).with_session(&state);

        let computed = SessionRecoveryFeature.compute_length(&ctx).unwrap();
        let mut buf = BytesMut::new();
        let written = SessionRecoveryFeature.write(&ctx, &mut buf).unwrap();

        prop_assert_eq!(computed, written);
        prop_assert_eq!(buf.len(), written);

        let data_length = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        prop_assert_eq!(data_length, written - 5);

        let initial_len = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
        let current_at = 9 + initial_len;
        let current_len = u32::from_le_bytes([
            buf[current_at],
            buf[current_at + 1],
            buf[current_at + 2],
            buf[current_at + 3],
        ]) as usize;
        prop_assert_eq!(current_at + 4 + current_len, buf.len());
    }

    #[test]
    fn fed_auth_length_matches_written(request in fed_auth_request()) {
        let ctx = FeatureContext::new(RequestedFeatures::FED_AUTH).with_fed_auth(&request);

        let computed = FedAuthFeature.compute_length(&ctx).unwrap();
        let mut buf = BytesMut::new();
        let written = FedAuthFeature.write(&ctx, &mut buf).unwrap();
        prop_assert_eq!(computed, written);
        prop_assert_eq!(buf[5], request.options());
    }

    #[test]
    fn extension_length_matches_written(
        bits in any::<u16>(),
        state in proptest::option::of(session_state()),
        request in fed_auth_request(),
    ) {
        let mut requested = RequestedFeatures::from_bits_truncate(bits);
        requested.remove(RequestedFeatures::FED_AUTH);
        let mut ctx = FeatureContext::new(requested | RequestedFeatures::FED_AUTH)
            .with_fed_auth(&request);
        if let Some(state) = state.as_ref() {
            ctx = ctx.with_session(state);
        }

        let ext = FeatureExtension::build(&ctx).unwrap();
        let mut buf = BytesMut::new();
        let written = ext.write(&mut buf).unwrap();
        prop_assert_eq!(written, ext.compute_length());
        prop_assert_eq!(buf[buf.len() - 1], 0xFF);
    }
}

// ============================================================================
// Fixed cases
// ============================================================================

#[test]
fn test_session_recovery_without_prior_session() {
    let ctx = FeatureContext::new(
        RequestedFeatures::SESSION_RECOVERY
            | RequestedFeatures::UTF8_SUPPORT
            | RequestedFeatures::COLUMN_ENCRYPTION,
    );
    let block = SessionRecoveryFeature.build(&ctx).unwrap();
    assert_eq!(block.data_length(), 0);

    let mut buf = BytesMut::new();
    SessionRecoveryFeature.write(&ctx, &mut buf).unwrap();
    // id followed by a zero DWORD
    assert_eq!(&buf[..], &[0x01, 0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn test_full_login_feature_data() {
    let mut state = SessionRecoveryState::new(Some("master".into()), Some("us_english".into()), None);
    state.set_database("orders");
    let request = FedAuthRequest::msal(AuthenticationMethod::ManagedIdentity);
    let ctx = FeatureContext::new(RequestedFeatures::all())
        .with_session(&state)
        .with_fed_auth(&request);

    let ext = FeatureExtension::build(&ctx).unwrap();
    assert_eq!(ext.blocks().len(), 7);

    let bytes = ext.to_bytes().unwrap();
    assert_eq!(bytes.len(), ext.compute_length());
    assert_eq!(bytes[0], 0x01);
    assert_eq!(*bytes.last().unwrap(), 0xFF);
}

#[test]
fn test_feature_data_length_is_little_endian() {
    let ctx = FeatureContext::default();
    let mut buf = BytesMut::new();
    SimpleFeature::COLUMN_ENCRYPTION.write(&ctx, &mut buf).unwrap();
    // id, dataLength 1 low byte first, version
    assert_eq!(&buf[..], &[0x04, 0x01, 0x00, 0x00, 0x00, 0x03]);
}

#[test]
fn test_simple_feature_versions() {
    let ctx = FeatureContext::default();
    assert_eq!(SimpleFeature::COLUMN_ENCRYPTION.compute_length(&ctx).unwrap(), 6);
    assert_eq!(SimpleFeature::UTF8_SUPPORT.compute_length(&ctx).unwrap(), 5);
    assert_eq!(SimpleFeature::column_encryption(1).version(), Some(1));
}

#[test]
fn test_missing_session_flag_is_contract_violation() {
    let state = SessionRecoveryState::default();
    let ctx = FeatureContext::new(RequestedFeatures::UTF8_SUPPORT).with_session(&state);
    assert!(matches!(
        SessionRecoveryFeature.build(&ctx),
        Err(ProtocolError::MissingFeatureState(_))
    ));
}
