//! Session recovery (connection resiliency) state and its feature block.
//!
//! When a broken connection is re-established, the client replays the state
//! of the old session to the server. The block data has two sections, each
//! prefixed by its little-endian DWORD length:
//!
//! ```text
//! initial:  database  collation  language  { id | len | data }*
//! current:  database' collation' language' { id | len | data }*
//! ```
//!
//! The initial section describes the session as it was right after login.
//! The current section only carries what changed since: a database,
//! language or collation equal to its initial value is written empty, and a
//! state slot is written only when its bytes differ from the initial ones.
//!
//! A connection that never logged in has no state to recover, and its block
//! has an empty data section.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{blob_prefix_len, identifier_len, write_blob_len, write_identifier};
use crate::error::ProtocolError;
use crate::feature_ext::{
    FeatureBlock, FeatureContext, FeatureEncoder, FeatureId, RequestedFeatures, check_written,
};
use crate::prelude::*;

/// Number of session state slots a server may report.
pub const SESSION_STATE_SLOTS: usize = 256;

/// Length byte of a present collation.
const COLLATION_LEN: u8 = 5;

/// A SQL collation as carried in session recovery data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Collation {
    /// LCID and comparison flags.
    pub info: u32,
    /// SQL sort order id.
    pub sort_id: u8,
}

impl Collation {
    /// Create a collation.
    #[must_use]
    pub const fn new(info: u32, sort_id: u8) -> Self {
        Self { info, sort_id }
    }
}

fn collation_len(collation: Option<Collation>) -> usize {
    match collation {
        Some(_) => 1 + COLLATION_LEN as usize,
        None => 1,
    }
}

fn write_collation(dst: &mut impl BufMut, collation: Option<Collation>) {
    match collation {
        Some(c) => {
            dst.put_u8(COLLATION_LEN);
            dst.put_u32_le(c.info);
            dst.put_u8(c.sort_id);
        }
        None => dst.put_u8(0),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StateSlot {
    initial: Option<Bytes>,
    current: Option<Bytes>,
    recoverable: bool,
}

impl StateSlot {
    /// Bytes for the current section, if the slot changed since login.
    fn changed(&self) -> Option<&Bytes> {
        let current = self.current.as_ref()?;
        match &self.initial {
            Some(initial) if initial == current => None,
            _ => Some(current),
        }
    }
}

/// Session state of a live connection, kept for reconnecting.
///
/// Mutated by the connection as ENVCHANGE and SESSIONSTATE tokens arrive;
/// only read by the encoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecoveryState {
    initial_database: Option<String>,
    initial_language: Option<String>,
    initial_collation: Option<Collation>,
    database: Option<String>,
    language: Option<String>,
    collation: Option<Collation>,
    slots: BTreeMap<u8, StateSlot>,
}

impl SessionRecoveryState {
    /// Capture the session as it is right after login.
    #[must_use]
    pub fn new(
        database: Option<String>,
        language: Option<String>,
        collation: Option<Collation>,
    ) -> Self {
        Self {
            initial_database: database.clone(),
            initial_language: language.clone(),
            initial_collation: collation,
            database,
            language,
            collation,
            slots: BTreeMap::new(),
        }
    }

    /// Record a database change.
    pub fn set_database(&mut self, database: impl Into<String>) {
        self.database = Some(database.into());
    }

    /// Record a language change.
    pub fn set_language(&mut self, language: impl Into<String>) {
        self.language = Some(language.into());
    }

    /// Record a collation change.
    pub fn set_collation(&mut self, collation: Collation) {
        self.collation = Some(collation);
    }

    /// Current database.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Current language.
    #[must_use]
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Current collation.
    #[must_use]
    pub fn collation(&self) -> Option<Collation> {
        self.collation
    }

    /// Store the value a state slot had at login, as announced by the
    /// server's session recovery acknowledgement.
    pub fn set_initial_state(&mut self, id: u8, data: impl Into<Bytes>) {
        let slot = self.slots.entry(id).or_default();
        slot.initial = Some(data.into());
        slot.recoverable = true;
    }

    /// Record an updated state slot from a SESSIONSTATE token.
    pub fn update_state(&mut self, id: u8, data: impl Into<Bytes>, recoverable: bool) {
        let slot = self.slots.entry(id).or_default();
        slot.current = Some(data.into());
        slot.recoverable = recoverable;
    }

    /// Forget every change made since login, as after a connection reset.
    pub fn reset(&mut self) {
        self.database.clone_from(&self.initial_database);
        self.language.clone_from(&self.initial_language);
        self.collation = self.initial_collation;
        self.slots.retain(|_, slot| slot.initial.is_some());
        for slot in self.slots.values_mut() {
            slot.current = None;
            slot.recoverable = true;
        }
    }

    /// Whether every state slot can be replayed on a new connection.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.slots.values().all(|slot| slot.recoverable)
    }

    /// Work out what the recovery block has to carry.
    pub fn diff(&self) -> Result<SessionRecoveryDiff<'_>, ProtocolError> {
        if let Some((&id, _)) = self.slots.iter().find(|(_, slot)| !slot.recoverable) {
            return Err(ProtocolError::UnrecoverableSessionState(id));
        }
        SessionRecoveryDiff::new(self)
    }
}

/// What a session recovery block carries, derived once from the state.
///
/// Lengths and bytes are both produced from this value, so the announced
/// section lengths always match what is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecoveryDiff<'a> {
    initial_database: Option<&'a str>,
    initial_collation: Option<Collation>,
    initial_language: Option<&'a str>,
    initial_slots: Vec<(u8, &'a [u8])>,
    database: Option<&'a str>,
    collation: Option<Collation>,
    language: Option<&'a str>,
    changed_slots: Vec<(u8, &'a [u8])>,
    initial_len: usize,
    current_len: usize,
}

impl<'a> SessionRecoveryDiff<'a> {
    fn new(state: &'a SessionRecoveryState) -> Result<Self, ProtocolError> {
        let initial_database = state.initial_database.as_deref();
        let initial_language = state.initial_language.as_deref();
        let database = state.database.as_deref().filter(|db| Some(*db) != initial_database);
        let language = state.language.as_deref().filter(|l| Some(*l) != initial_language);
        let collation = state.collation.filter(|c| Some(*c) != state.initial_collation);

        let initial_slots: Vec<(u8, &[u8])> = state
            .slots
            .iter()
            .filter_map(|(&id, slot)| slot.initial.as_deref().map(|data| (id, data)))
            .collect();
        let changed_slots: Vec<(u8, &[u8])> = state
            .slots
            .iter()
            .filter_map(|(&id, slot)| slot.changed().map(|data| (id, &data[..])))
            .collect();

        let initial_len = identifier_len(initial_database)?
            + collation_len(state.initial_collation)
            + identifier_len(initial_language)?
            + slots_len(&initial_slots);
        let current_len = identifier_len(database)?
            + collation_len(collation)
            + identifier_len(language)?
            + slots_len(&changed_slots);

        Ok(Self {
            initial_database,
            initial_collation: state.initial_collation,
            initial_language,
            initial_slots,
            database,
            collation,
            language,
            changed_slots,
            initial_len,
            current_len,
        })
    }

    /// Ids of the slots written to the current section.
    pub fn changed_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.changed_slots.iter().map(|(id, _)| *id)
    }

    /// Length of the initial section, without its length DWORD.
    #[must_use]
    pub fn initial_len(&self) -> usize {
        self.initial_len
    }

    /// Length of the current section, without its length DWORD.
    #[must_use]
    pub fn current_len(&self) -> usize {
        self.current_len
    }

    /// Length of the whole block data.
    #[must_use]
    pub fn data_length(&self) -> usize {
        8 + self.initial_len + self.current_len
    }

    /// Write the block data.
    pub fn write(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        dst.put_u32_le(self.initial_len as u32);
        write_identifier(dst, self.initial_database)?;
        write_collation(dst, self.initial_collation);
        write_identifier(dst, self.initial_language)?;
        write_slots(dst, &self.initial_slots);

        dst.put_u32_le(self.current_len as u32);
        write_identifier(dst, self.database)?;
        write_collation(dst, self.collation);
        write_identifier(dst, self.language)?;
        write_slots(dst, &self.changed_slots);
        Ok(())
    }
}

fn slots_len(slots: &[(u8, &[u8])]) -> usize {
    slots
        .iter()
        .map(|(_, data)| 1 + blob_prefix_len(data.len()) + data.len())
        .sum()
}

fn write_slots(dst: &mut impl BufMut, slots: &[(u8, &[u8])]) {
    for (id, data) in slots {
        dst.put_u8(*id);
        write_blob_len(dst, data.len());
        dst.put_slice(data);
    }
}

/// Encoder for the session recovery block.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionRecoveryFeature;

impl FeatureEncoder for SessionRecoveryFeature {
    fn feature_id(&self) -> FeatureId {
        FeatureId::SessionRecovery
    }

    fn flag(&self) -> RequestedFeatures {
        RequestedFeatures::SESSION_RECOVERY
    }

    fn build(&self, ctx: &FeatureContext<'_>) -> Result<FeatureBlock, ProtocolError> {
        ctx.require(RequestedFeatures::SESSION_RECOVERY, "session recovery not requested")?;
        let Some(session) = ctx.session else {
            return Ok(FeatureBlock::empty(FeatureId::SessionRecovery));
        };

        let diff = session.diff()?;
        let mut data = BytesMut::with_capacity(diff.data_length());
        diff.write(&mut data)?;
        check_written(FeatureId::SessionRecovery, diff.data_length(), data.len())?;
        Ok(FeatureBlock::new(FeatureId::SessionRecovery, data.freeze()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn requested<'a>() -> FeatureContext<'a> {
        FeatureContext::new(RequestedFeatures::SESSION_RECOVERY)
    }

    #[test]
    fn test_no_prior_session_is_empty() {
        let ctx = requested();
        let mut buf = BytesMut::new();
        let written = SessionRecoveryFeature.write(&ctx, &mut buf).unwrap();
        assert_eq!(written, SessionRecoveryFeature.compute_length(&ctx).unwrap());
        assert_eq!(&buf[..], &[0x01, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_unchanged_session() {
        let state = SessionRecoveryState::new(Some("db".into()), None, None);
        let diff = state.diff().unwrap();

        // identifier "db" (1 + 4), absent collation, absent language
        assert_eq!(diff.initial_len(), 5 + 1 + 1);
        assert_eq!(diff.current_len(), 3);
        assert_eq!(diff.changed_ids().count(), 0);

        let mut buf = BytesMut::new();
        diff.write(&mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[
                7, 0, 0, 0, 2, b'd', 0, b'b', 0, 0, 0, //
                3, 0, 0, 0, 0, 0, 0,
            ]
        );
    }

    #[test]
    fn test_changes_are_diffed() {
        let collation = Collation::new(0x0409_D000, 52);
        let mut state = SessionRecoveryState::new(Some("a".into()), None, Some(collation));
        state.set_initial_state(1, vec![1, 2, 3]);
        state.set_initial_state(2, vec![9]);
        state.update_state(1, vec![1, 2, 4], true);
        state.update_state(2, vec![9], true);
        state.update_state(7, vec![5; 300], true);
        state.set_database("b");
        state.set_collation(collation);

        let diff = state.diff().unwrap();
        assert_eq!(diff.changed_ids().collect::<Vec<_>>(), vec![1, 7]);

        let initial = 3 + 6 + 1 + (1 + 1 + 3) + (1 + 1 + 1);
        let current = 3 + 1 + 1 + (1 + 1 + 3) + (1 + 5 + 300);
        assert_eq!(diff.initial_len(), initial);
        assert_eq!(diff.current_len(), current);

        let mut buf = BytesMut::new();
        diff.write(&mut buf).unwrap();
        assert_eq!(buf.len(), diff.data_length());
        // collation in the initial section
        assert_eq!(&buf[7..13], &[0x05, 0x00, 0xD0, 0x09, 0x04, 52]);
    }

    #[test]
    fn test_unrecoverable_state_refused() {
        let mut state = SessionRecoveryState::new(None, None, None);
        state.update_state(4, vec![1], false);
        assert!(!state.is_recoverable());

        let ctx = requested().with_session(&state);
        assert_eq!(
            SessionRecoveryFeature.build(&ctx).unwrap_err(),
            ProtocolError::UnrecoverableSessionState(4)
        );
    }

    #[test]
    fn test_reset_restores_initial_values() {
        let mut state = SessionRecoveryState::new(Some("a".into()), Some("us_english".into()), None);
        state.set_initial_state(1, vec![1]);
        state.update_state(1, vec![2], true);
        state.update_state(3, vec![3], false);
        state.set_database("b");

        state.reset();
        assert_eq!(state.database(), Some("a"));
        assert!(state.is_recoverable());
        assert_eq!(state.diff().unwrap().changed_ids().count(), 0);
    }

    #[test]
    fn test_long_identifier_refused() {
        let state = SessionRecoveryState::new(Some("d".repeat(300)), None, None);
        assert_eq!(
            state.diff().unwrap_err(),
            ProtocolError::IdentifierTooLong { len: 300 }
        );
    }
}
