// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Engine state kept in the reserved area of the NV image.

use crate::{
    config::EngineConfig,
    context::ResetCounters,
    da::DaState,
    error::TpmRcBase,
    hierarchy::HierarchyState,
    platform::Platform,
    session::SessionTable,
    util::{Reader, Writer},
};

const STATE_VERSION: u8 = 2;
/// Layout without the NV global lock flag.
const STATE_VERSION_V1: u8 = 1;

/// How the previous power cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// No Shutdown command before power loss.
    Unorderly,
    Clear,
    State,
}

impl ShutdownState {
    fn tag(self) -> u8 {
        match self {
            Self::Unorderly => 0,
            Self::Clear => 1,
            Self::State => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, TpmRcBase> {
        match tag {
            0 => Ok(Self::Unorderly),
            1 => Ok(Self::Clear),
            2 => Ok(Self::State),
            _ => Err(TpmRcBase::Value),
        }
    }
}

/// Hierarchy, DA and reset bookkeeping that survives power loss.
#[derive(Clone)]
pub struct PersistentState {
    pub hierarchy: HierarchyState,
    pub da: DaState,
    pub counters: ResetCounters,
    pub shutdown: ShutdownState,
    pub object_context_id: u64,
    /// `TPM2_NV_GlobalWriteLock` holds until the next TPM Reset or Restart.
    pub nv_global_lock: bool,
}

impl PersistentState {
    /// Fresh state of a newly manufactured TPM.
    pub fn manufacture(platform: &mut dyn Platform, config: &EngineConfig) -> Self {
        Self {
            hierarchy: HierarchyState::manufacture(platform),
            da: DaState::new(&config.dictionary_attack),
            counters: ResetCounters::default(),
            shutdown: ShutdownState::Clear,
            object_context_id: 1,
            nv_global_lock: false,
        }
    }

    /// Encodes the state together with the saved-session bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` for a field too large for its encoding.
    pub fn encode(&self, sessions: &SessionTable) -> Result<Vec<u8>, TpmRcBase> {
        let mut w = Writer::new();
        w.u8(STATE_VERSION);
        self.hierarchy.write_to(&mut w)?;
        self.da.write_to(&mut w);
        w.u64(self.counters.total_reset_count)
            .u32(self.counters.clear_count)
            .u8(self.shutdown.tag())
            .u64(self.object_context_id)
            .u8(u8::from(self.nv_global_lock));
        sessions.write_to(&mut w)?;
        Ok(w.into_vec())
    }

    /// Decodes the state and restores the saved-session bookkeeping into
    /// `sessions`.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Value` for an unknown version and `TpmRcBase::Size` for
    /// truncated input.
    pub fn decode(bytes: &[u8], sessions: &mut SessionTable) -> Result<Self, TpmRcBase> {
        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        if version != STATE_VERSION && version != STATE_VERSION_V1 {
            return Err(TpmRcBase::Value);
        }
        let hierarchy = HierarchyState::read_from(&mut r)?;
        let da = DaState::read_from(&mut r)?;
        let counters = ResetCounters {
            total_reset_count: r.u64()?,
            clear_count: r.u32()?,
        };
        let shutdown = ShutdownState::from_tag(r.u8()?)?;
        let object_context_id = r.u64()?;
        let nv_global_lock = version != STATE_VERSION_V1 && r.u8()? != 0;
        sessions.read_from(&mut r, version != STATE_VERSION_V1)?;
        r.finish()?;
        Ok(Self {
            hierarchy,
            da,
            counters,
            shutdown,
            object_context_id,
            nv_global_lock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        platform::SimulatedPlatform,
        session::{Session, SessionKind},
    };
    use tpm2_protocol::data::TpmAlgId;

    #[test]
    fn test_state_survives_encoding() {
        let config = EngineConfig::default();
        let mut platform = SimulatedPlatform::new(None, 0);
        let mut state = PersistentState::manufacture(&mut platform, &config);
        state.counters.total_reset_count = 9;
        state.shutdown = ShutdownState::State;
        state.da.failed_tries = 2;
        state.nv_global_lock = true;

        let mut sessions = SessionTable::new(&config);
        let handle = sessions
            .create(Session::new(SessionKind::Hmac, TpmAlgId::Sha256, 32))
            .unwrap();
        sessions.context_save(handle).unwrap();
        let bytes = state.encode(&sessions).unwrap();

        let mut restored_sessions = SessionTable::new(&config);
        let restored = PersistentState::decode(&bytes, &mut restored_sessions).unwrap();
        assert_eq!(restored.counters.total_reset_count, 9);
        assert_eq!(restored.shutdown, ShutdownState::State);
        assert!(restored.nv_global_lock);
        assert_eq!(restored.da, state.da);
        assert_eq!(*restored.hierarchy.owner.proof, *state.hierarchy.owner.proof);
        assert!(restored_sessions.is_saved(handle));
        assert_eq!(restored_sessions.context_counter(), sessions.context_counter());
    }
}
