// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Authorization sessions and the active session table.
//!
//! A session is either loaded into one of a few RAM slots or saved, in
//! which case only its context ID is tracked here. The distance between
//! the newest context ID and the oldest outstanding saved one is bounded
//! by the configured gap limit.

use crate::{
    config::EngineConfig,
    crypto::hash_alg_from_u16,
    error::TpmRcBase,
    handle::{HandleType, HMAC_SESSION_FIRST, HR_HANDLE_MASK, POLICY_SESSION_FIRST},
    util::{Reader, Writer},
};
use bitflags::bitflags;
use log::{debug, warn};
use tpm2_protocol::data::TpmAlgId;
use zeroize::Zeroizing;

/// `TPM_SE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

impl TryFrom<u8> for SessionKind {
    type Error = TpmRcBase;

    fn try_from(value: u8) -> Result<Self, TpmRcBase> {
        match value {
            0x00 => Ok(Self::Hmac),
            0x01 => Ok(Self::Policy),
            0x03 => Ok(Self::Trial),
            _ => Err(TpmRcBase::Value),
        }
    }
}

/// Parameter encryption algorithm of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSymmetric {
    Null,
    Xor(TpmAlgId),
    AesCfb(u16),
}

pub const TPM_ALG_XOR: u16 = 0x000A;
pub const TPM_ALG_AES: u16 = 0x0006;
pub const TPM_ALG_CFB: u16 = 0x0043;
pub const TPM_ALG_NULL: u16 = 0x0010;

impl SessionSymmetric {
    /// Encodes as `TPMT_SYM_DEF`.
    pub fn write_to(self, w: &mut Writer) {
        match self {
            Self::Null => {
                w.u16(TPM_ALG_NULL);
            }
            Self::Xor(hash) => {
                w.u16(TPM_ALG_XOR).u16(hash as u16);
            }
            Self::AesCfb(bits) => {
                w.u16(TPM_ALG_AES).u16(bits).u16(TPM_ALG_CFB);
            }
        }
    }

    /// Decodes a `TPMT_SYM_DEF`.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Symmetric` for anything but XOR, AES-128/256-CFB or
    /// NULL.
    pub fn read_from(r: &mut Reader<'_>) -> Result<Self, TpmRcBase> {
        match r.u16()? {
            TPM_ALG_NULL => Ok(Self::Null),
            TPM_ALG_XOR => {
                let hash = hash_alg_from_u16(r.u16()?).ok_or(TpmRcBase::Symmetric)?;
                Ok(Self::Xor(hash))
            }
            TPM_ALG_AES => {
                let bits = r.u16()?;
                let mode = r.u16()?;
                if !matches!(bits, 128 | 256) || mode != TPM_ALG_CFB {
                    return Err(TpmRcBase::Symmetric);
                }
                Ok(Self::AesCfb(bits))
            }
            _ => Err(TpmRcBase::Symmetric),
        }
    }
}

bitflags! {
    /// Per-session state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionFlags: u32 {
        const BOUND = 1 << 0;
        const DA_BOUND = 1 << 1;
        const LOCKOUT_BOUND = 1 << 2;
        const AUTH_VALUE_NEEDED = 1 << 3;
        const PASSWORD_NEEDED = 1 << 4;
        const CP_HASH_DEFINED = 1 << 5;
        const NAME_HASH_DEFINED = 1 << 6;
        const NV_WRITTEN_CHECK = 1 << 7;
        const NV_WRITTEN_STATE = 1 << 8;
        const AUDIT = 1 << 9;
    }
}

/// An authorization session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub kind: SessionKind,
    pub auth_hash: TpmAlgId,
    pub nonce_tpm: Vec<u8>,
    pub session_key: Zeroizing<Vec<u8>>,
    /// `Name ^ authValue` of the bind entity.
    pub bind: Option<Vec<u8>>,
    pub symmetric: SessionSymmetric,
    pub policy_digest: Vec<u8>,
    pub audit_digest: Vec<u8>,
    pub flags: SessionFlags,
    pub start_time: u64,
    /// Absolute platform time after which the policy session expires.
    pub timeout: Option<u64>,
    pub command_code: Option<u32>,
    /// cpHash or nameHash, selected by the flags.
    pub cp_hash: Option<Vec<u8>>,
    /// `TPMA_LOCALITY` mask.
    pub locality: Option<u8>,
}

impl Session {
    #[must_use]
    pub fn new(kind: SessionKind, auth_hash: TpmAlgId, digest_len: usize) -> Self {
        Self {
            kind,
            auth_hash,
            nonce_tpm: Vec::new(),
            session_key: Zeroizing::default(),
            bind: None,
            symmetric: SessionSymmetric::Null,
            policy_digest: vec![0; digest_len],
            audit_digest: Vec::new(),
            flags: SessionFlags::empty(),
            start_time: 0,
            timeout: None,
            command_code: None,
            cp_hash: None,
            locality: None,
        }
    }

    #[must_use]
    pub fn is_policy(&self) -> bool {
        matches!(self.kind, SessionKind::Policy | SessionKind::Trial)
    }

    /// Handle range of the session kind.
    #[must_use]
    pub fn handle_base(&self) -> u32 {
        if self.is_policy() {
            POLICY_SESSION_FIRST
        } else {
            HMAC_SESSION_FIRST
        }
    }

    /// Resets the policy state, as done by `TPM2_PolicyRestart`.
    pub fn restart_policy(&mut self, now: u64) {
        self.policy_digest.fill(0);
        self.flags.remove(
            SessionFlags::AUTH_VALUE_NEEDED
                | SessionFlags::PASSWORD_NEEDED
                | SessionFlags::CP_HASH_DEFINED
                | SessionFlags::NAME_HASH_DEFINED
                | SessionFlags::NV_WRITTEN_CHECK
                | SessionFlags::NV_WRITTEN_STATE,
        );
        self.start_time = now;
        self.timeout = None;
        self.command_code = None;
        self.cp_hash = None;
        self.locality = None;
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` for a field too large for its `TPM2B`.
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
        let mut w = Writer::new();
        w.u8(self.kind as u8)
            .u16(self.auth_hash as u16)
            .tpm2b(&self.nonce_tpm)?
            .tpm2b(&self.session_key)?;
        match &self.bind {
            Some(bind) => w.u8(1).tpm2b(bind)?,
            None => w.u8(0),
        };
        self.symmetric.write_to(&mut w);
        w.tpm2b(&self.policy_digest)?
            .tpm2b(&self.audit_digest)?
            .u32(self.flags.bits())
            .u64(self.start_time);
        match self.timeout {
            Some(t) => w.u8(1).u64(t),
            None => w.u8(0),
        };
        match self.command_code {
            Some(cc) => w.u8(1).u32(cc),
            None => w.u8(0),
        };
        match &self.cp_hash {
            Some(hash) => w.u8(1).tpm2b(hash)?,
            None => w.u8(0),
        };
        match self.locality {
            Some(locality) => w.u8(1).u8(locality),
            None => w.u8(0),
        };
        Ok(Zeroizing::new(w.into_vec()))
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Size`, `TpmRcBase::Value` or `TpmRcBase::Hash` for
    /// malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TpmRcBase> {
        let mut r = Reader::new(bytes);
        let kind = SessionKind::try_from(r.u8()?)?;
        let auth_hash = hash_alg_from_u16(r.u16()?).ok_or(TpmRcBase::Hash)?;
        let nonce_tpm = r.tpm2b()?.to_vec();
        let session_key = Zeroizing::new(r.tpm2b()?.to_vec());
        let bind = match r.u8()? {
            0 => None,
            _ => Some(r.tpm2b()?.to_vec()),
        };
        let symmetric = SessionSymmetric::read_from(&mut r)?;
        let policy_digest = r.tpm2b()?.to_vec();
        let audit_digest = r.tpm2b()?.to_vec();
        let flags = SessionFlags::from_bits_retain(r.u32()?);
        let start_time = r.u64()?;
        let timeout = match r.u8()? {
            0 => None,
            _ => Some(r.u64()?),
        };
        let command_code = match r.u8()? {
            0 => None,
            _ => Some(r.u32()?),
        };
        let cp_hash = match r.u8()? {
            0 => None,
            _ => Some(r.tpm2b()?.to_vec()),
        };
        let locality = match r.u8()? {
            0 => None,
            _ => Some(r.u8()?),
        };
        r.finish()?;
        Ok(Self {
            kind,
            auth_hash,
            nonce_tpm,
            session_key,
            bind,
            symmetric,
            policy_digest,
            audit_digest,
            flags,
            start_time,
            timeout,
            command_code,
            cp_hash,
            locality,
        })
    }
}

/// `SessionComputeBoundEntity`: the entity Name with its authorization
/// value XOR-folded into the tail, so that a later entity with the same
/// Name but a different authorization value is not treated as bound.
#[must_use]
pub fn bound_entity(name: &[u8], auth: &[u8]) -> Vec<u8> {
    let auth_len = auth.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    let auth = &auth[..auth_len];
    let len = name.len().max(auth.len());
    let mut bind = vec![0u8; len - name.len()];
    bind.extend_from_slice(name);
    for (dst, src) in bind[len - auth.len()..].iter_mut().zip(auth) {
        *dst ^= src;
    }
    bind
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotRef {
    index: usize,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveEntry {
    Empty,
    Loaded(SlotRef),
    /// Context ID and handle base of a saved session.
    Saved { id: u64, base: u32 },
}

#[derive(Default)]
struct Slot {
    generation: u32,
    session: Option<Session>,
}

/// Loaded sessions plus the active session table.
pub struct SessionTable {
    slots: Vec<Slot>,
    active: Vec<ActiveEntry>,
    context_counter: u64,
    gap_limit: u64,
}

impl SessionTable {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            slots: (0..config.max_loaded_sessions)
                .map(|_| Slot::default())
                .collect(),
            active: vec![ActiveEntry::Empty; config.max_active_sessions],
            context_counter: 1,
            gap_limit: config.context_gap_limit.max(1),
        }
    }

    fn active_index(handle: u32) -> Option<usize> {
        match HandleType::of(handle)? {
            HandleType::HmacSession | HandleType::PolicySession => {
                usize::try_from(handle & HR_HANDLE_MASK).ok()
            }
            _ => None,
        }
    }

    fn oldest_saved(&self) -> Option<u64> {
        self.active
            .iter()
            .filter_map(|entry| match entry {
                ActiveEntry::Saved { id, .. } => Some(*id),
                _ => None,
            })
            .min()
    }

    fn slot_of(&self, handle: u32) -> Option<SlotRef> {
        let index = Self::active_index(handle)?;
        match self.active.get(index)? {
            ActiveEntry::Loaded(slot) => {
                let session = self.slots.get(slot.index)?.session.as_ref()?;
                (session.handle_base() == handle & !HR_HANDLE_MASK).then_some(*slot)
            }
            _ => None,
        }
    }

    /// Checks that a new session can be created.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::SessionHandles` when every active entry is in use,
    /// `TpmRcBase::SessionMemory` when every loaded slot is in use, and
    /// `TpmRcBase::ContextGap` when the last free active entry would be taken
    /// while saved sessions exist.
    pub fn check_create(&self) -> Result<(), TpmRcBase> {
        let free = self
            .active
            .iter()
            .filter(|e| **e == ActiveEntry::Empty)
            .count();
        if free == 0 {
            return Err(TpmRcBase::SessionHandles);
        }
        if self.slots.iter().all(|s| s.session.is_some()) {
            return Err(TpmRcBase::SessionMemory);
        }
        if free == 1 && self.oldest_saved().is_some() {
            return Err(TpmRcBase::ContextGap);
        }
        Ok(())
    }

    fn free_slot(&self) -> Result<SlotRef, TpmRcBase> {
        self.slots
            .iter()
            .position(|s| s.session.is_none())
            .map(|index| SlotRef {
                index,
                generation: self.slots[index].generation,
            })
            .ok_or(TpmRcBase::SessionMemory)
    }

    /// Loads a new session and returns its handle.
    ///
    /// # Errors
    ///
    /// See [`check_create`](Self::check_create).
    pub fn create(&mut self, session: Session) -> Result<u32, TpmRcBase> {
        self.check_create()?;
        let slot = self.free_slot()?;
        let index = self
            .active
            .iter()
            .position(|e| *e == ActiveEntry::Empty)
            .ok_or(TpmRcBase::SessionHandles)?;
        let handle = session.handle_base() + u32::try_from(index).map_err(|_| TpmRcBase::SessionHandles)?;
        self.slots[slot.index].session = Some(session);
        self.active[index] = ActiveEntry::Loaded(slot);
        debug!(target: "tpm2sim::session", "{handle:#010x}: created");
        Ok(handle)
    }

    #[must_use]
    pub fn get(&self, handle: u32) -> Option<&Session> {
        let slot = self.slot_of(handle)?;
        self.slots[slot.index].session.as_ref()
    }

    pub fn get_mut(&mut self, handle: u32) -> Option<&mut Session> {
        let slot = self.slot_of(handle)?;
        self.slots[slot.index].session.as_mut()
    }

    #[must_use]
    pub fn is_loaded(&self, handle: u32) -> bool {
        self.slot_of(handle).is_some()
    }

    fn saved_id(&self, handle: u32) -> Option<u64> {
        let index = Self::active_index(handle)?;
        match self.active.get(index)? {
            ActiveEntry::Saved { id, base } if *base == handle & !HR_HANDLE_MASK => Some(*id),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_saved(&self, handle: u32) -> bool {
        self.saved_id(handle).is_some()
    }

    /// Returns the context ID the next save of `handle` would get.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Handle` when the session is not loaded,
    /// `TpmRcBase::ContextGap` when the save would exceed the gap limit and
    /// `TpmRcBase::TooManyContexts` when the counter is exhausted.
    pub fn check_save(&self, handle: u32) -> Result<u64, TpmRcBase> {
        if !self.is_loaded(handle) {
            return Err(TpmRcBase::Handle);
        }
        if self.context_counter == u64::MAX {
            return Err(TpmRcBase::TooManyContexts);
        }
        if let Some(oldest) = self.oldest_saved() {
            if self.context_counter - oldest >= self.gap_limit {
                warn!(target: "tpm2sim::session", "context gap exhausted");
                return Err(TpmRcBase::ContextGap);
            }
        }
        Ok(self.context_counter)
    }

    /// Moves a loaded session to the saved state and frees its slot.
    ///
    /// # Errors
    ///
    /// See [`check_save`](Self::check_save).
    pub fn context_save(&mut self, handle: u32) -> Result<(u64, Session), TpmRcBase> {
        let id = self.check_save(handle)?;
        let slot = self.slot_of(handle).ok_or(TpmRcBase::Handle)?;
        let index = Self::active_index(handle).ok_or(TpmRcBase::Handle)?;
        let entry = &mut self.slots[slot.index];
        let session = entry.session.take().ok_or(TpmRcBase::Handle)?;
        entry.generation = entry.generation.wrapping_add(1);
        self.active[index] = ActiveEntry::Saved {
            id,
            base: session.handle_base(),
        };
        self.context_counter += 1;
        debug!(target: "tpm2sim::session", "{handle:#010x}: saved as {id}");
        Ok((id, session))
    }

    /// Checks that a saved session may be loaded back.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Handle` for a session handle outside the table,
    /// `TpmRcBase::Value` when `context_id` is not the outstanding saved
    /// context of `handle`, `TpmRcBase::SessionMemory` when no slot is free and
    /// `TpmRcBase::ContextGap` when the gap is exhausted and the context is not
    /// the oldest.
    pub fn check_load(&self, handle: u32, context_id: u64) -> Result<(), TpmRcBase> {
        let index = Self::active_index(handle).ok_or(TpmRcBase::Handle)?;
        if index >= self.active.len() {
            return Err(TpmRcBase::Handle);
        }
        if self.saved_id(handle) != Some(context_id) {
            return Err(TpmRcBase::Value);
        }
        self.free_slot()?;
        let oldest = self.oldest_saved().unwrap_or(context_id);
        if self.context_counter - oldest >= self.gap_limit && context_id != oldest {
            return Err(TpmRcBase::ContextGap);
        }
        Ok(())
    }

    /// Loads a saved session back into a slot.
    ///
    /// # Errors
    ///
    /// See [`check_load`](Self::check_load). Returns `TpmRcBase::Handle` when
    /// the session kind does not match the handle range.
    pub fn context_load(&mut self, handle: u32, context_id: u64, session: Session) -> Result<u32, TpmRcBase> {
        self.check_load(handle, context_id)?;
        if session.handle_base() != handle & !HR_HANDLE_MASK {
            return Err(TpmRcBase::Handle);
        }
        let index = Self::active_index(handle).ok_or(TpmRcBase::Handle)?;
        let slot = self.free_slot()?;
        self.slots[slot.index].session = Some(session);
        self.active[index] = ActiveEntry::Loaded(slot);
        debug!(target: "tpm2sim::session", "{handle:#010x}: loaded from {context_id}");
        Ok(handle)
    }

    /// Flushes a loaded or saved session.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Handle` when `handle` is not an active session.
    pub fn flush(&mut self, handle: u32) -> Result<(), TpmRcBase> {
        let index = Self::active_index(handle).ok_or(TpmRcBase::Handle)?;
        match self.active.get(index).copied() {
            Some(ActiveEntry::Loaded(slot)) => {
                if self.slot_of(handle).is_none() {
                    return Err(TpmRcBase::Handle);
                }
                let entry = &mut self.slots[slot.index];
                entry.session = None;
                entry.generation = entry.generation.wrapping_add(1);
            }
            Some(ActiveEntry::Saved { .. }) if self.is_saved(handle) => {}
            _ => return Err(TpmRcBase::Handle),
        }
        self.active[index] = ActiveEntry::Empty;
        debug!(target: "tpm2sim::session", "{handle:#010x}: flushed");
        Ok(())
    }

    /// Flushes every loaded session matching `pred`. Returns the number
    /// flushed.
    pub fn flush_loaded_where<F>(&mut self, pred: F) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        let doomed: Vec<u32> = self
            .loaded_handles()
            .into_iter()
            .filter(|h| self.get(*h).is_some_and(&pred))
            .collect();
        for handle in &doomed {
            let _ = self.flush(*handle);
        }
        doomed.len()
    }

    /// Drops every saved session. Their contexts no longer load. Returns the
    /// number dropped.
    pub fn flush_saved(&mut self) -> usize {
        let mut count = 0;
        for entry in &mut self.active {
            if matches!(entry, ActiveEntry::Saved { .. }) {
                *entry = ActiveEntry::Empty;
                count += 1;
            }
        }
        count
    }

    /// Startup processing. A TPM Reset drops everything and restarts the
    /// context counter, other startups drop only the loaded sessions.
    pub fn startup(&mut self, reset: bool) {
        for slot in &mut self.slots {
            if slot.session.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        for entry in &mut self.active {
            if reset || matches!(entry, ActiveEntry::Loaded(_)) {
                *entry = ActiveEntry::Empty;
            }
        }
        if reset {
            self.context_counter = 1;
        }
    }

    fn handles_matching(&self, saved: bool) -> Vec<u32> {
        self.active
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let index = u32::try_from(index).ok()?;
                match entry {
                    ActiveEntry::Loaded(slot) if !saved => {
                        let base = self.slots[slot.index].session.as_ref()?.handle_base();
                        Some(base + index)
                    }
                    ActiveEntry::Saved { base, .. } if saved => Some(base + index),
                    _ => None,
                }
            })
            .collect()
    }

    #[must_use]
    pub fn loaded_handles(&self) -> Vec<u32> {
        self.handles_matching(false)
    }

    #[must_use]
    pub fn saved_handles(&self) -> Vec<u32> {
        self.handles_matching(true)
    }

    #[must_use]
    pub fn context_counter(&self) -> u64 {
        self.context_counter
    }

    /// Saved-session bookkeeping preserved across Shutdown(STATE).
    pub(crate) fn write_to(&self, w: &mut Writer) -> Result<(), TpmRcBase> {
        let saved: Vec<(usize, u64, u32)> = self
            .active
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                ActiveEntry::Saved { id, base } => Some((i, *id, *base)),
                _ => None,
            })
            .collect();
        w.u64(self.context_counter)
            .u16(u16::try_from(saved.len()).map_err(|_| TpmRcBase::Size)?);
        for (index, id, base) in saved {
            w.u16(u16::try_from(index).map_err(|_| TpmRcBase::Size)?)
                .u64(id)
                .u32(base);
        }
        Ok(())
    }

    /// Restores the saved-session bookkeeping. Entries written without
    /// their kind are dropped, so those contexts no longer load.
    pub(crate) fn read_from(&mut self, r: &mut Reader<'_>, with_kind: bool) -> Result<(), TpmRcBase> {
        self.context_counter = r.u64()?;
        for entry in &mut self.active {
            *entry = ActiveEntry::Empty;
        }
        let count = r.u16()?;
        for _ in 0..count {
            let index = usize::from(r.u16()?);
            let id = r.u64()?;
            if !with_kind {
                continue;
            }
            let base = r.u32()?;
            if base != HMAC_SESSION_FIRST && base != POLICY_SESSION_FIRST {
                return Err(TpmRcBase::Value);
            }
            if let Some(entry) = self.active.get_mut(index) {
                *entry = ActiveEntry::Saved { id, base };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(gap: u64) -> SessionTable {
        SessionTable::new(&EngineConfig {
            context_gap_limit: gap,
            ..EngineConfig::default()
        })
    }

    fn hmac() -> Session {
        Session::new(SessionKind::Hmac, TpmAlgId::Sha256, 32)
    }

    #[test]
    fn test_loaded_slots_exhausted() {
        let mut table = table(255);
        for _ in 0..3 {
            table.create(hmac()).unwrap();
        }
        assert_eq!(table.create(hmac()), Err(TpmRcBase::SessionMemory));
    }

    #[test]
    fn test_save_frees_slot() {
        let mut table = table(255);
        let handle = table.create(hmac()).unwrap();
        let (id, session) = table.context_save(handle).unwrap();
        assert!(!table.is_loaded(handle));
        assert!(table.is_saved(handle));
        assert_eq!(table.context_load(handle, id + 1, session.clone()), Err(TpmRcBase::Value));
        assert_eq!(table.context_load(handle, id, session), Ok(handle));
        assert!(table.is_loaded(handle));
    }

    #[test]
    fn test_gap_limit() {
        let mut table = table(2);
        let a = table.create(hmac()).unwrap();
        let b = table.create(hmac()).unwrap();
        let c = table.create(hmac()).unwrap();
        let (id_a, session_a) = table.context_save(a).unwrap();
        let (id_b, session_b) = table.context_save(b).unwrap();
        assert_eq!(table.context_save(c), Err(TpmRcBase::ContextGap));
        assert_eq!(
            table.context_load(b, id_b, session_b),
            Err(TpmRcBase::ContextGap)
        );
        table.context_load(a, id_a, session_a).unwrap();
        table.context_save(c).unwrap();
    }

    #[test]
    fn test_restart_keeps_saved() {
        let mut table = table(255);
        let a = table.create(hmac()).unwrap();
        let b = table.create(hmac()).unwrap();
        table.context_save(a).unwrap();
        table.startup(false);
        assert!(table.is_saved(a));
        assert!(!table.is_loaded(b));
        table.startup(true);
        assert!(!table.is_saved(a));
    }

    #[test]
    fn test_saved_policy_session_handle() {
        let mut table = table(255);
        let policy = table
            .create(Session::new(SessionKind::Policy, TpmAlgId::Sha256, 32))
            .unwrap();
        let index = policy & HR_HANDLE_MASK;
        table.context_save(policy).unwrap();
        assert_eq!(table.saved_handles(), vec![policy]);
        assert!(table.is_saved(policy));
        assert!(!table.is_saved(HMAC_SESSION_FIRST + index));
        assert_eq!(table.flush(HMAC_SESSION_FIRST + index), Err(TpmRcBase::Handle));

        let mut w = Writer::new();
        table.write_to(&mut w).unwrap();
        let mut restored = SessionTable::new(&EngineConfig::default());
        restored.read_from(&mut Reader::new(w.as_slice()), true).unwrap();
        assert_eq!(restored.saved_handles(), vec![policy]);
    }

    #[test]
    fn test_flush_saved() {
        let mut table = table(255);
        let a = table.create(hmac()).unwrap();
        let b = table.create(hmac()).unwrap();
        table.context_save(a).unwrap();
        assert_eq!(table.flush_saved(), 1);
        assert!(!table.is_saved(a));
        assert!(table.is_loaded(b));
        assert!(table.saved_handles().is_empty());
    }

    #[test]
    fn test_bound_entity_folds_auth() {
        let name = [0x00, 0x0B, 1, 2, 3, 4];
        assert_eq!(bound_entity(&name, b""), name);
        assert_eq!(bound_entity(&name, &[0xFF, 0x00]), [0x00, 0x0B, 1, 2, 3, 0xFB]);
        assert_ne!(bound_entity(&name, b"a"), bound_entity(&name, b"b"));
    }

    #[test]
    fn test_session_bytes() {
        let mut session = Session::new(SessionKind::Policy, TpmAlgId::Sha256, 32);
        session.nonce_tpm = vec![7; 16];
        session.bind = Some(vec![1, 2]);
        session.symmetric = SessionSymmetric::AesCfb(128);
        session.command_code = Some(0x0000_0137);
        session.locality = Some(1);
        let decoded = Session::from_bytes(&session.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.to_bytes().unwrap(), session.to_bytes().unwrap());
        assert_eq!(decoded.symmetric, SessionSymmetric::AesCfb(128));
    }
}
