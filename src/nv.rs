// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! NV index and evicted-object store.
//!
//! The image starts with a reserved area for the engine's persistent state.
//! After it comes a packed list of entries, each `[size u32][handle u32]`
//! followed by the payload, terminated by a zero size. The largest value
//! ever reached by a deleted counter index is stored as a `u64` right
//! after the terminator.
//!
//! Every mutation is built on a copy of the image and committed to the
//! backing store before the RAM image is replaced, so a failed write leaves
//! no partial state behind.

use crate::{
    config::EngineConfig,
    crypto::{hash_alg_from_u16, require_digest_size, CryptoEngine},
    error::TpmRcBase,
    handle::{persistent_owner, HandleType, Hierarchy, NV_INDEX_FIRST},
    object::KeyObject,
    platform::NvBacking,
    util::{AttributeSet, Reader, Writer},
};
use log::{debug, info, warn};
use std::collections::VecDeque;
use tpm2_protocol::data::TpmAlgId;
use zeroize::Zeroizing;

const STATE_MAGIC: &[u8; 4] = b"TPMS";
const ENTRY_HEADER: usize = 8;
const LIST_TRAILER: usize = 4 + 8;

pub use tpm2_protocol::data::TpmaNv;

/// `TPM_NT` field of `TPMA_NV`.
const TPM_NT_MASK: u32 = 0xF0;
const TPM_NT_SHIFT: u32 = 4;

/// `TPM_NT`, the index type in bits 4..7 of `TPMA_NV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvType {
    Ordinary,
    Counter,
    Bits,
    Extend,
    PinFail,
    PinPass,
}

impl NvType {
    fn from_bits(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ordinary),
            1 => Some(Self::Counter),
            2 => Some(Self::Bits),
            4 => Some(Self::Extend),
            8 => Some(Self::PinFail),
            9 => Some(Self::PinPass),
            _ => None,
        }
    }

    #[must_use]
    pub fn bits(self) -> TpmaNv {
        let raw = match self {
            Self::Ordinary => 0,
            Self::Counter => 1,
            Self::Bits => 2,
            Self::Extend => 4,
            Self::PinFail => 8,
            Self::PinPass => 9,
        };
        TpmaNv::from_bits_truncate(raw << TPM_NT_SHIFT)
    }
}

/// Access class of the command touching an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvAccess {
    None,
    Read,
    Write,
}

/// `TPMS_NV_PUBLIC`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvPublic {
    pub index: u32,
    pub name_alg: TpmAlgId,
    pub attributes: TpmaNv,
    pub auth_policy: Vec<u8>,
    pub data_size: u16,
}

impl NvPublic {
    /// # Errors
    ///
    /// Returns `TpmRcBase::Attributes` for an unknown index type.
    pub fn nv_type(&self) -> Result<NvType, TpmRcBase> {
        NvType::from_bits((self.attributes.bits() & TPM_NT_MASK) >> TPM_NT_SHIFT)
            .ok_or(TpmRcBase::Attributes)
    }

    #[must_use]
    pub fn hierarchy(&self) -> Hierarchy {
        if self.attributes.contains(TpmaNv::PLATFORMCREATE) {
            Hierarchy::Platform
        } else {
            Hierarchy::Owner
        }
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` for an oversized policy digest.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TpmRcBase> {
        let mut w = Writer::new();
        w.u32(self.index)
            .u16(self.name_alg as u16)
            .put(&self.attributes)?
            .tpm2b(&self.auth_policy)?
            .u16(self.data_size);
        Ok(w.into_vec())
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Hash` for an unknown name algorithm and
    /// `TpmRcBase::Size` for malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TpmRcBase> {
        let mut r = Reader::new(bytes);
        let public = Self {
            index: r.u32()?,
            name_alg: hash_alg_from_u16(r.u16()?).ok_or(TpmRcBase::Hash)?,
            attributes: r.get()?,
            auth_policy: r.tpm2b()?.to_vec(),
            data_size: r.u16()?,
        };
        r.finish()?;
        Ok(public)
    }

    /// `nameAlg || H(TPMS_NV_PUBLIC)`
    ///
    /// # Errors
    ///
    /// Propagates digest errors.
    pub fn name(&self, crypto: &dyn CryptoEngine) -> Result<Vec<u8>, TpmRcBase> {
        crypto.make_name(self.name_alg, &self.to_bytes()?)
    }

    /// Checks the attributes and size of an index about to be defined.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Attributes`, `TpmRcBase::Size`, `TpmRcBase::NvRange` or
    /// `TpmRcBase::Hash`.
    pub fn validate_definition(&self, max_size: u16) -> Result<(), TpmRcBase> {
        let digest_len = require_digest_size(self.name_alg)?;
        if HandleType::of(self.index) != Some(HandleType::NvIndex) {
            return Err(TpmRcBase::NvRange);
        }
        if !self.auth_policy.is_empty() && self.auth_policy.len() != digest_len {
            return Err(TpmRcBase::Size);
        }
        let set_at_runtime = TpmaNv::WRITELOCKED | TpmaNv::READLOCKED | TpmaNv::WRITTEN;
        if self.attributes.intersects(set_at_runtime) {
            return Err(TpmRcBase::Attributes);
        }
        let write_auth = TpmaNv::PPWRITE | TpmaNv::OWNERWRITE | TpmaNv::AUTHWRITE | TpmaNv::POLICYWRITE;
        let read_auth = TpmaNv::PPREAD | TpmaNv::OWNERREAD | TpmaNv::AUTHREAD | TpmaNv::POLICYREAD;
        if !self.attributes.intersects(write_auth) || !self.attributes.intersects(read_auth) {
            return Err(TpmRcBase::Attributes);
        }
        match self.nv_type()? {
            NvType::Ordinary => {
                if self.data_size > max_size {
                    return Err(TpmRcBase::Size);
                }
            }
            NvType::Counter | NvType::Bits => {
                if self.data_size != 8 {
                    return Err(TpmRcBase::Size);
                }
                if self.attributes.contains(TpmaNv::WRITEALL) {
                    return Err(TpmRcBase::Attributes);
                }
            }
            NvType::Extend => {
                if usize::from(self.data_size) != digest_len {
                    return Err(TpmRcBase::Size);
                }
            }
            NvType::PinFail | NvType::PinPass => return Err(TpmRcBase::Attributes),
        }
        if self.attributes.contains(TpmaNv::CLEAR_STCLEAR)
            && self.nv_type()? == NvType::Counter
        {
            return Err(TpmRcBase::Attributes);
        }
        if self.attributes.contains(TpmaNv::POLICY_DELETE)
            && !self.attributes.contains(TpmaNv::PLATFORMCREATE)
        {
            return Err(TpmRcBase::Attributes);
        }
        Ok(())
    }
}

/// An NV index with its authorization value and data.
#[derive(Clone)]
pub struct NvIndex {
    pub public: NvPublic,
    pub auth_value: Zeroizing<Vec<u8>>,
    pub data: Vec<u8>,
}

impl NvIndex {
    fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
        let mut w = Writer::new();
        w.tpm2b(&self.public.to_bytes()?)?
            .tpm2b(&self.auth_value)?
            .tpm2b(&self.data)?;
        Ok(Zeroizing::new(w.into_vec()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, TpmRcBase> {
        let mut r = Reader::new(bytes);
        let index = Self {
            public: NvPublic::from_bytes(r.tpm2b()?)?,
            auth_value: Zeroizing::new(r.tpm2b()?.to_vec()),
            data: r.tpm2b()?.to_vec(),
        };
        r.finish()?;
        Ok(index)
    }

    #[must_use]
    pub fn is_written(&self) -> bool {
        self.public.attributes.contains(TpmaNv::WRITTEN)
    }

    fn counter_value(&self) -> u64 {
        let mut raw = [0u8; 8];
        if self.data.len() == 8 {
            raw.copy_from_slice(&self.data);
        }
        u64::from_be_bytes(raw)
    }
}

/// Sliding-window limiter of NV writes.
#[derive(Debug)]
struct RateLimiter {
    max_writes: u32,
    window_ms: u64,
    history: VecDeque<u64>,
}

impl RateLimiter {
    fn check(&mut self, now: u64) -> Result<(), TpmRcBase> {
        if self.max_writes == 0 {
            return Ok(());
        }
        while self
            .history
            .front()
            .is_some_and(|t| now.saturating_sub(*t) >= self.window_ms)
        {
            self.history.pop_front();
        }
        if self.history.len() >= self.max_writes as usize {
            warn!(target: "tpm2sim::nv", "write rate exceeded");
            return Err(TpmRcBase::NvRate);
        }
        Ok(())
    }

    fn record(&mut self, now: u64) {
        if self.max_writes != 0 {
            self.history.push_back(now);
        }
    }
}

/// Persistent store of NV indices and evicted objects.
pub struct NvStore {
    backing: Box<dyn NvBacking>,
    image: Vec<u8>,
    reserved: usize,
    max_index_size: u16,
    rate: RateLimiter,
    global_lock: bool,
}

fn read_u32(image: &[u8], offset: usize) -> Option<u32> {
    let b = image.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(image: &[u8], offset: usize) -> Option<u64> {
    let b = image.get(offset..offset + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Some(u64::from_be_bytes(raw))
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: usize,
    size: usize,
    handle: u32,
}

impl NvStore {
    /// Reads the backing store into RAM.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvUnavailable` when the backing store cannot be
    /// read, and `TpmRcBase::NvSpace` when it cannot hold the reserved area
    /// and an empty list.
    pub fn open(backing: Box<dyn NvBacking>, config: &EngineConfig) -> Result<Self, TpmRcBase> {
        let size = backing.size();
        if size < config.nv_reserved_size + LIST_TRAILER {
            return Err(TpmRcBase::NvSpace);
        }
        let mut image = vec![0u8; size];
        backing.read(0, &mut image)?;
        Ok(Self {
            backing,
            image,
            reserved: config.nv_reserved_size,
            max_index_size: config.max_nv_index_size,
            rate: RateLimiter {
                max_writes: config.nv_rate.max_writes,
                window_ms: config.nv_rate.window_ms,
                history: VecDeque::new(),
            },
            global_lock: false,
        })
    }

    /// Returns `true` once [`format`](Self::format) has run.
    #[must_use]
    pub fn is_formatted(&self) -> bool {
        self.image.get(..4) == Some(&STATE_MAGIC[..])
    }

    /// Erases the image: empty persistent state, empty list, zero max
    /// counter.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvUnavailable` when the backing store fails.
    pub fn format(&mut self) -> Result<(), TpmRcBase> {
        let mut image = vec![0u8; self.image.len()];
        image[..4].copy_from_slice(STATE_MAGIC);
        self.backing.write(0, &image)?;
        self.image = image;
        info!(target: "tpm2sim::nv", "formatted {} bytes", self.image.len());
        Ok(())
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.backing.available()
    }

    /// Reads the engine's persistent state blob.
    #[must_use]
    pub fn read_state(&self) -> Option<&[u8]> {
        if !self.is_formatted() {
            return None;
        }
        let len = read_u32(&self.image, 4)? as usize;
        if len == 0 {
            return None;
        }
        self.image.get(8..8 + len)
    }

    /// Writes the engine's persistent state blob. Not rate limited.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvSpace` when the blob does not fit the reserved
    /// area and `TpmRcBase::NvUnavailable` when the backing store fails.
    pub fn write_state(&mut self, state: &[u8]) -> Result<(), TpmRcBase> {
        if 8 + state.len() > self.reserved {
            return Err(TpmRcBase::NvSpace);
        }
        if !self.backing.available() {
            return Err(TpmRcBase::NvUnavailable);
        }
        let len = u32::try_from(state.len()).map_err(|_| TpmRcBase::NvSpace)?;
        let mut area = Vec::with_capacity(8 + state.len());
        area.extend_from_slice(STATE_MAGIC);
        area.extend_from_slice(&len.to_be_bytes());
        area.extend_from_slice(state);
        self.backing.write(0, &area)?;
        self.image[..area.len()].copy_from_slice(&area);
        Ok(())
    }

    fn entries_of(image: &[u8], start: usize) -> Vec<Entry> {
        let mut entries = Vec::new();
        let mut offset = start;
        while let Some(size) = read_u32(image, offset) {
            let size = size as usize;
            if size < ENTRY_HEADER || offset + size + LIST_TRAILER > image.len() {
                break;
            }
            let Some(handle) = read_u32(image, offset + 4) else {
                break;
            };
            entries.push(Entry {
                offset,
                size,
                handle,
            });
            offset += size;
        }
        entries
    }

    fn entries(&self) -> Vec<Entry> {
        Self::entries_of(&self.image, self.reserved)
    }

    fn end_offset(&self) -> usize {
        self.entries()
            .last()
            .map_or(self.reserved, |e| e.offset + e.size)
    }

    fn find(&self, handle: u32) -> Option<Entry> {
        self.entries().into_iter().find(|e| e.handle == handle)
    }

    fn payload(&self, entry: Entry) -> &[u8] {
        &self.image[entry.offset + ENTRY_HEADER..entry.offset + entry.size]
    }

    /// The largest value a deleted counter index reached.
    #[must_use]
    pub fn max_counter(&self) -> u64 {
        read_u64(&self.image, self.end_offset() + 4).unwrap_or(0)
    }

    /// Bytes still available for new entries.
    #[must_use]
    pub fn free_space(&self) -> usize {
        self.image
            .len()
            .saturating_sub(self.end_offset() + LIST_TRAILER)
    }

    #[must_use]
    pub fn is_defined(&self, handle: u32) -> bool {
        self.find(handle).is_some()
    }

    /// Handles of all NV indices and evicted objects.
    #[must_use]
    pub fn handles(&self) -> Vec<u32> {
        self.entries().into_iter().map(|e| e.handle).collect()
    }

    /// Builds a new list from `entries` and commits it together with the
    /// max counter.
    fn commit(&mut self, entries: &[(u32, Zeroizing<Vec<u8>>)], max_counter: u64) -> Result<(), TpmRcBase> {
        if !self.backing.available() {
            return Err(TpmRcBase::NvUnavailable);
        }
        let mut list = Vec::new();
        for (handle, payload) in entries {
            let size = u32::try_from(ENTRY_HEADER + payload.len()).map_err(|_| TpmRcBase::NvSpace)?;
            list.extend_from_slice(&size.to_be_bytes());
            list.extend_from_slice(&handle.to_be_bytes());
            list.extend_from_slice(payload);
        }
        list.extend_from_slice(&0u32.to_be_bytes());
        list.extend_from_slice(&max_counter.to_be_bytes());
        if self.reserved + list.len() > self.image.len() {
            return Err(TpmRcBase::NvSpace);
        }

        let start = self.reserved;
        let common = self.image[start..]
            .iter()
            .zip(&list)
            .take_while(|(a, b)| a == b)
            .count();
        self.backing.write(start + common, &list[common..])?;
        self.image[start..start + list.len()].copy_from_slice(&list);
        Ok(())
    }

    fn snapshot(&self) -> Vec<(u32, Zeroizing<Vec<u8>>)> {
        self.entries()
            .into_iter()
            .map(|e| (e.handle, Zeroizing::new(self.payload(e).to_vec())))
            .collect()
    }

    fn rate_checked<F>(&mut self, now: u64, mutate: F) -> Result<(), TpmRcBase>
    where
        F: FnOnce(&mut Vec<(u32, Zeroizing<Vec<u8>>)>, &mut u64) -> Result<(), TpmRcBase>,
    {
        if !self.backing.available() {
            return Err(TpmRcBase::NvUnavailable);
        }
        self.rate.check(now)?;
        let mut entries = self.snapshot();
        let mut max_counter = self.max_counter();
        mutate(&mut entries, &mut max_counter)?;
        self.commit(&entries, max_counter)?;
        self.rate.record(now);
        Ok(())
    }

    /// Defines a new index with zeroed, unwritten data.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvDefined`, `TpmRcBase::NvSpace`, `TpmRcBase::NvRate` or
    /// `TpmRcBase::NvUnavailable`.
    pub fn define_index(&mut self, public: NvPublic, auth: &[u8], now: u64) -> Result<(), TpmRcBase> {
        if self.is_defined(public.index) {
            return Err(TpmRcBase::NvDefined);
        }
        let handle = public.index;
        let index = NvIndex {
            data: vec![0; usize::from(public.data_size)],
            public,
            auth_value: Zeroizing::new(auth.to_vec()),
        };
        let payload = index.to_bytes()?;
        if ENTRY_HEADER + payload.len() > self.free_space() {
            return Err(TpmRcBase::NvSpace);
        }
        self.rate_checked(now, |entries, _| {
            entries.push((handle, payload));
            Ok(())
        })?;
        info!(target: "tpm2sim::nv", "{handle:#010x}: defined");
        Ok(())
    }

    /// Returns a copy of an index.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Handle` when the index is not defined.
    pub fn index(&self, handle: u32) -> Result<NvIndex, TpmRcBase> {
        if HandleType::of(handle) != Some(HandleType::NvIndex) {
            return Err(TpmRcBase::Handle);
        }
        let entry = self.find(handle).ok_or(TpmRcBase::Handle)?;
        NvIndex::from_bytes(self.payload(entry))
    }

    fn replace_index(&mut self, index: &NvIndex, now: u64) -> Result<(), TpmRcBase> {
        let handle = index.public.index;
        let payload = index.to_bytes()?;
        self.rate_checked(now, |entries, _| {
            let slot = entries
                .iter_mut()
                .find(|(h, _)| *h == handle)
                .ok_or(TpmRcBase::Handle)?;
            slot.1 = payload;
            Ok(())
        })
    }

    /// Deletes an index. A counter raises the stored max counter.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Handle`, `TpmRcBase::NvRate` or `TpmRcBase::NvUnavailable`.
    pub fn delete_index(&mut self, handle: u32, now: u64) -> Result<(), TpmRcBase> {
        let index = self.index(handle)?;
        let counter = (index.public.nv_type() == Ok(NvType::Counter) && index.is_written())
            .then(|| index.counter_value());
        self.rate_checked(now, |entries, max_counter| {
            entries.retain(|(h, _)| *h != handle);
            if let Some(value) = counter {
                *max_counter = (*max_counter).max(value);
            }
            Ok(())
        })?;
        info!(target: "tpm2sim::nv", "{handle:#010x}: deleted");
        Ok(())
    }

    /// Checks that `handle` may be used by a command of the given access
    /// class.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Handle` when the index is undefined or its
    /// hierarchy is disabled, and `TpmRcBase::NvLocked` when the access is
    /// locked.
    pub fn is_accessible(
        &self,
        handle: u32,
        access: NvAccess,
        ph_enable_nv: bool,
        sh_enable: bool,
    ) -> Result<(), TpmRcBase> {
        let public = self.public(handle)?;
        let attrs = public.attributes;
        let enabled = match public.hierarchy() {
            Hierarchy::Platform => ph_enable_nv,
            _ => sh_enable,
        };
        if !enabled {
            return Err(TpmRcBase::Handle);
        }
        match access {
            NvAccess::Read if attrs.contains(TpmaNv::READLOCKED) => Err(TpmRcBase::NvLocked),
            NvAccess::Write if attrs.contains(TpmaNv::WRITELOCKED) => Err(TpmRcBase::NvLocked),
            _ => Ok(()),
        }
    }

    /// Reads `size` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvRange` for an out-of-bounds request and
    /// `TpmRcBase::NvUninitialized` when the index was never written.
    pub fn read_data(&self, handle: u32, offset: u16, size: u16) -> Result<Vec<u8>, TpmRcBase> {
        let index = self.index(handle)?;
        let end = usize::from(offset) + usize::from(size);
        if end > usize::from(index.public.data_size) {
            return Err(TpmRcBase::NvRange);
        }
        if !index.is_written() {
            return Err(TpmRcBase::NvUninitialized);
        }
        Ok(index.data[usize::from(offset)..end].to_vec())
    }

    fn mark_written(index: &mut NvIndex) {
        index.public.attributes |= TpmaNv::WRITTEN;
    }

    /// Writes `data` at `offset` of an ordinary index.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Attributes` for a non-ordinary index,
    /// `TpmRcBase::NvRange` for an out-of-bounds or partial `WRITEALL` write,
    /// `TpmRcBase::NvRate` or `TpmRcBase::NvUnavailable`.
    pub fn write_data(&mut self, handle: u32, offset: u16, data: &[u8], now: u64) -> Result<(), TpmRcBase> {
        let mut index = self.index(handle)?;
        if index.public.nv_type()? != NvType::Ordinary {
            return Err(TpmRcBase::Attributes);
        }
        let size = usize::from(index.public.data_size);
        let start = usize::from(offset);
        let end = start + data.len();
        if end > size {
            return Err(TpmRcBase::NvRange);
        }
        if index.public.attributes.contains(TpmaNv::WRITEALL) && (start != 0 || end != size) {
            return Err(TpmRcBase::NvRange);
        }
        index.data[start..end].copy_from_slice(data);
        Self::mark_written(&mut index);
        self.replace_index(&index, now)?;
        debug!(target: "tpm2sim::nv", "{handle:#010x}: wrote {} bytes at {offset}", data.len());
        Ok(())
    }

    /// Increments a counter index. The first increment starts from the
    /// stored max counter.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Attributes` for a non-counter index, `TpmRcBase::NvRate`
    /// or `TpmRcBase::NvUnavailable`.
    pub fn increment(&mut self, handle: u32, now: u64) -> Result<u64, TpmRcBase> {
        let mut index = self.index(handle)?;
        if index.public.nv_type()? != NvType::Counter {
            return Err(TpmRcBase::Attributes);
        }
        let current = if index.is_written() {
            index.counter_value()
        } else {
            self.max_counter()
        };
        let next = current.checked_add(1).ok_or(TpmRcBase::NvRange)?;
        index.data = next.to_be_bytes().to_vec();
        Self::mark_written(&mut index);
        self.replace_index(&index, now)?;
        Ok(next)
    }

    /// ORs `bits` into a bit-field index.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Attributes` for a non-bits index, `TpmRcBase::NvRate`
    /// or `TpmRcBase::NvUnavailable`.
    pub fn set_bits(&mut self, handle: u32, bits: u64, now: u64) -> Result<(), TpmRcBase> {
        let mut index = self.index(handle)?;
        if index.public.nv_type()? != NvType::Bits {
            return Err(TpmRcBase::Attributes);
        }
        let current = if index.is_written() {
            index.counter_value()
        } else {
            0
        };
        index.data = (current | bits).to_be_bytes().to_vec();
        Self::mark_written(&mut index);
        self.replace_index(&index, now)
    }

    /// Extends an extend index: `data = H(data || input)`.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Attributes` for a non-extend index, `TpmRcBase::NvRate`
    /// or `TpmRcBase::NvUnavailable`.
    pub fn extend(
        &mut self,
        handle: u32,
        input: &[u8],
        crypto: &dyn CryptoEngine,
        now: u64,
    ) -> Result<(), TpmRcBase> {
        let mut index = self.index(handle)?;
        if index.public.nv_type()? != NvType::Extend {
            return Err(TpmRcBase::Attributes);
        }
        if !index.is_written() {
            index.data.fill(0);
        }
        index.data = crypto.digest(index.public.name_alg, &[&index.data, input])?;
        Self::mark_written(&mut index);
        self.replace_index(&index, now)
    }

    /// Sets `READLOCKED` or `WRITELOCKED`.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvRate` or `TpmRcBase::NvUnavailable`.
    pub fn lock(&mut self, handle: u32, lock: TpmaNv, now: u64) -> Result<(), TpmRcBase> {
        let mut index = self.index(handle)?;
        if index.public.attributes.contains(lock) {
            return Ok(());
        }
        index.public.attributes |= lock;
        self.replace_index(&index, now)
    }

    /// Replaces the authorization value of an index.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvRate` or `TpmRcBase::NvUnavailable`.
    pub fn change_auth(&mut self, handle: u32, auth: &[u8], now: u64) -> Result<(), TpmRcBase> {
        let mut index = self.index(handle)?;
        index.auth_value = Zeroizing::new(auth.to_vec());
        self.replace_index(&index, now)
    }

    /// Sets the write lock of every `GLOBALLOCK` index. The engine keeps the
    /// flag in its persistent state and mirrors it here.
    pub fn set_global_lock(&mut self, locked: bool) {
        self.global_lock = locked;
    }

    #[must_use]
    pub fn is_global_locked(&self) -> bool {
        self.global_lock
    }

    /// Returns the public area of an index as `TPM2_NV_ReadPublic` reports
    /// it: a `GLOBALLOCK` index shows `WRITELOCKED` while the global lock
    /// holds.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Handle` when the index is not defined.
    pub fn public(&self, handle: u32) -> Result<NvPublic, TpmRcBase> {
        let mut public = self.index(handle)?.public;
        if self.global_lock && public.attributes.contains(TpmaNv::GLOBALLOCK) {
            public.attributes |= TpmaNv::WRITELOCKED;
        }
        Ok(public)
    }

    /// Stores an evicted object under a persistent handle.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvDefined`, `TpmRcBase::NvSpace`, `TpmRcBase::NvRate` or
    /// `TpmRcBase::NvUnavailable`.
    pub fn add_evict_object(&mut self, handle: u32, object: &KeyObject, now: u64) -> Result<(), TpmRcBase> {
        if self.is_defined(handle) {
            return Err(TpmRcBase::NvDefined);
        }
        let payload = object.to_bytes()?;
        if ENTRY_HEADER + payload.len() > self.free_space() {
            return Err(TpmRcBase::NvSpace);
        }
        self.rate_checked(now, |entries, _| {
            entries.push((handle, payload));
            Ok(())
        })?;
        info!(target: "tpm2sim::nv", "{handle:#010x}: object persisted");
        Ok(())
    }

    /// Reads an evicted object.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Handle` when nothing is stored under `handle`.
    pub fn evict_object(&self, handle: u32, crypto: &dyn CryptoEngine) -> Result<KeyObject, TpmRcBase> {
        if HandleType::of(handle) != Some(HandleType::Persistent) {
            return Err(TpmRcBase::Handle);
        }
        let entry = self.find(handle).ok_or(TpmRcBase::Handle)?;
        KeyObject::from_bytes(self.payload(entry), Some(handle), crypto)
    }

    /// Deletes an evicted object.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Handle`, `TpmRcBase::NvRate` or `TpmRcBase::NvUnavailable`.
    pub fn delete_evict(&mut self, handle: u32, now: u64) -> Result<(), TpmRcBase> {
        if HandleType::of(handle) != Some(HandleType::Persistent) || !self.is_defined(handle) {
            return Err(TpmRcBase::Handle);
        }
        self.rate_checked(now, |entries, _| {
            entries.retain(|(h, _)| *h != handle);
            Ok(())
        })?;
        info!(target: "tpm2sim::nv", "{handle:#010x}: object evicted");
        Ok(())
    }

    fn entry_hierarchy(&self, entry: Entry, crypto: &dyn CryptoEngine) -> Option<Hierarchy> {
        match HandleType::of(entry.handle)? {
            HandleType::NvIndex => NvIndex::from_bytes(self.payload(entry))
                .ok()
                .map(|index| index.public.hierarchy()),
            HandleType::Persistent => KeyObject::from_bytes(self.payload(entry), Some(entry.handle), crypto)
                .ok()
                .and_then(|key| Hierarchy::from_handle(key.hierarchy))
                .or(Some(persistent_owner(entry.handle))),
            _ => None,
        }
    }

    /// Deletes every index and evicted object of `hierarchies`. Returns the
    /// number of deleted entries. Not rate limited.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvUnavailable` when the backing store fails.
    pub fn flush_hierarchy(
        &mut self,
        hierarchies: &[Hierarchy],
        crypto: &dyn CryptoEngine,
    ) -> Result<usize, TpmRcBase> {
        let doomed: Vec<u32> = self
            .entries()
            .into_iter()
            .filter(|e| {
                self.entry_hierarchy(*e, crypto)
                    .is_some_and(|h| hierarchies.contains(&h))
            })
            .map(|e| e.handle)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        let mut entries = self.snapshot();
        let mut max_counter = self.max_counter();
        for handle in &doomed {
            if let Ok(index) = self.index(*handle) {
                if index.public.nv_type() == Ok(NvType::Counter) && index.is_written() {
                    max_counter = max_counter.max(index.counter_value());
                }
            }
        }
        entries.retain(|(h, _)| !doomed.contains(h));
        self.commit(&entries, max_counter)?;
        info!(target: "tpm2sim::nv", "{hierarchies:?}: deleted {} entries", doomed.len());
        Ok(doomed.len())
    }

    /// Startup processing of `TPMA_NV` ST_CLEAR attributes, run on TPM
    /// Reset and TPM Restart. Not rate limited.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvUnavailable` when the backing store fails.
    pub fn startup_clear(&mut self) -> Result<(), TpmRcBase> {
        let mut changed = false;
        let mut entries = self.snapshot();
        for (handle, payload) in &mut entries {
            if HandleType::of(*handle) != Some(HandleType::NvIndex) {
                continue;
            }
            let mut index = NvIndex::from_bytes(payload)?;
            let before = index.public.attributes;
            let attrs = &mut index.public.attributes;
            if attrs.contains(TpmaNv::READ_STCLEAR) {
                attrs.remove(TpmaNv::READLOCKED);
            }
            let define_locked =
                attrs.contains(TpmaNv::WRITEDEFINE) && attrs.contains(TpmaNv::WRITTEN);
            if attrs.contains(TpmaNv::WRITE_STCLEAR) && !define_locked {
                attrs.remove(TpmaNv::WRITELOCKED);
            }
            if attrs.contains(TpmaNv::CLEAR_STCLEAR) {
                attrs.remove(TpmaNv::WRITTEN);
            }
            if *attrs != before {
                *payload = index.to_bytes()?;
                changed = true;
            }
        }
        if changed {
            let max_counter = self.max_counter();
            self.commit(&entries, max_counter)?;
        }
        Ok(())
    }

    /// First NV index handle, for callers enumerating the index range.
    #[must_use]
    pub fn first_index() -> u32 {
        NV_INDEX_FIRST
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::NvRateConfig, crypto::SoftwareCrypto, platform::MemoryNv};
    use std::sync::atomic::Ordering;

    fn store(config: &EngineConfig) -> NvStore {
        let mut nv = NvStore::open(Box::new(MemoryNv::new(config.nv_memory_size)), config).unwrap();
        nv.format().unwrap();
        nv
    }

    fn ordinary(index: u32, size: u16) -> NvPublic {
        NvPublic {
            index,
            name_alg: TpmAlgId::Sha256,
            attributes: TpmaNv::AUTHWRITE | TpmaNv::AUTHREAD,
            auth_policy: Vec::new(),
            data_size: size,
        }
    }

    fn counter(index: u32) -> NvPublic {
        NvPublic {
            attributes: TpmaNv::AUTHWRITE | TpmaNv::AUTHREAD | NvType::Counter.bits(),
            ..ordinary(index, 8)
        }
    }

    #[test]
    fn test_define_write_read() {
        let mut nv = store(&EngineConfig::default());
        nv.define_index(ordinary(0x0100_0001, 32), b"abc", 0).unwrap();
        assert_eq!(
            nv.define_index(ordinary(0x0100_0001, 32), b"", 0),
            Err(TpmRcBase::NvDefined)
        );
        assert_eq!(nv.read_data(0x0100_0001, 0, 4), Err(TpmRcBase::NvUninitialized));
        nv.write_data(0x0100_0001, 4, b"data", 0).unwrap();
        assert_eq!(nv.read_data(0x0100_0001, 4, 4).unwrap(), b"data");
        assert_eq!(nv.read_data(0x0100_0001, 30, 4), Err(TpmRcBase::NvRange));
    }

    #[test]
    fn test_delete_compacts() {
        let mut nv = store(&EngineConfig::default());
        let free = nv.free_space();
        nv.define_index(ordinary(0x0100_0001, 16), b"", 0).unwrap();
        nv.define_index(ordinary(0x0100_0002, 16), b"", 0).unwrap();
        nv.delete_index(0x0100_0001, 0).unwrap();
        assert_eq!(nv.handles(), vec![0x0100_0002]);
        nv.delete_index(0x0100_0002, 0).unwrap();
        assert_eq!(nv.free_space(), free);
    }

    #[test]
    fn test_counter_max_survives_delete() {
        let mut nv = store(&EngineConfig::default());
        nv.define_index(counter(0x0100_0010), b"", 0).unwrap();
        for _ in 0..5 {
            nv.increment(0x0100_0010, 0).unwrap();
        }
        nv.delete_index(0x0100_0010, 0).unwrap();
        assert_eq!(nv.max_counter(), 5);
        nv.define_index(counter(0x0100_0011), b"", 0).unwrap();
        assert_eq!(nv.increment(0x0100_0011, 0), Ok(6));
    }

    #[test]
    fn test_no_space() {
        let defaults = EngineConfig::default();
        let config = EngineConfig {
            nv_memory_size: defaults.nv_reserved_size + 128,
            ..defaults
        };
        let mut nv = store(&config);
        assert_eq!(
            nv.define_index(ordinary(0x0100_0001, 200), b"", 0),
            Err(TpmRcBase::NvSpace)
        );
    }

    #[test]
    fn test_unavailable_leaves_no_state() {
        let config = EngineConfig::default();
        let backing = MemoryNv::new(config.nv_memory_size);
        let switch = backing.availability();
        let mut nv = NvStore::open(Box::new(backing), &config).unwrap();
        nv.format().unwrap();
        nv.define_index(ordinary(0x0100_0001, 8), b"", 0).unwrap();
        switch.store(false, Ordering::SeqCst);
        assert_eq!(nv.write_data(0x0100_0001, 0, &[1; 8], 0), Err(TpmRcBase::NvUnavailable));
        switch.store(true, Ordering::SeqCst);
        assert_eq!(nv.read_data(0x0100_0001, 0, 8), Err(TpmRcBase::NvUninitialized));
    }

    #[test]
    fn test_rate_limit_window() {
        let config = EngineConfig {
            nv_rate: NvRateConfig {
                max_writes: 2,
                window_ms: 100,
            },
            ..EngineConfig::default()
        };
        let mut nv = store(&config);
        nv.define_index(ordinary(0x0100_0001, 8), b"", 0).unwrap();
        nv.write_data(0x0100_0001, 0, &[1], 10).unwrap();
        assert_eq!(nv.write_data(0x0100_0001, 0, &[2], 20), Err(TpmRcBase::NvRate));
        assert_eq!(nv.read_data(0x0100_0001, 0, 1).unwrap(), vec![1]);
        nv.write_data(0x0100_0001, 0, &[3], 100).unwrap();
    }

    #[test]
    fn test_st_clear_processing() {
        let mut nv = store(&EngineConfig::default());
        let mut public = ordinary(0x0100_0001, 8);
        public.attributes |= TpmaNv::READ_STCLEAR | TpmaNv::WRITE_STCLEAR;
        nv.define_index(public, b"", 0).unwrap();
        nv.lock(0x0100_0001, TpmaNv::READLOCKED, 0).unwrap();
        nv.lock(0x0100_0001, TpmaNv::WRITELOCKED, 0).unwrap();
        assert_eq!(
            nv.is_accessible(0x0100_0001, NvAccess::Read, true, true),
            Err(TpmRcBase::NvLocked)
        );
        nv.startup_clear().unwrap();
        assert!(nv.is_accessible(0x0100_0001, NvAccess::Read, true, true).is_ok());
        assert!(nv.is_accessible(0x0100_0001, NvAccess::Write, true, true).is_ok());
        assert_eq!(
            nv.is_accessible(0x0100_0001, NvAccess::Read, true, false),
            Err(TpmRcBase::Handle)
        );
    }

    #[test]
    fn test_global_lock_reported() {
        let mut nv = store(&EngineConfig::default());
        let mut public = ordinary(0x0100_0001, 8);
        public.attributes |= TpmaNv::GLOBALLOCK;
        nv.define_index(public, b"", 0).unwrap();
        nv.define_index(ordinary(0x0100_0002, 8), b"", 0).unwrap();
        nv.set_global_lock(true);
        assert!(nv.public(0x0100_0001).unwrap().attributes.contains(TpmaNv::WRITELOCKED));
        assert!(!nv.public(0x0100_0002).unwrap().attributes.contains(TpmaNv::WRITELOCKED));
        assert!(!nv.index(0x0100_0001).unwrap().public.attributes.contains(TpmaNv::WRITELOCKED));
        assert_eq!(
            nv.is_accessible(0x0100_0001, NvAccess::Write, true, true),
            Err(TpmRcBase::NvLocked)
        );
        assert!(nv.is_accessible(0x0100_0001, NvAccess::Read, true, true).is_ok());
        nv.set_global_lock(false);
        assert!(nv.is_accessible(0x0100_0001, NvAccess::Write, true, true).is_ok());
    }

    #[test]
    fn test_evict_object_and_hierarchy_flush() {
        use crate::handle::TPM_RH_OWNER;
        use crate::object::{keyed_hash_public, Object, ObjectStore, Sensitive, TpmaObject};

        let sensitive = Sensitive::new(b"auth", &[0x5A; 32], b"secret");
        let public = keyed_hash_public(
            TpmAlgId::Sha256,
            TpmaObject::USER_WITH_AUTH,
            &[],
            &sensitive,
            &SoftwareCrypto,
        )
        .unwrap();
        let mut objects = ObjectStore::new(1);
        let slot = objects.allocate_slot().unwrap();
        objects
            .load(slot, public, Some(sensitive), &TPM_RH_OWNER.to_be_bytes(), TPM_RH_OWNER, &SoftwareCrypto)
            .unwrap();
        let Some(Object::Key(key)) = objects.get(slot).cloned() else {
            panic!("not a key");
        };

        let mut nv = store(&EngineConfig::default());
        nv.add_evict_object(0x8100_0001, &key, 0).unwrap();
        assert_eq!(nv.add_evict_object(0x8100_0001, &key, 0), Err(TpmRcBase::NvDefined));
        let stored = nv.evict_object(0x8100_0001, &SoftwareCrypto).unwrap();
        assert_eq!(stored.name, key.name);
        assert_eq!(stored.evict_handle, Some(0x8100_0001));

        let mut platform = ordinary(0x0100_0002, 8);
        platform.attributes |= TpmaNv::PPWRITE | TpmaNv::PPREAD | TpmaNv::PLATFORMCREATE;
        nv.define_index(ordinary(0x0100_0001, 8), b"", 0).unwrap();
        nv.define_index(platform, b"", 0).unwrap();
        assert_eq!(nv.flush_hierarchy(&[Hierarchy::Owner], &SoftwareCrypto), Ok(2));
        assert_eq!(nv.handles(), vec![0x0100_0002]);
        assert_eq!(nv.evict_object(0x8100_0001, &SoftwareCrypto).err(), Some(TpmRcBase::Handle));
    }

    #[test]
    fn test_extend() {
        let mut nv = store(&EngineConfig::default());
        let public = NvPublic {
            attributes: TpmaNv::AUTHWRITE | TpmaNv::AUTHREAD | NvType::Extend.bits(),
            ..ordinary(0x0100_0003, 32)
        };
        nv.define_index(public, b"", 0).unwrap();
        nv.extend(0x0100_0003, b"event", &SoftwareCrypto, 0).unwrap();
        let expected = SoftwareCrypto
            .digest(TpmAlgId::Sha256, &[&[0u8; 32], b"event"])
            .unwrap();
        assert_eq!(nv.read_data(0x0100_0003, 0, 32).unwrap(), expected);
    }
}
