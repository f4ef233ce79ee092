// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Loaded objects and the fixed-capacity object slot arena.

use crate::{
    crypto::{digest_size, hash_alg_from_u16, require_digest_size, CryptoEngine, ECC_P256_COORD_SIZE},
    error::TpmRcBase,
    handle::{
        persistent_owner, Hierarchy, CONTEXT_OBJECT, CONTEXT_SEQUENCE, CONTEXT_ST_CLEAR,
        TRANSIENT_FIRST,
    },
    util::{Reader, Writer},
};
use bitflags::bitflags;
use log::debug;
use tpm2_protocol::data::TpmAlgId;
use zeroize::Zeroizing;

pub const TPM_ECC_NIST_P256: u16 = 0x0003;

/// Layout version written by [`KeyObject::to_bytes`].
pub const OBJECT_FORMAT_VERSION: u8 = 2;

bitflags! {
    /// `TPMA_OBJECT`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TpmaObject: u32 {
        const FIXED_TPM = 1 << 1;
        const ST_CLEAR = 1 << 2;
        const FIXED_PARENT = 1 << 4;
        const SENSITIVE_DATA_ORIGIN = 1 << 5;
        const USER_WITH_AUTH = 1 << 6;
        const ADMIN_WITH_POLICY = 1 << 7;
        const NO_DA = 1 << 10;
        const ENCRYPTED_DUPLICATION = 1 << 11;
        const RESTRICTED = 1 << 16;
        const DECRYPT = 1 << 17;
        const SIGN_ENCRYPT = 1 << 18;
    }
}

/// Object type identifiers (`TPMI_ALG_PUBLIC`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ObjectType {
    Rsa = 0x0001,
    KeyedHash = 0x0008,
    Ecc = 0x0023,
    SymCipher = 0x0025,
}

impl TryFrom<u16> for ObjectType {
    type Error = TpmRcBase;

    fn try_from(value: u16) -> Result<Self, TpmRcBase> {
        match value {
            0x0001 => Ok(Self::Rsa),
            0x0008 => Ok(Self::KeyedHash),
            0x0023 => Ok(Self::Ecc),
            0x0025 => Ok(Self::SymCipher),
            _ => Err(TpmRcBase::Type),
        }
    }
}

/// Algorithm parameters and unique field of a public area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicParams {
    Rsa {
        key_bits: u16,
        exponent: u32,
        modulus: Vec<u8>,
    },
    Ecc {
        curve: u16,
        x: Vec<u8>,
        y: Vec<u8>,
    },
    KeyedHash {
        unique: Vec<u8>,
    },
    SymCipher {
        key_bits: u16,
        unique: Vec<u8>,
    },
}

/// Public area of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicArea {
    pub name_alg: TpmAlgId,
    pub attributes: TpmaObject,
    pub auth_policy: Vec<u8>,
    pub params: PublicParams,
}

impl PublicArea {
    #[must_use]
    pub fn object_type(&self) -> ObjectType {
        match self.params {
            PublicParams::Rsa { .. } => ObjectType::Rsa,
            PublicParams::Ecc { .. } => ObjectType::Ecc,
            PublicParams::KeyedHash { .. } => ObjectType::KeyedHash,
            PublicParams::SymCipher { .. } => ObjectType::SymCipher,
        }
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` for a field too large for its `TPM2B`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TpmRcBase> {
        let mut w = Writer::new();
        w.u16(self.object_type() as u16)
            .u16(self.name_alg as u16)
            .u32(self.attributes.bits())
            .tpm2b(&self.auth_policy)?;
        match &self.params {
            PublicParams::Rsa {
                key_bits,
                exponent,
                modulus,
            } => {
                w.u16(*key_bits).u32(*exponent).tpm2b(modulus)?;
            }
            PublicParams::Ecc { curve, x, y } => {
                w.u16(*curve).tpm2b(x)?.tpm2b(y)?;
            }
            PublicParams::KeyedHash { unique } => {
                w.tpm2b(unique)?;
            }
            PublicParams::SymCipher { key_bits, unique } => {
                w.u16(*key_bits).tpm2b(unique)?;
            }
        }
        Ok(w.into_vec())
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Type` for an unknown object type, `TpmRcBase::Hash` for
    /// an unknown name algorithm and `TpmRcBase::Size` for short input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TpmRcBase> {
        let mut r = Reader::new(bytes);
        let object_type = ObjectType::try_from(r.u16()?)?;
        let name_alg = hash_alg_from_u16(r.u16()?).ok_or(TpmRcBase::Hash)?;
        let attributes = TpmaObject::from_bits_retain(r.u32()?);
        let auth_policy = r.tpm2b()?.to_vec();
        let params = match object_type {
            ObjectType::Rsa => PublicParams::Rsa {
                key_bits: r.u16()?,
                exponent: r.u32()?,
                modulus: r.tpm2b()?.to_vec(),
            },
            ObjectType::Ecc => PublicParams::Ecc {
                curve: r.u16()?,
                x: r.tpm2b()?.to_vec(),
                y: r.tpm2b()?.to_vec(),
            },
            ObjectType::KeyedHash => PublicParams::KeyedHash {
                unique: r.tpm2b()?.to_vec(),
            },
            ObjectType::SymCipher => PublicParams::SymCipher {
                key_bits: r.u16()?,
                unique: r.tpm2b()?.to_vec(),
            },
        };
        r.finish()?;
        Ok(Self {
            name_alg,
            attributes,
            auth_policy,
            params,
        })
    }

    /// Checks the algorithm parameters and the size of the unique field.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Hash`, `TpmRcBase::KeySize`, `TpmRcBase::Curve`,
    /// `TpmRcBase::Key` or `TpmRcBase::Size` on the first violated rule.
    pub fn validate(&self, crypto: &dyn CryptoEngine) -> Result<(), TpmRcBase> {
        let digest_len = require_digest_size(self.name_alg)?;
        if !self.auth_policy.is_empty() && self.auth_policy.len() != digest_len {
            return Err(TpmRcBase::Size);
        }
        match &self.params {
            PublicParams::Rsa {
                key_bits,
                exponent,
                modulus,
            } => {
                if ![1024, 2048, 3072, 4096].contains(key_bits)
                    || modulus.len() != usize::from(*key_bits / 8)
                {
                    return Err(TpmRcBase::KeySize);
                }
                if crypto.rsa_public_size(modulus, *exponent)? != modulus.len() {
                    return Err(TpmRcBase::Key);
                }
            }
            PublicParams::Ecc { curve, x, y } => {
                if *curve != TPM_ECC_NIST_P256 {
                    return Err(TpmRcBase::Curve);
                }
                if x.len() != ECC_P256_COORD_SIZE || y.len() != ECC_P256_COORD_SIZE {
                    return Err(TpmRcBase::KeySize);
                }
            }
            PublicParams::KeyedHash { unique } => {
                if unique.len() != digest_len {
                    return Err(TpmRcBase::KeySize);
                }
            }
            PublicParams::SymCipher { key_bits, unique } => {
                if ![128, 256].contains(key_bits) {
                    return Err(TpmRcBase::KeySize);
                }
                if unique.len() != digest_len {
                    return Err(TpmRcBase::KeySize);
                }
            }
        }
        Ok(())
    }
}

/// Sensitive area of an object.
///
/// `secret` is the RSA prime, the ECC private scalar, the symmetric key,
/// the HMAC key or the sealed data, depending on the object type.
#[derive(Clone, Default)]
pub struct Sensitive {
    pub auth_value: Zeroizing<Vec<u8>>,
    pub seed_value: Zeroizing<Vec<u8>>,
    pub secret: Zeroizing<Vec<u8>>,
}

impl Sensitive {
    #[must_use]
    pub fn new(auth_value: &[u8], seed_value: &[u8], secret: &[u8]) -> Self {
        Self {
            auth_value: Zeroizing::new(auth_value.to_vec()),
            seed_value: Zeroizing::new(seed_value.to_vec()),
            secret: Zeroizing::new(secret.to_vec()),
        }
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` for a field too large for its `TPM2B`.
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
        let mut w = Writer::new();
        w.tpm2b(&self.auth_value)?
            .tpm2b(&self.seed_value)?
            .tpm2b(&self.secret)?;
        Ok(Zeroizing::new(w.into_vec()))
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` for malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TpmRcBase> {
        let mut r = Reader::new(bytes);
        let sensitive = Self::new(r.tpm2b()?, r.tpm2b()?, r.tpm2b()?);
        r.finish()?;
        Ok(sensitive)
    }

    /// Unique field of a keyed-hash or symmetric object bound to this
    /// sensitive area.
    ///
    /// # Errors
    ///
    /// Propagates digest errors.
    pub fn unique_digest(
        &self,
        name_alg: TpmAlgId,
        crypto: &dyn CryptoEngine,
    ) -> Result<Vec<u8>, TpmRcBase> {
        crypto.digest(name_alg, &[&self.seed_value, &self.secret])
    }
}

/// Checks that the sensitive area belongs to the public area.
///
/// # Errors
///
/// Returns `TpmRcBase::Binding` on a mismatch and `TpmRcBase::Size` for an oversize
/// authorization value.
pub fn check_binding(
    public: &PublicArea,
    sensitive: &Sensitive,
    crypto: &dyn CryptoEngine,
) -> Result<(), TpmRcBase> {
    let digest_len = require_digest_size(public.name_alg)?;
    if sensitive.auth_value.len() > digest_len {
        return Err(TpmRcBase::Size);
    }
    let bound = match &public.params {
        PublicParams::Rsa { modulus, .. } => crypto.rsa_is_factor(modulus, &sensitive.secret)?,
        PublicParams::Ecc { x, y, .. } => match crypto.ecc_public(&sensitive.secret) {
            Ok((px, py)) => px == *x && py == *y,
            Err(_) => false,
        },
        PublicParams::KeyedHash { unique } => {
            sensitive.unique_digest(public.name_alg, crypto)? == *unique
        }
        PublicParams::SymCipher { key_bits, unique } => {
            sensitive.secret.len() == usize::from(*key_bits / 8)
                && sensitive.unique_digest(public.name_alg, crypto)? == *unique
        }
    };
    if bound {
        Ok(())
    } else {
        Err(TpmRcBase::Binding)
    }
}

/// Computes `nameAlg || H(parentQN || name)`.
///
/// # Errors
///
/// Propagates digest errors.
pub fn qualified_name(
    crypto: &dyn CryptoEngine,
    name_alg: TpmAlgId,
    parent_qn: &[u8],
    name: &[u8],
) -> Result<Vec<u8>, TpmRcBase> {
    let digest = crypto.digest(name_alg, &[parent_qn, name])?;
    let mut qn = (name_alg as u16).to_be_bytes().to_vec();
    qn.extend_from_slice(&digest);
    Ok(qn)
}

/// A key or data object.
#[derive(Clone)]
pub struct KeyObject {
    pub public: PublicArea,
    pub sensitive: Option<Sensitive>,
    pub name: Vec<u8>,
    pub qualified_name: Vec<u8>,
    /// Hierarchy handle, possibly a firmware- or SVN-limited one.
    pub hierarchy: u32,
    pub evict_handle: Option<u32>,
}

impl KeyObject {
    /// Serializes the object in the current evict/context layout.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` for a field too large for its `TPM2B`.
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
        let mut w = Writer::new();
        w.u8(OBJECT_FORMAT_VERSION)
            .u32(self.hierarchy)
            .tpm2b(&self.public.to_bytes()?)?;
        match &self.sensitive {
            Some(sensitive) => {
                w.u8(1).tpm2b(&sensitive.to_bytes()?)?;
            }
            None => {
                w.u8(0);
            }
        }
        w.tpm2b(&self.qualified_name)?;
        Ok(Zeroizing::new(w.into_vec()))
    }

    /// Deserializes an object written by any supported layout version.
    ///
    /// Version 1 records lack the hierarchy handle, which is derived from
    /// the persistent handle they were stored under.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` for malformed input and `TpmRcBase::Value` for an
    /// unknown version.
    pub fn from_bytes(
        bytes: &[u8],
        evict_handle: Option<u32>,
        crypto: &dyn CryptoEngine,
    ) -> Result<Self, TpmRcBase> {
        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        let hierarchy = match version {
            1 => migrate_v1_hierarchy(evict_handle)?,
            OBJECT_FORMAT_VERSION => r.u32()?,
            _ => return Err(TpmRcBase::Value),
        };
        let public = PublicArea::from_bytes(r.tpm2b()?)?;
        let sensitive = match r.u8()? {
            0 => None,
            _ => Some(Sensitive::from_bytes(r.tpm2b()?)?),
        };
        let qualified_name = r.tpm2b()?.to_vec();
        r.finish()?;
        let name = crypto.make_name(public.name_alg, &public.to_bytes()?)?;
        Ok(Self {
            public,
            sensitive,
            name,
            qualified_name,
            hierarchy,
            evict_handle,
        })
    }

    #[must_use]
    pub fn auth_value(&self) -> &[u8] {
        self.sensitive
            .as_ref()
            .map_or(&[][..], |s| s.auth_value.as_slice())
    }
}

fn migrate_v1_hierarchy(evict_handle: Option<u32>) -> Result<u32, TpmRcBase> {
    let handle = evict_handle.ok_or(TpmRcBase::Value)?;
    debug!(target: "tpm2sim::object", "{handle:#010x}: migrating v1 object record");
    Ok(persistent_owner(handle).handle())
}

/// Kind of a sequence object.
#[derive(Clone)]
pub enum SequenceKind {
    Hash(TpmAlgId),
    Hmac {
        alg: TpmAlgId,
        key: Zeroizing<Vec<u8>>,
    },
}

/// A hash or HMAC sequence in progress.
#[derive(Clone)]
pub struct SequenceObject {
    pub kind: SequenceKind,
    pub auth_value: Zeroizing<Vec<u8>>,
    pub data: Vec<u8>,
    pub hierarchy: u32,
}

impl SequenceObject {
    #[must_use]
    pub fn alg(&self) -> TpmAlgId {
        match &self.kind {
            SequenceKind::Hash(alg) | SequenceKind::Hmac { alg, .. } => *alg,
        }
    }

    /// Finishes the sequence.
    ///
    /// # Errors
    ///
    /// Propagates digest and HMAC errors.
    pub fn complete(&self, crypto: &dyn CryptoEngine) -> Result<Vec<u8>, TpmRcBase> {
        match &self.kind {
            SequenceKind::Hash(alg) => crypto.digest(*alg, &[&self.data]),
            SequenceKind::Hmac { alg, key } => crypto.hmac(*alg, key, &[&self.data]),
        }
    }

    fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
        let mut w = Writer::new();
        match &self.kind {
            SequenceKind::Hash(alg) => {
                w.u8(0).u16(*alg as u16).tpm2b(&[])?;
            }
            SequenceKind::Hmac { alg, key } => {
                w.u8(1).u16(*alg as u16).tpm2b(key)?;
            }
        }
        let data_len = u32::try_from(self.data.len()).map_err(|_| TpmRcBase::Size)?;
        w.tpm2b(&self.auth_value)?
            .u32(self.hierarchy)
            .u32(data_len)
            .bytes(&self.data);
        Ok(Zeroizing::new(w.into_vec()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, TpmRcBase> {
        let mut r = Reader::new(bytes);
        let tag = r.u8()?;
        let alg = hash_alg_from_u16(r.u16()?).ok_or(TpmRcBase::Hash)?;
        let key = Zeroizing::new(r.tpm2b()?.to_vec());
        let kind = match tag {
            0 => SequenceKind::Hash(alg),
            1 => SequenceKind::Hmac { alg, key },
            _ => return Err(TpmRcBase::Value),
        };
        let auth_value = Zeroizing::new(r.tpm2b()?.to_vec());
        let hierarchy = r.u32()?;
        let len = r.u32()?;
        let data = r.take(len as usize)?.to_vec();
        r.finish()?;
        Ok(Self {
            kind,
            auth_value,
            data,
            hierarchy,
        })
    }
}

/// A loaded object.
#[derive(Clone)]
pub enum Object {
    Key(KeyObject),
    Sequence(SequenceObject),
}

impl Object {
    /// Hierarchy handle the object was created or loaded under.
    #[must_use]
    pub fn hierarchy_handle(&self) -> u32 {
        match self {
            Object::Key(key) => key.hierarchy,
            Object::Sequence(seq) => seq.hierarchy,
        }
    }

    #[must_use]
    pub fn hierarchy(&self) -> Hierarchy {
        Hierarchy::from_handle(self.hierarchy_handle()).unwrap_or(Hierarchy::Null)
    }

    #[must_use]
    pub fn auth_value(&self) -> &[u8] {
        match self {
            Object::Key(key) => key.auth_value(),
            Object::Sequence(seq) => &seq.auth_value,
        }
    }

    /// Sequence objects are DA-exempt.
    #[must_use]
    pub fn is_no_da(&self) -> bool {
        match self {
            Object::Key(key) => key.public.attributes.contains(TpmaObject::NO_DA),
            Object::Sequence(_) => true,
        }
    }

    /// Saved handle placed in the context of this object.
    #[must_use]
    pub fn saved_handle(&self) -> u32 {
        match self {
            Object::Sequence(_) => CONTEXT_SEQUENCE,
            Object::Key(key) if key.public.attributes.contains(TpmaObject::ST_CLEAR) => {
                CONTEXT_ST_CLEAR
            }
            Object::Key(_) => CONTEXT_OBJECT,
        }
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` for a field too large for its encoding.
    pub fn to_context_bytes(&self) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
        let (tag, body) = match self {
            Object::Key(key) => (0u8, key.to_bytes()?),
            Object::Sequence(seq) => (1u8, seq.to_bytes()?),
        };
        let mut out = Zeroizing::new(Vec::with_capacity(body.len() + 1));
        out.push(tag);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` or `TpmRcBase::Value` for malformed input.
    pub fn from_context_bytes(bytes: &[u8], crypto: &dyn CryptoEngine) -> Result<Self, TpmRcBase> {
        let (tag, body) = bytes.split_first().ok_or(TpmRcBase::Size)?;
        match tag {
            0 => Ok(Object::Key(KeyObject::from_bytes(body, None, crypto)?)),
            1 => Ok(Object::Sequence(SequenceObject::from_bytes(body)?)),
            _ => Err(TpmRcBase::Value),
        }
    }
}

/// Reference to an occupied slot, invalidated by a flush of that slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    index: usize,
    generation: u32,
}

impl ObjectRef {
    /// Transient handle of the slot.
    #[must_use]
    pub fn handle(self) -> u32 {
        TRANSIENT_FIRST + u32::try_from(self.index).unwrap_or(0)
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    object: Option<Object>,
}

/// Fixed-capacity arena of loaded objects.
pub struct ObjectStore {
    slots: Vec<Slot>,
}

impl ObjectStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
        }
    }

    /// Finds a free slot without occupying it.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::ObjectMemory` when every slot is occupied.
    pub fn allocate_slot(&self) -> Result<ObjectRef, TpmRcBase> {
        self.slots
            .iter()
            .position(|slot| slot.object.is_none())
            .map(|index| ObjectRef {
                index,
                generation: self.slots[index].generation,
            })
            .ok_or(TpmRcBase::ObjectMemory)
    }

    /// Places an already validated object into `slot`.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::ObjectMemory` if the slot was taken in between.
    pub fn insert(&mut self, slot: ObjectRef, object: Object) -> Result<u32, TpmRcBase> {
        let entry = self.slots.get_mut(slot.index).ok_or(TpmRcBase::ObjectMemory)?;
        if entry.object.is_some() || entry.generation != slot.generation {
            return Err(TpmRcBase::ObjectMemory);
        }
        entry.object = Some(object);
        Ok(slot.handle())
    }

    /// Validates and loads a key object.
    ///
    /// The public area is validated, the sensitive area checked against it,
    /// and the Name and Qualified Name computed before the slot is touched.
    ///
    /// # Errors
    ///
    /// Returns the validation error, `TpmRcBase::Binding` for mismatching
    /// sensitive material, or `TpmRcBase::ObjectMemory`.
    pub fn load(
        &mut self,
        slot: ObjectRef,
        public: PublicArea,
        sensitive: Option<Sensitive>,
        parent_qn: &[u8],
        hierarchy: u32,
        crypto: &dyn CryptoEngine,
    ) -> Result<u32, TpmRcBase> {
        public.validate(crypto)?;
        if let Some(sensitive) = &sensitive {
            check_binding(&public, sensitive, crypto)?;
        }
        let name = crypto.make_name(public.name_alg, &public.to_bytes()?)?;
        let qualified_name = qualified_name(crypto, public.name_alg, parent_qn, &name)?;
        let handle = self.insert(
            slot,
            Object::Key(KeyObject {
                public,
                sensitive,
                name,
                qualified_name,
                hierarchy,
                evict_handle: None,
            }),
        )?;
        debug!(target: "tpm2sim::object", "{handle:#010x}: loaded");
        Ok(handle)
    }

    /// Resolves a transient handle, or a persistent handle whose object is
    /// currently materialized.
    #[must_use]
    pub fn resolve(&self, handle: u32) -> Option<ObjectRef> {
        let found = if handle >> 24 == TRANSIENT_FIRST >> 24 {
            let index = usize::try_from(handle - TRANSIENT_FIRST).ok()?;
            self.slots
                .get(index)
                .filter(|slot| slot.object.is_some())
                .map(|_| index)
        } else {
            self.slots.iter().position(|slot| match &slot.object {
                Some(Object::Key(key)) => key.evict_handle == Some(handle),
                _ => false,
            })
        }?;
        Some(ObjectRef {
            index: found,
            generation: self.slots[found].generation,
        })
    }

    #[must_use]
    pub fn get(&self, slot: ObjectRef) -> Option<&Object> {
        self.slots
            .get(slot.index)
            .filter(|s| s.generation == slot.generation)
            .and_then(|s| s.object.as_ref())
    }

    pub fn get_mut(&mut self, slot: ObjectRef) -> Option<&mut Object> {
        self.slots
            .get_mut(slot.index)
            .filter(|s| s.generation == slot.generation)
            .and_then(|s| s.object.as_mut())
    }

    #[must_use]
    pub fn by_handle(&self, handle: u32) -> Option<&Object> {
        self.resolve(handle).and_then(|r| self.get(r))
    }

    pub fn by_handle_mut(&mut self, handle: u32) -> Option<&mut Object> {
        self.resolve(handle).and_then(|r| self.get_mut(r))
    }

    #[must_use]
    pub fn is_present(&self, handle: u32) -> bool {
        self.resolve(handle).is_some()
    }

    /// Frees a slot. A stale reference is a no-op.
    pub fn flush(&mut self, slot: ObjectRef) -> Option<Object> {
        let entry = self.slots.get_mut(slot.index)?;
        if entry.generation != slot.generation {
            return None;
        }
        let object = entry.object.take();
        if object.is_some() {
            entry.generation = entry.generation.wrapping_add(1);
        }
        object
    }

    /// Flushes every object of a hierarchy. Returns the number flushed.
    pub fn flush_hierarchy(&mut self, hierarchy: Hierarchy) -> usize {
        let mut count = 0;
        for slot in &mut self.slots {
            if slot
                .object
                .as_ref()
                .is_some_and(|object| object.hierarchy() == hierarchy)
            {
                slot.object = None;
                slot.generation = slot.generation.wrapping_add(1);
                count += 1;
            }
        }
        if count > 0 {
            debug!(target: "tpm2sim::object", "{hierarchy:?}: flushed {count} objects");
        }
        count
    }

    /// Flushes every object.
    pub fn flush_all(&mut self) {
        for slot in &mut self.slots {
            if slot.object.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
    }

    /// Transient handles of loaded objects, excluding materialized
    /// persistent objects.
    #[must_use]
    pub fn handles(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match &slot.object {
                Some(Object::Key(key)) if key.evict_handle.is_some() => None,
                Some(_) => Some(ObjectRef {
                    index,
                    generation: slot.generation,
                }),
                None => None,
            })
            .map(ObjectRef::handle)
            .collect()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Builds the public area of a keyed-hash object bound to `sensitive`.
///
/// # Errors
///
/// Returns `TpmRcBase::Hash` for an unsupported name algorithm.
pub fn keyed_hash_public(
    name_alg: TpmAlgId,
    attributes: TpmaObject,
    auth_policy: &[u8],
    sensitive: &Sensitive,
    crypto: &dyn CryptoEngine,
) -> Result<PublicArea, TpmRcBase> {
    digest_size(name_alg).ok_or(TpmRcBase::Hash)?;
    Ok(PublicArea {
        name_alg,
        attributes,
        auth_policy: auth_policy.to_vec(),
        params: PublicParams::KeyedHash {
            unique: sensitive.unique_digest(name_alg, crypto)?,
        },
    })
}
