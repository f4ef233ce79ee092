// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Hash and HMAC sequences.

use crate::{
    command::Call,
    crypto::{digest_size, hash_alg_from_u16},
    engine::Engine,
    error::{TpmError, TpmRcBase, TpmRcExt},
    handle::{ProofSelector, TPM_RH_NULL},
    object::{Object, PublicParams, SequenceKind, SequenceObject, TpmaObject},
};
use log::debug;
use zeroize::Zeroizing;

/// Largest amount of data buffered by a sequence.
pub const MAX_SEQUENCE_DATA: usize = 1 << 20;

/// `TPM_ST_HASHCHECK`
const TPM_ST_HASHCHECK: u16 = 0x8024;

fn start(engine: &mut Engine, call: &mut Call<'_>, sequence: SequenceObject) -> Result<(), TpmError> {
    let max_auth = digest_size(sequence.alg()).unwrap_or(0);
    if sequence.auth_value.len() > max_auth {
        return Err(TpmRcBase::Size.at_parameter(1));
    }
    let slot = engine.objects.allocate_slot()?;
    let handle = engine.objects.insert(slot, Object::Sequence(sequence))?;
    debug!(target: "tpm2sim::sequence", "{handle:#010x}: started");
    call.out_handles.push(handle);
    Ok(())
}

/// `TPM2_HashSequenceStart`
///
/// # Errors
///
/// Returns `TpmRcBase::Hash` for an unsupported algorithm and
/// `TpmRcBase::ObjectMemory` when no slot is free.
pub fn hash_sequence_start(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = Zeroizing::new(call.params.tpm2b().at_parameter(1)?.to_vec());
    let alg = call.params.u16().at_parameter(2)?;
    call.params.finish()?;
    let alg = hash_alg_from_u16(alg).ok_or(TpmRcBase::Hash.at_parameter(2))?;
    let sequence = SequenceObject {
        kind: SequenceKind::Hash(alg),
        auth_value: auth,
        data: Vec::new(),
        hierarchy: TPM_RH_NULL,
    };
    start(engine, call, sequence)
}

/// `TPM2_HMAC_Start`
///
/// # Errors
///
/// Returns `TpmRcBase::Type` unless the key is a keyed-hash object,
/// `TpmRcBase::Key` when its sensitive area is not loaded, and
/// `TpmRcBase::Attributes` for a restricted or non-signing key.
pub fn hmac_start(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let key_handle = call.handle(0)?;
    let auth = Zeroizing::new(call.params.tpm2b().at_parameter(1)?.to_vec());
    let alg = call.params.u16().at_parameter(2)?;
    call.params.finish()?;
    let alg = hash_alg_from_u16(alg).ok_or(TpmRcBase::Hash.at_parameter(2))?;

    let Some(Object::Key(key)) = engine.objects.by_handle(key_handle) else {
        return Err(TpmRcBase::Handle.at_handle(1));
    };
    if !matches!(key.public.params, PublicParams::KeyedHash { .. }) {
        return Err(TpmRcBase::Type.at_handle(1));
    }
    let attrs = key.public.attributes;
    if attrs.contains(TpmaObject::RESTRICTED) || !attrs.contains(TpmaObject::SIGN_ENCRYPT) {
        return Err(TpmRcBase::Attributes.at_handle(1));
    }
    let secret = key.sensitive.as_ref().ok_or(TpmRcBase::Key.at_handle(1))?.secret.clone();
    let sequence = SequenceObject {
        kind: SequenceKind::Hmac { alg, key: secret },
        auth_value: auth,
        data: Vec::new(),
        hierarchy: key.hierarchy,
    };
    start(engine, call, sequence)
}

fn sequence_mut<'e>(engine: &'e mut Engine, handle: u32) -> Result<&'e mut SequenceObject, TpmError> {
    match engine.objects.by_handle_mut(handle) {
        Some(Object::Sequence(sequence)) => Ok(sequence),
        Some(Object::Key(_)) => Err(TpmRcBase::Mode.at_handle(1)),
        None => Err(TpmRcBase::Handle.at_handle(1)),
    }
}

fn append(sequence: &mut SequenceObject, buffer: &[u8]) -> Result<(), TpmError> {
    if sequence.data.len() + buffer.len() > MAX_SEQUENCE_DATA {
        return Err(TpmRcBase::Memory.into());
    }
    sequence.data.extend_from_slice(buffer);
    Ok(())
}

/// `TPM2_SequenceUpdate`
///
/// # Errors
///
/// Returns `TpmRcBase::Mode` for an object that is not a sequence and
/// `TpmRcBase::Memory` when the buffered data would grow too large.
pub fn sequence_update(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.handle(0)?;
    let buffer = call.params.tpm2b().at_parameter(1)?;
    call.params.finish()?;
    append(sequence_mut(engine, handle)?, buffer)
}

/// `TPM2_SequenceComplete`
///
/// Returns the digest or HMAC and an empty hash-check ticket. The sequence
/// object is flushed.
///
/// # Errors
///
/// Returns `TpmRcBase::Mode` for an object that is not a sequence and
/// `TpmRcBase::Value` for an unknown hierarchy.
pub fn sequence_complete(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.handle(0)?;
    let buffer = call.params.tpm2b().at_parameter(1)?;
    let hierarchy = call.params.u32().at_parameter(2)?;
    call.params.finish()?;
    if ProofSelector::from_handle(hierarchy).is_none() {
        return Err(TpmRcBase::Value.at_parameter(2));
    }

    let sequence = sequence_mut(engine, handle)?;
    append(sequence, buffer)?;
    let sequence = sequence.clone();
    let result = sequence.complete(engine.crypto())?;
    if let Some(slot) = engine.objects.resolve(handle) {
        engine.objects.flush(slot);
    }
    call.removed.push(handle);
    debug!(target: "tpm2sim::sequence", "{handle:#010x}: completed");

    call.out
        .tpm2b(&result)?
        .u16(TPM_ST_HASHCHECK)
        .u32(TPM_RH_NULL)
        .tpm2b(&[])?;
    Ok(())
}
