// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! NV index commands.

use crate::{
    command::Call,
    crypto::require_digest_size,
    engine::Engine,
    error::{TpmError, TpmRcBase, TpmRcExt},
    handle::{TPM_RH_OWNER, TPM_RH_PLATFORM},
    nv::{NvAccess, NvPublic, TpmaNv},
    util::AttributeSet,
};
use log::{debug, info};

/// Maps store errors about the index itself to the index handle.
fn at_index(rc: TpmRcBase) -> TpmError {
    match rc {
        TpmRcBase::Attributes | TpmRcBase::Handle => rc.at_handle(2),
        _ => rc.into(),
    }
}

/// Checks that `auth` is an entity allowed to authorize `access` to the
/// index: the platform, the owner, or the index itself.
fn check_nv_auth(engine: &Engine, auth: u32, index: u32, access: NvAccess) -> Result<(), TpmError> {
    let attrs = engine.nv.index(index).map_err(at_index)?.public.attributes;
    let (platform, owner, own) = match access {
        NvAccess::Read => (
            TpmaNv::PPREAD,
            TpmaNv::OWNERREAD,
            TpmaNv::AUTHREAD | TpmaNv::POLICYREAD,
        ),
        NvAccess::Write | NvAccess::None => (
            TpmaNv::PPWRITE,
            TpmaNv::OWNERWRITE,
            TpmaNv::AUTHWRITE | TpmaNv::POLICYWRITE,
        ),
    };
    let allowed = match auth {
        TPM_RH_PLATFORM => attrs.contains(platform),
        TPM_RH_OWNER => attrs.contains(owner),
        h if h == index => attrs.intersects(own),
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(TpmRcBase::NvAuthorization.into())
    }
}

/// `TPM2_NV_DefineSpace`
///
/// # Errors
///
/// Returns `TpmRcBase::Attributes` when `PLATFORMCREATE` does not match the
/// authorizing hierarchy, `TpmRcBase::NvDefined` for an existing index, and
/// definition, space and rate errors of the store.
pub fn define_space(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth_handle = call.handle(0)?;
    let auth = call.params.tpm2b().at_parameter(1)?;
    let public = call.params.tpm2b().at_parameter(2)?;
    call.params.finish()?;

    let public = NvPublic::from_bytes(public).at_parameter(2)?;
    public
        .validate_definition(engine.config.max_nv_index_size)
        .at_parameter(2)?;
    if auth.len() > require_digest_size(public.name_alg).at_parameter(2)? {
        return Err(TpmRcBase::Size.at_parameter(1));
    }
    let platform_create = public.attributes.contains(TpmaNv::PLATFORMCREATE);
    match auth_handle {
        TPM_RH_PLATFORM if !platform_create => return Err(TpmRcBase::Attributes.at_parameter(2)),
        TPM_RH_OWNER if platform_create => return Err(TpmRcBase::Attributes.at_parameter(2)),
        TPM_RH_PLATFORM | TPM_RH_OWNER => {}
        _ => return Err(TpmRcBase::Hierarchy.at_handle(1)),
    }
    let index = public.index;
    let now = engine.now();
    engine.nv.define_index(public, auth, now).at_parameter(2)?;
    debug!(target: "tpm2sim::nv", "{index:#010x}: defined by {auth_handle:#010x}");
    Ok(())
}

/// `TPM2_NV_UndefineSpace`
///
/// # Errors
///
/// Returns `TpmRcBase::NvAuthorization` when the authorizing hierarchy did not
/// create the index and `TpmRcBase::Attributes` for a `POLICY_DELETE` index.
pub fn undefine_space(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    let index = call.handle(1)?;
    call.params.finish()?;
    let attrs = engine.nv.index(index).map_err(at_index)?.public.attributes;
    let creator = if attrs.contains(TpmaNv::PLATFORMCREATE) {
        TPM_RH_PLATFORM
    } else {
        TPM_RH_OWNER
    };
    if auth != creator {
        return Err(TpmRcBase::NvAuthorization.into());
    }
    if attrs.contains(TpmaNv::POLICY_DELETE) {
        return Err(TpmRcBase::Attributes.at_handle(2));
    }
    let now = engine.now();
    engine.nv.delete_index(index, now).map_err(at_index)?;
    call.removed.push(index);
    Ok(())
}

/// `TPM2_NV_UndefineSpaceSpecial`
///
/// # Errors
///
/// Returns `TpmRcBase::Attributes` unless the index has `POLICY_DELETE`.
pub fn undefine_space_special(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let index = call.handle(0)?;
    let platform = call.handle(1)?;
    call.params.finish()?;
    if platform != TPM_RH_PLATFORM {
        return Err(TpmRcBase::Hierarchy.at_handle(2));
    }
    let attrs = engine.nv.index(index).at_handle(1)?.public.attributes;
    if !attrs.contains(TpmaNv::POLICY_DELETE) {
        return Err(TpmRcBase::Attributes.at_handle(1));
    }
    let now = engine.now();
    engine.nv.delete_index(index, now).at_handle(1)?;
    call.removed.push(index);
    Ok(())
}

/// `TPM2_NV_Write`
///
/// # Errors
///
/// Returns `TpmRcBase::NvAuthorization`, `TpmRcBase::NvRange`, `TpmRcBase::NvRate` or
/// `TpmRcBase::Attributes` for an index that is not ordinary.
pub fn write(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    let index = call.handle(1)?;
    let data = call.params.tpm2b().at_parameter(1)?;
    let offset = call.params.u16().at_parameter(2)?;
    call.params.finish()?;
    check_nv_auth(engine, auth, index, NvAccess::Write)?;
    let now = engine.now();
    engine
        .nv
        .write_data(index, offset, data, now)
        .map_err(at_index)
}

/// `TPM2_NV_Increment`
///
/// # Errors
///
/// Returns `TpmRcBase::Attributes` for an index that is not a counter.
pub fn increment(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    let index = call.handle(1)?;
    call.params.finish()?;
    check_nv_auth(engine, auth, index, NvAccess::Write)?;
    let now = engine.now();
    let value = engine.nv.increment(index, now).map_err(at_index)?;
    debug!(target: "tpm2sim::nv", "{index:#010x}: counter {value}");
    Ok(())
}

/// `TPM2_NV_SetBits`
///
/// # Errors
///
/// Returns `TpmRcBase::Attributes` for an index that is not a bit field.
pub fn set_bits(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    let index = call.handle(1)?;
    let bits = call.params.u64().at_parameter(1)?;
    call.params.finish()?;
    check_nv_auth(engine, auth, index, NvAccess::Write)?;
    let now = engine.now();
    engine.nv.set_bits(index, bits, now).map_err(at_index)
}

/// `TPM2_NV_Extend`
///
/// # Errors
///
/// Returns `TpmRcBase::Attributes` for an index that is not an extend index.
pub fn extend(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    let index = call.handle(1)?;
    let data = call.params.tpm2b().at_parameter(1)?;
    call.params.finish()?;
    check_nv_auth(engine, auth, index, NvAccess::Write)?;
    let now = engine.now();
    engine
        .nv
        .extend(index, data, engine.crypto.as_ref(), now)
        .map_err(at_index)
}

/// `TPM2_NV_WriteLock`
///
/// # Errors
///
/// Returns `TpmRcBase::Attributes` unless the index has `WRITEDEFINE` or
/// `WRITE_STCLEAR`.
pub fn write_lock(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    let index = call.handle(1)?;
    call.params.finish()?;
    check_nv_auth(engine, auth, index, NvAccess::Write)?;
    let attrs = engine.nv.index(index).map_err(at_index)?.public.attributes;
    if !attrs.intersects(TpmaNv::WRITEDEFINE | TpmaNv::WRITE_STCLEAR) {
        return Err(TpmRcBase::Attributes.at_handle(2));
    }
    let now = engine.now();
    engine
        .nv
        .lock(index, TpmaNv::WRITELOCKED, now)
        .map_err(at_index)
}

/// `TPM2_NV_GlobalWriteLock`
///
/// # Errors
///
/// Returns `TpmRcBase::Hierarchy` unless authorized by the owner or platform,
/// and `TpmRcBase::NvUnavailable` when the lock cannot be persisted.
pub fn global_write_lock(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    call.params.finish()?;
    if !matches!(auth, TPM_RH_OWNER | TPM_RH_PLATFORM) {
        return Err(TpmRcBase::Hierarchy.at_handle(1));
    }
    let was_locked = engine.state.nv_global_lock;
    engine.set_nv_global_lock(true);
    if let Err(rc) = engine.persist_state() {
        engine.set_nv_global_lock(was_locked);
        return Err(rc.into());
    }
    info!(target: "tpm2sim::nv", "global write lock set");
    Ok(())
}

/// `TPM2_NV_Read`
///
/// # Errors
///
/// Returns `TpmRcBase::NvAuthorization`, `TpmRcBase::NvRange` or
/// `TpmRcBase::NvUninitialized`.
pub fn read(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    let index = call.handle(1)?;
    let size = call.params.u16().at_parameter(1)?;
    let offset = call.params.u16().at_parameter(2)?;
    call.params.finish()?;
    check_nv_auth(engine, auth, index, NvAccess::Read)?;
    let data = engine.nv.read_data(index, offset, size).map_err(at_index)?;
    call.out.tpm2b(&data)?;
    Ok(())
}

/// `TPM2_NV_ReadLock`
///
/// # Errors
///
/// Returns `TpmRcBase::Attributes` unless the index has `READ_STCLEAR`.
pub fn read_lock(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    let index = call.handle(1)?;
    call.params.finish()?;
    check_nv_auth(engine, auth, index, NvAccess::Read)?;
    let attrs = engine.nv.index(index).map_err(at_index)?.public.attributes;
    if !attrs.contains(TpmaNv::READ_STCLEAR) {
        return Err(TpmRcBase::Attributes.at_handle(2));
    }
    let now = engine.now();
    engine
        .nv
        .lock(index, TpmaNv::READLOCKED, now)
        .map_err(at_index)
}

/// `TPM2_NV_ReadPublic`
///
/// # Errors
///
/// Returns `TpmRcBase::Handle` for an undefined index.
pub fn read_public(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let index = call.handle(0)?;
    call.params.finish()?;
    let public = engine.nv.public(index).at_handle(1)?;
    let name = public.name(engine.crypto())?;
    call.out.tpm2b(&public.to_bytes()?)?.tpm2b(&name)?;
    Ok(())
}

/// `TPM2_NV_ChangeAuth`
///
/// # Errors
///
/// Returns `TpmRcBase::Size` for a value longer than the name algorithm's
/// digest.
pub fn change_auth(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let index = call.handle(0)?;
    let new_auth = call.params.tpm2b().at_parameter(1)?;
    call.params.finish()?;
    let public = engine.nv.index(index).at_handle(1)?.public;
    if new_auth.len() > require_digest_size(public.name_alg)? {
        return Err(TpmRcBase::Size.at_parameter(1));
    }
    let now = engine.now();
    engine.nv.change_auth(index, new_auth, now).at_handle(1)
}
