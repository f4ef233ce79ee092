// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Hierarchy management and dictionary attack commands.

use crate::{
    command::Call,
    context::CONTEXT_HASH,
    crypto::{digest_size, hash_alg_from_u16},
    engine::Engine,
    error::{TpmError, TpmRcBase, TpmRcExt},
    handle::{
        Hierarchy, TPM_RH_ENDORSEMENT, TPM_RH_LOCKOUT, TPM_RH_OWNER, TPM_RH_PLATFORM,
        TPM_RH_PLATFORM_NV,
    },
    hierarchy::AuthPolicy,
    session::bound_entity,
};
use log::{info, warn};
use tpm2_protocol::data::TpmAlgId;

const TPM_ALG_NULL: u16 = 0x0010;

fn yes_no(value: u8, n: u8) -> Result<bool, TpmError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(TpmRcBase::Value.at_parameter(n)),
    }
}

/// `TPM2_HierarchyControl`
///
/// The platform may enable or disable any hierarchy; the owner may only
/// disable the storage or endorsement hierarchy. Objects of a disabled
/// hierarchy are flushed.
///
/// # Errors
///
/// Returns `TpmRcBase::AuthType` for a change the authorizing hierarchy may
/// not make and `TpmRcBase::Value` for an unknown hierarchy.
pub fn hierarchy_control(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    let enable = call.params.u32().at_parameter(1)?;
    let state = yes_no(call.params.u8().at_parameter(2)?, 2)?;
    call.params.finish()?;

    match auth {
        TPM_RH_PLATFORM => {
            if enable == TPM_RH_PLATFORM && state {
                return Err(TpmRcBase::Value.at_parameter(2));
            }
        }
        TPM_RH_OWNER => {
            if state || !matches!(enable, TPM_RH_OWNER | TPM_RH_ENDORSEMENT) {
                return Err(TpmRcBase::AuthType.at_handle(1));
            }
        }
        _ => return Err(TpmRcBase::Hierarchy.at_handle(1)),
    }

    let h = &mut engine.state.hierarchy;
    let (flag, flushed) = match enable {
        TPM_RH_PLATFORM => (&mut h.ph_enable, Some(Hierarchy::Platform)),
        TPM_RH_OWNER => (&mut h.sh_enable, Some(Hierarchy::Owner)),
        TPM_RH_ENDORSEMENT => (&mut h.eh_enable, Some(Hierarchy::Endorsement)),
        TPM_RH_PLATFORM_NV => (&mut h.ph_enable_nv, None),
        _ => return Err(TpmRcBase::Value.at_parameter(1)),
    };
    *flag = state;
    if !state {
        if let Some(hierarchy) = flushed {
            engine.objects.flush_hierarchy(hierarchy);
        }
    }
    engine.persist_state()?;
    info!(target: "tpm2sim::hierarchy", "{enable:#010x}: enabled={state}");
    Ok(())
}

/// `TPM2_HierarchyChangeAuth`
///
/// # Errors
///
/// Returns `TpmRcBase::Size` for a value longer than the context integrity
/// digest.
pub fn hierarchy_change_auth(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    let new_auth = call.params.tpm2b().at_parameter(1)?;
    call.params.finish()?;
    if new_auth.len() > digest_size(CONTEXT_HASH).unwrap_or(0) {
        return Err(TpmRcBase::Size.at_parameter(1));
    }
    let slot = engine
        .state
        .hierarchy
        .auth_mut(auth)
        .ok_or(TpmRcBase::Hierarchy.at_handle(1))?;
    slot.clear();
    slot.extend_from_slice(new_auth);
    engine.persist_state()?;
    info!(target: "tpm2sim::hierarchy", "{auth:#010x}: authorization changed");
    Ok(())
}

/// `TPM2_SetPrimaryPolicy`
///
/// # Errors
///
/// Returns `TpmRcBase::Size` when the digest does not match the hash algorithm
/// and `TpmRcBase::Hash` for an unsupported algorithm.
pub fn set_primary_policy(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    let digest = call.params.tpm2b().at_parameter(1)?.to_vec();
    let alg = call.params.u16().at_parameter(2)?;
    call.params.finish()?;

    let policy = if alg == TPM_ALG_NULL {
        if !digest.is_empty() {
            return Err(TpmRcBase::Size.at_parameter(1));
        }
        AuthPolicy {
            digest,
            alg: TpmAlgId::Null,
        }
    } else {
        let alg = hash_alg_from_u16(alg).ok_or(TpmRcBase::Hash.at_parameter(2))?;
        if Some(digest.len()) != digest_size(alg) {
            return Err(TpmRcBase::Size.at_parameter(1));
        }
        AuthPolicy { digest, alg }
    };
    let slot = engine
        .state
        .hierarchy
        .policy_mut(auth)
        .ok_or(TpmRcBase::Hierarchy.at_handle(1))?;
    *slot = policy;
    engine.persist_state()?;
    Ok(())
}

/// `TPM2_Clear`
///
/// Deletes the owner and endorsement NV entries and objects, rotates the
/// owner seed and proofs, empties their authorizations and resets the
/// failure counter. Loaded sessions bound to one of the old authorizations
/// are flushed after the response is built, and saved sessions are dropped.
///
/// # Errors
///
/// Returns `TpmRcBase::Disabled` when Clear has been disabled.
pub fn clear(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    call.params.finish()?;
    if !matches!(auth, TPM_RH_PLATFORM | TPM_RH_LOCKOUT) {
        return Err(TpmRcBase::Hierarchy.at_handle(1));
    }
    if engine.state.hierarchy.disable_clear {
        return Err(TpmRcBase::Disabled.into());
    }

    let binds: Vec<Vec<u8>> = [TPM_RH_OWNER, TPM_RH_ENDORSEMENT, TPM_RH_LOCKOUT]
        .into_iter()
        .map(|h| bound_entity(&h.to_be_bytes(), &engine.entity_auth_value(h)))
        .collect();

    let hierarchies = [Hierarchy::Owner, Hierarchy::Endorsement];
    let deleted = engine
        .nv
        .flush_hierarchy(&hierarchies, engine.crypto.as_ref())?;
    for hierarchy in hierarchies {
        engine.objects.flush_hierarchy(hierarchy);
    }
    engine.state.hierarchy.clear(engine.platform.as_mut());
    engine.state.da.failed_tries = 0;
    // A saved context does not reveal its bind value.
    let dropped = engine.sessions.flush_saved();
    call.flush_bound = binds;
    engine.persist_state()?;
    warn!(
        target: "tpm2sim::hierarchy",
        "cleared, {deleted} NV entries deleted, {dropped} saved sessions dropped"
    );
    Ok(())
}

/// `TPM2_ClearControl`
///
/// # Errors
///
/// Returns `TpmRcBase::AuthFail` when the lockout authorization tries to
/// enable Clear.
pub fn clear_control(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    let disable = yes_no(call.params.u8().at_parameter(1)?, 1)?;
    call.params.finish()?;
    match auth {
        TPM_RH_LOCKOUT if !disable => return Err(TpmRcBase::AuthFail.into()),
        TPM_RH_PLATFORM | TPM_RH_LOCKOUT => {}
        _ => return Err(TpmRcBase::Hierarchy.at_handle(1)),
    }
    engine.state.hierarchy.disable_clear = disable;
    engine.persist_state()?;
    Ok(())
}

/// `TPM2_DictionaryAttackLockReset`
///
/// # Errors
///
/// Returns `TpmRcBase::Hierarchy` unless authorized by the lockout hierarchy.
pub fn da_lock_reset(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    call.params.finish()?;
    if auth != TPM_RH_LOCKOUT {
        return Err(TpmRcBase::Hierarchy.at_handle(1));
    }
    let now = engine.now();
    engine.state.da.lock_reset(now);
    engine.persist_state()?;
    info!(target: "tpm2sim::da", "lock reset");
    Ok(())
}

/// `TPM2_DictionaryAttackParameters`
///
/// # Errors
///
/// Returns `TpmRcBase::Hierarchy` unless authorized by the lockout hierarchy.
pub fn da_parameters(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    let max_tries = call.params.u32().at_parameter(1)?;
    let recovery_time = call.params.u32().at_parameter(2)?;
    let lockout_recovery = call.params.u32().at_parameter(3)?;
    call.params.finish()?;
    if auth != TPM_RH_LOCKOUT {
        return Err(TpmRcBase::Hierarchy.at_handle(1));
    }
    let now = engine.now();
    engine
        .state
        .da
        .set_parameters(max_tries, recovery_time, lockout_recovery, now);
    engine.persist_state()?;
    info!(
        target: "tpm2sim::da",
        "max tries {max_tries}, recovery {recovery_time}s, lockout recovery {lockout_recovery}s"
    );
    Ok(())
}
