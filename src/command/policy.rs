// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Policy assertions. Each one checks its argument against the session
//! state and extends the session's policy digest.

use crate::{
    command::{Call, TpmCc},
    crypto::{digest_size, CryptoEngine},
    engine::Engine,
    error::{TpmError, TpmRcBase, TpmRcExt},
    handle::TPM_RH_NULL,
    policy::{self, POLICY_OR_MAX},
    session::{Session, SessionFlags, SessionKind, SessionTable},
};
use log::debug;

/// `TPM_ST_AUTH_SECRET`
const TPM_ST_AUTH_SECRET: u16 = 0x8023;

/// The policy session at handle position `n` (one-based).
fn policy_session(sessions: &mut SessionTable, handle: u32, n: u8) -> Result<&mut Session, TpmError> {
    match sessions.get_mut(handle) {
        Some(session) if session.is_policy() => Ok(session),
        Some(_) => Err(TpmRcBase::Value.at_handle(n)),
        None => Err(TpmRcBase::Handle.at_handle(n)),
    }
}

fn extend(
    crypto: &dyn CryptoEngine,
    session: &mut Session,
    code: TpmCc,
    args: &[&[u8]],
) -> Result<(), TpmError> {
    policy::extend(crypto, session.auth_hash, &mut session.policy_digest, code, args)?;
    Ok(())
}

fn check_digest_arg(session: &Session, digest: &[u8], n: u8) -> Result<(), TpmError> {
    if Some(digest.len()) == digest_size(session.auth_hash) {
        Ok(())
    } else {
        Err(TpmRcBase::Size.at_parameter(n))
    }
}

/// Records a cpHash or nameHash. Only one of them may be set, and only
/// once with a given value.
fn set_cp_hash(session: &mut Session, value: &[u8], name_hash: bool) -> Result<(), TpmError> {
    if let Some(existing) = &session.cp_hash {
        let same_kind = session.flags.contains(SessionFlags::NAME_HASH_DEFINED) == name_hash;
        if !same_kind || existing.as_slice() != value {
            return Err(TpmRcBase::CpHash.at_parameter(1));
        }
    }
    session.cp_hash = Some(value.to_vec());
    session.flags.insert(if name_hash {
        SessionFlags::NAME_HASH_DEFINED
    } else {
        SessionFlags::CP_HASH_DEFINED
    });
    Ok(())
}

/// `TPM2_PolicySecret`
///
/// # Errors
///
/// Returns `TpmRcBase::Nonce` when `nonceTPM` does not match the session,
/// `TpmRcBase::CpHash` for a conflicting cpHash.
pub fn policy_secret(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth_handle = call.handle(0)?;
    let handle = call.handle(1)?;
    let nonce = call.params.tpm2b().at_parameter(1)?;
    let cp_hash_a = call.params.tpm2b().at_parameter(2)?;
    let policy_ref = call.params.tpm2b().at_parameter(3)?;
    let expiration = i32::from_be_bytes(call.params.u32().at_parameter(4)?.to_be_bytes());
    call.params.finish()?;

    let name = engine.entity_name(auth_handle).at_handle(1)?;
    let crypto = engine.crypto.as_ref();
    let session = policy_session(&mut engine.sessions, handle, 2)?;
    if !nonce.is_empty() && nonce != session.nonce_tpm.as_slice() {
        return Err(TpmRcBase::Nonce.at_parameter(1));
    }
    if !cp_hash_a.is_empty() {
        check_digest_arg(session, cp_hash_a, 2)?;
        set_cp_hash(session, cp_hash_a, false).map_err(|_| TpmRcBase::CpHash.at_parameter(2))?;
    }
    if expiration != 0 {
        let timeout = session.start_time + u64::from(expiration.unsigned_abs()) * 1000;
        session.timeout = Some(session.timeout.map_or(timeout, |t| t.min(timeout)));
    }
    policy::extend_with_name(
        crypto,
        session.auth_hash,
        &mut session.policy_digest,
        TpmCc::PolicySecret,
        &name,
        policy_ref,
    )?;
    debug!(target: "tpm2sim::policy", "{handle:#010x}: secret of {auth_handle:#010x}");
    call.out
        .tpm2b(&[])?
        .u16(TPM_ST_AUTH_SECRET)
        .u32(TPM_RH_NULL)
        .tpm2b(&[])?;
    Ok(())
}

/// `TPM2_PolicyCommandCode`
///
/// # Errors
///
/// Returns `TpmRcBase::PolicyCc` for an unimplemented command code or one that
/// conflicts with an earlier assertion.
pub fn policy_command_code(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.handle(0)?;
    let code = call.params.u32().at_parameter(1)?;
    call.params.finish()?;
    let code = TpmCc::try_from(code).map_err(|_| TpmRcBase::PolicyCc.at_parameter(1))?;
    let crypto = engine.crypto.as_ref();
    let session = policy_session(&mut engine.sessions, handle, 1)?;
    if session.command_code.is_some_and(|cc| cc != code as u32) {
        return Err(TpmRcBase::PolicyCc.at_parameter(1));
    }
    session.command_code = Some(code as u32);
    extend(crypto, session, TpmCc::PolicyCommandCode, &[&(code as u32).to_be_bytes()])
}

/// `TPM2_PolicyCpHash`
///
/// # Errors
///
/// Returns `TpmRcBase::Size` for a digest of the wrong size and
/// `TpmRcBase::CpHash` when a different cpHash or a nameHash is already set.
pub fn policy_cp_hash(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.handle(0)?;
    let cp_hash_a = call.params.tpm2b().at_parameter(1)?;
    call.params.finish()?;
    let crypto = engine.crypto.as_ref();
    let session = policy_session(&mut engine.sessions, handle, 1)?;
    check_digest_arg(session, cp_hash_a, 1)?;
    set_cp_hash(session, cp_hash_a, false)?;
    extend(crypto, session, TpmCc::PolicyCpHash, &[cp_hash_a])
}

/// `TPM2_PolicyNameHash`
///
/// # Errors
///
/// Returns `TpmRcBase::Size` for a digest of the wrong size and
/// `TpmRcBase::CpHash` when a cpHash or a different nameHash is already set.
pub fn policy_name_hash(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.handle(0)?;
    let name_hash = call.params.tpm2b().at_parameter(1)?;
    call.params.finish()?;
    let crypto = engine.crypto.as_ref();
    let session = policy_session(&mut engine.sessions, handle, 1)?;
    check_digest_arg(session, name_hash, 1)?;
    set_cp_hash(session, name_hash, true)?;
    extend(crypto, session, TpmCc::PolicyNameHash, &[name_hash])
}

/// `TPM2_PolicyAuthValue`
///
/// # Errors
///
/// Propagates digest errors.
pub fn policy_auth_value(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.handle(0)?;
    call.params.finish()?;
    let crypto = engine.crypto.as_ref();
    let session = policy_session(&mut engine.sessions, handle, 1)?;
    session.flags.remove(SessionFlags::PASSWORD_NEEDED);
    session.flags.insert(SessionFlags::AUTH_VALUE_NEEDED);
    extend(crypto, session, TpmCc::PolicyAuthValue, &[])
}

/// `TPM2_PolicyPassword`. The digest update is that of
/// `TPM2_PolicyAuthValue`.
///
/// # Errors
///
/// Propagates digest errors.
pub fn policy_password(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.handle(0)?;
    call.params.finish()?;
    let crypto = engine.crypto.as_ref();
    let session = policy_session(&mut engine.sessions, handle, 1)?;
    session.flags.remove(SessionFlags::AUTH_VALUE_NEEDED);
    session.flags.insert(SessionFlags::PASSWORD_NEEDED);
    extend(crypto, session, TpmCc::PolicyAuthValue, &[])
}

/// `TPM2_PolicyLocality`
///
/// # Errors
///
/// Returns `TpmRcBase::Range` for an empty mask, an extended locality, or a
/// mask that excludes every locality allowed so far.
pub fn policy_locality(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.handle(0)?;
    let locality = call.params.u8().at_parameter(1)?;
    call.params.finish()?;
    if locality == 0 || locality >= 32 {
        return Err(TpmRcBase::Range.at_parameter(1));
    }
    let crypto = engine.crypto.as_ref();
    let session = policy_session(&mut engine.sessions, handle, 1)?;
    let mask = session.locality.map_or(locality, |prev| prev & locality);
    if mask == 0 {
        return Err(TpmRcBase::Range.at_parameter(1));
    }
    session.locality = Some(mask);
    extend(crypto, session, TpmCc::PolicyLocality, &[&[locality]])
}

/// `TPM2_PolicyNvWritten`
///
/// # Errors
///
/// Returns `TpmRcBase::Value` for a non-boolean argument or one that
/// contradicts an earlier assertion.
pub fn policy_nv_written(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.handle(0)?;
    let written = match call.params.u8().at_parameter(1)? {
        0 => false,
        1 => true,
        _ => return Err(TpmRcBase::Value.at_parameter(1)),
    };
    call.params.finish()?;
    let crypto = engine.crypto.as_ref();
    let session = policy_session(&mut engine.sessions, handle, 1)?;
    if session.flags.contains(SessionFlags::NV_WRITTEN_CHECK)
        && session.flags.contains(SessionFlags::NV_WRITTEN_STATE) != written
    {
        return Err(TpmRcBase::Value.at_parameter(1));
    }
    session.flags.insert(SessionFlags::NV_WRITTEN_CHECK);
    session.flags.set(SessionFlags::NV_WRITTEN_STATE, written);
    extend(crypto, session, TpmCc::PolicyNvWritten, &[&[u8::from(written)]])
}

/// `TPM2_PolicyOR`
///
/// # Errors
///
/// Returns `TpmRcBase::Size` for fewer than two or more than eight branches
/// and `TpmRcBase::Value` when the current digest is not among them. Trial
/// sessions skip the membership check.
pub fn policy_or(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.handle(0)?;
    let count = call.params.u32().at_parameter(1)?;
    if count as usize > POLICY_OR_MAX {
        return Err(TpmRcBase::Size.at_parameter(1));
    }
    let mut branches = Vec::with_capacity(count as usize);
    for _ in 0..count {
        branches.push(call.params.tpm2b().at_parameter(1)?.to_vec());
    }
    call.params.finish()?;
    let crypto = engine.crypto.as_ref();
    let session = policy_session(&mut engine.sessions, handle, 1)?;
    if session.kind == SessionKind::Trial {
        if let Some(first) = branches.first() {
            session.policy_digest.clone_from(first);
        }
    }
    policy::or(crypto, session.auth_hash, &mut session.policy_digest, &branches).at_parameter(1)
}

/// `TPM2_PolicyRestart`
///
/// # Errors
///
/// Returns `TpmRcBase::Value` for an HMAC session.
pub fn policy_restart(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.handle(0)?;
    call.params.finish()?;
    let now = engine.now();
    policy_session(&mut engine.sessions, handle, 1)?.restart_policy(now);
    Ok(())
}

/// `TPM2_PolicyGetDigest`
///
/// # Errors
///
/// Returns `TpmRcBase::Value` for an HMAC session.
pub fn policy_get_digest(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.handle(0)?;
    call.params.finish()?;
    let digest = policy_session(&mut engine.sessions, handle, 1)?
        .policy_digest
        .clone();
    call.out.tpm2b(&digest)?;
    Ok(())
}
