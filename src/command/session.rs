// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::{
    authorize::MIN_NONCE_SIZE,
    command::Call,
    crypto::{hash_alg_from_u16, require_digest_size, KDF_LABEL_ATH, KDF_LABEL_SECRET},
    engine::Engine,
    error::{TpmError, TpmRcBase, TpmRcExt},
    handle::{TPM_RH_LOCKOUT, TPM_RH_NULL},
    object::{Object, PublicParams, TpmaObject},
    session::{bound_entity, Session, SessionFlags, SessionKind, SessionSymmetric},
    util::Reader,
};
use log::debug;
use zeroize::Zeroizing;

/// Recovers the salt sealed to an ECC decryption key: `Z` is the x
/// coordinate of the ECDH point and the salt is `KDFe(nameAlg, Z, "SECRET",
/// ephemeral.x, key.x)`.
fn decrypt_salt(engine: &Engine, tpm_key: u32, encrypted: &[u8]) -> Result<Zeroizing<Vec<u8>>, TpmError> {
    let Some(Object::Key(key)) = engine.objects.by_handle(tpm_key) else {
        return Err(TpmRcBase::Handle.at_handle(1));
    };
    let PublicParams::Ecc { x: key_x, .. } = &key.public.params else {
        return Err(TpmRcBase::Key.at_handle(1));
    };
    if !key.public.attributes.contains(TpmaObject::DECRYPT) {
        return Err(TpmRcBase::Attributes.at_handle(1));
    }
    let sensitive = key.sensitive.as_ref().ok_or(TpmRcBase::Key.at_handle(1))?;

    let mut r = Reader::new(encrypted);
    let x = r.tpm2b().at_parameter(2)?;
    let y = r.tpm2b().at_parameter(2)?;
    r.finish().at_parameter(2)?;

    let z = engine
        .crypto()
        .ecdh(&sensitive.secret, x, y)
        .map_err(|_| TpmRcBase::Value.at_parameter(2))?;
    let alg = key.public.name_alg;
    let bits = require_digest_size(alg)? * 8;
    let bits = u32::try_from(bits).map_err(|_| TpmRcBase::Size)?;
    Ok(engine.crypto().kdfe(alg, &z, KDF_LABEL_SECRET, x, key_x, bits)?)
}

/// `TPM2_StartAuthSession`
///
/// # Errors
///
/// Returns `TpmRcBase::Size` for a caller nonce outside `16..=digestSize`,
/// `TpmRcBase::Value` for a salt without a key, or a session table error.
pub fn start_auth_session(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let tpm_key = call.handle(0)?;
    let bind = call.handle(1)?;
    let nonce_caller = call.params.tpm2b().at_parameter(1)?.to_vec();
    let encrypted_salt = call.params.tpm2b().at_parameter(2)?.to_vec();
    let kind = SessionKind::try_from(call.params.u8().at_parameter(3)?).at_parameter(3)?;
    let symmetric = SessionSymmetric::read_from(&mut call.params).at_parameter(4)?;
    let auth_hash = hash_alg_from_u16(call.params.u16().at_parameter(5)?)
        .ok_or(TpmRcBase::Hash.at_parameter(5))?;
    call.params.finish()?;

    let digest_len = require_digest_size(auth_hash).at_parameter(5)?;
    if nonce_caller.len() < MIN_NONCE_SIZE || nonce_caller.len() > digest_len {
        return Err(TpmRcBase::Size.at_parameter(1));
    }
    engine.sessions.check_create()?;

    let salt = if tpm_key == TPM_RH_NULL {
        if !encrypted_salt.is_empty() {
            return Err(TpmRcBase::Value.at_parameter(2));
        }
        Zeroizing::default()
    } else {
        decrypt_salt(engine, tpm_key, &encrypted_salt)?
    };

    let mut session = Session::new(kind, auth_hash, digest_len);
    session.symmetric = symmetric;
    session.start_time = engine.now();
    session.nonce_tpm = engine.random(digest_len);

    let mut key_material = Zeroizing::new(Vec::new());
    if bind != TPM_RH_NULL {
        let auth = engine.entity_auth_value(bind);
        let name = engine.entity_name(bind).at_handle(2)?;
        let len = auth.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        key_material.extend_from_slice(&auth[..len]);
        session.bind = Some(bound_entity(&name, &auth));
        session.flags.insert(SessionFlags::BOUND);
        if bind == TPM_RH_LOCKOUT {
            session.flags.insert(SessionFlags::LOCKOUT_BOUND);
        }
        if bind == TPM_RH_LOCKOUT || !engine.is_da_exempt(bind) {
            session.flags.insert(SessionFlags::DA_BOUND);
        }
    }
    key_material.extend_from_slice(&salt);
    if !key_material.is_empty() {
        let bits = u32::try_from(digest_len * 8).map_err(|_| TpmRcBase::Size)?;
        session.session_key = engine.crypto().kdfa(
            auth_hash,
            &key_material,
            KDF_LABEL_ATH,
            &session.nonce_tpm,
            &nonce_caller,
            bits,
        )?;
    }

    let nonce_tpm = session.nonce_tpm.clone();
    let handle = engine.sessions.create(session)?;
    debug!(
        target: "tpm2sim::session",
        "{handle:#010x}: {kind:?} {auth_hash:?} salted={} bound={}",
        !salt.is_empty(),
        bind != TPM_RH_NULL
    );
    call.out_handles.push(handle);
    call.out.tpm2b(&nonce_tpm)?;
    Ok(())
}
