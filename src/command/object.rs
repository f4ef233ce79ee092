// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! LoadExternal, CreatePrimary, ReadPublic and EvictControl.

use crate::{
    command::Call,
    crypto::{require_digest_size, CryptoEngine, KDF_LABEL_PRIMARY},
    engine::Engine,
    error::{TpmError, TpmRcBase, TpmRcExt},
    handle::{persistent_owner, HandleType, Hierarchy, ProofSelector, TPM_RH_NULL, TPM_RH_OWNER, TPM_RH_PLATFORM},
    object::{Object, PublicArea, PublicParams, Sensitive, TpmaObject},
    util::Reader,
};
use log::{debug, info};
use tpm2_protocol::data::TpmAlgId;
use zeroize::Zeroizing;

/// Tries before a derived ECC scalar is given up on.
const ECC_DERIVE_ATTEMPTS: u32 = 32;

/// `TPM2_LoadExternal`
///
/// # Errors
///
/// Returns `TpmRcBase::Hierarchy` for sensitive material outside the null
/// hierarchy, `TpmRcBase::Attributes` for a fixed object with sensitive
/// material, and validation or binding errors of the public area.
pub fn load_external(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let in_private = call.params.tpm2b().at_parameter(1)?;
    let in_public = call.params.tpm2b().at_parameter(2)?;
    let hierarchy = call.params.u32().at_parameter(3)?;
    call.params.finish()?;

    let public = PublicArea::from_bytes(in_public).at_parameter(2)?;
    let sensitive = if in_private.is_empty() {
        None
    } else {
        Some(Sensitive::from_bytes(in_private).at_parameter(1)?)
    };
    let selector = ProofSelector::from_handle(hierarchy).ok_or(TpmRcBase::Hierarchy.at_parameter(3))?;
    if !engine.state.hierarchy.is_enabled(selector.hierarchy()) {
        return Err(TpmRcBase::Hierarchy.at_parameter(3));
    }
    if sensitive.is_some() {
        if hierarchy != TPM_RH_NULL {
            return Err(TpmRcBase::Hierarchy.at_parameter(3));
        }
        if public
            .attributes
            .intersects(TpmaObject::FIXED_TPM | TpmaObject::FIXED_PARENT)
        {
            return Err(TpmRcBase::Attributes.at_parameter(2));
        }
    }

    let slot = engine.objects.allocate_slot()?;
    let parent_qn = hierarchy.to_be_bytes();
    let handle = engine
        .objects
        .load(slot, public, sensitive, &parent_qn, hierarchy, engine.crypto.as_ref())
        .at_parameter(2)?;
    let Some(Object::Key(key)) = engine.objects.by_handle(handle) else {
        return Err(TpmRcBase::Failure.into());
    };
    call.out_handles.push(handle);
    call.out.tpm2b(&key.name)?;
    Ok(())
}

struct PrimaryDerivation<'a> {
    crypto: &'a dyn CryptoEngine,
    alg: TpmAlgId,
    seed: &'a [u8],
    template_digest: Vec<u8>,
}

impl PrimaryDerivation<'_> {
    fn derive(&self, purpose: &[u8], bits: u32) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
        self.crypto.kdfa(
            self.alg,
            self.seed,
            KDF_LABEL_PRIMARY,
            &self.template_digest,
            purpose,
            bits,
        )
    }

    fn ecc_scalar(&self) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>, Vec<u8>), TpmRcBase> {
        for counter in 0..ECC_DERIVE_ATTEMPTS {
            let mut purpose = b"ECC".to_vec();
            purpose.extend_from_slice(&counter.to_be_bytes());
            let scalar = self.derive(&purpose, 256)?;
            if let Ok((x, y)) = self.crypto.ecc_public(&scalar) {
                return Ok((scalar, x, y));
            }
        }
        Err(TpmRcBase::Failure)
    }
}

/// Derives the sensitive area of a primary object and fills in the unique
/// field of its public area.
fn derive_primary(
    derivation: &PrimaryDerivation<'_>,
    template: &mut PublicArea,
    user_auth: &[u8],
    data: &[u8],
) -> Result<Sensitive, TpmError> {
    let digest_bits = u32::try_from(require_digest_size(template.name_alg)? * 8)
        .map_err(|_| TpmRcBase::Size)?;
    let seed_value = derivation.derive(b"SEED", digest_bits)?;
    let sensitive = match &mut template.params {
        PublicParams::KeyedHash { unique } => {
            let secret = if data.is_empty() {
                derivation.derive(b"KEY", digest_bits)?
            } else {
                Zeroizing::new(data.to_vec())
            };
            let sensitive = Sensitive::new(user_auth, &seed_value, &secret);
            *unique = sensitive.unique_digest(template.name_alg, derivation.crypto)?;
            sensitive
        }
        PublicParams::SymCipher { key_bits, unique } => {
            if !data.is_empty() {
                return Err(TpmRcBase::Value.at_parameter(1));
            }
            let secret = derivation.derive(b"KEY", u32::from(*key_bits))?;
            let sensitive = Sensitive::new(user_auth, &seed_value, &secret);
            *unique = sensitive.unique_digest(template.name_alg, derivation.crypto)?;
            sensitive
        }
        PublicParams::Ecc { x, y, .. } => {
            if !data.is_empty() {
                return Err(TpmRcBase::Value.at_parameter(1));
            }
            let (scalar, px, py) = derivation.ecc_scalar()?;
            *x = px;
            *y = py;
            Sensitive::new(user_auth, &seed_value, &scalar)
        }
        PublicParams::Rsa { .. } => return Err(TpmRcBase::Type.at_parameter(2)),
    };
    Ok(sensitive)
}

/// `TPM2_CreatePrimary`
///
/// The sensitive area is derived from the hierarchy seed and a digest of
/// the template, so the same template always yields the same key until the
/// seed changes.
///
/// # Errors
///
/// Returns `TpmRcBase::Type` for an RSA template, `TpmRcBase::Size` for an
/// oversize authorization value, or validation errors of the template.
pub fn create_primary(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let primary = call.handle(0)?;
    let in_sensitive = call.params.tpm2b().at_parameter(1)?;
    let in_public = call.params.tpm2b().at_parameter(2)?;
    let _outside_info = call.params.tpm2b().at_parameter(3)?;
    call.params.finish()?;

    let mut r = Reader::new(in_sensitive);
    let user_auth = Zeroizing::new(r.tpm2b().at_parameter(1)?.to_vec());
    let data = Zeroizing::new(r.tpm2b().at_parameter(1)?.to_vec());
    r.finish().at_parameter(1)?;

    let mut template = PublicArea::from_bytes(in_public).at_parameter(2)?;
    let digest_len = require_digest_size(template.name_alg).at_parameter(2)?;
    if user_auth.len() > digest_len {
        return Err(TpmRcBase::Size.at_parameter(1));
    }
    let selector = ProofSelector::from_handle(primary).ok_or(TpmRcBase::Hierarchy.at_handle(1))?;
    let seed = engine
        .state
        .hierarchy
        .seed(selector, engine.platform.as_ref(), engine.crypto.as_ref())
        .at_handle(1)?;
    let derivation = PrimaryDerivation {
        crypto: engine.crypto.as_ref(),
        alg: template.name_alg,
        seed: &seed,
        template_digest: engine.crypto().digest(template.name_alg, &[in_public])?,
    };
    let sensitive = derive_primary(&derivation, &mut template, &user_auth, &data)?;

    let slot = engine.objects.allocate_slot()?;
    let parent_qn = primary.to_be_bytes();
    let handle = engine
        .objects
        .load(
            slot,
            template,
            Some(sensitive),
            &parent_qn,
            primary,
            engine.crypto.as_ref(),
        )
        .at_parameter(2)?;
    let Some(Object::Key(key)) = engine.objects.by_handle(handle) else {
        return Err(TpmRcBase::Failure.into());
    };
    info!(target: "tpm2sim::object", "{handle:#010x}: primary under {primary:#010x}");
    call.out_handles.push(handle);
    call.out.tpm2b(&key.public.to_bytes()?)?.tpm2b(&key.name)?;
    Ok(())
}

/// `TPM2_ReadPublic`
///
/// # Errors
///
/// Returns `TpmRcBase::Handle` for a sequence object.
pub fn read_public(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.handle(0)?;
    call.params.finish()?;
    let Some(Object::Key(key)) = engine.objects.by_handle(handle) else {
        return Err(TpmRcBase::Handle.at_handle(1));
    };
    call.out
        .tpm2b(&key.public.to_bytes()?)?
        .tpm2b(&key.name)?
        .tpm2b(&key.qualified_name)?;
    Ok(())
}

fn auth_hierarchy(auth: u32) -> Result<Hierarchy, TpmError> {
    match auth {
        TPM_RH_OWNER => Ok(Hierarchy::Owner),
        TPM_RH_PLATFORM => Ok(Hierarchy::Platform),
        _ => Err(TpmRcBase::Hierarchy.at_handle(1)),
    }
}

/// `TPM2_EvictControl`
///
/// A transient object is copied to `persistentHandle`; a persistent object
/// is removed.
///
/// # Errors
///
/// Returns `TpmRcBase::Range` for a persistent handle outside the range of the
/// authorizing hierarchy, `TpmRcBase::Hierarchy` for an object of another
/// hierarchy, `TpmRcBase::Attributes` for an ST_CLEAR object and
/// `TpmRcBase::NvDefined` when the persistent handle is taken.
pub fn evict_control(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let auth = call.handle(0)?;
    let object_handle = call.handle(1)?;
    let persistent = call.params.u32().at_parameter(1)?;
    call.params.finish()?;

    let owner = auth_hierarchy(auth)?;
    if HandleType::of(persistent) != Some(HandleType::Persistent) || persistent_owner(persistent) != owner {
        return Err(TpmRcBase::Range.at_parameter(1));
    }
    let now = engine.now();

    match HandleType::of(object_handle) {
        Some(HandleType::Transient) => {
            let Some(Object::Key(key)) = engine.objects.by_handle(object_handle) else {
                return Err(TpmRcBase::Handle.at_handle(2));
            };
            if key.public.attributes.contains(TpmaObject::ST_CLEAR) {
                return Err(TpmRcBase::Attributes.at_handle(2));
            }
            let hierarchy = Hierarchy::from_handle(key.hierarchy).unwrap_or(Hierarchy::Null);
            let allowed = match owner {
                Hierarchy::Platform => hierarchy == Hierarchy::Platform,
                _ => matches!(hierarchy, Hierarchy::Owner | Hierarchy::Endorsement),
            };
            if !allowed {
                return Err(TpmRcBase::Hierarchy.at_handle(2));
            }
            let mut key = key.clone();
            key.evict_handle = Some(persistent);
            engine.nv.add_evict_object(persistent, &key, now).at_parameter(1)?;
            debug!(target: "tpm2sim::object", "{object_handle:#010x} -> {persistent:#010x}");
        }
        Some(HandleType::Persistent) => {
            if object_handle != persistent {
                return Err(TpmRcBase::Handle.at_handle(2));
            }
            engine.nv.delete_evict(persistent, now).at_handle(2)?;
            call.removed.push(persistent);
        }
        _ => return Err(TpmRcBase::Handle.at_handle(2)),
    }
    Ok(())
}
