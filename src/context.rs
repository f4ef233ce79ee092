// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Protection of saved object and session contexts.
//!
//! A context blob is `u16 svn || TPM2B integrity || AES-CFB(sequence ||
//! payload)`. The key and IV come from KDFa over the hierarchy proof, the
//! sequence number and the saved handle. The integrity HMAC binds the reset
//! counters, so a context does not survive the reset event that ends the
//! lifetime of its contents.
//!
//! `TPMS_CONTEXT` names only the base of an SVN-limited hierarchy. The SVN
//! itself travels in the blob and selects the proof that keys the HMAC.

use crate::{
    crypto::{CryptoEngine, KDF_LABEL_CONTEXT},
    error::{TpmErrorKindExt, TpmRcBase},
    handle::CONTEXT_ST_CLEAR,
    util::{Reader, Writer},
};
use log::warn;
use tpm2_protocol::data::{Tpm2b, TpmAlgId, TpmRh};
use zeroize::Zeroizing;

pub use tpm2_protocol::data::TpmsContext;

/// Hash of the context KDF and integrity HMAC.
pub const CONTEXT_HASH: TpmAlgId = TpmAlgId::Sha256;

/// AES-128 key followed by a 128-bit IV.
const CONTEXT_KEY_BITS: u32 = 256;
const CONTEXT_KEY_SIZE: usize = 16;

const SVN_MASK: u32 = 0xFFFF;

fn is_svn_base(rh: TpmRh) -> bool {
    matches!(
        rh,
        TpmRh::SvnOwnerBase | TpmRh::SvnEndorsementBase | TpmRh::SvnPlatformBase | TpmRh::SvnNullBase
    )
}

/// Splits a hierarchy handle into the `TPMS_CONTEXT` hierarchy and the SVN
/// stored in the blob.
///
/// # Errors
///
/// Returns `TpmRcBase::Hierarchy` for a handle that is not a hierarchy.
pub fn split_hierarchy(handle: u32) -> Result<(TpmRh, u16), TpmRcBase> {
    if let Ok(rh) = TpmRh::try_from(handle) {
        return Ok((rh, 0));
    }
    let rh = TpmRh::try_from(handle & !SVN_MASK).map_err(|()| TpmRcBase::Hierarchy)?;
    if !is_svn_base(rh) {
        return Err(TpmRcBase::Hierarchy);
    }
    let svn = u16::try_from(handle & SVN_MASK).map_err(|_| TpmRcBase::Hierarchy)?;
    Ok((rh, svn))
}

/// Recovers the hierarchy handle of a saved context.
///
/// # Errors
///
/// Returns `TpmRcBase::Integrity` for an SVN paired with a hierarchy that
/// takes none, and `TpmRcBase::Size` for a truncated blob.
pub fn context_hierarchy(context: &TpmsContext) -> Result<u32, TpmRcBase> {
    let svn = Reader::new(&context.context_blob).u16()?;
    if svn != 0 && !is_svn_base(context.hierarchy) {
        return Err(TpmRcBase::Integrity);
    }
    Ok(context.hierarchy as u32 | u32::from(svn))
}

/// Builds a `TPMS_CONTEXT` around a protected blob.
///
/// # Errors
///
/// Returns `TpmRcBase::Size` when the blob does not fit the context buffer.
pub fn seal(
    sequence: u64,
    saved_handle: u32,
    hierarchy: TpmRh,
    blob: &[u8],
) -> Result<TpmsContext, TpmRcBase> {
    let context_blob = Tpm2b::try_from(blob).map_err(TpmErrorKindExt::to_tpm_rc)?;
    Ok(TpmsContext {
        sequence,
        saved_handle: saved_handle.into(),
        hierarchy,
        context_blob,
    })
}

/// Reset counters bound into the integrity of every context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResetCounters {
    pub total_reset_count: u64,
    pub clear_count: u32,
}

fn protection_key(
    crypto: &dyn CryptoEngine,
    proof: &[u8],
    sequence: u64,
    saved_handle: u32,
) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
    crypto.kdfa(
        CONTEXT_HASH,
        proof,
        KDF_LABEL_CONTEXT,
        &sequence.to_be_bytes(),
        &saved_handle.to_be_bytes(),
        CONTEXT_KEY_BITS,
    )
}

fn integrity(
    crypto: &dyn CryptoEngine,
    proof: &[u8],
    counters: ResetCounters,
    sequence: u64,
    saved_handle: u32,
    svn: u16,
    encrypted: &[u8],
) -> Result<Vec<u8>, TpmRcBase> {
    let reset = counters.total_reset_count.to_be_bytes();
    let clear = counters.clear_count.to_be_bytes();
    let clear: &[u8] = if saved_handle == CONTEXT_ST_CLEAR {
        &clear
    } else {
        &[]
    };
    crypto.hmac(
        CONTEXT_HASH,
        proof,
        &[
            &reset,
            clear,
            &sequence.to_be_bytes(),
            &saved_handle.to_be_bytes(),
            &svn.to_be_bytes(),
            encrypted,
        ],
    )
}

/// Encrypts and MACs `payload` into a context blob.
///
/// # Errors
///
/// Propagates crypto engine errors.
pub fn protect(
    crypto: &dyn CryptoEngine,
    proof: &[u8],
    counters: ResetCounters,
    sequence: u64,
    saved_handle: u32,
    svn: u16,
    payload: &[u8],
) -> Result<Vec<u8>, TpmRcBase> {
    let key = protection_key(crypto, proof, sequence, saved_handle)?;
    let (aes_key, iv) = key.split_at(CONTEXT_KEY_SIZE);
    let mut encrypted = Zeroizing::new(Vec::with_capacity(8 + payload.len()));
    encrypted.extend_from_slice(&sequence.to_be_bytes());
    encrypted.extend_from_slice(payload);
    crypto.cfb_encrypt(aes_key, iv, &mut encrypted)?;
    let tag = integrity(crypto, proof, counters, sequence, saved_handle, svn, &encrypted)?;
    let mut w = Writer::new();
    w.u16(svn).tpm2b(&tag)?.bytes(&encrypted);
    Ok(w.into_vec())
}

/// Verifies and decrypts a context blob. Nothing is decrypted unless the
/// integrity check passes.
///
/// # Errors
///
/// Returns `TpmRcBase::Integrity` on any mismatch and `TpmRcBase::Size` for a blob
/// too short to hold its header.
pub fn unprotect(
    crypto: &dyn CryptoEngine,
    proof: &[u8],
    counters: ResetCounters,
    context: &TpmsContext,
) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
    let saved_handle = context.saved_handle.0;
    let mut r = Reader::new(&context.context_blob);
    let svn = r.u16()?;
    let tag = r.tpm2b()?;
    let encrypted = r.take(r.remaining())?;
    let expected = integrity(
        crypto,
        proof,
        counters,
        context.sequence,
        saved_handle,
        svn,
        encrypted,
    )?;
    if !crate::crypto::constant_time_eq(&expected, tag) {
        warn!(target: "tpm2sim::context", "{saved_handle:#010x}: integrity check failed");
        return Err(TpmRcBase::Integrity);
    }
    let key = protection_key(crypto, proof, context.sequence, saved_handle)?;
    let (aes_key, iv) = key.split_at(CONTEXT_KEY_SIZE);
    let mut plain = Zeroizing::new(encrypted.to_vec());
    crypto.cfb_decrypt(aes_key, iv, &mut plain)?;
    if plain.len() < 8 || plain[..8] != context.sequence.to_be_bytes() {
        return Err(TpmRcBase::Integrity);
    }
    Ok(Zeroizing::new(plain[8..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::SoftwareCrypto, handle::CONTEXT_OBJECT};

    const PROOF: [u8; 32] = [0x42; 32];

    fn saved(counters: ResetCounters, handle: u32) -> TpmsContext {
        let blob = protect(&SoftwareCrypto, &PROOF, counters, 7, handle, 0, b"payload").unwrap();
        seal(7, handle, TpmRh::Owner, &blob).unwrap()
    }

    #[test]
    fn test_protect_unprotect() {
        let counters = ResetCounters::default();
        let context = saved(counters, CONTEXT_OBJECT);
        let payload = unprotect(&SoftwareCrypto, &PROOF, counters, &context).unwrap();
        assert_eq!(payload.as_slice(), b"payload");
        assert!(!context.context_blob.windows(7).any(|w| w == b"payload"));
        assert_eq!(context_hierarchy(&context), Ok(TpmRh::Owner as u32));
    }

    #[test]
    fn test_reset_count_bound() {
        let context = saved(ResetCounters::default(), CONTEXT_OBJECT);
        let after_reset = ResetCounters {
            total_reset_count: 1,
            clear_count: 0,
        };
        assert_eq!(
            unprotect(&SoftwareCrypto, &PROOF, after_reset, &context).map(|_| ()),
            Err(TpmRcBase::Integrity)
        );
    }

    #[test]
    fn test_clear_count_bound_only_for_st_clear() {
        let restart = ResetCounters {
            total_reset_count: 0,
            clear_count: 1,
        };
        let plain = saved(ResetCounters::default(), CONTEXT_OBJECT);
        assert!(unprotect(&SoftwareCrypto, &PROOF, restart, &plain).is_ok());
        let st_clear = saved(ResetCounters::default(), CONTEXT_ST_CLEAR);
        assert_eq!(
            unprotect(&SoftwareCrypto, &PROOF, restart, &st_clear).map(|_| ()),
            Err(TpmRcBase::Integrity)
        );
    }

    #[test]
    fn test_sequence_is_authenticated() {
        let counters = ResetCounters::default();
        let mut context = saved(counters, CONTEXT_OBJECT);
        context.sequence += 1;
        assert_eq!(
            unprotect(&SoftwareCrypto, &PROOF, counters, &context).map(|_| ()),
            Err(TpmRcBase::Integrity)
        );
    }

    #[test]
    fn test_svn_hierarchy() {
        assert_eq!(split_hierarchy(0x4001_0003), Ok((TpmRh::SvnOwnerBase, 3)));
        assert_eq!(split_hierarchy(0x4000_0001), Ok((TpmRh::Owner, 0)));
        assert_eq!(split_hierarchy(0x4000_0002 | 0x5), Err(TpmRcBase::Hierarchy));

        let counters = ResetCounters::default();
        let blob = protect(&SoftwareCrypto, &PROOF, counters, 1, CONTEXT_OBJECT, 3, b"x").unwrap();
        let context = seal(1, CONTEXT_OBJECT, TpmRh::SvnOwnerBase, &blob).unwrap();
        assert_eq!(context_hierarchy(&context), Ok(0x4001_0003));
        let forged = seal(1, CONTEXT_OBJECT, TpmRh::Owner, &blob).unwrap();
        assert_eq!(context_hierarchy(&forged), Err(TpmRcBase::Integrity));
    }

    #[test]
    fn test_oversized_blob_is_rejected() {
        let blob = vec![0u8; 4097];
        assert_eq!(
            seal(1, CONTEXT_OBJECT, TpmRh::Owner, &blob).map(|_| ()),
            Err(TpmRcBase::Size)
        );
    }
}
