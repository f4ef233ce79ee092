// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

mod common;

use common::{keyed_hash_template, read_tpm2b, tpm, tpm2b, Tpm};
use rstest::rstest;
use tpm2_protocol::data::{TpmAlgId, TpmSu};
use tpm2sim::{
    client::SessionRequest,
    config::EngineConfig,
    crypto::{CryptoEngine, SoftwareCrypto},
    handle::{TPM_RH_NULL, TPM_RH_OWNER},
    session::SessionKind,
    util::Writer,
    Request, TpmCc, TpmRcBase,
};

/// Offset of the integrity tag inside a serialized context: sequence,
/// saved handle, hierarchy, blob size, SVN and tag size.
const TAG_OFFSET: usize = 8 + 4 + 4 + 2 + 2 + 2;

fn start_hmac(tpm: &mut Tpm) -> u32 {
    SessionRequest::new(SessionKind::Hmac, TpmAlgId::Sha256)
        .start(&mut tpm.engine)
        .unwrap()
        .handle
}

#[rstest]
fn test_object_context_round_trip(mut tpm: Tpm) {
    let (handle, public) = tpm
        .create_primary(TPM_RH_OWNER, &keyed_hash_template(), b"key")
        .unwrap();
    let context = tpm.context_save(handle).unwrap();
    assert!(tpm.engine.objects().is_present(handle));

    tpm.flush(handle).unwrap();
    let loaded = tpm.context_load(&context).unwrap();
    let response = tpm.read_public(loaded).unwrap();
    let mut r = response.reader();
    assert_eq!(r.tpm2b().unwrap(), public.to_bytes().unwrap().as_slice());
}

#[rstest]
fn test_session_context_round_trip(mut tpm: Tpm) {
    let handle = start_hmac(&mut tpm);
    let context = tpm.context_save(handle).unwrap();
    assert!(tpm.engine.sessions().is_saved(handle));
    assert!(!tpm.engine.sessions().is_loaded(handle));

    assert_eq!(tpm.context_load(&context).unwrap(), handle);
    assert!(tpm.engine.sessions().is_loaded(handle));

    // A session context is single-use.
    assert_eq!(tpm.context_load(&context).unwrap_err(), TpmRcBase::Value);
}

#[rstest]
fn test_object_context_rejects_any_bit_flip(mut tpm: Tpm) {
    let (handle, _) = tpm
        .create_primary(TPM_RH_OWNER, &keyed_hash_template(), b"")
        .unwrap();
    let context = tpm.context_save(handle).unwrap();
    tpm.flush(handle).unwrap();

    for bit in TAG_OFFSET * 8..context.len() * 8 {
        let mut forged = context.clone();
        forged[bit / 8] ^= 1 << (bit % 8);
        let err = tpm.context_load(&forged).unwrap_err();
        assert_eq!(err, TpmRcBase::Integrity, "bit {bit}");
    }
    assert!(!tpm.engine.objects().is_present(handle));
    tpm.context_load(&context).unwrap();
}

#[rstest]
fn test_session_context_rejects_any_bit_flip(mut tpm: Tpm) {
    let handle = start_hmac(&mut tpm);
    let context = tpm.context_save(handle).unwrap();

    for bit in TAG_OFFSET * 8..context.len() * 8 {
        let mut forged = context.clone();
        forged[bit / 8] ^= 1 << (bit % 8);
        let err = tpm.context_load(&forged).unwrap_err();
        assert_eq!(err, TpmRcBase::Integrity, "bit {bit}");
        assert!(tpm.engine.sessions().is_saved(handle));
    }
    assert_eq!(tpm.context_load(&context).unwrap(), handle);
}

#[rstest]
fn test_object_context_does_not_survive_reset(mut tpm: Tpm) {
    let (handle, _) = tpm
        .create_primary(TPM_RH_OWNER, &keyed_hash_template(), b"")
        .unwrap();
    let context = tpm.context_save(handle).unwrap();
    tpm.reset();
    assert_eq!(tpm.context_load(&context).unwrap_err(), TpmRcBase::Integrity);
}

#[rstest]
fn test_object_context_survives_restart(mut tpm: Tpm) {
    let (handle, _) = tpm
        .create_primary(TPM_RH_OWNER, &keyed_hash_template(), b"")
        .unwrap();
    let context = tpm.context_save(handle).unwrap();
    tpm.shutdown_state().unwrap();
    tpm.engine.power_cycle().unwrap();
    tpm.startup(TpmSu::Clear).unwrap();
    assert_eq!(tpm.engine.counters().clear_count, 1);
    tpm.context_load(&context).unwrap();
}

#[rstest]
fn test_session_context_does_not_survive_reset(mut tpm: Tpm) {
    let handle = start_hmac(&mut tpm);
    let context = tpm.context_save(handle).unwrap();
    tpm.reset();
    assert!(tpm.context_load(&context).is_err());
}

#[test]
fn test_context_gap_bound() {
    let mut tpm = Tpm::new(EngineConfig {
        context_gap_limit: 4,
        ..EngineConfig::default()
    });
    let a = start_hmac(&mut tpm);
    let b = start_hmac(&mut tpm);

    let context_a = tpm.context_save(a).unwrap();
    let mut context_b = tpm.context_save(b).unwrap();
    for _ in 0..2 {
        tpm.context_load(&context_b).unwrap();
        context_b = tpm.context_save(b).unwrap();
    }

    // Only the oldest context may move while the gap is exhausted.
    assert_eq!(tpm.context_load(&context_b).unwrap_err(), TpmRcBase::ContextGap);
    let c = start_hmac(&mut tpm);
    assert_eq!(tpm.context_save(c).unwrap_err(), TpmRcBase::ContextGap);
    tpm.flush(c).unwrap();

    assert_eq!(tpm.context_load(&context_a).unwrap(), a);
    assert_eq!(tpm.context_load(&context_b).unwrap(), b);
}

#[rstest]
fn test_flush_saved_session(mut tpm: Tpm) {
    let handle = start_hmac(&mut tpm);
    let context = tpm.context_save(handle).unwrap();
    tpm.flush(handle).unwrap();
    assert!(!tpm.engine.sessions().is_saved(handle));
    assert!(tpm.context_load(&context).is_err());
    assert_eq!(tpm.flush(handle).unwrap_err(), TpmRcBase::Handle);
}

#[rstest]
fn test_oversized_sequence_context_is_rejected(mut tpm: Tpm) {
    let mut w = Writer::new();
    w.tpm2b(b"seq").unwrap().u16(TpmAlgId::Sha256 as u16);
    let handle = tpm
        .engine
        .execute(&Request::new(TpmCc::HashSequenceStart).parameters(w.into_vec()))
        .unwrap()
        .handles[0];
    let chunk = vec![0x61; 40000];
    for _ in 0..2 {
        tpm.with_password(TpmCc::SequenceUpdate, &[handle], tpm2b(&chunk), b"seq")
            .unwrap();
    }

    assert_eq!(tpm.context_save(handle).unwrap_err(), TpmRcBase::Size);
    assert!(tpm.engine.objects().is_present(handle));

    let mut w = Writer::new();
    w.tpm2b(b"").unwrap().u32(TPM_RH_NULL);
    let response = tpm
        .with_password(TpmCc::SequenceComplete, &[handle], w.into_vec(), b"seq")
        .unwrap();
    let expected = SoftwareCrypto
        .digest(TpmAlgId::Sha256, &[chunk.as_slice(), chunk.as_slice()])
        .unwrap();
    assert_eq!(read_tpm2b(&response), expected);
}
