// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

mod common;

use common::{nv_public, nv_read_params, nv_write_params, read_tpm2b, tpm, Tpm, NV_INDEX};
use rstest::rstest;
use std::{path::Path, sync::atomic::Ordering};
use tpm2_protocol::data::TpmSu;
use tpm2sim::{
    client::password_area,
    config::{EngineConfig, NvRateConfig},
    crypto::SoftwareCrypto,
    handle::{TPM_RH_OWNER, TPM_RH_PLATFORM},
    nv::{NvPublic, TpmaNv},
    platform::{FileNv, SimulatedPlatform},
    util::Writer,
    Engine, Request, TpmCc, TpmError, TpmRcBase,
};

const UNLOCKED_INDEX: u32 = 0x0100_0002;

fn owner_and_auth() -> TpmaNv {
    TpmaNv::AUTHWRITE | TpmaNv::AUTHREAD | TpmaNv::OWNERWRITE | TpmaNv::OWNERREAD
}

#[rstest]
fn test_nv_write_read(mut tpm: Tpm) {
    tpm.define_nv(&nv_public(NV_INDEX, owner_and_auth(), 32), b"abc")
        .unwrap();
    assert_eq!(
        tpm.nv_read(NV_INDEX, b"abc", 32).unwrap_err(),
        TpmRcBase::NvUninitialized
    );
    tpm.nv_write(NV_INDEX, b"abc", &[0xAA; 32]).unwrap();
    assert_eq!(tpm.nv_read(NV_INDEX, b"abc", 32).unwrap(), vec![0xAA; 32]);
}

#[rstest]
fn test_nv_wrong_auth(mut tpm: Tpm) {
    tpm.define_nv(&nv_public(NV_INDEX, owner_and_auth(), 32), b"abc")
        .unwrap();
    let err = tpm.nv_write(NV_INDEX, b"abd", &[0xAA; 32]).unwrap_err();
    assert_eq!(err.code(), 0x98E);
    assert_eq!(tpm.engine.da().failed_tries, 1);
}

#[rstest]
fn test_nv_owner_authorization(mut tpm: Tpm) {
    tpm.define_nv(&nv_public(NV_INDEX, owner_and_auth(), 8), b"abc")
        .unwrap();
    tpm.with_password(
        TpmCc::NvWrite,
        &[TPM_RH_OWNER, NV_INDEX],
        nv_write_params(&[1; 8], 0),
        b"",
    )
    .unwrap();
    assert_eq!(
        tpm.with_password(
            TpmCc::NvWrite,
            &[TPM_RH_PLATFORM, NV_INDEX],
            nv_write_params(&[1; 8], 0),
            b"",
        )
        .unwrap_err(),
        TpmRcBase::NvAuthorization
    );
}

#[rstest]
#[case(TpmaNv::AUTHWRITE, TpmRcBase::Attributes)]
#[case(TpmaNv::AUTHREAD, TpmRcBase::Attributes)]
#[case(TpmaNv::AUTHWRITE | TpmaNv::AUTHREAD | TpmaNv::WRITTEN, TpmRcBase::Attributes)]
fn test_nv_define_rejects_attributes(mut tpm: Tpm, #[case] attributes: TpmaNv, #[case] rc: TpmRcBase) {
    let err = tpm
        .define_nv(&nv_public(NV_INDEX, attributes, 8), b"")
        .unwrap_err();
    assert_eq!(err, rc);
}

#[rstest]
fn test_nv_define_twice(mut tpm: Tpm) {
    let public = nv_public(NV_INDEX, owner_and_auth(), 8);
    tpm.define_nv(&public, b"").unwrap();
    assert_eq!(tpm.define_nv(&public, b"").unwrap_err(), TpmRcBase::NvDefined);
}

#[rstest]
fn test_nv_out_of_range(mut tpm: Tpm) {
    tpm.define_nv(&nv_public(NV_INDEX, owner_and_auth(), 8), b"")
        .unwrap();
    assert_eq!(
        tpm.nv_write(NV_INDEX, b"", &[0; 9]).unwrap_err(),
        TpmRcBase::NvRange
    );
}

#[rstest]
fn test_nv_write_define_lock(mut tpm: Tpm) {
    tpm.define_nv(
        &nv_public(NV_INDEX, owner_and_auth() | TpmaNv::WRITEDEFINE, 4),
        b"",
    )
    .unwrap();
    tpm.nv_write(NV_INDEX, b"", &[1; 4]).unwrap();
    tpm.with_password(TpmCc::NvWriteLock, &[NV_INDEX, NV_INDEX], Vec::new(), b"")
        .unwrap();
    assert_eq!(
        tpm.nv_write(NV_INDEX, b"", &[2; 4]).unwrap_err(),
        TpmRcBase::NvLocked
    );
    assert_eq!(tpm.nv_read(NV_INDEX, b"", 4).unwrap(), vec![1; 4]);
}

#[rstest]
fn test_nv_read_stclear_lock(mut tpm: Tpm) {
    tpm.define_nv(
        &nv_public(NV_INDEX, owner_and_auth() | TpmaNv::READ_STCLEAR, 4),
        b"",
    )
    .unwrap();
    tpm.nv_write(NV_INDEX, b"", &[1; 4]).unwrap();
    tpm.with_password(TpmCc::NvReadLock, &[NV_INDEX, NV_INDEX], Vec::new(), b"")
        .unwrap();
    assert_eq!(tpm.nv_read(NV_INDEX, b"", 4).unwrap_err(), TpmRcBase::NvLocked);

    tpm.reset();
    assert_eq!(tpm.nv_read(NV_INDEX, b"", 4).unwrap(), vec![1; 4]);
}

#[rstest]
fn test_nv_counter(mut tpm: Tpm) {
    let counter = TpmaNv::TPM_NT_COUNTER | owner_and_auth();
    tpm.define_nv(&nv_public(NV_INDEX, counter, 8), b"").unwrap();
    for _ in 0..2 {
        tpm.with_password(TpmCc::NvIncrement, &[NV_INDEX, NV_INDEX], Vec::new(), b"")
            .unwrap();
    }
    let value = tpm.nv_read(NV_INDEX, b"", 8).unwrap();
    assert_eq!(value, 2u64.to_be_bytes());
    assert_eq!(
        tpm.nv_write(NV_INDEX, b"", &[0; 8]).unwrap_err(),
        TpmRcBase::Attributes
    );
}

#[rstest]
fn test_nv_undefine(mut tpm: Tpm) {
    tpm.define_nv(&nv_public(NV_INDEX, owner_and_auth(), 8), b"")
        .unwrap();
    tpm.with_password(
        TpmCc::NvUndefineSpace,
        &[TPM_RH_OWNER, NV_INDEX],
        Vec::new(),
        b"",
    )
    .unwrap();
    assert!(!tpm.engine.nv().is_defined(NV_INDEX));
    assert_eq!(tpm.nv_read(NV_INDEX, b"", 8).unwrap_err(), TpmRcBase::Handle);
}

#[test]
fn test_nv_rate_limit() {
    let mut tpm = Tpm::new(EngineConfig {
        nv_rate: NvRateConfig {
            max_writes: 2,
            window_ms: 1000,
        },
        ..EngineConfig::default()
    });
    tpm.define_nv(&nv_public(NV_INDEX, owner_and_auth(), 4), b"")
        .unwrap();
    tpm.nv_write(NV_INDEX, b"", &[1; 4]).unwrap();
    assert_eq!(
        tpm.nv_write(NV_INDEX, b"", &[2; 4]).unwrap_err(),
        TpmRcBase::NvRate
    );
    assert_eq!(tpm.nv_read(NV_INDEX, b"", 4).unwrap(), vec![1; 4]);

    tpm.clock.advance(1000);
    tpm.nv_write(NV_INDEX, b"", &[2; 4]).unwrap();
    assert_eq!(tpm.nv_read(NV_INDEX, b"", 4).unwrap(), vec![2; 4]);
}

#[rstest]
fn test_nv_unavailable(mut tpm: Tpm) {
    tpm.define_nv(&nv_public(NV_INDEX, owner_and_auth(), 4), b"")
        .unwrap();
    tpm.nv_write(NV_INDEX, b"", &[1; 4]).unwrap();

    tpm.nv_available.store(false, Ordering::SeqCst);
    assert_eq!(
        tpm.nv_write(NV_INDEX, b"", &[2; 4]).unwrap_err(),
        TpmRcBase::NvUnavailable
    );
    assert_eq!(tpm.nv_read(NV_INDEX, b"", 4).unwrap(), vec![1; 4]);

    tpm.nv_available.store(true, Ordering::SeqCst);
    tpm.nv_write(NV_INDEX, b"", &[2; 4]).unwrap();
    assert_eq!(tpm.nv_read(NV_INDEX, b"", 4).unwrap(), vec![2; 4]);
}

#[rstest]
fn test_nv_read_public_name_tracks_written(mut tpm: Tpm) {
    tpm.define_nv(&nv_public(NV_INDEX, owner_and_auth(), 4), b"")
        .unwrap();
    let before = tpm.nv_name(NV_INDEX);
    assert_eq!(before.len(), 34);
    tpm.nv_write(NV_INDEX, b"", &[1; 4]).unwrap();
    assert_ne!(tpm.nv_name(NV_INDEX), before);

    let response = tpm
        .engine
        .execute(&tpm2sim::Request::new(TpmCc::NvReadPublic).handle(NV_INDEX))
        .unwrap();
    let public = tpm2sim::nv::NvPublic::from_bytes(&read_tpm2b(&response)).unwrap();
    assert!(public.attributes.contains(TpmaNv::WRITTEN));
}

fn global_write_lock(tpm: &mut Tpm) {
    tpm.with_password(TpmCc::NvGlobalWriteLock, &[TPM_RH_OWNER], Vec::new(), b"")
        .unwrap();
}

fn read_public(tpm: &mut Tpm, index: u32) -> NvPublic {
    let response = tpm
        .engine
        .execute(&Request::new(TpmCc::NvReadPublic).handle(index))
        .unwrap();
    NvPublic::from_bytes(&read_tpm2b(&response)).unwrap()
}

#[rstest]
fn test_nv_global_write_lock(mut tpm: Tpm) {
    tpm.define_nv(
        &nv_public(NV_INDEX, owner_and_auth() | TpmaNv::GLOBALLOCK, 4),
        b"",
    )
    .unwrap();
    tpm.define_nv(&nv_public(UNLOCKED_INDEX, owner_and_auth(), 4), b"")
        .unwrap();
    tpm.nv_write(NV_INDEX, b"", &[1; 4]).unwrap();
    let name = tpm.nv_name(NV_INDEX);

    global_write_lock(&mut tpm);
    assert_eq!(
        tpm.nv_write(NV_INDEX, b"", &[2; 4]).unwrap_err(),
        TpmRcBase::NvLocked
    );
    assert_eq!(tpm.nv_read(NV_INDEX, b"", 4).unwrap(), vec![1; 4]);
    tpm.nv_write(UNLOCKED_INDEX, b"", &[3; 4]).unwrap();
    assert!(read_public(&mut tpm, NV_INDEX)
        .attributes
        .contains(TpmaNv::WRITELOCKED));
    assert!(!read_public(&mut tpm, UNLOCKED_INDEX)
        .attributes
        .contains(TpmaNv::WRITELOCKED));
    assert_ne!(tpm.nv_name(NV_INDEX), name);

    // TPM Resume keeps the lock.
    tpm.shutdown_state().unwrap();
    tpm.engine.power_cycle().unwrap();
    tpm.startup(TpmSu::State).unwrap();
    assert_eq!(
        tpm.nv_write(NV_INDEX, b"", &[2; 4]).unwrap_err(),
        TpmRcBase::NvLocked
    );

    // TPM Restart clears it.
    tpm.shutdown_state().unwrap();
    tpm.engine.power_cycle().unwrap();
    tpm.startup(TpmSu::Clear).unwrap();
    tpm.nv_write(NV_INDEX, b"", &[2; 4]).unwrap();
    assert!(!read_public(&mut tpm, NV_INDEX)
        .attributes
        .contains(TpmaNv::WRITELOCKED));

    // So does TPM Reset.
    global_write_lock(&mut tpm);
    tpm.reset();
    tpm.nv_write(NV_INDEX, b"", &[4; 4]).unwrap();
    assert_eq!(tpm.nv_read(NV_INDEX, b"", 4).unwrap(), vec![4; 4]);
}

fn open_file_engine(path: &Path) -> Engine {
    let config = EngineConfig::default();
    let backing = FileNv::open(path, config.nv_memory_size).unwrap();
    Engine::new(
        config,
        Box::new(SimulatedPlatform::new(None, 0)),
        Box::new(SoftwareCrypto),
        Box::new(backing),
    )
    .unwrap()
}

fn startup(engine: &mut Engine, su: TpmSu) {
    let su = (su as u16).to_be_bytes().to_vec();
    engine
        .execute(&Request::new(TpmCc::Startup).parameters(su))
        .unwrap();
}

fn file_nv_write(engine: &mut Engine, data: &[u8]) -> Result<(), TpmError> {
    engine
        .execute(
            &Request::new(TpmCc::NvWrite)
                .handle(NV_INDEX)
                .handle(NV_INDEX)
                .parameters(nv_write_params(data, 0))
                .auth_area(password_area(b"").unwrap()),
        )
        .map(|_| ())
}

#[test]
fn test_nv_global_write_lock_survives_file_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tpm.nv");

    let mut engine = open_file_engine(&path);
    startup(&mut engine, TpmSu::Clear);
    let public = nv_public(NV_INDEX, owner_and_auth() | TpmaNv::GLOBALLOCK, 4);
    let mut w = Writer::new();
    w.tpm2b(b"").unwrap().tpm2b(&public.to_bytes().unwrap()).unwrap();
    engine
        .execute(
            &Request::new(TpmCc::NvDefineSpace)
                .handle(TPM_RH_OWNER)
                .parameters(w.into_vec())
                .auth_area(password_area(b"").unwrap()),
        )
        .unwrap();
    file_nv_write(&mut engine, &[1; 4]).unwrap();
    engine
        .execute(
            &Request::new(TpmCc::NvGlobalWriteLock)
                .handle(TPM_RH_OWNER)
                .auth_area(password_area(b"").unwrap()),
        )
        .unwrap();
    let su = (TpmSu::State as u16).to_be_bytes().to_vec();
    engine
        .execute(&Request::new(TpmCc::Shutdown).parameters(su))
        .unwrap();
    drop(engine);

    let mut engine = open_file_engine(&path);
    startup(&mut engine, TpmSu::State);
    assert_eq!(
        file_nv_write(&mut engine, &[2; 4]).unwrap_err(),
        TpmRcBase::NvLocked
    );
    let response = engine
        .execute(
            &Request::new(TpmCc::NvRead)
                .handle(NV_INDEX)
                .handle(NV_INDEX)
                .parameters(nv_read_params(4, 0))
                .auth_area(password_area(b"").unwrap()),
        )
        .unwrap();
    assert_eq!(read_tpm2b(&response), vec![1; 4]);
}
