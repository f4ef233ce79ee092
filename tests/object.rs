// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

mod common;

use common::{keyed_hash_template, nv_public, read_tpm2b, tpm, tpm2b, Tpm};
use rstest::rstest;
use tpm2_protocol::data::TpmAlgId;
use tpm2sim::{
    client::{self, password_area, Auth, ClientCommand, Entity, SessionRequest},
    crypto::{CryptoEngine, SoftwareCrypto},
    handle::{TPM_RH_NULL, TPM_RH_OWNER, TPM_RH_PLATFORM},
    nv::TpmaNv,
    policy::PolicyDigest,
    session::SessionKind,
    util::Writer,
    TpmCc, Request, TpmError, TpmRcBase,
};

const PERSISTENT: u32 = 0x8100_0001;

fn evict(tpm: &mut Tpm, auth: u32, object: u32, persistent: u32) -> Result<(), TpmError> {
    tpm.with_password(
        TpmCc::EvictControl,
        &[auth, object],
        persistent.to_be_bytes().to_vec(),
        b"",
    )
    .map(|_| ())
}

fn hash_sequence(tpm: &mut Tpm, auth: &[u8]) -> u32 {
    let mut w = Writer::new();
    w.tpm2b(auth).unwrap().u16(TpmAlgId::Sha256 as u16);
    let response = tpm
        .engine
        .execute(&Request::new(TpmCc::HashSequenceStart).parameters(w.into_vec()))
        .unwrap();
    response.handles[0]
}

fn complete(tpm: &mut Tpm, handle: u32, auth: &[u8], data: &[u8]) -> Result<Vec<u8>, TpmError> {
    let mut w = Writer::new();
    w.tpm2b(data).unwrap().u32(TPM_RH_NULL);
    let response = tpm.with_password(TpmCc::SequenceComplete, &[handle], w.into_vec(), auth)?;
    Ok(read_tpm2b(&response))
}

#[rstest]
fn test_evict_control(mut tpm: Tpm) {
    let (key, public) = tpm
        .create_primary(TPM_RH_OWNER, &keyed_hash_template(), b"")
        .unwrap();
    evict(&mut tpm, TPM_RH_OWNER, key, PERSISTENT).unwrap();
    assert_eq!(
        evict(&mut tpm, TPM_RH_OWNER, key, PERSISTENT).unwrap_err(),
        TpmRcBase::NvDefined
    );
    tpm.flush(key).unwrap();

    // Materialized for the command only.
    let response = tpm.read_public(PERSISTENT).unwrap();
    assert_eq!(read_tpm2b(&response), public.to_bytes().unwrap());
    assert!(!tpm.engine.objects().is_present(PERSISTENT));

    tpm.reset();
    tpm.read_public(PERSISTENT).unwrap();

    evict(&mut tpm, TPM_RH_OWNER, PERSISTENT, PERSISTENT).unwrap();
    assert_eq!(tpm.read_public(PERSISTENT).unwrap_err(), TpmRcBase::Handle);
}

#[rstest]
#[case(TPM_RH_OWNER, 0x8180_0001, TpmRcBase::Range)]
#[case(TPM_RH_PLATFORM, 0x8180_0001, TpmRcBase::Hierarchy)]
#[case(TPM_RH_OWNER, 0x0100_0001, TpmRcBase::Range)]
fn test_evict_control_rejects(
    mut tpm: Tpm,
    #[case] auth: u32,
    #[case] persistent: u32,
    #[case] rc: TpmRcBase,
) {
    let (key, _) = tpm
        .create_primary(TPM_RH_OWNER, &keyed_hash_template(), b"")
        .unwrap();
    assert_eq!(evict(&mut tpm, auth, key, persistent).unwrap_err(), rc);
}

#[rstest]
fn test_hash_sequence(mut tpm: Tpm) {
    let handle = hash_sequence(&mut tpm, b"seq");
    tpm.with_password(TpmCc::SequenceUpdate, &[handle], tpm2b(b"hello "), b"seq")
        .unwrap();
    let digest = complete(&mut tpm, handle, b"seq", b"world").unwrap();
    let expected = SoftwareCrypto
        .digest(TpmAlgId::Sha256, &[b"hello world"])
        .unwrap();
    assert_eq!(digest, expected);
    assert!(!tpm.engine.objects().is_present(handle));
}

#[rstest]
fn test_sequence_wrong_auth_is_not_counted(mut tpm: Tpm) {
    let handle = hash_sequence(&mut tpm, b"seq");
    assert_eq!(
        complete(&mut tpm, handle, b"bad", b"").unwrap_err(),
        TpmRcBase::BadAuth
    );
    assert_eq!(tpm.engine.da().failed_tries, 0);
    complete(&mut tpm, handle, b"seq", b"").unwrap();
}

#[rstest]
fn test_hmac_sequence(mut tpm: Tpm) {
    let (key, _) = tpm
        .create_primary(TPM_RH_OWNER, &keyed_hash_template(), b"")
        .unwrap();
    let mut results = Vec::new();
    for _ in 0..2 {
        let mut w = Writer::new();
        w.tpm2b(b"").unwrap().u16(TpmAlgId::Sha256 as u16);
        let response = tpm
            .with_password(TpmCc::HmacStart, &[key], w.into_vec(), b"")
            .unwrap();
        let handle = response.handles[0];
        results.push(complete(&mut tpm, handle, b"", b"message").unwrap());
    }
    assert_eq!(results[0].len(), 32);
    assert_eq!(results[0], results[1]);
}

#[rstest]
fn test_undefine_space_special(mut tpm: Tpm) {
    let index = 0x0150_0001;
    let policy = PolicyDigest::new(&SoftwareCrypto, TpmAlgId::Sha256)
        .unwrap()
        .command_code(TpmCc::NvUndefineSpaceSpecial)
        .unwrap()
        .into_digest();
    let mut public = nv_public(
        index,
        TpmaNv::PPWRITE | TpmaNv::PPREAD | TpmaNv::PLATFORMCREATE | TpmaNv::POLICY_DELETE,
        8,
    );
    public.auth_policy = policy;
    let mut w = Writer::new();
    w.tpm2b(b"").unwrap().tpm2b(&public.to_bytes().unwrap()).unwrap();
    tpm.engine
        .execute(
            &Request::new(TpmCc::NvDefineSpace)
                .handle(TPM_RH_PLATFORM)
                .parameters(w.into_vec())
                .auth_area(password_area(b"").unwrap()),
        )
        .unwrap();

    // A policy-deletable index cannot be removed the ordinary way.
    assert_eq!(
        tpm.with_password(
            TpmCc::NvUndefineSpace,
            &[TPM_RH_PLATFORM, index],
            Vec::new(),
            b"",
        )
        .unwrap_err(),
        TpmRcBase::Attributes
    );

    let entity = Entity::new(&tpm.nv_name(index), b"");
    let mut session = SessionRequest::new(SessionKind::Policy, TpmAlgId::Sha256)
        .start(&mut tpm.engine)
        .unwrap();
    tpm.engine
        .execute(
            &Request::new(TpmCc::PolicyCommandCode)
                .handle(session.handle)
                .parameters(
                    (TpmCc::NvUndefineSpaceSpecial as u32).to_be_bytes().to_vec(),
                ),
        )
        .unwrap();
    let command = ClientCommand::new(TpmCc::NvUndefineSpaceSpecial)
        .named(index, &entity.name)
        .handle(TPM_RH_PLATFORM);
    let mut auths = [
        Auth::Session {
            session: &mut session,
            entity: Some(&entity),
        },
        Auth::Password(b""),
    ];
    client::execute(&mut tpm.engine, &command, &mut auths).unwrap();
    assert!(!tpm.engine.nv().is_defined(index));
}
