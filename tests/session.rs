// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

mod common;

use common::{
    ecc_decrypt_template, nv_public, nv_read_params, nv_write_params, tpm, tpm2b, Tpm, NV_INDEX,
};
use rstest::rstest;
use tpm2_protocol::data::TpmAlgId;
use tpm2sim::{
    authorize::{auth_command, encode_auth_area, TpmaSession},
    client::{self, single_tpm2b, Auth, AuthSession, ClientCommand, Entity, SessionRequest},
    error::ClientError,
    handle::{TPM_RH_ENDORSEMENT, TPM_RH_OWNER},
    nv::TpmaNv,
    session::{SessionKind, SessionSymmetric},
    util::AttributeSet,
    TpmCc, TpmRcBase,
};

const AUTH: &[u8] = b"abc";

fn define(tpm: &mut Tpm) -> Entity {
    let attributes = TpmaNv::AUTHWRITE | TpmaNv::AUTHREAD;
    tpm.define_nv(&nv_public(NV_INDEX, attributes, 32), AUTH)
        .unwrap();
    Entity::new(&tpm.nv_name(NV_INDEX), AUTH)
}

fn nv_write(
    tpm: &mut Tpm,
    session: &mut AuthSession,
    entity: &Entity,
    data: &[u8],
) -> Result<(), ClientError> {
    let command = ClientCommand::new(TpmCc::NvWrite)
        .named(NV_INDEX, &entity.name)
        .named(NV_INDEX, &entity.name)
        .parameters(nv_write_params(data, 0));
    let mut auths = [Auth::Session {
        session,
        entity: Some(entity),
    }];
    client::execute(&mut tpm.engine, &command, &mut auths).map(|_| ())
}

fn nv_read(
    tpm: &mut Tpm,
    session: &mut AuthSession,
    entity: &Entity,
    size: u16,
) -> Result<Vec<u8>, ClientError> {
    let command = ClientCommand::new(TpmCc::NvRead)
        .named(NV_INDEX, &entity.name)
        .named(NV_INDEX, &entity.name)
        .parameters(nv_read_params(size, 0));
    let mut auths = [Auth::Session {
        session,
        entity: Some(entity),
    }];
    let response = client::execute(&mut tpm.engine, &command, &mut auths)?;
    single_tpm2b(&response)
}

fn written(tpm: &mut Tpm) -> Entity {
    Entity::new(&tpm.nv_name(NV_INDEX), AUTH)
}

fn rc(err: ClientError) -> TpmRcBase {
    match err {
        ClientError::Tpm(err) => err.rc,
        other => panic!("unexpected error: {other}"),
    }
}

#[rstest]
fn test_hmac_session(mut tpm: Tpm) {
    let entity = define(&mut tpm);
    let mut session = SessionRequest::new(SessionKind::Hmac, TpmAlgId::Sha256)
        .start(&mut tpm.engine)
        .unwrap();
    nv_write(&mut tpm, &mut session, &entity, &[0xAA; 32]).unwrap();
    let entity = written(&mut tpm);
    assert_eq!(nv_read(&mut tpm, &mut session, &entity, 32).unwrap(), vec![0xAA; 32]);
    assert!(tpm.engine.sessions().is_loaded(session.handle));
}

#[rstest]
#[case(TpmAlgId::Sha1)]
#[case(TpmAlgId::Sha256)]
#[case(TpmAlgId::Sha384)]
fn test_hmac_session_hash(mut tpm: Tpm, #[case] alg: TpmAlgId) {
    let entity = define(&mut tpm);
    let mut session = SessionRequest::new(SessionKind::Hmac, alg)
        .start(&mut tpm.engine)
        .unwrap();
    nv_write(&mut tpm, &mut session, &entity, &[1; 32]).unwrap();
}

#[rstest]
fn test_hmac_session_wrong_auth(mut tpm: Tpm) {
    let entity = define(&mut tpm);
    let mut session = SessionRequest::new(SessionKind::Hmac, TpmAlgId::Sha256)
        .start(&mut tpm.engine)
        .unwrap();
    let wrong = Entity::new(&entity.name, b"abd");
    let ClientError::Tpm(err) = nv_write(&mut tpm, &mut session, &wrong, &[1; 32]).unwrap_err()
    else {
        panic!("expected a response code");
    };
    assert_eq!(err.code(), 0x98E);
    assert_eq!(tpm.engine.da().failed_tries, 1);

    // The session survives a failed authorization.
    nv_write(&mut tpm, &mut session, &entity, &[1; 32]).unwrap();
}

#[rstest]
fn test_session_without_continue_is_flushed(mut tpm: Tpm) {
    let entity = define(&mut tpm);
    let mut session = SessionRequest::new(SessionKind::Hmac, TpmAlgId::Sha256)
        .start(&mut tpm.engine)
        .unwrap();
    session.attributes.remove(TpmaSession::CONTINUE_SESSION);
    nv_write(&mut tpm, &mut session, &entity, &[1; 32]).unwrap();
    assert!(!tpm.engine.sessions().is_loaded(session.handle));
}

#[rstest]
fn test_bound_session(mut tpm: Tpm) {
    let entity = define(&mut tpm);
    let mut session = SessionRequest::new(SessionKind::Hmac, TpmAlgId::Sha256)
        .bind(NV_INDEX, &entity)
        .start(&mut tpm.engine)
        .unwrap();
    nv_write(&mut tpm, &mut session, &entity, &[2; 32]).unwrap();

    // Writing changes the Name, so the session no longer matches its bind
    // entity and the authorization value is mixed into the HMAC key.
    let entity = written(&mut tpm);
    assert_eq!(nv_read(&mut tpm, &mut session, &entity, 32).unwrap(), vec![2; 32]);
}

#[rstest]
fn test_salted_session(mut tpm: Tpm) {
    let entity = define(&mut tpm);
    let (key, public) = tpm
        .create_primary(TPM_RH_OWNER, &ecc_decrypt_template(), b"")
        .unwrap();
    let mut session = SessionRequest::new(SessionKind::Hmac, TpmAlgId::Sha256)
        .salted(key, &public)
        .bind(NV_INDEX, &entity)
        .start(&mut tpm.engine)
        .unwrap();
    nv_write(&mut tpm, &mut session, &entity, &[3; 32]).unwrap();
    let entity = written(&mut tpm);
    assert_eq!(nv_read(&mut tpm, &mut session, &entity, 32).unwrap(), vec![3; 32]);
}

#[rstest]
#[case(SessionSymmetric::Xor(TpmAlgId::Sha256))]
#[case(SessionSymmetric::AesCfb(128))]
fn test_parameter_encryption(mut tpm: Tpm, #[case] symmetric: SessionSymmetric) {
    let entity = define(&mut tpm);
    let (key, public) = tpm
        .create_primary(TPM_RH_OWNER, &ecc_decrypt_template(), b"")
        .unwrap();
    let mut session = SessionRequest::new(SessionKind::Hmac, TpmAlgId::Sha256)
        .salted(key, &public)
        .symmetric(symmetric)
        .start(&mut tpm.engine)
        .unwrap();
    let data: Vec<u8> = (0u8..32).collect();
    session.attributes |= TpmaSession::DECRYPT;
    nv_write(&mut tpm, &mut session, &entity, &data).unwrap();

    session.attributes.remove(TpmaSession::DECRYPT);
    session.attributes |= TpmaSession::ENCRYPT;
    let entity = written(&mut tpm);
    assert_eq!(nv_read(&mut tpm, &mut session, &entity, 32).unwrap(), data);
    assert_eq!(tpm.nv_read(NV_INDEX, AUTH, 32).unwrap(), data);
}

#[rstest]
fn test_encrypt_needs_symmetric(mut tpm: Tpm) {
    let entity = define(&mut tpm);
    let mut session = SessionRequest::new(SessionKind::Hmac, TpmAlgId::Sha256)
        .start(&mut tpm.engine)
        .unwrap();
    session.attributes |= TpmaSession::DECRYPT;
    // The client cannot encrypt either, so check the engine directly.
    let request = tpm2sim::Request::new(TpmCc::NvWrite)
        .handle(NV_INDEX)
        .handle(NV_INDEX)
        .parameters(nv_write_params(&[1; 32], 0))
        .auth_area(
            encode_auth_area(&[auth_command(
                session.handle,
                &session.nonce_caller,
                session.attributes,
                &[],
            )
            .unwrap()])
            .unwrap(),
        );
    assert_eq!(tpm.engine.execute(&request).unwrap_err(), TpmRcBase::Symmetric);
    assert!(nv_write(&mut tpm, &mut session, &entity, &[1; 32]).is_err());
}

#[rstest]
fn test_change_auth_response_uses_new_auth(mut tpm: Tpm) {
    let owner = Entity::permanent(TPM_RH_OWNER, b"");
    let mut session = SessionRequest::new(SessionKind::Hmac, TpmAlgId::Sha256)
        .start(&mut tpm.engine)
        .unwrap();
    let command = ClientCommand::new(TpmCc::HierarchyChangeAuth)
        .handle(TPM_RH_OWNER)
        .parameters(tpm2b(b"owner"))
        .auth_after(b"owner");
    let mut auths = [Auth::Session {
        session: &mut session,
        entity: Some(&owner),
    }];
    client::execute(&mut tpm.engine, &command, &mut auths).unwrap();
    assert_eq!(tpm.engine.hierarchy().owner_auth.as_slice(), b"owner");
}

#[rstest]
fn test_session_for_other_entity(mut tpm: Tpm) {
    let endorsement = Entity::permanent(TPM_RH_ENDORSEMENT, b"");
    let mut session = SessionRequest::new(SessionKind::Hmac, TpmAlgId::Sha256)
        .start(&mut tpm.engine)
        .unwrap();
    let command = ClientCommand::new(TpmCc::HierarchyChangeAuth)
        .handle(TPM_RH_ENDORSEMENT)
        .parameters(tpm2b(b"endorsement"))
        .auth_after(b"endorsement");

    // A wrong TPM nonce fails the HMAC without a DA event for the exempt
    // hierarchy.
    let mut stale = session.clone();
    stale.nonce_tpm = vec![0; stale.nonce_tpm.len()];
    let mut auths = [Auth::Session {
        session: &mut stale,
        entity: Some(&endorsement),
    }];
    let err = client::execute(&mut tpm.engine, &command, &mut auths).unwrap_err();
    assert_eq!(rc(err), TpmRcBase::BadAuth);
    assert_eq!(tpm.engine.da().failed_tries, 0);

    let mut auths = [Auth::Session {
        session: &mut session,
        entity: Some(&endorsement),
    }];
    client::execute(&mut tpm.engine, &command, &mut auths).unwrap();
}

#[rstest]
fn test_session_limits(mut tpm: Tpm) {
    let mut handles = Vec::new();
    for _ in 0..tpm.engine.config().max_loaded_sessions {
        let session = SessionRequest::new(SessionKind::Hmac, TpmAlgId::Sha256)
            .start(&mut tpm.engine)
            .unwrap();
        handles.push(session.handle);
    }
    let err = SessionRequest::new(SessionKind::Hmac, TpmAlgId::Sha256)
        .start(&mut tpm.engine)
        .unwrap_err();
    assert_eq!(rc(err), TpmRcBase::SessionMemory);

    tpm.flush(handles[0]).unwrap();
    SessionRequest::new(SessionKind::Hmac, TpmAlgId::Sha256)
        .start(&mut tpm.engine)
        .unwrap();
}
