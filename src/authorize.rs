// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Session processing: authorization area parsing, password, HMAC and
//! policy authorization, parameter encryption and the response
//! authorization area.

use crate::{
    command::{AuthRole, CommandAttributes, TpmCc},
    crypto::{constant_time_eq, digest_size, CryptoEngine, KDF_LABEL_CFB, KDF_LABEL_XOR},
    engine::Engine,
    error::{TpmError, TpmErrorKindExt, TpmRcBase, TpmRcExt},
    handle::{is_session, HandleType, TPM_RH_LOCKOUT, TPM_RS_PW},
    nv::NvAccess,
    session::{bound_entity, Session, SessionFlags, SessionKind, SessionSymmetric},
    util::{AttributeSet, Reader, Writer},
};
use log::{debug, warn};
use tpm2_protocol::{
    data::{TpmAlgId, Tpm2bAuth, Tpm2bNonce},
    TpmBuffer,
};
use zeroize::Zeroizing;

pub use tpm2_protocol::data::{TpmaSession, TpmsAuthCommand, TpmsAuthResponse};

/// Largest number of sessions in one command.
pub const MAX_SESSIONS: usize = 3;

/// Smallest accepted caller nonce.
pub const MIN_NONCE_SIZE: usize = 16;

fn buffer<const N: usize>(bytes: &[u8]) -> Result<TpmBuffer<N>, TpmRcBase> {
    TpmBuffer::try_from(bytes).map_err(TpmErrorKindExt::to_tpm_rc)
}

/// A password authorization.
///
/// # Errors
///
/// Returns `TpmRcBase::Size` for a password longer than `TPM2B_AUTH`.
pub fn password_auth(auth: &[u8]) -> Result<TpmsAuthCommand, TpmRcBase> {
    Ok(TpmsAuthCommand {
        session_handle: TPM_RS_PW.into(),
        nonce: Tpm2bNonce::default(),
        session_attributes: TpmaSession::CONTINUE_SESSION,
        hmac: buffer(auth)?,
    })
}

/// Builds a `TPMS_AUTH_COMMAND` from raw fields.
///
/// # Errors
///
/// Returns `TpmRcBase::Size` for a nonce or HMAC too large for its buffer.
pub fn auth_command(
    handle: u32,
    nonce: &[u8],
    attributes: TpmaSession,
    hmac: &[u8],
) -> Result<TpmsAuthCommand, TpmRcBase> {
    Ok(TpmsAuthCommand {
        session_handle: handle.into(),
        nonce: buffer(nonce)?,
        session_attributes: attributes,
        hmac: buffer(hmac)?,
    })
}

/// Parses a command authorization area.
///
/// # Errors
///
/// Returns `TpmRcBase::AuthSize` for a malformed area or more than
/// [`MAX_SESSIONS`] entries.
pub fn parse_auth_area(bytes: &[u8]) -> Result<Vec<TpmsAuthCommand>, TpmRcBase> {
    let mut r = Reader::new(bytes);
    let mut sessions = Vec::new();
    while r.remaining() > 0 {
        if sessions.len() == MAX_SESSIONS {
            return Err(TpmRcBase::AuthSize);
        }
        sessions.push(r.get().map_err(|_| TpmRcBase::AuthSize)?);
    }
    Ok(sessions)
}

/// # Errors
///
/// Returns the response code of a build failure.
pub fn encode_auth_area(sessions: &[TpmsAuthCommand]) -> Result<Vec<u8>, TpmRcBase> {
    let mut w = Writer::new();
    for session in sessions {
        w.put(session)?;
    }
    Ok(w.into_vec())
}

/// Parses a response authorization area.
///
/// # Errors
///
/// Returns `TpmRcBase::Size` for a malformed area.
pub fn parse_response_area(bytes: &[u8]) -> Result<Vec<TpmsAuthResponse>, TpmRcBase> {
    let mut r = Reader::new(bytes);
    let mut sessions = Vec::new();
    while r.remaining() > 0 {
        sessions.push(r.get()?);
    }
    Ok(sessions)
}

/// # Errors
///
/// Returns the response code of a build failure.
pub fn encode_response_area(sessions: &[TpmsAuthResponse]) -> Result<Vec<u8>, TpmRcBase> {
    let mut w = Writer::new();
    for session in sessions {
        w.put(session)?;
    }
    Ok(w.into_vec())
}

/// Reporting precedence of authorization failures. When several sessions
/// fail, the earliest stage wins; within a stage, the lowest session index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Structure,
    Reference,
    Role,
    Lockout,
    Policy,
    Nonce,
    AuthValue,
}

/// Stage of each authorization response code. Codes not listed are
/// reference errors.
pub const PRECEDENCE: &[(TpmRcBase, Stage)] = &[
    (TpmRcBase::AuthSize, Stage::Structure),
    (TpmRcBase::AuthContext, Stage::Structure),
    (TpmRcBase::Attributes, Stage::Structure),
    (TpmRcBase::Symmetric, Stage::Structure),
    (TpmRcBase::Size, Stage::Structure),
    (TpmRcBase::Handle, Stage::Reference),
    (TpmRcBase::Value, Stage::Reference),
    (TpmRcBase::Hierarchy, Stage::Reference),
    (TpmRcBase::AuthMissing, Stage::Role),
    (TpmRcBase::AuthType, Stage::Role),
    (TpmRcBase::AuthUnavailable, Stage::Role),
    (TpmRcBase::Lockout, Stage::Lockout),
    (TpmRcBase::Expired, Stage::Policy),
    (TpmRcBase::PolicyCc, Stage::Policy),
    (TpmRcBase::Locality, Stage::Policy),
    (TpmRcBase::CpHash, Stage::Policy),
    (TpmRcBase::PolicyFail, Stage::Policy),
    (TpmRcBase::Nonce, Stage::Nonce),
    (TpmRcBase::AuthFail, Stage::AuthValue),
    (TpmRcBase::BadAuth, Stage::AuthValue),
];

#[must_use]
pub fn stage_of(rc: TpmRcBase) -> Stage {
    PRECEDENCE
        .iter()
        .find(|(code, _)| *code == rc)
        .map_or(Stage::Reference, |(_, stage)| *stage)
}

/// Result of the command-side processing, consumed when the response is
/// built.
pub struct Authorization {
    sessions: Vec<TpmsAuthCommand>,
    associated: Vec<Option<u32>>,
    cp_hashes: Vec<Vec<u8>>,
    decrypt: Option<usize>,
    encrypt: Option<usize>,
}

impl Authorization {
    /// `SessionRemoveAssociationToHandle`: the entity is gone, so its
    /// authorization value no longer keys the response.
    pub fn remove_association(&mut self, handle: u32) {
        for associated in &mut self.associated {
            if *associated == Some(handle) {
                *associated = None;
            }
        }
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// `cpHash = H(commandCode || names || parameters)`.
///
/// # Errors
///
/// Propagates digest errors.
pub fn cp_hash(
    crypto: &dyn CryptoEngine,
    alg: TpmAlgId,
    code: u32,
    names: &[Vec<u8>],
    parameters: &[u8],
) -> Result<Vec<u8>, TpmRcBase> {
    let code = code.to_be_bytes();
    let mut parts: Vec<&[u8]> = vec![&code];
    parts.extend(names.iter().map(Vec::as_slice));
    parts.push(parameters);
    crypto.digest(alg, &parts)
}

/// `rpHash = H(responseCode || commandCode || parameters)`.
///
/// # Errors
///
/// Propagates digest errors.
pub fn rp_hash(
    crypto: &dyn CryptoEngine,
    alg: TpmAlgId,
    code: u32,
    parameters: &[u8],
) -> Result<Vec<u8>, TpmRcBase> {
    crypto.digest(alg, &[&0u32.to_be_bytes(), &code.to_be_bytes(), parameters])
}

/// `nameHash = H(names)`.
///
/// # Errors
///
/// Propagates digest errors.
pub fn name_hash(crypto: &dyn CryptoEngine, alg: TpmAlgId, names: &[Vec<u8>]) -> Result<Vec<u8>, TpmRcBase> {
    let parts: Vec<&[u8]> = names.iter().map(Vec::as_slice).collect();
    crypto.digest(alg, &parts)
}

fn trim_trailing_zeros(value: &[u8]) -> &[u8] {
    let len = value.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &value[..len]
}

/// HMAC and parameter-encryption key of a session for an entity.
fn session_key(session: &Session, auth: Option<&[u8]>, name: Option<&[u8]>) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(session.session_key.to_vec());
    let Some(auth) = auth else {
        return key;
    };
    let include = match session.kind {
        SessionKind::Hmac => {
            let bound = match (&session.bind, name) {
                (Some(bind), Some(name)) => *bind == bound_entity(name, auth),
                _ => false,
            };
            !bound
        }
        SessionKind::Policy | SessionKind::Trial => {
            session.flags.contains(SessionFlags::AUTH_VALUE_NEEDED)
        }
    };
    if include {
        key.extend_from_slice(trim_trailing_zeros(auth));
    }
    key
}

struct Failure {
    rc: TpmRcBase,
    da_handle: Option<u32>,
}

impl From<TpmRcBase> for Failure {
    fn from(rc: TpmRcBase) -> Self {
        Self { rc, da_handle: None }
    }
}

impl Engine {
    fn auth_value_available(&self, handle: u32, role: AuthRole, access: NvAccess) -> bool {
        match HandleType::of(handle) {
            Some(HandleType::Permanent) => true,
            Some(HandleType::Transient | HandleType::Persistent) => {
                self.object_auth_available(handle, role)
            }
            Some(HandleType::NvIndex) => match access {
                NvAccess::Read => self.nv_attr(handle, crate::nv::TpmaNv::AUTHREAD),
                NvAccess::Write => self.nv_attr(handle, crate::nv::TpmaNv::AUTHWRITE),
                NvAccess::None => role != AuthRole::Admin,
            },
            _ => false,
        }
    }

    fn auth_policy_available(&self, handle: u32, access: NvAccess) -> bool {
        let has_policy = self
            .entity_auth_policy(handle)
            .is_some_and(|p| !p.digest.is_empty());
        match (HandleType::of(handle), access) {
            (Some(HandleType::NvIndex), NvAccess::Read) => {
                has_policy && self.nv_attr(handle, crate::nv::TpmaNv::POLICYREAD)
            }
            (Some(HandleType::NvIndex), NvAccess::Write) => {
                has_policy && self.nv_attr(handle, crate::nv::TpmaNv::POLICYWRITE)
            }
            _ => has_policy,
        }
    }

    /// Access class of the command for an authorizing entity.
    fn auth_access(attrs: &CommandAttributes, handle: u32, handles: &[u32]) -> NvAccess {
        match attrs.nv {
            Some((pos, access)) if handles.get(pos) == Some(&handle) => access,
            _ => NvAccess::None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_policy(
        &self,
        session: &Session,
        handle: u32,
        code: u32,
        locality: u8,
        cp: &[u8],
        names: &[Vec<u8>],
    ) -> Result<(), TpmRcBase> {
        if session.kind == SessionKind::Trial {
            return Err(TpmRcBase::Attributes);
        }
        if session.timeout.is_some_and(|t| self.now() > t) {
            return Err(TpmRcBase::Expired);
        }
        if session.command_code.is_some_and(|cc| cc != code) {
            return Err(TpmRcBase::PolicyCc);
        }
        if let Some(mask) = session.locality {
            if locality > 7 || mask & (1 << locality) == 0 {
                return Err(TpmRcBase::Locality);
            }
        }
        if let Some(expected) = &session.cp_hash {
            let actual = if session.flags.contains(SessionFlags::NAME_HASH_DEFINED) {
                name_hash(self.crypto(), session.auth_hash, names)?
            } else {
                cp.to_vec()
            };
            if *expected != actual {
                return Err(TpmRcBase::PolicyFail);
            }
        }
        if session.flags.contains(SessionFlags::NV_WRITTEN_CHECK) {
            let expected = session.flags.contains(SessionFlags::NV_WRITTEN_STATE);
            if self.nv.index(handle).map(|i| i.is_written()) != Ok(expected) {
                return Err(TpmRcBase::PolicyFail);
            }
        }
        let policy = self.entity_auth_policy(handle).ok_or(TpmRcBase::PolicyFail)?;
        if policy.alg != session.auth_hash || policy.digest != session.policy_digest {
            return Err(TpmRcBase::PolicyFail);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_session(
        &self,
        index: usize,
        auth: &TpmsAuthCommand,
        entity: Option<(u32, AuthRole)>,
        attrs: &CommandAttributes,
        handles: &[u32],
        names: &[Vec<u8>],
        cp: &[u8],
        extra_nonces: &[u8],
        locality: u8,
    ) -> Result<(), Failure> {
        if auth.session_handle.0 == TPM_RS_PW {
            let Some((handle, role)) = entity else {
                return Err(TpmRcBase::Handle.into());
            };
            let access = Self::auth_access(attrs, handle, handles);
            if !self.auth_value_available(handle, role, access) {
                let rc = if role == AuthRole::Admin {
                    TpmRcBase::AuthType
                } else {
                    TpmRcBase::AuthUnavailable
                };
                return Err(rc.into());
            }
            self.check_lockout(handle, None)?;
            if !auth.nonce.is_empty() {
                return Err(TpmRcBase::Nonce.into());
            }
            let expected = self.entity_auth_value(handle);
            if !constant_time_eq(trim_trailing_zeros(&expected), trim_trailing_zeros(&auth.hmac)) {
                return Err(self.auth_failure(handle, None));
            }
            return Ok(());
        }

        let session = self.sessions.get(auth.session_handle.0).ok_or(TpmRcBase::Handle)?;
        if auth.session_attributes.contains(TpmaSession::AUDIT) && session.is_policy() {
            return Err(TpmRcBase::Attributes.into());
        }
        let digest_len = digest_size(session.auth_hash).unwrap_or(0);
        if auth.nonce.len() < MIN_NONCE_SIZE || auth.nonce.len() > digest_len {
            return Err(TpmRcBase::Size.into());
        }

        let mut entity_auth = None;
        let mut entity_name = None;
        if let Some((handle, role)) = entity {
            let access = Self::auth_access(attrs, handle, handles);
            if session.is_policy() {
                if !self.auth_policy_available(handle, access) {
                    return Err(TpmRcBase::AuthUnavailable.into());
                }
            } else if !self.auth_value_available(handle, role, access) {
                let rc = if role == AuthRole::Admin {
                    TpmRcBase::AuthType
                } else {
                    TpmRcBase::AuthUnavailable
                };
                return Err(rc.into());
            }
            self.check_lockout(handle, Some(session))?;
            if session.is_policy() {
                self.check_policy(session, handle, attrs.code as u32, locality, cp, names)?;
            }
            entity_auth = Some(self.entity_auth_value(handle));
            entity_name = Some(self.entity_name(handle)?);
        }

        if session.flags.contains(SessionFlags::PASSWORD_NEEDED) {
            let handle = entity.map(|(h, _)| h).ok_or(TpmRcBase::AuthType)?;
            let expected = entity_auth.as_deref().map_or(&[][..], Vec::as_slice);
            if !constant_time_eq(trim_trailing_zeros(expected), trim_trailing_zeros(&auth.hmac)) {
                return Err(self.auth_failure(handle, Some(session)));
            }
            return Ok(());
        }
        if session.is_policy() && !session.flags.contains(SessionFlags::AUTH_VALUE_NEEDED) {
            return Ok(());
        }

        let key = session_key(session, entity_auth.as_deref().map(Vec::as_slice), entity_name.as_deref());
        let extra: &[u8] = if index == 0 { extra_nonces } else { &[] };
        let ok = self
            .crypto()
            .hmac_verify(
                session.auth_hash,
                &key,
                &[cp, &*auth.nonce, &session.nonce_tpm, extra, &[auth.session_attributes.bits()]],
                &auth.hmac,
            )
            .map_err(Failure::from)?;
        if !ok {
            return Err(match entity {
                Some((handle, _)) => self.auth_failure(handle, Some(session)),
                None => TpmRcBase::BadAuth.into(),
            });
        }
        debug!(
            target: "tpm2sim::authorize",
            "{:#010x}: session {index} authorized",
            auth.session_handle.0
        );
        Ok(())
    }

    fn check_lockout(&self, handle: u32, session: Option<&Session>) -> Result<(), TpmRcBase> {
        if handle == TPM_RH_LOCKOUT {
            return self.state.da.check_locked_out(true);
        }
        let bound_da = session.is_some_and(|s| s.flags.contains(SessionFlags::DA_BOUND));
        if !self.is_da_exempt(handle) || bound_da {
            self.state.da.check_locked_out(false)?;
        }
        Ok(())
    }

    fn auth_failure(&self, handle: u32, session: Option<&Session>) -> Failure {
        let bound_da = session.is_some_and(|s| s.flags.contains(SessionFlags::DA_BOUND));
        if handle == TPM_RH_LOCKOUT || !self.is_da_exempt(handle) || bound_da {
            Failure {
                rc: TpmRcBase::AuthFail,
                da_handle: Some(handle),
            }
        } else {
            TpmRcBase::BadAuth.into()
        }
    }

    /// Parses the authorization area, checks every session and decrypts the
    /// first parameter.
    ///
    /// # Errors
    ///
    /// Returns the highest-precedence failure, qualified with its session
    /// number.
    pub(crate) fn authorize_command(
        &mut self,
        attrs: &CommandAttributes,
        handles: &[u32],
        auth_area: &[u8],
        parameters: &mut [u8],
        locality: u8,
    ) -> Result<Authorization, TpmError> {
        let sessions = parse_auth_area(auth_area)?;
        let needed = attrs.auth_count();
        if sessions.len() < needed {
            return Err(TpmRcBase::AuthMissing.into());
        }

        let mut decrypt = None;
        let mut encrypt = None;
        for (i, auth) in sessions.iter().enumerate() {
            let n = u8::try_from(i + 1).unwrap_or(u8::MAX);
            if auth.session_handle.0 != TPM_RS_PW && !is_session(auth.session_handle.0) {
                return Err(TpmRcBase::Handle.at_session(n));
            }
            if auth.session_handle.0 != TPM_RS_PW
                && sessions[..i]
                    .iter()
                    .any(|s| s.session_handle == auth.session_handle)
            {
                return Err(TpmRcBase::Handle.at_session(n));
            }
            let reserved = TpmaSession::AUDIT_EXCLUSIVE | TpmaSession::AUDIT_RESET;
            if auth.session_attributes.intersects(reserved) {
                return Err(TpmRcBase::Attributes.at_session(n));
            }
            if auth.session_attributes.contains(TpmaSession::DECRYPT) {
                if !attrs.decrypt || decrypt.is_some() || auth.session_handle.0 == TPM_RS_PW {
                    return Err(TpmRcBase::Attributes.at_session(n));
                }
                decrypt = Some(i);
            }
            if auth.session_attributes.contains(TpmaSession::ENCRYPT) {
                if !attrs.encrypt || encrypt.is_some() || auth.session_handle.0 == TPM_RS_PW {
                    return Err(TpmRcBase::Attributes.at_session(n));
                }
                encrypt = Some(i);
            }
            if auth.session_handle.0 == TPM_RS_PW && i >= needed {
                return Err(TpmRcBase::Handle.at_session(n));
            }
            if auth.session_handle.0 != TPM_RS_PW {
                let Some(session) = self.sessions.get(auth.session_handle.0) else {
                    return Err(TpmRcBase::Handle.at_session(n));
                };
                if (decrypt == Some(i) || encrypt == Some(i))
                    && session.symmetric == SessionSymmetric::Null
                {
                    return Err(TpmRcBase::Symmetric.at_session(n));
                }
            }
        }

        let auth_handles: Vec<(u32, AuthRole)> = attrs
            .handles
            .iter()
            .zip(handles)
            .filter(|(role, _)| **role != AuthRole::None)
            .map(|(role, handle)| (*handle, *role))
            .collect();
        let names = handles
            .iter()
            .map(|h| self.entity_name(*h))
            .collect::<Result<Vec<_>, _>>()?;

        let mut extra_nonces = Vec::new();
        for index in [decrypt, encrypt.filter(|e| Some(*e) != decrypt)]
            .into_iter()
            .flatten()
            .filter(|i| *i != 0)
        {
            if let Some(session) = self.sessions.get(sessions[index].session_handle.0) {
                extra_nonces.extend_from_slice(&session.nonce_tpm);
            }
        }

        let mut cp_hashes = Vec::with_capacity(sessions.len());
        let mut failures: Vec<(Stage, usize, Failure)> = Vec::new();
        for (i, auth) in sessions.iter().enumerate() {
            let cp = match self.sessions.get(auth.session_handle.0) {
                Some(session) => cp_hash(self.crypto(), session.auth_hash, attrs.code as u32, &names, parameters)?,
                None => Vec::new(),
            };
            if let Err(failure) = self.evaluate_session(
                i,
                auth,
                auth_handles.get(i).copied(),
                attrs,
                handles,
                &names,
                &cp,
                &extra_nonces,
                locality,
            ) {
                failures.push((stage_of(failure.rc), i, failure));
            }
            cp_hashes.push(cp);
        }
        if let Some((_, i, failure)) = failures.into_iter().min_by_key(|(stage, i, _)| (*stage, *i)) {
            if let Some(handle) = failure.da_handle {
                let now = self.now();
                self.state.da.register_failure(handle, now);
                if let Err(rc) = self.persist_state() {
                    warn!(target: "tpm2sim::authorize", "failed to record DA failure: {rc}");
                }
            }
            warn!(target: "tpm2sim::authorize", "session {}: {}", i + 1, failure.rc);
            let n = u8::try_from(i + 1).unwrap_or(u8::MAX);
            return Err(failure.rc.at_session(n));
        }

        let authorization = Authorization {
            associated: (0..sessions.len())
                .map(|i| auth_handles.get(i).map(|(h, _)| *h))
                .collect(),
            sessions,
            cp_hashes,
            decrypt,
            encrypt,
        };
        if let Some(index) = decrypt {
            self.crypt_parameter(&authorization, index, parameters, false)
                .map_err(|rc| rc.at_parameter(1))?;
        }
        Ok(authorization)
    }

    /// En- or decrypts the leading `TPM2B` parameter in place.
    fn crypt_parameter(
        &self,
        authorization: &Authorization,
        index: usize,
        parameters: &mut [u8],
        response: bool,
    ) -> Result<(), TpmRcBase> {
        if parameters.len() < 2 {
            return Err(TpmRcBase::Size);
        }
        let size = usize::from(u16::from_be_bytes([parameters[0], parameters[1]]));
        let data = parameters.get_mut(2..2 + size).ok_or(TpmRcBase::Size)?;
        let auth = &authorization.sessions[index];
        let session = self.sessions.get(auth.session_handle.0).ok_or(TpmRcBase::Handle)?;
        let entity = authorization.associated[index];
        let entity_auth = entity.map(|h| self.entity_auth_value(h));
        let entity_name = entity.and_then(|h| self.entity_name(h).ok());
        let key = session_key(
            session,
            entity_auth.as_deref().map(Vec::as_slice),
            entity_name.as_deref(),
        );
        let (u, v) = if response {
            (&session.nonce_tpm[..], &auth.nonce[..])
        } else {
            (&auth.nonce[..], &session.nonce_tpm[..])
        };
        let bits = |bytes: usize| u32::try_from(bytes * 8).map_err(|_| TpmRcBase::Size);
        match session.symmetric {
            SessionSymmetric::Null => Err(TpmRcBase::Symmetric),
            SessionSymmetric::Xor(hash) => {
                if data.is_empty() {
                    return Ok(());
                }
                let mask = self.crypto().kdfa(hash, &key, KDF_LABEL_XOR, u, v, bits(data.len())?)?;
                for (byte, m) in data.iter_mut().zip(mask.iter()) {
                    *byte ^= m;
                }
                Ok(())
            }
            SessionSymmetric::AesCfb(key_bits) => {
                let key_len = usize::from(key_bits / 8);
                let material = self.crypto().kdfa(
                    session.auth_hash,
                    &key,
                    KDF_LABEL_CFB,
                    u,
                    v,
                    u32::from(key_bits) + 128,
                )?;
                let (aes_key, iv) = material.split_at(key_len);
                if response {
                    self.crypto().cfb_encrypt(aes_key, iv, data)
                } else {
                    self.crypto().cfb_decrypt(aes_key, iv, data)
                }
            }
        }
    }

    /// Rolls nonces, encrypts the first response parameter, updates audit
    /// digests, computes response HMACs and flushes sessions that do not
    /// continue.
    ///
    /// # Errors
    ///
    /// Propagates crypto engine errors.
    pub(crate) fn build_response_auth(
        &mut self,
        authorization: &Authorization,
        code: TpmCc,
        parameters: &mut [u8],
    ) -> Result<Vec<u8>, TpmError> {
        for auth in &authorization.sessions {
            if auth.session_handle.0 == TPM_RS_PW {
                continue;
            }
            let len = self
                .sessions
                .get(auth.session_handle.0)
                .map_or(0, |s| s.nonce_tpm.len());
            let nonce = self.random(len);
            if let Some(session) = self.sessions.get_mut(auth.session_handle.0) {
                session.nonce_tpm = nonce;
            }
        }
        if let Some(index) = authorization.encrypt {
            self.crypt_parameter(authorization, index, parameters, true)?;
        }

        let mut responses = Vec::with_capacity(authorization.sessions.len());
        for (i, auth) in authorization.sessions.iter().enumerate() {
            if auth.session_handle.0 == TPM_RS_PW {
                responses.push(TpmsAuthResponse {
                    nonce: Tpm2bNonce::default(),
                    session_attributes: auth.session_attributes,
                    hmac: Tpm2bAuth::default(),
                });
                continue;
            }
            let session = self
                .sessions
                .get(auth.session_handle.0)
                .ok_or(TpmRcBase::Handle)?
                .clone();
            let rp = rp_hash(self.crypto(), session.auth_hash, code as u32, parameters)?;
            if auth.session_attributes.contains(TpmaSession::AUDIT) {
                let old = if session.audit_digest.is_empty() {
                    vec![0; digest_size(session.auth_hash).unwrap_or(0)]
                } else {
                    session.audit_digest.clone()
                };
                let digest = self.crypto().digest(
                    session.auth_hash,
                    &[&old, &authorization.cp_hashes[i], &rp],
                )?;
                if let Some(s) = self.sessions.get_mut(auth.session_handle.0) {
                    s.audit_digest = digest;
                }
            }
            let hmac = if session.flags.contains(SessionFlags::PASSWORD_NEEDED) {
                Vec::new()
            } else {
                let entity = authorization.associated[i];
                let entity_auth = entity.map(|h| self.entity_auth_value(h));
                let entity_name = entity.and_then(|h| self.entity_name(h).ok());
                let key = session_key(
                    &session,
                    entity_auth.as_deref().map(Vec::as_slice),
                    entity_name.as_deref(),
                );
                self.crypto().hmac(
                    session.auth_hash,
                    &key,
                    &[&rp, &session.nonce_tpm, &*auth.nonce, &[auth.session_attributes.bits()]],
                )?
            };
            responses.push(TpmsAuthResponse {
                nonce: buffer(&session.nonce_tpm)?,
                session_attributes: auth.session_attributes,
                hmac: buffer(&hmac)?,
            });
        }

        let now = self.now();
        for auth in &authorization.sessions {
            if auth.session_handle.0 == TPM_RS_PW {
                continue;
            }
            if auth.session_attributes.contains(TpmaSession::CONTINUE_SESSION) {
                if let Some(session) = self.sessions.get_mut(auth.session_handle.0) {
                    if session.kind == SessionKind::Policy {
                        session.restart_policy(now);
                    }
                }
            } else {
                let _ = self.sessions.flush(auth.session_handle.0);
            }
        }
        Ok(encode_response_area(&responses)?)
    }
}
