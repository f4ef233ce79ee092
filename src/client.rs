// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Caller-side session handling: the command HMAC, parameter encryption
//! and response verification a TPM user performs, driven against an
//! in-process [`Engine`].

use crate::{
    authorize::{
        auth_command, cp_hash, encode_auth_area, parse_response_area, password_auth, rp_hash,
        TpmaSession, TpmsAuthCommand, TpmsAuthResponse,
    },
    command::{TpmCc, Request, Response},
    crypto::{require_digest_size, CryptoEngine, KDF_LABEL_ATH, KDF_LABEL_CFB, KDF_LABEL_SECRET, KDF_LABEL_XOR},
    engine::Engine,
    error::{ClientError, TpmRcBase},
    handle::TPM_RH_NULL,
    nv::NvPublic,
    object::{PublicArea, PublicParams},
    session::{bound_entity, SessionKind, SessionSymmetric},
    util::{Reader, Writer},
};
use log::debug;
use rand::RngCore;
use tpm2_protocol::data::TpmAlgId;
use zeroize::Zeroizing;

/// Tries before a random ephemeral scalar is given up on.
const EPHEMERAL_ATTEMPTS: usize = 16;

fn trim_trailing_zeros(value: &[u8]) -> &[u8] {
    let len = value.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &value[..len]
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Name and authorization value of an entity as the caller knows them.
#[derive(Debug, Clone)]
pub struct Entity {
    pub name: Vec<u8>,
    pub auth: Zeroizing<Vec<u8>>,
}

impl Entity {
    #[must_use]
    pub fn new(name: &[u8], auth: &[u8]) -> Self {
        Self {
            name: name.to_vec(),
            auth: Zeroizing::new(auth.to_vec()),
        }
    }

    /// A permanent handle, whose Name is the handle itself.
    #[must_use]
    pub fn permanent(handle: u32, auth: &[u8]) -> Self {
        Self::new(&handle.to_be_bytes(), auth)
    }

    /// # Errors
    ///
    /// Propagates digest errors.
    pub fn nv(public: &NvPublic, auth: &[u8], crypto: &dyn CryptoEngine) -> Result<Self, TpmRcBase> {
        Ok(Self::new(&public.name(crypto)?, auth))
    }
}

/// Client view of a session started with `TPM2_StartAuthSession`.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub handle: u32,
    pub kind: SessionKind,
    pub auth_hash: TpmAlgId,
    pub symmetric: SessionSymmetric,
    pub attributes: TpmaSession,
    pub nonce_caller: Vec<u8>,
    pub nonce_tpm: Vec<u8>,
    session_key: Zeroizing<Vec<u8>>,
    bind: Option<Vec<u8>>,
    /// `TPM2_PolicyAuthValue` was asserted.
    pub auth_value_needed: bool,
    /// `TPM2_PolicyPassword` was asserted.
    pub password_needed: bool,
}

impl AuthSession {
    /// HMAC and parameter encryption key for `entity`.
    fn key(&self, entity: Option<&Entity>) -> Zeroizing<Vec<u8>> {
        let mut key = Zeroizing::new(self.session_key.to_vec());
        let Some(entity) = entity else {
            return key;
        };
        let include = match self.kind {
            SessionKind::Hmac => self.bind.as_ref() != Some(&bound_entity(&entity.name, &entity.auth)),
            SessionKind::Policy | SessionKind::Trial => self.auth_value_needed,
        };
        if include {
            key.extend_from_slice(trim_trailing_zeros(&entity.auth));
        }
        key
    }

    /// En- or decrypts the leading `TPM2B` of `parameters` in place.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Size` for a missing `TPM2B` and `TpmRcBase::Symmetric`
    /// for a session without a symmetric algorithm.
    pub fn crypt_parameter(
        &self,
        crypto: &dyn CryptoEngine,
        entity: Option<&Entity>,
        parameters: &mut [u8],
        response: bool,
    ) -> Result<(), TpmRcBase> {
        if parameters.len() < 2 {
            return Err(TpmRcBase::Size);
        }
        let size = usize::from(u16::from_be_bytes([parameters[0], parameters[1]]));
        let data = parameters.get_mut(2..2 + size).ok_or(TpmRcBase::Size)?;
        let key = self.key(entity);
        let (u, v) = if response {
            (&self.nonce_tpm[..], &self.nonce_caller[..])
        } else {
            (&self.nonce_caller[..], &self.nonce_tpm[..])
        };
        match self.symmetric {
            SessionSymmetric::Null => Err(TpmRcBase::Symmetric),
            SessionSymmetric::Xor(hash) => {
                if data.is_empty() {
                    return Ok(());
                }
                let bits = u32::try_from(data.len() * 8).map_err(|_| TpmRcBase::Size)?;
                let mask = crypto.kdfa(hash, &key, KDF_LABEL_XOR, u, v, bits)?;
                for (byte, m) in data.iter_mut().zip(mask.iter()) {
                    *byte ^= m;
                }
                Ok(())
            }
            SessionSymmetric::AesCfb(key_bits) => {
                let material =
                    crypto.kdfa(self.auth_hash, &key, KDF_LABEL_CFB, u, v, u32::from(key_bits) + 128)?;
                let (aes_key, iv) = material.split_at(usize::from(key_bits / 8));
                if response {
                    crypto.cfb_decrypt(aes_key, iv, data)
                } else {
                    crypto.cfb_encrypt(aes_key, iv, data)
                }
            }
        }
    }

    /// Builds the command authorization. The caller nonce must already be
    /// rolled.
    ///
    /// # Errors
    ///
    /// Propagates crypto engine errors.
    pub fn command_auth(
        &self,
        crypto: &dyn CryptoEngine,
        cp: &[u8],
        extra_nonces: &[u8],
        entity: Option<&Entity>,
    ) -> Result<TpmsAuthCommand, TpmRcBase> {
        let hmac = if self.password_needed {
            entity.map(|e| e.auth.to_vec()).unwrap_or_default()
        } else if self.kind != SessionKind::Hmac && !self.auth_value_needed {
            Vec::new()
        } else {
            crypto.hmac(
                self.auth_hash,
                &self.key(entity),
                &[
                    cp,
                    &self.nonce_caller,
                    &self.nonce_tpm,
                    extra_nonces,
                    &[self.attributes.bits()],
                ],
            )?
        };
        auth_command(self.handle, &self.nonce_caller, self.attributes, &hmac)
    }

    /// Takes the new TPM nonce from `response` and checks its HMAC over
    /// the still encrypted response parameters.
    ///
    /// # Errors
    ///
    /// Returns `Ok(false)` on a mismatch and propagates crypto engine
    /// errors.
    pub fn verify_response(
        &mut self,
        crypto: &dyn CryptoEngine,
        code: TpmCc,
        response: &TpmsAuthResponse,
        parameters: &[u8],
        entity: Option<&Entity>,
    ) -> Result<bool, TpmRcBase> {
        self.nonce_tpm = response.nonce.to_vec();
        if self.password_needed {
            return Ok(response.hmac.is_empty());
        }
        let rp = rp_hash(crypto, self.auth_hash, code as u32, parameters)?;
        crypto.hmac_verify(
            self.auth_hash,
            &self.key(entity),
            &[
                &rp,
                &self.nonce_tpm,
                &self.nonce_caller,
                &[response.session_attributes.bits()],
            ],
            &response.hmac,
        )
    }
}

/// Parameters of `TPM2_StartAuthSession`.
pub struct SessionRequest<'a> {
    pub kind: SessionKind,
    pub auth_hash: TpmAlgId,
    pub symmetric: SessionSymmetric,
    pub bind: Option<(u32, &'a Entity)>,
    pub salt_key: Option<(u32, &'a PublicArea)>,
}

impl<'a> SessionRequest<'a> {
    #[must_use]
    pub fn new(kind: SessionKind, auth_hash: TpmAlgId) -> Self {
        Self {
            kind,
            auth_hash,
            symmetric: SessionSymmetric::Null,
            bind: None,
            salt_key: None,
        }
    }

    #[must_use]
    pub fn symmetric(mut self, symmetric: SessionSymmetric) -> Self {
        self.symmetric = symmetric;
        self
    }

    #[must_use]
    pub fn bind(mut self, handle: u32, entity: &'a Entity) -> Self {
        self.bind = Some((handle, entity));
        self
    }

    /// Salts the session to a loaded ECC decryption key.
    #[must_use]
    pub fn salted(mut self, handle: u32, public: &'a PublicArea) -> Self {
        self.salt_key = Some((handle, public));
        self
    }

    /// Starts the session.
    ///
    /// # Errors
    ///
    /// Returns the response code of `TPM2_StartAuthSession` or
    /// `ClientError::Malformed` for an unusable salt key or response.
    pub fn start(self, engine: &mut Engine) -> Result<AuthSession, ClientError> {
        let crypto = engine.crypto();
        let digest_len = require_digest_size(self.auth_hash).map_err(ClientError::Malformed)?;
        let nonce_caller = random_bytes(digest_len);
        let (salt, encrypted_salt) = match self.salt_key {
            Some((_, public)) => ecc_salt(crypto, public).map_err(ClientError::Malformed)?,
            None => (Zeroizing::default(), Vec::new()),
        };

        let mut w = Writer::new();
        w.tpm2b(&nonce_caller)?
            .tpm2b(&encrypted_salt)?
            .u8(self.kind as u8);
        self.symmetric.write_to(&mut w);
        w.u16(self.auth_hash as u16);
        let request = Request::new(TpmCc::StartAuthSession)
            .handle(self.salt_key.map_or(TPM_RH_NULL, |(h, _)| h))
            .handle(self.bind.map_or(TPM_RH_NULL, |(h, _)| h))
            .parameters(w.into_vec());
        let response = engine.execute(&request)?;

        let handle = *response
            .handles
            .first()
            .ok_or(ClientError::Malformed(TpmRcBase::Handle))?;
        let mut r = response.reader();
        let nonce_tpm = r.tpm2b().map_err(ClientError::Malformed)?.to_vec();

        let mut material = Zeroizing::new(Vec::new());
        let mut bind = None;
        if let Some((_, entity)) = self.bind {
            material.extend_from_slice(trim_trailing_zeros(&entity.auth));
            bind = Some(bound_entity(&entity.name, &entity.auth));
        }
        material.extend_from_slice(&salt);
        let session_key = if material.is_empty() {
            Zeroizing::default()
        } else {
            let bits = u32::try_from(digest_len * 8).map_err(|_| ClientError::Malformed(TpmRcBase::Size))?;
            engine
                .crypto()
                .kdfa(self.auth_hash, &material, KDF_LABEL_ATH, &nonce_tpm, &nonce_caller, bits)
                .map_err(ClientError::Malformed)?
        };
        debug!(target: "tpm2sim::client", "{handle:#010x}: started");
        Ok(AuthSession {
            handle,
            kind: self.kind,
            auth_hash: self.auth_hash,
            symmetric: self.symmetric,
            attributes: TpmaSession::CONTINUE_SESSION,
            nonce_caller,
            nonce_tpm,
            session_key,
            bind,
            auth_value_needed: false,
            password_needed: false,
        })
    }
}

/// Generates a salt and its ECDH encryption to `public`: an ephemeral
/// point `(x, y)` encoded as two `TPM2B`s.
///
/// # Errors
///
/// Returns `TpmRcBase::Key` for a non-ECC key.
pub fn ecc_salt(
    crypto: &dyn CryptoEngine,
    public: &PublicArea,
) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), TpmRcBase> {
    let PublicParams::Ecc { x: key_x, y: key_y, .. } = &public.params else {
        return Err(TpmRcBase::Key);
    };
    for _ in 0..EPHEMERAL_ATTEMPTS {
        let scalar = Zeroizing::new(random_bytes(32));
        let Ok((x, y)) = crypto.ecc_public(&scalar) else {
            continue;
        };
        let z = crypto.ecdh(&scalar, key_x, key_y)?;
        let bits = u32::try_from(require_digest_size(public.name_alg)? * 8).map_err(|_| TpmRcBase::Size)?;
        let salt = crypto.kdfe(public.name_alg, &z, KDF_LABEL_SECRET, &x, key_x, bits)?;
        let mut w = Writer::new();
        w.tpm2b(&x)?.tpm2b(&y)?;
        return Ok((salt, w.into_vec()));
    }
    Err(TpmRcBase::Failure)
}

/// How one authorization slot of a command is filled.
pub enum Auth<'a> {
    Password(&'a [u8]),
    /// A session, optionally authorizing `entity`. Sessions past the
    /// authorization handles pass `None`.
    Session {
        session: &'a mut AuthSession,
        entity: Option<&'a Entity>,
    },
}

impl Auth<'_> {
    fn session(&self) -> Option<&AuthSession> {
        match self {
            Auth::Password(_) => None,
            Auth::Session { session, .. } => Some(&**session),
        }
    }
}

/// A command as the caller sees it: handles with their Names.
#[derive(Debug, Clone)]
pub struct ClientCommand {
    pub code: TpmCc,
    pub handles: Vec<u32>,
    pub names: Vec<Vec<u8>>,
    pub parameters: Vec<u8>,
    pub locality: u8,
    /// Authorization value of the first authorized entity once the
    /// command has run, for commands that change or delete it.
    pub auth_after: Option<Zeroizing<Vec<u8>>>,
}

impl ClientCommand {
    #[must_use]
    pub fn new(code: TpmCc) -> Self {
        Self {
            code,
            handles: Vec::new(),
            names: Vec::new(),
            parameters: Vec::new(),
            locality: 0,
            auth_after: None,
        }
    }

    /// Adds a handle whose Name is the handle itself.
    #[must_use]
    pub fn handle(self, handle: u32) -> Self {
        self.named(handle, &handle.to_be_bytes())
    }

    #[must_use]
    pub fn named(mut self, handle: u32, name: &[u8]) -> Self {
        self.handles.push(handle);
        self.names.push(name.to_vec());
        self
    }

    #[must_use]
    pub fn parameters(mut self, parameters: Vec<u8>) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn locality(mut self, locality: u8) -> Self {
        self.locality = locality;
        self
    }

    #[must_use]
    pub fn auth_after(mut self, auth: &[u8]) -> Self {
        self.auth_after = Some(Zeroizing::new(auth.to_vec()));
        self
    }
}

/// Runs `command` with the given authorizations: encrypts the first
/// parameter, computes the command HMACs, verifies the response HMACs
/// and decrypts the first response parameter.
///
/// # Errors
///
/// Returns the response code of a failed command,
/// `ClientError::ResponseHmac` when a response does not verify, or
/// `ClientError::Malformed` for a malformed response.
pub fn execute(
    engine: &mut Engine,
    command: &ClientCommand,
    auths: &mut [Auth<'_>],
) -> Result<Response, ClientError> {
    for auth in auths.iter_mut() {
        if let Auth::Session { session, .. } = auth {
            let len = session.nonce_caller.len();
            session.nonce_caller = random_bytes(len);
        }
    }

    let mut parameters = command.parameters.clone();
    let decrypt = auths.iter().position(|a| {
        a.session()
            .is_some_and(|s| s.attributes.contains(TpmaSession::DECRYPT))
    });
    let encrypt = auths.iter().position(|a| {
        a.session()
            .is_some_and(|s| s.attributes.contains(TpmaSession::ENCRYPT))
    });
    if let Some(i) = decrypt {
        if let Auth::Session { session, entity } = &auths[i] {
            session
                .crypt_parameter(engine.crypto(), *entity, &mut parameters, false)
                .map_err(ClientError::Malformed)?;
        }
    }

    let mut extra_nonces = Vec::new();
    for i in [decrypt, encrypt.filter(|e| Some(*e) != decrypt)]
        .into_iter()
        .flatten()
        .filter(|i| *i != 0)
    {
        if let Some(session) = auths[i].session() {
            extra_nonces.extend_from_slice(&session.nonce_tpm);
        }
    }

    let code = command.code as u32;
    let mut area = Vec::with_capacity(auths.len());
    for (i, auth) in auths.iter().enumerate() {
        let entry = match auth {
            Auth::Password(value) => password_auth(value).map_err(ClientError::Malformed)?,
            Auth::Session { session, entity } => {
                let crypto = engine.crypto();
                let cp = cp_hash(crypto, session.auth_hash, code, &command.names, &parameters)
                    .map_err(ClientError::Malformed)?;
                let extra: &[u8] = if i == 0 { &extra_nonces } else { &[] };
                session
                    .command_auth(crypto, &cp, extra, *entity)
                    .map_err(ClientError::Malformed)?
            }
        };
        area.push(entry);
    }

    let request = Request {
        code,
        handles: command.handles.clone(),
        auth_area: if area.is_empty() {
            Vec::new()
        } else {
            encode_auth_area(&area).map_err(ClientError::Malformed)?
        },
        parameters,
        locality: command.locality,
    };
    let mut response = engine.execute(&request)?;
    if auths.is_empty() {
        return Ok(response);
    }

    let replies = parse_response_area(&response.auth_area).map_err(ClientError::Malformed)?;
    if replies.len() != auths.len() {
        return Err(ClientError::Malformed(TpmRcBase::AuthSize));
    }
    let changed = command
        .auth_after
        .as_ref()
        .and_then(|auth| first_entity(auths).map(|e| Entity::new(&e.name, auth)));
    for (i, (auth, reply)) in auths.iter_mut().zip(&replies).enumerate() {
        let Auth::Session { session, entity } = auth else {
            continue;
        };
        let entity = if i == 0 && changed.is_some() {
            changed.as_ref()
        } else {
            *entity
        };
        let ok = session
            .verify_response(engine.crypto(), command.code, reply, &response.parameters, entity)
            .map_err(ClientError::Malformed)?;
        if !ok {
            return Err(ClientError::ResponseHmac(i + 1));
        }
    }
    if let Some(i) = encrypt {
        if let Auth::Session { session, entity } = &auths[i] {
            let entity = if i == 0 && changed.is_some() {
                changed.as_ref()
            } else {
                *entity
            };
            session
                .crypt_parameter(engine.crypto(), entity, &mut response.parameters, true)
                .map_err(ClientError::Malformed)?;
        }
    }
    for auth in auths.iter_mut() {
        if let Auth::Session { session, .. } = auth {
            if session.kind == SessionKind::Policy {
                session.auth_value_needed = false;
                session.password_needed = false;
            }
        }
    }
    Ok(response)
}

fn first_entity<'e>(auths: &[Auth<'e>]) -> Option<&'e Entity> {
    match auths.first() {
        Some(Auth::Session { entity, .. }) => *entity,
        _ => None,
    }
}

/// Password authorization without a session, for commands run directly
/// through [`Engine::execute`].
///
/// # Errors
///
/// Returns `TpmRcBase::Size` for a password longer than `TPM2B_AUTH`.
pub fn password_area(auth: &[u8]) -> Result<Vec<u8>, TpmRcBase> {
    encode_auth_area(&[password_auth(auth)?])
}

/// Reads the single `TPM2B` response parameter of commands such as
/// `TPM2_NV_Read` and `TPM2_PolicyGetDigest`.
///
/// # Errors
///
/// Returns `ClientError::Malformed` for a malformed response.
pub fn single_tpm2b(response: &Response) -> Result<Vec<u8>, ClientError> {
    let mut r = Reader::new(&response.parameters);
    Ok(r.tpm2b().map_err(ClientError::Malformed)?.to_vec())
}
