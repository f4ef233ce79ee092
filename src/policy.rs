// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Policy digest updates.
//!
//! Every assertion extends the digest as `H(old || commandCode || args)`.
//! [`PolicyDigest`] applies the same updates outside a session, which is
//! how a caller computes the `authPolicy` of an entity.

use crate::{
    command::TpmCc,
    crypto::{require_digest_size, CryptoEngine},
    error::TpmRcBase,
};
use tpm2_protocol::data::TpmAlgId;

/// Smallest and largest number of branches in `TPM2_PolicyOR`.
pub const POLICY_OR_MIN: usize = 2;
pub const POLICY_OR_MAX: usize = 8;

/// Extends `digest` with `code` and `args`.
///
/// # Errors
///
/// Propagates digest errors.
pub fn extend(
    crypto: &dyn CryptoEngine,
    alg: TpmAlgId,
    digest: &mut Vec<u8>,
    code: TpmCc,
    args: &[&[u8]],
) -> Result<(), TpmRcBase> {
    let cc = (code as u32).to_be_bytes();
    let mut parts: Vec<&[u8]> = vec![digest.as_slice(), &cc];
    parts.extend_from_slice(args);
    *digest = crypto.digest(alg, &parts)?;
    Ok(())
}

/// `PolicyUpdate` of `TPM2_PolicySecret` and `TPM2_PolicySigned`: the
/// entity Name first, then the policy reference in a second hash.
///
/// # Errors
///
/// Propagates digest errors.
pub fn extend_with_name(
    crypto: &dyn CryptoEngine,
    alg: TpmAlgId,
    digest: &mut Vec<u8>,
    code: TpmCc,
    name: &[u8],
    policy_ref: &[u8],
) -> Result<(), TpmRcBase> {
    extend(crypto, alg, digest, code, &[name])?;
    *digest = crypto.digest(alg, &[digest.as_slice(), policy_ref])?;
    Ok(())
}

/// Replaces `digest` with the `TPM2_PolicyOR` of `branches`.
///
/// # Errors
///
/// Returns `TpmRcBase::Size` for a branch count outside 2..=8 and
/// `TpmRcBase::Value` when `digest` is not one of the branches.
pub fn or(
    crypto: &dyn CryptoEngine,
    alg: TpmAlgId,
    digest: &mut Vec<u8>,
    branches: &[Vec<u8>],
) -> Result<(), TpmRcBase> {
    if !(POLICY_OR_MIN..=POLICY_OR_MAX).contains(&branches.len()) {
        return Err(TpmRcBase::Size);
    }
    if !branches.iter().any(|b| b == digest) {
        return Err(TpmRcBase::Value);
    }
    let joined = branches.concat();
    let mut zero = vec![0u8; require_digest_size(alg)?];
    extend(crypto, alg, &mut zero, TpmCc::PolicyOR, &[&joined])?;
    *digest = zero;
    Ok(())
}

/// A policy digest computed outside the TPM.
#[derive(Clone)]
pub struct PolicyDigest<'a> {
    crypto: &'a dyn CryptoEngine,
    alg: TpmAlgId,
    digest: Vec<u8>,
}

impl<'a> PolicyDigest<'a> {
    /// # Errors
    ///
    /// Returns `TpmRcBase::Hash` for an unsupported algorithm.
    pub fn new(crypto: &'a dyn CryptoEngine, alg: TpmAlgId) -> Result<Self, TpmRcBase> {
        Ok(Self {
            crypto,
            alg,
            digest: vec![0; require_digest_size(alg)?],
        })
    }

    fn then(mut self, code: TpmCc, args: &[&[u8]]) -> Result<Self, TpmRcBase> {
        extend(self.crypto, self.alg, &mut self.digest, code, args)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// Propagates digest errors.
    pub fn command_code(self, code: TpmCc) -> Result<Self, TpmRcBase> {
        self.then(TpmCc::PolicyCommandCode, &[&(code as u32).to_be_bytes()])
    }

    /// # Errors
    ///
    /// Propagates digest errors.
    pub fn auth_value(self) -> Result<Self, TpmRcBase> {
        self.then(TpmCc::PolicyAuthValue, &[])
    }

    /// `TPM2_PolicyPassword` extends with the `TPM2_PolicyAuthValue` code.
    ///
    /// # Errors
    ///
    /// Propagates digest errors.
    pub fn password(self) -> Result<Self, TpmRcBase> {
        self.auth_value()
    }

    /// # Errors
    ///
    /// Propagates digest errors.
    pub fn locality(self, locality: u8) -> Result<Self, TpmRcBase> {
        self.then(TpmCc::PolicyLocality, &[&[locality]])
    }

    /// # Errors
    ///
    /// Propagates digest errors.
    pub fn cp_hash(self, cp_hash: &[u8]) -> Result<Self, TpmRcBase> {
        self.then(TpmCc::PolicyCpHash, &[cp_hash])
    }

    /// # Errors
    ///
    /// Propagates digest errors.
    pub fn name_hash(self, name_hash: &[u8]) -> Result<Self, TpmRcBase> {
        self.then(TpmCc::PolicyNameHash, &[name_hash])
    }

    /// # Errors
    ///
    /// Propagates digest errors.
    pub fn nv_written(self, written: bool) -> Result<Self, TpmRcBase> {
        self.then(TpmCc::PolicyNvWritten, &[&[u8::from(written)]])
    }

    /// # Errors
    ///
    /// Propagates digest errors.
    pub fn secret(mut self, name: &[u8], policy_ref: &[u8]) -> Result<Self, TpmRcBase> {
        extend_with_name(
            self.crypto,
            self.alg,
            &mut self.digest,
            TpmCc::PolicySecret,
            name,
            policy_ref,
        )?;
        Ok(self)
    }

    /// # Errors
    ///
    /// See [`or`].
    pub fn or(mut self, branches: &[Vec<u8>]) -> Result<Self, TpmRcBase> {
        or(self.crypto, self.alg, &mut self.digest, branches)?;
        Ok(self)
    }

    #[must_use]
    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    #[must_use]
    pub fn into_digest(self) -> Vec<u8> {
        self.digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftwareCrypto;
    use sha2::{Digest, Sha256};

    #[test]
    fn test_command_code_update() {
        let digest = PolicyDigest::new(&SoftwareCrypto, TpmAlgId::Sha256)
            .unwrap()
            .command_code(TpmCc::NvRead)
            .unwrap()
            .into_digest();
        let mut h = Sha256::new();
        h.update([0u8; 32]);
        h.update(0x0000_016Cu32.to_be_bytes());
        h.update(0x0000_014Eu32.to_be_bytes());
        assert_eq!(digest, h.finalize().to_vec());
    }

    #[test]
    fn test_password_matches_auth_value() {
        let a = PolicyDigest::new(&SoftwareCrypto, TpmAlgId::Sha256)
            .unwrap()
            .password()
            .unwrap();
        let b = PolicyDigest::new(&SoftwareCrypto, TpmAlgId::Sha256)
            .unwrap()
            .auth_value()
            .unwrap();
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_or_requires_current_branch() {
        let branch = PolicyDigest::new(&SoftwareCrypto, TpmAlgId::Sha256)
            .unwrap()
            .auth_value()
            .unwrap()
            .into_digest();
        let other = vec![0x11; 32];
        let fresh = PolicyDigest::new(&SoftwareCrypto, TpmAlgId::Sha256).unwrap();
        assert_eq!(
            fresh.clone().or(&[branch.clone(), other.clone()]).map(|_| ()),
            Err(TpmRcBase::Value)
        );
        assert_eq!(fresh.or(&[branch]).map(|_| ()), Err(TpmRcBase::Size));
    }
}
