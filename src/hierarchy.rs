// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Hierarchy proofs, primary seeds, authorization values and enables.

use crate::{
    crypto::{CryptoEngine, KDF_LABEL_FW_PROOF, KDF_LABEL_SVN_PROOF},
    error::TpmRcBase,
    handle::{
        Hierarchy, ProofSelector, TPM_RH_ENDORSEMENT, TPM_RH_LOCKOUT, TPM_RH_OWNER,
        TPM_RH_PLATFORM,
    },
    platform::Platform,
    util::{Reader, Writer},
};
use log::info;
use tpm2_protocol::data::TpmAlgId;
use zeroize::Zeroizing;

/// Size of proofs and seeds in bytes.
pub const PROOF_SIZE: usize = 32;

/// Hash algorithm of proof and seed derivations.
pub const PROOF_HASH: TpmAlgId = TpmAlgId::Sha256;

/// Seed and proof of one hierarchy.
#[derive(Clone)]
pub struct HierarchySecrets {
    pub seed: Zeroizing<Vec<u8>>,
    pub proof: Zeroizing<Vec<u8>>,
}

impl HierarchySecrets {
    fn generate(platform: &mut dyn Platform) -> Self {
        let mut seed = Zeroizing::new(vec![0u8; PROOF_SIZE]);
        let mut proof = Zeroizing::new(vec![0u8; PROOF_SIZE]);
        platform.random(&mut seed);
        platform.random(&mut proof);
        Self { seed, proof }
    }
}

/// Policy digest with its hash algorithm. An empty digest never matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPolicy {
    pub digest: Vec<u8>,
    pub alg: TpmAlgId,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            digest: Vec::new(),
            alg: TpmAlgId::Null,
        }
    }
}

/// State of the four hierarchies and the lockout authorization.
#[derive(Clone)]
pub struct HierarchyState {
    pub platform: HierarchySecrets,
    pub owner: HierarchySecrets,
    pub endorsement: HierarchySecrets,
    pub null: HierarchySecrets,
    pub owner_auth: Zeroizing<Vec<u8>>,
    pub endorsement_auth: Zeroizing<Vec<u8>>,
    pub lockout_auth: Zeroizing<Vec<u8>>,
    pub platform_auth: Zeroizing<Vec<u8>>,
    pub owner_policy: AuthPolicy,
    pub endorsement_policy: AuthPolicy,
    pub lockout_policy: AuthPolicy,
    pub platform_policy: AuthPolicy,
    pub ph_enable: bool,
    pub sh_enable: bool,
    pub eh_enable: bool,
    pub ph_enable_nv: bool,
    pub disable_clear: bool,
}

impl HierarchyState {
    /// Generates a fresh set of seeds and proofs with empty authorizations.
    pub fn manufacture(platform: &mut dyn Platform) -> Self {
        Self {
            platform: HierarchySecrets::generate(platform),
            owner: HierarchySecrets::generate(platform),
            endorsement: HierarchySecrets::generate(platform),
            null: HierarchySecrets::generate(platform),
            owner_auth: Zeroizing::default(),
            endorsement_auth: Zeroizing::default(),
            lockout_auth: Zeroizing::default(),
            platform_auth: Zeroizing::default(),
            owner_policy: AuthPolicy::default(),
            endorsement_policy: AuthPolicy::default(),
            lockout_policy: AuthPolicy::default(),
            platform_policy: AuthPolicy::default(),
            ph_enable: true,
            sh_enable: true,
            eh_enable: true,
            ph_enable_nv: true,
            disable_clear: false,
        }
    }

    fn secrets(&self, hierarchy: Hierarchy) -> &HierarchySecrets {
        match hierarchy {
            Hierarchy::Platform => &self.platform,
            Hierarchy::Owner => &self.owner,
            Hierarchy::Endorsement => &self.endorsement,
            Hierarchy::Null => &self.null,
        }
    }

    #[must_use]
    pub fn is_enabled(&self, hierarchy: Hierarchy) -> bool {
        match hierarchy {
            Hierarchy::Platform => self.ph_enable,
            Hierarchy::Owner => self.sh_enable,
            Hierarchy::Endorsement => self.eh_enable,
            Hierarchy::Null => true,
        }
    }

    fn limited(
        &self,
        base: &[u8],
        selector: ProofSelector,
        platform: &dyn Platform,
        crypto: &dyn CryptoEngine,
    ) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
        let bits = u32::try_from(PROOF_SIZE * 8).map_err(|_| TpmRcBase::Failure)?;
        match selector {
            ProofSelector::Base(_) => Ok(Zeroizing::new(base.to_vec())),
            ProofSelector::Firmware(_) => {
                let secret = platform.firmware_secret().ok_or(TpmRcBase::FwLimited)?;
                crypto.kdfa(PROOF_HASH, base, KDF_LABEL_FW_PROOF, &secret, &[], bits)
            }
            ProofSelector::Svn(_, svn) => {
                let secret = platform.svn_secret(svn).ok_or(TpmRcBase::SvnLimited)?;
                crypto.kdfa(
                    PROOF_HASH,
                    base,
                    KDF_LABEL_SVN_PROOF,
                    &secret,
                    &svn.to_be_bytes(),
                    bits,
                )
            }
        }
    }

    /// Returns the proof selected by `selector`.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::FwLimited` or `TpmRcBase::SvnLimited` when the platform
    /// cannot supply the secret of a limited selector.
    pub fn proof(
        &self,
        selector: ProofSelector,
        platform: &dyn Platform,
        crypto: &dyn CryptoEngine,
    ) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
        let base = &self.secrets(selector.hierarchy()).proof;
        self.limited(base, selector, platform, crypto)
    }

    /// Returns the primary seed selected by `selector`.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::FwLimited` or `TpmRcBase::SvnLimited` when the platform
    /// cannot supply the secret of a limited selector.
    pub fn seed(
        &self,
        selector: ProofSelector,
        platform: &dyn Platform,
        crypto: &dyn CryptoEngine,
    ) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
        let base = &self.secrets(selector.hierarchy()).seed;
        self.limited(base, selector, platform, crypto)
    }

    /// Authorization value of a permanent handle.
    #[must_use]
    pub fn auth(&self, handle: u32) -> Option<&[u8]> {
        match handle {
            TPM_RH_OWNER => Some(self.owner_auth.as_slice()),
            TPM_RH_ENDORSEMENT => Some(self.endorsement_auth.as_slice()),
            TPM_RH_PLATFORM => Some(self.platform_auth.as_slice()),
            TPM_RH_LOCKOUT => Some(self.lockout_auth.as_slice()),
            _ => None,
        }
    }

    /// Authorization value slot of a permanent handle.
    pub fn auth_mut(&mut self, handle: u32) -> Option<&mut Zeroizing<Vec<u8>>> {
        match handle {
            TPM_RH_OWNER => Some(&mut self.owner_auth),
            TPM_RH_ENDORSEMENT => Some(&mut self.endorsement_auth),
            TPM_RH_PLATFORM => Some(&mut self.platform_auth),
            TPM_RH_LOCKOUT => Some(&mut self.lockout_auth),
            _ => None,
        }
    }

    #[must_use]
    pub fn policy(&self, handle: u32) -> Option<&AuthPolicy> {
        match handle {
            TPM_RH_OWNER => Some(&self.owner_policy),
            TPM_RH_ENDORSEMENT => Some(&self.endorsement_policy),
            TPM_RH_PLATFORM => Some(&self.platform_policy),
            TPM_RH_LOCKOUT => Some(&self.lockout_policy),
            _ => None,
        }
    }

    pub fn policy_mut(&mut self, handle: u32) -> Option<&mut AuthPolicy> {
        match handle {
            TPM_RH_OWNER => Some(&mut self.owner_policy),
            TPM_RH_ENDORSEMENT => Some(&mut self.endorsement_policy),
            TPM_RH_PLATFORM => Some(&mut self.platform_policy),
            TPM_RH_LOCKOUT => Some(&mut self.lockout_policy),
            _ => None,
        }
    }

    /// TPM Reset: the null hierarchy gets a new seed and proof.
    pub fn reset_null(&mut self, platform: &mut dyn Platform) {
        self.null = HierarchySecrets::generate(platform);
    }

    /// Startup(CLEAR): enables come back and platform authorization is
    /// emptied.
    pub fn startup_clear(&mut self) {
        self.ph_enable = true;
        self.sh_enable = true;
        self.eh_enable = true;
        self.ph_enable_nv = true;
        self.platform_auth = Zeroizing::default();
        self.platform_policy = AuthPolicy::default();
    }

    /// `TPM2_Clear`: rotates the owner seed and the owner and endorsement
    /// proofs, and empties the owner, endorsement and lockout
    /// authorizations.
    pub fn clear(&mut self, platform: &mut dyn Platform) {
        let owner = HierarchySecrets::generate(platform);
        let endorsement = HierarchySecrets::generate(platform);
        self.owner = owner;
        self.endorsement.proof = endorsement.proof;
        self.owner_auth = Zeroizing::default();
        self.endorsement_auth = Zeroizing::default();
        self.lockout_auth = Zeroizing::default();
        self.owner_policy = AuthPolicy::default();
        self.endorsement_policy = AuthPolicy::default();
        self.lockout_policy = AuthPolicy::default();
        self.sh_enable = true;
        self.eh_enable = true;
        info!(target: "tpm2sim::hierarchy", "owner and endorsement proofs rotated");
    }

    pub(crate) fn write_to(&self, w: &mut Writer) -> Result<(), TpmRcBase> {
        for secrets in [&self.platform, &self.owner, &self.endorsement, &self.null] {
            w.tpm2b(&secrets.seed)?.tpm2b(&secrets.proof)?;
        }
        for auth in [
            &self.owner_auth,
            &self.endorsement_auth,
            &self.lockout_auth,
            &self.platform_auth,
        ] {
            w.tpm2b(auth)?;
        }
        for policy in [
            &self.owner_policy,
            &self.endorsement_policy,
            &self.lockout_policy,
            &self.platform_policy,
        ] {
            w.tpm2b(&policy.digest)?.u16(policy.alg as u16);
        }
        let flags = [
            self.ph_enable,
            self.sh_enable,
            self.eh_enable,
            self.ph_enable_nv,
            self.disable_clear,
        ]
        .iter()
        .enumerate()
        .fold(0u8, |acc, (i, set)| acc | (u8::from(*set) << i));
        w.u8(flags);
        Ok(())
    }

    pub(crate) fn read_from(r: &mut Reader<'_>) -> Result<Self, TpmRcBase> {
        fn secrets(r: &mut Reader<'_>) -> Result<HierarchySecrets, TpmRcBase> {
            Ok(HierarchySecrets {
                seed: Zeroizing::new(r.tpm2b()?.to_vec()),
                proof: Zeroizing::new(r.tpm2b()?.to_vec()),
            })
        }
        fn auth(r: &mut Reader<'_>) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
            Ok(Zeroizing::new(r.tpm2b()?.to_vec()))
        }
        fn policy(r: &mut Reader<'_>) -> Result<AuthPolicy, TpmRcBase> {
            let digest = r.tpm2b()?.to_vec();
            let raw = r.u16()?;
            let alg = crate::crypto::hash_alg_from_u16(raw).unwrap_or(TpmAlgId::Null);
            Ok(AuthPolicy { digest, alg })
        }

        let platform = secrets(r)?;
        let owner = secrets(r)?;
        let endorsement = secrets(r)?;
        let null = secrets(r)?;
        let owner_auth = auth(r)?;
        let endorsement_auth = auth(r)?;
        let lockout_auth = auth(r)?;
        let platform_auth = auth(r)?;
        let owner_policy = policy(r)?;
        let endorsement_policy = policy(r)?;
        let lockout_policy = policy(r)?;
        let platform_policy = policy(r)?;
        let flags = r.u8()?;
        let bit = |i: u8| flags & (1 << i) != 0;
        Ok(Self {
            platform,
            owner,
            endorsement,
            null,
            owner_auth,
            endorsement_auth,
            lockout_auth,
            platform_auth,
            owner_policy,
            endorsement_policy,
            lockout_policy,
            platform_policy,
            ph_enable: bit(0),
            sh_enable: bit(1),
            eh_enable: bit(2),
            ph_enable_nv: bit(3),
            disable_clear: bit(4),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::SoftwareCrypto, platform::SimulatedPlatform};

    #[test]
    fn test_limited_proofs() {
        let mut platform = SimulatedPlatform::new(Some(vec![0xAA; 32]), 2);
        let state = HierarchyState::manufacture(&mut platform);
        let base = state
            .proof(ProofSelector::Base(Hierarchy::Owner), &platform, &SoftwareCrypto)
            .unwrap();
        let fw = state
            .proof(ProofSelector::Firmware(Hierarchy::Owner), &platform, &SoftwareCrypto)
            .unwrap();
        assert_ne!(base, fw);
        assert_eq!(
            state
                .proof(ProofSelector::Svn(Hierarchy::Owner, 3), &platform, &SoftwareCrypto)
                .err(),
            Some(TpmRcBase::SvnLimited)
        );

        let no_firmware = SimulatedPlatform::new(None, 0);
        assert_eq!(
            state
                .proof(ProofSelector::Firmware(Hierarchy::Null), &no_firmware, &SoftwareCrypto)
                .err(),
            Some(TpmRcBase::FwLimited)
        );
    }

    #[test]
    fn test_clear_rotates_owner() {
        let mut platform = SimulatedPlatform::new(None, 0);
        let mut state = HierarchyState::manufacture(&mut platform);
        state.owner_auth = Zeroizing::new(b"owner".to_vec());
        let before = state.owner.proof.clone();
        let platform_proof = state.platform.proof.clone();
        state.clear(&mut platform);
        assert_ne!(before, state.owner.proof);
        assert_eq!(platform_proof, state.platform.proof);
        assert!(state.owner_auth.is_empty());
    }
}
