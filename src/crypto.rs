// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Cryptographic capability used by the engine.
//!
//! Every primitive the core needs goes through [`CryptoEngine`], so that a
//! hardware backend or a fault-injecting test double can stand in for the
//! RustCrypto implementation in [`SoftwareCrypto`].

use crate::error::TpmRcBase;
use aes::{Aes128, Aes256};
use cipher::{AsyncStreamCipher, KeyIvInit};
use hmac::{Hmac, Mac};
use p256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey};
use rsa::{traits::PublicKeyParts, BigUint, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tpm2_protocol::data::TpmAlgId;
use zeroize::Zeroizing;

pub const KDF_LABEL_ATH: &str = "ATH";
pub const KDF_LABEL_CFB: &str = "CFB";
pub const KDF_LABEL_XOR: &str = "XOR";
pub const KDF_LABEL_CONTEXT: &str = "CONTEXT";
pub const KDF_LABEL_SECRET: &str = "SECRET";
pub const KDF_LABEL_FW_PROOF: &str = "FW PROOF";
pub const KDF_LABEL_SVN_PROOF: &str = "SVN PROOF";
pub const KDF_LABEL_PRIMARY: &str = "PRIMARY";

pub const UNCOMPRESSED_POINT_TAG: u8 = 0x04;
pub const AES_BLOCK_SIZE: usize = 16;
pub const ECC_P256_COORD_SIZE: usize = 32;

/// Maps a raw algorithm identifier to the hash algorithms the engine knows.
#[must_use]
pub fn hash_alg_from_u16(value: u16) -> Option<TpmAlgId> {
    [
        TpmAlgId::Sha1,
        TpmAlgId::Sha256,
        TpmAlgId::Sha384,
        TpmAlgId::Sha512,
    ]
    .into_iter()
    .find(|alg| *alg as u16 == value)
}

/// Returns the digest size of a hash algorithm.
#[must_use]
pub fn digest_size(alg: TpmAlgId) -> Option<usize> {
    match alg {
        TpmAlgId::Sha1 => Some(20),
        TpmAlgId::Sha256 => Some(32),
        TpmAlgId::Sha384 => Some(48),
        TpmAlgId::Sha512 => Some(64),
        _ => None,
    }
}

/// Returns the digest size of a hash algorithm.
///
/// # Errors
///
/// Returns `TpmRcBase::Hash` for anything but a supported hash.
pub fn require_digest_size(alg: TpmAlgId) -> Result<usize, TpmRcBase> {
    digest_size(alg).ok_or(TpmRcBase::Hash)
}

/// Compares two byte strings without an early exit.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Cryptographic services of the engine.
///
/// Only [`digest`](CryptoEngine::digest), [`hmac`](CryptoEngine::hmac) and
/// the primitive-specific methods need an implementation; the key
/// derivation functions are built on top of them.
pub trait CryptoEngine {
    /// Hashes the concatenation of `parts`.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Hash` for an unsupported algorithm, or
    /// `TpmRcBase::Failure` when the backend faults.
    fn digest(&self, alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>, TpmRcBase>;

    /// Computes an HMAC over the concatenation of `parts`.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Hash` for an unsupported algorithm, or
    /// `TpmRcBase::Failure` when the backend faults.
    fn hmac(&self, alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, TpmRcBase>;

    /// AES-CFB encryption in place, key size selected by `key.len()`.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::KeySize` for a key that is neither 128 nor 256 bits.
    fn cfb_encrypt(&self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), TpmRcBase>;

    /// AES-CFB decryption in place.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::KeySize` for a key that is neither 128 nor 256 bits.
    fn cfb_decrypt(&self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), TpmRcBase>;

    /// Derives the NIST P-256 public point of a private scalar.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Key` for an invalid scalar.
    fn ecc_public(&self, scalar: &[u8]) -> Result<(Vec<u8>, Vec<u8>), TpmRcBase>;

    /// Computes the x-coordinate of the ECDH shared point on NIST P-256.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Key` for an invalid scalar, or `TpmRcBase::Value` when
    /// the peer point is not on the curve.
    fn ecdh(&self, scalar: &[u8], x: &[u8], y: &[u8]) -> Result<Zeroizing<Vec<u8>>, TpmRcBase>;

    /// Checks that `prime` is a non-trivial factor of the RSA `modulus`.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Failure` when the backend faults.
    fn rsa_is_factor(&self, modulus: &[u8], prime: &[u8]) -> Result<bool, TpmRcBase>;

    /// Validates an RSA public key and returns its modulus size in bytes.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Key` when the key is rejected.
    fn rsa_public_size(&self, modulus: &[u8], exponent: u32) -> Result<usize, TpmRcBase>;

    /// Verifies an HMAC in constant time.
    ///
    /// # Errors
    ///
    /// Propagates backend errors of [`hmac`](CryptoEngine::hmac).
    fn hmac_verify(
        &self,
        alg: TpmAlgId,
        key: &[u8],
        parts: &[&[u8]],
        expected: &[u8],
    ) -> Result<bool, TpmRcBase> {
        let actual = self.hmac(alg, key, parts)?;
        Ok(constant_time_eq(&actual, expected))
    }

    /// SP800-108 counter-mode KDF with HMAC (TPM KDFa).
    ///
    /// # Errors
    ///
    /// Propagates backend errors of [`hmac`](CryptoEngine::hmac).
    fn kdfa(
        &self,
        alg: TpmAlgId,
        key: &[u8],
        label: &str,
        context_u: &[u8],
        context_v: &[u8],
        bits: u32,
    ) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
        let bytes = bits.div_ceil(8) as usize;
        let bits_be = bits.to_be_bytes();
        let mut out = Zeroizing::new(Vec::with_capacity(bytes + 64));
        let mut counter: u32 = 1;
        while out.len() < bytes {
            let block = Zeroizing::new(self.hmac(
                alg,
                key,
                &[
                    &counter.to_be_bytes(),
                    label.as_bytes(),
                    &[0],
                    context_u,
                    context_v,
                    &bits_be,
                ],
            )?);
            out.extend_from_slice(&block);
            counter = counter.checked_add(1).ok_or(TpmRcBase::Failure)?;
        }
        out.truncate(bytes);
        if bits % 8 != 0 {
            out[0] &= (1u8 << (bits % 8)) - 1;
        }
        Ok(out)
    }

    /// SP800-56A concatenation KDF (TPM KDFe).
    ///
    /// # Errors
    ///
    /// Propagates backend errors of [`digest`](CryptoEngine::digest).
    fn kdfe(
        &self,
        alg: TpmAlgId,
        z: &[u8],
        label: &str,
        party_u: &[u8],
        party_v: &[u8],
        bits: u32,
    ) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
        let bytes = bits.div_ceil(8) as usize;
        let mut out = Zeroizing::new(Vec::with_capacity(bytes + 64));
        let mut counter: u32 = 1;
        while out.len() < bytes {
            let block = Zeroizing::new(self.digest(
                alg,
                &[
                    &counter.to_be_bytes(),
                    z,
                    label.as_bytes(),
                    &[0],
                    party_u,
                    party_v,
                ],
            )?);
            out.extend_from_slice(&block);
            counter = counter.checked_add(1).ok_or(TpmRcBase::Failure)?;
        }
        out.truncate(bytes);
        Ok(out)
    }

    /// Computes a TPM Name: the algorithm identifier followed by the digest.
    ///
    /// # Errors
    ///
    /// Propagates backend errors of [`digest`](CryptoEngine::digest).
    fn make_name(&self, alg: TpmAlgId, public: &[u8]) -> Result<Vec<u8>, TpmRcBase> {
        let digest = self.digest(alg, &[public])?;
        let mut name = Vec::with_capacity(2 + digest.len());
        name.extend_from_slice(&(alg as u16).to_be_bytes());
        name.extend_from_slice(&digest);
        Ok(name)
    }
}

/// RustCrypto implementation of [`CryptoEngine`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareCrypto;

impl CryptoEngine for SoftwareCrypto {
    fn digest(&self, alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>, TpmRcBase> {
        macro_rules! do_digest {
            ($digest:ty) => {{
                let mut hasher = <$digest as Digest>::new();
                for part in parts {
                    hasher.update(part);
                }
                Ok(hasher.finalize().to_vec())
            }};
        }

        match alg {
            TpmAlgId::Sha1 => do_digest!(Sha1),
            TpmAlgId::Sha256 => do_digest!(Sha256),
            TpmAlgId::Sha384 => do_digest!(Sha384),
            TpmAlgId::Sha512 => do_digest!(Sha512),
            _ => Err(TpmRcBase::Hash),
        }
    }

    fn hmac(&self, alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, TpmRcBase> {
        macro_rules! do_hmac {
            ($digest:ty) => {{
                let mut mac = <Hmac<$digest> as Mac>::new_from_slice(key)
                    .map_err(|_| TpmRcBase::Failure)?;
                for part in parts {
                    mac.update(part);
                }
                Ok(mac.finalize().into_bytes().to_vec())
            }};
        }

        match alg {
            TpmAlgId::Sha1 => do_hmac!(Sha1),
            TpmAlgId::Sha256 => do_hmac!(Sha256),
            TpmAlgId::Sha384 => do_hmac!(Sha384),
            TpmAlgId::Sha512 => do_hmac!(Sha512),
            _ => Err(TpmRcBase::Hash),
        }
    }

    fn cfb_encrypt(&self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), TpmRcBase> {
        match key.len() {
            16 => cfb_mode::Encryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|_| TpmRcBase::KeySize)?
                .encrypt(data),
            32 => cfb_mode::Encryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|_| TpmRcBase::KeySize)?
                .encrypt(data),
            _ => return Err(TpmRcBase::KeySize),
        }
        Ok(())
    }

    fn cfb_decrypt(&self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), TpmRcBase> {
        match key.len() {
            16 => cfb_mode::Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(|_| TpmRcBase::KeySize)?
                .decrypt(data),
            32 => cfb_mode::Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(|_| TpmRcBase::KeySize)?
                .decrypt(data),
            _ => return Err(TpmRcBase::KeySize),
        }
        Ok(())
    }

    fn ecc_public(&self, scalar: &[u8]) -> Result<(Vec<u8>, Vec<u8>), TpmRcBase> {
        let secret = SecretKey::from_slice(scalar).map_err(|_| TpmRcBase::Key)?;
        let point = secret.public_key().to_encoded_point(false);
        let x = point.x().ok_or(TpmRcBase::Key)?;
        let y = point.y().ok_or(TpmRcBase::Key)?;
        Ok((x.to_vec(), y.to_vec()))
    }

    fn ecdh(&self, scalar: &[u8], x: &[u8], y: &[u8]) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
        let secret = SecretKey::from_slice(scalar).map_err(|_| TpmRcBase::Key)?;
        let peer = ecc_point_from_coordinates(x, y)?;
        let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
        Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
    }

    fn rsa_is_factor(&self, modulus: &[u8], prime: &[u8]) -> Result<bool, TpmRcBase> {
        let n = BigUint::from_bytes_be(modulus);
        let p = BigUint::from_bytes_be(prime);
        if p.bits() < 2 || p >= n {
            return Ok(false);
        }
        Ok((&n % &p).bits() == 0)
    }

    fn rsa_public_size(&self, modulus: &[u8], exponent: u32) -> Result<usize, TpmRcBase> {
        let exponent = if exponent == 0 { 65537 } else { exponent };
        let key = RsaPublicKey::new(
            BigUint::from_bytes_be(modulus),
            BigUint::from_bytes_be(&exponent.to_be_bytes()),
        )
        .map_err(|_| TpmRcBase::Key)?;
        Ok(key.size())
    }
}

/// Builds a P-256 public key from affine coordinates.
///
/// # Errors
///
/// Returns `TpmRcBase::Value` when the point is not on the curve.
pub fn ecc_point_from_coordinates(x: &[u8], y: &[u8]) -> Result<PublicKey, TpmRcBase> {
    if x.len() != ECC_P256_COORD_SIZE || y.len() != ECC_P256_COORD_SIZE {
        return Err(TpmRcBase::Value);
    }
    let mut sec1 = Vec::with_capacity(1 + 2 * ECC_P256_COORD_SIZE);
    sec1.push(UNCOMPRESSED_POINT_TAG);
    sec1.extend_from_slice(x);
    sec1.extend_from_slice(y);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| TpmRcBase::Value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_answer() {
        let digest = SoftwareCrypto.digest(TpmAlgId::Sha256, &[b"a", b"bc"]).unwrap();
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_kdfa_length_and_determinism() {
        let a = SoftwareCrypto
            .kdfa(TpmAlgId::Sha256, b"key", KDF_LABEL_CFB, b"u", b"v", 384)
            .unwrap();
        let b = SoftwareCrypto
            .kdfa(TpmAlgId::Sha256, b"key", KDF_LABEL_CFB, b"u", b"v", 384)
            .unwrap();
        let c = SoftwareCrypto
            .kdfa(TpmAlgId::Sha256, b"key", KDF_LABEL_XOR, b"u", b"v", 384)
            .unwrap();
        assert_eq!(a.len(), 48);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_cfb_inverse() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let mut data = b"parameter encryption".to_vec();
        SoftwareCrypto.cfb_encrypt(&key, &iv, &mut data).unwrap();
        assert_ne!(&data, b"parameter encryption");
        SoftwareCrypto.cfb_decrypt(&key, &iv, &mut data).unwrap();
        assert_eq!(&data, b"parameter encryption");
    }

    #[test]
    fn test_ecdh_agreement() {
        let a = [0x11u8; 32];
        let b = [0x22u8; 32];
        let (ax, ay) = SoftwareCrypto.ecc_public(&a).unwrap();
        let (bx, by) = SoftwareCrypto.ecc_public(&b).unwrap();
        let z1 = SoftwareCrypto.ecdh(&a, &bx, &by).unwrap();
        let z2 = SoftwareCrypto.ecdh(&b, &ax, &ay).unwrap();
        assert_eq!(z1, z2);
    }

    #[test]
    fn test_rsa_factor() {
        assert!(SoftwareCrypto.rsa_is_factor(&[0x8F], &[0x0B]).unwrap());
        assert!(!SoftwareCrypto.rsa_is_factor(&[0x8F], &[0x07]).unwrap());
        assert!(!SoftwareCrypto.rsa_is_factor(&[0x8F], &[0x01]).unwrap());
    }
}
