// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Startup, Shutdown and SelfTest.

use crate::{
    command::Call,
    crypto::CryptoEngine,
    engine::Engine,
    error::{TpmError, TpmRcBase, TpmRcExt},
    platform::Platform,
};
use log::{error, info};
use tpm2_protocol::data::{TpmAlgId, TpmSu};

/// `TPM2_Startup`
///
/// # Errors
///
/// See [`Engine::startup`].
pub fn startup(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let startup_type = call.params.get::<TpmSu>().at_parameter(1)?;
    call.params.finish()?;
    engine.startup(startup_type)?;
    Ok(())
}

/// `TPM2_Shutdown`
///
/// # Errors
///
/// Returns `TpmRcBase::Value` for an unknown shutdown type.
pub fn shutdown(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let shutdown_type = call.params.get::<TpmSu>().at_parameter(1)?;
    call.params.finish()?;
    engine.shutdown(shutdown_type)
}

type KnownAnswer = fn(&dyn CryptoEngine) -> Result<bool, TpmRcBase>;

fn sha256_abc(crypto: &dyn CryptoEngine) -> Result<bool, TpmRcBase> {
    let expected = hex_literal("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    Ok(crypto.digest(TpmAlgId::Sha256, &[b"abc"])? == expected)
}

fn hmac_sha256_jefe(crypto: &dyn CryptoEngine) -> Result<bool, TpmRcBase> {
    let expected = hex_literal("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843");
    let mac = crypto.hmac(
        TpmAlgId::Sha256,
        b"Jefe",
        &[b"what do ya want ", b"for nothing?"],
    )?;
    Ok(mac == expected)
}

fn aes128_cfb(crypto: &dyn CryptoEngine) -> Result<bool, TpmRcBase> {
    let key: Vec<u8> = (0u8..16).collect();
    let iv = hex_literal("00112233445566778899aabbccddeeff");
    let mut data = [0u8; 16];
    crypto.cfb_encrypt(&key, &iv, &mut data)?;
    if data[..] != hex_literal("69c4e0d86a7b0430d8cdb78070b4c55a")[..] {
        return Ok(false);
    }
    crypto.cfb_decrypt(&key, &iv, &mut data)?;
    Ok(data == [0u8; 16])
}

fn hex_literal(s: &str) -> Vec<u8> {
    hex::decode(s).unwrap_or_default()
}

/// Known-answer tests in execution order.
pub const KNOWN_ANSWER_TESTS: &[(&str, KnownAnswer)] = &[
    ("SHA-256", sha256_abc),
    ("HMAC-SHA-256", hmac_sha256_jefe),
    ("AES-128-CFB", aes128_cfb),
];

/// Runs the known-answer tests, polling for cancellation between them.
///
/// # Errors
///
/// Returns `TpmRcBase::Canceled` when the platform asks to stop and
/// `TpmRcBase::Failure` when a test does not produce its known answer.
pub fn run_self_test(crypto: &dyn CryptoEngine, platform: &dyn Platform) -> Result<(), TpmRcBase> {
    for (name, test) in KNOWN_ANSWER_TESTS {
        if platform.cancel_requested() {
            info!(target: "tpm2sim::selftest", "canceled before {name}");
            return Err(TpmRcBase::Canceled);
        }
        if !test(crypto)? {
            error!(target: "tpm2sim::selftest", "{name}: known answer mismatch");
            return Err(TpmRcBase::Failure);
        }
    }
    info!(target: "tpm2sim::selftest", "passed");
    Ok(())
}

/// `TPM2_SelfTest`
///
/// # Errors
///
/// See [`run_self_test`]. A failure puts the engine into failure mode.
pub fn self_test(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let _full_test = call.params.u8().at_parameter(1)?;
    call.params.finish()?;
    run_self_test(engine.crypto(), engine.platform.as_ref())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::SoftwareCrypto, platform::SimulatedPlatform};

    struct BrokenCrypto;

    impl CryptoEngine for BrokenCrypto {
        fn digest(&self, alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>, TpmRcBase> {
            let mut out = SoftwareCrypto.digest(alg, parts)?;
            out[0] ^= 1;
            Ok(out)
        }

        fn hmac(&self, alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, TpmRcBase> {
            SoftwareCrypto.hmac(alg, key, parts)
        }

        fn cfb_encrypt(&self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), TpmRcBase> {
            SoftwareCrypto.cfb_encrypt(key, iv, data)
        }

        fn cfb_decrypt(&self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), TpmRcBase> {
            SoftwareCrypto.cfb_decrypt(key, iv, data)
        }

        fn ecc_public(&self, scalar: &[u8]) -> Result<(Vec<u8>, Vec<u8>), TpmRcBase> {
            SoftwareCrypto.ecc_public(scalar)
        }

        fn ecdh(
            &self,
            scalar: &[u8],
            x: &[u8],
            y: &[u8],
        ) -> Result<zeroize::Zeroizing<Vec<u8>>, TpmRcBase> {
            SoftwareCrypto.ecdh(scalar, x, y)
        }

        fn rsa_is_factor(&self, modulus: &[u8], prime: &[u8]) -> Result<bool, TpmRcBase> {
            SoftwareCrypto.rsa_is_factor(modulus, prime)
        }

        fn rsa_public_size(&self, modulus: &[u8], exponent: u32) -> Result<usize, TpmRcBase> {
            SoftwareCrypto.rsa_public_size(modulus, exponent)
        }
    }

    #[test]
    fn test_known_answers() {
        let platform = SimulatedPlatform::new(None, 0);
        assert_eq!(run_self_test(&SoftwareCrypto, &platform), Ok(()));
        assert_eq!(run_self_test(&BrokenCrypto, &platform), Err(TpmRcBase::Failure));
    }

    #[test]
    fn test_cancel() {
        let platform = SimulatedPlatform::new(None, 0);
        platform.control().set_cancel(true);
        assert_eq!(run_self_test(&SoftwareCrypto, &platform), Err(TpmRcBase::Canceled));
    }
}
