// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

#![allow(dead_code)]

use rstest::fixture;
use std::sync::{atomic::AtomicBool, Arc};
use tpm2_protocol::data::{TpmAlgId, TpmSu};
use tpm2sim::{
    client::password_area,
    crypto::SoftwareCrypto,
    handle::TPM_RH_OWNER,
    nv::{NvPublic, TpmaNv},
    object::{PublicArea, PublicParams, TpmaObject, TPM_ECC_NIST_P256},
    platform::{MemoryNv, PlatformControl, SimulatedPlatform},
    util::{Reader, Writer},
    TpmCc, Engine, EngineConfig, Request, Response, TpmError,
};

pub const NV_INDEX: u32 = 0x0100_0001;

pub struct Tpm {
    pub engine: Engine,
    pub clock: PlatformControl,
    pub nv_available: Arc<AtomicBool>,
}

impl Tpm {
    pub fn new(config: EngineConfig) -> Self {
        let platform = SimulatedPlatform::new(None, 0);
        let clock = platform.control();
        let backing = MemoryNv::new(config.nv_memory_size);
        let nv_available = backing.availability();
        let engine = Engine::new(
            config,
            Box::new(platform),
            Box::new(SoftwareCrypto),
            Box::new(backing),
        )
        .expect("engine creation failed");
        let mut tpm = Self {
            engine,
            clock,
            nv_available,
        };
        tpm.startup(TpmSu::Clear).expect("Startup failed");
        tpm
    }

    pub fn startup(&mut self, su: TpmSu) -> Result<Response, TpmError> {
        let su = su as u16;
        self.engine
            .execute(&Request::new(TpmCc::Startup).parameters(su.to_be_bytes().to_vec()))
    }

    pub fn shutdown_state(&mut self) -> Result<Response, TpmError> {
        self.engine.execute(
            &Request::new(TpmCc::Shutdown).parameters((TpmSu::State as u16).to_be_bytes().to_vec()),
        )
    }

    /// Power cycles without an orderly shutdown and runs Startup(CLEAR).
    pub fn reset(&mut self) {
        self.engine.power_cycle().expect("power cycle failed");
        self.startup(TpmSu::Clear).expect("Startup failed");
    }

    pub fn define_nv(&mut self, public: &NvPublic, auth: &[u8]) -> Result<Response, TpmError> {
        let mut w = Writer::new();
        w.tpm2b(auth).unwrap().tpm2b(&public.to_bytes().unwrap()).unwrap();
        self.engine.execute(
            &Request::new(TpmCc::NvDefineSpace)
                .handle(TPM_RH_OWNER)
                .parameters(w.into_vec())
                .auth_area(password_area(b"").unwrap()),
        )
    }

    pub fn nv_write(&mut self, index: u32, auth: &[u8], data: &[u8]) -> Result<Response, TpmError> {
        self.engine.execute(
            &Request::new(TpmCc::NvWrite)
                .handle(index)
                .handle(index)
                .parameters(nv_write_params(data, 0))
                .auth_area(password_area(auth).unwrap()),
        )
    }

    pub fn nv_read(&mut self, index: u32, auth: &[u8], size: u16) -> Result<Vec<u8>, TpmError> {
        let response = self.engine.execute(
            &Request::new(TpmCc::NvRead)
                .handle(index)
                .handle(index)
                .parameters(nv_read_params(size, 0))
                .auth_area(password_area(auth).unwrap()),
        )?;
        Ok(response.reader().tpm2b().expect("malformed NV_Read").to_vec())
    }

    /// The current Name of an index, which changes once it is written.
    pub fn nv_name(&mut self, index: u32) -> Vec<u8> {
        let response = self
            .engine
            .execute(&Request::new(TpmCc::NvReadPublic).handle(index))
            .expect("NV_ReadPublic failed");
        let mut r = response.reader();
        r.tpm2b().expect("malformed public area");
        r.tpm2b().expect("malformed name").to_vec()
    }

    pub fn create_primary(
        &mut self,
        hierarchy: u32,
        template: &PublicArea,
        auth: &[u8],
    ) -> Result<(u32, PublicArea), TpmError> {
        let mut sensitive = Writer::new();
        sensitive.tpm2b(auth).unwrap().tpm2b(&[]).unwrap();
        let mut w = Writer::new();
        w.tpm2b(sensitive.as_slice())
            .unwrap()
            .tpm2b(&template.to_bytes().unwrap())
            .unwrap()
            .tpm2b(&[])
            .unwrap();
        let response = self.engine.execute(
            &Request::new(TpmCc::CreatePrimary)
                .handle(hierarchy)
                .parameters(w.into_vec())
                .auth_area(password_area(b"").unwrap()),
        )?;
        let mut r = response.reader();
        let public = PublicArea::from_bytes(r.tpm2b().expect("malformed public area"))
            .expect("invalid public area");
        Ok((response.handles[0], public))
    }

    pub fn context_save(&mut self, handle: u32) -> Result<Vec<u8>, TpmError> {
        let response = self
            .engine
            .execute(&Request::new(TpmCc::ContextSave).handle(handle))?;
        Ok(response.parameters)
    }

    pub fn context_load(&mut self, context: &[u8]) -> Result<u32, TpmError> {
        let response = self
            .engine
            .execute(&Request::new(TpmCc::ContextLoad).parameters(context.to_vec()))?;
        Ok(response.handles[0])
    }

    pub fn flush(&mut self, handle: u32) -> Result<Response, TpmError> {
        self.engine.execute(
            &Request::new(TpmCc::FlushContext).parameters(handle.to_be_bytes().to_vec()),
        )
    }

    pub fn read_public(&mut self, handle: u32) -> Result<Response, TpmError> {
        self.engine
            .execute(&Request::new(TpmCc::ReadPublic).handle(handle))
    }

    /// Runs a command authorized by a single password.
    pub fn with_password(
        &mut self,
        code: TpmCc,
        handles: &[u32],
        parameters: Vec<u8>,
        auth: &[u8],
    ) -> Result<Response, TpmError> {
        let request = handles
            .iter()
            .fold(Request::new(code), |request, h| request.handle(*h))
            .parameters(parameters)
            .auth_area(password_area(auth).unwrap());
        self.engine.execute(&request)
    }
}

#[fixture]
pub fn tpm() -> Tpm {
    Tpm::new(EngineConfig::default())
}

pub fn nv_public(index: u32, attributes: TpmaNv, data_size: u16) -> NvPublic {
    NvPublic {
        index,
        name_alg: TpmAlgId::Sha256,
        attributes,
        auth_policy: Vec::new(),
        data_size,
    }
}

pub fn nv_write_params(data: &[u8], offset: u16) -> Vec<u8> {
    let mut w = Writer::new();
    w.tpm2b(data).unwrap().u16(offset);
    w.into_vec()
}

pub fn nv_read_params(size: u16, offset: u16) -> Vec<u8> {
    let mut w = Writer::new();
    w.u16(size).u16(offset);
    w.into_vec()
}

pub fn tpm2b(value: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.tpm2b(value).unwrap();
    w.into_vec()
}

pub fn read_tpm2b(response: &Response) -> Vec<u8> {
    let mut r = Reader::new(&response.parameters);
    r.tpm2b().expect("malformed response").to_vec()
}

pub fn keyed_hash_template() -> PublicArea {
    PublicArea {
        name_alg: TpmAlgId::Sha256,
        attributes: TpmaObject::FIXED_TPM
            | TpmaObject::FIXED_PARENT
            | TpmaObject::SENSITIVE_DATA_ORIGIN
            | TpmaObject::USER_WITH_AUTH
            | TpmaObject::SIGN_ENCRYPT,
        auth_policy: Vec::new(),
        params: PublicParams::KeyedHash { unique: Vec::new() },
    }
}

pub fn ecc_decrypt_template() -> PublicArea {
    PublicArea {
        name_alg: TpmAlgId::Sha256,
        attributes: TpmaObject::FIXED_TPM
            | TpmaObject::FIXED_PARENT
            | TpmaObject::SENSITIVE_DATA_ORIGIN
            | TpmaObject::USER_WITH_AUTH
            | TpmaObject::DECRYPT,
        auth_policy: Vec::new(),
        params: PublicParams::Ecc {
            curve: TPM_ECC_NIST_P256,
            x: Vec::new(),
            y: Vec::new(),
        },
    }
}
