// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024-2025 Jarkko Sakkinen
// Copyright (c) 2025 Opinsys Oy

//! Command codes, the command attribute table and the request and
//! response containers.

pub mod context;
pub mod hierarchy;
pub mod misc;
pub mod nv;
pub mod object;
pub mod policy;
pub mod sequence;
pub mod session;

use crate::{
    engine::Engine,
    error::{TpmError, TpmRcBase},
    nv::NvAccess,
    util::{Reader, Writer},
};

pub use tpm2_protocol::data::TpmCc;

/// Authorization role required for a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRole {
    /// The handle takes no authorization.
    None,
    User,
    Admin,
}

/// In-flight command state passed to a handler.
pub struct Call<'a> {
    pub code: TpmCc,
    pub handles: &'a [u32],
    pub params: Reader<'a>,
    pub locality: u8,
    pub out_handles: Vec<u32>,
    pub out: Writer,
    /// Entities deleted by the command, whose authorization must no longer
    /// key the response HMAC.
    pub removed: Vec<u32>,
    /// Bind values whose loaded sessions are flushed once the response
    /// area is built.
    pub flush_bound: Vec<Vec<u8>>,
}

impl<'a> Call<'a> {
    #[must_use]
    pub fn new(code: TpmCc, handles: &'a [u32], params: &'a [u8], locality: u8) -> Self {
        Self {
            code,
            handles,
            params: Reader::new(params),
            locality,
            out_handles: Vec::new(),
            out: Writer::new(),
            removed: Vec::new(),
            flush_bound: Vec::new(),
        }
    }

    /// Handle `n`, counting from zero.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Handle` when the handle area is too short.
    pub fn handle(&self, n: usize) -> Result<u32, TpmRcBase> {
        self.handles.get(n).copied().ok_or(TpmRcBase::Handle)
    }
}

pub type Handler = fn(&mut Engine, &mut Call<'_>) -> Result<(), TpmError>;

/// Static attributes of a command.
pub struct CommandAttributes {
    pub code: TpmCc,
    /// One entry per handle in the handle area.
    pub handles: &'static [AuthRole],
    /// Position of the NV index handle and the access class of the command.
    pub nv: Option<(usize, NvAccess)>,
    /// The first command parameter is a `TPM2B` that may be encrypted.
    pub decrypt: bool,
    /// The first response parameter is a `TPM2B` that may be encrypted.
    pub encrypt: bool,
    /// Runs before Startup.
    pub pre_startup: bool,
    pub handler: Handler,
}

impl CommandAttributes {
    /// Number of handles that require an authorization session.
    #[must_use]
    pub fn auth_count(&self) -> usize {
        self.handles
            .iter()
            .filter(|role| **role != AuthRole::None)
            .count()
    }
}

macro_rules! command {
    ($code:ident, [$($role:ident),*], $nv:expr, $decrypt:expr, $encrypt:expr, $handler:path) => {
        CommandAttributes {
            code: TpmCc::$code,
            handles: &[$(AuthRole::$role),*],
            nv: $nv,
            decrypt: $decrypt,
            encrypt: $encrypt,
            pre_startup: false,
            handler: $handler,
        }
    };
}

const NV_READ: Option<(usize, NvAccess)> = Some((1, NvAccess::Read));
const NV_WRITE: Option<(usize, NvAccess)> = Some((1, NvAccess::Write));

/// The command attribute table.
pub static COMMANDS: &[CommandAttributes] = &[
    CommandAttributes {
        code: TpmCc::Startup,
        handles: &[],
        nv: None,
        decrypt: false,
        encrypt: false,
        pre_startup: true,
        handler: misc::startup,
    },
    command!(Shutdown, [], None, false, false, misc::shutdown),
    command!(SelfTest, [], None, false, false, misc::self_test),
    command!(StartAuthSession, [None, None], None, true, true, session::start_auth_session),
    command!(ContextSave, [None], None, false, false, context::context_save),
    command!(ContextLoad, [], None, false, false, context::context_load),
    command!(FlushContext, [], None, false, false, context::flush_context),
    command!(LoadExternal, [], None, true, true, object::load_external),
    command!(CreatePrimary, [User], None, true, true, object::create_primary),
    command!(ReadPublic, [None], None, false, true, object::read_public),
    command!(EvictControl, [User, None], None, false, false, object::evict_control),
    command!(HashSequenceStart, [], None, true, false, sequence::hash_sequence_start),
    command!(HmacStart, [User], None, true, false, sequence::hmac_start),
    command!(SequenceUpdate, [User], None, true, false, sequence::sequence_update),
    command!(SequenceComplete, [User], None, true, true, sequence::sequence_complete),
    command!(NvDefineSpace, [User], None, true, false, nv::define_space),
    command!(NvUndefineSpace, [User, None], Some((1, NvAccess::None)), false, false, nv::undefine_space),
    command!(NvUndefineSpaceSpecial, [Admin, User], Some((0, NvAccess::None)), false, false, nv::undefine_space_special),
    command!(NvWrite, [User, None], NV_WRITE, true, false, nv::write),
    command!(NvIncrement, [User, None], NV_WRITE, false, false, nv::increment),
    command!(NvSetBits, [User, None], NV_WRITE, false, false, nv::set_bits),
    command!(NvExtend, [User, None], NV_WRITE, true, false, nv::extend),
    command!(NvWriteLock, [User, None], NV_WRITE, false, false, nv::write_lock),
    command!(NvGlobalWriteLock, [User], None, false, false, nv::global_write_lock),
    command!(NvRead, [User, None], NV_READ, false, true, nv::read),
    command!(NvReadLock, [User, None], NV_READ, false, false, nv::read_lock),
    command!(NvReadPublic, [None], Some((0, NvAccess::None)), false, true, nv::read_public),
    command!(NvChangeAuth, [Admin], Some((0, NvAccess::None)), true, false, nv::change_auth),
    command!(PolicySecret, [User, None], None, true, true, policy::policy_secret),
    command!(PolicyCommandCode, [None], None, false, false, policy::policy_command_code),
    command!(PolicyCpHash, [None], None, true, false, policy::policy_cp_hash),
    command!(PolicyNameHash, [None], None, true, false, policy::policy_name_hash),
    command!(PolicyAuthValue, [None], None, false, false, policy::policy_auth_value),
    command!(PolicyPassword, [None], None, false, false, policy::policy_password),
    command!(PolicyLocality, [None], None, false, false, policy::policy_locality),
    command!(PolicyNvWritten, [None], None, false, false, policy::policy_nv_written),
    command!(PolicyOR, [None], None, false, false, policy::policy_or),
    command!(PolicyRestart, [None], None, false, false, policy::policy_restart),
    command!(PolicyGetDigest, [None], None, false, true, policy::policy_get_digest),
    command!(HierarchyControl, [User], None, false, false, hierarchy::hierarchy_control),
    command!(HierarchyChangeAuth, [User], None, true, false, hierarchy::hierarchy_change_auth),
    command!(SetPrimaryPolicy, [User], None, true, false, hierarchy::set_primary_policy),
    command!(Clear, [User], None, false, false, hierarchy::clear),
    command!(ClearControl, [User], None, false, false, hierarchy::clear_control),
    command!(DictionaryAttackLockReset, [User], None, false, false, hierarchy::da_lock_reset),
    command!(DictionaryAttackParameters, [User], None, false, false, hierarchy::da_parameters),
];

/// Looks up the attributes of a command.
///
/// # Errors
///
/// Returns `TpmRcBase::CommandCode` for an unimplemented command.
pub fn attributes(code: u32) -> Result<&'static CommandAttributes, TpmRcBase> {
    COMMANDS
        .iter()
        .find(|attrs| attrs.code as u32 == code)
        .ok_or(TpmRcBase::CommandCode)
}

/// A command as handed to [`Engine::execute`].
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub code: u32,
    pub handles: Vec<u32>,
    /// Authorization area without its size field.
    pub auth_area: Vec<u8>,
    pub parameters: Vec<u8>,
    pub locality: u8,
}

impl Request {
    #[must_use]
    pub fn new(code: TpmCc) -> Self {
        Self {
            code: code as u32,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn handle(mut self, handle: u32) -> Self {
        self.handles.push(handle);
        self
    }

    #[must_use]
    pub fn parameters(mut self, parameters: Vec<u8>) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn auth_area(mut self, auth_area: Vec<u8>) -> Self {
        self.auth_area = auth_area;
        self
    }

    #[must_use]
    pub fn locality(mut self, locality: u8) -> Self {
        self.locality = locality;
        self
    }
}

/// A successful response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub handles: Vec<u32>,
    pub parameters: Vec<u8>,
    /// Response authorization area, one entry per command session.
    pub auth_area: Vec<u8>,
}

impl Response {
    /// A reader over the response parameters.
    #[must_use]
    pub fn reader(&self) -> Reader<'_> {
        Reader::new(&self.parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_unique() {
        for (i, a) in COMMANDS.iter().enumerate() {
            assert!(COMMANDS[i + 1..].iter().all(|b| b.code != a.code), "{:?}", a.code);
        }
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(attributes(TpmCc::Create as u32), Err(TpmRcBase::CommandCode)));
        assert!(matches!(attributes(0x0000_0001), Err(TpmRcBase::CommandCode)));
        assert!(attributes(TpmCc::NvWrite as u32).is_ok());
    }

    #[test]
    fn test_auth_count() {
        let attrs = attributes(TpmCc::NvUndefineSpaceSpecial as u32).unwrap();
        assert_eq!(attrs.auth_count(), 2);
        assert_eq!(attributes(TpmCc::ReadPublic as u32).unwrap().auth_count(), 0);
    }
}
