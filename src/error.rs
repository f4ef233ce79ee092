// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use std::{io::Error as IoError, num::ParseIntError};
use thiserror::Error;
use tpm2_protocol::{
    data::{TpmRc, TPM_RC_FMT1, TPM_RC_N_SHIFT, TPM_RC_P_BIT},
    TpmErrorKind,
};

pub use tpm2_protocol::data::{TpmRcBase, TpmRcIndex};

/// Offset of the session number in the N field of a format-one code.
const RC_SESSION_OFFSET: u8 = 8;

/// A response code with the handle, parameter or session it refers to.
///
/// The location is kept only for format-one codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{rc}{}", .location.map(|l| format!(" ({l})")).unwrap_or_default())]
pub struct TpmError {
    pub rc: TpmRcBase,
    pub location: Option<TpmRcIndex>,
}

impl TpmError {
    #[must_use]
    pub fn new(rc: TpmRcBase, location: Option<TpmRcIndex>) -> Self {
        let location = if rc as u32 & TPM_RC_FMT1 != 0 {
            location
        } else {
            None
        };
        Self { rc, location }
    }

    /// Returns the 32-bit response code as it appears on the wire.
    #[must_use]
    pub fn code(&self) -> u32 {
        let base = self.rc as u32;
        match self.location {
            None => base,
            Some(TpmRcIndex::Handle(n)) => base | (u32::from(n & 0x7) << TPM_RC_N_SHIFT),
            Some(TpmRcIndex::Parameter(n)) => {
                base | TPM_RC_P_BIT | (u32::from(n & 0xF) << TPM_RC_N_SHIFT)
            }
            Some(TpmRcIndex::Session(n)) => {
                base | (u32::from((n & 0x7) + RC_SESSION_OFFSET) << TPM_RC_N_SHIFT)
            }
        }
    }
}

impl From<TpmRcBase> for TpmError {
    fn from(rc: TpmRcBase) -> Self {
        Self { rc, location: None }
    }
}

impl From<TpmError> for TpmRc {
    fn from(err: TpmError) -> Self {
        TpmRc::try_from(err.code()).unwrap_or_else(|_| TpmRc::from(err.rc))
    }
}

impl PartialEq<TpmRcBase> for TpmError {
    fn eq(&self, other: &TpmRcBase) -> bool {
        self.rc == *other
    }
}

/// Attaches a location to a response code or to the error of a
/// `Result<_, TpmRcBase>`.
pub trait TpmRcExt {
    type Output;

    /// Qualifies with a one-based handle number.
    fn at_handle(self, n: u8) -> Self::Output;

    /// Qualifies with a one-based parameter number.
    fn at_parameter(self, n: u8) -> Self::Output;

    /// Qualifies with a one-based session number.
    fn at_session(self, n: u8) -> Self::Output;
}

impl TpmRcExt for TpmRcBase {
    type Output = TpmError;

    fn at_handle(self, n: u8) -> TpmError {
        TpmError::new(self, Some(TpmRcIndex::Handle(n)))
    }

    fn at_parameter(self, n: u8) -> TpmError {
        TpmError::new(self, Some(TpmRcIndex::Parameter(n)))
    }

    fn at_session(self, n: u8) -> TpmError {
        TpmError::new(self, Some(TpmRcIndex::Session(n)))
    }
}

impl<T> TpmRcExt for Result<T, TpmRcBase> {
    type Output = Result<T, TpmError>;

    fn at_handle(self, n: u8) -> Self::Output {
        self.map_err(|rc| rc.at_handle(n))
    }

    fn at_parameter(self, n: u8) -> Self::Output {
        self.map_err(|rc| rc.at_parameter(n))
    }

    fn at_session(self, n: u8) -> Self::Output {
        self.map_err(|rc| rc.at_session(n))
    }
}

/// Converts `TpmErrorKind` to `TpmRcBase`.
pub trait TpmErrorKindExt {
    fn to_tpm_rc(self) -> TpmRcBase;
}

impl TpmErrorKindExt for TpmErrorKind {
    fn to_tpm_rc(self) -> TpmRcBase {
        match self {
            TpmErrorKind::InvalidValue | TpmErrorKind::NotDiscriminant(..) => TpmRcBase::Value,
            TpmErrorKind::Capacity(..)
            | TpmErrorKind::Underflow
            | TpmErrorKind::TrailingData => TpmRcBase::Size,
            TpmErrorKind::Failure => TpmRcBase::Failure,
        }
    }
}

/// Errors of the caller-side helpers in [`crate::client`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Tpm(#[from] TpmError),

    #[error("session {0}: response HMAC does not verify")]
    ResponseHmac(usize),

    #[error("malformed response: {0}")]
    Malformed(TpmRcBase),
}

impl From<TpmRcBase> for ClientError {
    fn from(rc: TpmRcBase) -> Self {
        ClientError::Tpm(rc.into())
    }
}

/// Errors of the command-line front-end.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("'{0}': {1}")]
    File(String, #[source] IoError),

    #[error("I/O: {0}")]
    Io(#[from] IoError),

    #[error("Integer: {0}")]
    Int(#[from] ParseIntError),

    #[error("Arguments: {0}")]
    Lexopt(#[from] lexopt::Error),

    #[error("{0}")]
    Tpm(#[from] TpmError),

    #[error("Usage: {0}")]
    Usage(String),

    #[error("help displayed")]
    HelpDisplayed,
}

impl From<TpmRcBase> for CliError {
    fn from(rc: TpmRcBase) -> Self {
        CliError::Tpm(rc.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_encoding() {
        assert_eq!(TpmRcBase::AuthFail.at_session(1).code(), 0x98E);
        assert_eq!(TpmRcBase::Value.at_parameter(2).code(), 0x2C4);
        assert_eq!(TpmRcBase::Handle.at_handle(1).code(), 0x18B);
        assert_eq!(TpmRcBase::Lockout.at_session(1).code(), 0x921);
        assert_eq!(TpmError::from(TpmRcBase::NvLocked).code(), 0x148);
    }

    #[test]
    fn test_location_decodes() {
        let rc = TpmRc::from(TpmRcBase::AuthFail.at_session(2));
        assert_eq!(rc.base(), TpmRcBase::AuthFail);
        assert_eq!(rc.index(), Some(TpmRcIndex::Session(2)));
        let rc = TpmRc::from(TpmRcBase::Size.at_parameter(3));
        assert_eq!(rc.index(), Some(TpmRcIndex::Parameter(3)));
    }
}
