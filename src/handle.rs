// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Handle ranges, permanent handles and hierarchy selectors.

pub const HR_SHIFT: u32 = 24;
pub const HR_HANDLE_MASK: u32 = 0x00FF_FFFF;

pub const PCR_FIRST: u32 = 0x0000_0000;
pub const NV_INDEX_FIRST: u32 = 0x0100_0000;
pub const HMAC_SESSION_FIRST: u32 = 0x0200_0000;
pub const POLICY_SESSION_FIRST: u32 = 0x0300_0000;
pub const TRANSIENT_FIRST: u32 = 0x8000_0000;
pub const PERSISTENT_FIRST: u32 = 0x8100_0000;
pub const PLATFORM_PERSISTENT: u32 = 0x8180_0000;
pub const PERSISTENT_LAST: u32 = 0x81FF_FFFF;

pub const TPM_RH_OWNER: u32 = 0x4000_0001;
pub const TPM_RH_NULL: u32 = 0x4000_0007;
pub const TPM_RS_PW: u32 = 0x4000_0009;
pub const TPM_RH_LOCKOUT: u32 = 0x4000_000A;
pub const TPM_RH_ENDORSEMENT: u32 = 0x4000_000B;
pub const TPM_RH_PLATFORM: u32 = 0x4000_000C;
pub const TPM_RH_PLATFORM_NV: u32 = 0x4000_000D;

pub const TPM_RH_FW_OWNER: u32 = 0x4000_0140;
pub const TPM_RH_FW_ENDORSEMENT: u32 = 0x4000_0141;
pub const TPM_RH_FW_PLATFORM: u32 = 0x4000_0142;
pub const TPM_RH_FW_NULL: u32 = 0x4000_0143;

pub const TPM_RH_SVN_OWNER_BASE: u32 = 0x4001_0000;
pub const TPM_RH_SVN_ENDORSEMENT_BASE: u32 = 0x4002_0000;
pub const TPM_RH_SVN_PLATFORM_BASE: u32 = 0x4003_0000;
pub const TPM_RH_SVN_NULL_BASE: u32 = 0x4004_0000;

/// Saved handle of an ordinary transient object context.
pub const CONTEXT_OBJECT: u32 = 0x8000_0000;
/// Saved handle of a sequence object context.
pub const CONTEXT_SEQUENCE: u32 = 0x8000_0001;
/// Saved handle of an stClear object context, bound to `clearCount`.
pub const CONTEXT_ST_CLEAR: u32 = 0x8000_0002;

/// Handle type selected by the most significant octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    Pcr,
    NvIndex,
    HmacSession,
    PolicySession,
    Permanent,
    Transient,
    Persistent,
}

impl HandleType {
    #[must_use]
    pub fn of(handle: u32) -> Option<Self> {
        match handle >> HR_SHIFT {
            0x00 => Some(Self::Pcr),
            0x01 => Some(Self::NvIndex),
            0x02 => Some(Self::HmacSession),
            0x03 => Some(Self::PolicySession),
            0x40 => Some(Self::Permanent),
            0x80 => Some(Self::Transient),
            0x81 => Some(Self::Persistent),
            _ => None,
        }
    }
}

#[must_use]
pub fn is_session(handle: u32) -> bool {
    matches!(
        HandleType::of(handle),
        Some(HandleType::HmacSession | HandleType::PolicySession)
    )
}

/// One of the four TPM hierarchies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hierarchy {
    Platform,
    Owner,
    Endorsement,
    Null,
}

impl Hierarchy {
    pub const ALL: [Hierarchy; 4] = [
        Hierarchy::Platform,
        Hierarchy::Owner,
        Hierarchy::Endorsement,
        Hierarchy::Null,
    ];

    #[must_use]
    pub fn handle(self) -> u32 {
        match self {
            Hierarchy::Platform => TPM_RH_PLATFORM,
            Hierarchy::Owner => TPM_RH_OWNER,
            Hierarchy::Endorsement => TPM_RH_ENDORSEMENT,
            Hierarchy::Null => TPM_RH_NULL,
        }
    }

    /// Resolves a hierarchy handle, including firmware- and SVN-limited
    /// variants, to its base hierarchy.
    #[must_use]
    pub fn from_handle(handle: u32) -> Option<Self> {
        ProofSelector::from_handle(handle).map(ProofSelector::hierarchy)
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Hierarchy::Platform => 0,
            Hierarchy::Owner => 1,
            Hierarchy::Endorsement => 2,
            Hierarchy::Null => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|h| h.tag() == tag)
    }
}

/// Selects the proof or seed of a hierarchy.
///
/// Firmware- and SVN-limited selectors derive their values from the base
/// hierarchy and a secret obtained from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofSelector {
    Base(Hierarchy),
    Firmware(Hierarchy),
    Svn(Hierarchy, u16),
}

impl ProofSelector {
    #[must_use]
    pub fn from_handle(handle: u32) -> Option<Self> {
        let selector = match handle {
            TPM_RH_PLATFORM => Self::Base(Hierarchy::Platform),
            TPM_RH_OWNER => Self::Base(Hierarchy::Owner),
            TPM_RH_ENDORSEMENT => Self::Base(Hierarchy::Endorsement),
            TPM_RH_NULL => Self::Base(Hierarchy::Null),
            TPM_RH_FW_PLATFORM => Self::Firmware(Hierarchy::Platform),
            TPM_RH_FW_OWNER => Self::Firmware(Hierarchy::Owner),
            TPM_RH_FW_ENDORSEMENT => Self::Firmware(Hierarchy::Endorsement),
            TPM_RH_FW_NULL => Self::Firmware(Hierarchy::Null),
            _ => {
                let svn = u16::try_from(handle & 0xFFFF).ok()?;
                match handle & 0xFFFF_0000 {
                    TPM_RH_SVN_OWNER_BASE => Self::Svn(Hierarchy::Owner, svn),
                    TPM_RH_SVN_ENDORSEMENT_BASE => Self::Svn(Hierarchy::Endorsement, svn),
                    TPM_RH_SVN_PLATFORM_BASE => Self::Svn(Hierarchy::Platform, svn),
                    TPM_RH_SVN_NULL_BASE => Self::Svn(Hierarchy::Null, svn),
                    _ => return None,
                }
            }
        };
        Some(selector)
    }

    #[must_use]
    pub fn hierarchy(self) -> Hierarchy {
        match self {
            Self::Base(h) | Self::Firmware(h) | Self::Svn(h, _) => h,
        }
    }
}

/// Returns the hierarchy an evicted object's persistent handle belongs to.
#[must_use]
pub fn persistent_owner(handle: u32) -> Hierarchy {
    if handle >= PLATFORM_PERSISTENT {
        Hierarchy::Platform
    } else {
        Hierarchy::Owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limited_selectors() {
        assert_eq!(
            ProofSelector::from_handle(0x4001_0003),
            Some(ProofSelector::Svn(Hierarchy::Owner, 3))
        );
        assert_eq!(
            Hierarchy::from_handle(TPM_RH_FW_ENDORSEMENT),
            Some(Hierarchy::Endorsement)
        );
        assert_eq!(ProofSelector::from_handle(TPM_RH_LOCKOUT), None);
    }
}
