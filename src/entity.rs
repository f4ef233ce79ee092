// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Glue between raw handles and the stores: load status, authorization
//! value and policy, Name and hierarchy of an entity.

use crate::{
    command::AuthRole,
    engine::Engine,
    error::TpmRcBase,
    handle::{
        HandleType, Hierarchy, ProofSelector, TPM_RH_ENDORSEMENT, TPM_RH_LOCKOUT, TPM_RH_NULL,
        TPM_RH_OWNER, TPM_RH_PLATFORM, TPM_RH_PLATFORM_NV, TPM_RS_PW,
    },
    hierarchy::AuthPolicy,
    nv::TpmaNv,
    object::{Object, TpmaObject},
};
use log::debug;
use zeroize::Zeroizing;

impl Engine {
    fn nv_hierarchy_enabled(&self, hierarchy: Hierarchy) -> bool {
        let h = &self.state.hierarchy;
        match hierarchy {
            Hierarchy::Platform => h.ph_enable_nv,
            _ => h.sh_enable,
        }
    }

    /// `EntityGetLoadStatus`. A persistent object is materialized into a
    /// free object slot and released after the command.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Handle` for an unknown or unloaded entity or an
    /// index of a disabled hierarchy, `TpmRcBase::Hierarchy` when the
    /// hierarchy of any other entity is disabled, and
    /// `TpmRcBase::ObjectMemory` when a persistent object cannot be
    /// materialized.
    pub fn entity_load_status(&mut self, handle: u32) -> Result<(), TpmRcBase> {
        match HandleType::of(handle) {
            Some(HandleType::Permanent) => {
                let enabled = match handle {
                    TPM_RH_LOCKOUT | TPM_RH_NULL | TPM_RS_PW => true,
                    TPM_RH_PLATFORM_NV => self.state.hierarchy.ph_enable,
                    _ => {
                        let selector = ProofSelector::from_handle(handle).ok_or(TpmRcBase::Handle)?;
                        if !matches!(selector, ProofSelector::Base(_)) {
                            self.state
                                .hierarchy
                                .proof(selector, self.platform.as_ref(), self.crypto())?;
                        }
                        self.state.hierarchy.is_enabled(selector.hierarchy())
                    }
                };
                if enabled {
                    Ok(())
                } else {
                    Err(TpmRcBase::Hierarchy)
                }
            }
            Some(HandleType::Transient) => {
                let object = self.objects.by_handle(handle).ok_or(TpmRcBase::Handle)?;
                if self.state.hierarchy.is_enabled(object.hierarchy()) {
                    Ok(())
                } else {
                    Err(TpmRcBase::Hierarchy)
                }
            }
            Some(HandleType::Persistent) => {
                if self.objects.resolve(handle).is_some() {
                    return Ok(());
                }
                let key = self.nv.evict_object(handle, self.crypto())?;
                let hierarchy = Hierarchy::from_handle(key.hierarchy).unwrap_or(Hierarchy::Owner);
                if !self.state.hierarchy.is_enabled(hierarchy) {
                    return Err(TpmRcBase::Hierarchy);
                }
                let slot = self.objects.allocate_slot()?;
                self.objects.insert(slot, Object::Key(key))?;
                self.materialized.push(slot);
                debug!(target: "tpm2sim::entity", "{handle:#010x}: materialized");
                Ok(())
            }
            Some(HandleType::NvIndex) => {
                let index = self.nv.index(handle)?;
                if self.nv_hierarchy_enabled(index.public.hierarchy()) {
                    Ok(())
                } else {
                    Err(TpmRcBase::Handle)
                }
            }
            Some(HandleType::HmacSession | HandleType::PolicySession) => {
                if self.sessions.is_loaded(handle) {
                    Ok(())
                } else {
                    Err(TpmRcBase::Handle)
                }
            }
            Some(HandleType::Pcr) | None => Err(TpmRcBase::Handle),
        }
    }

    /// `EntityGetAuthValue`. Entities without an authorization value yield
    /// an empty buffer.
    #[must_use]
    pub fn entity_auth_value(&self, handle: u32) -> Zeroizing<Vec<u8>> {
        let value = match HandleType::of(handle) {
            Some(HandleType::Permanent) => self.state.hierarchy.auth(handle).map(<[u8]>::to_vec),
            Some(HandleType::Transient | HandleType::Persistent) => self
                .objects
                .by_handle(handle)
                .map(|object| object.auth_value().to_vec()),
            Some(HandleType::NvIndex) => self
                .nv
                .index(handle)
                .ok()
                .map(|index| index.auth_value.to_vec()),
            _ => None,
        };
        Zeroizing::new(value.unwrap_or_default())
    }

    /// `EntityGetAuthPolicy`. `None` when the entity has no policy.
    #[must_use]
    pub fn entity_auth_policy(&self, handle: u32) -> Option<AuthPolicy> {
        let policy = match HandleType::of(handle)? {
            HandleType::Permanent => self.state.hierarchy.policy(handle).cloned()?,
            HandleType::Transient | HandleType::Persistent => match self.objects.by_handle(handle)? {
                Object::Key(key) => AuthPolicy {
                    digest: key.public.auth_policy.clone(),
                    alg: key.public.name_alg,
                },
                Object::Sequence(_) => return None,
            },
            HandleType::NvIndex => {
                let index = self.nv.index(handle).ok()?;
                AuthPolicy {
                    digest: index.public.auth_policy,
                    alg: index.public.name_alg,
                }
            }
            _ => return None,
        };
        (!policy.digest.is_empty()).then_some(policy)
    }

    /// `EntityGetName`: the object or index Name, or the handle itself for
    /// every other entity.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Handle` for an unknown object or index.
    pub fn entity_name(&self, handle: u32) -> Result<Vec<u8>, TpmRcBase> {
        match HandleType::of(handle) {
            Some(HandleType::Transient | HandleType::Persistent) => {
                match self.objects.by_handle(handle) {
                    Some(Object::Key(key)) => Ok(key.name.clone()),
                    Some(Object::Sequence(_)) => Ok(handle.to_be_bytes().to_vec()),
                    None => Ok(self.nv.evict_object(handle, self.crypto())?.name),
                }
            }
            Some(HandleType::NvIndex) => self.nv.public(handle)?.name(self.crypto()),
            _ => Ok(handle.to_be_bytes().to_vec()),
        }
    }

    /// `EntityGetHierarchy`.
    #[must_use]
    pub fn entity_hierarchy(&self, handle: u32) -> Option<Hierarchy> {
        match HandleType::of(handle)? {
            HandleType::Permanent => match handle {
                TPM_RH_PLATFORM | TPM_RH_PLATFORM_NV => Some(Hierarchy::Platform),
                TPM_RH_OWNER | TPM_RH_LOCKOUT => Some(Hierarchy::Owner),
                TPM_RH_ENDORSEMENT => Some(Hierarchy::Endorsement),
                _ => Hierarchy::from_handle(handle),
            },
            HandleType::Transient | HandleType::Persistent => {
                self.objects.by_handle(handle).map(Object::hierarchy)
            }
            HandleType::NvIndex => self.nv.index(handle).ok().map(|i| i.public.hierarchy()),
            _ => None,
        }
    }

    /// Failed authorizations of DA-exempt entities do not count.
    #[must_use]
    pub fn is_da_exempt(&self, handle: u32) -> bool {
        match HandleType::of(handle) {
            Some(HandleType::Permanent) => handle != TPM_RH_LOCKOUT,
            Some(HandleType::Transient | HandleType::Persistent) => {
                self.objects.by_handle(handle).map_or(true, Object::is_no_da)
            }
            Some(HandleType::NvIndex) => self.nv_attr(handle, TpmaNv::NO_DA),
            _ => true,
        }
    }

    pub(crate) fn nv_attr(&self, handle: u32, attr: TpmaNv) -> bool {
        self.nv
            .index(handle)
            .is_ok_and(|index| index.public.attributes.contains(attr))
    }

    pub(crate) fn object_auth_available(&self, handle: u32, role: AuthRole) -> bool {
        match self.objects.by_handle(handle) {
            Some(Object::Key(key)) => {
                let attrs = key.public.attributes;
                match role {
                    AuthRole::User => attrs.contains(TpmaObject::USER_WITH_AUTH),
                    AuthRole::Admin => !attrs.contains(TpmaObject::ADMIN_WITH_POLICY),
                    AuthRole::None => true,
                }
            }
            Some(Object::Sequence(_)) => true,
            None => false,
        }
    }

    /// Frees the slots of persistent objects materialized for the command.
    pub(crate) fn release_materialized(&mut self) {
        for slot in std::mem::take(&mut self.materialized) {
            self.objects.flush(slot);
        }
    }
}
