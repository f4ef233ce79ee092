// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! The engine: owned state, Startup and Shutdown transitions, command
//! dispatch and failure mode.

use crate::{
    command::{attributes, Call, TpmCc, Request, Response},
    config::EngineConfig,
    context::ResetCounters,
    crypto::CryptoEngine,
    da::DaState,
    error::{TpmError, TpmRcBase, TpmRcExt},
    handle::ProofSelector,
    hierarchy::HierarchyState,
    nv::NvStore,
    object::{ObjectRef, ObjectStore},
    platform::{NvBacking, Platform},
    session::SessionTable,
    state::{PersistentState, ShutdownState},
};
use log::{debug, error, info, warn};
use tpm2_protocol::data::TpmSu;
use zeroize::Zeroizing;

/// Kind of a Startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupKind {
    /// Startup(CLEAR) without a preceding Shutdown(STATE).
    Reset,
    /// Startup(CLEAR) after Shutdown(STATE).
    Restart,
    /// Startup(STATE) after Shutdown(STATE).
    Resume,
}

/// A software TPM.
///
/// All state is owned by the engine. Commands run to completion one at a
/// time; callers sharing an engine between threads wrap it in a `Mutex`.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) platform: Box<dyn Platform>,
    pub(crate) crypto: Box<dyn CryptoEngine>,
    pub(crate) nv: NvStore,
    pub(crate) objects: ObjectStore,
    pub(crate) sessions: SessionTable,
    pub(crate) state: PersistentState,
    pub(crate) started: bool,
    failure: bool,
    pub(crate) materialized: Vec<ObjectRef>,
}

impl Engine {
    /// Opens an engine over `backing`. An unformatted image is formatted
    /// and manufactured.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvUnavailable` or `TpmRcBase::NvSpace` when the backing
    /// store cannot be used, or a decode error for a corrupted state area.
    pub fn new(
        config: EngineConfig,
        mut platform: Box<dyn Platform>,
        crypto: Box<dyn CryptoEngine>,
        backing: Box<dyn NvBacking>,
    ) -> Result<Self, TpmRcBase> {
        let mut nv = NvStore::open(backing, &config)?;
        let mut sessions = SessionTable::new(&config);
        let state = match nv.read_state() {
            Some(bytes) => PersistentState::decode(bytes, &mut sessions)?,
            None => {
                info!(target: "tpm2sim::engine", "manufacturing");
                if !nv.is_formatted() {
                    nv.format()?;
                }
                let state = PersistentState::manufacture(platform.as_mut(), &config);
                nv.write_state(&state.encode(&sessions)?)?;
                state
            }
        };
        nv.set_global_lock(state.nv_global_lock);
        Ok(Self {
            objects: ObjectStore::new(config.max_loaded_objects),
            config,
            platform,
            crypto,
            nv,
            sessions,
            state,
            started: false,
            failure: false,
            materialized: Vec::new(),
        })
    }

    /// Erases the NV image and generates fresh hierarchy secrets.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvUnavailable` when the backing store fails.
    pub fn manufacture(&mut self) -> Result<(), TpmRcBase> {
        self.nv.format()?;
        self.objects.flush_all();
        self.sessions = SessionTable::new(&self.config);
        self.state = PersistentState::manufacture(self.platform.as_mut(), &self.config);
        self.nv.set_global_lock(false);
        self.started = false;
        self.persist_state()?;
        info!(target: "tpm2sim::engine", "manufactured");
        Ok(())
    }

    /// Simulates loss of power: RAM state is lost and the engine waits for
    /// Startup. Failure mode survives.
    ///
    /// # Errors
    ///
    /// Returns a decode error for a corrupted state area.
    pub fn power_cycle(&mut self) -> Result<(), TpmRcBase> {
        self.objects.flush_all();
        self.materialized.clear();
        self.sessions = SessionTable::new(&self.config);
        if let Some(bytes) = self.nv.read_state() {
            self.state = PersistentState::decode(bytes, &mut self.sessions)?;
        }
        self.nv.set_global_lock(self.state.nv_global_lock);
        self.started = false;
        debug!(target: "tpm2sim::engine", "power cycle");
        Ok(())
    }

    /// Runs one command.
    ///
    /// # Errors
    ///
    /// Returns the response code of a failed command.
    pub fn execute(&mut self, request: &Request) -> Result<Response, TpmError> {
        if self.failure {
            return Err(TpmRcBase::Failure.into());
        }
        let attrs = attributes(request.code)?;
        if !self.started && !attrs.pre_startup {
            return Err(TpmRcBase::Initialize.into());
        }
        if request.handles.len() != attrs.handles.len() {
            return Err(TpmRcBase::Size.into());
        }
        let result = self.dispatch(attrs.code, request);
        self.release_materialized();
        if let Err(err) = &result {
            if err.rc == TpmRcBase::Failure {
                self.enter_failure_mode();
            }
            debug!(target: "tpm2sim::engine", "{:?}: {err}", attrs.code);
        }
        result
    }

    fn dispatch(&mut self, code: TpmCc, request: &Request) -> Result<Response, TpmError> {
        let attrs = attributes(code as u32)?;
        let now = self.now();
        if self.state.da.self_heal(now) {
            if let Err(rc) = self.persist_state() {
                warn!(target: "tpm2sim::engine", "self-heal not persisted: {rc}");
            }
        }
        for (i, handle) in request.handles.iter().enumerate() {
            let n = u8::try_from(i + 1).unwrap_or(u8::MAX);
            self.entity_load_status(*handle).at_handle(n)?;
        }
        if let Some((pos, access)) = attrs.nv {
            let n = u8::try_from(pos + 1).unwrap_or(u8::MAX);
            let h = &self.state.hierarchy;
            self.nv
                .is_accessible(request.handles[pos], access, h.ph_enable_nv, h.sh_enable)
                .at_handle(n)?;
        }

        let mut parameters = request.parameters.clone();
        let mut authorization = self.authorize_command(
            attrs,
            &request.handles,
            &request.auth_area,
            &mut parameters,
            request.locality,
        )?;

        let mut call = Call::new(code, &request.handles, &parameters, request.locality);
        (attrs.handler)(self, &mut call)?;
        for handle in &call.removed {
            authorization.remove_association(*handle);
        }
        let Call {
            out,
            out_handles,
            flush_bound,
            ..
        } = call;
        let mut parameters = out.into_vec();
        let auth_area = if authorization.session_count() > 0 {
            self.build_response_auth(&authorization, code, &mut parameters)?
        } else {
            Vec::new()
        };
        if !flush_bound.is_empty() {
            let flushed = self.sessions.flush_loaded_where(|s| {
                s.bind.as_ref().is_some_and(|b| flush_bound.contains(b))
            });
            debug!(target: "tpm2sim::engine", "{flushed} bound sessions flushed");
        }
        Ok(Response {
            handles: out_handles,
            parameters,
            auth_area,
        })
    }

    /// Enters failure mode: every later command returns `TPM_RC_FAILURE`.
    pub(crate) fn enter_failure_mode(&mut self) {
        if !self.failure {
            error!(target: "tpm2sim::engine", "entering failure mode");
        }
        self.failure = true;
    }

    /// Runs the Startup transition.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Initialize` when already started and `TpmRcBase::Value`
    /// for Startup(STATE) without a preceding Shutdown(STATE).
    pub(crate) fn startup(&mut self, startup_type: TpmSu) -> Result<StartupKind, TpmError> {
        if self.started {
            return Err(TpmRcBase::Initialize.into());
        }
        let kind = match (startup_type, self.state.shutdown) {
            (TpmSu::State, ShutdownState::State) => StartupKind::Resume,
            (TpmSu::State, _) => return Err(TpmRcBase::Value.at_parameter(1)),
            (TpmSu::Clear, ShutdownState::State) => StartupKind::Restart,
            (TpmSu::Clear, _) => StartupKind::Reset,
        };
        let now = self.now();
        let orderly = self.state.shutdown != ShutdownState::Unorderly;
        self.objects.flush_all();
        match kind {
            StartupKind::Reset => {
                self.state.counters.total_reset_count += 1;
                self.state.counters.clear_count = 0;
                self.state.hierarchy.reset_null(self.platform.as_mut());
                self.sessions.startup(true);
            }
            StartupKind::Restart => {
                self.state.counters.clear_count = self.state.counters.clear_count.wrapping_add(1);
                self.sessions.startup(false);
            }
            StartupKind::Resume => self.sessions.startup(false),
        }
        if kind != StartupKind::Resume {
            self.set_nv_global_lock(false);
            self.nv.startup_clear()?;
            self.state.hierarchy.startup_clear();
        }
        self.state.da.startup(now, orderly);
        self.state.shutdown = ShutdownState::Unorderly;
        self.persist_state()?;
        self.started = true;
        info!(target: "tpm2sim::engine", "startup: {kind:?}");
        Ok(kind)
    }

    /// Records an orderly shutdown.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvUnavailable` when the state cannot be written.
    pub(crate) fn shutdown(&mut self, shutdown_type: TpmSu) -> Result<(), TpmError> {
        self.state.shutdown = match shutdown_type {
            TpmSu::Clear => ShutdownState::Clear,
            TpmSu::State => ShutdownState::State,
        };
        self.persist_state()?;
        info!(target: "tpm2sim::engine", "shutdown: {:?}", self.state.shutdown);
        Ok(())
    }

    /// Writes the persistent state to the reserved NV area.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvUnavailable` or `TpmRcBase::NvSpace`.
    pub(crate) fn persist_state(&mut self) -> Result<(), TpmRcBase> {
        let bytes = self.state.encode(&self.sessions)?;
        self.nv.write_state(&bytes)
    }

    /// Sets the NV global write lock. The caller persists the state.
    pub(crate) fn set_nv_global_lock(&mut self, locked: bool) {
        self.state.nv_global_lock = locked;
        self.nv.set_global_lock(locked);
    }

    pub(crate) fn now(&self) -> u64 {
        self.platform.monotonic_ms()
    }

    pub(crate) fn random(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.platform.random(&mut buf);
        buf
    }

    pub(crate) fn crypto(&self) -> &dyn CryptoEngine {
        self.crypto.as_ref()
    }

    /// Proof selected by a hierarchy handle.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::Hierarchy` for a handle that selects no hierarchy,
    /// and `TpmRcBase::FwLimited` or `TpmRcBase::SvnLimited` from the hierarchy
    /// manager.
    pub(crate) fn proof(&self, hierarchy: u32) -> Result<Zeroizing<Vec<u8>>, TpmRcBase> {
        let selector = ProofSelector::from_handle(hierarchy).ok_or(TpmRcBase::Hierarchy)?;
        self.state
            .hierarchy
            .proof(selector, self.platform.as_ref(), self.crypto())
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failure
    }

    #[must_use]
    pub fn da(&self) -> &DaState {
        &self.state.da
    }

    #[must_use]
    pub fn hierarchy(&self) -> &HierarchyState {
        &self.state.hierarchy
    }

    #[must_use]
    pub fn counters(&self) -> ResetCounters {
        self.state.counters
    }

    #[must_use]
    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    #[must_use]
    pub fn nv(&self) -> &NvStore {
        &self.nv
    }
}
