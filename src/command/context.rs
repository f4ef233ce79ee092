// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! ContextSave, ContextLoad and FlushContext.

use crate::{
    command::Call,
    context::{context_hierarchy, protect, seal, split_hierarchy, unprotect, TpmsContext},
    engine::Engine,
    error::{TpmError, TpmRcBase, TpmRcExt},
    handle::{
        HandleType, ProofSelector, CONTEXT_OBJECT, CONTEXT_SEQUENCE, CONTEXT_ST_CLEAR,
        TPM_RH_NULL,
    },
    object::Object,
    session::Session,
};
use log::debug;
use tpm2_protocol::data::TpmRh;

fn save_object(engine: &mut Engine, handle: u32) -> Result<TpmsContext, TpmError> {
    let object = engine.objects.by_handle(handle).ok_or(TpmRcBase::Handle.at_handle(1))?;
    let hierarchy = object.hierarchy_handle();
    let saved_handle = object.saved_handle();
    let payload = object.to_context_bytes()?;
    let (rh, svn) = split_hierarchy(hierarchy)?;
    let proof = engine.proof(hierarchy)?;

    let sequence = engine.state.object_context_id;
    let blob = protect(
        engine.crypto(),
        &proof,
        engine.state.counters,
        sequence,
        saved_handle,
        svn,
        &payload,
    )?;
    // A context that does not fit TPMS_CONTEXT is refused before any state moves.
    let context = seal(sequence, saved_handle, rh, &blob)?;
    engine.state.object_context_id = sequence.checked_add(1).ok_or(TpmRcBase::TooManyContexts)?;
    engine.persist_state()?;
    Ok(context)
}

fn save_session(engine: &mut Engine, handle: u32) -> Result<TpmsContext, TpmError> {
    let sequence = engine.sessions.check_save(handle).at_handle(1)?;
    let payload = engine
        .sessions
        .get(handle)
        .ok_or(TpmRcBase::Handle.at_handle(1))?
        .to_bytes()?;
    let proof = engine.proof(TPM_RH_NULL)?;
    let blob = protect(
        engine.crypto(),
        &proof,
        engine.state.counters,
        sequence,
        handle,
        0,
        &payload,
    )?;
    let context = seal(sequence, handle, TpmRh::Null, &blob)?;
    engine.sessions.context_save(handle).at_handle(1)?;
    Ok(context)
}

/// `TPM2_ContextSave`
///
/// Objects stay loaded; sessions move to the saved state.
///
/// # Errors
///
/// Returns `TpmRcBase::Handle` for a handle that cannot be saved,
/// `TpmRcBase::Size` for a context too large for `TPMS_CONTEXT`, and
/// `TpmRcBase::ContextGap` or `TpmRcBase::TooManyContexts` from the session
/// table.
pub fn context_save(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.handle(0)?;
    call.params.finish()?;
    let context = match HandleType::of(handle) {
        Some(HandleType::Transient) => save_object(engine, handle)?,
        Some(HandleType::HmacSession | HandleType::PolicySession) => save_session(engine, handle)?,
        _ => return Err(TpmRcBase::Handle.at_handle(1)),
    };
    debug!(target: "tpm2sim::context", "{handle:#010x}: saved as {}", context.sequence);
    call.out.put(&context)?;
    Ok(())
}

fn load_object(engine: &mut Engine, context: &TpmsContext) -> Result<u32, TpmError> {
    let hierarchy = context_hierarchy(context).at_parameter(1)?;
    let selector = ProofSelector::from_handle(hierarchy).ok_or(TpmRcBase::Hierarchy.at_parameter(1))?;
    if !engine.state.hierarchy.is_enabled(selector.hierarchy()) {
        return Err(TpmRcBase::Hierarchy.at_parameter(1));
    }
    let slot = engine.objects.allocate_slot()?;
    let proof = engine.proof(hierarchy).at_parameter(1)?;
    let payload = unprotect(engine.crypto(), &proof, engine.state.counters, context).at_parameter(1)?;
    let object = Object::from_context_bytes(&payload, engine.crypto()).at_parameter(1)?;
    if object.hierarchy_handle() != hierarchy || object.saved_handle() != context.saved_handle.0 {
        return Err(TpmRcBase::Integrity.at_parameter(1));
    }
    Ok(engine.objects.insert(slot, object)?)
}

fn load_session(engine: &mut Engine, context: &TpmsContext) -> Result<u32, TpmError> {
    if context.hierarchy != TpmRh::Null {
        return Err(TpmRcBase::Integrity.at_parameter(1));
    }
    let handle = context.saved_handle.0;
    engine.sessions.check_load(handle, context.sequence).at_parameter(1)?;
    let proof = engine.proof(TPM_RH_NULL)?;
    let payload = unprotect(engine.crypto(), &proof, engine.state.counters, context).at_parameter(1)?;
    let session = Session::from_bytes(&payload).at_parameter(1)?;
    Ok(engine
        .sessions
        .context_load(handle, context.sequence, session)
        .at_parameter(1)?)
}

/// `TPM2_ContextLoad`
///
/// # Errors
///
/// Returns `TpmRcBase::Integrity` for a forged, corrupted or stale blob,
/// `TpmRcBase::Hierarchy` when the object's hierarchy is disabled, and slot or
/// gap errors from the stores.
pub fn context_load(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let context: TpmsContext = call.params.get().at_parameter(1)?;
    call.params.finish()?;
    let handle = match context.saved_handle.0 {
        CONTEXT_OBJECT | CONTEXT_SEQUENCE | CONTEXT_ST_CLEAR => load_object(engine, &context)?,
        h if matches!(
            HandleType::of(h),
            Some(HandleType::HmacSession | HandleType::PolicySession)
        ) =>
        {
            load_session(engine, &context)?
        }
        _ => return Err(TpmRcBase::Handle.at_parameter(1)),
    };
    debug!(target: "tpm2sim::context", "{handle:#010x}: loaded from {}", context.sequence);
    call.out_handles.push(handle);
    Ok(())
}

/// `TPM2_FlushContext`
///
/// # Errors
///
/// Returns `TpmRcBase::Handle` when nothing is loaded or saved under the
/// handle.
pub fn flush_context(engine: &mut Engine, call: &mut Call<'_>) -> Result<(), TpmError> {
    let handle = call.params.u32().at_parameter(1)?;
    call.params.finish()?;
    match HandleType::of(handle) {
        Some(HandleType::Transient) => {
            let slot = engine.objects.resolve(handle).ok_or(TpmRcBase::Handle.at_parameter(1))?;
            engine.objects.flush(slot);
        }
        Some(HandleType::HmacSession | HandleType::PolicySession) => {
            engine.sessions.flush(handle).at_parameter(1)?;
        }
        _ => return Err(TpmRcBase::Handle.at_parameter(1)),
    }
    call.removed.push(handle);
    debug!(target: "tpm2sim::context", "{handle:#010x}: flushed");
    Ok(())
}
