// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! A software TPM 2.0 core: authorization sessions, NV indices,
//! dictionary attack protection, hierarchies and context swapping.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]

pub mod authorize;
pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod context;
pub mod crypto;
pub mod da;
pub mod engine;
pub mod entity;
pub mod error;
pub mod handle;
pub mod hierarchy;
pub mod nv;
pub mod object;
pub mod platform;
pub mod policy;
pub mod session;
pub mod state;
pub mod util;

pub use crate::{
    command::{TpmCc, Request, Response},
    config::EngineConfig,
    engine::Engine,
    error::{TpmError, TpmRcBase},
};
