// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! The `tpm2sim` command-line front-end: manufactures, inspects and
//! self-tests an engine over a file-backed NV image.

use crate::{
    command::{TpmCc, Request},
    config::EngineConfig,
    crypto::SoftwareCrypto,
    engine::Engine,
    error::CliError,
    platform::{FileNv, StdPlatform},
};
use log::info;
use serde::Serialize;
use std::{
    ffi::OsString,
    fmt::Write as _,
    io::Write,
    path::{Path, PathBuf},
};
use tpm2_protocol::data::TpmSu;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_NV_PATH: &str = "tpm2sim.nv";

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cli {
    pub nv_path: PathBuf,
    pub config: Option<PathBuf>,
    pub command: Subcommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subcommand {
    /// Erases the NV image and generates fresh hierarchy secrets.
    Manufacture,
    /// Prints the persistent state as JSON.
    Status,
    /// Runs Startup and a full self-test.
    SelfTest,
}

struct SubcommandInfo {
    name: &'static str,
    about: &'static str,
    command: Subcommand,
}

const SUBCOMMANDS: &[SubcommandInfo] = &[
    SubcommandInfo {
        name: "manufacture",
        about: "Erases the NV image and generates fresh hierarchy secrets",
        command: Subcommand::Manufacture,
    },
    SubcommandInfo {
        name: "self-test",
        about: "Runs the known-answer self-test",
        command: Subcommand::SelfTest,
    },
    SubcommandInfo {
        name: "status",
        about: "Prints counters, hierarchy and dictionary attack state",
        command: Subcommand::Status,
    },
];

const GLOBAL_OPTIONS: &[(Option<&str>, &str, &str, &str)] = &[
    (Some("-n"), "--nv", "<PATH>", "[default: tpm2sim.nv]"),
    (Some("-c"), "--config", "<PATH>", "JSON engine configuration"),
    (Some("-h"), "--help", "", "Print help information"),
    (Some("-V"), "--version", "", "Print version information"),
];

fn usage() -> String {
    let mut output = format!(
        "tpm2sim {VERSION}\nSoftware TPM 2.0 core\n\nUSAGE:\n    tpm2sim [OPTIONS] <COMMAND>\n\nOPTIONS:\n"
    );
    let items: Vec<(String, &str)> = GLOBAL_OPTIONS
        .iter()
        .map(|(short, long, val, desc)| {
            let mut left = short.map_or_else(|| "    ".to_string(), |s| format!("{s}, "));
            left.push_str(long);
            if !val.is_empty() {
                left.push(' ');
                left.push_str(val);
            }
            (left, *desc)
        })
        .collect();
    let max_len = items.iter().map(|(left, _)| left.len()).max().unwrap_or(0);
    for (left, right) in &items {
        let _ = writeln!(output, "    {left:<max_len$}  {right}");
    }
    output.push_str("\nSUBCOMMANDS:\n");
    for cmd in SUBCOMMANDS {
        let _ = writeln!(output, "    {: <20} {}", cmd.name, cmd.about);
    }
    output
}

fn dispatch_subcommand(name: &OsString) -> Result<Subcommand, CliError> {
    let name = name
        .to_str()
        .ok_or_else(|| CliError::Usage("invalid non-UTF8 command".to_string()))?;
    SUBCOMMANDS
        .iter()
        .find(|cmd| cmd.name == name)
        .map(|cmd| cmd.command)
        .ok_or_else(|| CliError::Usage(format!("unknown command '{name}'")))
}

/// Parses a command line. Returns `None` when help or the version was
/// printed.
///
/// # Errors
///
/// Returns `CliError::Usage` or `CliError::Lexopt` for a malformed command
/// line and `CliError::HelpDisplayed` when no command was given.
pub fn parse_cli(mut parser: lexopt::Parser) -> Result<Option<Cli>, CliError> {
    use lexopt::prelude::*;

    let mut nv_path = PathBuf::from(DEFAULT_NV_PATH);
    let mut config = None;
    let mut command = None;
    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                println!("{}", usage());
                return Ok(None);
            }
            Short('V') | Long("version") => {
                println!("tpm2sim {VERSION}");
                return Ok(None);
            }
            Short('n') | Long("nv") => nv_path = parser.value()?.into(),
            Short('c') | Long("config") => config = Some(parser.value()?.into()),
            Value(val) if command.is_none() => command = Some(dispatch_subcommand(&val)?),
            _ => return Err(arg.unexpected().into()),
        }
    }
    let Some(command) = command else {
        eprintln!("{}", usage());
        return Err(CliError::HelpDisplayed);
    };
    Ok(Some(Cli {
        nv_path,
        config,
        command,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct Status {
    total_reset_count: u64,
    clear_count: u32,
    failed_tries: u32,
    max_tries: u32,
    recovery_time: u32,
    lockout_recovery: u32,
    locked_out: bool,
    ph_enable: bool,
    sh_enable: bool,
    eh_enable: bool,
    ph_enable_nv: bool,
    disable_clear: bool,
    nv_handles: Vec<String>,
    nv_free: usize,
}

impl Status {
    fn of(engine: &Engine) -> Self {
        let counters = engine.counters();
        let da = engine.da();
        let h = engine.hierarchy();
        Self {
            total_reset_count: counters.total_reset_count,
            clear_count: counters.clear_count,
            failed_tries: da.failed_tries,
            max_tries: da.max_tries,
            recovery_time: da.recovery_time,
            lockout_recovery: da.lockout_recovery,
            locked_out: da.is_locked_out(),
            ph_enable: h.ph_enable,
            sh_enable: h.sh_enable,
            eh_enable: h.eh_enable,
            ph_enable_nv: h.ph_enable_nv,
            disable_clear: h.disable_clear,
            nv_handles: engine
                .nv()
                .handles()
                .into_iter()
                .map(|handle| format!("{handle:#010x}"))
                .collect(),
            nv_free: engine.nv().free_space(),
        }
    }
}

fn open_engine(nv_path: &Path, config: EngineConfig) -> Result<Engine, CliError> {
    let backing = FileNv::open(nv_path, config.nv_memory_size)
        .map_err(|e| CliError::File(nv_path.display().to_string(), e))?;
    Ok(Engine::new(
        config,
        Box::new(StdPlatform::default()),
        Box::new(SoftwareCrypto),
        Box::new(backing),
    )?)
}

/// Runs a parsed command line.
///
/// # Errors
///
/// Returns a `CliError` when the configuration or NV image cannot be used
/// or a command fails.
pub fn run<W: Write>(cli: &Cli, writer: &mut W) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let mut engine = open_engine(&cli.nv_path, config)?;
    match cli.command {
        Subcommand::Manufacture => {
            engine.manufacture()?;
            writeln!(writer, "manufactured {}", cli.nv_path.display())?;
        }
        Subcommand::Status => {
            let status = serde_json::to_string_pretty(&Status::of(&engine))?;
            writeln!(writer, "{status}")?;
        }
        Subcommand::SelfTest => {
            let su = (TpmSu::Clear as u16).to_be_bytes().to_vec();
            engine.execute(&Request::new(TpmCc::Startup).parameters(su.clone()))?;
            engine.execute(&Request::new(TpmCc::SelfTest).parameters(vec![1]))?;
            engine.execute(&Request::new(TpmCc::Shutdown).parameters(su))?;
            info!(target: "tpm2sim::cli", "self-test passed");
            writeln!(writer, "ok")?;
        }
    }
    Ok(())
}

/// Parses the process arguments and runs the command.
///
/// # Errors
///
/// Returns a `CliError` if parsing or execution fails.
pub fn execute_cli() -> Result<(), CliError> {
    match parse_cli(lexopt::Parser::from_env())? {
        Some(cli) => run(&cli, &mut std::io::stdout()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Option<Cli>, CliError> {
        parse_cli(lexopt::Parser::from_iter(
            std::iter::once("tpm2sim").chain(args.iter().copied()),
        ))
    }

    #[test]
    fn test_parse_subcommand() {
        let cli = parse(&["--nv", "/tmp/x.nv", "status"]).unwrap().unwrap();
        assert_eq!(cli.nv_path, PathBuf::from("/tmp/x.nv"));
        assert_eq!(cli.command, Subcommand::Status);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_unknown_subcommand() {
        assert!(matches!(parse(&["bogus"]), Err(CliError::Usage(_))));
        assert!(matches!(parse(&[]), Err(CliError::HelpDisplayed)));
    }

    #[test]
    fn test_run_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            nv_path: dir.path().join("tpm.nv"),
            config: None,
            command: Subcommand::SelfTest,
        };
        let mut out = Vec::new();
        run(&cli, &mut out).unwrap();
        assert_eq!(out, b"ok\n");

        let cli = Cli {
            command: Subcommand::Status,
            ..cli
        };
        let mut out = Vec::new();
        run(&cli, &mut out).unwrap();
        let status: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(status["total-reset-count"], 1);
    }
}
