// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024-2025 Jarkko Sakkinen
// Copyright (c) 2025 Opinsys Oy

use log::error;
use tpm2sim::{cli::execute_cli, error::CliError};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    match execute_cli() {
        Ok(()) => {}
        Err(CliError::HelpDisplayed) => std::process::exit(2),
        Err(err @ (CliError::Usage(_) | CliError::Lexopt(_))) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    }
}
