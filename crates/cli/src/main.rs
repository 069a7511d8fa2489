/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

mod app;
mod cli;

// Every control-plane call is issued in sequence, so one thread is enough.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Cli::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    info!(config = %args.config.display(), "Starting haproxy-sync");

    match app::execute(&args).await {
        Ok(outcome) => ExitCode::from(outcome.exit_status(args.strict)),
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
