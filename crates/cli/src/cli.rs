/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::PathBuf;

use clap::Parser;
use haproxy_sync::ConnectionOverrides;

/// Apply a declarative backend configuration to HAProxy
#[derive(Parser, Debug)]
#[command(name = "haproxy-sync")]
#[command(about = "Registers backend servers, health checks, balancing algorithm and retry policy through the HAProxy administrative API")]
#[command(version)]
pub struct Cli {
    /// Configuration file path (JSON, or TOML with a .toml extension)
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    pub config: PathBuf,

    /// Control-plane endpoint, overrides the configuration file
    #[arg(long, env = "HAPROXY_ENDPOINT")]
    pub endpoint: Option<String>,

    /// API key, overrides the configuration file
    #[arg(long, env = "HAPROXY_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Backend servers are added to, overrides the configuration file
    #[arg(long)]
    pub backend: Option<String>,

    /// Timeout for each control-plane request, in seconds
    #[arg(short, long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: u64,

    /// Exit with status 2 when any server could not be registered
    #[arg(long)]
    pub strict: bool,

    /// Validate the configuration and print the calls that would be made
    #[arg(long)]
    pub dry_run: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn overrides(&self) -> ConnectionOverrides {
        ConnectionOverrides {
            endpoint: self.endpoint.clone(),
            credential: self.api_key.clone(),
            backend: self.backend.clone(),
        }
    }
}
