/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Desired-state model
//!
//! The document read at startup describing which servers HAProxy should have,
//! how they are health checked, which balancing algorithm to use and how the
//! proxy retries failed dispatches. Nothing mutates it once a run begins.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigLoadError;

pub const DEFAULT_BACKEND: &str = "default_backend";

/// Full target state for one reconciliation run
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct DesiredConfiguration {
    #[serde(rename = "haproxy_endpoint", default)]
    pub endpoint: String,
    #[serde(rename = "api_key", default)]
    pub credential: String,
    /// Passed through verbatim, never checked against a known list
    #[serde(rename = "load_balancing_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Registration order
    #[serde(rename = "backends", default)]
    pub servers: Vec<ServerSpec>,
    #[serde(default)]
    pub health_check: HealthCheckPolicy,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

/// One backend server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerSpec {
    pub name: String,
    #[serde(rename = "ip")]
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub weight: u32,
}

/// Health checking shared by every server
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "interval", default)]
    pub interval_seconds: u64,
    /// Consecutive failures before a server is marked down
    #[serde(rename = "fall", default)]
    pub fail_threshold: u32,
    /// Consecutive successes before a server is marked up
    #[serde(rename = "rise", default)]
    pub rise_threshold: u32,
}

/// Proxy-side dispatch retry behavior.
///
/// Unrelated to how often this client retries its own API calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub redispatch: bool,
}

/// Values supplied on the command line or through the environment that take
/// precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOverrides {
    pub endpoint: Option<String>,
    pub credential: Option<String>,
    pub backend: Option<String>,
}

/// Input document format, chosen from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

impl DesiredConfiguration {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path);
        debug!(path = %path.display(), ?format, "Loading desired configuration");

        let content = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        match format {
            ConfigFormat::Json => {
                serde_json::from_str(&content).map_err(|source| ConfigLoadError::Json {
                    path: path.to_path_buf(),
                    source,
                })
            }
            ConfigFormat::Toml => toml::from_str(&content).map_err(|source| ConfigLoadError::Toml {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Apply overrides and check that there is something to connect to.
    ///
    /// This is the last point the configuration changes before a run.
    pub fn resolve(mut self, overrides: ConnectionOverrides) -> Result<Self, ConfigLoadError> {
        if let Some(endpoint) = overrides.endpoint {
            self.endpoint = endpoint;
        }
        if let Some(credential) = overrides.credential {
            self.credential = credential;
        }
        if let Some(backend) = overrides.backend {
            self.backend = backend;
        }

        self.endpoint = self.endpoint.trim().trim_end_matches('/').to_string();
        if self.endpoint.is_empty() {
            return Err(ConfigLoadError::MissingEndpoint);
        }
        Ok(self)
    }

    /// Problems worth reporting that do not prevent a run
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.endpoint.trim().is_empty() {
            issues.push("Control-plane endpoint is empty".to_string());
        }
        if self.algorithm.trim().is_empty() {
            issues.push("Load-balancing algorithm is empty".to_string());
        }
        if self.backend.trim().is_empty() {
            issues.push("Target backend name is empty".to_string());
        }

        let mut seen = HashSet::new();
        for (index, server) in self.servers.iter().enumerate() {
            if server.name.trim().is_empty() {
                issues.push(format!("Server #{} has an empty name", index + 1));
            } else if !seen.insert(server.name.as_str()) {
                issues.push(format!(
                    "Server '{}' is declared more than once and will be registered again",
                    server.name
                ));
            }
            if server.address.trim().is_empty() {
                issues.push(format!("Server '{}' has an empty address", server.name));
            }
            if server.port == 0 {
                issues.push(format!("Server '{}' has port 0", server.name));
            }
        }

        if self.health_check.enabled && self.health_check.interval_seconds == 0 {
            issues.push("Health checking is enabled with a zero interval".to_string());
        }

        issues
    }
}

// The credential never reaches logs.
impl fmt::Debug for DesiredConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesiredConfiguration")
            .field("endpoint", &self.endpoint)
            .field("credential", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("backend", &self.backend)
            .field("servers", &self.servers)
            .field("health_check", &self.health_check)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

impl ServerSpec {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            weight,
        }
    }
}

impl HealthCheckPolicy {
    /// Check interval as the control plane expects it, e.g. `"5s"`
    pub fn interval(&self) -> String {
        format!("{}s", self.interval_seconds)
    }
}

impl RetryPolicy {
    pub fn redispatch_value(&self) -> &'static str {
        if self.redispatch {
            "on"
        } else {
            "off"
        }
    }
}

fn default_backend() -> String {
    DEFAULT_BACKEND.to_string()
}
