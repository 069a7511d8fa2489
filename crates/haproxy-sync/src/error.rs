/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Error types for configuration reconciliation

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for reconciliation operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// A single control-plane call that did not succeed.
///
/// These never carry retry state; the engine decides whether to try again.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// The request never produced a response (DNS, connect, timeout, TLS)
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The control plane rejected the API key
    #[error("authentication rejected by control plane (status {status})")]
    Unauthorized { status: u16 },

    /// Any other non-success status
    #[error("control plane returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The endpoint could not be turned into a request URL
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

/// Failures while reading the desired-state document
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("configuration has no control-plane endpoint")]
    MissingEndpoint,
}

/// Settings applied after server registration; each is a separate fatal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStage {
    Algorithm,
    Retries,
    Redispatch,
}

impl fmt::Display for ConfigStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigStage::Algorithm => write!(f, "load-balancing algorithm"),
            ConfigStage::Retries => write!(f, "retry count"),
            ConfigStage::Redispatch => write!(f, "redispatch option"),
        }
    }
}

/// Errors surfaced by a reconciliation run
#[derive(Error, Debug)]
pub enum SyncError {
    /// Input document missing, unreadable or malformed
    #[error(transparent)]
    ConfigLoad(#[from] ConfigLoadError),

    /// Liveness probe failed; nothing else is attempted
    #[error("control plane at {endpoint} is unreachable: {source}")]
    Connectivity {
        endpoint: String,
        #[source]
        source: ControlPlaneError,
    },

    /// Every registration attempt for one server failed
    #[error("failed to register server '{server}' after {attempts} attempt(s): {source}")]
    Registration {
        server: String,
        attempts: u32,
        #[source]
        source: ControlPlaneError,
    },

    /// Algorithm or retry-policy application failed
    #[error("failed to apply {stage}: {source}")]
    Configuration {
        stage: ConfigStage,
        #[source]
        source: ControlPlaneError,
    },
}

impl SyncError {
    /// Whether this error aborts the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::Registration { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::Configuration {
            stage: ConfigStage::Redispatch,
            source: ControlPlaneError::Status {
                status: 500,
                message: "boom".to_string(),
            },
        };
        assert_eq!(
            err.to_string(),
            "failed to apply redispatch option: control plane returned status 500: boom"
        );

        let err = SyncError::Registration {
            server: "web1".to_string(),
            attempts: 3,
            source: ControlPlaneError::Unauthorized { status: 401 },
        };
        assert_eq!(
            err.to_string(),
            "failed to register server 'web1' after 3 attempt(s): authentication rejected by control plane (status 401)"
        );
    }

    #[test]
    fn test_fatality() {
        let registration = SyncError::Registration {
            server: "web1".to_string(),
            attempts: 3,
            source: ControlPlaneError::Status {
                status: 409,
                message: "exists".to_string(),
            },
        };
        assert!(!registration.is_fatal());

        let connectivity = SyncError::Connectivity {
            endpoint: "http://lb:5555".to_string(),
            source: ControlPlaneError::Status {
                status: 503,
                message: "down".to_string(),
            },
        };
        assert!(connectivity.is_fatal());
        assert!(SyncError::from(ConfigLoadError::MissingEndpoint).is_fatal());
    }
}
