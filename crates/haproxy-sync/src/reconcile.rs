/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Reconciliation engine
//!
//! Applies a [`DesiredConfiguration`] through a [`ControlPlane`] in a fixed
//! order:
//!
//! 1. connectivity probe (fatal)
//! 2. every server, in declared order, with bounded immediate retry (a server
//!    that exhausts its attempts is recorded and skipped)
//! 3. load-balancing algorithm (fatal)
//! 4. `retries`, then `option redispatch` (fatal, redispatch only after
//!    retries succeeded)
//!
//! Calls are issued one at a time; nothing runs concurrently.

use std::fmt;

use tracing::{error, info, info_span, warn, Instrument};

use crate::client::ControlPlane;
use crate::config::{DesiredConfiguration, ServerSpec};
use crate::error::{ConfigStage, Result, SyncError};
use crate::server::ServerDefinition;

/// Attempts made per server before its registration is recorded as failed
pub const MAX_SERVER_REGISTRATION_ATTEMPTS: u32 = 3;

pub const RETRIES_KEY: &str = "retries";
pub const REDISPATCH_KEY: &str = "option redispatch";

/// Position of a run in the reconciliation sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Connecting,
    RegisteringServers,
    ApplyingAlgorithm,
    ApplyingRetryPolicy,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Connecting => "connecting",
            Stage::RegisteringServers => "registering-servers",
            Stage::ApplyingAlgorithm => "applying-algorithm",
            Stage::ApplyingRetryPolicy => "applying-retry-policy",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// A control-plane call the engine would issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedCall {
    Ping,
    RegisterServer(ServerDefinition),
    SetAlgorithm(String),
    SetKeyValue { key: String, value: String },
}

impl fmt::Display for PlannedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannedCall::Ping => write!(f, "probe control plane"),
            PlannedCall::RegisterServer(server) => {
                write!(
                    f,
                    "register server {} at {}:{} weight {}",
                    server.name, server.address, server.port, server.weight
                )?;
                match (&server.inter, server.fall, server.rise) {
                    (Some(inter), Some(fall), Some(rise)) => {
                        write!(f, " (check inter {inter} fall {fall} rise {rise})")
                    }
                    _ => write!(f, " (no health check)"),
                }
            }
            PlannedCall::SetAlgorithm(algorithm) => write!(f, "set algorithm {algorithm}"),
            PlannedCall::SetKeyValue { key, value } => write!(f, "set {key} = {value}"),
        }
    }
}

/// A server the control plane accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredServer {
    pub name: String,
    /// Attempt on which registration succeeded, starting at 1
    pub attempts: u32,
}

/// Outcome of a run that reached the end of the sequence
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub registered: Vec<RegisteredServer>,
    /// Servers that exhausted their attempts, as [`SyncError::Registration`]
    pub failures: Vec<SyncError>,
}

impl ReconcileReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failed_servers(&self) -> Vec<&str> {
        self.failures
            .iter()
            .filter_map(|failure| match failure {
                SyncError::Registration { server, .. } => Some(server.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Drives one configuration through a control plane
#[derive(Debug)]
pub struct Reconciler<'x> {
    config: &'x DesiredConfiguration,
    max_attempts: u32,
}

impl<'x> Reconciler<'x> {
    pub fn new(config: &'x DesiredConfiguration) -> Self {
        Self {
            config,
            max_attempts: MAX_SERVER_REGISTRATION_ATTEMPTS,
        }
    }

    /// Override the per-server attempt bound. At least one attempt is always made.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Full sequence, starting with the connectivity probe
    pub async fn run<C: ControlPlane + ?Sized>(&self, client: &C) -> Result<ReconcileReport> {
        let span = info_span!("reconcile", endpoint = %self.config.endpoint);
        async {
            enter(Stage::Idle);
            self.verify_connectivity(client).await?;
            self.apply_desired_state(client).await
        }
        .instrument(span)
        .await
    }

    async fn apply_desired_state<C: ControlPlane + ?Sized>(
        &self,
        client: &C,
    ) -> Result<ReconcileReport> {
        let report = self.register_servers(client).await;

        enter(Stage::ApplyingAlgorithm);
        self.apply_algorithm(client).await?;

        enter(Stage::ApplyingRetryPolicy);
        self.apply_retry_policy(client).await?;

        enter(Stage::Done);
        info!(
            registered = report.registered.len(),
            failed = report.failures.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn verify_connectivity<C: ControlPlane + ?Sized>(&self, client: &C) -> Result<()> {
        enter(Stage::Connecting);
        client.ping().await.map_err(|source| {
            error!(error = %source, "Control plane is unreachable, aborting");
            SyncError::Connectivity {
                endpoint: self.config.endpoint.clone(),
                source,
            }
        })
    }

    /// Never fails as a whole; each server's outcome lands in the report.
    async fn register_servers<C: ControlPlane + ?Sized>(&self, client: &C) -> ReconcileReport {
        enter(Stage::RegisteringServers);
        let mut report = ReconcileReport::default();

        for spec in &self.config.servers {
            match self.register_server(client, spec).await {
                Ok(attempts) => report.registered.push(RegisteredServer {
                    name: spec.name.clone(),
                    attempts,
                }),
                Err(err) => {
                    warn!(server = %spec.name, error = %err, "Giving up on server");
                    report.failures.push(err);
                }
            }
        }

        report
    }

    /// Register one server, retrying immediately until it succeeds or the
    /// attempt bound is reached. Returns the attempt that succeeded.
    pub async fn register_server<C: ControlPlane + ?Sized>(
        &self,
        client: &C,
        spec: &ServerSpec,
    ) -> Result<u32> {
        let definition = ServerDefinition::new(spec, &self.config.health_check);
        let span = info_span!("server", name = %spec.name);

        async {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match client.register_server(&definition).await {
                    Ok(()) => {
                        info!(attempt, "Server registered");
                        return Ok(attempt);
                    }
                    Err(source) => {
                        warn!(
                            attempt,
                            max_attempts = self.max_attempts,
                            error = %source,
                            "Server registration attempt failed"
                        );
                        if attempt >= self.max_attempts {
                            return Err(SyncError::Registration {
                                server: spec.name.clone(),
                                attempts: attempt,
                                source,
                            });
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn apply_algorithm<C: ControlPlane + ?Sized>(&self, client: &C) -> Result<()> {
        let algorithm = self.config.algorithm.as_str();
        client
            .set_algorithm(algorithm)
            .await
            .map_err(|source| fatal(ConfigStage::Algorithm, source))?;
        info!(algorithm, "Load-balancing algorithm applied");
        Ok(())
    }

    async fn apply_retry_policy<C: ControlPlane + ?Sized>(&self, client: &C) -> Result<()> {
        for (stage, key, value) in self.retry_settings() {
            client
                .set_key_value(key, &value)
                .await
                .map_err(|source| fatal(stage, source))?;
        }
        info!(
            retries = self.config.retry_policy.retries,
            redispatch = self.config.retry_policy.redispatch,
            "Retry policy applied"
        );
        Ok(())
    }

    /// Key/value pairs for the retry policy, in the order they are applied
    fn retry_settings(&self) -> [(ConfigStage, &'static str, String); 2] {
        let policy = &self.config.retry_policy;
        [
            (ConfigStage::Retries, RETRIES_KEY, policy.retries.to_string()),
            (
                ConfigStage::Redispatch,
                REDISPATCH_KEY,
                policy.redispatch_value().to_string(),
            ),
        ]
    }

    /// Calls a successful first-attempt run would issue, in order
    pub fn plan(&self) -> Vec<PlannedCall> {
        let mut calls = vec![PlannedCall::Ping];
        calls.extend(self.config.servers.iter().map(|spec| {
            PlannedCall::RegisterServer(ServerDefinition::new(spec, &self.config.health_check))
        }));
        calls.push(PlannedCall::SetAlgorithm(self.config.algorithm.clone()));
        calls.extend(
            self.retry_settings()
                .into_iter()
                .map(|(_, key, value)| PlannedCall::SetKeyValue {
                    key: key.to_string(),
                    value,
                }),
        );
        calls
    }
}

fn enter(stage: Stage) {
    info!(%stage, "Entering stage");
}

fn fatal(stage: ConfigStage, source: crate::error::ControlPlaneError) -> SyncError {
    error!(%stage, error = %source, "Configuration stage failed, aborting");
    SyncError::Configuration { stage, source }
}
