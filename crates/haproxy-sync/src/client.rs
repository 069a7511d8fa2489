/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Control-plane client
//!
//! Every call is a single attempt against the HAProxy administrative API.
//! Retrying is left to the reconciliation engine.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::DesiredConfiguration;
use crate::error::{ControlPlaneError, SyncError};
use crate::server::ServerDefinition;

const API_PREFIX: [&str; 4] = ["v2", "services", "haproxy", "configuration"];
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Operations the engine needs from the proxy's administrative API
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Liveness probe
    async fn ping(&self) -> Result<(), ControlPlaneError>;

    /// Add (or update) one server in the target backend
    async fn register_server(&self, server: &ServerDefinition) -> Result<(), ControlPlaneError>;

    /// Select the load-balancing algorithm
    async fn set_algorithm(&self, algorithm: &str) -> Result<(), ControlPlaneError>;

    /// Set a scalar configuration option
    async fn set_key_value(&self, key: &str, value: &str) -> Result<(), ControlPlaneError>;
}

/// Connection parameters for [`HttpControlPlane`]
#[derive(Clone)]
pub struct ClientSettings {
    pub endpoint: String,
    pub credential: String,
    pub backend: String,
    pub timeout: Option<u64>,
}

impl ClientSettings {
    pub fn from_config(config: &DesiredConfiguration, timeout: Option<u64>) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            credential: config.credential.clone(),
            backend: config.backend.clone(),
            timeout,
        }
    }
}

impl fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSettings")
            .field("endpoint", &self.endpoint)
            .field("credential", &"<redacted>")
            .field("backend", &self.backend)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Error body returned by the Data Plane API
#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<i64>,
    message: String,
}

#[derive(Serialize)]
struct BalanceRequest<'x> {
    algorithm: &'x str,
}

#[derive(Serialize)]
struct SettingRequest<'x> {
    key: &'x str,
    value: &'x str,
}

/// [`ControlPlane`] backed by the HAProxy Data Plane REST API
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    settings: ClientSettings,
    base: Url,
    http: reqwest::Client,
}

impl HttpControlPlane {
    /// Build a client without contacting the control plane
    pub fn new(settings: ClientSettings) -> Result<Self, ControlPlaneError> {
        let base = Url::parse(&settings.endpoint).map_err(|err| {
            ControlPlaneError::InvalidEndpoint {
                endpoint: settings.endpoint.clone(),
                reason: err.to_string(),
            }
        })?;
        if base.cannot_be_a_base() {
            return Err(ControlPlaneError::InvalidEndpoint {
                endpoint: settings.endpoint.clone(),
                reason: "not a hierarchical URL".to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(is_localhost(&base))
            .timeout(Duration::from_secs(
                settings.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ))
            .build()?;

        Ok(Self {
            settings,
            base,
            http,
        })
    }

    /// Build a client and verify the control plane answers its liveness probe.
    ///
    /// For callers that talk to the control plane outside a [`Reconciler`] run,
    /// which performs its own probe.
    ///
    /// [`Reconciler`]: crate::Reconciler
    pub async fn connect(settings: ClientSettings) -> Result<Self, SyncError> {
        let endpoint = settings.endpoint.clone();
        let client = Self::new(settings).map_err(|source| SyncError::Connectivity {
            endpoint: endpoint.clone(),
            source,
        })?;
        client
            .ping()
            .await
            .map_err(|source| SyncError::Connectivity { endpoint, source })?;

        info!(endpoint = %client.settings.endpoint, "Connected to control plane");
        Ok(client)
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ControlPlaneError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ControlPlaneError::InvalidEndpoint {
                endpoint: self.settings.endpoint.clone(),
                reason: "not a hierarchical URL".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn configuration_url(&self, resource: &[&str]) -> Result<Url, ControlPlaneError> {
        let segments: Vec<&str> = API_PREFIX.iter().copied().chain(resource.iter().copied()).collect();
        self.url(&segments)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<(), ControlPlaneError> {
        debug!(%method, %url, "Sending control-plane request");

        let mut request = self.http.request(method, url);
        if !self.settings.credential.is_empty() {
            request = request.header(
                AUTHORIZATION,
                format!("Bearer {}", self.settings.credential),
            );
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ControlPlaneError::Unauthorized {
                status: status.as_u16(),
            });
        }

        let text = response.text().await.unwrap_or_default();
        Err(ControlPlaneError::Status {
            status: status.as_u16(),
            message: error_message(status, &text),
        })
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn ping(&self) -> Result<(), ControlPlaneError> {
        let url = self.url(&["v2", "info"])?;
        self.send::<()>(Method::GET, url, None).await
    }

    async fn register_server(&self, server: &ServerDefinition) -> Result<(), ControlPlaneError> {
        let mut url = self.configuration_url(&["servers"])?;
        url.query_pairs_mut()
            .append_pair("backend", &self.settings.backend);
        self.send(Method::POST, url, Some(server)).await
    }

    async fn set_algorithm(&self, algorithm: &str) -> Result<(), ControlPlaneError> {
        let url = self.configuration_url(&["backends", self.settings.backend.as_str(), "balance"])?;
        self.send(Method::PUT, url, Some(&BalanceRequest { algorithm }))
            .await
    }

    async fn set_key_value(&self, key: &str, value: &str) -> Result<(), ControlPlaneError> {
        let url = self.configuration_url(&["backends", self.settings.backend.as_str(), "settings"])?;
        self.send(Method::PUT, url, Some(&SettingRequest { key, value }))
            .await
    }
}

fn error_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(ApiErrorBody {
            code: Some(code),
            message,
        }) => format!("{message} (code {code})"),
        Ok(ApiErrorBody { message, .. }) => message,
        Err(_) if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string(),
        Err(_) => body.trim().to_string(),
    }
}

/// Self-signed certificates are only tolerated on loopback endpoints
pub fn is_localhost(url: &Url) -> bool {
    match url.host_str() {
        Some(host) => {
            host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1"
        }
        None => false,
    }
}
