/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use anyhow::Context;
use haproxy_sync::{
    ClientSettings, DesiredConfiguration, HttpControlPlane, ReconcileReport, Reconciler,
    SyncError,
};
use tracing::{info, warn};

use crate::cli::Cli;

/// How a run that did not hit a fatal error ended
#[derive(Debug)]
pub enum Outcome {
    Applied(ReconcileReport),
    DryRun,
}

impl Outcome {
    /// Registration failures only change the exit status in strict mode.
    pub fn exit_status(&self, strict: bool) -> u8 {
        match self {
            Outcome::Applied(report) if strict && report.has_failures() => 2,
            _ => 0,
        }
    }
}

pub async fn execute(args: &Cli) -> anyhow::Result<Outcome> {
    let config = DesiredConfiguration::load(&args.config)
        .and_then(|config| config.resolve(args.overrides()))
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;

    for issue in config.validate() {
        warn!(%issue, "Configuration issue");
    }

    let reconciler = Reconciler::new(&config);

    if args.dry_run {
        info!("Dry run mode - no changes will be made");
        for (step, call) in reconciler.plan().iter().enumerate() {
            println!("{:>3}. {}", step + 1, call);
        }
        return Ok(Outcome::DryRun);
    }

    let client = HttpControlPlane::new(ClientSettings::from_config(&config, Some(args.timeout)))
        .map_err(|source| SyncError::Connectivity {
            endpoint: config.endpoint.clone(),
            source,
        })?;
    let report = reconciler.run(&client).await?;
    println!("{}", summary(&config, &report));

    Ok(Outcome::Applied(report))
}

fn summary(config: &DesiredConfiguration, report: &ReconcileReport) -> String {
    let mut line = format!(
        "Registered {} of {} server(s); algorithm '{}', retries={}, redispatch={}",
        report.registered.len(),
        config.servers.len(),
        config.algorithm,
        config.retry_policy.retries,
        config.retry_policy.redispatch_value(),
    );
    if report.has_failures() {
        line.push_str(&format!("; not registered: {}", report.failed_servers().join(", ")));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use haproxy_sync::{ControlPlaneError, RegisteredServer};
    use serde_json::json;
    use std::io::Write;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn write_config(endpoint: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        let document = json!({
            "haproxy_endpoint": endpoint,
            "api_key": "secret",
            "load_balancing_algorithm": "roundrobin",
            "backends": [
                { "name": "a", "ip": "10.0.0.1", "port": 8080, "weight": 1 },
                { "name": "b", "ip": "10.0.0.2", "port": 8080, "weight": 1 }
            ],
            "health_check": { "enabled": false, "interval": 5, "fall": 3, "rise": 2 },
            "retry_policy": { "retries": 3, "redispatch": true }
        });
        file.write_all(document.to_string().as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    /// Endpoint and key are passed explicitly so HAPROXY_* variables in the
    /// test environment cannot redirect a run.
    fn args(config: &tempfile::NamedTempFile, endpoint: &str, extra: &[&str]) -> Cli {
        let path = config.path().to_str().unwrap();
        let mut argv = vec![
            "haproxy-sync",
            "--config",
            path,
            "--endpoint",
            endpoint,
            "--api-key",
            "secret",
        ];
        argv.extend_from_slice(extra);
        Cli::try_parse_from(argv).unwrap()
    }

    async fn control_plane(failing_server: Option<&str>) -> MockServer {
        let server = MockServer::start().await;
        if let Some(name) = failing_server {
            Mock::given(method("POST"))
                .and(body_partial_json(json!({ "name": name })))
                .respond_with(ResponseTemplate::new(500))
                .with_priority(1)
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/v2/info"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_successful_run() {
        let server = control_plane(None).await;
        let config = write_config(&server.uri());
        let args = args(&config, &server.uri(), &["--strict"]);

        let outcome = execute(&args).await.unwrap();
        assert_eq!(outcome.exit_status(args.strict), 0);
        match outcome {
            Outcome::Applied(report) => assert_eq!(report.registered.len(), 2),
            other => panic!("Expected applied outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partial_failure_exit_codes() {
        let server = control_plane(Some("a")).await;
        let config = write_config(&server.uri());

        let outcome = execute(&args(&config, &server.uri(), &[])).await.unwrap();
        assert_eq!(outcome.exit_status(false), 0);
        assert_eq!(outcome.exit_status(true), 2);
    }

    #[tokio::test]
    async fn test_dry_run_makes_no_requests() {
        let server = MockServer::start().await;
        let config = write_config(&server.uri());

        let outcome = execute(&args(&config, &server.uri(), &["--dry-run"]))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::DryRun));
        assert!(server
            .received_requests()
            .await
            .unwrap_or_default()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_control_plane_stops_before_changes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/info"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let config = write_config(&server.uri());

        let err = execute(&args(&config, &server.uri(), &[])).await.unwrap_err();
        assert!(
            matches!(err.downcast_ref::<SyncError>(), Some(SyncError::Connectivity { .. })),
            "{err:#}"
        );

        let requests = server.received_requests().await.unwrap_or_default();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url.path(), "/v2/info");
        assert!(!requests
            .iter()
            .any(|request| request.method.as_str() == "POST" || request.method.as_str() == "PUT"));
    }

    #[tokio::test]
    async fn test_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let args = Cli::try_parse_from([
            "haproxy-sync",
            "--config",
            dir.path().join("absent.json").to_str().unwrap(),
            "--endpoint",
            "http://127.0.0.1:5555",
        ])
        .unwrap();

        let err = execute(&args).await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to load configuration"));
    }

    #[test]
    fn test_summary_names_failed_servers_once() {
        let config: DesiredConfiguration = serde_json::from_value(json!({
            "haproxy_endpoint": "http://lb:5555",
            "load_balancing_algorithm": "roundrobin",
            "backends": [
                { "name": "a", "ip": "10.0.0.1", "port": 8080, "weight": 1 },
                { "name": "b", "ip": "10.0.0.2", "port": 8080, "weight": 1 }
            ]
        }))
        .unwrap();
        let report = ReconcileReport {
            registered: vec![RegisteredServer {
                name: "b".to_string(),
                attempts: 1,
            }],
            failures: vec![SyncError::Registration {
                server: "a".to_string(),
                attempts: 3,
                source: ControlPlaneError::Status {
                    status: 500,
                    message: "backend locked".to_string(),
                },
            }],
        };

        let line = summary(&config, &report);
        assert!(line.starts_with("Registered 1 of 2 server(s)"), "{line}");
        assert!(line.ends_with("; not registered: a"), "{line}");
    }
}
