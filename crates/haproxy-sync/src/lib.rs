/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! # haproxy-sync
//!
//! Applies a declarative load-balancer configuration to a running HAProxy
//! through its administrative API:
//!
//! - Backend server registration with bounded per-server retry
//! - Health-check parameters (interval, fall, rise)
//! - Load-balancing algorithm selection
//! - Proxy retry count and redispatch option
//!
//! Connectivity, algorithm and retry-policy failures abort a run. A server
//! that cannot be registered is recorded in the [`ReconcileReport`] and the
//! remaining servers are still applied.

pub mod client;
pub mod config;
pub mod error;
pub mod reconcile;
pub mod server;

pub use client::{ClientSettings, ControlPlane, HttpControlPlane};
pub use config::{
    ConnectionOverrides, DesiredConfiguration, HealthCheckPolicy, RetryPolicy, ServerSpec,
};
pub use error::{ConfigLoadError, ConfigStage, ControlPlaneError, Result, SyncError};
pub use reconcile::{
    PlannedCall, ReconcileReport, Reconciler, RegisteredServer, Stage,
    MAX_SERVER_REGISTRATION_ATTEMPTS,
};
pub use server::{CheckMode, ServerDefinition};
