/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Server definitions as submitted to the control plane

use serde::{Deserialize, Serialize};

use crate::config::{HealthCheckPolicy, ServerSpec};

/// Whether the proxy health checks a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMode {
    Enabled,
    Disabled,
}

/// Body of an add-server request.
///
/// With checks disabled `inter`, `fall` and `rise` are absent from the
/// serialized form, not zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDefinition {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub weight: u32,
    pub check: CheckMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fall: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rise: Option<u32>,
}

impl ServerDefinition {
    pub fn new(spec: &ServerSpec, health_check: &HealthCheckPolicy) -> Self {
        let mut definition = Self {
            name: spec.name.clone(),
            address: spec.address.clone(),
            port: spec.port,
            weight: spec.weight,
            check: CheckMode::Disabled,
            inter: None,
            fall: None,
            rise: None,
        };

        if health_check.enabled {
            definition.check = CheckMode::Enabled;
            definition.inter = Some(health_check.interval());
            definition.fall = Some(health_check.fail_threshold);
            definition.rise = Some(health_check.rise_threshold);
        }

        definition
    }

    pub fn health_checked(&self) -> bool {
        self.check == CheckMode::Enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(enabled: bool) -> HealthCheckPolicy {
        HealthCheckPolicy {
            enabled,
            interval_seconds: 5,
            fail_threshold: 3,
            rise_threshold: 2,
        }
    }

    #[test]
    fn test_health_check_fields_present_when_enabled() {
        let spec = ServerSpec::new("web1", "10.0.0.1", 8080, 10);
        let definition = ServerDefinition::new(&spec, &policy(true));
        assert!(definition.health_checked());

        let json = serde_json::to_value(&definition).unwrap();
        assert_eq!(json["check"], "enabled");
        assert_eq!(json["inter"], "5s");
        assert_eq!(json["fall"], 3);
        assert_eq!(json["rise"], 2);
        assert_eq!(json["weight"], 10);
    }

    #[test]
    fn test_health_check_fields_omitted_when_disabled() {
        let spec = ServerSpec::new("web1", "10.0.0.1", 8080, 10);
        let definition = ServerDefinition::new(&spec, &policy(false));
        assert!(!definition.health_checked());

        let json = serde_json::to_value(&definition).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object["check"], "disabled");
        for field in ["inter", "fall", "rise"] {
            assert!(!object.contains_key(field), "unexpected field {field}");
        }
    }
}
