//! The parsed deployment blueprint.
//!
//! A blueprint is the desired-state value handed to the system over the
//! Deploy RPC: machines to boot, containers to run, labels grouping them,
//! connection policy between labels, and placement constraints. The policy
//! language that produces it lives outside this repository; here it is a
//! fixed JSON schema plus the validation the engine relies on.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The reserved label naming the public internet. Connections to or from it
/// become cloud-firewall application ports rather than container wiring.
pub const PUBLIC: &str = "public";

/// Hard cap on the number of machines a single blueprint may request.
pub const MAX_MACHINES: usize = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlueprintError {
    #[error("malformed blueprint: {0}")]
    Malformed(String),

    #[error("port range {min}-{max} is invalid: ports lie in [1, 65535] and min <= max")]
    BadPortRange { min: u16, max: u16 },

    #[error("duplicate label: {0}")]
    DuplicateLabel(String),

    #[error("connection references unknown label: {0}")]
    UnknownLabel(String),

    #[error("label {label} references unknown container: {container}")]
    UnknownContainer { label: String, container: String },

    #[error("blueprint requests {0} machines; the maximum is {MAX_MACHINES}")]
    TooManyMachines(usize),
}

/// An inclusive numeric requirement, e.g. RAM or CPU bounds for machine size
/// selection. `max = 0` means unbounded above.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Range {
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
}

impl Range {
    /// Whether `value` satisfies this range.
    pub fn accepts(&self, value: f64) -> bool {
        value >= self.min && (self.max == 0.0 || value <= self.max)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintMachine {
    pub provider: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub disk_size: u32,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub ram: Range,
    #[serde(default)]
    pub cpu: Range,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintContainer {
    /// Stable identity; survives rescheduling.
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintLabel {
    pub name: String,
    /// Container IDs implementing this label.
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintConnection {
    pub from: String,
    pub to: String,
    pub min_port: u16,
    pub max_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintPlacement {
    pub target_label: String,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub other_label: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub region: String,
}

/// The desired state of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub machines: Vec<BlueprintMachine>,
    #[serde(default)]
    pub containers: Vec<BlueprintContainer>,
    #[serde(default)]
    pub labels: Vec<BlueprintLabel>,
    #[serde(default)]
    pub connections: Vec<BlueprintConnection>,
    #[serde(default)]
    pub placements: Vec<BlueprintPlacement>,
    #[serde(default)]
    pub admin_acls: Vec<String>,
    #[serde(default)]
    pub max_price: f64,
}

impl Blueprint {
    /// Parse and validate a blueprint from its JSON encoding.
    pub fn from_json(json: &str) -> Result<Blueprint, BlueprintError> {
        let blueprint: Blueprint =
            serde_json::from_str(json).map_err(|e| BlueprintError::Malformed(e.to_string()))?;
        blueprint.validate()?;
        Ok(blueprint)
    }

    /// Canonical JSON encoding, as stored in the Cluster row.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("blueprint serialization cannot fail")
    }

    /// Enforce the cross-field constraints the engine depends on.
    pub fn validate(&self) -> Result<(), BlueprintError> {
        if self.machines.len() > MAX_MACHINES {
            return Err(BlueprintError::TooManyMachines(self.machines.len()));
        }

        let mut names = HashSet::new();
        for label in &self.labels {
            if !names.insert(label.name.as_str()) {
                return Err(BlueprintError::DuplicateLabel(label.name.clone()));
            }
        }

        let containers: HashSet<&str> =
            self.containers.iter().map(|c| c.id.as_str()).collect();
        for label in &self.labels {
            for id in &label.ids {
                if !containers.contains(id.as_str()) {
                    return Err(BlueprintError::UnknownContainer {
                        label: label.name.clone(),
                        container: id.clone(),
                    });
                }
            }
        }

        for conn in &self.connections {
            if conn.min_port == 0 || conn.min_port > conn.max_port {
                return Err(BlueprintError::BadPortRange {
                    min: conn.min_port,
                    max: conn.max_port,
                });
            }
            for end in [&conn.from, &conn.to] {
                if end != PUBLIC && !names.contains(end.as_str()) {
                    return Err(BlueprintError::UnknownLabel(end.clone()));
                }
            }
        }

        Ok(())
    }

    /// Labels of containers reachable from the public internet, with their
    /// port ranges. These become cloud-firewall application ports.
    pub fn public_ports(&self) -> Vec<(u16, u16)> {
        self.connections
            .iter()
            .filter(|c| c.from == PUBLIC)
            .map(|c| (c.min_port, c.max_port))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Blueprint {
        Blueprint {
            namespace: "test-deploy".to_string(),
            machines: vec![BlueprintMachine {
                provider: "Amazon".to_string(),
                role: "Master".to_string(),
                size: "m4.large".to_string(),
                ..Default::default()
            }],
            containers: vec![BlueprintContainer {
                id: "c1".to_string(),
                image: "nginx".to_string(),
                ..Default::default()
            }],
            labels: vec![BlueprintLabel {
                name: "web".to_string(),
                ids: vec!["c1".to_string()],
            }],
            connections: vec![BlueprintConnection {
                from: PUBLIC.to_string(),
                to: "web".to_string(),
                min_port: 80,
                max_port: 80,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn json_round_trip() {
        let blueprint = minimal();
        let parsed = Blueprint::from_json(&blueprint.to_json()).unwrap();
        assert_eq!(parsed, blueprint);
    }

    #[test]
    fn missing_fields_default() {
        let blueprint = Blueprint::from_json(r#"{"namespace": "n"}"#).unwrap();
        assert_eq!(blueprint.namespace, "n");
        assert!(blueprint.machines.is_empty());
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(matches!(
            Blueprint::from_json("{not json"),
            Err(BlueprintError::Malformed(_))
        ));
    }

    #[test]
    fn zero_port_rejected() {
        let mut blueprint = minimal();
        blueprint.connections[0].min_port = 0;
        assert!(matches!(
            blueprint.validate(),
            Err(BlueprintError::BadPortRange { .. })
        ));
    }

    #[test]
    fn inverted_range_rejected() {
        let mut blueprint = minimal();
        blueprint.connections[0].min_port = 90;
        blueprint.connections[0].max_port = 80;
        assert!(matches!(
            blueprint.validate(),
            Err(BlueprintError::BadPortRange { min: 90, max: 80 })
        ));
    }

    #[test]
    fn duplicate_labels_rejected() {
        let mut blueprint = minimal();
        blueprint.labels.push(blueprint.labels[0].clone());
        assert_eq!(
            blueprint.validate(),
            Err(BlueprintError::DuplicateLabel("web".to_string()))
        );
    }

    #[test]
    fn connection_to_unknown_label_rejected() {
        let mut blueprint = minimal();
        blueprint.connections[0].to = "ghost".to_string();
        assert_eq!(
            blueprint.validate(),
            Err(BlueprintError::UnknownLabel("ghost".to_string()))
        );
    }

    #[test]
    fn label_with_unknown_container_rejected() {
        let mut blueprint = minimal();
        blueprint.labels[0].ids.push("ghost".to_string());
        assert!(matches!(
            blueprint.validate(),
            Err(BlueprintError::UnknownContainer { .. })
        ));
    }

    #[test]
    fn machine_cap_enforced() {
        let mut blueprint = minimal();
        blueprint.machines = vec![blueprint.machines[0].clone(); MAX_MACHINES + 1];
        assert_eq!(
            blueprint.validate(),
            Err(BlueprintError::TooManyMachines(MAX_MACHINES + 1))
        );
    }

    #[test]
    fn public_ports_collects_inbound_connections() {
        let blueprint = minimal();
        assert_eq!(blueprint.public_ports(), vec![(80, 80)]);
    }

    #[test]
    fn range_accepts_with_open_upper_bound() {
        let r = Range { min: 2.0, max: 0.0 };
        assert!(r.accepts(2.0));
        assert!(r.accepts(512.0));
        assert!(!r.accepts(1.0));
    }
}
