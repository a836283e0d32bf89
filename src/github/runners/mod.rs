//! The manager's authoritative view of registered runners.

pub mod synchronizer;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::github::types::RunnerPayload;

/// One registered runner as of a given snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerInstance {
    pub id: i64,
    pub name: String,
    pub is_online: bool,
    pub is_busy: bool,
    pub labels: Vec<String>,
}

impl From<RunnerPayload> for RunnerInstance {
    fn from(payload: RunnerPayload) -> Self {
        Self {
            id: payload.id,
            is_online: payload.status == "online",
            is_busy: payload.busy,
            labels: payload.labels.into_iter().map(|label| label.name).collect(),
            name: payload.name,
        }
    }
}

/// Immutable result of one complete synchronization pass. Epoch 0 is the
/// placeholder before the first pass completes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunnerSnapshot {
    pub epoch: i64,
    pub instances: HashMap<String, RunnerInstance>,
}

impl RunnerSnapshot {
    /// Resolves a runner by name, optionally insisting on a known id.
    pub fn lookup(&self, name: &str, id: Option<i64>) -> Option<&RunnerInstance> {
        let instance = self.instances.get(name)?;
        match id {
            Some(id) if instance.id != id => None,
            _ => Some(instance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::types::RunnerLabel;

    fn instance(id: i64, name: &str) -> RunnerInstance {
        RunnerInstance {
            id,
            name: name.into(),
            is_online: true,
            is_busy: false,
            labels: vec![],
        }
    }

    #[test]
    fn payload_conversion_maps_status_and_labels() {
        let converted: RunnerInstance = RunnerPayload {
            id: 42,
            name: "h1".into(),
            status: "offline".into(),
            busy: true,
            labels: vec![
                RunnerLabel {
                    name: "self-hosted".into(),
                },
                RunnerLabel { name: "gpu".into() },
            ],
        }
        .into();

        assert!(!converted.is_online);
        assert!(converted.is_busy);
        assert_eq!(converted.labels, vec!["self-hosted", "gpu"]);
    }

    #[test]
    fn instance_serializes_with_camel_case_keys() {
        let json = serde_json::to_value(instance(42, "h1")).unwrap();
        assert_eq!(json["isOnline"], true);
        assert_eq!(json["isBusy"], false);
    }

    #[test]
    fn lookup_checks_the_id_when_known() {
        let mut snapshot = RunnerSnapshot::default();
        snapshot.instances.insert("h1".into(), instance(42, "h1"));

        assert!(snapshot.lookup("h1", None).is_some());
        assert!(snapshot.lookup("h1", Some(42)).is_some());
        assert!(snapshot.lookup("h1", Some(43)).is_none());
        assert!(snapshot.lookup("h2", None).is_none());
    }
}
