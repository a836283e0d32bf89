use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a runner pod as tracked by the controller.
///
/// `Terminating` is terminal: the only follow-on is deletion of the
/// record once the provider has torn the pod down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Pending,
    Configuring,
    Starting,
    Ready,
    Terminating,
}

impl AgentState {
    pub const ALL: [AgentState; 5] = [
        AgentState::Pending,
        AgentState::Configuring,
        AgentState::Starting,
        AgentState::Ready,
        AgentState::Terminating,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Pending => "pending",
            AgentState::Configuring => "configuring",
            AgentState::Starting => "starting",
            AgentState::Ready => "ready",
            AgentState::Terminating => "terminating",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered agent, keyed by `<namespace>/<pod-name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub runner_name: String,
    pub state: AgentState,
    pub last_transition_time: DateTime<Utc>,
    #[serde(rename = "runnerID")]
    pub runner_id: Option<i64>,
}

impl Agent {
    pub fn new(id: String, runner_name: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            runner_name,
            state: AgentState::Configuring,
            last_transition_time: now,
            runner_id: None,
        }
    }

    pub fn transition(&mut self, state: AgentState, now: DateTime<Utc>) {
        self.state = state;
        self.last_transition_time = now;
    }
}

/// Everything a freshly registered agent needs to configure its runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub agent: Agent,
    #[serde(rename = "targetURL")]
    pub target_url: String,
    pub token: String,
    pub group: String,
    pub labels: Vec<String>,
    pub disable_update: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&AgentState::Configuring).unwrap(),
            r#""configuring""#
        );
        let state: AgentState = serde_json::from_str(r#""terminating""#).unwrap();
        assert_eq!(state, AgentState::Terminating);
    }

    #[test]
    fn agent_wire_shape_is_stable() {
        let agent = Agent::new("ns/p1".into(), "h1".into(), Utc::now());
        let json = serde_json::to_value(&agent).unwrap();

        assert_eq!(json["id"], "ns/p1");
        assert_eq!(json["runnerName"], "h1");
        assert_eq!(json["state"], "configuring");
        assert_eq!(json["runnerID"], serde_json::Value::Null);
        assert!(json["lastTransitionTime"].is_string());

        let decoded: Agent = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, agent);
    }

    #[test]
    fn transition_advances_the_timestamp() {
        let t0 = Utc::now();
        let mut agent = Agent::new("ns/p1".into(), "h1".into(), t0);

        let t1 = t0 + chrono::Duration::seconds(5);
        agent.transition(AgentState::Ready, t1);

        assert_eq!(agent.state, AgentState::Ready);
        assert_eq!(agent.last_transition_time, t1);
    }
}
