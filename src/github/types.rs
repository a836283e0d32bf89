//! Wire payloads of the target's runners API.

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerPayload {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub busy: bool,
    #[serde(default)]
    pub labels: Vec<RunnerLabel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerLabel {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnersPage {
    pub total_count: i64,
    #[serde(default)]
    pub runners: Vec<RunnerPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationTokenPayload {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}
