use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ProgressSnapshot;

// -----------------------------------------------------------------------------
// Channels
// -----------------------------------------------------------------------------

pub const CHANNEL_ORCHESTRATOR_COMMANDS: &str = "fleet_orchestrator_events";

// -----------------------------------------------------------------------------
// Commands (CMD:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "CMD:MONITOR_INSTANCE")]
    MonitorInstance {
        instance_id: Uuid,
        #[serde(default)]
        correlation_id: Option<String>,
    },
    #[serde(rename = "CMD:STOP_MONITORING")]
    StopMonitoring { instance_id: Uuid },
    #[serde(rename = "CMD:SUBMIT_GENERATION")]
    SubmitGeneration { job_id: Uuid },
    #[serde(rename = "CMD:TRACK_JOB")]
    TrackJob {
        job_id: Uuid,
        instance_id: Uuid,
        correlation_id: String,
    },
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::MonitorInstance { .. } => "CMD:MONITOR_INSTANCE",
            Command::StopMonitoring { .. } => "CMD:STOP_MONITORING",
            Command::SubmitGeneration { .. } => "CMD:SUBMIT_GENERATION",
            Command::TrackJob { .. } => "CMD:TRACK_JOB",
        }
    }
}

// -----------------------------------------------------------------------------
// Live push messages (one JSON object per line)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    Progress {
        job: ProgressSnapshot,
    },
    SetupProgress {
        instance_id: Uuid,
        step: u32,
        total_steps: u32,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl HubMessage {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
