//! Broadcast envelope and observer topics.
//!
//! Every frame sent to an observer is an [`Envelope`]:
//!
//! ```json
//! {"type": "alert", "timestamp": 1718000000.25, "data": {...}}
//! ```
//!
//! | `type` | Sent on | Payload |
//! |---|---|---|
//! | `connection` | any topic, once on join | `{status, stream}` |
//! | `telemetry` | `telemetry` | [`TelemetrySnapshot`] |
//! | `alert` | `alerts` | `{alert_type, message, severity, data}` |
//! | `job` | `job` | `{job_id, status, progress, data}` |
//! | `analysis` | `analysis` | `{analysis_type, result}` |
//! | `ping` | any topic | `{}` |
//! | `reply` | requesting connection only | command result |

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{ArmError, TelemetrySnapshot};

// ────────────────────────────────────────────────────────────────────────────
// Topic
// ────────────────────────────────────────────────────────────────────────────

/// The four fixed observer streams.  A connection joins exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    /// Periodic robot snapshots from the telemetry pump.
    Telemetry,
    /// Operator-facing events (connect, e-stop, limits changes, …).
    Alerts,
    /// Job lifecycle updates.
    Job,
    /// Results from the external position evaluator.
    Analysis,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::Telemetry, Topic::Alerts, Topic::Job, Topic::Analysis];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Telemetry => "telemetry",
            Topic::Alerts => "alerts",
            Topic::Job => "job",
            Topic::Analysis => "analysis",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = ArmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telemetry" => Ok(Topic::Telemetry),
            "alerts" => Ok(Topic::Alerts),
            "job" => Ok(Topic::Job),
            "analysis" => Ok(Topic::Analysis),
            other => Err(ArmError::Delivery(format!("unknown topic: {other}"))),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Envelope
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Connection,
    Telemetry,
    Alert,
    Job,
    Analysis,
    Ping,
    Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Started,
    Running,
    Completed,
    Failed,
}

/// Wire-stable frame delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Epoch seconds.
    pub timestamp: f64,
    pub data: Value,
}

impl Envelope {
    /// Build an envelope stamped with the current wall-clock time.
    pub fn new(kind: EnvelopeKind, data: Value) -> Self {
        Self {
            kind,
            timestamp: epoch_seconds(Utc::now()),
            data,
        }
    }

    /// First frame every new connection receives.
    pub fn connection(topic: Topic) -> Self {
        Self::new(
            EnvelopeKind::Connection,
            json!({ "status": "connected", "stream": topic.as_str() }),
        )
    }

    pub fn ping() -> Self {
        Self::new(EnvelopeKind::Ping, json!({}))
    }

    pub fn telemetry(snapshot: &TelemetrySnapshot) -> Result<Self, ArmError> {
        Ok(Self::new(EnvelopeKind::Telemetry, serde_json::to_value(snapshot)?))
    }

    pub fn alert(alert_type: &str, message: &str, severity: Severity, data: Value) -> Self {
        Self::new(
            EnvelopeKind::Alert,
            json!({
                "alert_type": alert_type,
                "message": message,
                "severity": severity,
                "data": data,
            }),
        )
    }

    pub fn job(job_id: &str, status: JobStatus, progress: f64, data: Value) -> Self {
        Self::new(
            EnvelopeKind::Job,
            json!({
                "job_id": job_id,
                "status": status,
                "progress": progress,
                "data": data,
            }),
        )
    }

    pub fn analysis(analysis_type: &str, result: Value) -> Self {
        Self::new(
            EnvelopeKind::Analysis,
            json!({ "analysis_type": analysis_type, "result": result }),
        )
    }

    /// Response to an upstream command, addressed to one connection.
    pub fn reply(op: &str, result: Result<Value, &ArmError>) -> Self {
        let data = match result {
            Ok(value) => json!({ "op": op, "ok": true, "result": value }),
            Err(e) => json!({
                "op": op,
                "ok": false,
                "error": e.to_string(),
                "kind": e.kind(),
            }),
        };
        Self::new(EnvelopeKind::Reply, data)
    }
}

/// Fractional seconds since the Unix epoch.
pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}
