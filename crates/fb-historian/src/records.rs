//! Typed historian rows for the three payload families.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// One telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub time: DateTime<Utc>,
    pub device_id: String,
    pub line_id: Option<String>,
    pub batch_id: Option<String>,
    pub metric_name: String,
    pub value: f64,
    pub unit: Option<String>,
    pub quality_code: i32,
    /// SHA-256 over (time, device_id, metric_name, value).
    pub checksum: String,
}

impl TelemetryRecord {
    pub fn compute_checksum(&self) -> String {
        integrity_hash(&[
            &rfc3339(self.time),
            &self.device_id,
            &self.metric_name,
            &format!("{}", self.value),
        ])
    }
}

/// One machine/process event or alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub time: DateTime<Utc>,
    pub device_id: String,
    pub line_id: Option<String>,
    pub batch_id: Option<String>,
    pub event_type: String,
    pub severity: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub previous_hash: Option<String>,
    /// SHA-256 over (time, device_id, event_type, severity).
    pub checksum: String,
}

impl EventRecord {
    pub fn compute_checksum(&self) -> String {
        integrity_hash(&[
            &rfc3339(self.time),
            &self.device_id,
            &self.event_type,
            &self.severity,
        ])
    }
}

/// Inspection outcome for one produced unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityResult {
    Pass,
    Fail,
    Review,
}

impl QualityResult {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityResult::Pass => "pass",
            QualityResult::Fail => "fail",
            QualityResult::Review => "review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pass" => QualityResult::Pass,
            "fail" => QualityResult::Fail,
            "review" => QualityResult::Review,
            _ => return None,
        })
    }
}

/// One quality inspection row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRecord {
    pub id: Uuid,
    pub time: DateTime<Utc>,
    pub device_id: String,
    pub line_id: Option<String>,
    pub batch_id: Option<String>,
    pub product_id: String,
    pub result: QualityResult,
    pub defect_type: Option<String>,
    pub measurements: serde_json::Value,
    pub image_ref: Option<String>,
    /// SHA-256 over (time, device_id, batch_id, result).
    pub checksum: String,
}

impl QualityRecord {
    pub fn compute_checksum(&self) -> String {
        integrity_hash(&[
            &rfc3339(self.time),
            &self.device_id,
            self.batch_id.as_deref().unwrap_or(""),
            self.result.as_str(),
        ])
    }
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Lowercase-hex SHA-256 over the pipe-joined fields.
pub(crate) fn integrity_hash(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}
