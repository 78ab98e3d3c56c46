//! Decoding raw bus messages into typed historian records.
//!
//! Devices in the field emit both camelCase and snake_case keys, flat and
//! multi-metric telemetry shapes, and mixed timestamp encodings; the
//! normalizer accepts all of them.  `line_id` falls back to the second
//! subject segment for `factory.<line>.…` subjects; `time` falls back to the
//! bus message timestamp.

use chrono::{DateTime, TimeZone, Utc};
use fb_bus::BusMessage;
use serde_json::Value;
use uuid::Uuid;

use crate::records::{EventRecord, QualityRecord, QualityResult, TelemetryRecord};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("payload is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` has an unusable value: {detail}")]
    InvalidField { field: &'static str, detail: String },
}

/// Stateless decoder for the three payload families.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    enable_integrity_checks: bool,
}

impl Normalizer {
    pub fn new(enable_integrity_checks: bool) -> Self {
        Normalizer {
            enable_integrity_checks,
        }
    }

    /// Decode a telemetry message.  Flat payloads yield one record;
    /// multi-metric payloads (a `metrics` object) yield one per metric.
    pub fn telemetry(&self, msg: &BusMessage) -> Result<Vec<TelemetryRecord>, NormalizeError> {
        let payload = parse_payload(msg)?;
        let device_id = device_id(&payload, msg)?;
        let line_id = line_id(&payload, &msg.subject);
        let batch_id = get_str(&payload, &["batchId", "batch_id"]);
        let time = timestamp(&payload, msg);

        let mut records = Vec::new();
        if let Some(metrics) = payload.get("metrics").and_then(Value::as_object) {
            for (name, value) in metrics {
                let Some(value) = value.as_f64() else {
                    // Non-numeric entries in a metric map are skipped, not fatal.
                    continue;
                };
                records.push(self.finish_telemetry(TelemetryRecord {
                    time,
                    device_id: device_id.clone(),
                    line_id: line_id.clone(),
                    batch_id: batch_id.clone(),
                    metric_name: name.clone(),
                    value,
                    unit: None,
                    quality_code: 0,
                    checksum: String::new(),
                }));
            }
            if records.is_empty() {
                return Err(NormalizeError::InvalidField {
                    field: "metrics",
                    detail: "no numeric metrics present".to_owned(),
                });
            }
            return Ok(records);
        }

        let metric_name = get_str(&payload, &["metricName", "metric_name", "metric"])
            .ok_or(NormalizeError::MissingField("metric_name"))?;
        let value = payload
            .get("value")
            .and_then(Value::as_f64)
            .ok_or(NormalizeError::MissingField("value"))?;
        records.push(self.finish_telemetry(TelemetryRecord {
            time,
            device_id,
            line_id,
            batch_id,
            metric_name,
            value,
            unit: get_str(&payload, &["unit"]),
            quality_code: payload
                .get("qualityCode")
                .or_else(|| payload.get("quality_code"))
                .and_then(Value::as_i64)
                .unwrap_or(0) as i32,
            checksum: String::new(),
        }));
        Ok(records)
    }

    /// Decode an event or alert message.
    pub fn event(&self, msg: &BusMessage) -> Result<EventRecord, NormalizeError> {
        let payload = parse_payload(msg)?;
        let device_id = device_id(&payload, msg)?;
        let event_type = get_str(&payload, &["eventType", "event_type", "type"])
            .ok_or(NormalizeError::MissingField("event_type"))?;

        let mut record = EventRecord {
            id: Uuid::new_v4(),
            time: timestamp(&payload, msg),
            device_id,
            line_id: line_id(&payload, &msg.subject),
            batch_id: get_str(&payload, &["batchId", "batch_id"]),
            event_type,
            severity: get_str(&payload, &["severity"]).unwrap_or_else(|| "info".to_owned()),
            payload: payload
                .get("payload")
                .cloned()
                .unwrap_or_else(|| payload.clone()),
            correlation_id: get_str(&payload, &["correlationId", "correlation_id"]),
            causation_id: get_str(&payload, &["causationId", "causation_id"]),
            previous_hash: get_str(&payload, &["previousHash", "previous_hash"]),
            checksum: String::new(),
        };
        if self.enable_integrity_checks {
            record.checksum = record.compute_checksum();
        }
        Ok(record)
    }

    /// Decode a quality inspection message.
    pub fn quality(&self, msg: &BusMessage) -> Result<QualityRecord, NormalizeError> {
        let payload = parse_payload(msg)?;
        let device_id = device_id(&payload, msg)?;
        let product_id = get_str(&payload, &["productId", "product_id"])
            .ok_or(NormalizeError::MissingField("product_id"))?;
        let result_str =
            get_str(&payload, &["result"]).ok_or(NormalizeError::MissingField("result"))?;
        let result = QualityResult::parse(&result_str).ok_or(NormalizeError::InvalidField {
            field: "result",
            detail: format!("'{result_str}' is not pass/fail/review"),
        })?;

        let mut record = QualityRecord {
            id: Uuid::new_v4(),
            time: timestamp(&payload, msg),
            device_id,
            line_id: line_id(&payload, &msg.subject),
            batch_id: get_str(&payload, &["batchId", "batch_id"]),
            product_id,
            result,
            defect_type: get_str(&payload, &["defectType", "defect_type"]),
            measurements: payload
                .get("measurements")
                .cloned()
                .unwrap_or(Value::Null),
            image_ref: get_str(&payload, &["imageRef", "image_ref", "imageUrl"]),
            checksum: String::new(),
        };
        if self.enable_integrity_checks {
            record.checksum = record.compute_checksum();
        }
        Ok(record)
    }

    fn finish_telemetry(&self, mut record: TelemetryRecord) -> TelemetryRecord {
        if self.enable_integrity_checks {
            record.checksum = record.compute_checksum();
        }
        record
    }
}

fn parse_payload(msg: &BusMessage) -> Result<Value, NormalizeError> {
    serde_json::from_slice(&msg.payload).map_err(|e| NormalizeError::InvalidJson(e.to_string()))
}

fn get_str(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| payload.get(*k))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

fn device_id(payload: &Value, msg: &BusMessage) -> Result<String, NormalizeError> {
    get_str(payload, &["deviceId", "device_id"])
        .or_else(|| msg.headers.get("device-id").cloned())
        .ok_or(NormalizeError::MissingField("device_id"))
}

/// `line_id` from the payload, else the `<line>` segment of
/// `factory.<line>.…` subjects.
fn line_id(payload: &Value, subject: &str) -> Option<String> {
    get_str(payload, &["lineId", "line_id"]).or_else(|| {
        let mut segments = subject.split('.');
        (segments.next() == Some("factory"))
            .then(|| segments.next().map(ToOwned::to_owned))
            .flatten()
    })
}

/// Payload timestamp (RFC 3339 string or epoch milliseconds), falling back
/// to the bus message timestamp.
fn timestamp(payload: &Value, msg: &BusMessage) -> DateTime<Utc> {
    let candidate = payload
        .get("timestamp")
        .or_else(|| payload.get("time"))
        .or_else(|| payload.get("ts"));
    match candidate {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(msg.timestamp),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(msg.timestamp),
        _ => msg.timestamp,
    }
}
