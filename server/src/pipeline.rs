use crate::cache::Cache;
use crate::errors::ApiError;
use crate::model::{TelemetryPoint, TelemetryValue};
use crate::tsdb::{RejectedPoint, TimeSeries};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Result of one accepted submission.
#[derive(Debug)]
pub enum IngestOutcome {
    Accepted {
        written: usize,
        timestamp: DateTime<Utc>,
    },
    Partial {
        written: usize,
        rejected: Vec<RejectedPoint>,
        timestamp: DateTime<Utc>,
    },
}

/// A submission after the ingress stripped its transport envelope.
#[derive(Debug)]
pub struct Submission {
    pub data: Map<String, Value>,
    pub metadata: Option<Map<String, Value>>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Normalizes heterogeneous payloads into typed points and performs the dual
/// write: liveness first, point batch second. Liveness survives a failed
/// batch write; the device did contact us.
#[derive(Clone)]
pub struct Pipeline {
    tsdb: TimeSeries,
    cache: Cache,
    heartbeat_ttl: Duration,
    max_skew: ChronoDuration,
}

impl Pipeline {
    pub fn new(
        tsdb: TimeSeries,
        cache: Cache,
        heartbeat_ttl: Duration,
        max_skew: ChronoDuration,
    ) -> Self {
        Self {
            tsdb,
            cache,
            heartbeat_ttl,
            max_skew,
        }
    }

    pub async fn ingest(
        &self,
        device_id: i64,
        submission: Submission,
    ) -> Result<IngestOutcome, ApiError> {
        let server_received_at = Utc::now();
        let (timestamp, overridden) =
            effective_timestamp(submission.timestamp, server_received_at, self.max_skew);
        if overridden {
            if let Some(client_ts) = submission.timestamp {
                warn!(
                    "device {device_id} timestamp {client_ts} outside skew tolerance, using server time"
                );
            }
        }

        let (entries, mut rejected) = flatten_data(&submission.data);
        if entries.is_empty() && rejected.is_empty() {
            return Err(ApiError::Validation(
                "telemetry data must contain at least one measurement".to_string(),
            ));
        }

        let mut points: Vec<TelemetryPoint> = entries
            .into_iter()
            .map(|(measurement, value)| {
                TelemetryPoint::new(device_id, &measurement, timestamp, value)
            })
            .collect();
        // Metadata rides along as meta_-prefixed measurements; non-scalar
        // entries are stored as their JSON text.
        if let Some(metadata) = &submission.metadata {
            for (key, value) in metadata {
                let value = convert_value(value)
                    .unwrap_or_else(|| TelemetryValue::Text(value.to_string()));
                points.push(TelemetryPoint::new(
                    device_id,
                    &format!("meta_{key}"),
                    timestamp,
                    value,
                ));
            }
        }

        self.coerce_numeric(&mut points, &mut rejected).await?;

        // Liveness update first; deliberately not rolled back on write failure.
        if let Err(e) = self
            .cache
            .set_online(device_id, server_received_at, self.heartbeat_ttl)
            .await
        {
            warn!("liveness update skipped for device {device_id}: {e}");
        }

        let outcome = self.tsdb.write(device_id, points).await.map_err(|e| {
            warn!("device {device_id}: batch write failed after retries: {e}");
            ApiError::StoreUnavailable(
                "time-series store unreachable, telemetry not stored".to_string(),
            )
        })?;

        rejected.extend(outcome.rejected);
        debug!(
            "device {device_id}: {} points written, {} rejected",
            outcome.written,
            rejected.len()
        );
        if rejected.is_empty() {
            Ok(IngestOutcome::Accepted {
                written: outcome.written,
                timestamp,
            })
        } else {
            Ok(IngestOutcome::Partial {
                written: outcome.written,
                rejected,
                timestamp,
            })
        }
    }

    /// Applies the numeric coercion rule in one place: an integer headed for
    /// a series that is already float becomes float when representable.
    async fn coerce_numeric(
        &self,
        points: &mut Vec<TelemetryPoint>,
        rejected: &mut Vec<RejectedPoint>,
    ) -> Result<(), ApiError> {
        let paths: Vec<String> = points.iter().map(|p| p.path.clone()).collect();
        let known = self
            .tsdb
            .series_types(&paths)
            .await
            .map_err(ApiError::from)?;

        let mut keep = Vec::with_capacity(points.len());
        for mut point in points.drain(..) {
            let existing = known.get(&point.path).copied();
            if let (Some(crate::model::DataType::Float), TelemetryValue::Int(_)) =
                (existing, &point.value)
            {
                match point.value.to_float() {
                    Some(f) => point.value = TelemetryValue::Float(f),
                    None => {
                        rejected.push(RejectedPoint {
                            measurement: point.measurement,
                            reason: "integer too large to represent as float".to_string(),
                        });
                        continue;
                    }
                }
            }
            keep.push(point);
        }
        *points = keep;
        Ok(())
    }
}

/// Picks the effective point timestamp: the client's when within tolerance,
/// the server's otherwise. Returns whether an override happened.
pub fn effective_timestamp(
    client_ts: Option<DateTime<Utc>>,
    server_received_at: DateTime<Utc>,
    max_skew: ChronoDuration,
) -> (DateTime<Utc>, bool) {
    match client_ts {
        None => (server_received_at, false),
        Some(ts) => {
            let skew = (server_received_at - ts).abs();
            if skew > max_skew {
                (server_received_at, true)
            } else {
                (ts, false)
            }
        }
    }
}

/// Flattens one level of nested objects into dotted measurement names and
/// converts leaves to tagged values. Non-scalar leaves are rejected.
pub fn flatten_data(
    data: &Map<String, Value>,
) -> (Vec<(String, TelemetryValue)>, Vec<RejectedPoint>) {
    let mut entries = Vec::new();
    let mut rejected = Vec::new();

    for (key, value) in data {
        match value {
            Value::Object(nested) => {
                for (sub_key, sub_value) in nested {
                    let name = format!("{key}.{sub_key}");
                    match convert_value(sub_value) {
                        Some(v) => entries.push((name, v)),
                        None => rejected.push(RejectedPoint {
                            measurement: name,
                            reason: "value is not a scalar".to_string(),
                        }),
                    }
                }
            }
            other => match convert_value(other) {
                Some(v) => entries.push((key.clone(), v)),
                None => rejected.push(RejectedPoint {
                    measurement: key.clone(),
                    reason: "value is not a scalar".to_string(),
                }),
            },
        }
    }
    (entries, rejected)
}

/// Scalar JSON → tagged value. Arrays, objects, and nulls have no mapping.
pub fn convert_value(value: &Value) -> Option<TelemetryValue> {
    match value {
        Value::Bool(b) => Some(TelemetryValue::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(TelemetryValue::Int(i))
            } else {
                n.as_f64().map(TelemetryValue::Float)
            }
        }
        Value::String(s) => Some(TelemetryValue::Text(s.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_effective_timestamp_passthrough() {
        let now = Utc::now();
        let ts = now - ChronoDuration::hours(1);
        let (effective, overridden) =
            effective_timestamp(Some(ts), now, ChronoDuration::hours(24));
        assert_eq!(effective, ts);
        assert!(!overridden);
    }

    #[test]
    fn test_effective_timestamp_missing_uses_server_time() {
        let now = Utc::now();
        let (effective, overridden) = effective_timestamp(None, now, ChronoDuration::hours(24));
        assert_eq!(effective, now);
        assert!(!overridden);
    }

    #[test]
    fn test_effective_timestamp_skew_override() {
        let now = Utc::now();
        for ts in [now - ChronoDuration::hours(25), now + ChronoDuration::hours(25)] {
            let (effective, overridden) =
                effective_timestamp(Some(ts), now, ChronoDuration::hours(24));
            assert_eq!(effective, now);
            assert!(overridden);
        }
    }

    #[test]
    fn test_flatten_one_level() {
        let data = map(json!({
            "temperature": 22.5,
            "gps": {"lat": 48.85, "lon": 2.35},
        }));
        let (entries, rejected) = flatten_data(&data);
        assert!(rejected.is_empty());
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"temperature"));
        assert!(names.contains(&"gps.lat"));
        assert!(names.contains(&"gps.lon"));
    }

    #[test]
    fn test_flatten_rejects_deep_and_non_scalar_leaves() {
        let data = map(json!({
            "ok": 1,
            "deep": {"nested": {"too": "far"}},
            "list": [1, 2, 3],
            "nothing": null,
        }));
        let (entries, rejected) = flatten_data(&data);
        assert_eq!(entries.len(), 1);
        assert_eq!(rejected.len(), 3);
        let names: Vec<&str> = rejected.iter().map(|r| r.measurement.as_str()).collect();
        assert!(names.contains(&"deep.nested"));
        assert!(names.contains(&"list"));
        assert!(names.contains(&"nothing"));
    }

    #[test]
    fn test_convert_value_tags() {
        assert_eq!(convert_value(&json!(3)), Some(TelemetryValue::Int(3)));
        assert_eq!(convert_value(&json!(3.5)), Some(TelemetryValue::Float(3.5)));
        assert_eq!(convert_value(&json!(true)), Some(TelemetryValue::Bool(true)));
        assert_eq!(
            convert_value(&json!("on")),
            Some(TelemetryValue::Text("on".into()))
        );
        assert_eq!(convert_value(&json!(null)), None);
        assert_eq!(convert_value(&json!([1])), None);
    }
}
