use crate::config::TsdbConfig;
use crate::errors::Result;
use crate::metrics::{
    BATCH_SIZE, POINTS_WRITTEN_TOTAL, TS_WRITE_FAILURES_TOTAL, TS_WRITE_LATENCY_SECONDS,
};
use crate::model::{series_path, DataType, StoredPoint, TelemetryPoint, TelemetryValue};
use chrono::{DateTime, Utc};
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MAX_WRITE_ATTEMPTS: u32 = 4;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5_000;
const MAX_TEXT_VALUE_BYTES: usize = 8 * 1024;

/// The whole batch could not be stored after the retry schedule ran out.
#[derive(Debug, thiserror::Error)]
#[error("time-series store unavailable: {0}")]
pub struct TsUnavailable(#[from] sqlx::Error);

/// Result of a batch write. `rejected` carries per-measurement permanent
/// failures; the rest of the batch was stored.
#[derive(Debug, Default)]
pub struct WriteOutcome {
    pub written: usize,
    pub rejected: Vec<RejectedPoint>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RejectedPoint {
    pub measurement: String,
    pub reason: String,
}

/// One aggregate bucket.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AggregateBucket {
    pub bucket_start: DateTime<Utc>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Mean,
    Min,
    Max,
    Sum,
    Count,
}

impl AggregateFn {
    fn as_sql(&self) -> &'static str {
        match self {
            AggregateFn::Mean => "avg(value_num)",
            AggregateFn::Min => "min(value_num)",
            AggregateFn::Max => "max(value_num)",
            AggregateFn::Sum => "sum(value_num)",
            AggregateFn::Count => "count(value_num)::double precision",
        }
    }
}

impl std::str::FromStr for AggregateFn {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mean" => Ok(AggregateFn::Mean),
            "min" => Ok(AggregateFn::Min),
            "max" => Ok(AggregateFn::Max),
            "sum" => Ok(AggregateFn::Sum),
            "count" => Ok(AggregateFn::Count),
            other => Err(format!("unknown aggregate function: {other}")),
        }
    }
}

#[derive(sqlx::FromRow)]
struct PointRow {
    path: String,
    ts: DateTime<Utc>,
    data_type: String,
    bigint_value: Option<i64>,
    double_value: Option<f64>,
    bool_value: Option<bool>,
    text_value: Option<String>,
}

impl PointRow {
    fn into_stored(self, device_id: i64) -> StoredPoint {
        let prefix = format!("{}.", series_path(device_id, ""));
        let measurement = self
            .path
            .strip_prefix(prefix.trim_end_matches('.'))
            .map(|m| m.trim_start_matches('.').to_string())
            .unwrap_or(self.path);
        let value = match self.data_type.as_str() {
            "int" => TelemetryValue::Int(self.bigint_value.unwrap_or_default()),
            "float" => TelemetryValue::Float(self.double_value.unwrap_or_default()),
            "bool" => TelemetryValue::Bool(self.bool_value.unwrap_or_default()),
            _ => TelemetryValue::Text(self.text_value.unwrap_or_default()),
        };
        StoredPoint {
            measurement,
            timestamp: self.ts,
            value,
        }
    }
}

/// Wraps the time-series engine behind a small dedicated pool. Data type per
/// path is fixed at first write; duplicate (path, ts) tuples are no-ops.
#[derive(Clone)]
pub struct TimeSeries {
    pool: PgPool,
}

impl TimeSeries {
    pub async fn connect(cfg: &TsdbConfig) -> Result<Self> {
        info!("connecting to time-series store");
        let pool = PgPoolOptions::new()
            .max_connections(cfg.pool_size)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&cfg.url)
            .await?;
        Ok(Self { pool })
    }

    /// Known data types for the given paths; missing paths have no type yet.
    pub async fn series_types(&self, paths: &[String]) -> Result<HashMap<String, DataType>> {
        if paths.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT path, data_type FROM series WHERE path = ANY($1)")
                .bind(paths)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(path, dt)| dt.parse().ok().map(|dt| (path, dt)))
            .collect())
    }

    /// Writes a point batch. Transient failures retry with exponential
    /// backoff (base 100 ms, factor 2, ceiling 5 s, 4 attempts); permanent
    /// per-point failures land in the outcome instead of failing the batch.
    pub async fn write(
        &self,
        device_id: i64,
        points: Vec<TelemetryPoint>,
    ) -> std::result::Result<WriteOutcome, TsUnavailable> {
        let mut rejected = Vec::new();
        let accepted: Vec<TelemetryPoint> = points
            .into_iter()
            .filter_map(|p| match validate_point(&p) {
                Ok(()) => Some(p),
                Err(reason) => {
                    rejected.push(RejectedPoint {
                        measurement: p.measurement.clone(),
                        reason,
                    });
                    None
                }
            })
            .collect();

        if accepted.is_empty() {
            return Ok(WriteOutcome {
                written: 0,
                rejected,
            });
        }

        let start = Instant::now();
        let mut attempt = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        BATCH_SIZE.set(accepted.len() as f64);

        loop {
            attempt += 1;
            match self.write_batch(device_id, &accepted).await {
                Ok(outcome) => {
                    BATCH_SIZE.set(0.0);
                    TS_WRITE_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
                    POINTS_WRITTEN_TOTAL.inc_by(outcome.written as f64);
                    if attempt > 1 {
                        info!("point batch stored after {attempt} attempts");
                    }
                    rejected.extend(outcome.rejected);
                    return Ok(WriteOutcome {
                        written: outcome.written,
                        rejected,
                    });
                }
                Err(e) if attempt < MAX_WRITE_ATTEMPTS && is_transient_error(&e) => {
                    TS_WRITE_FAILURES_TOTAL.inc();
                    warn!(
                        "time-series write failed (attempt {attempt}/{MAX_WRITE_ATTEMPTS}), retrying in {backoff_ms}ms: {e}"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
                Err(e) => {
                    BATCH_SIZE.set(0.0);
                    TS_WRITE_FAILURES_TOTAL.inc();
                    return Err(TsUnavailable(e));
                }
            }
        }
    }

    /// One transactional attempt: register unseen series, type-check against
    /// the catalog, bulk-insert each type group through UNNEST.
    async fn write_batch(
        &self,
        device_id: i64,
        points: &[TelemetryPoint],
    ) -> std::result::Result<WriteOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let paths: Vec<String> = points.iter().map(|p| p.path.clone()).collect();
        let new_types: Vec<String> = points
            .iter()
            .map(|p| p.value.data_type().as_str().to_string())
            .collect();
        let device_ids: Vec<i64> = vec![device_id; points.len()];

        // First write wins; ON CONFLICT keeps an existing type.
        sqlx::query(
            "INSERT INTO series (path, device_id, data_type) \
             SELECT * FROM UNNEST($1::text[], $2::bigint[], $3::text[]) \
             ON CONFLICT (path) DO NOTHING",
        )
        .bind(&paths)
        .bind(&device_ids)
        .bind(&new_types)
        .execute(&mut *tx)
        .await?;

        let catalog: Vec<(String, String)> =
            sqlx::query_as("SELECT path, data_type FROM series WHERE path = ANY($1)")
                .bind(&paths)
                .fetch_all(&mut *tx)
                .await?;
        let catalog: HashMap<String, DataType> = catalog
            .into_iter()
            .filter_map(|(path, dt)| dt.parse().ok().map(|dt| (path, dt)))
            .collect();

        let mut outcome = WriteOutcome::default();
        let mut ints: Vec<&TelemetryPoint> = Vec::new();
        let mut floats: Vec<&TelemetryPoint> = Vec::new();
        let mut bools: Vec<&TelemetryPoint> = Vec::new();
        let mut texts: Vec<&TelemetryPoint> = Vec::new();

        for point in points {
            let expected = catalog.get(&point.path).copied();
            let actual = point.value.data_type();
            match expected {
                Some(t) if t == actual => match actual {
                    DataType::Int => ints.push(point),
                    DataType::Float => floats.push(point),
                    DataType::Bool => bools.push(point),
                    DataType::Text => texts.push(point),
                },
                Some(t) => {
                    outcome.rejected.push(RejectedPoint {
                        measurement: point.measurement.clone(),
                        reason: format!(
                            "type conflict: series is {}, got {}",
                            t.as_str(),
                            actual.as_str()
                        ),
                    });
                }
                None => {
                    outcome.rejected.push(RejectedPoint {
                        measurement: point.measurement.clone(),
                        reason: "series not registered".to_string(),
                    });
                }
            }
        }

        if !ints.is_empty() {
            let values: Vec<i64> = ints
                .iter()
                .map(|p| match p.value {
                    TelemetryValue::Int(i) => i,
                    _ => unreachable!(),
                })
                .collect();
            insert_group(&mut tx, &ints, "bigint_value", "bigint[]", values).await?;
        }
        if !floats.is_empty() {
            let values: Vec<f64> = floats
                .iter()
                .map(|p| match p.value {
                    TelemetryValue::Float(f) => f,
                    _ => unreachable!(),
                })
                .collect();
            insert_group(&mut tx, &floats, "double_value", "float8[]", values).await?;
        }
        if !bools.is_empty() {
            let values: Vec<bool> = bools
                .iter()
                .map(|p| match p.value {
                    TelemetryValue::Bool(b) => b,
                    _ => unreachable!(),
                })
                .collect();
            insert_group(&mut tx, &bools, "bool_value", "boolean[]", values).await?;
        }
        if !texts.is_empty() {
            let values: Vec<String> = texts
                .iter()
                .map(|p| match &p.value {
                    TelemetryValue::Text(s) => s.clone(),
                    _ => unreachable!(),
                })
                .collect();
            insert_group(&mut tx, &texts, "text_value", "text[]", values).await?;
        }

        tx.commit().await?;
        outcome.written = ints.len() + floats.len() + bools.len() + texts.len();
        debug!(
            "stored {} points for device {device_id} ({} rejected)",
            outcome.written,
            outcome.rejected.len()
        );
        Ok(outcome)
    }

    /// Latest point per measurement, optionally narrowed to one measurement.
    pub async fn query_latest(
        &self,
        device_id: i64,
        measurement: Option<&str>,
    ) -> Result<Vec<StoredPoint>> {
        let mut query = String::from(
            "SELECT DISTINCT ON (p.path) p.path, p.ts, s.data_type, \
                    p.bigint_value, p.double_value, p.bool_value, p.text_value \
             FROM points p JOIN series s ON s.path = p.path \
             WHERE s.device_id = $1",
        );
        if measurement.is_some() {
            query.push_str(" AND p.path = $2");
        }
        query.push_str(" ORDER BY p.path, p.ts DESC");

        let mut q = sqlx::query_as::<_, PointRow>(&query).bind(device_id);
        if let Some(m) = measurement {
            q = q.bind(series_path(device_id, m));
        }
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|r| r.into_stored(device_id)).collect())
    }

    /// Points in [from, to], newest first, bounded by `limit` (≤ 1000).
    pub async fn query_range(
        &self,
        device_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        measurement: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredPoint>> {
        let limit = limit.min(1000);
        let mut query = String::from(
            "SELECT p.path, p.ts, s.data_type, \
                    p.bigint_value, p.double_value, p.bool_value, p.text_value \
             FROM points p JOIN series s ON s.path = p.path \
             WHERE s.device_id = $1 AND p.ts >= $2 AND p.ts <= $3",
        );
        if measurement.is_some() {
            query.push_str(" AND p.path = $4");
        }
        query.push_str(&format!(" ORDER BY p.ts DESC LIMIT {limit}"));

        let mut q = sqlx::query_as::<_, PointRow>(&query)
            .bind(device_id)
            .bind(from)
            .bind(to);
        if let Some(m) = measurement {
            q = q.bind(series_path(device_id, m));
        }
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|r| r.into_stored(device_id)).collect())
    }

    /// Windowed aggregate over one numeric measurement.
    pub async fn query_aggregate(
        &self,
        device_id: i64,
        measurement: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        window: Duration,
        agg: AggregateFn,
    ) -> Result<Vec<AggregateBucket>> {
        let interval = PgInterval {
            months: 0,
            days: 0,
            microseconds: window.as_micros() as i64,
        };
        let query = format!(
            "SELECT date_bin($4, t.ts, to_timestamp(0)) AS bucket_start, {} AS value \
             FROM (SELECT p.ts, COALESCE(p.double_value, p.bigint_value::double precision) AS value_num \
                   FROM points p \
                   WHERE p.path = $1 AND p.ts >= $2 AND p.ts <= $3) t \
             GROUP BY bucket_start ORDER BY bucket_start",
            agg.as_sql()
        );
        let rows: Vec<(DateTime<Utc>, Option<f64>)> = sqlx::query_as(&query)
            .bind(series_path(device_id, measurement))
            .bind(from)
            .bind(to)
            .bind(interval)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(bucket_start, value)| AggregateBucket {
                bucket_start,
                value,
            })
            .collect())
    }

    /// Retention delete for a removed device. Best effort at the call site.
    pub async fn delete_device(&self, device_id: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(
            "DELETE FROM points WHERE path IN (SELECT path FROM series WHERE device_id = $1)",
        )
        .bind(device_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM series WHERE device_id = $1")
            .bind(device_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted.rows_affected())
    }

    pub async fn count_points_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM points WHERE ts >= $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn insert_group<'a, T>(
    tx: &mut sqlx::Transaction<'a, sqlx::Postgres>,
    points: &[&TelemetryPoint],
    column: &str,
    array_type: &str,
    values: Vec<T>,
) -> std::result::Result<(), sqlx::Error>
where
    T: Send + Sync + sqlx::Type<sqlx::Postgres> + for<'q> sqlx::Encode<'q, sqlx::Postgres>,
    Vec<T>: sqlx::Type<sqlx::Postgres> + for<'q> sqlx::Encode<'q, sqlx::Postgres>,
{
    let paths: Vec<String> = points.iter().map(|p| p.path.clone()).collect();
    let timestamps: Vec<DateTime<Utc>> = points.iter().map(|p| p.ts).collect();
    let query = format!(
        "INSERT INTO points (path, ts, {column}) \
         SELECT * FROM UNNEST($1::text[], $2::timestamptz[], $3::{array_type}) \
         ON CONFLICT (path, ts) DO NOTHING"
    );
    sqlx::query(&query)
        .bind(&paths)
        .bind(&timestamps)
        .bind(&values)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn validate_point(point: &TelemetryPoint) -> std::result::Result<(), String> {
    if point.measurement.is_empty() {
        return Err("empty measurement name".to_string());
    }
    if !point
        .measurement
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
    {
        return Err(format!("malformed measurement name: {}", point.measurement));
    }
    if let TelemetryValue::Text(s) = &point.value {
        if s.len() > MAX_TEXT_VALUE_BYTES {
            return Err(format!(
                "text value exceeds {MAX_TEXT_VALUE_BYTES} bytes"
            ));
        }
    }
    Ok(())
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code == "08000" || // connection_exception
            code == "08003" || // connection_does_not_exist
            code == "08006" || // connection_failure
            code == "57P03" || // cannot_connect_now
            code == "53300" // too_many_connections
        }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(measurement: &str, value: TelemetryValue) -> TelemetryPoint {
        TelemetryPoint::new(1, measurement, Utc::now(), value)
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_error(&sqlx::Error::PoolClosed));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_validate_rejects_malformed_names() {
        assert!(validate_point(&point("temperature", TelemetryValue::Float(1.0))).is_ok());
        assert!(validate_point(&point("gps.lat", TelemetryValue::Float(1.0))).is_ok());
        assert!(validate_point(&point("", TelemetryValue::Float(1.0))).is_err());
        assert!(validate_point(&point("temp rature", TelemetryValue::Float(1.0))).is_err());
        assert!(validate_point(&point("x;drop", TelemetryValue::Float(1.0))).is_err());
    }

    #[test]
    fn test_validate_caps_text_values() {
        let small = point("note", TelemetryValue::Text("ok".into()));
        assert!(validate_point(&small).is_ok());
        let big = point("note", TelemetryValue::Text("x".repeat(MAX_TEXT_VALUE_BYTES + 1)));
        assert!(validate_point(&big).is_err());
    }

    #[test]
    fn test_aggregate_fn_parsing() {
        assert_eq!("mean".parse::<AggregateFn>().unwrap(), AggregateFn::Mean);
        assert_eq!("count".parse::<AggregateFn>().unwrap(), AggregateFn::Count);
        assert!("median".parse::<AggregateFn>().is_err());
    }

    #[test]
    fn test_point_row_measurement_extraction() {
        let row = PointRow {
            path: series_path(3, "gps.lat"),
            ts: Utc::now(),
            data_type: "float".to_string(),
            bigint_value: None,
            double_value: Some(48.85),
            bool_value: None,
            text_value: None,
        };
        let stored = row.into_stored(3);
        assert_eq!(stored.measurement, "gps.lat");
        assert_eq!(stored.value, TelemetryValue::Float(48.85));
    }
}
