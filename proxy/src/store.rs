use std::time::Duration;

use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, error, info, warn};

use crate::cursor::Cursor;
use crate::errors::{Error, Result};
use crate::metrics::STORE_FAILURES_TOTAL;
use crate::model::{DeviceSummary, Reading};

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Upserts a batch of readings, chunked to `chunk_size` rows per statement.
///
/// A second write for the same `(device_id, ts)` key replaces the stored row,
/// so re-posting an identical batch never duplicates data. Transient database
/// errors are retried a bounded number of times before surfacing.
pub async fn upsert_readings(pool: &PgPool, readings: &[Reading], chunk_size: usize) -> Result<()> {
    if readings.is_empty() {
        return Ok(());
    }

    for chunk in readings.chunks(chunk_size.max(1)) {
        upsert_with_retry(pool, chunk).await?;
    }
    Ok(())
}

async fn upsert_with_retry(pool: &PgPool, batch: &[Reading]) -> Result<()> {
    let mut attempts = 0;
    let max_attempts = 5;

    loop {
        attempts += 1;
        match upsert_chunk(pool, batch).await {
            Ok(()) => return Ok(()),
            Err(e) => match &e {
                Error::Database(db_err) => {
                    if attempts >= max_attempts || !is_transient_error(db_err) {
                        error!(
                            "Reading upsert failed permanently after {} attempts: {}",
                            attempts, e
                        );
                        STORE_FAILURES_TOTAL.inc();
                        return Err(e);
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Reading upsert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, max_attempts, wait_ms, db_err
                    );
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                _ => {
                    error!("Reading upsert failed with non-database error: {}", e);
                    STORE_FAILURES_TOTAL.inc();
                    return Err(e);
                }
            },
        }
    }
}

async fn upsert_chunk(pool: &PgPool, batch: &[Reading]) -> Result<()> {
    let device_ids: Vec<&str> = batch.iter().map(|r| r.device_id.as_str()).collect();
    let timestamps: Vec<i64> = batch.iter().map(|r| r.timestamp).collect();
    let gateway_ids: Vec<&str> = batch.iter().map(|r| r.gateway_id.as_str()).collect();
    let server_timestamps: Vec<i64> = batch.iter().map(|r| r.server_timestamp).collect();
    let measurements: Vec<Value> = batch.iter().map(|r| r.measurements.clone()).collect();
    let upstream_responses: Vec<Option<Value>> =
        batch.iter().map(|r| r.upstream_response.clone()).collect();
    let expires: Vec<i64> = batch.iter().map(|r| r.expires_at).collect();

    let query = r#"
        INSERT INTO readings (device_id, ts, gateway_id, server_ts, measurements, upstream_response, expires_at)
        SELECT * FROM UNNEST($1::text[], $2::bigint[], $3::text[], $4::bigint[], $5::jsonb[], $6::jsonb[], $7::bigint[])
        ON CONFLICT (device_id, ts) DO UPDATE SET
            gateway_id = EXCLUDED.gateway_id,
            server_ts = EXCLUDED.server_ts,
            measurements = EXCLUDED.measurements,
            upstream_response = EXCLUDED.upstream_response,
            expires_at = EXCLUDED.expires_at
        "#;

    sqlx::query(query)
        .bind(&device_ids)
        .bind(&timestamps)
        .bind(&gateway_ids)
        .bind(&server_timestamps)
        .bind(&measurements)
        .bind(&upstream_responses)
        .bind(&expires)
        .execute(pool)
        .await?;

    debug!("Upserted {} readings", batch.len());
    Ok(())
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Connection-class SQLSTATE codes are worth retrying.
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

/// Most recent reading for a device, if any.
pub async fn current_reading(pool: &PgPool, device_id: &str) -> Result<Option<Reading>> {
    let row = sqlx::query(
        r#"
        SELECT device_id, ts, gateway_id, server_ts, measurements, upstream_response, expires_at
        FROM readings
        WHERE device_id = $1
        ORDER BY ts DESC
        LIMIT 1
        "#,
    )
    .bind(device_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| reading_from_row(&r)))
}

/// One page of a device's readings in ascending timestamp order.
///
/// Fetches one row beyond `limit` purely to detect continuation; when more
/// rows match, the returned cursor resumes strictly after the last row of
/// this page, so consecutive pages never overlap and never skip.
pub async fn history_page(
    pool: &PgPool,
    device_id: &str,
    start_time: Option<i64>,
    end_time: Option<i64>,
    limit: i64,
    cursor: Option<&Cursor>,
) -> Result<(Vec<Reading>, Option<Cursor>)> {
    let mut conditions = vec!["device_id = $1".to_string()];
    let mut bind_index = 1;

    if start_time.is_some() {
        bind_index += 1;
        conditions.push(format!("ts >= ${bind_index}"));
    }
    if end_time.is_some() {
        bind_index += 1;
        conditions.push(format!("ts <= ${bind_index}"));
    }
    if cursor.is_some() {
        bind_index += 1;
        conditions.push(format!("ts > ${bind_index}"));
    }

    let query = format!(
        "SELECT device_id, ts, gateway_id, server_ts, measurements, upstream_response, expires_at
         FROM readings
         WHERE {}
         ORDER BY ts ASC
         LIMIT {}",
        conditions.join(" AND "),
        limit + 1
    );

    let mut query_builder = sqlx::query(&query).bind(device_id);
    if let Some(start) = start_time {
        query_builder = query_builder.bind(start);
    }
    if let Some(end) = end_time {
        query_builder = query_builder.bind(end);
    }
    if let Some(c) = cursor {
        query_builder = query_builder.bind(c.last_ts);
    }

    let rows = query_builder.fetch_all(pool).await?;
    let mut readings: Vec<Reading> = rows.iter().map(reading_from_row).collect();

    let next_cursor = if readings.len() as i64 > limit {
        readings.truncate(limit as usize);
        readings
            .last()
            .map(|last| Cursor::new(device_id, last.timestamp))
    } else {
        None
    };

    Ok((readings, next_cursor))
}

/// All distinct devices with first/last-seen aggregates, newest activity
/// first. Full aggregation over the readings table — O(total readings), there
/// is no per-device index beyond the primary key.
pub async fn list_devices(pool: &PgPool) -> Result<Vec<DeviceSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT device_id,
               MIN(ts) AS first_seen,
               MAX(ts) AS last_seen,
               COUNT(*) AS reading_count,
               (ARRAY_AGG(gateway_id ORDER BY ts DESC))[1] AS gateway_id
        FROM readings
        GROUP BY device_id
        ORDER BY last_seen DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| DeviceSummary {
            device_id: row.get("device_id"),
            gateway_id: row.get("gateway_id"),
            first_seen: row.get("first_seen"),
            last_seen: row.get("last_seen"),
            reading_count: row.get("reading_count"),
        })
        .collect())
}

fn reading_from_row(row: &PgRow) -> Reading {
    Reading {
        device_id: row.get("device_id"),
        gateway_id: row.get("gateway_id"),
        timestamp: row.get("ts"),
        server_timestamp: row.get("server_ts"),
        measurements: row.get("measurements"),
        upstream_response: row.get("upstream_response"),
        expires_at: row.get("expires_at"),
    }
}
