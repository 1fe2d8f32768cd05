use std::collections::HashMap;

use serde_json::{json, Value};
use sqlx::PgPool;

use crate::cursor::Cursor;
use crate::errors::{Error, Result};
use crate::model::{iso_timestamp, DeviceSummary, Reading};
use crate::{store, validate};

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

/// Validated parameters for a historical range query.
#[derive(Debug)]
pub struct HistoryQuery {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: i64,
    pub cursor: Option<Cursor>,
}

/// Parses and validates raw query-string parameters.
pub fn parse_history_params(
    device_id: &str,
    params: &HashMap<String, String>,
) -> Result<HistoryQuery> {
    let start_time = parse_timestamp_param(params, "start_time")?;
    let end_time = parse_timestamp_param(params, "end_time")?;

    if let (Some(start), Some(end)) = (start_time, end_time) {
        if start >= end {
            return Err(Error::Validation(
                "start_time must be less than end_time".to_string(),
            ));
        }
    }

    let limit = match params.get("limit") {
        Some(raw) => {
            let limit: i64 = raw.parse().map_err(|_| {
                Error::Validation(format!("Invalid limit parameter: '{raw}'"))
            })?;
            if !(1..=MAX_LIMIT).contains(&limit) {
                return Err(Error::Validation(format!(
                    "limit must be between 1 and {MAX_LIMIT}"
                )));
            }
            limit
        }
        None => DEFAULT_LIMIT,
    };

    let cursor = match params.get("next_token") {
        Some(token) => {
            let cursor = Cursor::decode(token)?;
            if cursor.device_id != device_id {
                return Err(Error::Validation(
                    "next_token does not belong to this device".to_string(),
                ));
            }
            Some(cursor)
        }
        None => None,
    };

    Ok(HistoryQuery {
        start_time,
        end_time,
        limit,
        cursor,
    })
}

/// Most recent reading for one device.
pub async fn current_reading(pool: &PgPool, device_id: &str) -> Result<Value> {
    check_device_id(device_id)?;

    match store::current_reading(pool, device_id).await? {
        Some(reading) => Ok(reading_json(&reading, "last_updated")),
        None => Err(Error::NotFound(format!("Device {device_id}"))),
    }
}

/// One page of a device's history, time-ascending, with a continuation token
/// when more readings match the range.
pub async fn history(pool: &PgPool, device_id: &str, query: HistoryQuery) -> Result<Value> {
    check_device_id(device_id)?;

    let (readings, next_cursor) = store::history_page(
        pool,
        device_id,
        query.start_time,
        query.end_time,
        query.limit,
        query.cursor.as_ref(),
    )
    .await?;

    Ok(json!({
        "device_id": device_id,
        "readings": readings
            .iter()
            .map(|r| reading_json(r, "recorded_at"))
            .collect::<Vec<_>>(),
        "total_readings": readings.len(),
        "next_token": next_cursor.map(|c| c.encode()),
    }))
}

/// Every device seen in storage with its aggregates. An empty store yields an
/// empty listing, not an error.
pub async fn list_devices(pool: &PgPool) -> Result<Value> {
    let devices = store::list_devices(pool).await?;

    Ok(json!({
        "devices": devices.iter().map(device_json).collect::<Vec<_>>(),
        "total_devices": devices.len(),
    }))
}

fn check_device_id(device_id: &str) -> Result<()> {
    if validate::is_valid_device_id(device_id) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Invalid device id '{device_id}', expected 12 uppercase hex characters"
        )))
    }
}

fn parse_timestamp_param(params: &HashMap<String, String>, name: &str) -> Result<Option<i64>> {
    match params.get(name) {
        Some(raw) => {
            let value: i64 = raw.parse().map_err(|_| {
                Error::Validation(format!("Invalid {name} parameter: '{raw}'"))
            })?;
            if value < 0 {
                return Err(Error::Validation(format!(
                    "{name} must be a non-negative Unix timestamp"
                )));
            }
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn reading_json(reading: &Reading, iso_field: &str) -> Value {
    let mut v = serde_json::to_value(reading).unwrap_or_default();
    v[iso_field] = Value::String(iso_timestamp(reading.timestamp));
    v
}

fn device_json(device: &DeviceSummary) -> Value {
    let mut v = serde_json::to_value(device).unwrap_or_default();
    v["last_seen_at"] = Value::String(iso_timestamp(device.last_seen));
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: &str = "C29CF3A18C4C";

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let q = parse_history_params(DEVICE, &params(&[])).unwrap();
        assert_eq!(q.limit, DEFAULT_LIMIT);
        assert!(q.start_time.is_none());
        assert!(q.end_time.is_none());
        assert!(q.cursor.is_none());
    }

    #[test]
    fn test_limit_bounds() {
        assert!(parse_history_params(DEVICE, &params(&[("limit", "1")])).is_ok());
        assert!(parse_history_params(DEVICE, &params(&[("limit", "1000")])).is_ok());
        assert!(parse_history_params(DEVICE, &params(&[("limit", "0")])).is_err());
        assert!(parse_history_params(DEVICE, &params(&[("limit", "1001")])).is_err());
        assert!(parse_history_params(DEVICE, &params(&[("limit", "ten")])).is_err());
    }

    #[test]
    fn test_time_range_ordering() {
        let p = params(&[("start_time", "200"), ("end_time", "100")]);
        let err = parse_history_params(DEVICE, &p).unwrap_err();
        assert!(err.to_string().contains("start_time must be less than"));

        let p = params(&[("start_time", "100"), ("end_time", "100")]);
        assert!(parse_history_params(DEVICE, &p).is_err());

        let p = params(&[("start_time", "100"), ("end_time", "200")]);
        assert!(parse_history_params(DEVICE, &p).is_ok());
    }

    #[test]
    fn test_negative_timestamp_rejected() {
        let p = params(&[("start_time", "-5")]);
        assert!(parse_history_params(DEVICE, &p).is_err());
    }

    #[test]
    fn test_valid_cursor_accepted() {
        let token = Cursor::new(DEVICE, 123).encode();
        let q = parse_history_params(DEVICE, &params(&[("next_token", &token)])).unwrap();
        assert_eq!(q.cursor.unwrap().last_ts, 123);
    }

    #[test]
    fn test_cursor_for_other_device_rejected() {
        let token = Cursor::new("D48AF11B2E90", 123).encode();
        let err =
            parse_history_params(DEVICE, &params(&[("next_token", &token)])).unwrap_err();
        assert!(err.to_string().contains("next_token"));
    }

    #[test]
    fn test_garbage_cursor_rejected() {
        assert!(parse_history_params(DEVICE, &params(&[("next_token", "garbage")])).is_err());
    }

    #[test]
    fn test_device_id_check() {
        assert!(check_device_id(DEVICE).is_ok());
        assert!(check_device_id("nope").is_err());
    }
}
