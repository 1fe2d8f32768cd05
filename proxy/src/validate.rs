use crate::errors::{Error, Result};
use crate::model::GatewayBatch;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;

const RSSI_MIN: i64 = -120;
const RSSI_MAX: i64 = 0;

// Gateway timestamps further than a day from server time are rejected.
const TIMESTAMP_SKEW_SECS: i64 = 86_400;

lazy_static! {
    static ref GATEWAY_MAC: Regex =
        Regex::new(r"^([0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}$").unwrap();
    static ref DEVICE_ID: Regex = Regex::new(r"^[0-9A-F]{12}$").unwrap();
}

/// Decodes a raw request body into a gateway batch.
pub fn decode_batch(raw: &[u8]) -> Result<GatewayBatch> {
    serde_json::from_slice(raw)
        .map_err(|e| Error::Validation(format!("Invalid request body: {e}")))
}

pub fn is_valid_device_id(device_id: &str) -> bool {
    DEVICE_ID.is_match(device_id)
}

/// Validates a decoded batch against the gateway wire schema.
///
/// The whole batch is rejected on the first offending field; there is no
/// partial acceptance of individual tags.
pub fn validate_batch(batch: &GatewayBatch, now: i64) -> Result<()> {
    let data = &batch.data;

    if !GATEWAY_MAC.is_match(&data.gwmac) {
        return Err(Error::Validation(format!(
            "data.gwmac: invalid gateway MAC address '{}'",
            data.gwmac
        )));
    }

    if data.timestamp < 0 {
        return Err(Error::Validation(format!(
            "data.timestamp: {} must be a non-negative Unix timestamp",
            data.timestamp
        )));
    }

    if (now - data.timestamp).abs() > TIMESTAMP_SKEW_SECS {
        return Err(Error::Validation(format!(
            "data.timestamp: {} is too old or in the future",
            data.timestamp
        )));
    }

    if data.tags.is_empty() {
        return Err(Error::Validation(
            "data.tags: at least one device reading is required".to_string(),
        ));
    }

    for (device_id, tag) in &data.tags {
        if !DEVICE_ID.is_match(device_id) {
            return Err(Error::Validation(format!(
                "data.tags.{device_id}: invalid device id, expected 12 uppercase hex characters"
            )));
        }

        if tag.rssi < RSSI_MIN || tag.rssi > RSSI_MAX {
            return Err(Error::Validation(format!(
                "data.tags.{device_id}.rssi: {} out of range [{RSSI_MIN}, {RSSI_MAX}]",
                tag.rssi
            )));
        }

        if tag.timestamp < 0 {
            return Err(Error::Validation(format!(
                "data.tags.{device_id}.timestamp: {} must be a non-negative Unix timestamp",
                tag.timestamp
            )));
        }

        // Empty payloads are allowed, anything else must be valid base64.
        if !tag.data.is_empty() && BASE64.decode(&tag.data).is_err() {
            return Err(Error::Validation(format!(
                "data.tags.{device_id}.data: not valid base64"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GatewayData, TagReading};
    use std::collections::BTreeMap;

    const NOW: i64 = 1_700_000_000;

    fn tag(rssi: i64, timestamp: i64, data: &str) -> TagReading {
        TagReading {
            rssi,
            timestamp,
            data: data.to_string(),
        }
    }

    fn batch_with(tags: Vec<(&str, TagReading)>) -> GatewayBatch {
        let mut map = BTreeMap::new();
        for (id, t) in tags {
            map.insert(id.to_string(), t);
        }
        GatewayBatch {
            data: GatewayData {
                coordinates: String::new(),
                timestamp: NOW,
                gwmac: "AA:BB:CC:DD:EE:FF".to_string(),
                tags: map,
            },
        }
    }

    #[test]
    fn test_valid_batch() {
        let batch = batch_with(vec![("C29CF3A18C4C", tag(-65, NOW, "BQkX"))]);
        assert!(validate_batch(&batch, NOW).is_ok());
    }

    #[test]
    fn test_invalid_gateway_mac() {
        let mut batch = batch_with(vec![("C29CF3A18C4C", tag(-65, NOW, ""))]);
        batch.data.gwmac = "not-a-mac".to_string();
        let err = validate_batch(&batch, NOW).unwrap_err();
        assert!(err.to_string().contains("data.gwmac"));
    }

    #[test]
    fn test_dashed_gateway_mac_accepted() {
        let mut batch = batch_with(vec![("C29CF3A18C4C", tag(-65, NOW, ""))]);
        batch.data.gwmac = "aa-bb-cc-dd-ee-ff".to_string();
        assert!(validate_batch(&batch, NOW).is_ok());
    }

    #[test]
    fn test_stale_gateway_timestamp() {
        let mut batch = batch_with(vec![("C29CF3A18C4C", tag(-65, NOW, ""))]);
        batch.data.timestamp = NOW - TIMESTAMP_SKEW_SECS - 1;
        let err = validate_batch(&batch, NOW).unwrap_err();
        assert!(err.to_string().contains("data.timestamp"));
    }

    #[test]
    fn test_empty_tags_rejected() {
        let batch = batch_with(vec![]);
        let err = validate_batch(&batch, NOW).unwrap_err();
        assert!(err.to_string().contains("data.tags"));
    }

    #[test]
    fn test_invalid_device_id() {
        let batch = batch_with(vec![("c29cf3a18c4c", tag(-65, NOW, ""))]);
        let err = validate_batch(&batch, NOW).unwrap_err();
        assert!(err.to_string().contains("invalid device id"));
    }

    #[test]
    fn test_rssi_out_of_range() {
        let batch = batch_with(vec![("C29CF3A18C4C", tag(-150, NOW, ""))]);
        let err = validate_batch(&batch, NOW).unwrap_err();
        assert!(err.to_string().contains("rssi"));
    }

    #[test]
    fn test_positive_rssi_rejected() {
        let batch = batch_with(vec![("C29CF3A18C4C", tag(10, NOW, ""))]);
        assert!(validate_batch(&batch, NOW).is_err());
    }

    #[test]
    fn test_invalid_base64_payload() {
        let batch = batch_with(vec![("C29CF3A18C4C", tag(-65, NOW, "!!not base64!!"))]);
        let err = validate_batch(&batch, NOW).unwrap_err();
        assert!(err.to_string().contains("base64"));
    }

    #[test]
    fn test_empty_payload_allowed() {
        let batch = batch_with(vec![("C29CF3A18C4C", tag(-65, NOW, ""))]);
        assert!(validate_batch(&batch, NOW).is_ok());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_batch(b"{not json").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_decode_names_missing_field() {
        let err = decode_batch(br#"{"data":{"timestamp":1,"tags":{}}}"#).unwrap_err();
        assert!(err.to_string().contains("gwmac"));
    }

    #[test]
    fn test_device_id_helper() {
        assert!(is_valid_device_id("C29CF3A18C4C"));
        assert!(!is_valid_device_id("C29CF3A18C4"));
        assert!(!is_valid_device_id("c29cf3a18c4c"));
    }
}
