use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One ingestion request from a gateway, in the Ruuvi Cloud wire format.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayBatch {
    pub data: GatewayData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayData {
    #[serde(default)]
    pub coordinates: String,
    pub timestamp: i64,
    pub gwmac: String,
    pub tags: BTreeMap<String, TagReading>,
}

/// One sensor observation inside a batch, keyed by device id.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagReading {
    pub rssi: i64,
    pub timestamp: i64,
    pub data: String,
}

/// One stored measurement set for one device at one device timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub device_id: String,
    pub gateway_id: String,
    pub timestamp: i64,
    pub server_timestamp: i64,
    pub measurements: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_response: Option<Value>,
    #[serde(skip)]
    pub expires_at: i64,
}

/// Per-device aggregate derived from stored readings, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub gateway_id: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub reading_count: i64,
}

/// `{"result":"success","data":{"action":"inserted"}}` in the upstream format.
pub fn success_envelope() -> Value {
    json!({
        "result": "success",
        "data": { "action": "inserted" }
    })
}

/// `{"result":"error","error":{...}}` in the upstream format.
pub fn error_envelope(code: &str, message: &str) -> Value {
    json!({
        "result": "error",
        "error": { "code": code, "message": message }
    })
}

/// Unix seconds rendered as an ISO-8601 UTC string, `1970-01-01T00:00:00Z` style.
pub fn iso_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_shape() {
        let v = success_envelope();
        assert_eq!(v["result"], "success");
        assert_eq!(v["data"]["action"], "inserted");
    }

    #[test]
    fn test_error_envelope_shape() {
        let v = error_envelope("VALIDATION_ERROR", "bad gwmac");
        assert_eq!(v["result"], "error");
        assert_eq!(v["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(v["error"]["message"], "bad gwmac");
    }

    #[test]
    fn test_iso_timestamp() {
        assert_eq!(iso_timestamp(0), "1970-01-01T00:00:00Z");
        assert_eq!(iso_timestamp(1_700_000_000), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn test_batch_decodes_wire_format() {
        let raw = r#"{
            "data": {
                "coordinates": "",
                "timestamp": 1700000000,
                "gwmac": "AA:BB:CC:DD:EE:FF",
                "tags": {
                    "C29CF3A18C4C": { "rssi": -65, "timestamp": 1700000000, "data": "BQkX" }
                }
            }
        }"#;
        let batch: GatewayBatch = serde_json::from_str(raw).unwrap();
        assert_eq!(batch.data.gwmac, "AA:BB:CC:DD:EE:FF");
        assert_eq!(batch.data.tags.len(), 1);
        assert_eq!(batch.data.tags["C29CF3A18C4C"].rssi, -65);
    }

    #[test]
    fn test_batch_rejects_unknown_fields() {
        let raw = r#"{"data":{"timestamp":1,"gwmac":"AA:BB:CC:DD:EE:FF","tags":{},"extra":true}}"#;
        assert!(serde_json::from_str::<GatewayBatch>(raw).is_err());
    }
}
