use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::ConfigCache;
use crate::errors::Result;
use crate::forwarder::{ForwardResult, Forwarder, ForwardingPolicy};
use crate::model::{success_envelope, GatewayBatch, Reading};
use crate::{store, validate};

const SECONDS_PER_DAY: i64 = 86_400;

/// What the ingestion caller gets back.
#[derive(Debug)]
pub enum IngestResponse {
    /// Forwarding succeeded: the upstream response, mirrored verbatim.
    Upstream { status: u16, body: Vec<u8> },
    /// Forwarding skipped or failed but the local write succeeded: a locally
    /// synthesized success in the same wire format.
    Local(Value),
}

/// Processes one gateway batch end to end.
///
/// The batch is forwarded at most once and stored unconditionally; neither
/// side effect is allowed to suppress the other. Only a local storage failure
/// is fatal to the call — upstream trouble degrades to a local success so the
/// gateway never re-sends data we already hold.
pub async fn ingest(
    pool: &PgPool,
    config: &ConfigCache,
    forwarder: &Forwarder,
    raw: &[u8],
    correlation_id: &str,
) -> Result<IngestResponse> {
    let batch = validate::decode_batch(raw)?;
    let now = Utc::now().timestamp();
    validate::validate_batch(&batch, now)?;

    info!(
        "[{}] Ingesting batch from gateway {} with {} device(s)",
        correlation_id,
        batch.data.gwmac,
        batch.data.tags.len()
    );

    // Resolve the forwarding decision once per call so the whole batch sees
    // one consistent view of the configuration.
    let policy = ForwardingPolicy {
        enabled: config.forwarding_enabled().await,
        endpoint: config.ruuvi_cloud_endpoint().await,
        timeout: config.ruuvi_cloud_timeout().await,
        max_retries: config.max_retries().await,
        breaker_threshold: config.circuit_breaker_threshold().await,
    };

    let forward = forwarder.forward(raw, &policy).await;

    // A successful upstream response is attached to the stored rows; a
    // skipped or failed forward stores nothing extra.
    let upstream_response = match &forward {
        ForwardResult::Success { json, .. } if json["result"] == "success" => Some(json.clone()),
        _ => None,
    };

    let retention_days = config.data_retention_days().await;
    let readings = build_readings(&batch, upstream_response, now, retention_days);

    let chunk_size = config.batch_size().await;
    if let Err(e) = store::upsert_readings(pool, &readings, chunk_size).await {
        // No silent data loss: a failed local write fails the call even when
        // the forward already went through.
        warn!("[{}] Local store write failed: {}", correlation_id, e);
        return Err(e);
    }

    match forward {
        ForwardResult::Success { status, body, .. } => {
            info!("[{}] Batch stored and forwarded", correlation_id);
            Ok(IngestResponse::Upstream { status, body })
        }
        ForwardResult::Skipped => {
            info!("[{}] Batch stored, forwarding disabled", correlation_id);
            Ok(IngestResponse::Local(success_envelope()))
        }
        ForwardResult::Failed { reason, message } => {
            warn!(
                "[{}] Batch stored, forwarding degraded ({reason:?}): {message}",
                correlation_id
            );
            Ok(IngestResponse::Local(success_envelope()))
        }
    }
}

fn build_readings(
    batch: &GatewayBatch,
    upstream_response: Option<Value>,
    now: i64,
    retention_days: i64,
) -> Vec<Reading> {
    let data = &batch.data;
    let expires_at = now + retention_days * SECONDS_PER_DAY;

    data.tags
        .iter()
        .map(|(device_id, tag)| Reading {
            device_id: device_id.clone(),
            gateway_id: data.gwmac.clone(),
            timestamp: tag.timestamp,
            server_timestamp: now,
            measurements: json!({
                "rssi": tag.rssi,
                "data": tag.data,
                "gateway_timestamp": data.timestamp,
                "coordinates": data.coordinates,
            }),
            upstream_response: upstream_response.clone(),
            expires_at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GatewayData, TagReading};
    use std::collections::BTreeMap;

    const NOW: i64 = 1_700_000_000;

    fn batch() -> GatewayBatch {
        let mut tags = BTreeMap::new();
        tags.insert(
            "C29CF3A18C4C".to_string(),
            TagReading {
                rssi: -65,
                timestamp: NOW - 3,
                data: "BQkX".to_string(),
            },
        );
        tags.insert(
            "D48AF11B2E90".to_string(),
            TagReading {
                rssi: -80,
                timestamp: NOW - 1,
                data: String::new(),
            },
        );
        GatewayBatch {
            data: GatewayData {
                coordinates: "60.17,24.94".to_string(),
                timestamp: NOW,
                gwmac: "AA:BB:CC:DD:EE:FF".to_string(),
                tags,
            },
        }
    }

    #[test]
    fn test_one_reading_per_tag() {
        let readings = build_readings(&batch(), None, NOW, 90);
        assert_eq!(readings.len(), 2);

        let first = &readings[0];
        assert_eq!(first.device_id, "C29CF3A18C4C");
        assert_eq!(first.gateway_id, "AA:BB:CC:DD:EE:FF");
        assert_eq!(first.timestamp, NOW - 3);
        assert_eq!(first.server_timestamp, NOW);
        assert_eq!(first.measurements["rssi"], -65);
        assert_eq!(first.measurements["gateway_timestamp"], NOW);
        assert_eq!(first.measurements["coordinates"], "60.17,24.94");
        assert!(first.upstream_response.is_none());
    }

    #[test]
    fn test_expiry_follows_retention_at_write_time() {
        let readings = build_readings(&batch(), None, NOW, 7);
        for r in &readings {
            assert_eq!(r.expires_at, NOW + 7 * SECONDS_PER_DAY);
        }
    }

    #[test]
    fn test_upstream_response_attached_to_every_reading() {
        let response = json!({"result":"success","data":{"action":"inserted"}});
        let readings = build_readings(&batch(), Some(response.clone()), NOW, 90);
        for r in &readings {
            assert_eq!(r.upstream_response.as_ref(), Some(&response));
        }
    }
}
