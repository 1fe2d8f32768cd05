use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;

/// Gateway batch in the Ruuvi Cloud wire format.
#[derive(Debug, Clone, Serialize)]
pub struct BatchPayload {
    pub data: BatchData,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchData {
    pub coordinates: String,
    pub timestamp: i64,
    pub gwmac: String,
    pub tags: BTreeMap<String, Tag>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tag {
    pub rssi: i64,
    pub timestamp: i64,
    pub data: String,
}

/// One simulated gateway with a fixed set of attached devices.
#[derive(Debug, Clone)]
pub struct Gateway {
    pub gwmac: String,
    pub devices: Vec<String>,
}

impl Gateway {
    pub fn generate(index: usize, device_count: usize, rng: &mut impl Rng) -> Self {
        let gwmac = format!("DE:AD:BE:EF:{:02X}:{:02X}", index / 256, index % 256);
        let devices = (0..device_count).map(|_| random_device_id(rng)).collect();
        Self { gwmac, devices }
    }

    /// Fabricates one batch with a fresh observation per device.
    pub fn make_batch(&self, rng: &mut impl Rng) -> BatchPayload {
        let now = Utc::now().timestamp();
        let mut tags = BTreeMap::new();

        for device_id in &self.devices {
            tags.insert(
                device_id.clone(),
                Tag {
                    rssi: rng.gen_range(-95..=-35),
                    timestamp: now,
                    data: sensor_payload(rng),
                },
            );
        }

        BatchPayload {
            data: BatchData {
                coordinates: String::new(),
                timestamp: now,
                gwmac: self.gwmac.clone(),
                tags,
            },
        }
    }
}

fn random_device_id(rng: &mut impl Rng) -> String {
    (0..12)
        .map(|_| {
            let digit = rng.gen_range(0..16u32);
            std::char::from_digit(digit, 16)
                .unwrap_or('0')
                .to_ascii_uppercase()
        })
        .collect()
}

// Data format 5 style payload: version byte followed by raw sensor bytes.
fn sensor_payload(rng: &mut impl Rng) -> String {
    let mut bytes = vec![0x05u8];
    bytes.extend((0..23).map(|_| rng.gen::<u8>()));
    BASE64.encode(bytes)
}
