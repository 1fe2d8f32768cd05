use crate::errors::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// Continuation token for historical range scans.
///
/// Encodes the device and the last timestamp already delivered; the next page
/// resumes strictly after it. The token is opaque to clients but contains
/// nothing they did not already have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub device_id: String,
    pub last_ts: i64,
}

impl Cursor {
    pub fn new(device_id: impl Into<String>, last_ts: i64) -> Self {
        Self {
            device_id: device_id.into(),
            last_ts,
        }
    }

    pub fn encode(&self) -> String {
        // A two-field struct cannot fail to serialize.
        let json = serde_json::to_vec(self).unwrap_or_default();
        BASE64.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(token)
            .map_err(|_| Error::Validation("Invalid next_token parameter".to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| Error::Validation("Invalid next_token parameter".to_string()))
    }
}
