use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::breaker::DEFAULT_FAILURE_THRESHOLD;
use crate::errors::{Error, Result};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Configuration keys recognized by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    ForwardingEnabled,
    DataRetentionDays,
    RuuviCloudEndpoint,
    RuuviCloudTimeout,
    BatchSize,
    MaxRetries,
    CircuitBreakerThreshold,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 7] = [
        ConfigKey::ForwardingEnabled,
        ConfigKey::DataRetentionDays,
        ConfigKey::RuuviCloudEndpoint,
        ConfigKey::RuuviCloudTimeout,
        ConfigKey::BatchSize,
        ConfigKey::MaxRetries,
        ConfigKey::CircuitBreakerThreshold,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::ForwardingEnabled => "forwarding_enabled",
            ConfigKey::DataRetentionDays => "data_retention_days",
            ConfigKey::RuuviCloudEndpoint => "ruuvi_cloud_endpoint",
            ConfigKey::RuuviCloudTimeout => "ruuvi_cloud_timeout",
            ConfigKey::BatchSize => "batch_size",
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::CircuitBreakerThreshold => "circuit_breaker_threshold",
        }
    }

    /// Compiled-in fallback used when neither cache nor store has a value.
    pub fn default_value(&self) -> ConfigValue {
        match self {
            ConfigKey::ForwardingEnabled => ConfigValue::Bool(true),
            ConfigKey::DataRetentionDays => ConfigValue::Int(90),
            ConfigKey::RuuviCloudEndpoint => {
                ConfigValue::Text("https://network.ruuvi.com/record".to_string())
            }
            ConfigKey::RuuviCloudTimeout => ConfigValue::Int(25),
            ConfigKey::BatchSize => ConfigValue::Int(25),
            ConfigKey::MaxRetries => ConfigValue::Int(3),
            ConfigKey::CircuitBreakerThreshold => {
                ConfigValue::Int(i64::from(DEFAULT_FAILURE_THRESHOLD))
            }
        }
    }

    /// Type and range check applied before any write reaches the store.
    pub fn validate(&self, value: &ConfigValue) -> Result<()> {
        match (self, value) {
            (ConfigKey::ForwardingEnabled, ConfigValue::Bool(_)) => Ok(()),
            (ConfigKey::DataRetentionDays, ConfigValue::Int(v)) => {
                self.check_range(*v, 1, 3650)
            }
            (ConfigKey::RuuviCloudEndpoint, ConfigValue::Text(v)) => {
                if v.starts_with("http://") || v.starts_with("https://") {
                    Ok(())
                } else {
                    Err(self.invalid(format!("'{v}' is not an http(s) URL")))
                }
            }
            (ConfigKey::RuuviCloudTimeout, ConfigValue::Int(v)) => self.check_range(*v, 5, 25),
            (ConfigKey::BatchSize, ConfigValue::Int(v)) => self.check_range(*v, 1, 100),
            (ConfigKey::MaxRetries, ConfigValue::Int(v)) => self.check_range(*v, 0, 10),
            (ConfigKey::CircuitBreakerThreshold, ConfigValue::Int(v)) => {
                self.check_range(*v, 1, 20)
            }
            (_, other) => Err(self.invalid(format!("wrong type: {other:?}"))),
        }
    }

    /// Re-parses a stored string by this key's declared type.
    pub fn parse_value(&self, raw: &str) -> Result<ConfigValue> {
        match self.default_value() {
            ConfigValue::Bool(_) => match raw {
                "true" => Ok(ConfigValue::Bool(true)),
                "false" => Ok(ConfigValue::Bool(false)),
                _ => Err(self.invalid(format!("'{raw}' is not a boolean"))),
            },
            ConfigValue::Int(_) => raw
                .parse::<i64>()
                .map(ConfigValue::Int)
                .map_err(|_| self.invalid(format!("'{raw}' is not an integer"))),
            ConfigValue::Text(_) => Ok(ConfigValue::Text(raw.to_string())),
        }
    }

    fn check_range(&self, v: i64, min: i64, max: i64) -> Result<()> {
        if v < min || v > max {
            Err(self.invalid(format!("{v} out of range [{min}, {max}]")))
        } else {
            Ok(())
        }
    }

    fn invalid(&self, reason: String) -> Error {
        Error::ConfigValidation {
            key: self.as_str().to_string(),
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl ConfigValue {
    /// Canonical string form stored in the config table.
    pub fn serialize(&self) -> String {
        match self {
            ConfigValue::Bool(b) => b.to_string(),
            ConfigValue::Int(i) => i.to_string(),
            ConfigValue::Text(s) => s.clone(),
        }
    }

    pub fn as_json(&self) -> serde_json::Value {
        match self {
            ConfigValue::Bool(b) => serde_json::Value::Bool(*b),
            ConfigValue::Int(i) => serde_json::Value::from(*i),
            ConfigValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// One recognized key as seen by the admin API.
#[derive(Debug, Clone)]
pub struct ConfigEntryInfo {
    pub value: ConfigValue,
    pub last_updated: Option<i64>,
    pub updated_by: String,
    pub is_default: bool,
}

#[derive(Debug, Clone)]
struct CachedEntry {
    value: ConfigValue,
    fetched_at: Instant,
}

/// Write-through configuration cache over the durable config table.
///
/// Reads are served from memory while an entry is younger than the TTL; an
/// expired entry triggers a synchronous refresh, and a failed refresh falls
/// back to the stale value rather than surfacing the store error.
pub struct ConfigCache {
    pool: PgPool,
    ttl: Duration,
    entries: RwLock<HashMap<ConfigKey, CachedEntry>>,
}

impl ConfigCache {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Pre-loads every recognized key so steady-state reads never have to
    /// block on the store. Missing or unreadable keys simply stay on their
    /// defaults.
    pub async fn warm(&self) {
        for key in ConfigKey::ALL {
            self.get(key).await;
        }
    }

    /// Current value for a key: fresh cache entry, else durable store, else
    /// stale cache entry (store unavailable), else compiled-in default.
    pub async fn get(&self, key: ConfigKey) -> ConfigValue {
        {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(&key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return entry.value.clone();
                }
            }
        }

        match self.fetch(key).await {
            Ok(Some(value)) => {
                self.store_entry(key, value.clone());
                value
            }
            Ok(None) => key.default_value(),
            Err(e) => {
                warn!("Config refresh for '{}' failed: {}", key.as_str(), e);
                let stale = {
                    let entries = self
                        .entries
                        .read()
                        .unwrap_or_else(PoisonError::into_inner);
                    entries.get(&key).map(|entry| entry.value.clone())
                };
                stale.unwrap_or_else(|| key.default_value())
            }
        }
    }

    pub async fn forwarding_enabled(&self) -> bool {
        match self.get(ConfigKey::ForwardingEnabled).await {
            ConfigValue::Bool(b) => b,
            _ => true,
        }
    }

    pub async fn data_retention_days(&self) -> i64 {
        self.get_int(ConfigKey::DataRetentionDays).await
    }

    pub async fn ruuvi_cloud_endpoint(&self) -> String {
        match self.get(ConfigKey::RuuviCloudEndpoint).await {
            ConfigValue::Text(s) => s,
            other => other.serialize(),
        }
    }

    pub async fn ruuvi_cloud_timeout(&self) -> Duration {
        Duration::from_secs(self.get_int(ConfigKey::RuuviCloudTimeout).await.max(0) as u64)
    }

    pub async fn batch_size(&self) -> usize {
        self.get_int(ConfigKey::BatchSize).await.max(1) as usize
    }

    pub async fn max_retries(&self) -> u32 {
        self.get_int(ConfigKey::MaxRetries).await.max(0) as u32
    }

    pub async fn circuit_breaker_threshold(&self) -> u32 {
        self.get_int(ConfigKey::CircuitBreakerThreshold).await.max(1) as u32
    }

    /// Validates and writes a value through to the store, then replaces the
    /// cache entry. Invalid values are rejected before anything is written.
    pub async fn set(&self, key: ConfigKey, value: ConfigValue, actor: &str) -> Result<i64> {
        key.validate(&value)?;

        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO config (config_key, config_value, last_updated, updated_by)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (config_key) DO UPDATE SET
                config_value = EXCLUDED.config_value,
                last_updated = EXCLUDED.last_updated,
                updated_by = EXCLUDED.updated_by
            "#,
        )
        .bind(key.as_str())
        .bind(value.serialize())
        .bind(now)
        .bind(actor)
        .execute(&self.pool)
        .await?;

        self.store_entry(key, value.clone());
        info!(
            "Configuration updated: {} = {} by {}",
            key.as_str(),
            value.serialize(),
            actor
        );
        Ok(now)
    }

    /// Durable view of one key for the admin API, default-filled when the key
    /// has never been written. Store failures degrade to the default rather
    /// than failing the read.
    pub async fn entry(&self, key: ConfigKey) -> ConfigEntryInfo {
        let row = sqlx::query(
            "SELECT config_value, last_updated, updated_by FROM config WHERE config_key = $1",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some(row)) => {
                let raw: String = row.get("config_value");
                match key.parse_value(&raw) {
                    Ok(value) => ConfigEntryInfo {
                        value,
                        last_updated: Some(row.get("last_updated")),
                        updated_by: row.get("updated_by"),
                        is_default: false,
                    },
                    Err(e) => {
                        warn!("Stored config for '{}' is unreadable: {}", key.as_str(), e);
                        Self::default_entry(key)
                    }
                }
            }
            Ok(None) => Self::default_entry(key),
            Err(e) => {
                warn!("Config read for '{}' failed: {}", key.as_str(), e);
                Self::default_entry(key)
            }
        }
    }

    async fn fetch(&self, key: ConfigKey) -> Result<Option<ConfigValue>> {
        let row = sqlx::query("SELECT config_value FROM config WHERE config_key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let raw: String = row.get("config_value");
                match key.parse_value(&raw) {
                    Ok(value) => Ok(Some(value)),
                    Err(e) => {
                        warn!("Stored config for '{}' is unreadable: {}", key.as_str(), e);
                        Ok(None)
                    }
                }
            }
            None => Ok(None),
        }
    }

    async fn get_int(&self, key: ConfigKey) -> i64 {
        match self.get(key).await {
            ConfigValue::Int(i) => i,
            other => {
                warn!(
                    "Config '{}' has unexpected value {:?}, using default",
                    key.as_str(),
                    other
                );
                match key.default_value() {
                    ConfigValue::Int(i) => i,
                    _ => 0,
                }
            }
        }
    }

    fn store_entry(&self, key: ConfigKey, value: ConfigValue) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key,
            CachedEntry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    fn default_entry(key: ConfigKey) -> ConfigEntryInfo {
        ConfigEntryInfo {
            value: key.default_value(),
            last_updated: None,
            updated_by: "default".to_string(),
            is_default: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(
            ConfigKey::ForwardingEnabled.default_value(),
            ConfigValue::Bool(true)
        );
        assert_eq!(
            ConfigKey::DataRetentionDays.default_value(),
            ConfigValue::Int(90)
        );
        assert_eq!(
            ConfigKey::CircuitBreakerThreshold.default_value(),
            ConfigValue::Int(5)
        );
    }

    #[test]
    fn test_retention_range() {
        let key = ConfigKey::DataRetentionDays;
        assert!(key.validate(&ConfigValue::Int(1)).is_ok());
        assert!(key.validate(&ConfigValue::Int(3650)).is_ok());
        assert!(key.validate(&ConfigValue::Int(0)).is_err());
        assert!(key.validate(&ConfigValue::Int(5000)).is_err());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let err = ConfigKey::ForwardingEnabled
            .validate(&ConfigValue::Int(1))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { .. }));
        assert!(err.to_string().contains("forwarding_enabled"));
    }

    #[test]
    fn test_endpoint_must_be_url() {
        let key = ConfigKey::RuuviCloudEndpoint;
        assert!(key
            .validate(&ConfigValue::Text("https://network.ruuvi.com".into()))
            .is_ok());
        assert!(key
            .validate(&ConfigValue::Text("ftp://network.ruuvi.com".into()))
            .is_err());
    }

    #[test]
    fn test_timeout_range() {
        let key = ConfigKey::RuuviCloudTimeout;
        assert!(key.validate(&ConfigValue::Int(5)).is_ok());
        assert!(key.validate(&ConfigValue::Int(25)).is_ok());
        assert!(key.validate(&ConfigValue::Int(4)).is_err());
        assert!(key.validate(&ConfigValue::Int(26)).is_err());
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        for key in ConfigKey::ALL {
            let value = key.default_value();
            let parsed = key.parse_value(&value.serialize()).unwrap();
            assert_eq!(parsed, value, "round trip for {}", key.as_str());
        }
    }

    #[test]
    fn test_parse_rejects_wrong_type() {
        assert!(ConfigKey::ForwardingEnabled.parse_value("maybe").is_err());
        assert!(ConfigKey::MaxRetries.parse_value("three").is_err());
    }
}
