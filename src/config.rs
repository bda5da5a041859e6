//! Bus configuration.

use crate::error::{BusError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Distributed lock settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock name, unique within the namespace.
    pub name: String,

    /// Lease lifetime; a crashed holder blocks others at most this long.
    #[serde(with = "duration_ms")]
    pub ttl: Duration,

    /// Longest a publish waits for the lock before failing.
    #[serde(with = "duration_ms")]
    pub wait: Duration,

    /// Sleep between acquisition attempts.
    #[serde(with = "duration_ms")]
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: "publisher".to_string(),
            ttl: Duration::from_secs(10),
            wait: Duration::from_secs(5),
            retry_interval: Duration::from_millis(20),
        }
    }
}

/// Configuration for a [`Bus`](crate::Bus).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Prefix every topic and backend key lives under. Ends with a dot.
    pub namespace: String,

    pub lock: LockConfig,

    /// Retry count from which reconciliation reads under the lock.
    pub reconcile_lock_iteration: u32,

    /// Heartbeat period.
    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,

    /// Heartbeat topic; `<namespace>ping` when unset.
    pub ping_topic: Option<String>,

    /// Redeliver pending messages before each heartbeat.
    pub ping_flush_pending: bool,

    /// Broker publish endpoint for [`Bus::with_http_broker`](crate::Bus::with_http_broker).
    pub broker_url: Option<String>,

    /// Broker request timeout.
    #[serde(with = "duration_ms")]
    pub broker_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            namespace: "tidemark.".to_string(),
            lock: LockConfig::default(),
            reconcile_lock_iteration: 5,
            ping_interval: Duration::from_secs(15),
            ping_topic: None,
            ping_flush_pending: false,
            broker_url: None,
            broker_timeout: Duration::from_secs(5),
        }
    }
}

impl BusConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TIDEMARK_NAMESPACE`: topic and key namespace (default: tidemark.)
    /// - `TIDEMARK_LOCK_NAME`: publisher lock name (default: publisher)
    /// - `TIDEMARK_LOCK_TTL_MS`: lock lease lifetime (default: 10000)
    /// - `TIDEMARK_LOCK_WAIT_MS`: lock acquisition timeout (default: 5000)
    /// - `TIDEMARK_RECONCILE_LOCK_ITERATION`: locked reconcile threshold (default: 5)
    /// - `TIDEMARK_PING_INTERVAL_MS`: heartbeat period (default: 15000)
    /// - `TIDEMARK_PING_TOPIC`: heartbeat topic (default: <namespace>ping)
    /// - `TIDEMARK_PING_FLUSH`: flush pending messages on heartbeat (default: false)
    /// - `TIDEMARK_BROKER_URL`: broker publish endpoint (default: unset)
    /// - `TIDEMARK_BROKER_TIMEOUT_MS`: broker request timeout (default: 5000)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |name: &str, default: Duration| {
            lookup(name)
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            namespace: lookup("TIDEMARK_NAMESPACE").unwrap_or(defaults.namespace),
            lock: LockConfig {
                name: lookup("TIDEMARK_LOCK_NAME").unwrap_or(defaults.lock.name),
                ttl: millis("TIDEMARK_LOCK_TTL_MS", defaults.lock.ttl),
                wait: millis("TIDEMARK_LOCK_WAIT_MS", defaults.lock.wait),
                retry_interval: defaults.lock.retry_interval,
            },
            reconcile_lock_iteration: lookup("TIDEMARK_RECONCILE_LOCK_ITERATION")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.reconcile_lock_iteration),
            ping_interval: millis("TIDEMARK_PING_INTERVAL_MS", defaults.ping_interval),
            ping_topic: lookup("TIDEMARK_PING_TOPIC"),
            ping_flush_pending: lookup("TIDEMARK_PING_FLUSH")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(defaults.ping_flush_pending),
            broker_url: lookup("TIDEMARK_BROKER_URL"),
            broker_timeout: millis("TIDEMARK_BROKER_TIMEOUT_MS", defaults.broker_timeout),
        }
    }

    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| BusError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the bus cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(BusError::InvalidConfig("namespace must not be empty".into()));
        }
        if !self.namespace.ends_with('.') {
            return Err(BusError::InvalidConfig(format!(
                "namespace {:?} must end with '.'",
                self.namespace
            )));
        }
        if self.lock.name.is_empty() {
            return Err(BusError::InvalidConfig("lock name must not be empty".into()));
        }
        if self.lock.ttl.is_zero() {
            return Err(BusError::InvalidConfig("lock ttl must be positive".into()));
        }
        if self.lock.retry_interval.is_zero() {
            return Err(BusError::InvalidConfig(
                "lock retry interval must be positive".into(),
            ));
        }
        if self.ping_interval.is_zero() {
            return Err(BusError::InvalidConfig("ping interval must be positive".into()));
        }
        Ok(())
    }

    /// Topic the pinger broadcasts on.
    pub fn ping_topic(&self) -> String {
        self.ping_topic
            .clone()
            .unwrap_or_else(|| format!("{}ping", self.namespace))
    }
}

/// Serialize durations as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();
        assert_eq!(config.namespace, "tidemark.");
        assert_eq!(config.lock.name, "publisher");
        assert_eq!(config.reconcile_lock_iteration, 5);
        assert_eq!(config.ping_interval, Duration::from_secs(15));
        assert_eq!(config.ping_topic(), "tidemark.ping");
        assert!(!config.ping_flush_pending);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("TIDEMARK_NAMESPACE", "other."),
            ("TIDEMARK_LOCK_TTL_MS", "250"),
            ("TIDEMARK_PING_FLUSH", "1"),
            ("TIDEMARK_PING_INTERVAL_MS", "not a number"),
            ("TIDEMARK_BROKER_URL", "http://broker/publish"),
        ]
        .into_iter()
        .collect();

        let config = BusConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.namespace, "other.");
        assert_eq!(config.lock.ttl, Duration::from_millis(250));
        assert!(config.ping_flush_pending);
        assert_eq!(config.ping_interval, Duration::from_secs(15));
        assert_eq!(config.broker_url.as_deref(), Some("http://broker/publish"));
        assert_eq!(config.ping_topic(), "other.ping");
    }

    #[test]
    fn test_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus.json");
        std::fs::write(
            &path,
            r#"{"namespace": "app.", "lock": {"wait": 1500}, "ping_topic": "app.heartbeat"}"#,
        )
        .unwrap();

        let config = BusConfig::from_json_file(&path).unwrap();
        assert_eq!(config.namespace, "app.");
        assert_eq!(config.lock.wait, Duration::from_millis(1500));
        assert_eq!(config.lock.ttl, Duration::from_secs(10));
        assert_eq!(config.ping_topic(), "app.heartbeat");
    }

    #[test]
    fn test_json_file_rejects_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bus.json");
        std::fs::write(&path, r#"{"namespace": "app"}"#).unwrap();

        assert!(matches!(
            BusConfig::from_json_file(&path),
            Err(BusError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate() {
        let invalid = [
            BusConfig {
                namespace: String::new(),
                ..BusConfig::default()
            },
            BusConfig {
                lock: LockConfig {
                    ttl: Duration::ZERO,
                    ..LockConfig::default()
                },
                ..BusConfig::default()
            },
            BusConfig {
                ping_interval: Duration::ZERO,
                ..BusConfig::default()
            },
        ];

        for config in invalid {
            assert!(config.validate().is_err(), "{:?}", config);
        }
    }
}
