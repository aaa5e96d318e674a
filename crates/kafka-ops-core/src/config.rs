//! Configuration structures for kafka-ops.
//!
//! A config file holds named cluster contexts, one of which is current, plus
//! retry budgets and message pipe defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::retry::RetrySettings;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Context used when none is named on the command line
    #[serde(default)]
    pub current_context: Option<String>,

    /// Named cluster contexts
    #[serde(default)]
    pub contexts: BTreeMap<String, ContextConfig>,

    /// Retry budgets for metadata reads and offset commits
    #[serde(default)]
    pub retry: RetrySettings,

    /// Message pipe defaults
    #[serde(default)]
    pub pipe: PipeOptions,
}

/// A named cluster to talk to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Kafka connection settings
    #[serde(flatten)]
    pub kafka: KafkaConfig,

    /// Schema registry used for Avro payloads
    #[serde(default)]
    pub schema_registry: Option<SchemaRegistryConfig>,
}

/// Kafka cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap servers
    pub bootstrap_servers: Vec<String>,

    /// Security configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// TCP connection tuning
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Security configuration for Kafka connections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Security protocol
    #[serde(default)]
    pub security_protocol: SecurityProtocol,

    /// SASL mechanism (if using SASL)
    #[serde(default)]
    pub sasl_mechanism: Option<SaslMechanism>,

    /// SASL username
    #[serde(default)]
    pub sasl_username: Option<String>,

    /// SASL password
    #[serde(default)]
    pub sasl_password: Option<String>,

    /// Path to CA certificate file (for TLS)
    #[serde(default)]
    pub ssl_ca_location: Option<PathBuf>,

    /// Path to client certificate file (for mTLS)
    #[serde(default)]
    pub ssl_certificate_location: Option<PathBuf>,

    /// Path to client key file (for mTLS)
    #[serde(default)]
    pub ssl_key_location: Option<PathBuf>,
}

/// Security protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

/// SASL mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

/// TCP socket options applied to every broker connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Enable TCP keepalive probes
    #[serde(default = "default_true")]
    pub tcp_keepalive: bool,

    /// Idle time before the first keepalive probe
    #[serde(default = "default_keepalive_time_secs")]
    pub keepalive_time_secs: u64,

    /// Interval between keepalive probes
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Disable Nagle's algorithm
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            tcp_keepalive: true,
            keepalive_time_secs: default_keepalive_time_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            tcp_nodelay: true,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_keepalive_time_secs() -> u64 {
    60
}

fn default_keepalive_interval_secs() -> u64 {
    20
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Schema registry endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRegistryConfig {
    /// Base URL, e.g. `http://localhost:8081`
    pub url: String,

    /// Basic auth username
    #[serde(default)]
    pub username: Option<String>,

    /// Basic auth password
    #[serde(default)]
    pub password: Option<String>,

    /// HTTP request timeout in milliseconds
    #[serde(default = "default_registry_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_registry_timeout_ms() -> u64 {
    10_000
}

/// Message pipe options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeOptions {
    /// Maximum partitions copied concurrently
    #[serde(default = "default_max_concurrent_partitions")]
    pub max_concurrent_partitions: usize,

    /// Maximum records per produce request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum bytes per fetch request
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: i32,

    /// Stop each partition after this many records
    #[serde(default)]
    pub record_limit: Option<u64>,

    /// Take `record_limit` records from the end of each partition instead
    /// of the start
    #[serde(default)]
    pub from_tail: bool,

    /// Keep source record timestamps instead of letting the broker assign
    #[serde(default = "default_true")]
    pub preserve_timestamps: bool,

    /// Copy record headers
    #[serde(default = "default_true")]
    pub keep_headers: bool,

    /// Also run record keys through the codec
    #[serde(default)]
    pub transcode_keys: bool,

    /// Skip records that fail to decode instead of halting the partition
    #[serde(default)]
    pub skip_on_error: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            max_concurrent_partitions: default_max_concurrent_partitions(),
            batch_size: default_batch_size(),
            fetch_max_bytes: default_fetch_max_bytes(),
            record_limit: None,
            from_tail: false,
            preserve_timestamps: true,
            keep_headers: true,
            transcode_keys: false,
            skip_on_error: false,
        }
    }
}

fn default_max_concurrent_partitions() -> usize {
    4
}

fn default_batch_size() -> usize {
    500
}

fn default_fetch_max_bytes() -> i32 {
    1024 * 1024
}

impl Config {
    /// Load and validate a YAML config file.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> crate::Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve a context by name, falling back to `current_context`, then to
    /// the only context if exactly one exists.
    pub fn context(&self, name: Option<&str>) -> crate::Result<&ContextConfig> {
        let name = match name.or(self.current_context.as_deref()) {
            Some(name) => name,
            None if self.contexts.len() == 1 => {
                return self
                    .contexts
                    .values()
                    .next()
                    .ok_or_else(|| crate::Error::Config("No contexts configured".to_string()));
            }
            None => {
                return Err(crate::Error::Config(
                    "No context selected and current_context is not set".to_string(),
                ))
            }
        };
        self.contexts
            .get(name)
            .ok_or_else(|| crate::Error::Config(format!("Unknown context '{}'", name)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(current) = &self.current_context {
            if !self.contexts.contains_key(current) {
                return Err(crate::Error::Config(format!(
                    "current_context '{}' is not defined in contexts",
                    current
                )));
            }
        }

        for (name, context) in &self.contexts {
            if context.kafka.bootstrap_servers.is_empty() {
                return Err(crate::Error::Config(format!(
                    "Context '{}' has no bootstrap_servers",
                    name
                )));
            }
            if let Some(registry) = &context.schema_registry {
                if !(registry.url.starts_with("http://") || registry.url.starts_with("https://")) {
                    return Err(crate::Error::Config(format!(
                        "Context '{}' schema_registry.url must be http(s): {}",
                        name, registry.url
                    )));
                }
            }
        }

        for (label, policy) in [("reads", &self.retry.reads), ("commits", &self.retry.commits)] {
            if policy.max_attempts == 0 {
                return Err(crate::Error::Config(format!(
                    "retry.{}.max_attempts must be >= 1",
                    label
                )));
            }
        }

        self.pipe.validate()
    }
}

impl PipeOptions {
    /// Validate pipe options
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_concurrent_partitions == 0 {
            return Err(crate::Error::Config(
                "pipe.max_concurrent_partitions must be > 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(crate::Error::Config(
                "pipe.batch_size must be > 0".to_string(),
            ));
        }
        if self.fetch_max_bytes <= 0 {
            return Err(crate::Error::Config(
                "pipe.fetch_max_bytes must be > 0".to_string(),
            ));
        }
        if self.from_tail && self.record_limit.is_none() {
            return Err(crate::Error::Config(
                "pipe.from_tail requires pipe.record_limit".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of records to take from the end of each partition, if any.
    pub fn tail_count(&self) -> Option<u64> {
        self.record_limit.filter(|_| self.from_tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
current_context: local
contexts:
  local:
    bootstrap_servers: ["localhost:9092"]
    schema_registry:
      url: http://localhost:8081
  prod:
    bootstrap_servers: ["kafka-1:9093", "kafka-2:9093"]
    security:
      security_protocol: SASL_SSL
      sasl_mechanism: PLAIN
      sasl_username: ops
      sasl_password: secret
retry:
  commits:
    max_attempts: 5
    base_delay_ms: 50
pipe:
  batch_size: 100
"#;

    #[test]
    fn test_load_sample() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.contexts.len(), 2);

        let local = config.context(None).unwrap();
        assert_eq!(local.kafka.bootstrap_servers, vec!["localhost:9092"]);
        assert!(local.schema_registry.is_some());
        assert!(local.kafka.connection.tcp_keepalive);

        let prod = config.context(Some("prod")).unwrap();
        assert_eq!(
            prod.kafka.security.security_protocol,
            SecurityProtocol::SaslSsl
        );
        assert_eq!(prod.kafka.security.sasl_mechanism, Some(SaslMechanism::Plain));

        assert_eq!(config.retry.commits.max_attempts, 5);
        assert_eq!(config.retry.reads.max_attempts, 2);
        assert_eq!(config.pipe.batch_size, 100);
        assert_eq!(config.pipe.max_concurrent_partitions, 4);
        assert!(config.pipe.preserve_timestamps);
    }

    #[test]
    fn test_unknown_context() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert!(config.context(Some("staging")).is_err());
    }

    #[test]
    fn test_single_context_is_implicit() {
        let config = Config::from_yaml(
            r#"
contexts:
  only:
    bootstrap_servers: ["b:9092"]
"#,
        )
        .unwrap();
        assert_eq!(
            config.context(None).unwrap().kafka.bootstrap_servers,
            vec!["b:9092"]
        );
    }

    #[test]
    fn test_validate_rejects_dangling_current_context() {
        let err = Config::from_yaml(
            r#"
current_context: missing
contexts:
  local:
    bootstrap_servers: ["localhost:9092"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_validate_rejects_empty_bootstrap() {
        let result = Config::from_yaml(
            r#"
contexts:
  local:
    bootstrap_servers: []
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = Config::default();
        config.pipe.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kafka-ops.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.current_context.as_deref(), Some("local"));

        assert!(Config::load(&dir.path().join("nope.yaml")).is_err());
    }
}
