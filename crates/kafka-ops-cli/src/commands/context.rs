//! Resolving the cluster context a command talks to.

use anyhow::{Context as _, Result};
use kafka_ops_core::config::{Config, ContextConfig, KafkaConfig};
use kafka_ops_core::KafkaCluster;
use std::path::PathBuf;
use tracing::{debug, info};

/// Global arguments that pick the config file and context.
pub struct SessionArgs {
    pub config_path: PathBuf,
    pub context: Option<String>,
    pub bootstrap_servers: Vec<String>,
}

impl SessionArgs {
    /// Load the config file. A missing file is fine when bootstrap servers
    /// were given on the command line.
    pub fn config(&self) -> Result<Config> {
        if !self.config_path.exists() && !self.bootstrap_servers.is_empty() {
            debug!(
                "No config at {}, using command line bootstrap servers",
                self.config_path.display()
            );
            return Ok(Config::default());
        }
        Config::load(&self.config_path)
            .with_context(|| format!("Failed to load {}", self.config_path.display()))
    }

    /// The context named on the command line (or the current one), with
    /// command line bootstrap servers applied.
    pub fn resolve(&self, config: &Config, name: Option<&str>) -> Result<ContextConfig> {
        let name = name.or(self.context.as_deref());
        if !self.bootstrap_servers.is_empty() && name.is_none() {
            let mut context = config.context(None).cloned().unwrap_or_else(|_| ContextConfig {
                kafka: KafkaConfig {
                    bootstrap_servers: Vec::new(),
                    security: Default::default(),
                    connection: Default::default(),
                },
                schema_registry: None,
            });
            context.kafka.bootstrap_servers = self.bootstrap_servers.clone();
            return Ok(context);
        }
        Ok(config.context(name)?.clone())
    }
}

/// Connect to the cluster of `context`.
pub async fn connect(config: &Config, context: &ContextConfig) -> Result<KafkaCluster> {
    info!(
        "Connecting to {}",
        context.kafka.bootstrap_servers.join(",")
    );
    let cluster = KafkaCluster::connect(&context.kafka, config.retry.reads)
        .await
        .context("Failed to connect to Kafka")?;
    Ok(cluster)
}
