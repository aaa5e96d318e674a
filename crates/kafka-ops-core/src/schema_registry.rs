//! Confluent schema registry client.
//!
//! Schemas are immutable once registered, so lookups by id are cached for
//! the lifetime of the client. Subject lookups always go to the registry.

use apache_avro::Schema;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::SchemaRegistryConfig;
use crate::{Error, Result};

/// Schema lookups used by the Avro codec.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Writer schema registered under `id`.
    async fn schema_by_id(&self, id: u32) -> Result<Arc<Schema>>;

    /// Id and schema of the latest version registered for `subject`.
    async fn latest_for_subject(&self, subject: &str) -> Result<(u32, Arc<Schema>)>;
}

#[derive(Debug, Deserialize)]
struct SchemaByIdResponse {
    schema: String,
}

#[derive(Debug, Deserialize)]
struct SubjectVersionResponse {
    id: u32,
    schema: String,
}

/// HTTP client for a schema registry.
pub struct SchemaRegistryClient {
    base_url: String,
    client: reqwest::Client,
    credentials: Option<(String, Option<String>)>,
    cache: Mutex<HashMap<u32, Arc<Schema>>>,
}

impl SchemaRegistryClient {
    pub fn new(config: &SchemaRegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            credentials: config
                .username
                .clone()
                .map(|user| (user, config.password.clone())),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.schemaregistry.v1+json");
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SchemaRegistry(format!(
                "GET {} returned {}: {}",
                url, status, body
            )));
        }
        Ok(response.json().await?)
    }
}

/// Parse a schema definition returned by the registry.
pub fn parse_schema(definition: &str) -> Result<Arc<Schema>> {
    Schema::parse_str(definition)
        .map(Arc::new)
        .map_err(|e| Error::SchemaRegistry(format!("Invalid Avro schema: {}", e)))
}

#[async_trait]
impl SchemaRegistry for SchemaRegistryClient {
    async fn schema_by_id(&self, id: u32) -> Result<Arc<Schema>> {
        if let Some(schema) = self.cache.lock().get(&id) {
            return Ok(schema.clone());
        }

        let response: SchemaByIdResponse = self.get(&format!("/schemas/ids/{}", id)).await?;
        let schema = parse_schema(&response.schema)?;
        self.cache.lock().insert(id, schema.clone());
        Ok(schema)
    }

    async fn latest_for_subject(&self, subject: &str) -> Result<(u32, Arc<Schema>)> {
        let response: SubjectVersionResponse = self
            .get(&format!("/subjects/{}/versions/latest", subject))
            .await?;
        let schema = parse_schema(&response.schema)?;
        self.cache.lock().insert(response.id, schema.clone());
        Ok((response.id, schema))
    }
}

/// Registry held in memory, for tests and offline runs.
#[derive(Default)]
pub struct StaticSchemaRegistry {
    schemas: Mutex<HashMap<u32, Arc<Schema>>>,
    subjects: Mutex<HashMap<String, u32>>,
}

impl StaticSchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `definition` under `id`, as the latest version of `subject`.
    pub fn register(&self, subject: &str, id: u32, definition: &str) -> Result<Arc<Schema>> {
        let schema = parse_schema(definition)?;
        self.schemas.lock().insert(id, schema.clone());
        self.subjects.lock().insert(subject.to_string(), id);
        Ok(schema)
    }
}

#[async_trait]
impl SchemaRegistry for StaticSchemaRegistry {
    async fn schema_by_id(&self, id: u32) -> Result<Arc<Schema>> {
        self.schemas
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::SchemaRegistry(format!("Schema {} not found", id)))
    }

    async fn latest_for_subject(&self, subject: &str) -> Result<(u32, Arc<Schema>)> {
        let id = self
            .subjects
            .lock()
            .get(subject)
            .copied()
            .ok_or_else(|| Error::SchemaRegistry(format!("Subject '{}' not found", subject)))?;
        Ok((id, self.schema_by_id(id).await?))
    }
}
