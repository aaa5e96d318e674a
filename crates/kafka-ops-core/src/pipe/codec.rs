//! Record payload codecs.
//!
//! The pipe treats payloads as opaque bytes unless a codec is configured.
//! [`AvroCodec`] understands the Confluent wire format: a zero magic byte,
//! the schema id as a big-endian u32, then the Avro datum.

use apache_avro::types::Value;
use apache_avro::Schema;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use thiserror::Error;

use crate::schema_registry::SchemaRegistry;

const MAGIC_BYTE: u8 = 0;
const HEADER_LEN: usize = 5;

/// Codec failure. The pipe attaches topic, partition and offset.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("{0}")]
    Decode(String),

    #[error("{0}")]
    Encode(String),
}

/// A decoded payload and the id of the schema it was written with.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub schema_id: u32,
    pub value: Value,
}

/// Decode and encode record payloads.
#[async_trait]
pub trait RecordCodec: Send + Sync {
    async fn decode(&self, payload: &[u8]) -> Result<DecodedPayload, CodecError>;

    async fn encode(&self, payload: &DecodedPayload) -> Result<Bytes, CodecError>;

    /// Whether `payload` must be re-encoded before it is written. When false
    /// the original bytes are copied unchanged.
    fn needs_reencode(&self, payload: &DecodedPayload) -> bool;
}

/// Split a Confluent framed payload into schema id and datum.
pub fn read_wire_header(payload: &[u8]) -> Result<(u32, &[u8]), CodecError> {
    if payload.len() < HEADER_LEN {
        return Err(CodecError::Decode(format!(
            "payload of {} bytes is too short for the wire format header",
            payload.len()
        )));
    }
    if payload[0] != MAGIC_BYTE {
        return Err(CodecError::Decode(format!(
            "unknown magic byte {}",
            payload[0]
        )));
    }
    let id = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    Ok((id, &payload[HEADER_LEN..]))
}

/// Frame an Avro datum with the wire format header.
pub fn write_wire_format(schema_id: u32, datum: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + datum.len());
    buf.put_u8(MAGIC_BYTE);
    buf.put_u32(schema_id);
    buf.put_slice(datum);
    buf.freeze()
}

/// Avro codec backed by a schema registry.
///
/// Without a target schema payloads are only validated: they decode with
/// their writer schema and are copied unchanged. With a target schema every
/// payload written with a different schema id is resolved into the target
/// schema and re-encoded under the target id.
pub struct AvroCodec {
    registry: Arc<dyn SchemaRegistry>,
    target: Option<(u32, Arc<Schema>)>,
}

impl AvroCodec {
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self {
            registry,
            target: None,
        }
    }

    pub fn with_target_schema(mut self, id: u32, schema: Arc<Schema>) -> Self {
        self.target = Some((id, schema));
        self
    }

    /// Target the latest schema of `subject`.
    pub async fn for_subject(
        registry: Arc<dyn SchemaRegistry>,
        subject: &str,
    ) -> crate::Result<Self> {
        let (id, schema) = registry.latest_for_subject(subject).await?;
        Ok(Self::new(registry).with_target_schema(id, schema))
    }

    /// Target the schema registered under `id`.
    pub async fn for_schema_id(registry: Arc<dyn SchemaRegistry>, id: u32) -> crate::Result<Self> {
        let schema = registry.schema_by_id(id).await?;
        Ok(Self::new(registry).with_target_schema(id, schema))
    }

    pub fn target_schema_id(&self) -> Option<u32> {
        self.target.as_ref().map(|(id, _)| *id)
    }
}

#[async_trait]
impl RecordCodec for AvroCodec {
    async fn decode(&self, payload: &[u8]) -> Result<DecodedPayload, CodecError> {
        let (schema_id, mut datum) = read_wire_header(payload)?;
        let schema = self
            .registry
            .schema_by_id(schema_id)
            .await
            .map_err(|e| CodecError::Decode(format!("schema {}: {}", schema_id, e)))?;
        let value = apache_avro::from_avro_datum(&schema, &mut datum, None)
            .map_err(|e| CodecError::Decode(format!("avro decode: {}", e)))?;
        Ok(DecodedPayload { schema_id, value })
    }

    async fn encode(&self, payload: &DecodedPayload) -> Result<Bytes, CodecError> {
        let (schema_id, schema) = match &self.target {
            Some((id, schema)) => (*id, schema.clone()),
            None => {
                let schema = self
                    .registry
                    .schema_by_id(payload.schema_id)
                    .await
                    .map_err(|e| {
                        CodecError::Encode(format!("schema {}: {}", payload.schema_id, e))
                    })?;
                (payload.schema_id, schema)
            }
        };

        let value = payload
            .value
            .clone()
            .resolve(&schema)
            .map_err(|e| CodecError::Encode(format!("schema {}: {}", schema_id, e)))?;
        let datum = apache_avro::to_avro_datum(&schema, value)
            .map_err(|e| CodecError::Encode(format!("avro encode: {}", e)))?;
        Ok(write_wire_format(schema_id, &datum))
    }

    fn needs_reencode(&self, payload: &DecodedPayload) -> bool {
        self.target
            .as_ref()
            .is_some_and(|(id, _)| *id != payload.schema_id)
    }
}
