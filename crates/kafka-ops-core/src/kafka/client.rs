//! Kafka client for protocol-level communication.

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, RequestHeader, ResponseHeader};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::protocol::{Decodable, Encodable};
use socket2::{SockRef, TcpKeepalive};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::config::{KafkaConfig, SaslMechanism, SecurityProtocol};
use crate::error::KafkaError;
use crate::Result;

use super::FetchResponse;
use super::ProduceResponse;
use crate::types::PipeRecord;

const CLIENT_ID: &str = "kafka-ops";

/// Kafka client for protocol-level operations.
///
/// Holds a single broker connection. Requests on one client are serialized;
/// a connection that fails mid-request is dropped and re-established on the
/// next request.
pub struct KafkaClient {
    /// Configuration
    config: KafkaConfig,

    /// Connection to the current broker
    connection: Arc<Mutex<Option<BrokerConnection>>>,

    /// Correlation ID counter
    correlation_id: AtomicI32,
}

/// A stream that can be either plain TCP or TLS-wrapped
enum ConnectionStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ConnectionStream {
    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            ConnectionStream::Plain(s) => {
                s.read_exact(buf).await?;
                Ok(())
            }
            ConnectionStream::Tls(s) => {
                s.read_exact(buf).await?;
                Ok(())
            }
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            ConnectionStream::Plain(s) => s.write_all(buf).await,
            ConnectionStream::Tls(s) => s.write_all(buf).await,
        }
    }
}

struct BrokerConnection {
    stream: ConnectionStream,
    address: String,
}

impl KafkaClient {
    /// Create a new Kafka client
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            connection: Arc::new(Mutex::new(None)),
            correlation_id: AtomicI32::new(1),
        }
    }

    /// Comma-separated list of the servers this client may connect to.
    pub fn servers(&self) -> String {
        self.config.bootstrap_servers.join(",")
    }

    /// Request timeout as the broker-side `timeout_ms` field.
    pub fn request_timeout_ms(&self) -> i32 {
        i32::try_from(self.config.connection.request_timeout_ms).unwrap_or(i32::MAX)
    }

    /// Connect to the Kafka cluster
    pub async fn connect(&self) -> Result<()> {
        // Try each bootstrap server until one connects
        for server in &self.config.bootstrap_servers {
            match self.try_connect(server).await {
                Ok(stream) => {
                    let mut conn = self.connection.lock().await;
                    *conn = Some(BrokerConnection {
                        stream,
                        address: server.clone(),
                    });

                    // Perform SASL authentication if configured
                    if self.config.security.security_protocol == SecurityProtocol::SaslPlaintext
                        || self.config.security.security_protocol == SecurityProtocol::SaslSsl
                    {
                        drop(conn);
                        if let Err(e) = self.authenticate().await {
                            *self.connection.lock().await = None;
                            return Err(e);
                        }
                    }

                    debug!("Connected to Kafka broker: {}", server);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Failed to connect to {}: {}", server, e);
                    continue;
                }
            }
        }

        Err(KafkaError::NoBrokersAvailable.into())
    }

    async fn try_connect(&self, server: &str) -> Result<ConnectionStream> {
        let timeout = Duration::from_millis(self.config.connection.request_timeout_ms);
        let tcp_stream = tokio::time::timeout(timeout, TcpStream::connect(server))
            .await
            .map_err(|_| KafkaError::ConnectionFailed {
                broker: server.to_string(),
                message: format!("connect timed out after {:?}", timeout),
            })?
            .map_err(|e| KafkaError::ConnectionFailed {
                broker: server.to_string(),
                message: e.to_string(),
            })?;

        // Configure TCP socket options (keepalive, nodelay)
        self.configure_socket(&tcp_stream, server)?;

        // Wrap in TLS if using SSL or SASL_SSL
        let use_tls = matches!(
            self.config.security.security_protocol,
            SecurityProtocol::Ssl | SecurityProtocol::SaslSsl
        );

        if use_tls {
            debug!("Establishing TLS connection to {}", server);

            // Build TLS config using security settings (custom CA, mTLS support)
            let tls_config = super::tls::build_tls_config(&self.config.security)?;

            let connector = TlsConnector::from(Arc::new(tls_config));

            // Extract hostname from server address (host:port)
            let hostname = server.split(':').next().unwrap_or(server);

            let server_name = ServerName::try_from(hostname.to_string()).map_err(|e| {
                KafkaError::ConnectionFailed {
                    broker: server.to_string(),
                    message: format!("Invalid server name for TLS: {}", e),
                }
            })?;

            let tls_stream = connector
                .connect(server_name, tcp_stream)
                .await
                .map_err(|e| KafkaError::ConnectionFailed {
                    broker: server.to_string(),
                    message: format!("TLS handshake failed: {}", e),
                })?;

            debug!("TLS connection established to {}", server);
            Ok(ConnectionStream::Tls(Box::new(tls_stream)))
        } else {
            Ok(ConnectionStream::Plain(tcp_stream))
        }
    }

    /// Configure TCP socket options (keepalive, nodelay) based on connection config.
    fn configure_socket(&self, stream: &TcpStream, server: &str) -> Result<()> {
        let conn_config = &self.config.connection;

        // Get socket reference for configuration
        let sock_ref = SockRef::from(stream);

        // Enable TCP_NODELAY if configured
        if conn_config.tcp_nodelay {
            sock_ref
                .set_nodelay(true)
                .map_err(|e| KafkaError::ConnectionFailed {
                    broker: server.to_string(),
                    message: format!("Failed to set TCP_NODELAY: {}", e),
                })?;
        }

        // Configure TCP keepalive if enabled
        if conn_config.tcp_keepalive {
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_secs(conn_config.keepalive_time_secs))
                .with_interval(Duration::from_secs(conn_config.keepalive_interval_secs));

            sock_ref
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| KafkaError::ConnectionFailed {
                    broker: server.to_string(),
                    message: format!("Failed to set TCP keepalive: {}", e),
                })?;

            debug!(
                "TCP keepalive enabled for {}: time={}s, interval={}s",
                server, conn_config.keepalive_time_secs, conn_config.keepalive_interval_secs
            );
        }

        Ok(())
    }

    async fn authenticate(&self) -> Result<()> {
        let security = &self.config.security;

        match security.sasl_mechanism {
            Some(SaslMechanism::Plain) => {
                self.sasl_plain_auth(
                    security.sasl_username.as_deref().unwrap_or(""),
                    security.sasl_password.as_deref().unwrap_or(""),
                )
                .await
            }
            Some(SaslMechanism::ScramSha256) | Some(SaslMechanism::ScramSha512) => {
                // SCRAM authentication would go here
                Err(crate::Error::Authentication(
                    "SCRAM authentication not yet implemented".to_string(),
                ))
            }
            None => Ok(()), // No authentication needed
        }
    }

    async fn sasl_plain_auth(&self, username: &str, password: &str) -> Result<()> {
        use kafka_protocol::messages::{SaslAuthenticateRequest, SaslHandshakeRequest};

        // Step 1: SASL Handshake
        let handshake_request = SaslHandshakeRequest::default().with_mechanism("PLAIN".into());
        let handshake_response: kafka_protocol::messages::SaslHandshakeResponse = self
            .send_on_connection(ApiKey::SaslHandshake, handshake_request)
            .await?;
        if handshake_response.error_code != 0 {
            return Err(crate::Error::Authentication(format!(
                "SASL handshake rejected PLAIN (error code {})",
                handshake_response.error_code
            )));
        }

        // Step 2: SASL Authenticate with PLAIN mechanism
        // PLAIN format: \0username\0password
        let mut auth_bytes = Vec::new();
        auth_bytes.push(0); // authzid (empty)
        auth_bytes.extend_from_slice(username.as_bytes());
        auth_bytes.push(0);
        auth_bytes.extend_from_slice(password.as_bytes());

        let auth_request =
            SaslAuthenticateRequest::default().with_auth_bytes(Bytes::from(auth_bytes));
        let auth_response: kafka_protocol::messages::SaslAuthenticateResponse = self
            .send_on_connection(ApiKey::SaslAuthenticate, auth_request)
            .await?;

        if auth_response.error_code != 0 {
            return Err(crate::Error::Authentication(format!(
                "SASL authentication failed: {}",
                auth_response
                    .error_message
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("error code {}", auth_response.error_code))
            )));
        }

        debug!("SASL PLAIN authentication successful");
        Ok(())
    }

    /// Get the next correlation ID
    fn next_correlation_id(&self) -> i32 {
        self.correlation_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a request and receive a response, reconnecting first if the
    /// previous connection was lost.
    pub async fn send_request<Req, Resp>(&self, api_key: ApiKey, request: Req) -> Result<Resp>
    where
        Req: Encodable + Default,
        Resp: Decodable + Default,
    {
        let connected = self.connection.lock().await.is_some();
        if !connected {
            debug!("Reconnecting to {}", self.servers());
            self.connect().await?;
        }
        self.send_on_connection(api_key, request).await
    }

    /// Send a request on the current connection without reconnecting.
    async fn send_on_connection<Req, Resp>(&self, api_key: ApiKey, request: Req) -> Result<Resp>
    where
        Req: Encodable + Default,
        Resp: Decodable + Default,
    {
        let correlation_id = self.next_correlation_id();
        let api_version = self.get_api_version(api_key);

        let header = RequestHeader::default()
            .with_request_api_key(api_key as i16)
            .with_request_api_version(api_version)
            .with_correlation_id(correlation_id)
            .with_client_id(Some(StrBytes::from_static_str(CLIENT_ID)));

        let header_version = api_key.request_header_version(api_version);
        let mut buf = BytesMut::new();

        // Reserve space for the length prefix
        buf.put_i32(0);

        header
            .encode(&mut buf, header_version)
            .map_err(|e| KafkaError::Protocol(format!("Failed to encode header: {:?}", e)))?;
        request
            .encode(&mut buf, api_version)
            .map_err(|e| KafkaError::Protocol(format!("Failed to encode request: {:?}", e)))?;

        let len = (buf.len() - 4) as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());

        trace!(
            "Sending request: api_key={:?}, api_version={}, correlation_id={}, len={}",
            api_key,
            api_version,
            correlation_id,
            len
        );

        let mut guard = self.connection.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| KafkaError::ConnectionFailed {
                broker: self.servers(),
                message: "not connected".to_string(),
            })?;
        let address = conn.address.clone();

        let timeout = Duration::from_millis(self.config.connection.request_timeout_ms);
        let exchange = tokio::time::timeout(timeout, Self::exchange(conn, &buf)).await;

        let response_buf = match exchange {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                // The stream is in an unknown state; drop it so the next
                // request reconnects.
                *guard = None;
                warn!("Connection to {} failed during {:?}: {}", address, api_key, e);
                return Err(KafkaError::ConnectionFailed {
                    broker: address,
                    message: e.to_string(),
                }
                .into());
            }
            Err(_) => {
                *guard = None;
                return Err(KafkaError::Timeout(format!(
                    "{:?} to {} after {:?}",
                    api_key, address, timeout
                ))
                .into());
            }
        };
        drop(guard);

        trace!("Received response: len={}", response_buf.len());

        let mut response_bytes = Bytes::from(response_buf);
        let response_header_version = api_key.response_header_version(api_version);
        let response_header = ResponseHeader::decode(&mut response_bytes, response_header_version)
            .map_err(|e| {
                KafkaError::Protocol(format!("Failed to decode response header: {:?}", e))
            })?;
        if response_header.correlation_id != correlation_id {
            return Err(KafkaError::Protocol(format!(
                "Correlation id mismatch: sent {}, received {}",
                correlation_id, response_header.correlation_id
            ))
            .into());
        }

        let response = Resp::decode(&mut response_bytes, api_version)
            .map_err(|e| KafkaError::Protocol(format!("Failed to decode response: {:?}", e)))?;

        Ok(response)
    }

    /// Write one framed request and read one framed response.
    async fn exchange(conn: &mut BrokerConnection, frame: &[u8]) -> std::io::Result<Vec<u8>> {
        conn.stream.write_all(frame).await?;

        let mut len_buf = [0u8; 4];
        conn.stream.read_exact(&mut len_buf).await?;
        let response_len = i32::from_be_bytes(len_buf);
        if response_len < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("negative response length {}", response_len),
            ));
        }

        let mut response_buf = vec![0u8; response_len as usize];
        conn.stream.read_exact(&mut response_buf).await?;
        Ok(response_buf)
    }

    /// Get the API version to use for a given API key
    fn get_api_version(&self, api_key: ApiKey) -> i16 {
        // Use reasonable default versions that are widely supported
        match api_key {
            ApiKey::Metadata => 9,
            ApiKey::Fetch => 11,
            ApiKey::Produce => 8,
            ApiKey::SaslHandshake => 1,
            ApiKey::SaslAuthenticate => 2,
            ApiKey::ApiVersions => 3,
            ApiKey::ListOffsets => 5,
            ApiKey::FindCoordinator => 3,
            ApiKey::ListGroups => 4,
            ApiKey::DescribeGroups => 3,
            // v0 of the offset APIs targets ZooKeeper storage
            ApiKey::OffsetFetch => 5,
            ApiKey::OffsetCommit => 5,
            _ => 0,
        }
    }

    /// Fetch records from a topic/partition
    pub async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: i32,
    ) -> Result<FetchResponse> {
        super::fetch::fetch(self, topic, partition, offset, max_bytes).await
    }

    /// Get the earliest and latest offsets for a partition
    pub async fn get_offsets(&self, topic: &str, partition: i32) -> Result<(i64, i64)> {
        super::fetch::get_offsets(self, topic, partition).await
    }

    /// Produce records to a topic/partition
    pub async fn produce(
        &self,
        topic: &str,
        partition: i32,
        records: &[PipeRecord],
        preserve_timestamps: bool,
    ) -> Result<ProduceResponse> {
        super::produce::produce(self, topic, partition, records, preserve_timestamps).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use kafka_protocol::messages::{MetadataRequest, MetadataResponse};
    use std::net::TcpListener;

    fn config_for(addr: &str, connection: ConnectionConfig) -> KafkaConfig {
        KafkaConfig {
            bootstrap_servers: vec![addr.to_string()],
            security: Default::default(),
            connection,
        }
    }

    #[tokio::test]
    async fn test_tcp_keepalive_is_applied() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
        let addr = listener.local_addr().expect("Failed to get local addr");
        let tcp_stream = TcpStream::connect(addr).await.expect("Failed to connect");

        let client = KafkaClient::new(config_for(
            &addr.to_string(),
            ConnectionConfig {
                keepalive_time_secs: 45,
                keepalive_interval_secs: 15,
                ..Default::default()
            },
        ));
        client
            .configure_socket(&tcp_stream, &addr.to_string())
            .expect("Failed to configure socket");

        let sock_ref = SockRef::from(&tcp_stream);
        assert!(sock_ref.nodelay().expect("Failed to get nodelay"));

        #[cfg(target_os = "linux")]
        {
            assert_eq!(
                sock_ref.keepalive_time().expect("keepalive time"),
                Duration::from_secs(45)
            );
            assert_eq!(
                sock_ref.keepalive_interval().expect("keepalive interval"),
                Duration::from_secs(15)
            );
        }
    }

    #[tokio::test]
    async fn test_tcp_options_disabled() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
        let addr = listener.local_addr().expect("Failed to get local addr");
        let tcp_stream = TcpStream::connect(addr).await.expect("Failed to connect");

        let client = KafkaClient::new(config_for(
            &addr.to_string(),
            ConnectionConfig {
                tcp_keepalive: false,
                tcp_nodelay: false,
                ..Default::default()
            },
        ));
        client
            .configure_socket(&tcp_stream, &addr.to_string())
            .expect("Failed to configure socket");

        let sock_ref = SockRef::from(&tcp_stream);
        assert!(!sock_ref.nodelay().expect("Failed to get nodelay"));
    }

    #[tokio::test]
    async fn test_connect_with_no_listener_fails() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let client = KafkaClient::new(config_for(&addr.to_string(), Default::default()));
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, crate::Error::Kafka(KafkaError::NoBrokersAvailable)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_peer_hangup_is_a_transient_connection_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let client = KafkaClient::new(config_for(&addr.to_string(), Default::default()));
        client.connect().await.unwrap();

        let err = client
            .send_request::<MetadataRequest, MetadataResponse>(
                ApiKey::Metadata,
                MetadataRequest::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_transient(), "unexpected error: {}", err);
        assert!(client.connection.lock().await.is_none());
    }
}
