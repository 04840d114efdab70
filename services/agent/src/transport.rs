//! Transport seam between the control-channel core and the wire.
//!
//! The core only needs three operations: dial a connection, run the
//! registration RPC on it, and open the bidirectional stream. [`GrpcTransport`]
//! implements them over tonic with mutual TLS.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use fleet_proto::control::v1::{
    AgentControlClient, AgentMessage, RegisterRequest, RegisterResponse, ServerMessage,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::TransportError;

/// Buffered outbound messages per stream before `send` waits.
const OUTBOUND_BUFFER: usize = 32;

/// Inbound half of a control stream.
pub type InboundStream =
    Pin<Box<dyn Stream<Item = Result<ServerMessage, tonic::Status>> + Send + 'static>>;

/// Outbound half of a control stream. Dropping it half-closes the stream.
#[derive(Debug)]
pub struct StreamSender {
    tx: mpsc::Sender<AgentMessage>,
}

impl StreamSender {
    pub fn new(tx: mpsc::Sender<AgentMessage>) -> Self {
        Self { tx }
    }

    /// Queue a message on the stream.
    pub async fn send(&self, message: AgentMessage) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::StreamClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Both halves of an open control stream.
pub struct StreamPair {
    pub sender: StreamSender,
    pub inbound: InboundStream,
}

/// Wire operations the core depends on.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Established connection handle, cheap to clone.
    type Conn: Clone + Send + Sync + 'static;

    /// Establish a connection. Unusable certificate material must be
    /// reported as [`TransportError::Config`].
    async fn dial(&self) -> Result<Self::Conn, TransportError>;

    async fn register(
        &self,
        conn: &Self::Conn,
        request: RegisterRequest,
    ) -> Result<RegisterResponse, TransportError>;

    async fn open_stream(&self, conn: &Self::Conn) -> Result<StreamPair, TransportError>;
}

/// Paths to the PEM files used for mutual TLS.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub ca_cert: PathBuf,
    pub agent_cert: PathBuf,
    pub agent_key: PathBuf,

    /// Overrides the server name checked against the server certificate.
    pub domain: Option<String>,
}

/// tonic transport with mutual TLS.
pub struct GrpcTransport {
    server_url: String,
    tls: TlsPaths,
    connect_timeout: Duration,
    keepalive_interval: Duration,
}

impl GrpcTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            server_url: config.server_url.clone(),
            tls: config.tls.clone(),
            connect_timeout: config.connect_timeout,
            keepalive_interval: config.heartbeat_interval,
        }
    }

    async fn endpoint(&self) -> Result<Endpoint, TransportError> {
        let ca = read_pem(&self.tls.ca_cert, "CA certificate").await?;
        let cert = read_pem(&self.tls.agent_cert, "agent certificate").await?;
        let key = read_pem(&self.tls.agent_key, "agent key").await?;

        let mut tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key));
        if let Some(domain) = &self.tls.domain {
            tls = tls.domain_name(domain.clone());
        }

        let endpoint = Endpoint::from_shared(self.server_url.clone())
            .map_err(|e| TransportError::Config(format!("invalid server URL: {e}")))?
            .tls_config(tls)
            .map_err(|e| TransportError::Config(format!("invalid TLS configuration: {e}")))?
            .connect_timeout(self.connect_timeout)
            .http2_keep_alive_interval(self.keepalive_interval)
            .keep_alive_timeout(self.connect_timeout)
            .keep_alive_while_idle(true);

        Ok(endpoint)
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    type Conn = Channel;

    async fn dial(&self) -> Result<Channel, TransportError> {
        let endpoint = self.endpoint().await?;

        debug!(url = %self.server_url, "Dialing control server");
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        info!(url = %self.server_url, "Connected to control server");
        Ok(channel)
    }

    async fn register(
        &self,
        conn: &Channel,
        request: RegisterRequest,
    ) -> Result<RegisterResponse, TransportError> {
        let response = AgentControlClient::new(conn.clone())
            .register(request)
            .await?;
        Ok(response.into_inner())
    }

    async fn open_stream(&self, conn: &Channel) -> Result<StreamPair, TransportError> {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let response = AgentControlClient::new(conn.clone())
            .stream(ReceiverStream::new(rx))
            .await?;

        Ok(StreamPair {
            sender: StreamSender::new(tx),
            inbound: Box::pin(response.into_inner()),
        })
    }
}

async fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>, TransportError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| TransportError::Config(format!("cannot read {what} {}: {e}", path.display())))?;
    if bytes.is_empty() {
        return Err(TransportError::Config(format!(
            "{what} {} is empty",
            path.display()
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn paths(dir: &Path) -> TlsPaths {
        TlsPaths {
            ca_cert: dir.join("ca.pem"),
            agent_cert: dir.join("agent.pem"),
            agent_key: dir.join("agent-key.pem"),
            domain: None,
        }
    }

    fn transport(tls: TlsPaths) -> GrpcTransport {
        GrpcTransport {
            server_url: "https://control.example.com:443".to_string(),
            tls,
            connect_timeout: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_missing_certificates_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = transport(paths(dir.path())).dial().await.unwrap_err();

        assert!(matches!(err, TransportError::Config(ref msg) if msg.contains("CA certificate")));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_empty_key_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let tls = paths(dir.path());
        for path in [&tls.ca_cert, &tls.agent_cert] {
            let mut file = std::fs::File::create(path).unwrap();
            writeln!(file, "-----BEGIN CERTIFICATE-----").unwrap();
        }
        std::fs::File::create(&tls.agent_key).unwrap();

        let err = transport(tls).dial().await.unwrap_err();
        assert!(matches!(err, TransportError::Config(ref msg) if msg.contains("agent key")));
    }

    #[tokio::test]
    async fn test_stream_sender_reports_closed() {
        let (tx, rx) = mpsc::channel(1);
        let sender = StreamSender::new(tx);
        drop(rx);

        assert!(sender.is_closed());
        let err = sender.send(AgentMessage::default()).await.unwrap_err();
        assert!(matches!(err, TransportError::StreamClosed));
    }
}
