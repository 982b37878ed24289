use crate::protocol::{self, Command, FrameReader, ProtocolError};
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use uuid::Uuid;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on one frame write, the same as an idle read. A peer that stops
/// draining its socket fails the send instead of holding the write guard.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(130);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum PushError {
    Connect(String),
    ConnectionClosed,
    Send(String),
    MalformedFrame(String),
    Decode(String),
    Registration(String),
    Io(io::Error),
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "connect failed: {msg}"),
            Self::ConnectionClosed => f.write_str("connection closed"),
            Self::Send(msg) => write!(f, "send failed: {msg}"),
            Self::MalformedFrame(msg) => write!(f, "malformed frame: {msg}"),
            Self::Decode(msg) => write!(f, "decode failed: {msg}"),
            Self::Registration(msg) => write!(f, "registration payload: {msg}"),
            Self::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for PushError {}

impl From<ProtocolError> for PushError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ConnectionClosed => Self::ConnectionClosed,
            ProtocolError::Io(err) => Self::Io(err),
            other @ (ProtocolError::MalformedHeader { .. } | ProtocolError::FrameTooLarge { .. }) => {
                Self::MalformedFrame(other.to_string())
            }
        }
    }
}

/// Produces a connected byte stream to the push server.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self) -> Result<Self::Stream, PushError>;

    fn endpoint(&self) -> String;
}

/// TLS over TCP with certificate and hostname checks disabled. The vendor's
/// push endpoint presents self-issued certificates.
#[derive(Clone)]
pub struct TlsConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    tls: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: CONNECT_TIMEOUT,
            tls: tokio_rustls::TlsConnector::from(Arc::new(build_client_config())),
        }
    }
}

#[async_trait]
impl Connector for TlsConnector {
    type Stream = tokio_rustls::client::TlsStream<TcpStream>;

    async fn connect(&self) -> Result<Self::Stream, PushError> {
        let tcp = timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| PushError::Connect(format!("tcp connect to {} timed out", self.endpoint())))?
        .map_err(|err| PushError::Connect(format!("tcp connect to {}: {err}", self.endpoint())))?;

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|err| PushError::Connect(format!("invalid server name: {err}")))?;

        timeout(self.connect_timeout, self.tls.connect(server_name, tcp))
            .await
            .map_err(|_| PushError::Connect("tls handshake timed out".to_string()))?
            .map_err(|err| PushError::Connect(format!("tls handshake failed: {err}")))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Every protocol version and cipher suite the ring provider ships. If that
/// combination is refused, the provider defaults are used instead.
fn build_client_config() -> ClientConfig {
    let mut relaxed = rustls::crypto::ring::default_provider();
    relaxed.cipher_suites = rustls::crypto::ring::ALL_CIPHER_SUITES.to_vec();
    relaxed.kx_groups = rustls::crypto::ring::ALL_KX_GROUPS.to_vec();

    match ClientConfig::builder_with_provider(Arc::new(relaxed))
        .with_protocol_versions(rustls::ALL_VERSIONS)
    {
        Ok(builder) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
            .with_no_client_auth(),
        Err(err) => {
            tracing::warn!(error = %err, "relaxed tls policy rejected, using provider defaults");
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
                .with_no_client_auth()
        }
    }
}

/// Skips chain and hostname validation; handshake signatures are still
/// checked so the session keys belong to whoever holds the presented cert.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        let provider: CryptoProvider = rustls::crypto::ring::default_provider();
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// One physical connection. The write half sits behind a single guard shared
/// by every send and by `disconnect`, so frames never interleave and closing
/// from another task is safe while a heartbeat is in flight.
pub struct Session<S> {
    id: Uuid,
    writer: Mutex<Option<WriteHalf<S>>>,
    closed: watch::Sender<bool>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn open(stream: S) -> (Arc<Self>, FrameReader<ReadHalf<S>>) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            writer: Mutex::new(Some(write_half)),
            closed,
        });
        (session, FrameReader::new(read_half))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Completes once `disconnect` has run or a send failed.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub async fn send(&self, command: Command, payload: &[u8]) -> Result<(), PushError> {
        let frame = protocol::encode(command, payload).map_err(|err| PushError::Send(err.to_string()))?;
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(PushError::Send("not connected".to_string()));
        };

        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        let result = tokio::select! {
            biased;
            _ = self.wait_closed() => Err(PushError::Send("session closed".to_string())),
            written = timeout(SEND_TIMEOUT, write) => match written {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(PushError::Send(err.to_string())),
                Err(_) => Err(PushError::Send(format!("write timed out after {}s", SEND_TIMEOUT.as_secs()))),
            },
        };
        match result {
            Ok(()) => {
                tracing::debug!(session_id = %self.id, cmd = %command, len = payload.len(), "frame sent");
                Ok(())
            }
            Err(err) => {
                guard.take();
                self.closed.send_replace(true);
                Err(err)
            }
        }
    }

    /// Idempotent. Close errors are swallowed. The closed flag is raised
    /// before taking the write guard, which aborts a send stuck on a peer
    /// that stopped reading.
    pub async fn disconnect(&self) {
        self.closed.send_replace(true);
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            match timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
                Ok(Err(err)) => tracing::debug!(session_id = %self.id, error = %err, "close failed"),
                Err(_) => tracing::debug!(session_id = %self.id, "close timed out"),
                Ok(Ok(())) => {}
            }
            tracing::info!(session_id = %self.id, "disconnected from push server");
        }
    }
}
