//! QUIC transport to the relay.
//!
//! Thin I/O layer: every request travels on its own client-opened
//! bidirectional stream and is answered by one receipt line; relay-pushed
//! events arrive newline-delimited on a relay-opened unidirectional
//! stream and are funneled into a channel. Protocol logic stays in the
//! sans-IO [`Engine`](crate::Engine).

use std::{net::SocketAddr, sync::Arc, time::Duration};

use parley_proto::{
    ALPN_PROTOCOL, ClientRequest, MAX_ENVELOPE_SIZE, PeerRecord, RelayEnvelope, envelope,
};
use quinn::{ClientConfig, Endpoint, RecvStream};
use thiserror::Error;
use tokio::sync::mpsc;

/// How long to wait for a request's receipt before giving up.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Stream error.
    #[error("stream error: {0}")]
    Stream(String),

    /// Envelope encode/decode error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No receipt arrived within [`REQUEST_TIMEOUT`].
    #[error("request timed out after {}s", REQUEST_TIMEOUT.as_secs())]
    Timeout,
}

/// Receipt fields for one completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Whether the relay accepted (and, for forwards, delivered) it.
    pub success: bool,
    /// Failure reason when `success` is false.
    pub error: Option<String>,
    /// The record a successful lookup resolved to.
    pub peer: Option<PeerRecord>,
}

/// A live QUIC connection to the relay.
pub struct RelayConnection {
    connection: quinn::Connection,
    /// Relay-pushed events (roster, joins, deliveries).
    pub events: mpsc::Receiver<RelayEnvelope>,
    abort_handle: tokio::task::AbortHandle,
}

impl RelayConnection {
    /// Send one request and wait (bounded) for its receipt.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] if no receipt arrives within
    /// [`REQUEST_TIMEOUT`]; other variants for stream or envelope failures.
    pub async fn request(&self, request: &ClientRequest) -> Result<RequestOutcome, TransportError> {
        let (mut send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Stream(format!("open failed: {e}")))?;

        let line = envelope::encode_line(request)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        send.write_all(&line)
            .await
            .map_err(|e| TransportError::Stream(format!("write failed: {e}")))?;
        send.finish().map_err(|e| TransportError::Stream(format!("finish failed: {e}")))?;

        let reply = tokio::time::timeout(REQUEST_TIMEOUT, read_envelope(recv))
            .await
            .map_err(|_| TransportError::Timeout)??;

        match reply {
            RelayEnvelope::Receipt { success, error, peer } => {
                Ok(RequestOutcome { success, error, peer })
            }
            other => Err(TransportError::Protocol(format!(
                "expected a receipt, got {other:?}"
            ))),
        }
    }

    /// Close the connection and stop the event pump.
    pub fn close(&self) {
        self.connection.close(0u32.into(), b"client closing");
        self.abort_handle.abort();
    }
}

/// Connect to a relay.
///
/// # Errors
///
/// [`TransportError::Connection`] if the address is invalid or the QUIC
/// handshake fails.
pub async fn connect(relay_addr: &str) -> Result<RelayConnection, TransportError> {
    let addr: SocketAddr = relay_addr
        .parse()
        .map_err(|e| TransportError::Connection(format!("invalid address: {e}")))?;

    let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
        .map_err(|e| TransportError::Connection(format!("endpoint creation failed: {e}")))?;
    endpoint.set_default_client_config(insecure_client_config());

    let connection = endpoint
        .connect(addr, "localhost")
        .map_err(|e| TransportError::Connection(format!("connect failed: {e}")))?
        .await
        .map_err(|e| TransportError::Connection(format!("connection failed: {e}")))?;

    let (events_tx, events_rx) = mpsc::channel::<RelayEnvelope>(64);

    let conn = connection.clone();
    let handle = tokio::spawn(async move {
        // The relay opens one unidirectional stream per connection and
        // writes newline-delimited events on it for the connection's life.
        loop {
            match conn.accept_uni().await {
                Ok(recv) => {
                    if pump_events(recv, &events_tx).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("relay connection closed: {e}");
                    break;
                }
            }
        }
    });

    Ok(RelayConnection { connection, events: events_rx, abort_handle: handle.abort_handle() })
}

/// Read newline-delimited events until the stream or receiver goes away.
///
/// Malformed lines are dropped with a warning; `Err` means the receiver
/// side hung up and the pump should stop.
async fn pump_events(
    mut recv: RecvStream,
    events: &mpsc::Sender<RelayEnvelope>,
) -> Result<(), ()> {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let read = match recv.read(&mut chunk).await {
            Ok(Some(n)) => n,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::debug!("event stream ended: {e}");
                return Ok(());
            }
        };
        buf.extend_from_slice(&chunk[..read]);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            match envelope::decode_slice::<RelayEnvelope>(&line) {
                Ok(event) => {
                    if events.send(event).await.is_err() {
                        return Err(());
                    }
                }
                Err(e) => tracing::warn!("dropping malformed relay event: {e}"),
            }
        }

        if buf.len() > MAX_ENVELOPE_SIZE {
            tracing::warn!("unterminated relay event exceeds the envelope bound");
            return Err(());
        }
    }
}

/// Read one envelope line from a stream the peer finishes after writing.
async fn read_envelope(mut recv: RecvStream) -> Result<RelayEnvelope, TransportError> {
    let bytes = recv
        .read_to_end(MAX_ENVELOPE_SIZE + 1)
        .await
        .map_err(|e| TransportError::Stream(format!("read failed: {e}")))?;
    envelope::decode_slice(&bytes).map_err(|e| TransportError::Protocol(e.to_string()))
}

/// Client config that accepts any certificate.
///
/// The relay presents a self-signed certificate; channel privacy comes
/// from the end-to-end layer, not from relay TLS.
fn insecure_client_config() -> ClientConfig {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let Ok(quic_crypto) = quinn::crypto::rustls::QuicClientConfig::try_from(crypto) else {
        unreachable!("static rustls client config is always valid");
    };
    let mut config = ClientConfig::new(Arc::new(quic_crypto));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(quinn::IdleTimeout::from(quinn::VarInt::from_u32(30_000))));
    config.transport_config(Arc::new(transport));

    config
}

/// Certificate verifier that accepts any certificate.
#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
