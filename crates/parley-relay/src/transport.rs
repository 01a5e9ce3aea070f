//! Quinn-based QUIC listener.
//!
//! TLS 1.3 with ALPN `parley`. Supports PEM certificate/key pairs for
//! real deployments and generates a self-signed certificate when none
//! are given. Clients treat the relay as untrusted either way: privacy
//! comes from the end-to-end layer, so self-signed relay certs are the
//! normal development setup, not a weakened one.

use std::{net::SocketAddr, sync::Arc};

use parley_proto::ALPN_PROTOCOL;
use quinn::{Endpoint, RecvStream, SendStream, ServerConfig};

use crate::error::RelayError;

/// QUIC listener endpoint.
pub struct QuinnTransport {
    endpoint: Endpoint,
}

impl QuinnTransport {
    /// Create and bind a new QUIC listener.
    ///
    /// With `cert_path` and `key_path` set, the PEM files are loaded;
    /// otherwise a self-signed certificate is generated.
    pub fn bind(
        address: &str,
        cert_path: Option<String>,
        key_path: Option<String>,
    ) -> Result<Self, RelayError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid bind address '{address}': {e}")))?;

        let server_config = match (cert_path, key_path) {
            (Some(cert), Some(key)) => load_tls_config(&cert, &key)?,
            _ => generate_self_signed_config()?,
        };

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| RelayError::Transport(format!("failed to create endpoint: {e}")))?;

        tracing::info!("QUIC transport bound to {addr}");

        Ok(Self { endpoint })
    }

    /// Accept the next QUIC connection.
    pub async fn accept(&self) -> Result<QuinnConnection, RelayError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| RelayError::Transport("endpoint closed".to_string()))?;

        let conn = incoming
            .await
            .map_err(|e| RelayError::Transport(format!("connection failed: {e}")))?;

        Ok(QuinnConnection { connection: conn })
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        self.endpoint
            .local_addr()
            .map_err(|e| RelayError::Transport(format!("failed to get local address: {e}")))
    }
}

/// One accepted QUIC connection.
///
/// Clones are cheap and share the underlying connection, so the accept
/// loop and per-stream tasks can hold it concurrently.
#[derive(Clone)]
pub struct QuinnConnection {
    connection: quinn::Connection,
}

impl QuinnConnection {
    /// Accept a client-opened bidirectional stream (one request each).
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), RelayError> {
        self.connection
            .accept_bi()
            .await
            .map_err(|e| RelayError::Transport(format!("accept_bi failed: {e}")))
    }

    /// Open the relay-to-client event stream.
    pub async fn open_uni(&self) -> Result<SendStream, RelayError> {
        self.connection
            .open_uni()
            .await
            .map_err(|e| RelayError::Transport(format!("open_uni failed: {e}")))
    }

    /// Remote peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Close the connection with an error code and reason.
    pub fn close(&self, error_code: quinn::VarInt, reason: &[u8]) {
        self.connection.close(error_code, reason);
    }
}

/// Load the certificate chain and key from PEM files.
fn load_tls_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, RelayError> {
    use std::fs;

    let cert_pem = fs::read(cert_path)
        .map_err(|e| RelayError::Config(format!("failed to read cert '{cert_path}': {e}")))?;
    let key_pem = fs::read(key_path)
        .map_err(|e| RelayError::Config(format!("failed to read key '{key_path}': {e}")))?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Config(format!("failed to parse certificates: {e}")))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| RelayError::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| RelayError::Config("no private key found".to_string()))?;

    build_server_config(certs, key)
}

/// Mint a throwaway self-signed certificate for development runs.
fn generate_self_signed_config() -> Result<ServerConfig, RelayError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| RelayError::Config(format!("failed to generate self-signed cert: {e}")))?;

    let chain = vec![cert.cert.der().clone()];
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    tracing::warn!("using a self-signed certificate");

    build_server_config(chain, key.into())
}

/// Assemble the quinn server config: TLS 1.3, no client auth, ALPN pinned.
fn build_server_config(
    chain: Vec<rustls::pki_types::CertificateDer<'static>>,
    key: rustls::pki_types::PrivateKeyDer<'static>,
) -> Result<ServerConfig, RelayError> {
    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| RelayError::Config(format!("invalid TLS config: {e}")))?;
    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
        .map_err(|e| RelayError::Config(format!("QUIC config error: {e}")))?;

    Ok(ServerConfig::with_crypto(Arc::new(crypto)))
}
