//! Parley relay server.
//!
//! A rendezvous and forwarding service for Parley clients: it stores
//! published peer records, maintains the live roster, and forwards
//! opaque handshake offers and encrypted messages between sessions with
//! end-to-end receipts. It never holds key material beyond what peers
//! publish and cannot read any forwarded payload.
//!
//! # Architecture
//!
//! [`RelayDriver`] is a sans-IO state machine ([`RelayEvent`] in,
//! [`RelayAction`]s out) tested on a virtual clock; [`Relay`] is the
//! tokio/quinn runtime that accepts connections, decodes requests, and
//! executes the driver's actions. Each client request travels on its
//! own client-opened bidirectional stream and is answered by exactly
//! one receipt; pushed events flow newline-delimited over one
//! relay-opened unidirectional stream per connection.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod driver;
mod error;
mod registry;
mod system_env;
mod transport;

use std::{collections::HashMap, sync::Arc, time::Duration};

pub use driver::{
    DELIVERY_TIMEOUT, LogLevel, RelayAction, RelayConfig, RelayDriver, RelayEvent,
};
pub use error::RelayError;
use parley_core::Environment;
use parley_proto::{ClientRequest, MAX_ENVELOPE_SIZE, RelayEnvelope, envelope};
pub use registry::PeerRegistry;
pub use system_env::SystemEnv;
use tokio::sync::RwLock;
pub use transport::{QuinnConnection, QuinnTransport};

/// A request stream waiting for its `Respond` action.
struct PendingResponse {
    /// Session the request came from, for cleanup on disconnect.
    session_id: u64,
    send: quinn::SendStream,
}

/// Shared per-connection I/O state for action execution.
struct SharedState {
    /// Session ID → QUIC connection (for closing)
    connections: RwLock<HashMap<u64, QuinnConnection>>,
    /// Session ID → persistent event stream. All pushed events to a
    /// client go through this single stream, preserving order.
    event_streams: RwLock<HashMap<u64, tokio::sync::Mutex<quinn::SendStream>>>,
    /// Request ID → parked response stream
    pending_responses: RwLock<HashMap<u64, PendingResponse>>,
}

/// Relay runtime configuration.
#[derive(Debug, Clone)]
pub struct RelayRuntimeConfig {
    /// Address to bind to (e.g. "0.0.0.0:4433").
    pub bind_address: String,
    /// Path to a TLS certificate (PEM). Self-signed when absent.
    pub cert_path: Option<String>,
    /// Path to the TLS private key (PEM).
    pub key_path: Option<String>,
    /// Driver configuration (limits, receipt deadline).
    pub driver: RelayConfig,
}

impl Default for RelayRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            driver: RelayConfig::default(),
        }
    }
}

/// Production relay: [`RelayDriver`] plus quinn transport and tokio
/// execution.
pub struct Relay {
    driver: RelayDriver<SystemEnv>,
    transport: QuinnTransport,
    env: SystemEnv,
}

impl Relay {
    /// Create and bind a relay.
    pub fn bind(config: RelayRuntimeConfig) -> Result<Self, RelayError> {
        let env = SystemEnv::new();
        let driver = RelayDriver::new(env.clone(), config.driver);
        let transport =
            QuinnTransport::bind(&config.bind_address, config.cert_path, config.key_path)?;

        Ok(Self { driver, transport, env })
    }

    /// Local address the relay is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, RelayError> {
        self.transport.local_addr()
    }

    /// Run the relay until the process is stopped.
    pub async fn run(self) -> Result<(), RelayError> {
        tracing::info!("relay listening on {}", self.transport.local_addr()?);

        let env = self.env;
        let driver = Arc::new(tokio::sync::Mutex::new(self.driver));
        let shared = Arc::new(SharedState {
            connections: RwLock::new(HashMap::new()),
            event_streams: RwLock::new(HashMap::new()),
            pending_responses: RwLock::new(HashMap::new()),
        });

        // Receipt deadlines are swept once a second.
        {
            let driver = Arc::clone(&driver);
            let shared = Arc::clone(&shared);
            let env = env.clone();
            tokio::spawn(async move {
                loop {
                    env.sleep(Duration::from_secs(1)).await;
                    let actions = driver.lock().await.process_event(RelayEvent::Tick);
                    if let Err(e) = execute_actions(actions, &shared).await {
                        tracing::warn!("tick execution failed: {e}");
                    }
                }
            });
        }

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let driver = Arc::clone(&driver);
                    let shared = Arc::clone(&shared);
                    let env = env.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, driver, shared, env).await {
                            tracing::debug!("connection error: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("accept error: {e}");
                }
            }
        }
    }
}

/// Serve one QUIC connection for its whole life.
async fn handle_connection(
    conn: QuinnConnection,
    driver: Arc<tokio::sync::Mutex<RelayDriver<SystemEnv>>>,
    shared: Arc<SharedState>,
    env: SystemEnv,
) -> Result<(), RelayError> {
    let session_id = env.random_u64();

    tracing::debug!("new connection {session_id} from {}", conn.remote_addr());

    let event_stream = conn.open_uni().await?;

    {
        let mut connections = shared.connections.write().await;
        connections.insert(session_id, conn.clone());
    }
    {
        let mut streams = shared.event_streams.write().await;
        streams.insert(session_id, tokio::sync::Mutex::new(event_stream));
    }

    {
        let mut driver = driver.lock().await;
        let actions = driver.process_event(RelayEvent::ConnectionAccepted { session_id });
        drop(driver);
        execute_actions(actions, &shared).await?;
    }

    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let driver = Arc::clone(&driver);
                let shared = Arc::clone(&shared);
                let env = env.clone();

                tokio::spawn(async move {
                    if let Err(e) =
                        handle_request_stream(session_id, send, recv, driver, &shared, &env).await
                    {
                        tracing::debug!("request stream error: {e}");
                    }
                });
            }
            Err(e) => {
                tracing::debug!("connection {session_id} closed: {e}");
                break;
            }
        }
    }

    {
        let mut connections = shared.connections.write().await;
        connections.remove(&session_id);
    }
    {
        let mut streams = shared.event_streams.write().await;
        streams.remove(&session_id);
    }
    {
        // Request streams from this session can no longer be answered.
        let mut responses = shared.pending_responses.write().await;
        responses.retain(|_, parked| parked.session_id != session_id);
    }

    {
        let mut driver = driver.lock().await;
        let actions = driver.process_event(RelayEvent::ConnectionClosed {
            session_id,
            reason: "connection closed".to_string(),
        });
        drop(driver);
        execute_actions(actions, &shared).await?;
    }

    Ok(())
}

/// Read one request from a client-opened stream and park the stream for
/// the eventual receipt.
async fn handle_request_stream(
    session_id: u64,
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    driver: Arc<tokio::sync::Mutex<RelayDriver<SystemEnv>>>,
    shared: &Arc<SharedState>,
    env: &SystemEnv,
) -> Result<(), RelayError> {
    let bytes = recv
        .read_to_end(MAX_ENVELOPE_SIZE + 1)
        .await
        .map_err(|e| RelayError::Transport(format!("read failed: {e}")))?;

    let request: ClientRequest = match envelope::decode_slice(&bytes) {
        Ok(request) => request,
        Err(e) => {
            // Malformed input is answered on the spot and never reaches
            // the driver.
            tracing::warn!("session {session_id} sent a malformed request: {e}");
            let line = envelope::encode_line(&RelayEnvelope::rejected("malformed request"))
                .map_err(|e| RelayError::Protocol(e.to_string()))?;
            let _ = send.write_all(&line).await;
            let _ = send.finish();
            return Ok(());
        }
    };

    let request_id = env.random_u64();
    {
        let mut responses = shared.pending_responses.write().await;
        responses.insert(request_id, PendingResponse { session_id, send });
    }

    let actions = {
        let mut driver = driver.lock().await;
        driver.process_event(RelayEvent::RequestReceived { session_id, request_id, request })
    };
    execute_actions(actions, shared).await
}

/// Execute driver actions against live streams and connections.
async fn execute_actions(actions: Vec<RelayAction>, shared: &SharedState) -> Result<(), RelayError> {
    for action in actions {
        match action {
            RelayAction::Respond { session_id, request_id, receipt } => {
                let parked = {
                    let mut responses = shared.pending_responses.write().await;
                    responses.remove(&request_id)
                };
                let Some(mut parked) = parked else {
                    tracing::warn!(
                        "no parked stream for request {request_id} (session {session_id})"
                    );
                    continue;
                };

                let line = envelope::encode_line(&receipt)
                    .map_err(|e| RelayError::Protocol(e.to_string()))?;
                if let Err(e) = parked.send.write_all(&line).await {
                    tracing::debug!("receipt write failed for session {session_id}: {e}");
                }
                let _ = parked.send.finish();
            }

            RelayAction::Deliver { session_id, envelope: event } => {
                let line = envelope::encode_line(&event)
                    .map_err(|e| RelayError::Protocol(e.to_string()))?;

                let streams = shared.event_streams.read().await;
                if let Some(stream) = streams.get(&session_id) {
                    let mut stream = stream.lock().await;
                    if let Err(e) = stream.write_all(&line).await {
                        tracing::warn!("deliver write failed for session {session_id}: {e}");
                    }
                } else {
                    tracing::debug!("deliver: session {session_id} already gone");
                }
            }

            RelayAction::Broadcast { envelope: event, exclude } => {
                let line = envelope::encode_line(&event)
                    .map_err(|e| RelayError::Protocol(e.to_string()))?;

                let streams = shared.event_streams.read().await;
                for (session_id, stream) in streams.iter() {
                    if Some(*session_id) == exclude {
                        continue;
                    }
                    let mut stream = stream.lock().await;
                    if let Err(e) = stream.write_all(&line).await {
                        tracing::warn!("broadcast write failed for session {session_id}: {e}");
                    }
                }
            }

            RelayAction::CloseConnection { session_id, reason } => {
                tracing::info!("closing connection {session_id}: {reason}");
                let mut connections = shared.connections.write().await;
                if let Some(conn) = connections.remove(&session_id) {
                    conn.close(0u32.into(), reason.as_bytes());
                }
            }

            RelayAction::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{message}"),
                LogLevel::Info => tracing::info!("{message}"),
                LogLevel::Warn => tracing::warn!("{message}"),
                LogLevel::Error => tracing::error!("{message}"),
            },
        }
    }

    Ok(())
}
