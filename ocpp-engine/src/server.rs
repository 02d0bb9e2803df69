//! Central system: accept loop and station directory
//!
//! Every accepted TCP connection gets its own task that runs the handshake
//! gate and then the session. The directory keeps at most one open session
//! per station id; a reconnecting station closes its previous session
//! before the new one is admitted.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::{self, protocol::WebSocketConfig};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::ocpp::gate::{ConnectionGate, GateError};
use crate::ocpp::registry::ActionRegistry;
use crate::ocpp::session::{CloseReason, Session, SessionHandle};

/// Errors from running the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// OCPP central system accepting charge point connections
#[derive(Clone)]
pub struct CentralSystem {
    config: Arc<ServerConfig>,
    registry: Arc<ActionRegistry>,
    gate: ConnectionGate,
    directory: Arc<RwLock<Directory>>,
}

/// Open sessions by station id. `accepting` turns false on shutdown so a
/// handshake finishing late cannot admit a session nobody will close.
#[derive(Default)]
struct Directory {
    sessions: HashMap<String, SessionHandle>,
    accepting: bool,
}

impl CentralSystem {
    pub fn new(config: ServerConfig, registry: ActionRegistry) -> Self {
        let gate = ConnectionGate::new(config.subprotocols.clone());
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            gate,
            directory: Arc::new(RwLock::new(Directory::default())),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open session for `station_id`, if any
    pub async fn session(&self, station_id: &str) -> Option<SessionHandle> {
        self.directory.read().await.sessions.get(station_id).cloned()
    }

    /// Ids of stations with an open session, sorted
    pub async fn station_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.directory.read().await.sessions.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Bind `bind_addr` and serve forever
    pub async fn serve(&self) -> Result<(), ServerError> {
        self.serve_until(std::future::pending()).await
    }

    /// Bind `bind_addr` and serve until `shutdown` resolves
    pub async fn serve_until<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_until(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    pub async fn run(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.run_until(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then close every open session
    pub async fn run_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.directory.write().await.accepting = true;
        info!(
            "Server started on {}, subprotocols {:?}",
            listener.local_addr()?,
            self.gate.supported()
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Connection from {}", peer);
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer).await {
                                warn!("Connection from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Accept failed: {}", e),
                },

                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.close_all().await;
        Ok(())
    }

    fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(self.config.max_message_size),
            ..Default::default()
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ServerError> {
        let (ws, handshake) = match self.gate.accept(stream, Some(self.websocket_config())).await {
            Ok(accepted) => accepted,
            Err(GateError::Rejected(reason)) => {
                debug!("Rejected {}: {}", peer, reason);
                return Ok(());
            }
            Err(GateError::WebSocket(e)) => return Err(e.into()),
        };

        let (session, handle) = Session::new(
            handshake.station_id,
            ws,
            self.registry.clone(),
            &self.config,
        );

        if !self.admit(handle.clone()).await {
            session.refuse(CloseReason::ServerShutdown).await;
            return Ok(());
        }

        // A panicking session still publishes Closed when dropped.
        let reason = match AssertUnwindSafe(session.run()).catch_unwind().await {
            Ok(reason) => reason,
            Err(_) => {
                error!("Session {} panicked", handle.station_id());
                CloseReason::TransportError("session task panicked".to_string())
            }
        };
        self.release(&handle).await;

        debug!("Connection {} of {} ended: {}", handle.connection_id(), handle.station_id(), reason);
        Ok(())
    }

    /// Register `handle`, closing any previous session of the same station
    /// first. False once the server is shutting down.
    async fn admit(&self, handle: SessionHandle) -> bool {
        loop {
            let previous = {
                let mut directory = self.directory.write().await;
                if !directory.accepting {
                    return false;
                }
                match directory.sessions.get(handle.station_id()) {
                    Some(existing) if existing.is_alive() => existing.clone(),
                    _ => {
                        directory
                            .sessions
                            .insert(handle.station_id().to_string(), handle);
                        return true;
                    }
                }
            };

            info!(
                "Station {} reconnected, closing previous connection {}",
                previous.station_id(),
                previous.connection_id()
            );
            previous.close_with(CloseReason::Replaced).await;
        }
    }

    /// Drop `handle` from the directory unless a newer session took its place
    async fn release(&self, handle: &SessionHandle) {
        let mut directory = self.directory.write().await;
        let current = directory
            .sessions
            .get(handle.station_id())
            .map(SessionHandle::connection_id);
        if current == Some(handle.connection_id()) {
            directory.sessions.remove(handle.station_id());
        }
    }

    async fn close_all(&self) {
        let handles: Vec<SessionHandle> = {
            let mut directory = self.directory.write().await;
            directory.accepting = false;
            directory.sessions.drain().map(|(_, h)| h).collect()
        };
        if handles.is_empty() {
            return;
        }

        info!("Closing {} session(s)", handles.len());
        join_all(handles.iter().map(|h| h.close_with(CloseReason::ServerShutdown))).await;
    }
}
