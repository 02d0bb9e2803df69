//! Connection gate
//!
//! Runs during the WebSocket handshake, before any session exists:
//! - the station must offer at least one subprotocol
//! - one of them must be supported by the server
//! - the request path names the station (`/CP1` -> `CP1`)
//!
//! A rejected station still completes the upgrade (without a selected
//! subprotocol) and is then closed immediately. No OCPP frame is exchanged.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    accept_hdr_async_with_config,
    tungstenite::{
        self,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig},
    },
    WebSocketStream,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a handshake was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeRejected {
    #[error("Station did not request any subprotocol")]
    MissingSubprotocol,

    #[error("Subprotocol mismatch: server supports {supported:?}, station offered {offered:?}")]
    SubprotocolMismatch {
        offered: Vec<String>,
        supported: Vec<String>,
    },

    #[error("Request path {0:?} does not name a station")]
    MissingStationId(String),
}

/// Errors from [`ConnectionGate::accept`]
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Handshake rejected: {0}")]
    Rejected(#[from] HandshakeRejected),

    #[error("WebSocket handshake failed: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Outcome of a successful negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    pub station_id: String,
    pub negotiated_subprotocol: String,
}

/// Subprotocols listed in `Sec-WebSocket-Protocol`, across repeated headers.
/// `None` when the header is absent.
pub fn offered_subprotocols(request: &Request) -> Option<Vec<String>> {
    let mut values = request.headers().get_all(SEC_WEBSOCKET_PROTOCOL).iter().peekable();
    values.peek()?;

    Some(
        values
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Pick the first server-supported subprotocol the station also offers
pub fn negotiate(offered: &[String], supported: &[String]) -> Result<String, HandshakeRejected> {
    if offered.is_empty() {
        return Err(HandshakeRejected::MissingSubprotocol);
    }

    supported
        .iter()
        .find(|s| offered.contains(s))
        .cloned()
        .ok_or_else(|| HandshakeRejected::SubprotocolMismatch {
            offered: offered.to_vec(),
            supported: supported.to_vec(),
        })
}

/// Station id from the request path, separators stripped
pub fn station_id_from_path(path: &str) -> Result<String, HandshakeRejected> {
    let station_id = path.trim_matches('/');
    if station_id.is_empty() {
        return Err(HandshakeRejected::MissingStationId(path.to_string()));
    }
    Ok(station_id.to_string())
}

/// Handshake-time policy for incoming station connections
#[derive(Debug, Clone)]
pub struct ConnectionGate {
    supported: Vec<String>,
}

impl ConnectionGate {
    pub fn new(supported: Vec<String>) -> Self {
        Self { supported }
    }

    pub fn supported(&self) -> &[String] {
        &self.supported
    }

    /// Decide on an upgrade request
    pub fn inspect(&self, request: &Request) -> Result<HandshakeResult, HandshakeRejected> {
        let offered = offered_subprotocols(request).ok_or(HandshakeRejected::MissingSubprotocol)?;
        let negotiated_subprotocol = negotiate(&offered, &self.supported)?;
        let station_id = station_id_from_path(request.uri().path())?;

        Ok(HandshakeResult {
            station_id,
            negotiated_subprotocol,
        })
    }

    /// Perform the WebSocket handshake on `stream` and apply the policy.
    ///
    /// On rejection the socket is closed before returning.
    pub async fn accept<S>(
        &self,
        stream: S,
        config: Option<WebSocketConfig>,
    ) -> Result<(WebSocketStream<S>, HandshakeResult), GateError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut outcome: Option<Result<HandshakeResult, HandshakeRejected>> = None;

        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let decision = self.inspect(request);
            if let Ok(result) = &decision {
                if let Ok(value) = HeaderValue::from_str(&result.negotiated_subprotocol) {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
            }
            outcome = Some(decision);
            Ok(response)
        };

        let mut ws = accept_hdr_async_with_config(stream, callback, config).await?;

        match outcome {
            Some(Ok(result)) => {
                info!(
                    "Station {} connected, subprotocol {}",
                    result.station_id, result.negotiated_subprotocol
                );
                Ok((ws, result))
            }
            Some(Err(rejected)) => {
                warn!("{}. Closing connection", rejected);
                let frame = CloseFrame {
                    code: CloseCode::Protocol,
                    reason: "subprotocol negotiation failed".into(),
                };
                if let Err(e) = ws.close(Some(frame)).await {
                    debug!("Close after rejected handshake failed: {}", e);
                }
                Err(rejected.into())
            }
            // The callback runs on every completed handshake.
            None => Err(HandshakeRejected::MissingSubprotocol.into()),
        }
    }
}
