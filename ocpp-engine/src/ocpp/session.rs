//! OCPP session state machine
//!
//! One `Session` owns one station's WebSocket and runs as its own task:
//! - inbound CALLs are dispatched through the action registry, one at a time
//! - inbound CALLRESULT/CALLERROR frames resolve server-initiated requests
//! - commands from [`SessionHandle`]s issue new requests or close the session
//!
//! Lifecycle: Negotiating -> Open -> Closing -> Closed. Entering Closing
//! cancels every outstanding request before the session reaches Closed.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::{
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::correlation::{
    CorrelationTable, PendingRequest, PendingResponse, RequestError, RequestOutcome,
};
use super::messages::{Call, CallError, CallResult, ErrorCode, OcppMessage};
use super::registry::ActionRegistry;
use crate::config::{MalformedFramePolicy, ServerConfig};

/// Session state in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake in progress
    Negotiating,
    /// Receive loop running
    Open,
    /// Shutting down, pending requests being cancelled
    Closing,
    /// Terminal
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Negotiating, Open) | (Negotiating, Closed) | (Open, Closing) | (Closing, Closed)
        )
    }

    /// Whether new requests may still be queued
    pub fn accepts_requests(self) -> bool {
        matches!(self, SessionState::Negotiating | SessionState::Open)
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("connection closed by station")]
    TransportClosed,

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("closed by server")]
    ServerClosed,

    #[error("server shutting down")]
    ServerShutdown,

    #[error("replaced by a newer connection")]
    Replaced,

    #[error("malformed frame")]
    MalformedFrame,
}

impl CloseReason {
    fn close_code(&self) -> CloseCode {
        match self {
            CloseReason::ServerShutdown => CloseCode::Away,
            CloseReason::Replaced => CloseCode::Policy,
            CloseReason::MalformedFrame => CloseCode::Protocol,
            _ => CloseCode::Normal,
        }
    }
}

enum SessionCommand {
    Call {
        message_id: String,
        action: String,
        payload: Value,
        timeout: Option<Duration>,
        completion: oneshot::Sender<RequestOutcome>,
    },
    Close {
        reason: CloseReason,
    },
}

/// Cloneable handle for talking to a running session from other tasks
#[derive(Debug, Clone)]
pub struct SessionHandle {
    station_id: Arc<str>,
    connection_id: Uuid,
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionCommand::Call { message_id, action, .. } => f
                .debug_struct("Call")
                .field("message_id", message_id)
                .field("action", action)
                .finish_non_exhaustive(),
            SessionCommand::Close { reason } => {
                f.debug_struct("Close").field("reason", reason).finish()
            }
        }
    }
}

impl SessionHandle {
    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    /// Identifies this particular connection of the station
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// False once the session task has stopped taking commands
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed() && self.state() != SessionState::Closed
    }

    /// Issue a CALL to the station with the session's default deadline
    pub async fn send(
        &self,
        action: impl Into<String>,
        payload: Value,
    ) -> Result<PendingResponse, RequestError> {
        self.enqueue(action.into(), payload, None).await
    }

    /// Issue a CALL with an explicit deadline
    pub async fn send_with_timeout(
        &self,
        action: impl Into<String>,
        payload: Value,
        timeout: Duration,
    ) -> Result<PendingResponse, RequestError> {
        self.enqueue(action.into(), payload, Some(timeout)).await
    }

    /// Issue a CALL and wait for its outcome
    pub async fn call(&self, action: impl Into<String>, payload: Value) -> RequestOutcome {
        self.send(action, payload).await?.await
    }

    async fn enqueue(
        &self,
        action: String,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<PendingResponse, RequestError> {
        if !self.state().accepts_requests() {
            return Err(RequestError::SessionClosed);
        }

        let message_id = Uuid::new_v4().to_string();
        let (completion, response) = PendingResponse::channel(message_id.clone());
        self.commands
            .send(SessionCommand::Call {
                message_id,
                action,
                payload,
                timeout,
                completion,
            })
            .await
            .map_err(|_| RequestError::SessionClosed)?;

        Ok(response)
    }

    /// Close the session and wait until it is Closed
    pub async fn close(&self) {
        self.close_with(CloseReason::ServerClosed).await
    }

    pub(crate) async fn close_with(&self, reason: CloseReason) {
        // A send error means the session task is already gone.
        let _ = self.commands.send(SessionCommand::Close { reason }).await;
        self.closed().await;
    }

    /// Resolves once the session reaches Closed
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// A single station's connection
pub struct Session<S> {
    station_id: String,
    ws: WebSocketStream<S>,
    registry: Arc<ActionRegistry>,
    correlation: CorrelationTable,
    commands: mpsc::Receiver<SessionCommand>,
    state: watch::Sender<SessionState>,
    malformed_frames: MalformedFramePolicy,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a session for an accepted connection
    pub fn new(
        station_id: impl Into<String>,
        ws: WebSocketStream<S>,
        registry: Arc<ActionRegistry>,
        config: &ServerConfig,
    ) -> (Self, SessionHandle) {
        let station_id = station_id.into();
        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(SessionState::Negotiating);

        let handle = SessionHandle {
            station_id: Arc::from(station_id.as_str()),
            connection_id: Uuid::new_v4(),
            commands: commands_tx,
            state: state_rx,
        };

        let session = Self {
            station_id,
            ws,
            registry,
            correlation: CorrelationTable::new(config.request_timeout),
            commands: commands_rx,
            state: state_tx,
            malformed_frames: config.malformed_frames,
        };

        (session, handle)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn transition(&self, next: SessionState) {
        let current = self.state();
        if current.can_transition_to(next) {
            debug!("Session {}: {:?} -> {:?}", self.station_id, current, next);
            self.state.send_replace(next);
        } else {
            warn!(
                "Session {}: ignoring invalid transition {:?} -> {:?}",
                self.station_id, current, next
            );
        }
    }

    /// Run until the connection ends. Returns why it ended.
    pub async fn run(mut self) -> CloseReason {
        self.transition(SessionState::Open);
        let reason = self.receive_loop().await;
        self.shutdown(&reason).await;
        reason
    }

    /// Close a session that was never run
    pub async fn refuse(mut self, reason: CloseReason) {
        let frame = CloseFrame {
            code: reason.close_code(),
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.ws.close(Some(frame)).await {
            debug!("Closing socket of {}: {}", self.station_id, e);
        }
        self.transition(SessionState::Closed);
        info!("Session {} refused: {}", self.station_id, reason);
    }

    async fn receive_loop(&mut self) -> CloseReason {
        loop {
            let next_deadline = self.correlation.next_deadline();

            tokio::select! {
                frame = self.ws.next() => {
                    let result = match frame {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                        Some(Ok(Message::Binary(data))) => {
                            warn!("Ignoring {}-byte binary frame from {}", data.len(), self.station_id);
                            Ok(())
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!("Close frame from {}: {:?}", self.station_id, frame);
                            Err(CloseReason::TransportClosed)
                        }
                        Some(Ok(_)) => Ok(()),
                        Some(Err(e)) => Err(CloseReason::TransportError(e.to_string())),
                        None => Err(CloseReason::TransportClosed),
                    };
                    if let Err(reason) = result {
                        return reason;
                    }
                }

                Some(command) = self.commands.recv() => {
                    if let Err(reason) = self.handle_command(command).await {
                        return reason;
                    }
                }

                _ = wait_until(next_deadline) => {
                    self.expire_requests();
                }
            }
        }
    }

    async fn handle_text(&mut self, text: &str) -> Result<(), CloseReason> {
        debug!("{} <- {}", self.station_id, text);

        match OcppMessage::parse(text) {
            Ok(OcppMessage::Call(call)) => self.handle_call(call).await,
            Ok(OcppMessage::CallResult(result)) => {
                let message_id = result.message_id.clone();
                if !self.correlation.resolve_result(result) {
                    warn!(
                        "Discarding CALLRESULT from {} with unexpected id {}",
                        self.station_id, message_id
                    );
                }
                Ok(())
            }
            Ok(OcppMessage::CallError(error)) => {
                let message_id = error.message_id.clone();
                if !self.correlation.resolve_error(error) {
                    warn!(
                        "Discarding CALLERROR from {} with unexpected id {}",
                        self.station_id, message_id
                    );
                }
                Ok(())
            }
            Err(e) => {
                if let Some(message_id) = e.answerable_call_id() {
                    warn!("Malformed CALL from {}: {}", self.station_id, e);
                    let reply = CallError::new(message_id, ErrorCode::ProtocolError, e.to_string());
                    return self.send_message(reply.into()).await;
                }

                warn!("Malformed frame from {}: {}", self.station_id, e);
                match self.malformed_frames {
                    MalformedFramePolicy::Drop => Ok(()),
                    MalformedFramePolicy::Close => Err(CloseReason::MalformedFrame),
                }
            }
        }
    }

    async fn handle_call(&mut self, call: Call) -> Result<(), CloseReason> {
        let Call {
            message_id,
            action,
            payload,
        } = call;

        let registry = self.registry.clone();
        let station_id = self.station_id.clone();
        let dispatch = registry.dispatch(&action, payload, &station_id);
        tokio::pin!(dispatch);

        // Keep request deadlines ticking while a handler is busy.
        let outcome = loop {
            let next_deadline = self.correlation.next_deadline();
            tokio::select! {
                outcome = &mut dispatch => break outcome,
                _ = wait_until(next_deadline) => self.expire_requests(),
            }
        };

        let reply = match outcome {
            Ok(payload) => OcppMessage::from(CallResult::new(message_id, payload)),
            Err(e) => {
                warn!("{} from {} failed: {}", action, self.station_id, e);
                OcppMessage::from(e.to_call_error(message_id))
            }
        };

        self.send_message(reply).await
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Result<(), CloseReason> {
        match command {
            SessionCommand::Call {
                message_id,
                action,
                payload,
                timeout,
                completion,
            } => {
                let timeout = timeout.unwrap_or_else(|| self.correlation.default_timeout());
                let request = PendingRequest::new(&message_id, &action, timeout, completion);
                if !self.correlation.insert(request) {
                    return Ok(());
                }

                info!("{} -> {} ({})", self.station_id, action, message_id);
                self.send_message(Call::with_id(message_id, action, payload).into())
                    .await
            }
            SessionCommand::Close { reason } => Err(reason),
        }
    }

    fn expire_requests(&mut self) {
        let expired = self.correlation.expire(Instant::now());
        if expired > 0 {
            warn!("{} request(s) to {} timed out", expired, self.station_id);
        }
    }

    async fn send_message(&mut self, message: OcppMessage) -> Result<(), CloseReason> {
        let frame = message.to_frame();
        debug!("{} -> {}", self.station_id, frame);

        self.ws.send(Message::Text(frame.into())).await.map_err(|e| {
            error!("Failed to send to {}: {}", self.station_id, e);
            CloseReason::TransportError(e.to_string())
        })
    }

    async fn shutdown(&mut self, reason: &CloseReason) {
        self.transition(SessionState::Closing);

        let mut cancelled = self.correlation.cancel_all();

        // Requests queued but never sent are cancelled too.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let SessionCommand::Call { completion, .. } = command {
                let _ = completion.send(Err(RequestError::Cancelled));
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!("Cancelled {} pending request(s) to {}", cancelled, self.station_id);
        }

        if !matches!(reason, CloseReason::TransportError(_)) {
            let frame = CloseFrame {
                code: reason.close_code(),
                reason: reason.to_string().into(),
            };
            if let Err(e) = self.ws.close(Some(frame)).await {
                debug!("Closing socket of {}: {}", self.station_id, e);
            }
        }

        self.transition(SessionState::Closed);
        info!("Session {} closed: {}", self.station_id, reason);
    }
}

impl<S> Drop for Session<S> {
    fn drop(&mut self) {
        // Reached without a clean shutdown only if the session task was
        // aborted or panicked.
        if *self.state.borrow() != SessionState::Closed {
            let cancelled = self.correlation.cancel_all();
            self.commands.close();
            while let Ok(command) = self.commands.try_recv() {
                if let SessionCommand::Call { completion, .. } = command {
                    let _ = completion.send(Err(RequestError::Cancelled));
                }
            }
            warn!(
                "Session {} dropped while {:?}, {} pending request(s) cancelled",
                self.station_id,
                *self.state.borrow(),
                cancelled
            );
            self.state.send_replace(SessionState::Closed);
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
