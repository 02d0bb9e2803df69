//! Request/response correlation for server-initiated CALLs
//!
//! Owned by exactly one session task, so it needs no locking. Every pending
//! request is completed through [`CorrelationTable::complete`], which removes
//! it from the table first: a response, a timeout and a cancellation can
//! never resolve the same request twice.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::messages::{CallError, CallResult, ErrorCode};

/// Failure of a server-initiated request
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Request cancelled because the session closed")]
    Cancelled,

    #[error("OCPP error from station: {code} - {description}")]
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("Session is closed")]
    SessionClosed,

    #[error("Message id {0} is already pending")]
    DuplicateId(String),
}

pub type RequestOutcome = Result<Value, RequestError>;

/// Server-initiated CALL awaiting its CALLRESULT/CALLERROR
#[derive(Debug)]
pub struct PendingRequest {
    pub message_id: String,
    pub action: String,
    pub issued_at: Instant,
    pub deadline: Instant,
    completion: oneshot::Sender<RequestOutcome>,
}

impl PendingRequest {
    pub fn new(
        message_id: impl Into<String>,
        action: impl Into<String>,
        timeout: Duration,
        completion: oneshot::Sender<RequestOutcome>,
    ) -> Self {
        let issued_at = Instant::now();
        Self {
            message_id: message_id.into(),
            action: action.into(),
            issued_at,
            deadline: issued_at + timeout,
            completion,
        }
    }
}

/// Handle to the eventual outcome of a server-initiated CALL
#[derive(Debug)]
pub struct PendingResponse {
    message_id: String,
    rx: oneshot::Receiver<RequestOutcome>,
}

impl PendingResponse {
    /// Create a completion slot and the handle that waits on it
    pub fn channel(message_id: impl Into<String>) -> (oneshot::Sender<RequestOutcome>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                message_id: message_id.into(),
                rx,
            },
        )
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

impl Future for PendingResponse {
    type Output = RequestOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the session task went away without resolving.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(RequestError::SessionClosed)))
    }
}

/// Per-session table of pending requests keyed by message id
#[derive(Debug)]
pub struct CorrelationTable {
    pending: HashMap<String, PendingRequest>,
    default_timeout: Duration,
}

impl CorrelationTable {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    /// Record a request. A duplicate id is refused and the request is
    /// resolved immediately with `DuplicateId`.
    pub fn insert(&mut self, request: PendingRequest) -> bool {
        if self.pending.contains_key(&request.message_id) {
            let id = request.message_id.clone();
            let _ = request.completion.send(Err(RequestError::DuplicateId(id)));
            return false;
        }
        self.pending.insert(request.message_id.clone(), request);
        true
    }

    /// Earliest deadline among pending requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Resolve a pending request. Returns false when the id is unknown.
    pub fn complete(&mut self, message_id: &str, outcome: RequestOutcome) -> bool {
        match self.pending.remove(message_id) {
            Some(request) => {
                debug!(
                    "Completed {} ({}) after {:?}",
                    request.action,
                    message_id,
                    request.issued_at.elapsed()
                );
                // The caller may have stopped waiting; that is not an error here.
                let _ = request.completion.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolve from an inbound CALLRESULT. False means no such request.
    pub fn resolve_result(&mut self, result: CallResult) -> bool {
        self.complete(&result.message_id, Ok(result.payload))
    }

    /// Resolve from an inbound CALLERROR. False means no such request.
    pub fn resolve_error(&mut self, error: CallError) -> bool {
        let outcome = Err(RequestError::Remote {
            code: error.error_code,
            description: error.error_description,
            details: error.error_details,
        });
        self.complete(&error.message_id, outcome)
    }

    /// Time out every request whose deadline is at or before `now`
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .pending
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.message_id.clone())
            .collect();

        for message_id in &expired {
            warn!("Request {} timed out", message_id);
            self.complete(message_id, Err(RequestError::Timeout));
        }
        expired.len()
    }

    /// Cancel everything still pending
    pub fn cancel_all(&mut self) -> usize {
        let ids: Vec<String> = self.pending.keys().cloned().collect();
        for message_id in &ids {
            self.complete(message_id, Err(RequestError::Cancelled));
        }
        ids.len()
    }
}
