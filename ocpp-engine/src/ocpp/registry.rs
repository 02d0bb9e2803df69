//! Action registry
//!
//! Maps OCPP action names to typed handlers. Each entry decodes the raw JSON
//! payload into the handler's request type, invokes it with the station id,
//! and serializes the typed response back to JSON.
//!
//! The registry is filled once during startup and then shared read-only
//! (`Arc<ActionRegistry>`) by every session.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::messages::{CallError, ErrorCode};

/// Error returned by an action handler
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Reasons a CALL could not be turned into a CALLRESULT
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid payload for {action}: {source}")]
    PayloadInvalid {
        action: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Handler for {action} failed: {reason}")]
    HandlerFailed { action: String, reason: String },
}

impl DispatchError {
    /// OCPP error code reported to the station
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DispatchError::UnknownAction(_) => ErrorCode::NotImplemented,
            DispatchError::PayloadInvalid { .. } => ErrorCode::FormationViolation,
            DispatchError::HandlerFailed { .. } => ErrorCode::InternalError,
        }
    }

    /// Build the CALLERROR answering the CALL with `message_id`
    pub fn to_call_error(&self, message_id: impl Into<String>) -> CallError {
        CallError::new(message_id, self.error_code(), self.to_string())
    }
}

type DecodeFn = dyn Fn(Value) -> Result<Invocation, serde_json::Error> + Send + Sync;
type Invocation = Box<dyn FnOnce(String) -> BoxFuture<'static, Result<Value, String>> + Send>;

/// One registered action: typed decode plus invoke, erased to JSON in and out
#[derive(Clone)]
pub struct ActionHandlerEntry {
    action: String,
    decode: Arc<DecodeFn>,
}

impl ActionHandlerEntry {
    fn new<Req, Res, F, Fut>(action: String, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(String, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let decode = move |raw: Value| -> Result<Invocation, serde_json::Error> {
            let input: Req = serde_json::from_value(raw)?;
            let handler = handler.clone();
            let invoke: Invocation = Box::new(move |station_id: String| {
                // The handler runs on first poll, inside the caller's unwind guard.
                async move {
                    let output = (*handler)(station_id, input).await.map_err(|e| e.0)?;
                    serde_json::to_value(output)
                        .map_err(|e| format!("failed to serialize response: {}", e))
                }
                .boxed()
            });
            Ok(invoke)
        };

        Self {
            action,
            decode: Arc::new(decode),
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }
}

impl std::fmt::Debug for ActionHandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionHandlerEntry")
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

/// Action name -> handler table
#[derive(Debug, Default, Clone)]
pub struct ActionRegistry {
    handlers: HashMap<String, ActionHandlerEntry>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for `action`.
    ///
    /// Registering the same name again replaces the earlier handler.
    pub fn register<Req, Res, F, Fut>(&mut self, action: impl Into<String>, handler: F) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(String, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, HandlerError>> + Send + 'static,
    {
        let action = action.into();
        let entry = ActionHandlerEntry::new(action.clone(), handler);
        if self.handlers.insert(action.clone(), entry).is_some() {
            debug!("Replaced handler for {}", action);
        }
        self
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Registered action names, sorted
    pub fn actions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Decode `payload` for `action` and run its handler.
    ///
    /// Handler errors and panics both come back as `HandlerFailed`.
    pub async fn dispatch(
        &self,
        action: &str,
        payload: Value,
        station_id: &str,
    ) -> Result<Value, DispatchError> {
        let entry = self
            .handlers
            .get(action)
            .ok_or_else(|| DispatchError::UnknownAction(action.to_string()))?;

        let invoke = (entry.decode)(payload).map_err(|source| DispatchError::PayloadInvalid {
            action: action.to_string(),
            source,
        })?;

        let outcome = AssertUnwindSafe(invoke(station_id.to_string()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(DispatchError::HandlerFailed {
                action: action.to_string(),
                reason,
            }),
            Err(panic) => Err(DispatchError::HandlerFailed {
                action: action.to_string(),
                reason: panic_message(panic.as_ref()),
            }),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
