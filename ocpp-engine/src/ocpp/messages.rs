//! OCPP 1.6 JSON message framing
//!
//! Every OCPP-J frame is a JSON array whose first element is the message type:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Payload validation against an action's schema is not done here; the
//! action registry owns that.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP 1.6 error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    // Wire spelling used by OCPP 1.6.
    #[serde(rename = "OccurenceConstraintViolation")]
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl ErrorCode {
    /// Wire name of the error code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurrenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
        }
    }

    /// Parse a wire name; unknown codes degrade to `GenericError`
    pub fn from_wire(code: &str) -> Self {
        serde_json::from_value(Value::String(code.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors decoding an inbound frame
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame is not a JSON array")]
    NotAnArray,

    #[error("Invalid frame shape: {0}")]
    InvalidShape(&'static str),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("Message id must be a string")]
    InvalidMessageId,

    /// Identifiable CALL whose remaining fields are wrong.
    /// Carries the id so the caller can answer with a CallError.
    #[error("Malformed CALL {message_id}: {reason}")]
    MalformedCall {
        message_id: String,
        reason: &'static str,
    },
}

impl FrameError {
    /// Message id of a CALL that can still be answered, if any
    pub fn answerable_call_id(&self) -> Option<&str> {
        match self {
            FrameError::MalformedCall { message_id, .. } => Some(message_id),
            _ => None,
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), action, payload)
    }

    /// Create a CALL with a caller-chosen ID
    pub fn with_id(message_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            action: action.into(),
            payload,
        }
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
        }
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message with empty details
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from a text frame
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Decode an already-parsed JSON value
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let mut array = match value {
            Value::Array(array) => array,
            _ => return Err(FrameError::NotAnArray),
        };

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(FrameError::InvalidShape("missing numeric message type"))?;

        let message_id = match array.get(1) {
            Some(Value::String(id)) => id.clone(),
            Some(_) => return Err(FrameError::InvalidMessageId),
            None => return Err(FrameError::InvalidShape("missing message id")),
        };

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(FrameError::MalformedCall {
                        message_id,
                        reason: "CALL must have 4 elements",
                    });
                }
                let payload = array.pop().unwrap_or(Value::Null);
                let action = match array.pop() {
                    Some(Value::String(action)) => action,
                    _ => {
                        return Err(FrameError::MalformedCall {
                            message_id,
                            reason: "action must be a string",
                        })
                    }
                };

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload,
                }))
            }
            3 => {
                if array.len() != 3 {
                    return Err(FrameError::InvalidShape("CALLRESULT must have 3 elements"));
                }
                let payload = array.pop().unwrap_or(Value::Null);

                Ok(OcppMessage::CallResult(CallResult {
                    message_id,
                    payload,
                }))
            }
            4 => {
                if array.len() != 5 {
                    return Err(FrameError::InvalidShape("CALLERROR must have 5 elements"));
                }
                let error_details = array.pop().unwrap_or(Value::Null);
                let error_description = match array.pop() {
                    Some(Value::String(description)) => description,
                    _ => return Err(FrameError::InvalidShape("error description must be a string")),
                };
                let error_code = match array.pop() {
                    Some(Value::String(code)) => ErrorCode::from_wire(&code),
                    _ => return Err(FrameError::InvalidShape("error code must be a string")),
                };

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details,
                }))
            }
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
        }
    }

    /// Wire form as a JSON array value
    pub fn to_value(&self) -> Value {
        let msg_type = self.message_type() as i32;
        match self {
            OcppMessage::Call(c) => {
                serde_json::json!([msg_type, c.message_id, c.action, c.payload])
            }
            OcppMessage::CallResult(r) => serde_json::json!([msg_type, r.message_id, r.payload]),
            OcppMessage::CallError(e) => serde_json::json!([
                msg_type,
                e.message_id,
                e.error_code.as_str(),
                e.error_description,
                e.error_details
            ]),
        }
    }

    /// Serialize to the text frame sent over the WebSocket
    pub fn to_frame(&self) -> String {
        self.to_value().to_string()
    }
}

impl From<Call> for OcppMessage {
    fn from(call: Call) -> Self {
        OcppMessage::Call(call)
    }
}

impl From<CallResult> for OcppMessage {
    fn from(result: CallResult) -> Self {
        OcppMessage::CallResult(result)
    }
}

impl From<CallError> for OcppMessage {
    fn from(error: CallError) -> Self {
        OcppMessage::CallError(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_serialization() {
        let call = Call::new("Heartbeat", json!({}));
        let text = OcppMessage::from(call).to_frame();

        assert!(text.starts_with("[2,"));
        assert!(text.contains("\"Heartbeat\""));
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "123", "BootNotification", {"chargePointVendor": "Acme", "chargePointModel": "X1"}]"#;
        let msg = OcppMessage::parse(json).unwrap();

        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.message_id, "123");
                assert_eq!(call.action, "BootNotification");
                assert_eq!(call.payload["chargePointVendor"], "Acme");
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;
        let msg = OcppMessage::parse(json).unwrap();

        match msg {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.message_id, "msg-123");
                assert_eq!(result.payload["currentTime"], "2026-01-20T12:00:00Z");
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        let msg = OcppMessage::parse(json).unwrap();

        match msg {
            OcppMessage::CallError(error) => {
                assert_eq!(error.message_id, "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
                assert_eq!(error.error_description, "Action not supported");
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_unknown_error_code_degrades() {
        let json = r#"[4, "e1", "SomethingNew", "", {}]"#;
        match OcppMessage::parse(json).unwrap() {
            OcppMessage::CallError(error) => assert_eq!(error.error_code, ErrorCode::GenericError),
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_occurrence_code_uses_wire_spelling() {
        let error = CallError::new("1", ErrorCode::OccurrenceConstraintViolation, "");
        let text = OcppMessage::from(error).to_frame();
        assert!(text.contains("\"OccurenceConstraintViolation\""));
        assert_eq!(
            ErrorCode::from_wire("OccurenceConstraintViolation"),
            ErrorCode::OccurrenceConstraintViolation
        );
    }

    #[test]
    fn test_distinct_decode_failures() {
        assert!(matches!(OcppMessage::parse("not json"), Err(FrameError::Json(_))));
        assert!(matches!(OcppMessage::parse(r#"{"a": 1}"#), Err(FrameError::NotAnArray)));
        assert!(matches!(OcppMessage::parse("[]"), Err(FrameError::InvalidShape(_))));
        assert!(matches!(
            OcppMessage::parse(r#"[7, "1", {}]"#),
            Err(FrameError::UnknownMessageType(7))
        ));
        assert!(matches!(
            OcppMessage::parse(r#"[2, 123, "Heartbeat", {}]"#),
            Err(FrameError::InvalidMessageId)
        ));
        assert!(matches!(
            OcppMessage::parse(r#"[3, "1"]"#),
            Err(FrameError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_malformed_call_keeps_id() {
        let err = OcppMessage::parse(r#"[2, "abc", "Heartbeat"]"#).unwrap_err();
        assert_eq!(err.answerable_call_id(), Some("abc"));

        let err = OcppMessage::parse(r#"[2, "abc", 5, {}]"#).unwrap_err();
        assert_eq!(err.answerable_call_id(), Some("abc"));

        let err = OcppMessage::parse(r#"[3, "abc"]"#).unwrap_err();
        assert_eq!(err.answerable_call_id(), None);
    }

    #[test]
    fn test_call_error_wire_shape() {
        let error = CallError::new("42", ErrorCode::FormationViolation, "bad payload")
            .with_details(json!({"field": "chargePointModel"}));
        let value = OcppMessage::from(error).to_value();

        assert_eq!(
            value,
            json!([4, "42", "FormationViolation", "bad payload", {"field": "chargePointModel"}])
        );
    }
}
