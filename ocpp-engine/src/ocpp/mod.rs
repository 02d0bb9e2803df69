//! OCPP 1.6 JSON protocol layer
//!
//! - `messages`: OCPP-J framing (CALL, CALLRESULT, CALLERROR)
//! - `types`: typed payloads for the built-in handlers
//! - `registry`: action name -> handler dispatch
//! - `correlation`: pending server-initiated requests
//! - `gate`: handshake policy (subprotocol, station id)
//! - `session`: per-connection state machine and receive loop

pub mod messages;
pub mod types;
pub mod registry;
pub mod correlation;
pub mod gate;
pub mod session;

pub use messages::*;
pub use types::*;
pub use registry::{ActionRegistry, DispatchError, HandlerError};
pub use correlation::{CorrelationTable, PendingResponse, RequestError, RequestOutcome};
pub use gate::{ConnectionGate, GateError, HandshakeRejected, HandshakeResult};
pub use session::{CloseReason, Session, SessionHandle, SessionState};
