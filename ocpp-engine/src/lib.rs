//! # OCPP Engine
//!
//! OCPP 1.6 JSON session engine for a central system accepting charge point
//! connections over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! Charge Point (station)
//!       │ WebSocket, subprotocol "ocpp1.6", path /{station_id}
//!       ▼
//! ┌──────────────────────────────────────────┐
//! │  CentralSystem (server)                  │
//! │  accept loop │ station directory         │
//! └──────┬───────────────────────────────────┘
//!        │ ConnectionGate (handshake)
//!        ▼
//! ┌──────────────────────────────────────────┐
//! │  Session (one task per station)          │
//! │  ┌──────────┐ ┌──────────┐ ┌───────────┐ │
//! │  │ Frame    │ │ Action   │ │Correlation│ │
//! │  │ Codec    │ │ Registry │ │ Table     │ │
//! │  └──────────┘ └──────────┘ └───────────┘ │
//! └──────────────────────────────────────────┘
//!        ▲
//!        │ SessionHandle (outbound CALLs, close)
//!   host code
//! ```
//!
//! ## Message flow
//!
//! | Inbound frame | Result |
//! |---------------|--------|
//! | CALL, known action, valid payload | CALLRESULT with handler output |
//! | CALL, unknown action | CALLERROR `NotImplemented` |
//! | CALL, payload rejected | CALLERROR `FormationViolation` |
//! | CALL, handler failed | CALLERROR `InternalError` |
//! | CALLRESULT / CALLERROR | resolves the pending outbound request |
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_engine::{handlers, BootNotificationConfig, CentralSystem, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = handlers::default_registry(BootNotificationConfig::default());
//!     let server = CentralSystem::new(ServerConfig::default(), registry);
//!
//!     server.serve().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod ocpp;
pub mod config;
pub mod handlers;
pub mod server;

pub use config::{BootNotificationConfig, MalformedFramePolicy, ServerConfig};
pub use server::{CentralSystem, ServerError};

// Re-export key types
pub use ocpp::{
    ActionRegistry, Call, CallError, CallResult, ErrorCode, HandlerError, OcppMessage,
    PendingResponse, RequestError, SessionHandle, SessionState,
};
