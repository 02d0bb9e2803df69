//! Configuration for the OCPP server
//!
//! Plain values handed in by the host process. Nothing here reads the
//! environment or the filesystem.

use std::net::SocketAddr;
use std::time::Duration;

use crate::ocpp::types::RegistrationStatus;

/// OCPP 1.6 JSON WebSocket subprotocol
pub const OCPP16_SUBPROTOCOL: &str = "ocpp1.6";

/// Default listen address
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9000";

/// What a session does with a frame that is not a recognisable OCPP message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedFramePolicy {
    /// Log and drop the frame, keep the session open
    #[default]
    Drop,
    /// Close the session
    Close,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: SocketAddr,

    /// Subprotocols the server accepts, in order of preference
    pub subprotocols: Vec<String>,

    /// Deadline for server-initiated requests
    pub request_timeout: Duration,

    /// Handling of unidentifiable inbound frames
    pub malformed_frames: MalformedFramePolicy,

    /// Maximum size of a single WebSocket message
    pub max_message_size: usize,

    /// Capacity of each session's command queue
    pub command_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            subprotocols: vec![OCPP16_SUBPROTOCOL.to_string()],
            request_timeout: Duration::from_secs(30),
            malformed_frames: MalformedFramePolicy::Drop,
            max_message_size: 64 * 1024,
            command_buffer: 64,
        }
    }
}

impl ServerConfig {
    /// Create config listening on `bind_addr`
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Replace the accepted subprotocols
    pub fn with_subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    /// Set the request deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set malformed frame handling
    pub fn with_malformed_frames(mut self, policy: MalformedFramePolicy) -> Self {
        self.malformed_frames = policy;
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set the per-session command queue capacity
    pub fn with_command_buffer(mut self, capacity: usize) -> Self {
        self.command_buffer = capacity;
        self
    }
}

/// Settings for the built-in BootNotification handler
#[derive(Debug, Clone)]
pub struct BootNotificationConfig {
    /// Heartbeat interval returned to stations, in seconds
    pub interval_secs: i32,
    pub status: RegistrationStatus,
}

impl Default for BootNotificationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            status: RegistrationStatus::Accepted,
        }
    }
}
