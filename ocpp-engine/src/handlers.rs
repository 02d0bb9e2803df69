//! Built-in action handlers

use chrono::Utc;
use tracing::info;

use crate::config::BootNotificationConfig;
use crate::ocpp::registry::{ActionRegistry, HandlerError};
use crate::ocpp::types::{BootNotificationRequest, BootNotificationResponse};

/// BootNotification action name
pub const BOOT_NOTIFICATION: &str = "BootNotification";

/// Answer a BootNotification with the current time and configured interval
pub fn boot_notification(
    config: &BootNotificationConfig,
    station_id: &str,
    request: &BootNotificationRequest,
) -> BootNotificationResponse {
    info!(
        "BootNotification from {}: {} {}",
        station_id, request.charge_point_vendor, request.charge_point_model
    );

    BootNotificationResponse {
        current_time: Utc::now(),
        interval: config.interval_secs,
        status: config.status,
    }
}

/// Add the built-in handlers to `registry`
pub fn register_defaults(registry: &mut ActionRegistry, boot: BootNotificationConfig) {
    registry.register(
        BOOT_NOTIFICATION,
        move |station_id: String, request: BootNotificationRequest| {
            let response = boot_notification(&boot, &station_id, &request);
            async move { Ok::<_, HandlerError>(response) }
        },
    );
}

/// Registry holding only the built-in handlers
pub fn default_registry(boot: BootNotificationConfig) -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    register_defaults(&mut registry, boot);
    registry
}
