//! OCPP 1.6 payload types
//!
//! Only the payloads the built-in handlers need. Unknown request fields are
//! ignored on decode so stations sending extra keys are still accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Registration status for BootNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// BootNotification request (CP -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_box_serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iccid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imsi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_serial_number: Option<String>,
}

/// BootNotification response (CS -> CP)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    /// Heartbeat interval in seconds
    pub interval: i32,
    pub status: RegistrationStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_boot_request_ignores_extra_fields() {
        let req: BootNotificationRequest = serde_json::from_value(json!({
            "chargePointVendor": "Acme",
            "chargePointModel": "X1",
            "firmwareVersion": "1.2.3",
            "somethingVendorSpecific": true
        }))
        .unwrap();

        assert_eq!(req.charge_point_vendor, "Acme");
        assert_eq!(req.charge_point_model, "X1");
        assert_eq!(req.firmware_version.as_deref(), Some("1.2.3"));
        assert!(req.iccid.is_none());
    }

    #[test]
    fn test_boot_request_requires_model() {
        let result = serde_json::from_value::<BootNotificationRequest>(json!({
            "chargePointVendor": "Acme"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_boot_response_wire_names() {
        let resp = BootNotificationResponse {
            current_time: "2026-01-20T12:00:00Z".parse().unwrap(),
            interval: 10,
            status: RegistrationStatus::Accepted,
        };
        let value = serde_json::to_value(&resp).unwrap();

        assert_eq!(value["interval"], 10);
        assert_eq!(value["status"], "Accepted");
        assert_eq!(value["currentTime"], "2026-01-20T12:00:00Z");
    }
}
