//! Cloud wire types
//!
//! Request and response bodies exchanged with the OIAnalytics control plane.
//! Commands themselves live in [`crate::models::command`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::HistoryQueryStatus;

/// Cloud API paths, relative to the registration host
pub mod paths {
    pub const REGISTRATION: &str = "/api/oianalytics/oibus/registration";
    pub const PENDING_COMMANDS: &str = "/api/oianalytics/oibus/commands/pending";
    pub const COMMANDS_BY_IDS: &str = "/api/oianalytics/oibus/commands/list-by-ids";
    pub const COMMAND_STATUS: &str = "/api/oianalytics/oibus/commands/status";
    pub const FULL_CONFIG: &str = "/api/oianalytics/oibus/configuration";
    pub const HISTORY_QUERIES: &str = "/api/oianalytics/oibus/configuration/history-queries";
    pub const UPGRADE_ASSET: &str = "/api/oianalytics/oibus/upgrade/asset";
}

/// Body of the registration request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub activation_code: String,
    pub oibus_version: String,
    pub oibus_arch: String,
    pub oibus_os: String,
    pub oibus_id: String,
    pub oibus_name: String,
    pub public_key: String,
}

/// Answer to the registration request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub redirect_url: String,
    pub expiration_date: String,
}

/// Answer to a registration check poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationCheck {
    pub status: String,
    #[serde(default)]
    pub expired: bool,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl RegistrationCheck {
    pub fn is_completed(&self) -> bool {
        self.status == "COMPLETED"
    }
}

// ========== Message payloads ==========

/// Engine part of the `full-config` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnginePayload {
    #[serde(rename = "oIBusInternalId")]
    pub oibus_internal_id: String,
    pub name: String,
    pub software_version: String,
    pub launcher_version: String,
    pub architecture: String,
    pub operating_system: String,
    pub public_key: Option<String>,
    pub settings: Value,
}

/// Named configuration record (scan mode, IP filter, certificate, user, transformer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePayload {
    #[serde(rename = "oIBusInternalId")]
    pub oibus_internal_id: String,
    pub name: String,
    pub settings: Value,
}

/// South or north connector with its secrets blanked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorPayload {
    #[serde(rename = "oIBusInternalId")]
    pub oibus_internal_id: String,
    #[serde(rename = "type")]
    pub connector_type: String,
    pub name: String,
    pub settings: Value,
}

/// Body of the `full-config` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullConfigPayload {
    pub engine: EnginePayload,
    pub scan_modes: Vec<ResourcePayload>,
    pub ip_filters: Vec<ResourcePayload>,
    pub certificates: Vec<ResourcePayload>,
    pub users: Vec<ResourcePayload>,
    pub transformers: Vec<ResourcePayload>,
    pub south_connectors: Vec<ConnectorPayload>,
    pub north_connectors: Vec<ConnectorPayload>,
}

/// One entry of the `history-queries` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQueryPayload {
    #[serde(rename = "oIBusInternalId")]
    pub oibus_internal_id: String,
    pub name: String,
    pub status: HistoryQueryStatus,
    pub south_type: String,
    pub north_type: String,
    pub south_settings: Value,
    pub north_settings: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registration_check_defaults() {
        let check: RegistrationCheck = serde_json::from_value(json!({ "status": "PENDING" })).unwrap();
        assert!(!check.is_completed());
        assert!(!check.expired);
        assert!(check.access_token.is_none());
    }

    #[test]
    fn test_connector_payload_field_names() {
        let payload = ConnectorPayload {
            oibus_internal_id: "s1".into(),
            connector_type: "mqtt".into(),
            name: "broker".into(),
            settings: json!({ "password": "" }),
        };
        let value = serde_json::to_value(payload).unwrap();
        assert_eq!(value["oIBusInternalId"], "s1");
        assert_eq!(value["type"], "mqtt");
    }
}
