//! Remote command model
//!
//! A command is issued by the cloud control plane, persisted locally on
//! retrieval and executed at most once. The wire format is the cloud DTO:
//! common fields plus a type tag selecting the type-specific payload.
//!
//! ```json
//! {
//!   "id": "c1",
//!   "type": "update-scan-mode",
//!   "targetVersion": "3.4.0",
//!   "scanModeId": "sm1",
//!   "commandContent": { "name": "every second", "cron": "* * * * * *" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::registration::RegistrationIntervals;

/// Command lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Retrieved,
    Running,
    Completed,
    Errored,
    Cancelled,
}

impl CommandStatus {
    /// Terminal states never transition again
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Retrieved => "RETRIEVED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Errored => "ERRORED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of command types, used for permission checks and ledger filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandType {
    UpdateVersion,
    RestartEngine,
    RegenerateCipherKeys,
    UpdateEngineSettings,
    UpdateRegistrationSettings,
    CreateScanMode,
    UpdateScanMode,
    DeleteScanMode,
    CreateIpFilter,
    UpdateIpFilter,
    DeleteIpFilter,
    CreateCertificate,
    UpdateCertificate,
    DeleteCertificate,
    CreateSouth,
    UpdateSouth,
    DeleteSouth,
    CreateOrUpdateSouthItemsFromCsv,
    TestSouthConnection,
    TestSouthItem,
    CreateNorth,
    UpdateNorth,
    DeleteNorth,
    TestNorthConnection,
    CreateHistoryQuery,
    UpdateHistoryQuery,
    DeleteHistoryQuery,
    CreateOrUpdateHistoryQuerySouthItemsFromCsv,
    TestHistoryQueryNorthConnection,
    TestHistoryQuerySouthConnection,
    TestHistoryQuerySouthItem,
    UpdateHistoryQueryStatus,
    Setpoint,
    Unsupported,
}

impl CommandType {
    /// Wire name of the type
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateVersion => "update-version",
            Self::RestartEngine => "restart-engine",
            Self::RegenerateCipherKeys => "regenerate-cipher-keys",
            Self::UpdateEngineSettings => "update-engine-settings",
            Self::UpdateRegistrationSettings => "update-registration-settings",
            Self::CreateScanMode => "create-scan-mode",
            Self::UpdateScanMode => "update-scan-mode",
            Self::DeleteScanMode => "delete-scan-mode",
            Self::CreateIpFilter => "create-ip-filter",
            Self::UpdateIpFilter => "update-ip-filter",
            Self::DeleteIpFilter => "delete-ip-filter",
            Self::CreateCertificate => "create-certificate",
            Self::UpdateCertificate => "update-certificate",
            Self::DeleteCertificate => "delete-certificate",
            Self::CreateSouth => "create-south",
            Self::UpdateSouth => "update-south",
            Self::DeleteSouth => "delete-south",
            Self::CreateOrUpdateSouthItemsFromCsv => "create-or-update-south-items-from-csv",
            Self::TestSouthConnection => "test-south-connection",
            Self::TestSouthItem => "test-south-item",
            Self::CreateNorth => "create-north",
            Self::UpdateNorth => "update-north",
            Self::DeleteNorth => "delete-north",
            Self::TestNorthConnection => "test-north-connection",
            Self::CreateHistoryQuery => "create-history-query",
            Self::UpdateHistoryQuery => "update-history-query",
            Self::DeleteHistoryQuery => "delete-history-query",
            Self::CreateOrUpdateHistoryQuerySouthItemsFromCsv => {
                "create-or-update-history-query-south-items-from-csv"
            }
            Self::TestHistoryQueryNorthConnection => "test-history-query-north-connection",
            Self::TestHistoryQuerySouthConnection => "test-history-query-south-connection",
            Self::TestHistoryQuerySouthItem => "test-history-query-south-item",
            Self::UpdateHistoryQueryStatus => "update-history-query-status",
            Self::Setpoint => "setpoint",
            Self::Unsupported => "unsupported",
        }
    }

    /// Types whose execution ends with a process restart
    pub const fn terminates_process(&self) -> bool {
        matches!(self, Self::UpdateVersion | Self::RestartEngine)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of an `update-version` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateVersionContent {
    pub version: String,
    pub asset_id: String,
    #[serde(default)]
    pub update_launcher: bool,
    #[serde(default)]
    pub backup_folders: String,
}

/// Run state of a history query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryQueryStatus {
    Pending,
    Running,
    Paused,
    Finished,
    Errored,
}

impl fmt::Display for HistoryQueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Finished => "FINISHED",
            Self::Errored => "ERRORED",
        };
        f.write_str(s)
    }
}

/// Type-specific part of a command, tagged by `type`
///
/// Unknown tags deserialize to [`CommandPayload::Unsupported`] so that a newer
/// cloud never blocks retrieval of the whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum CommandPayload {
    UpdateVersion {
        command_content: UpdateVersionContent,
    },
    RestartEngine,
    RegenerateCipherKeys,
    UpdateEngineSettings {
        command_content: Value,
    },
    UpdateRegistrationSettings {
        command_content: RegistrationIntervals,
    },
    CreateScanMode {
        command_content: Value,
    },
    UpdateScanMode {
        scan_mode_id: String,
        command_content: Value,
    },
    DeleteScanMode {
        scan_mode_id: String,
    },
    CreateIpFilter {
        command_content: Value,
    },
    UpdateIpFilter {
        ip_filter_id: String,
        command_content: Value,
    },
    DeleteIpFilter {
        ip_filter_id: String,
    },
    CreateCertificate {
        command_content: Value,
    },
    UpdateCertificate {
        certificate_id: String,
        command_content: Value,
    },
    DeleteCertificate {
        certificate_id: String,
    },
    CreateSouth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retrieve_secrets_from_south: Option<String>,
        command_content: Value,
    },
    UpdateSouth {
        south_connector_id: String,
        command_content: Value,
    },
    DeleteSouth {
        south_connector_id: String,
    },
    CreateOrUpdateSouthItemsFromCsv {
        south_connector_id: String,
        #[serde(default)]
        delete_items_not_present: bool,
        csv_content: String,
        delimiter: String,
    },
    TestSouthConnection {
        south_connector_id: String,
        command_content: Value,
    },
    TestSouthItem {
        south_connector_id: String,
        item_id: String,
        command_content: Value,
    },
    CreateNorth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retrieve_secrets_from_north: Option<String>,
        command_content: Value,
    },
    UpdateNorth {
        north_connector_id: String,
        command_content: Value,
    },
    DeleteNorth {
        north_connector_id: String,
    },
    TestNorthConnection {
        north_connector_id: String,
        command_content: Value,
    },
    CreateHistoryQuery {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retrieve_secrets_from_south: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retrieve_secrets_from_north: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retrieve_secrets_from_history_query: Option<String>,
        command_content: Value,
    },
    UpdateHistoryQuery {
        history_id: String,
        command_content: Value,
    },
    DeleteHistoryQuery {
        history_id: String,
    },
    CreateOrUpdateHistoryQuerySouthItemsFromCsv {
        history_id: String,
        #[serde(default)]
        delete_items_not_present: bool,
        csv_content: String,
        delimiter: String,
    },
    TestHistoryQueryNorthConnection {
        history_id: String,
        command_content: Value,
    },
    TestHistoryQuerySouthConnection {
        history_id: String,
        command_content: Value,
    },
    TestHistoryQuerySouthItem {
        history_id: String,
        item_id: String,
        command_content: Value,
    },
    UpdateHistoryQueryStatus {
        history_id: String,
        history_query_status: HistoryQueryStatus,
    },
    Setpoint {
        north_connector_id: String,
        command_content: Value,
    },
    #[serde(other)]
    Unsupported,
}

impl CommandPayload {
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::UpdateVersion { .. } => CommandType::UpdateVersion,
            Self::RestartEngine => CommandType::RestartEngine,
            Self::RegenerateCipherKeys => CommandType::RegenerateCipherKeys,
            Self::UpdateEngineSettings { .. } => CommandType::UpdateEngineSettings,
            Self::UpdateRegistrationSettings { .. } => CommandType::UpdateRegistrationSettings,
            Self::CreateScanMode { .. } => CommandType::CreateScanMode,
            Self::UpdateScanMode { .. } => CommandType::UpdateScanMode,
            Self::DeleteScanMode { .. } => CommandType::DeleteScanMode,
            Self::CreateIpFilter { .. } => CommandType::CreateIpFilter,
            Self::UpdateIpFilter { .. } => CommandType::UpdateIpFilter,
            Self::DeleteIpFilter { .. } => CommandType::DeleteIpFilter,
            Self::CreateCertificate { .. } => CommandType::CreateCertificate,
            Self::UpdateCertificate { .. } => CommandType::UpdateCertificate,
            Self::DeleteCertificate { .. } => CommandType::DeleteCertificate,
            Self::CreateSouth { .. } => CommandType::CreateSouth,
            Self::UpdateSouth { .. } => CommandType::UpdateSouth,
            Self::DeleteSouth { .. } => CommandType::DeleteSouth,
            Self::CreateOrUpdateSouthItemsFromCsv { .. } => {
                CommandType::CreateOrUpdateSouthItemsFromCsv
            }
            Self::TestSouthConnection { .. } => CommandType::TestSouthConnection,
            Self::TestSouthItem { .. } => CommandType::TestSouthItem,
            Self::CreateNorth { .. } => CommandType::CreateNorth,
            Self::UpdateNorth { .. } => CommandType::UpdateNorth,
            Self::DeleteNorth { .. } => CommandType::DeleteNorth,
            Self::TestNorthConnection { .. } => CommandType::TestNorthConnection,
            Self::CreateHistoryQuery { .. } => CommandType::CreateHistoryQuery,
            Self::UpdateHistoryQuery { .. } => CommandType::UpdateHistoryQuery,
            Self::DeleteHistoryQuery { .. } => CommandType::DeleteHistoryQuery,
            Self::CreateOrUpdateHistoryQuerySouthItemsFromCsv { .. } => {
                CommandType::CreateOrUpdateHistoryQuerySouthItemsFromCsv
            }
            Self::TestHistoryQueryNorthConnection { .. } => {
                CommandType::TestHistoryQueryNorthConnection
            }
            Self::TestHistoryQuerySouthConnection { .. } => {
                CommandType::TestHistoryQuerySouthConnection
            }
            Self::TestHistoryQuerySouthItem { .. } => CommandType::TestHistoryQuerySouthItem,
            Self::UpdateHistoryQueryStatus { .. } => CommandType::UpdateHistoryQueryStatus,
            Self::Setpoint { .. } => CommandType::Setpoint,
            Self::Unsupported => CommandType::Unsupported,
        }
    }
}

/// Command as returned by the cloud (`/commands/pending`, `/commands/list-by-ids`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommand {
    pub id: String,
    pub target_version: String,
    #[serde(flatten)]
    pub payload: CommandPayload,
    /// Set when the payload could not be read; the command is stored ERRORED
    #[serde(skip)]
    pub rejection: Option<String>,
}

impl RemoteCommand {
    pub fn new(id: impl Into<String>, target_version: impl Into<String>, payload: CommandPayload) -> Self {
        Self {
            id: id.into(),
            target_version: target_version.into(),
            payload,
            rejection: None,
        }
    }

    /// Command whose id is known but whose payload is unreadable
    pub fn rejected(id: impl Into<String>, target_version: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            rejection: Some(reason.into()),
            ..Self::new(id, target_version, CommandPayload::Unsupported)
        }
    }
}

/// Command as persisted in the local ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    /// Local creation order, drives oldest-first execution
    #[serde(default)]
    pub sequence: u64,
    pub status: CommandStatus,
    pub ack: bool,
    pub target_version: String,
    pub retrieved_date: String,
    pub completed_date: Option<String>,
    pub result: Option<String>,
    #[serde(flatten)]
    pub payload: CommandPayload,
}

impl Command {
    /// Build a freshly retrieved command
    /// RETRIEVED, or already ERRORED when the cloud sent an unreadable payload
    pub fn retrieved(remote: RemoteCommand, sequence: u64, retrieved_date: String) -> Self {
        let (status, completed_date) = match remote.rejection {
            Some(_) => (CommandStatus::Errored, Some(retrieved_date.clone())),
            None => (CommandStatus::Retrieved, None),
        };
        Self {
            id: remote.id,
            sequence,
            status,
            ack: false,
            target_version: remote.target_version,
            retrieved_date,
            completed_date,
            result: remote.rejection,
            payload: remote.payload,
        }
    }

    pub fn command_type(&self) -> CommandType {
        self.payload.command_type()
    }
}

/// Status line pushed back to the cloud on acknowledgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatusUpdate {
    pub id: String,
    pub status: CommandStatus,
    pub completed_date: Option<String>,
    pub result: Option<String>,
}

impl From<&Command> for CommandStatusUpdate {
    fn from(command: &Command) -> Self {
        Self {
            id: command.id.clone(),
            status: command.status,
            completed_date: command.completed_date.clone(),
            result: command.result.clone(),
        }
    }
}

/// Ledger filter. Empty lists match everything.
#[derive(Debug, Clone, Default)]
pub struct CommandFilter {
    pub statuses: Vec<CommandStatus>,
    pub types: Vec<CommandType>,
    pub ack: Option<bool>,
}

impl CommandFilter {
    pub fn with_status(statuses: &[CommandStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }

    pub fn unacknowledged() -> Self {
        Self {
            ack: Some(false),
            ..Default::default()
        }
    }

    pub fn matches(&self, command: &Command) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&command.status))
            && (self.types.is_empty() || self.types.contains(&command.command_type()))
            && self.ack.is_none_or(|ack| ack == command.ack)
    }
}

/// One page of a ledger search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    pub total_elements: usize,
    pub size: usize,
    pub number: usize,
    pub total_pages: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_command_parses_typed_payload() {
        let remote: RemoteCommand = serde_json::from_value(json!({
            "id": "c1",
            "type": "update-scan-mode",
            "targetVersion": "3.4.0",
            "scanModeId": "sm1",
            "commandContent": { "name": "every second" }
        }))
        .unwrap();

        assert_eq!(remote.id, "c1");
        assert_eq!(remote.payload.command_type(), CommandType::UpdateScanMode);
        match remote.payload {
            CommandPayload::UpdateScanMode { scan_mode_id, command_content } => {
                assert_eq!(scan_mode_id, "sm1");
                assert_eq!(command_content["name"], "every second");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_unit_variant_ignores_extra_fields() {
        let remote: RemoteCommand = serde_json::from_value(json!({
            "id": "c2",
            "type": "restart-engine",
            "targetVersion": "3.4.0",
            "status": "RETRIEVED"
        }))
        .unwrap();
        assert_eq!(remote.payload, CommandPayload::RestartEngine);
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        let remote: RemoteCommand = serde_json::from_value(json!({
            "id": "c3",
            "type": "launch-rocket",
            "targetVersion": "3.4.0"
        }))
        .unwrap();
        assert_eq!(remote.payload.command_type(), CommandType::Unsupported);
    }

    #[test]
    fn test_ledger_command_keeps_payload_flat() {
        let remote: RemoteCommand = serde_json::from_value(json!({
            "id": "c4",
            "type": "create-or-update-south-items-from-csv",
            "targetVersion": "3.4.0",
            "southConnectorId": "s1",
            "deleteItemsNotPresent": true,
            "csvContent": "name\nitem1",
            "delimiter": ","
        }))
        .unwrap();
        let command = Command::retrieved(remote, 7, "2024-01-01T00:00:00.000Z".into());
        let value = serde_json::to_value(&command).unwrap();

        assert_eq!(value["type"], "create-or-update-south-items-from-csv");
        assert_eq!(value["southConnectorId"], "s1");
        assert_eq!(value["status"], "RETRIEVED");
        assert_eq!(value["sequence"], 7);

        let back: Command = serde_json::from_value(value).unwrap();
        assert_eq!(back, command);
    }

    #[test]
    fn test_type_names_match_serde() {
        let types = [
            CommandType::CreateOrUpdateHistoryQuerySouthItemsFromCsv,
            CommandType::TestHistoryQuerySouthItem,
            CommandType::CreateIpFilter,
            CommandType::Setpoint,
        ];
        for t in types {
            assert_eq!(serde_json::to_value(t).unwrap(), json!(t.as_str()));
        }
    }

    #[test]
    fn test_filter_matches() {
        let remote: RemoteCommand = serde_json::from_value(json!({
            "id": "c5", "type": "restart-engine", "targetVersion": "1"
        }))
        .unwrap();
        let command = Command::retrieved(remote, 1, "2024-01-01T00:00:00.000Z".into());

        assert!(CommandFilter::default().matches(&command));
        assert!(CommandFilter::with_status(&[CommandStatus::Retrieved]).matches(&command));
        assert!(!CommandFilter::with_status(&[CommandStatus::Running]).matches(&command));
        assert!(CommandFilter::unacknowledged().matches(&command));
        let by_type = CommandFilter {
            types: vec![CommandType::UpdateVersion],
            ..Default::default()
        };
        assert!(!by_type.matches(&command));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!CommandStatus::Retrieved.is_terminal());
        assert!(!CommandStatus::Running.is_terminal());
        assert!(CommandStatus::Completed.is_terminal());
        assert!(CommandStatus::Errored.is_terminal());
        assert!(CommandStatus::Cancelled.is_terminal());
    }
}
