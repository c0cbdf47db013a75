//! Registration settings
//!
//! Singleton record describing the trust binding between this agent and the
//! cloud tenant. Token, proxy password and private key are stored encrypted.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::command::CommandType;

pub const DEFAULT_COMMAND_REFRESH_INTERVAL: u64 = 10;
pub const DEFAULT_COMMAND_RETRY_INTERVAL: u64 = 5;
pub const DEFAULT_MESSAGE_RETRY_INTERVAL: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    #[default]
    NotRegistered,
    Pending,
    Registered,
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotRegistered => "NOT_REGISTERED",
            Self::Pending => "PENDING",
            Self::Registered => "REGISTERED",
        };
        f.write_str(s)
    }
}

/// Polling intervals, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationIntervals {
    pub command_refresh_interval: u64,
    pub command_retry_interval: u64,
    pub message_retry_interval: u64,
}

impl Default for RegistrationIntervals {
    fn default() -> Self {
        Self {
            command_refresh_interval: DEFAULT_COMMAND_REFRESH_INTERVAL,
            command_retry_interval: DEFAULT_COMMAND_RETRY_INTERVAL,
            message_retry_interval: DEFAULT_MESSAGE_RETRY_INTERVAL,
        }
    }
}

/// One flag per command type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandPermissions {
    pub update_version: bool,
    pub restart_engine: bool,
    pub regenerate_cipher_keys: bool,
    pub update_engine_settings: bool,
    pub update_registration_settings: bool,
    pub create_scan_mode: bool,
    pub update_scan_mode: bool,
    pub delete_scan_mode: bool,
    pub create_ip_filter: bool,
    pub update_ip_filter: bool,
    pub delete_ip_filter: bool,
    pub create_certificate: bool,
    pub update_certificate: bool,
    pub delete_certificate: bool,
    pub create_south: bool,
    pub update_south: bool,
    pub delete_south: bool,
    pub create_or_update_south_items_from_csv: bool,
    pub test_south_connection: bool,
    pub test_south_item: bool,
    pub create_north: bool,
    pub update_north: bool,
    pub delete_north: bool,
    pub test_north_connection: bool,
    pub create_history_query: bool,
    pub update_history_query: bool,
    pub delete_history_query: bool,
    pub create_or_update_history_query_south_items_from_csv: bool,
    pub test_history_query_north_connection: bool,
    pub test_history_query_south_connection: bool,
    pub test_history_query_south_item: bool,
    pub update_history_query_status: bool,
    pub setpoint: bool,
}

impl CommandPermissions {
    /// Every command allowed
    pub fn all() -> Self {
        Self::uniform(true)
    }

    /// Every command denied
    pub fn none() -> Self {
        Self::uniform(false)
    }

    fn uniform(v: bool) -> Self {
        Self {
            update_version: v,
            restart_engine: v,
            regenerate_cipher_keys: v,
            update_engine_settings: v,
            update_registration_settings: v,
            create_scan_mode: v,
            update_scan_mode: v,
            delete_scan_mode: v,
            create_ip_filter: v,
            update_ip_filter: v,
            delete_ip_filter: v,
            create_certificate: v,
            update_certificate: v,
            delete_certificate: v,
            create_south: v,
            update_south: v,
            delete_south: v,
            create_or_update_south_items_from_csv: v,
            test_south_connection: v,
            test_south_item: v,
            create_north: v,
            update_north: v,
            delete_north: v,
            test_north_connection: v,
            create_history_query: v,
            update_history_query: v,
            delete_history_query: v,
            create_or_update_history_query_south_items_from_csv: v,
            test_history_query_north_connection: v,
            test_history_query_south_connection: v,
            test_history_query_south_item: v,
            update_history_query_status: v,
            setpoint: v,
        }
    }

    /// Whether the matrix allows `command_type`
    ///
    /// `Unsupported` is always allowed here; the executor rejects it on dispatch.
    pub fn allows(&self, command_type: CommandType) -> bool {
        match command_type {
            CommandType::UpdateVersion => self.update_version,
            CommandType::RestartEngine => self.restart_engine,
            CommandType::RegenerateCipherKeys => self.regenerate_cipher_keys,
            CommandType::UpdateEngineSettings => self.update_engine_settings,
            CommandType::UpdateRegistrationSettings => self.update_registration_settings,
            CommandType::CreateScanMode => self.create_scan_mode,
            CommandType::UpdateScanMode => self.update_scan_mode,
            CommandType::DeleteScanMode => self.delete_scan_mode,
            CommandType::CreateIpFilter => self.create_ip_filter,
            CommandType::UpdateIpFilter => self.update_ip_filter,
            CommandType::DeleteIpFilter => self.delete_ip_filter,
            CommandType::CreateCertificate => self.create_certificate,
            CommandType::UpdateCertificate => self.update_certificate,
            CommandType::DeleteCertificate => self.delete_certificate,
            CommandType::CreateSouth => self.create_south,
            CommandType::UpdateSouth => self.update_south,
            CommandType::DeleteSouth => self.delete_south,
            CommandType::CreateOrUpdateSouthItemsFromCsv => {
                self.create_or_update_south_items_from_csv
            }
            CommandType::TestSouthConnection => self.test_south_connection,
            CommandType::TestSouthItem => self.test_south_item,
            CommandType::CreateNorth => self.create_north,
            CommandType::UpdateNorth => self.update_north,
            CommandType::DeleteNorth => self.delete_north,
            CommandType::TestNorthConnection => self.test_north_connection,
            CommandType::CreateHistoryQuery => self.create_history_query,
            CommandType::UpdateHistoryQuery => self.update_history_query,
            CommandType::DeleteHistoryQuery => self.delete_history_query,
            CommandType::CreateOrUpdateHistoryQuerySouthItemsFromCsv => {
                self.create_or_update_history_query_south_items_from_csv
            }
            CommandType::TestHistoryQueryNorthConnection => {
                self.test_history_query_north_connection
            }
            CommandType::TestHistoryQuerySouthConnection => {
                self.test_history_query_south_connection
            }
            CommandType::TestHistoryQuerySouthItem => self.test_history_query_south_item,
            CommandType::UpdateHistoryQueryStatus => self.update_history_query_status,
            CommandType::Setpoint => self.setpoint,
            CommandType::Unsupported => true,
        }
    }
}

impl Default for CommandPermissions {
    fn default() -> Self {
        Self::all()
    }
}

/// Persisted registration singleton
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationSettings {
    pub id: String,
    pub status: RegistrationStatus,
    pub host: String,
    pub activation_code: Option<String>,
    pub activation_date: Option<String>,
    pub activation_expiration_date: Option<String>,
    pub check_url: Option<String>,
    pub use_proxy: bool,
    pub proxy_url: Option<String>,
    pub proxy_username: Option<String>,
    /// Encrypted at rest
    pub proxy_password: Option<String>,
    pub accept_unauthorized: bool,
    /// Encrypted at rest
    pub token: Option<String>,
    pub public_cipher_key: Option<String>,
    /// Encrypted at rest
    pub private_cipher_key: Option<String>,
    #[serde(flatten)]
    pub intervals: RegistrationIntervals,
    pub command_permissions: CommandPermissions,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: RegistrationStatus::NotRegistered,
            host: String::new(),
            activation_code: None,
            activation_date: None,
            activation_expiration_date: None,
            check_url: None,
            use_proxy: false,
            proxy_url: None,
            proxy_username: None,
            proxy_password: None,
            accept_unauthorized: false,
            token: None,
            public_cipher_key: None,
            private_cipher_key: None,
            intervals: RegistrationIntervals::default(),
            command_permissions: CommandPermissions::default(),
        }
    }
}

impl RegistrationSettings {
    pub fn is_registered(&self) -> bool {
        self.status == RegistrationStatus::Registered
    }
}

/// Operator input for `register` and `edit_registration_settings`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationCommand {
    pub host: String,
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub proxy_username: Option<String>,
    /// Plain text; empty keeps the stored password
    #[serde(default)]
    pub proxy_password: Option<String>,
    #[serde(default)]
    pub accept_unauthorized: bool,
    #[serde(flatten)]
    pub intervals: RegistrationIntervals,
    #[serde(default)]
    pub command_permissions: CommandPermissions,
}

impl RegistrationCommand {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            use_proxy: false,
            proxy_url: None,
            proxy_username: None,
            proxy_password: None,
            accept_unauthorized: false,
            intervals: RegistrationIntervals::default(),
            command_permissions: CommandPermissions::default(),
        }
    }
}
