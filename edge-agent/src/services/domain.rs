//! Domain collaborators
//!
//! Command handlers perform their side effects through these traits. The
//! agent ships one local implementation ([`super::config_store::ConfigStore`]);
//! an embedding runtime can provide its own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::error::AppResult;
use shared::models::HistoryQueryStatus;
use std::sync::Arc;

use super::secrets::SettingsManifest;

/// Engine identity and settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    pub id: String,
    pub name: String,
    pub version: String,
    pub launcher_version: String,
    #[serde(default)]
    pub settings: Value,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: "OIBus".to_string(),
            version: String::new(),
            launcher_version: String::new(),
            settings: Value::Object(Default::default()),
        }
    }
}

/// South or north connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub connector_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub items: Vec<Value>,
}

/// History query, a south/north pair run over a past time range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQueryRecord {
    pub id: String,
    pub name: String,
    pub status: HistoryQueryStatus,
    pub south_type: String,
    pub north_type: String,
    #[serde(default)]
    pub south_settings: Value,
    #[serde(default)]
    pub north_settings: Value,
    #[serde(default)]
    pub items: Vec<Value>,
}

fn default_enabled() -> bool {
    true
}

/// Configuration records shared across connectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ScanMode,
    IpFilter,
    Certificate,
}

impl ResourceKind {
    /// Label used in command results
    pub const fn label(&self) -> &'static str {
        match self {
            Self::ScanMode => "Scan mode",
            Self::IpFilter => "IP Filter",
            Self::Certificate => "Certificate",
        }
    }
}

/// Outcome of a CSV item check: valid items and per-item errors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsvCheck {
    pub items: Vec<Value>,
    pub errors: Vec<CsvItemError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CsvItemError {
    pub name: String,
    pub error: String,
}

/// Existing records to copy blank secrets from when creating a history query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecretSources {
    pub south: Option<String>,
    pub north: Option<String>,
    pub history_query: Option<String>,
}

/// Read-only snapshot used to build the `full-config` message
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub engine: EngineSettings,
    pub scan_modes: Vec<Value>,
    pub ip_filters: Vec<Value>,
    pub certificates: Vec<Value>,
    pub users: Vec<Value>,
    pub transformers: Vec<Value>,
    pub south_connectors: Vec<ConnectorRecord>,
    pub north_connectors: Vec<ConnectorRecord>,
}

#[async_trait]
pub trait EngineService: Send + Sync {
    async fn engine_settings(&self) -> AppResult<EngineSettings>;

    async fn update_engine_settings(&self, content: Value) -> AppResult<()>;

    /// Persist the running and launcher versions
    async fn update_version(&self, version: &str, launcher_version: &str) -> AppResult<()>;
}

/// CRUD on scan modes, IP filters and certificates
#[async_trait]
pub trait ConfigResourceService: Send + Sync {
    /// Returns the id of the new record
    async fn create_resource(&self, kind: ResourceKind, content: Value) -> AppResult<String>;

    async fn update_resource(&self, kind: ResourceKind, id: &str, content: Value) -> AppResult<()>;

    async fn delete_resource(&self, kind: ResourceKind, id: &str) -> AppResult<()>;
}

#[async_trait]
pub trait SouthService: Send + Sync {
    fn south_manifest(&self, connector_type: &str) -> AppResult<SettingsManifest>;

    async fn get_south(&self, id: &str) -> AppResult<Option<ConnectorRecord>>;

    /// `retrieve_secrets_from` names a connector whose secrets fill blank ones
    async fn create_south(&self, content: Value, retrieve_secrets_from: Option<&str>) -> AppResult<String>;

    async fn update_south(&self, id: &str, content: Value) -> AppResult<()>;

    async fn delete_south(&self, id: &str) -> AppResult<()>;

    async fn check_south_csv(&self, id: &str, csv: &str, delimiter: &str) -> AppResult<CsvCheck>;

    /// Returns the number of imported items
    async fn import_south_items(&self, id: &str, items: Vec<Value>, delete_items_not_present: bool) -> AppResult<usize>;

    async fn test_south_connection(&self, id: &str, settings: Value) -> AppResult<()>;

    /// Returns the connection test result
    async fn test_south_item(&self, id: &str, item_id: &str, content: Value) -> AppResult<Value>;
}

#[async_trait]
pub trait NorthService: Send + Sync {
    fn north_manifest(&self, connector_type: &str) -> AppResult<SettingsManifest>;

    async fn get_north(&self, id: &str) -> AppResult<Option<ConnectorRecord>>;

    async fn create_north(&self, content: Value, retrieve_secrets_from: Option<&str>) -> AppResult<String>;

    async fn update_north(&self, id: &str, content: Value) -> AppResult<()>;

    async fn delete_north(&self, id: &str) -> AppResult<()>;

    async fn test_north_connection(&self, id: &str, settings: Value) -> AppResult<()>;

    async fn execute_setpoint(&self, id: &str, content: Value) -> AppResult<()>;
}

#[async_trait]
pub trait HistoryQueryService: Send + Sync {
    async fn get_history_query(&self, id: &str) -> AppResult<Option<HistoryQueryRecord>>;

    async fn create_history_query(&self, content: Value, sources: SecretSources) -> AppResult<String>;

    async fn update_history_query(&self, id: &str, content: Value) -> AppResult<()>;

    async fn delete_history_query(&self, id: &str) -> AppResult<()>;

    async fn check_history_csv(&self, id: &str, csv: &str, delimiter: &str) -> AppResult<CsvCheck>;

    async fn import_history_items(&self, id: &str, items: Vec<Value>, delete_items_not_present: bool) -> AppResult<usize>;

    async fn test_history_north_connection(&self, id: &str, settings: Value) -> AppResult<()>;

    async fn test_history_south_connection(&self, id: &str, settings: Value) -> AppResult<()>;

    async fn test_history_south_item(&self, id: &str, item_id: &str, content: Value) -> AppResult<Value>;

    async fn update_history_query_status(&self, id: &str, status: HistoryQueryStatus) -> AppResult<()>;
}

/// Source of the outbound message payloads
#[async_trait]
pub trait ConfigSnapshotSource: Send + Sync {
    async fn snapshot(&self) -> AppResult<ConfigSnapshot>;

    async fn history_queries(&self) -> AppResult<Vec<HistoryQueryRecord>>;

    fn south_manifest_for(&self, connector_type: &str) -> AppResult<SettingsManifest>;

    fn north_manifest_for(&self, connector_type: &str) -> AppResult<SettingsManifest>;
}

/// Domain collaborators handed to the command handlers
#[derive(Clone)]
pub struct DomainServices {
    pub engine: Arc<dyn EngineService>,
    pub resources: Arc<dyn ConfigResourceService>,
    pub south: Arc<dyn SouthService>,
    pub north: Arc<dyn NorthService>,
    pub history: Arc<dyn HistoryQueryService>,
    pub snapshots: Arc<dyn ConfigSnapshotSource>,
}

impl DomainServices {
    /// Every collaborator served by one implementation
    pub fn from_shared<T>(service: Arc<T>) -> Self
    where
        T: EngineService
            + ConfigResourceService
            + SouthService
            + NorthService
            + HistoryQueryService
            + ConfigSnapshotSource
            + 'static,
    {
        Self {
            engine: service.clone(),
            resources: service.clone(),
            south: service.clone(),
            north: service.clone(),
            history: service.clone(),
            snapshots: service,
        }
    }
}
