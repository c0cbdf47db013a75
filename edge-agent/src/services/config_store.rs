//! Local configuration store
//!
//! JSON document holding the engine settings and every configuration record
//! the command handlers touch. Implements all domain traits so that the agent
//! runs standalone; file-backed in production, in memory in tests.
//!
//! Secrets are encrypted at rest with the local [`SecretCipher`]. Connection
//! and item tests need the connector runtime, which the agent does not embed,
//! so they fail with an explicit error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use shared::error::{AppError, AppResult, ErrorCode};
use shared::models::HistoryQueryStatus;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::crypto::SecretCipher;
use super::domain::{
    ConfigResourceService, ConfigSnapshot, ConfigSnapshotSource, ConnectorRecord, CsvCheck,
    CsvItemError, EngineService, EngineSettings, HistoryQueryRecord, HistoryQueryService,
    NorthService, ResourceKind, SecretSources, SouthService,
};
use super::manifests::{north_manifests, south_manifests};
use super::secrets::{SettingsManifest, map_secrets, merge_secrets};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigDocument {
    engine: EngineSettings,
    scan_modes: Vec<Value>,
    ip_filters: Vec<Value>,
    certificates: Vec<Value>,
    users: Vec<Value>,
    transformers: Vec<Value>,
    south_connectors: Vec<ConnectorRecord>,
    north_connectors: Vec<ConnectorRecord>,
    history_queries: Vec<HistoryQueryRecord>,
}

impl ConfigDocument {
    fn resources_mut(&mut self, kind: ResourceKind) -> &mut Vec<Value> {
        match kind {
            ResourceKind::ScanMode => &mut self.scan_modes,
            ResourceKind::IpFilter => &mut self.ip_filters,
            ResourceKind::Certificate => &mut self.certificates,
        }
    }

    fn south_mut(&mut self, id: &str) -> AppResult<&mut ConnectorRecord> {
        self.south_connectors
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| AppError::not_found(format!("South connector {id} not found")))
    }

    fn north_mut(&mut self, id: &str) -> AppResult<&mut ConnectorRecord> {
        self.north_connectors
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| AppError::not_found(format!("North connector {id} not found")))
    }

    fn history_mut(&mut self, id: &str) -> AppResult<&mut HistoryQueryRecord> {
        self.history_queries
            .iter_mut()
            .find(|h| h.id == id)
            .ok_or_else(|| AppError::not_found(format!("History query {id} not found")))
    }
}

/// JSON configuration store
pub struct ConfigStore {
    document: RwLock<ConfigDocument>,
    path: Option<PathBuf>,
    cipher: Arc<SecretCipher>,
    south_manifests: HashMap<String, SettingsManifest>,
    north_manifests: HashMap<String, SettingsManifest>,
}

impl ConfigStore {
    /// Store that lives only in memory
    pub fn in_memory(cipher: Arc<SecretCipher>) -> Self {
        Self {
            document: RwLock::new(ConfigDocument::default()),
            path: None,
            cipher,
            south_manifests: south_manifests(),
            north_manifests: north_manifests(),
        }
    }

    /// Load the document at `path`, creating it when missing
    pub async fn open(path: impl Into<PathBuf>, cipher: Arc<SecretCipher>) -> AppResult<Self> {
        let path = path.into();
        let document = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                AppError::with_message(ErrorCode::ConfigError, format!("Invalid configuration file: {e}"))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Creating configuration file");
                ConfigDocument::default()
            }
            Err(e) => {
                return Err(AppError::with_message(
                    ErrorCode::IoError,
                    format!("Failed to read configuration file: {e}"),
                ));
            }
        };

        let store = Self {
            document: RwLock::new(document.clone()),
            path: Some(path),
            cipher,
            south_manifests: south_manifests(),
            north_manifests: north_manifests(),
        };
        store.persist(&document).await?;
        Ok(store)
    }

    async fn persist(&self, document: &ConfigDocument) -> AppResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|e| AppError::internal(format!("Failed to serialize configuration: {e}")))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_error)?;
        Ok(())
    }

    /// Apply `change` to a draft, persist it, then publish it
    async fn mutate<T, F>(&self, change: F) -> AppResult<T>
    where
        F: FnOnce(&mut ConfigDocument) -> AppResult<T>,
    {
        let mut document = self.document.write().await;
        let mut draft = document.clone();
        let out = change(&mut draft)?;
        self.persist(&draft).await?;
        *document = draft;
        Ok(out)
    }

    fn encrypt_settings(&self, manifest: &SettingsManifest, settings: &mut Value) -> AppResult<()> {
        map_secrets(manifest, settings, |plain| {
            self.cipher.encrypt_string(plain).map_err(AppError::from)
        })
    }

    fn manifest<'a>(
        manifests: &'a HashMap<String, SettingsManifest>,
        side: &str,
        connector_type: &str,
    ) -> AppResult<&'a SettingsManifest> {
        manifests.get(connector_type).ok_or_else(|| {
            AppError::with_message(
                ErrorCode::InvalidRequest,
                format!("{side} connector type {connector_type} is not supported"),
            )
        })
    }

    /// Build a connector from command content, secrets encrypted
    fn connector_from_content(
        &self,
        manifests: &HashMap<String, SettingsManifest>,
        side: &str,
        id: String,
        content: &Value,
        existing: Option<&ConnectorRecord>,
    ) -> AppResult<ConnectorRecord> {
        let name = required_str(content, "name")?;
        let connector_type = match content.get("type").and_then(Value::as_str) {
            Some(t) => t.to_string(),
            None => existing
                .map(|c| c.connector_type.clone())
                .ok_or_else(|| AppError::validation("type is required"))?,
        };
        let manifest = Self::manifest(manifests, side, &connector_type)?;
        let mut settings = content.get("settings").cloned().unwrap_or_else(|| json!({}));
        self.encrypt_settings(manifest, &mut settings)?;
        if let Some(existing) = existing {
            merge_secrets(manifest, &mut settings, &existing.settings);
        }
        let items = match content.get("items").and_then(Value::as_array) {
            Some(items) => items.clone(),
            None => existing.map(|c| c.items.clone()).unwrap_or_default(),
        };
        Ok(ConnectorRecord {
            id,
            name,
            connector_type,
            enabled: content.get("enabled").and_then(Value::as_bool).unwrap_or(true),
            settings,
            items,
        })
    }

    fn runtime_unavailable(what: String) -> AppError {
        AppError::with_message(
            ErrorCode::CommandFailed,
            format!("{what} requires the connector runtime, which is not available"),
        )
    }
}

fn io_error(e: std::io::Error) -> AppError {
    AppError::with_message(ErrorCode::IoError, format!("Failed to write configuration file: {e}"))
}

fn required_str(content: &Value, key: &str) -> AppResult<String> {
    content
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::validation(format!("{key} is required")))
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn with_id(content: Value, id: &str) -> AppResult<Value> {
    match content {
        Value::Object(mut map) => {
            map.insert("id".to_string(), Value::String(id.to_string()));
            Ok(Value::Object(map))
        }
        _ => Err(AppError::validation("content must be a JSON object")),
    }
}

fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

// ========== CSV ==========

/// One CSV record with the line it starts on
struct CsvRow {
    line: u64,
    values: HashMap<String, String>,
}

/// Parse RFC 4180 CSV into column → value maps. A `name` column is required.
fn parse_csv(csv: &str, delimiter: &str) -> AppResult<Vec<CsvRow>> {
    let &[delimiter] = delimiter.as_bytes() else {
        return Err(AppError::validation("delimiter must be a single-byte character"));
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(false)
        .trim(csv::Trim::All)
        .from_reader(csv.as_bytes());

    let header: Vec<String> = reader
        .headers()
        .map_err(|e| AppError::validation(format!("Invalid CSV: {e}")))?
        .iter()
        .map(str::to_string)
        .collect();
    if header.is_empty() {
        return Err(AppError::validation("CSV content is empty"));
    }
    if !header.iter().any(|h| h == "name") {
        return Err(AppError::validation("CSV must have a name column"));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| AppError::validation(format!("Invalid CSV: {e}")))?;
        rows.push(CsvRow {
            line: record.position().map_or(0, |p| p.line()),
            values: header.iter().cloned().zip(record.iter().map(str::to_string)).collect(),
        });
    }
    Ok(rows)
}

/// Turn CSV rows into items: `settings_x` columns become `settings.x`
fn check_csv_rows(rows: Vec<CsvRow>) -> CsvCheck {
    let mut check = CsvCheck::default();
    let mut seen = HashSet::new();
    for CsvRow { line, values: row } in rows {
        let name = row.get("name").cloned().unwrap_or_default();
        if name.is_empty() {
            check.errors.push(CsvItemError {
                name: format!("line {line}"),
                error: "Item name is required".to_string(),
            });
            continue;
        }
        if !seen.insert(name.clone()) {
            check.errors.push(CsvItemError {
                name,
                error: "Item name already used in CSV".to_string(),
            });
            continue;
        }
        let mut settings = Map::new();
        let mut item = Map::new();
        for (column, value) in row {
            if let Some(key) = column.strip_prefix("settings_") {
                settings.insert(key.to_string(), Value::String(value));
            } else if column == "enabled" {
                item.insert(column, Value::Bool(value != "false"));
            } else {
                item.insert(column, Value::String(value));
            }
        }
        item.entry("enabled").or_insert(Value::Bool(true));
        item.insert("settings".to_string(), Value::Object(settings));
        check.items.push(Value::Object(item));
    }
    check
}

/// Merge imported items by name into `target`
fn import_items(target: &mut Vec<Value>, items: Vec<Value>, delete_items_not_present: bool) -> usize {
    let names: HashSet<String> = items
        .iter()
        .filter_map(|i| i.get("name").and_then(Value::as_str).map(str::to_string))
        .collect();
    if delete_items_not_present {
        target.retain(|existing| {
            existing
                .get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| names.contains(n))
        });
    }
    let count = items.len();
    for item in items {
        let name = item.get("name").and_then(Value::as_str).map(str::to_string);
        let position = target
            .iter()
            .position(|e| e.get("name").and_then(Value::as_str) == name.as_deref());
        match position {
            Some(index) => {
                let id = record_id(&target[index]).unwrap_or_default().to_string();
                if let Ok(item) = with_id(item, &id) {
                    target[index] = item;
                }
            }
            None => {
                if let Ok(item) = with_id(item, &new_id()) {
                    target.push(item);
                }
            }
        }
    }
    count
}

// ========== Domain traits ==========

#[async_trait]
impl EngineService for ConfigStore {
    async fn engine_settings(&self) -> AppResult<EngineSettings> {
        Ok(self.document.read().await.engine.clone())
    }

    async fn update_engine_settings(&self, content: Value) -> AppResult<()> {
        if !content.is_object() {
            return Err(AppError::validation("content must be a JSON object"));
        }
        self.mutate(|doc| {
            if let Some(name) = content.get("name").and_then(Value::as_str) {
                doc.engine.name = name.to_string();
            }
            doc.engine.settings = content;
            Ok(())
        })
        .await
    }

    async fn update_version(&self, version: &str, launcher_version: &str) -> AppResult<()> {
        self.mutate(|doc| {
            doc.engine.version = version.to_string();
            doc.engine.launcher_version = launcher_version.to_string();
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ConfigResourceService for ConfigStore {
    async fn create_resource(&self, kind: ResourceKind, content: Value) -> AppResult<String> {
        let id = new_id();
        let record = with_id(content, &id)?;
        self.mutate(|doc| {
            doc.resources_mut(kind).push(record);
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn update_resource(&self, kind: ResourceKind, id: &str, content: Value) -> AppResult<()> {
        let record = with_id(content, id)?;
        self.mutate(|doc| {
            let slot = doc
                .resources_mut(kind)
                .iter_mut()
                .find(|r| record_id(r) == Some(id))
                .ok_or_else(|| AppError::not_found(format!("{} {id} not found", kind.label())))?;
            *slot = record;
            Ok(())
        })
        .await
    }

    async fn delete_resource(&self, kind: ResourceKind, id: &str) -> AppResult<()> {
        self.mutate(|doc| {
            let records = doc.resources_mut(kind);
            let before = records.len();
            records.retain(|r| record_id(r) != Some(id));
            if records.len() == before {
                return Err(AppError::not_found(format!("{} {id} not found", kind.label())));
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SouthService for ConfigStore {
    fn south_manifest(&self, connector_type: &str) -> AppResult<SettingsManifest> {
        Self::manifest(&self.south_manifests, "South", connector_type).cloned()
    }

    async fn get_south(&self, id: &str) -> AppResult<Option<ConnectorRecord>> {
        let doc = self.document.read().await;
        Ok(doc.south_connectors.iter().find(|c| c.id == id).cloned())
    }

    async fn create_south(&self, content: Value, retrieve_secrets_from: Option<&str>) -> AppResult<String> {
        let source = match retrieve_secrets_from {
            Some(source_id) => Some(
                self.get_south(source_id)
                    .await?
                    .ok_or_else(|| AppError::not_found(format!("South connector {source_id} not found")))?,
            ),
            None => None,
        };
        let id = new_id();
        let mut record =
            self.connector_from_content(&self.south_manifests, "South", id.clone(), &content, None)?;
        if let Some(source) = source {
            let manifest = Self::manifest(&self.south_manifests, "South", &record.connector_type)?;
            merge_secrets(manifest, &mut record.settings, &source.settings);
        }
        self.mutate(|doc| {
            doc.south_connectors.push(record);
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn update_south(&self, id: &str, content: Value) -> AppResult<()> {
        let existing = self
            .get_south(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("South connector {id} not found")))?;
        let record = self.connector_from_content(
            &self.south_manifests,
            "South",
            id.to_string(),
            &content,
            Some(&existing),
        )?;
        self.mutate(|doc| {
            *doc.south_mut(id)? = record;
            Ok(())
        })
        .await
    }

    async fn delete_south(&self, id: &str) -> AppResult<()> {
        self.mutate(|doc| {
            doc.south_mut(id)?;
            doc.south_connectors.retain(|c| c.id != id);
            Ok(())
        })
        .await
    }

    async fn check_south_csv(&self, id: &str, csv: &str, delimiter: &str) -> AppResult<CsvCheck> {
        if self.get_south(id).await?.is_none() {
            return Err(AppError::not_found(format!("South connector {id} not found")));
        }
        Ok(check_csv_rows(parse_csv(csv, delimiter)?))
    }

    async fn import_south_items(&self, id: &str, items: Vec<Value>, delete_items_not_present: bool) -> AppResult<usize> {
        self.mutate(|doc| {
            let south = doc.south_mut(id)?;
            Ok(import_items(&mut south.items, items, delete_items_not_present))
        })
        .await
    }

    async fn test_south_connection(&self, id: &str, _settings: Value) -> AppResult<()> {
        if self.get_south(id).await?.is_none() {
            return Err(AppError::not_found(format!("South connector {id} not found")));
        }
        Err(Self::runtime_unavailable(format!("Testing South connector {id}")))
    }

    async fn test_south_item(&self, id: &str, item_id: &str, _content: Value) -> AppResult<Value> {
        if self.get_south(id).await?.is_none() {
            return Err(AppError::not_found(format!("South connector {id} not found")));
        }
        Err(Self::runtime_unavailable(format!("Testing item {item_id} of South connector {id}")))
    }
}

#[async_trait]
impl NorthService for ConfigStore {
    fn north_manifest(&self, connector_type: &str) -> AppResult<SettingsManifest> {
        Self::manifest(&self.north_manifests, "North", connector_type).cloned()
    }

    async fn get_north(&self, id: &str) -> AppResult<Option<ConnectorRecord>> {
        let doc = self.document.read().await;
        Ok(doc.north_connectors.iter().find(|c| c.id == id).cloned())
    }

    async fn create_north(&self, content: Value, retrieve_secrets_from: Option<&str>) -> AppResult<String> {
        let source = match retrieve_secrets_from {
            Some(source_id) => Some(
                self.get_north(source_id)
                    .await?
                    .ok_or_else(|| AppError::not_found(format!("North connector {source_id} not found")))?,
            ),
            None => None,
        };
        let id = new_id();
        let mut record =
            self.connector_from_content(&self.north_manifests, "North", id.clone(), &content, None)?;
        if let Some(source) = source {
            let manifest = Self::manifest(&self.north_manifests, "North", &record.connector_type)?;
            merge_secrets(manifest, &mut record.settings, &source.settings);
        }
        self.mutate(|doc| {
            doc.north_connectors.push(record);
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn update_north(&self, id: &str, content: Value) -> AppResult<()> {
        let existing = self
            .get_north(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("North connector {id} not found")))?;
        let record = self.connector_from_content(
            &self.north_manifests,
            "North",
            id.to_string(),
            &content,
            Some(&existing),
        )?;
        self.mutate(|doc| {
            *doc.north_mut(id)? = record;
            Ok(())
        })
        .await
    }

    async fn delete_north(&self, id: &str) -> AppResult<()> {
        self.mutate(|doc| {
            doc.north_mut(id)?;
            doc.north_connectors.retain(|c| c.id != id);
            Ok(())
        })
        .await
    }

    async fn test_north_connection(&self, id: &str, _settings: Value) -> AppResult<()> {
        if self.get_north(id).await?.is_none() {
            return Err(AppError::not_found(format!("North connector {id} not found")));
        }
        Err(Self::runtime_unavailable(format!("Testing North connector {id}")))
    }

    async fn execute_setpoint(&self, id: &str, _content: Value) -> AppResult<()> {
        if self.get_north(id).await?.is_none() {
            return Err(AppError::not_found(format!("North connector {id} not found")));
        }
        Err(Self::runtime_unavailable(format!("Sending a setpoint to North connector {id}")))
    }
}

impl ConfigStore {
    fn history_from_content(
        &self,
        id: String,
        content: &Value,
        existing: Option<&HistoryQueryRecord>,
    ) -> AppResult<HistoryQueryRecord> {
        let name = required_str(content, "name")?;
        let south_type = match content.get("southType").and_then(Value::as_str) {
            Some(t) => t.to_string(),
            None => existing
                .map(|h| h.south_type.clone())
                .ok_or_else(|| AppError::validation("southType is required"))?,
        };
        let north_type = match content.get("northType").and_then(Value::as_str) {
            Some(t) => t.to_string(),
            None => existing
                .map(|h| h.north_type.clone())
                .ok_or_else(|| AppError::validation("northType is required"))?,
        };
        let south_manifest = Self::manifest(&self.south_manifests, "South", &south_type)?;
        let north_manifest = Self::manifest(&self.north_manifests, "North", &north_type)?;

        let mut south_settings = content.get("southSettings").cloned().unwrap_or_else(|| json!({}));
        let mut north_settings = content.get("northSettings").cloned().unwrap_or_else(|| json!({}));
        self.encrypt_settings(south_manifest, &mut south_settings)?;
        self.encrypt_settings(north_manifest, &mut north_settings)?;
        if let Some(existing) = existing {
            merge_secrets(south_manifest, &mut south_settings, &existing.south_settings);
            merge_secrets(north_manifest, &mut north_settings, &existing.north_settings);
        }

        let status = match content.get("status") {
            Some(status) => serde_json::from_value(status.clone())
                .map_err(|e| AppError::validation(format!("Invalid history query status: {e}")))?,
            None => existing.map(|h| h.status).unwrap_or(HistoryQueryStatus::Pending),
        };
        let items = match content.get("items").and_then(Value::as_array) {
            Some(items) => items.clone(),
            None => existing.map(|h| h.items.clone()).unwrap_or_default(),
        };
        Ok(HistoryQueryRecord {
            id,
            name,
            status,
            south_type,
            north_type,
            south_settings,
            north_settings,
            items,
        })
    }
}

#[async_trait]
impl HistoryQueryService for ConfigStore {
    async fn get_history_query(&self, id: &str) -> AppResult<Option<HistoryQueryRecord>> {
        let doc = self.document.read().await;
        Ok(doc.history_queries.iter().find(|h| h.id == id).cloned())
    }

    async fn create_history_query(&self, content: Value, sources: SecretSources) -> AppResult<String> {
        let id = new_id();
        let mut record = self.history_from_content(id.clone(), &content, None)?;
        let south_manifest = Self::manifest(&self.south_manifests, "South", &record.south_type)?;
        let north_manifest = Self::manifest(&self.north_manifests, "North", &record.north_type)?;

        if let Some(source_id) = sources.history_query.as_deref() {
            let source = self
                .get_history_query(source_id)
                .await?
                .ok_or_else(|| AppError::not_found(format!("History query {source_id} not found")))?;
            merge_secrets(south_manifest, &mut record.south_settings, &source.south_settings);
            merge_secrets(north_manifest, &mut record.north_settings, &source.north_settings);
        }
        if let Some(source_id) = sources.south.as_deref() {
            let source = self
                .get_south(source_id)
                .await?
                .ok_or_else(|| AppError::not_found(format!("South connector {source_id} not found")))?;
            merge_secrets(south_manifest, &mut record.south_settings, &source.settings);
        }
        if let Some(source_id) = sources.north.as_deref() {
            let source = self
                .get_north(source_id)
                .await?
                .ok_or_else(|| AppError::not_found(format!("North connector {source_id} not found")))?;
            merge_secrets(north_manifest, &mut record.north_settings, &source.settings);
        }

        self.mutate(|doc| {
            doc.history_queries.push(record);
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn update_history_query(&self, id: &str, content: Value) -> AppResult<()> {
        let existing = self
            .get_history_query(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("History query {id} not found")))?;
        let record = self.history_from_content(id.to_string(), &content, Some(&existing))?;
        self.mutate(|doc| {
            *doc.history_mut(id)? = record;
            Ok(())
        })
        .await
    }

    async fn delete_history_query(&self, id: &str) -> AppResult<()> {
        self.mutate(|doc| {
            doc.history_mut(id)?;
            doc.history_queries.retain(|h| h.id != id);
            Ok(())
        })
        .await
    }

    async fn check_history_csv(&self, id: &str, csv: &str, delimiter: &str) -> AppResult<CsvCheck> {
        if self.get_history_query(id).await?.is_none() {
            return Err(AppError::not_found(format!("History query {id} not found")));
        }
        Ok(check_csv_rows(parse_csv(csv, delimiter)?))
    }

    async fn import_history_items(&self, id: &str, items: Vec<Value>, delete_items_not_present: bool) -> AppResult<usize> {
        self.mutate(|doc| {
            let history = doc.history_mut(id)?;
            Ok(import_items(&mut history.items, items, delete_items_not_present))
        })
        .await
    }

    async fn test_history_north_connection(&self, id: &str, _settings: Value) -> AppResult<()> {
        if self.get_history_query(id).await?.is_none() {
            return Err(AppError::not_found(format!("History query {id} not found")));
        }
        Err(Self::runtime_unavailable(format!("Testing the North connection of History query {id}")))
    }

    async fn test_history_south_connection(&self, id: &str, _settings: Value) -> AppResult<()> {
        if self.get_history_query(id).await?.is_none() {
            return Err(AppError::not_found(format!("History query {id} not found")));
        }
        Err(Self::runtime_unavailable(format!("Testing the South connection of History query {id}")))
    }

    async fn test_history_south_item(&self, id: &str, item_id: &str, _content: Value) -> AppResult<Value> {
        if self.get_history_query(id).await?.is_none() {
            return Err(AppError::not_found(format!("History query {id} not found")));
        }
        Err(Self::runtime_unavailable(format!("Testing item {item_id} of History query {id}")))
    }

    async fn update_history_query_status(&self, id: &str, status: HistoryQueryStatus) -> AppResult<()> {
        self.mutate(|doc| {
            doc.history_mut(id)?.status = status;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ConfigSnapshotSource for ConfigStore {
    async fn snapshot(&self) -> AppResult<ConfigSnapshot> {
        let doc = self.document.read().await;
        Ok(ConfigSnapshot {
            engine: doc.engine.clone(),
            scan_modes: doc.scan_modes.clone(),
            ip_filters: doc.ip_filters.clone(),
            certificates: doc.certificates.clone(),
            users: doc.users.clone(),
            transformers: doc.transformers.clone(),
            south_connectors: doc.south_connectors.clone(),
            north_connectors: doc.north_connectors.clone(),
        })
    }

    async fn history_queries(&self) -> AppResult<Vec<HistoryQueryRecord>> {
        Ok(self.document.read().await.history_queries.clone())
    }

    fn south_manifest_for(&self, connector_type: &str) -> AppResult<SettingsManifest> {
        self.south_manifest(connector_type)
    }

    fn north_manifest_for(&self, connector_type: &str) -> AppResult<SettingsManifest> {
        self.north_manifest(connector_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConfigStore {
        ConfigStore::in_memory(Arc::new(SecretCipher::random()))
    }

    fn mqtt(name: &str, password: &str) -> Value {
        json!({
            "name": name,
            "type": "mqtt",
            "settings": {
                "url": "mqtt://broker:1883",
                "authentication": { "type": "basic", "username": "user", "password": password }
            }
        })
    }

    #[tokio::test]
    async fn test_resource_crud() {
        let store = store();
        let id = store
            .create_resource(ResourceKind::ScanMode, json!({ "name": "every second", "cron": "* * * * * *" }))
            .await
            .unwrap();
        store
            .update_resource(ResourceKind::ScanMode, &id, json!({ "name": "every minute", "cron": "0 * * * * *" }))
            .await
            .unwrap();
        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.scan_modes.len(), 1);
        assert_eq!(snapshot.scan_modes[0]["name"], "every minute");
        assert_eq!(snapshot.scan_modes[0]["id"], id.as_str());

        store.delete_resource(ResourceKind::ScanMode, &id).await.unwrap();
        let err = store.delete_resource(ResourceKind::ScanMode, &id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.message, format!("Scan mode {id} not found"));
    }

    #[tokio::test]
    async fn test_south_secrets_encrypted_at_rest() {
        let store = store();
        let id = store.create_south(mqtt("broker", "secret"), None).await.unwrap();
        let south = store.get_south(&id).await.unwrap().unwrap();
        let stored = south.settings["authentication"]["password"].as_str().unwrap();
        assert_ne!(stored, "secret");
        assert_eq!(store.cipher.decrypt_string(stored).unwrap(), "secret");
    }

    #[tokio::test]
    async fn test_update_with_blank_secret_keeps_stored() {
        let store = store();
        let id = store.create_south(mqtt("broker", "secret"), None).await.unwrap();
        let before = store.get_south(&id).await.unwrap().unwrap();

        store.update_south(&id, mqtt("renamed", "")).await.unwrap();
        let after = store.get_south(&id).await.unwrap().unwrap();
        assert_eq!(after.name, "renamed");
        assert_eq!(
            after.settings["authentication"]["password"],
            before.settings["authentication"]["password"]
        );
    }

    #[tokio::test]
    async fn test_create_retrieves_secrets_from_source() {
        let store = store();
        let source = store.create_south(mqtt("source", "secret"), None).await.unwrap();
        let copy = store.create_south(mqtt("copy", ""), Some(&source)).await.unwrap();
        let copy = store.get_south(&copy).await.unwrap().unwrap();
        let stored = copy.settings["authentication"]["password"].as_str().unwrap();
        assert_eq!(store.cipher.decrypt_string(stored).unwrap(), "secret");

        let err = store.create_south(mqtt("x", ""), Some("missing")).await.unwrap_err();
        assert_eq!(err.message, "South connector missing not found");
    }

    #[tokio::test]
    async fn test_unknown_connector_type() {
        let store = store();
        let err = store
            .create_north(json!({ "name": "n", "type": "carrier-pigeon" }), None)
            .await
            .unwrap_err();
        assert_eq!(err.message, "North connector type carrier-pigeon is not supported");
    }

    #[tokio::test]
    async fn test_csv_check_and_import() {
        let store = store();
        let id = store.create_south(mqtt("broker", "secret"), None).await.unwrap();
        let csv = "name;enabled;settings_topic\nitem1;true;a/b\n;true;c\nitem1;false;d\nitem2;false;e/f";
        let check = store.check_south_csv(&id, csv, ";").await.unwrap();
        assert_eq!(check.items.len(), 2);
        assert_eq!(check.errors.len(), 2);
        assert_eq!(check.errors[1].error, "Item name already used in CSV");
        assert_eq!(check.items[1]["settings"]["topic"], "e/f");
        assert_eq!(check.items[1]["enabled"], false);

        assert_eq!(store.import_south_items(&id, check.items, false).await.unwrap(), 2);
        let replace = vec![json!({ "name": "item2", "enabled": true, "settings": {} })];
        store.import_south_items(&id, replace, true).await.unwrap();
        let south = store.get_south(&id).await.unwrap().unwrap();
        assert_eq!(south.items.len(), 1);
        assert_eq!(south.items[0]["name"], "item2");
    }

    #[tokio::test]
    async fn test_csv_requires_name_column() {
        let store = store();
        let id = store.create_south(mqtt("broker", "secret"), None).await.unwrap();
        let err = store.check_south_csv(&id, "label,topic\na,b", ",").await.unwrap_err();
        assert_eq!(err.message, "CSV must have a name column");
    }

    #[tokio::test]
    async fn test_csv_quoted_fields() {
        let store = store();
        let id = store.create_south(mqtt("broker", "secret"), None).await.unwrap();
        let csv = "name;settings_query;settings_topic\nitem1;\"SELECT a; SELECT b\";t/1\n\"item2\";\"SELECT c\nFROM d\";t/2\n;x;y";
        let check = store.check_south_csv(&id, csv, ";").await.unwrap();

        assert_eq!(check.items.len(), 2);
        assert_eq!(check.items[0]["settings"]["query"], "SELECT a; SELECT b");
        assert_eq!(check.items[0]["settings"]["topic"], "t/1");
        assert_eq!(check.items[1]["name"], "item2");
        assert_eq!(check.items[1]["settings"]["query"], "SELECT c\nFROM d");
        // line numbers follow the quoted newline
        assert_eq!(check.errors[0].name, "line 5");
    }

    #[tokio::test]
    async fn test_csv_rejects_bad_delimiter_and_ragged_rows() {
        let store = store();
        let id = store.create_south(mqtt("broker", "secret"), None).await.unwrap();

        let err = store.check_south_csv(&id, "name\ntemp", "").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
        let err = store.check_south_csv(&id, "name§topic\ntemp§a", "§").await.unwrap_err();
        assert_eq!(err.message, "delimiter must be a single-byte character");

        let err = store.check_south_csv(&id, "name;settings_topic\ntemp;a/b;extra", ";").await.unwrap_err();
        assert!(err.message.starts_with("Invalid CSV: "));
    }

    #[tokio::test]
    async fn test_connection_tests_need_runtime() {
        let store = store();
        let id = store.create_south(mqtt("broker", "secret"), None).await.unwrap();
        let err = store.test_south_connection(&id, json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandFailed);
        let err = store.test_south_connection("missing", json!({})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_history_query_status() {
        let store = store();
        let id = store
            .create_history_query(
                json!({ "name": "backfill", "southType": "mssql", "northType": "console" }),
                SecretSources::default(),
            )
            .await
            .unwrap();
        store.update_history_query_status(&id, HistoryQueryStatus::Running).await.unwrap();
        let history = store.get_history_query(&id).await.unwrap().unwrap();
        assert_eq!(history.status, HistoryQueryStatus::Running);
    }

    #[tokio::test]
    async fn test_file_backed_store_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oibus.json");
        let cipher = Arc::new(SecretCipher::random());
        {
            let store = ConfigStore::open(&path, cipher.clone()).await.unwrap();
            store.update_version("3.4.0", "3.4.1").await.unwrap();
        }
        let store = ConfigStore::open(&path, cipher).await.unwrap();
        let engine = store.engine_settings().await.unwrap();
        assert_eq!(engine.version, "3.4.0");
        assert_eq!(engine.launcher_version, "3.4.1");
    }
}
