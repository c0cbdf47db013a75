//! Outbound message payloads
//!
//! Built from a configuration snapshot; every secret named by the settings
//! manifests is blanked before leaving the agent.

use serde_json::Value;
use shared::cloud::{
    ConnectorPayload, EnginePayload, FullConfigPayload, HistoryQueryPayload, ResourcePayload,
};
use shared::error::AppResult;

use crate::services::domain::{ConfigSnapshot, ConfigSnapshotSource, ConnectorRecord, HistoryQueryRecord};
use crate::services::secrets::{SettingsManifest, filter_secrets};

/// Record fields never sent upstream, per resource
const USER_SECRETS: &[&str] = &["password"];
const CERTIFICATE_SECRETS: &[&str] = &["privateKey"];

fn resource(record: &Value, secrets: &[&str]) -> ResourcePayload {
    let text = |key: &str| {
        record
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let mut settings = record.clone();
    if let Some(map) = settings.as_object_mut() {
        map.remove("id");
        map.remove("name");
        for key in secrets {
            if map.contains_key(*key) {
                map.insert((*key).to_string(), Value::String(String::new()));
            }
        }
    }
    ResourcePayload {
        oibus_internal_id: text("id"),
        name: text("name"),
        settings,
    }
}

fn connector(record: &ConnectorRecord, manifest: &SettingsManifest) -> ConnectorPayload {
    ConnectorPayload {
        oibus_internal_id: record.id.clone(),
        connector_type: record.connector_type.clone(),
        name: record.name.clone(),
        settings: filter_secrets(manifest, &record.settings),
    }
}

/// `full-config` payload
pub fn full_config(
    snapshot: &ConfigSnapshot,
    manifests: &dyn ConfigSnapshotSource,
    public_key: Option<String>,
) -> AppResult<FullConfigPayload> {
    let engine = &snapshot.engine;
    let resources = |records: &[Value], secrets: &[&str]| -> Vec<ResourcePayload> {
        records.iter().map(|r| resource(r, secrets)).collect()
    };

    let south_connectors = snapshot
        .south_connectors
        .iter()
        .map(|s| Ok(connector(s, &manifests.south_manifest_for(&s.connector_type)?)))
        .collect::<AppResult<Vec<_>>>()?;
    let north_connectors = snapshot
        .north_connectors
        .iter()
        .map(|n| Ok(connector(n, &manifests.north_manifest_for(&n.connector_type)?)))
        .collect::<AppResult<Vec<_>>>()?;

    Ok(FullConfigPayload {
        engine: EnginePayload {
            oibus_internal_id: engine.id.clone(),
            name: engine.name.clone(),
            software_version: engine.version.clone(),
            launcher_version: engine.launcher_version.clone(),
            architecture: std::env::consts::ARCH.to_string(),
            operating_system: std::env::consts::OS.to_string(),
            public_key,
            settings: engine.settings.clone(),
        },
        scan_modes: resources(&snapshot.scan_modes, &[]),
        ip_filters: resources(&snapshot.ip_filters, &[]),
        certificates: resources(&snapshot.certificates, CERTIFICATE_SECRETS),
        users: resources(&snapshot.users, USER_SECRETS),
        transformers: resources(&snapshot.transformers, &[]),
        south_connectors,
        north_connectors,
    })
}

/// `history-queries` payload
pub fn history_queries(
    queries: &[HistoryQueryRecord],
    manifests: &dyn ConfigSnapshotSource,
) -> AppResult<Vec<HistoryQueryPayload>> {
    queries
        .iter()
        .map(|h| {
            let south = manifests.south_manifest_for(&h.south_type)?;
            let north = manifests.north_manifest_for(&h.north_type)?;
            Ok(HistoryQueryPayload {
                oibus_internal_id: h.id.clone(),
                name: h.name.clone(),
                status: h.status,
                south_type: h.south_type.clone(),
                north_type: h.north_type.clone(),
                south_settings: filter_secrets(&south, &h.south_settings),
                north_settings: filter_secrets(&north, &h.north_settings),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::config_store::ConfigStore;
    use crate::services::crypto::SecretCipher;
    use crate::services::domain::{
        ConfigResourceService, HistoryQueryService, ResourceKind, SecretSources, SouthService,
    };
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_full_config_blanks_secrets() {
        let store = ConfigStore::in_memory(Arc::new(SecretCipher::random()));
        store
            .create_resource(ResourceKind::Certificate, json!({ "name": "ca", "publicKey": "pub", "privateKey": "priv" }))
            .await
            .unwrap();
        store
            .create_south(
                json!({
                    "name": "broker",
                    "type": "mqtt",
                    "settings": { "url": "mqtt://b", "authentication": { "type": "basic", "username": "u", "password": "p" } }
                }),
                None,
            )
            .await
            .unwrap();

        let snapshot = store.snapshot().await.unwrap();
        let payload = full_config(&snapshot, &store, Some("PEM".to_string())).unwrap();

        assert_eq!(payload.engine.public_key.as_deref(), Some("PEM"));
        assert_eq!(payload.certificates[0].name, "ca");
        assert_eq!(payload.certificates[0].settings["privateKey"], "");
        assert_eq!(payload.certificates[0].settings["publicKey"], "pub");
        let south = &payload.south_connectors[0];
        assert_eq!(south.settings["authentication"]["password"], "");
        assert_eq!(south.settings["authentication"]["username"], "u");
        assert_eq!(south.settings["url"], "mqtt://b");
    }

    #[tokio::test]
    async fn test_history_queries_blank_both_sides() {
        let store = ConfigStore::in_memory(Arc::new(SecretCipher::random()));
        store
            .create_history_query(
                json!({
                    "name": "backfill",
                    "southType": "mssql",
                    "northType": "azure-blob",
                    "southSettings": { "host": "db", "password": "p" },
                    "northSettings": { "account": "acc", "sasToken": "sas" }
                }),
                SecretSources::default(),
            )
            .await
            .unwrap();

        let queries = store.history_queries().await.unwrap();
        let payload = history_queries(&queries, &store).unwrap();
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0].south_settings["password"], "");
        assert_eq!(payload[0].south_settings["host"], "db");
        assert_eq!(payload[0].north_settings["sasToken"], "");
        assert_eq!(payload[0].north_settings["account"], "acc");
    }
}
