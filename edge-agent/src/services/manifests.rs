//! Built-in settings manifests
//!
//! Only the secret-bearing shape of each connector type matters to the
//! agent; plain fields are listed for readability.

use super::secrets::{SettingField as F, SettingsManifest};
use std::collections::HashMap;

fn database(default_fields: &[&str]) -> SettingsManifest {
    let mut fields: Vec<F> = default_fields.iter().map(|k| F::plain(k)).collect();
    fields.push(F::plain("username"));
    fields.push(F::secret("password"));
    SettingsManifest::new(fields)
}

pub fn south_manifests() -> HashMap<String, SettingsManifest> {
    HashMap::from([
        (
            "mqtt".to_string(),
            SettingsManifest::new(vec![
                F::plain("url"),
                F::plain("qos"),
                F::authentication("authentication"),
                F::group("tls", vec![F::plain("certFilePath"), F::secret("keyPassphrase")]),
            ]),
        ),
        (
            "opcua".to_string(),
            SettingsManifest::new(vec![
                F::plain("url"),
                F::plain("securityMode"),
                F::group(
                    "authentication",
                    vec![F::plain("type"), F::plain("username"), F::secret("password")],
                ),
            ]),
        ),
        (
            "modbus".to_string(),
            SettingsManifest::new(vec![F::plain("host"), F::plain("port"), F::plain("slaveId")]),
        ),
        ("mssql".to_string(), database(&["host", "port", "database"])),
        ("postgresql".to_string(), database(&["host", "port", "database"])),
        (
            "folder-scanner".to_string(),
            SettingsManifest::new(vec![F::plain("inputFolder"), F::plain("compression")]),
        ),
        (
            "oianalytics".to_string(),
            SettingsManifest::new(vec![
                F::plain("useOiaModule"),
                F::group(
                    "specificSettings",
                    vec![F::plain("host"), F::authentication("authentication")],
                ),
            ]),
        ),
    ])
}

pub fn north_manifests() -> HashMap<String, SettingsManifest> {
    HashMap::from([
        ("console".to_string(), SettingsManifest::new(vec![F::plain("verbose")])),
        (
            "file-writer".to_string(),
            SettingsManifest::new(vec![F::plain("outputFolder"), F::plain("prefix")]),
        ),
        (
            "oianalytics".to_string(),
            SettingsManifest::new(vec![
                F::plain("useOiaModule"),
                F::group(
                    "specificSettings",
                    vec![
                        F::plain("host"),
                        F::authentication("authentication"),
                        F::plain("useProxy"),
                        F::secret("proxyPassword"),
                    ],
                ),
            ]),
        ),
        (
            "azure-blob".to_string(),
            SettingsManifest::new(vec![
                F::plain("account"),
                F::plain("container"),
                F::secret("sasToken"),
                F::secret("accessKey"),
            ]),
        ),
        (
            "rest-api".to_string(),
            SettingsManifest::new(vec![
                F::plain("host"),
                F::authentication("authentication"),
                F::array("headers", vec![F::plain("name"), F::secret("value")]),
            ]),
        ),
    ])
}
