//! Manifest-driven secret handling
//!
//! Connector and history-query settings are free-form JSON described by a
//! manifest. The manifest says which fields hold secrets:
//!
//! - outbound payloads blank every secret to `""`
//! - inbound command content carries RSA-encrypted secrets, decrypted just
//!   before the handler uses them
//! - an empty secret in a create/update can be filled from an existing record

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of one settings field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SettingKind {
    Plain,
    Secret,
    /// `{type, username, password, token, key, secret}`; the secret slot
    /// depends on `type`
    Authentication,
    /// List of objects described by `fields`
    Array { fields: Vec<SettingField> },
    /// Nested object described by `fields`
    Group { fields: Vec<SettingField> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingField {
    pub key: String,
    #[serde(flatten)]
    pub kind: SettingKind,
}

impl SettingField {
    pub fn plain(key: &str) -> Self {
        Self { key: key.into(), kind: SettingKind::Plain }
    }

    pub fn secret(key: &str) -> Self {
        Self { key: key.into(), kind: SettingKind::Secret }
    }

    pub fn authentication(key: &str) -> Self {
        Self { key: key.into(), kind: SettingKind::Authentication }
    }

    pub fn array(key: &str, fields: Vec<SettingField>) -> Self {
        Self { key: key.into(), kind: SettingKind::Array { fields } }
    }

    pub fn group(key: &str, fields: Vec<SettingField>) -> Self {
        Self { key: key.into(), kind: SettingKind::Group { fields } }
    }
}

/// Settings manifest of one connector type
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SettingsManifest {
    pub fields: Vec<SettingField>,
}

impl SettingsManifest {
    pub fn new(fields: Vec<SettingField>) -> Self {
        Self { fields }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PathSeg {
    Key(String),
    Index(usize),
}

fn authentication_slot(auth: &Value) -> Option<&'static str> {
    match auth.get("type").and_then(Value::as_str)? {
        "api-key" => Some("secret"),
        "bearer" => Some("token"),
        "basic" => Some("password"),
        _ => None,
    }
}

fn visit<E, F>(
    fields: &[SettingField],
    value: &mut Value,
    path: &mut Vec<PathSeg>,
    f: &mut F,
) -> Result<(), E>
where
    F: FnMut(&[PathSeg], &mut Value) -> Result<(), E>,
{
    let Some(object) = value.as_object_mut() else {
        return Ok(());
    };
    for field in fields {
        let Some(child) = object.get_mut(&field.key) else {
            continue;
        };
        path.push(PathSeg::Key(field.key.clone()));
        match &field.kind {
            SettingKind::Plain => {}
            SettingKind::Secret => {
                if child.is_string() {
                    f(path, child)?;
                }
            }
            SettingKind::Authentication => {
                if let Some(slot) = authentication_slot(child)
                    && let Some(secret) = child.get_mut(slot)
                    && secret.is_string()
                {
                    path.push(PathSeg::Key(slot.to_string()));
                    f(path, secret)?;
                    path.pop();
                }
            }
            SettingKind::Group { fields } => visit(fields, child, path, f)?,
            SettingKind::Array { fields } => {
                if let Some(items) = child.as_array_mut() {
                    for (index, item) in items.iter_mut().enumerate() {
                        path.push(PathSeg::Index(index));
                        visit(fields, item, path, f)?;
                        path.pop();
                    }
                }
            }
        }
        path.pop();
    }
    Ok(())
}

fn lookup<'a>(value: &'a Value, path: &[PathSeg]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, seg| match seg {
        PathSeg::Key(key) => current.get(key.as_str()),
        PathSeg::Index(index) => current.get(*index),
    })
}

/// Copy of `settings` with every secret blanked to `""`
pub fn filter_secrets(manifest: &SettingsManifest, settings: &Value) -> Value {
    let mut filtered = settings.clone();
    let _ = visit::<(), _>(&manifest.fields, &mut filtered, &mut Vec::new(), &mut |_, slot| {
        *slot = Value::String(String::new());
        Ok(())
    });
    filtered
}

/// Replace every non-empty secret of `settings` in place
///
/// Used both to decrypt inbound command secrets and to encrypt secrets at rest.
pub fn map_secrets<E, M>(manifest: &SettingsManifest, settings: &mut Value, mut map: M) -> Result<(), E>
where
    M: FnMut(&str) -> Result<String, E>,
{
    visit(&manifest.fields, settings, &mut Vec::new(), &mut |_, slot| {
        if let Some(current) = slot.as_str()
            && !current.is_empty()
        {
            *slot = Value::String(map(current)?);
        }
        Ok(())
    })
}

/// Fill empty secrets of `target` from the same field of `source`
pub fn merge_secrets(manifest: &SettingsManifest, target: &mut Value, source: &Value) {
    let _ = visit::<(), _>(&manifest.fields, target, &mut Vec::new(), &mut |path, slot| {
        if slot.as_str().is_some_and(str::is_empty)
            && let Some(existing) = lookup(source, path).and_then(Value::as_str)
        {
            *slot = Value::String(existing.to_string());
        }
        Ok(())
    });
}
