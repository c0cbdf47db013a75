//! Command handlers - grouped by domain
//!
//! [`dispatch`] is the closed table from payload to handler. Each handler
//! performs its side effect through a domain collaborator and returns the
//! result string stored on the command.

pub mod connector;
pub mod engine;
pub mod history;
pub mod resource;

use serde_json::Value;
use shared::error::{AppError, AppResult, ErrorCode};
use shared::models::{Command, CommandPayload, MessageType};

use super::command_executor::ExecutionContext;
use crate::services::crypto::decrypt_with_private_key;
use crate::services::domain::{CsvCheck, ResourceKind};
use crate::services::registration::RegistrationService;
use crate::services::secrets::{SettingsManifest, map_secrets};

/// How a handler finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Mark COMPLETED with the result
    Done(String),
    /// Mark COMPLETED with the result, then terminate the process
    Terminate(String),
}

impl Completion {
    pub fn result(&self) -> &str {
        match self {
            Self::Done(result) | Self::Terminate(result) => result,
        }
    }
}

/// Execute one command
pub async fn dispatch(ctx: &ExecutionContext, command: &Command) -> AppResult<Completion> {
    match &command.payload {
        // ── Engine ──
        CommandPayload::UpdateVersion { command_content } => {
            engine::update_version(ctx, command_content).await
        }
        CommandPayload::RestartEngine => Ok(engine::restart()),
        CommandPayload::RegenerateCipherKeys => engine::regenerate_cipher_keys(ctx).await,
        CommandPayload::UpdateEngineSettings { command_content } => {
            engine::update_engine_settings(ctx, command_content.clone()).await
        }
        CommandPayload::UpdateRegistrationSettings { command_content } => {
            engine::update_registration_settings(ctx, *command_content)
        }

        // ── Scan mode ──
        CommandPayload::CreateScanMode { command_content } => {
            resource::create(ctx, ResourceKind::ScanMode, command_content.clone()).await
        }
        CommandPayload::UpdateScanMode {
            scan_mode_id,
            command_content,
        } => resource::update(ctx, ResourceKind::ScanMode, scan_mode_id, command_content.clone()).await,
        CommandPayload::DeleteScanMode { scan_mode_id } => {
            resource::delete(ctx, ResourceKind::ScanMode, scan_mode_id).await
        }

        // ── IP filter ──
        CommandPayload::CreateIpFilter { command_content } => {
            resource::create(ctx, ResourceKind::IpFilter, command_content.clone()).await
        }
        CommandPayload::UpdateIpFilter {
            ip_filter_id,
            command_content,
        } => resource::update(ctx, ResourceKind::IpFilter, ip_filter_id, command_content.clone()).await,
        CommandPayload::DeleteIpFilter { ip_filter_id } => {
            resource::delete(ctx, ResourceKind::IpFilter, ip_filter_id).await
        }

        // ── Certificate ──
        CommandPayload::CreateCertificate { command_content } => {
            resource::create(ctx, ResourceKind::Certificate, command_content.clone()).await
        }
        CommandPayload::UpdateCertificate {
            certificate_id,
            command_content,
        } => {
            resource::update(ctx, ResourceKind::Certificate, certificate_id, command_content.clone())
                .await
        }
        CommandPayload::DeleteCertificate { certificate_id } => {
            resource::delete(ctx, ResourceKind::Certificate, certificate_id).await
        }

        // ── South ──
        CommandPayload::CreateSouth {
            retrieve_secrets_from_south,
            command_content,
        } => {
            connector::create_south(ctx, command_content.clone(), retrieve_secrets_from_south.as_deref())
                .await
        }
        CommandPayload::UpdateSouth {
            south_connector_id,
            command_content,
        } => connector::update_south(ctx, south_connector_id, command_content.clone()).await,
        CommandPayload::DeleteSouth { south_connector_id } => {
            connector::delete_south(ctx, south_connector_id).await
        }
        CommandPayload::CreateOrUpdateSouthItemsFromCsv {
            south_connector_id,
            delete_items_not_present,
            csv_content,
            delimiter,
        } => {
            connector::import_south_items(
                ctx,
                south_connector_id,
                csv_content,
                delimiter,
                *delete_items_not_present,
            )
            .await
        }
        CommandPayload::TestSouthConnection {
            south_connector_id,
            command_content,
        } => connector::test_south_connection(ctx, south_connector_id, command_content.clone()).await,
        CommandPayload::TestSouthItem {
            south_connector_id,
            item_id,
            command_content,
        } => {
            connector::test_south_item(ctx, south_connector_id, item_id, command_content.clone()).await
        }

        // ── North ──
        CommandPayload::CreateNorth {
            retrieve_secrets_from_north,
            command_content,
        } => {
            connector::create_north(ctx, command_content.clone(), retrieve_secrets_from_north.as_deref())
                .await
        }
        CommandPayload::UpdateNorth {
            north_connector_id,
            command_content,
        } => connector::update_north(ctx, north_connector_id, command_content.clone()).await,
        CommandPayload::DeleteNorth { north_connector_id } => {
            connector::delete_north(ctx, north_connector_id).await
        }
        CommandPayload::TestNorthConnection {
            north_connector_id,
            command_content,
        } => connector::test_north_connection(ctx, north_connector_id, command_content.clone()).await,
        CommandPayload::Setpoint {
            north_connector_id,
            command_content,
        } => connector::setpoint(ctx, north_connector_id, command_content.clone()).await,

        // ── History query ──
        CommandPayload::CreateHistoryQuery {
            retrieve_secrets_from_south,
            retrieve_secrets_from_north,
            retrieve_secrets_from_history_query,
            command_content,
        } => {
            let sources = crate::services::domain::SecretSources {
                south: retrieve_secrets_from_south.clone(),
                north: retrieve_secrets_from_north.clone(),
                history_query: retrieve_secrets_from_history_query.clone(),
            };
            history::create(ctx, command_content.clone(), sources).await
        }
        CommandPayload::UpdateHistoryQuery {
            history_id,
            command_content,
        } => history::update(ctx, history_id, command_content.clone()).await,
        CommandPayload::DeleteHistoryQuery { history_id } => history::delete(ctx, history_id).await,
        CommandPayload::CreateOrUpdateHistoryQuerySouthItemsFromCsv {
            history_id,
            delete_items_not_present,
            csv_content,
            delimiter,
        } => {
            history::import_items(ctx, history_id, csv_content, delimiter, *delete_items_not_present)
                .await
        }
        CommandPayload::TestHistoryQueryNorthConnection {
            history_id,
            command_content,
        } => history::test_north_connection(ctx, history_id, command_content.clone()).await,
        CommandPayload::TestHistoryQuerySouthConnection {
            history_id,
            command_content,
        } => history::test_south_connection(ctx, history_id, command_content.clone()).await,
        CommandPayload::TestHistoryQuerySouthItem {
            history_id,
            item_id,
            command_content,
        } => history::test_south_item(ctx, history_id, item_id, command_content.clone()).await,
        CommandPayload::UpdateHistoryQueryStatus {
            history_id,
            history_query_status,
        } => history::update_status(ctx, history_id, *history_query_status).await,

        CommandPayload::Unsupported => Err(AppError::with_message(
            ErrorCode::UnsupportedCommand,
            format!("Command {} of type unsupported is not supported", command.id),
        )),
    }
}

/// Decrypts secrets the cloud encrypted with the registration public key
///
/// The private key is read once, on the first non-empty secret.
pub(crate) struct SecretDecryptor<'a> {
    registration: &'a RegistrationService,
    private_key: Option<String>,
}

impl<'a> SecretDecryptor<'a> {
    pub(crate) fn new(registration: &'a RegistrationService) -> Self {
        Self {
            registration,
            private_key: None,
        }
    }

    /// Decrypt the secrets of `content[key]` in place; a missing key is a no-op
    pub(crate) fn decrypt(&mut self, manifest: &SettingsManifest, content: &mut Value, key: &str) -> AppResult<()> {
        let Some(settings) = content.get_mut(key) else {
            return Ok(());
        };
        let registration = self.registration;
        let private_key = &mut self.private_key;
        map_secrets(manifest, settings, |encrypted| -> AppResult<String> {
            if private_key.is_none() {
                *private_key = Some(registration.private_key()?);
            }
            let pem = private_key.as_deref().unwrap_or_default();
            Ok(decrypt_with_private_key(pem, encrypted)?)
        })
    }
}

/// Queue a message after a configuration change; failures are logged only
pub(crate) fn announce(ctx: &ExecutionContext, message_type: MessageType) {
    if let Err(e) = ctx.messages.create_message(message_type) {
        tracing::error!(message_type = %message_type, "Error while creating message: {e}");
    }
}

/// Fail with every row error of a CSV check
pub(crate) fn ensure_csv_valid(check: &CsvCheck) -> AppResult<()> {
    if check.errors.is_empty() {
        return Ok(());
    }
    let lines: Vec<String> = check
        .errors
        .iter()
        .map(|e| format!("{}: {}", e.name, e.error))
        .collect();
    Err(AppError::with_message(
        ErrorCode::CommandFailed,
        format!("Error when checking csv items:\n{}", lines.join("\n")),
    ))
}

/// Connector type named by the content, falling back to the stored record
pub(crate) fn content_type<'a>(content: &'a Value, key: &str, stored: Option<&'a str>) -> AppResult<&'a str> {
    content
        .get(key)
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .or(stored)
        .ok_or_else(|| AppError::validation(format!("{key} is required")))
}
