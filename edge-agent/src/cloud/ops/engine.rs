//! Engine operations: upgrade, restart, keys, engine and registration settings

use serde_json::Value;
use shared::error::{AppError, AppResult, ErrorCode};
use shared::models::{MessageType, RegistrationIntervals, UpdateVersionContent};

use super::{Completion, announce};
use crate::cloud::command_executor::ExecutionContext;

/// Name of the upgrade descriptor read by the launcher
pub const UPDATE_DESCRIPTOR: &str = "update.json";

/// Archive name for this platform
pub fn update_archive_name() -> String {
    format!("oibus-{}_{}.zip", std::env::consts::OS, std::env::consts::ARCH)
}

/// Download the upgrade archive next to its descriptor, then restart
pub async fn update_version(ctx: &ExecutionContext, content: &UpdateVersionContent) -> AppResult<Completion> {
    if ctx.options.ignore_remote_update {
        return Err(AppError::with_message(
            ErrorCode::CommandFailed,
            "OIBus is not set up to execute remote update",
        ));
    }

    let update_dir = &ctx.options.update_dir;
    tokio::fs::create_dir_all(update_dir)
        .await
        .map_err(|e| AppError::with_message(ErrorCode::IoError, format!("Failed to create update folder: {e}")))?;

    let connection = ctx.registration.connection_context(ctx.options.download_timeout)?;
    let archive = update_dir.join(update_archive_name());
    tracing::info!(version = %content.version, asset_id = %content.asset_id, "Downloading OIBus upgrade");
    ctx.transport
        .download_asset(&connection, &content.asset_id, &archive)
        .await?;

    let descriptor = serde_json::to_vec_pretty(content)
        .map_err(|e| AppError::internal(format!("Failed to serialize update descriptor: {e}")))?;
    tokio::fs::write(update_dir.join(UPDATE_DESCRIPTOR), descriptor)
        .await
        .map_err(|e| AppError::with_message(ErrorCode::IoError, format!("Failed to write update descriptor: {e}")))?;

    Ok(Completion::Terminate(format!(
        "OIBus version {} downloaded, restarting to upgrade",
        content.version
    )))
}

pub fn restart() -> Completion {
    Completion::Terminate("OIBus restarted".to_string())
}

pub async fn regenerate_cipher_keys(ctx: &ExecutionContext) -> AppResult<Completion> {
    ctx.registration.regenerate_keys().await?;
    announce(ctx, MessageType::FullConfig);
    Ok(Completion::Done("OIAnalytics keys reloaded".to_string()))
}

pub async fn update_engine_settings(ctx: &ExecutionContext, content: Value) -> AppResult<Completion> {
    ctx.services.engine.update_engine_settings(content).await?;
    announce(ctx, MessageType::FullConfig);
    Ok(Completion::Done("Engine settings updated successfully".to_string()))
}

pub fn update_registration_settings(ctx: &ExecutionContext, intervals: RegistrationIntervals) -> AppResult<Completion> {
    crate::utils::validation::validate_intervals(&intervals)?;
    ctx.registration.update_intervals(intervals)?;
    Ok(Completion::Done("Registration settings updated successfully".to_string()))
}
