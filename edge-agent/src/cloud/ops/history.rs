//! History query operations
//!
//! A history query carries both a south and a north side; secrets of each are
//! decrypted with the manifest of that side's type.

use serde_json::Value;
use shared::error::{AppError, AppResult};
use shared::models::{HistoryQueryStatus, MessageType};

use super::{Completion, SecretDecryptor, announce, content_type, ensure_csv_valid};
use crate::cloud::command_executor::ExecutionContext;
use crate::services::domain::{HistoryQueryRecord, SecretSources};

async fn existing(ctx: &ExecutionContext, id: &str) -> AppResult<HistoryQueryRecord> {
    ctx.services
        .history
        .get_history_query(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("History query {id} not found")))
}

/// Decrypt `southSettings` and `northSettings`
fn decrypt_both(ctx: &ExecutionContext, content: &mut Value, stored: Option<&HistoryQueryRecord>) -> AppResult<()> {
    let south_type = content_type(content, "southType", stored.map(|h| h.south_type.as_str()))?.to_string();
    let north_type = content_type(content, "northType", stored.map(|h| h.north_type.as_str()))?.to_string();
    let south = ctx.services.south.south_manifest(&south_type)?;
    let north = ctx.services.north.north_manifest(&north_type)?;

    let mut decryptor = SecretDecryptor::new(&ctx.registration);
    decryptor.decrypt(&south, content, "southSettings")?;
    decryptor.decrypt(&north, content, "northSettings")
}

pub async fn create(ctx: &ExecutionContext, mut content: Value, sources: SecretSources) -> AppResult<Completion> {
    decrypt_both(ctx, &mut content, None)?;
    let id = ctx.services.history.create_history_query(content, sources).await?;
    tracing::debug!(history_id = %id, "History query created");
    announce(ctx, MessageType::HistoryQueries);
    Ok(Completion::Done("History query created successfully".to_string()))
}

pub async fn update(ctx: &ExecutionContext, id: &str, mut content: Value) -> AppResult<Completion> {
    let stored = existing(ctx, id).await?;
    decrypt_both(ctx, &mut content, Some(&stored))?;
    ctx.services.history.update_history_query(id, content).await?;
    announce(ctx, MessageType::HistoryQueries);
    Ok(Completion::Done("History query updated successfully".to_string()))
}

pub async fn delete(ctx: &ExecutionContext, id: &str) -> AppResult<Completion> {
    ctx.services.history.delete_history_query(id).await?;
    announce(ctx, MessageType::HistoryQueries);
    Ok(Completion::Done("History query deleted successfully".to_string()))
}

pub async fn import_items(
    ctx: &ExecutionContext,
    id: &str,
    csv: &str,
    delimiter: &str,
    delete_items_not_present: bool,
) -> AppResult<Completion> {
    let history = existing(ctx, id).await?;
    let check = ctx.services.history.check_history_csv(id, csv, delimiter).await?;
    ensure_csv_valid(&check)?;

    let count = ctx
        .services
        .history
        .import_history_items(id, check.items, delete_items_not_present)
        .await?;
    announce(ctx, MessageType::HistoryQueries);
    Ok(Completion::Done(format!("{count} items imported on History query {}", history.name)))
}

/// `commandContent.settings` holds the north connector settings under test
pub async fn test_north_connection(ctx: &ExecutionContext, id: &str, mut content: Value) -> AppResult<Completion> {
    let stored = existing(ctx, id).await?;
    let manifest = ctx.services.north.north_manifest(&stored.north_type)?;
    SecretDecryptor::new(&ctx.registration).decrypt(&manifest, &mut content, "settings")?;

    let settings = content.get("settings").cloned().unwrap_or(Value::Null);
    ctx.services.history.test_history_north_connection(id, settings).await?;
    Ok(Completion::Done(format!("History query {id} north connection tested successfully")))
}

pub async fn test_south_connection(ctx: &ExecutionContext, id: &str, mut content: Value) -> AppResult<Completion> {
    let stored = existing(ctx, id).await?;
    let manifest = ctx.services.south.south_manifest(&stored.south_type)?;
    SecretDecryptor::new(&ctx.registration).decrypt(&manifest, &mut content, "settings")?;

    let settings = content.get("settings").cloned().unwrap_or(Value::Null);
    ctx.services.history.test_history_south_connection(id, settings).await?;
    Ok(Completion::Done(format!("History query {id} south connection tested successfully")))
}

pub async fn test_south_item(ctx: &ExecutionContext, id: &str, item_id: &str, mut content: Value) -> AppResult<Completion> {
    let stored = existing(ctx, id).await?;
    let manifest = ctx.services.south.south_manifest(&stored.south_type)?;
    SecretDecryptor::new(&ctx.registration).decrypt(&manifest, &mut content, "settings")?;

    let result = ctx.services.history.test_history_south_item(id, item_id, content).await?;
    Ok(Completion::Done(result.to_string()))
}

pub async fn update_status(ctx: &ExecutionContext, id: &str, status: HistoryQueryStatus) -> AppResult<Completion> {
    ctx.services.history.update_history_query_status(id, status).await?;
    announce(ctx, MessageType::HistoryQueries);
    Ok(Completion::Done(format!("History query {id} status updated to {status}")))
}
