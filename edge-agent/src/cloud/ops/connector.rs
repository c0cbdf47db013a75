//! South + North connector operations

use serde_json::Value;
use shared::error::{AppError, AppResult};
use shared::models::MessageType;

use super::{Completion, SecretDecryptor, announce, content_type, ensure_csv_valid};
use crate::cloud::command_executor::ExecutionContext;
use crate::services::domain::ConnectorRecord;

const SETTINGS: &str = "settings";

async fn existing_south(ctx: &ExecutionContext, id: &str) -> AppResult<ConnectorRecord> {
    ctx.services
        .south
        .get_south(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("South connector {id} not found")))
}

async fn existing_north(ctx: &ExecutionContext, id: &str) -> AppResult<ConnectorRecord> {
    ctx.services
        .north
        .get_north(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("North connector {id} not found")))
}

/// Decrypt `content.settings` with the manifest of the named or stored type
fn decrypt_south(ctx: &ExecutionContext, content: &mut Value, stored_type: Option<&str>) -> AppResult<()> {
    let connector_type = content_type(content, "type", stored_type)?.to_string();
    let manifest = ctx.services.south.south_manifest(&connector_type)?;
    SecretDecryptor::new(&ctx.registration).decrypt(&manifest, content, SETTINGS)
}

fn decrypt_north(ctx: &ExecutionContext, content: &mut Value, stored_type: Option<&str>) -> AppResult<()> {
    let connector_type = content_type(content, "type", stored_type)?.to_string();
    let manifest = ctx.services.north.north_manifest(&connector_type)?;
    SecretDecryptor::new(&ctx.registration).decrypt(&manifest, content, SETTINGS)
}

// ── South ──

pub async fn create_south(
    ctx: &ExecutionContext,
    mut content: Value,
    retrieve_secrets_from: Option<&str>,
) -> AppResult<Completion> {
    decrypt_south(ctx, &mut content, None)?;
    let id = ctx.services.south.create_south(content, retrieve_secrets_from).await?;
    tracing::debug!(south_id = %id, "South connector created");
    announce(ctx, MessageType::FullConfig);
    Ok(Completion::Done("South connector created successfully".to_string()))
}

pub async fn update_south(ctx: &ExecutionContext, id: &str, mut content: Value) -> AppResult<Completion> {
    let existing = existing_south(ctx, id).await?;
    decrypt_south(ctx, &mut content, Some(&existing.connector_type))?;
    ctx.services.south.update_south(id, content).await?;
    announce(ctx, MessageType::FullConfig);
    Ok(Completion::Done("South connector updated successfully".to_string()))
}

pub async fn delete_south(ctx: &ExecutionContext, id: &str) -> AppResult<Completion> {
    ctx.services.south.delete_south(id).await?;
    announce(ctx, MessageType::FullConfig);
    Ok(Completion::Done("South connector deleted successfully".to_string()))
}

pub async fn import_south_items(
    ctx: &ExecutionContext,
    id: &str,
    csv: &str,
    delimiter: &str,
    delete_items_not_present: bool,
) -> AppResult<Completion> {
    let south = existing_south(ctx, id).await?;
    let check = ctx.services.south.check_south_csv(id, csv, delimiter).await?;
    ensure_csv_valid(&check)?;

    let count = ctx
        .services
        .south
        .import_south_items(id, check.items, delete_items_not_present)
        .await?;
    announce(ctx, MessageType::FullConfig);
    Ok(Completion::Done(format!("{count} items imported on South connector {}", south.name)))
}

pub async fn test_south_connection(ctx: &ExecutionContext, id: &str, mut content: Value) -> AppResult<Completion> {
    let existing = existing_south(ctx, id).await?;
    decrypt_south(ctx, &mut content, Some(&existing.connector_type))?;
    let settings = content.get(SETTINGS).cloned().unwrap_or(Value::Null);
    ctx.services.south.test_south_connection(id, settings).await?;
    Ok(Completion::Done(format!("South connector {id} connection tested successfully")))
}

pub async fn test_south_item(ctx: &ExecutionContext, id: &str, item_id: &str, mut content: Value) -> AppResult<Completion> {
    let existing = existing_south(ctx, id).await?;
    decrypt_south(ctx, &mut content, Some(&existing.connector_type))?;
    let result = ctx.services.south.test_south_item(id, item_id, content).await?;
    Ok(Completion::Done(result.to_string()))
}

// ── North ──

pub async fn create_north(
    ctx: &ExecutionContext,
    mut content: Value,
    retrieve_secrets_from: Option<&str>,
) -> AppResult<Completion> {
    decrypt_north(ctx, &mut content, None)?;
    let id = ctx.services.north.create_north(content, retrieve_secrets_from).await?;
    tracing::debug!(north_id = %id, "North connector created");
    announce(ctx, MessageType::FullConfig);
    Ok(Completion::Done("North connector created successfully".to_string()))
}

pub async fn update_north(ctx: &ExecutionContext, id: &str, mut content: Value) -> AppResult<Completion> {
    let existing = existing_north(ctx, id).await?;
    decrypt_north(ctx, &mut content, Some(&existing.connector_type))?;
    ctx.services.north.update_north(id, content).await?;
    announce(ctx, MessageType::FullConfig);
    Ok(Completion::Done("North connector updated successfully".to_string()))
}

pub async fn delete_north(ctx: &ExecutionContext, id: &str) -> AppResult<Completion> {
    ctx.services.north.delete_north(id).await?;
    announce(ctx, MessageType::FullConfig);
    Ok(Completion::Done("North connector deleted successfully".to_string()))
}

pub async fn test_north_connection(ctx: &ExecutionContext, id: &str, mut content: Value) -> AppResult<Completion> {
    let existing = existing_north(ctx, id).await?;
    decrypt_north(ctx, &mut content, Some(&existing.connector_type))?;
    let settings = content.get(SETTINGS).cloned().unwrap_or(Value::Null);
    ctx.services.north.test_north_connection(id, settings).await?;
    Ok(Completion::Done(format!("North connector {id} connection tested successfully")))
}

pub async fn setpoint(ctx: &ExecutionContext, id: &str, content: Value) -> AppResult<Completion> {
    ctx.services.north.execute_setpoint(id, content).await?;
    Ok(Completion::Done(format!("Setpoint sent to North connector {id}")))
}
