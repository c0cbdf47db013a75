//! Scan mode + IP filter + certificate operations (via ConfigResourceService)

use serde_json::Value;
use shared::error::AppResult;
use shared::models::MessageType;

use super::{Completion, announce};
use crate::cloud::command_executor::ExecutionContext;
use crate::services::domain::ResourceKind;

pub async fn create(ctx: &ExecutionContext, kind: ResourceKind, content: Value) -> AppResult<Completion> {
    let id = ctx.services.resources.create_resource(kind, content).await?;
    tracing::debug!(resource = kind.label(), id = %id, "Resource created");
    announce(ctx, MessageType::FullConfig);
    Ok(Completion::Done(format!("{} created successfully", kind.label())))
}

pub async fn update(ctx: &ExecutionContext, kind: ResourceKind, id: &str, content: Value) -> AppResult<Completion> {
    ctx.services.resources.update_resource(kind, id, content).await?;
    announce(ctx, MessageType::FullConfig);
    Ok(Completion::Done(format!("{} updated successfully", kind.label())))
}

pub async fn delete(ctx: &ExecutionContext, kind: ResourceKind, id: &str) -> AppResult<Completion> {
    ctx.services.resources.delete_resource(kind, id).await?;
    announce(ctx, MessageType::FullConfig);
    Ok(Completion::Done(format!("{} deleted successfully", kind.label())))
}
