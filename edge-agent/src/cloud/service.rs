//! CloudTransport - HTTP client for the OIAnalytics control plane
//!
//! Every call carries a [`ConnectionContext`] built from the registration
//! settings at the start of the cycle, so a settings edit takes effect on the
//! next call without rebuilding anything.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use shared::cloud::{RegistrationCheck, RegistrationRequest, RegistrationResponse, paths};
use shared::error::AppError;
use shared::models::{CommandStatusUpdate, MessageType, RegistrationSettings, RemoteCommand};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::services::crypto::{CryptoResult, SecretCipher};
use crate::utils::validation::normalize_host;

/// Proxy used for cloud calls
#[derive(Debug, Clone, PartialEq)]
pub struct ProxySettings {
    pub url: String,
    pub username: Option<String>,
    /// Decrypted
    pub password: Option<String>,
}

/// Connection parameters of one cloud call
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionContext {
    pub host: String,
    /// Decrypted bearer token
    pub token: Option<String>,
    pub proxy: Option<ProxySettings>,
    pub accept_unauthorized: bool,
    pub timeout: Duration,
}

impl ConnectionContext {
    pub fn new(host: &str, timeout: Duration) -> Self {
        Self {
            host: normalize_host(host),
            token: None,
            proxy: None,
            accept_unauthorized: false,
            timeout,
        }
    }

    /// Context from the persisted registration, secrets decrypted
    pub fn from_registration(
        settings: &RegistrationSettings,
        cipher: &SecretCipher,
        timeout: Duration,
    ) -> CryptoResult<Self> {
        let proxy = match (settings.use_proxy, settings.proxy_url.as_deref()) {
            (true, Some(url)) if !url.is_empty() => Some(ProxySettings {
                url: url.to_string(),
                username: settings.proxy_username.clone().filter(|u| !u.is_empty()),
                password: cipher.decrypt_optional(settings.proxy_password.as_deref())?,
            }),
            _ => None,
        };
        Ok(Self {
            host: normalize_host(&settings.host),
            token: cipher.decrypt_optional(settings.token.as_deref())?,
            proxy,
            accept_unauthorized: settings.accept_unauthorized,
            timeout,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Non-2xx answer
    #[error("{status} - {reason}")]
    Status { status: u16, reason: String },

    #[error("{0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Failed to write download: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

impl From<TransportError> for AppError {
    fn from(err: TransportError) -> Self {
        AppError::network(err.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Command reference returned by the list-by-ids endpoint
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandReference {
    pub id: String,
}

#[async_trait]
pub trait CloudTransport: Send + Sync {
    async fn get_pending_commands(&self, ctx: &ConnectionContext) -> TransportResult<Vec<RemoteCommand>>;

    /// Commands among `ids` that the cloud reports as cancelled
    async fn get_commands_by_ids(
        &self,
        ctx: &ConnectionContext,
        ids: &[String],
    ) -> TransportResult<Vec<CommandReference>>;

    async fn push_command_status(
        &self,
        ctx: &ConnectionContext,
        updates: &[CommandStatusUpdate],
    ) -> TransportResult<()>;

    async fn register(
        &self,
        ctx: &ConnectionContext,
        request: &RegistrationRequest,
    ) -> TransportResult<RegistrationResponse>;

    async fn check_registration(
        &self,
        ctx: &ConnectionContext,
        check_url: &str,
    ) -> TransportResult<RegistrationCheck>;

    async fn send_message(
        &self,
        ctx: &ConnectionContext,
        message_type: MessageType,
        payload: &Value,
    ) -> TransportResult<()>;

    async fn download_asset(
        &self,
        ctx: &ConnectionContext,
        asset_id: &str,
        target: &Path,
    ) -> TransportResult<()>;
}

/// reqwest implementation of [`CloudTransport`]
#[derive(Debug, Clone, Default)]
pub struct HttpCloudClient;

impl HttpCloudClient {
    pub fn new() -> Self {
        Self
    }

    /// Client per call: proxy, certificate policy and timeout come from the context
    fn client(ctx: &ConnectionContext) -> TransportResult<Client> {
        let mut builder = Client::builder()
            .timeout(ctx.timeout)
            .danger_accept_invalid_certs(ctx.accept_unauthorized);
        if let Some(proxy) = &ctx.proxy {
            let mut p = reqwest::Proxy::all(&proxy.url)?;
            if let Some(username) = &proxy.username {
                p = p.basic_auth(username, proxy.password.as_deref().unwrap_or_default());
            }
            builder = builder.proxy(p);
        }
        Ok(builder.build()?)
    }

    fn request(ctx: &ConnectionContext, method: Method, path: &str) -> TransportResult<RequestBuilder> {
        let mut request = Self::client(ctx)?.request(method, ctx.url(path));
        if let Some(token) = &ctx.token {
            request = request.bearer_auth(token);
        }
        Ok(request)
    }

    async fn check(response: Response) -> TransportResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if !body.is_empty() {
            tracing::debug!(status = status.as_u16(), body = %body, "Cloud call rejected");
        }
        Err(TransportError::Status {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
        })
    }
}

/// 解析单条待执行命令
///
/// 负载无法解析但 id 与 targetVersion 可读时，返回被拒绝的命令，
/// 以便记录为 ERRORED 并回报云端。两者都不可读时丢弃。
fn parse_remote_command(value: Value) -> Option<RemoteCommand> {
    let error = match serde_json::from_value::<RemoteCommand>(value.clone()) {
        Ok(command) => return Some(command),
        Err(e) => e,
    };
    let id = value.get("id").and_then(Value::as_str);
    let target_version = value.get("targetVersion").and_then(Value::as_str);
    match (id, target_version) {
        (Some(id), Some(target_version)) => {
            tracing::warn!(command_id = %id, "Malformed command stored as errored: {error}");
            Some(RemoteCommand::rejected(id, target_version, format!("Invalid command: {error}")))
        }
        _ => {
            tracing::warn!("Skipping malformed command without id: {error}");
            None
        }
    }
}

#[async_trait]
impl CloudTransport for HttpCloudClient {
    async fn get_pending_commands(&self, ctx: &ConnectionContext) -> TransportResult<Vec<RemoteCommand>> {
        let response = Self::request(ctx, Method::GET, paths::PENDING_COMMANDS)?.send().await?;
        let raw: Vec<Value> = Self::check(response).await?.json().await?;

        // A malformed command must not block the others
        Ok(raw.into_iter().filter_map(parse_remote_command).collect())
    }

    async fn get_commands_by_ids(
        &self,
        ctx: &ConnectionContext,
        ids: &[String],
    ) -> TransportResult<Vec<CommandReference>> {
        let query: Vec<(&str, &str)> = ids.iter().map(|id| ("ids", id.as_str())).collect();
        let response = Self::request(ctx, Method::GET, paths::COMMANDS_BY_IDS)?
            .query(&query)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn push_command_status(
        &self,
        ctx: &ConnectionContext,
        updates: &[CommandStatusUpdate],
    ) -> TransportResult<()> {
        let response = Self::request(ctx, Method::PUT, paths::COMMAND_STATUS)?
            .json(updates)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn register(
        &self,
        ctx: &ConnectionContext,
        request: &RegistrationRequest,
    ) -> TransportResult<RegistrationResponse> {
        let response = Self::request(ctx, Method::POST, paths::REGISTRATION)?
            .json(request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn check_registration(
        &self,
        ctx: &ConnectionContext,
        check_url: &str,
    ) -> TransportResult<RegistrationCheck> {
        let response = Self::request(ctx, Method::GET, check_url)?.send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn send_message(
        &self,
        ctx: &ConnectionContext,
        message_type: MessageType,
        payload: &Value,
    ) -> TransportResult<()> {
        let path = match message_type {
            MessageType::FullConfig => paths::FULL_CONFIG,
            MessageType::HistoryQueries => paths::HISTORY_QUERIES,
        };
        let response = Self::request(ctx, Method::PUT, path)?.json(payload).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn download_asset(
        &self,
        ctx: &ConnectionContext,
        asset_id: &str,
        target: &Path,
    ) -> TransportResult<()> {
        let response = Self::request(ctx, Method::GET, paths::UPGRADE_ASSET)?
            .query(&[("assetId", asset_id)])
            .send()
            .await?;
        let mut response = Self::check(response).await?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(target).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_from_registration() {
        let cipher = SecretCipher::random();
        let settings = RegistrationSettings {
            host: "https://cloud.example.com/".to_string(),
            token: Some(cipher.encrypt_string("jwt").unwrap()),
            use_proxy: true,
            proxy_url: Some("http://proxy:3128".to_string()),
            proxy_username: Some("proxy-user".to_string()),
            proxy_password: Some(cipher.encrypt_string("proxy-pass").unwrap()),
            accept_unauthorized: true,
            ..Default::default()
        };

        let ctx = ConnectionContext::from_registration(&settings, &cipher, Duration::from_secs(10)).unwrap();
        assert_eq!(ctx.host, "https://cloud.example.com");
        assert_eq!(ctx.token.as_deref(), Some("jwt"));
        assert!(ctx.accept_unauthorized);
        let proxy = ctx.proxy.unwrap();
        assert_eq!(proxy.url, "http://proxy:3128");
        assert_eq!(proxy.password.as_deref(), Some("proxy-pass"));
    }

    #[test]
    fn test_proxy_ignored_when_disabled() {
        let cipher = SecretCipher::random();
        let settings = RegistrationSettings {
            host: "https://cloud.example.com".to_string(),
            use_proxy: false,
            proxy_url: Some("http://proxy:3128".to_string()),
            ..Default::default()
        };
        let ctx = ConnectionContext::from_registration(&settings, &cipher, Duration::from_secs(10)).unwrap();
        assert!(ctx.proxy.is_none());
        assert!(ctx.token.is_none());
    }

    #[test]
    fn test_status_error_display() {
        let err = TransportError::Status {
            status: 400,
            reason: "Bad Request".to_string(),
        };
        assert_eq!(err.to_string(), "400 - Bad Request");
    }

    #[test]
    fn test_malformed_command_with_id_is_rejected() {
        let command = parse_remote_command(serde_json::json!({
            "id": "c2",
            "targetVersion": "3.4.0",
            "type": "update-version",
            "version": 7
        }))
        .unwrap();
        assert_eq!(command.id, "c2");
        assert_eq!(command.target_version, "3.4.0");
        assert!(command.rejection.unwrap().starts_with("Invalid command: "));
    }

    #[test]
    fn test_malformed_command_without_id_is_dropped() {
        assert!(parse_remote_command(serde_json::json!({ "type": "restart-engine" })).is_none());
        assert!(parse_remote_command(serde_json::json!({ "id": "c1", "type": "restart-engine" })).is_none());
    }
}
