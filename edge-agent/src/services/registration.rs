use shared::cloud::RegistrationRequest;
use shared::error::{AppError, AppResult, ErrorCode};
use shared::models::{
    RegistrationCommand, RegistrationIntervals, RegistrationSettings, RegistrationStatus,
};
use shared::util::{generate_random_id, now_iso};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cloud::service::{CloudTransport, ConnectionContext, ProxySettings};
use crate::core::config::Config;
use crate::core::flight::InFlight;
use crate::db::storage::{ConnectionUpdate, LedgerStorage, PendingActivation};
use crate::services::crypto::{KeyPair, SecretCipher};
use crate::services::domain::EngineService;
use crate::utils::validation::{normalize_host, validate_registration_command};

const ACTIVATION_CODE_LEN: usize = 6;

/// 注册服务参数
#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    pub agent_version: String,
    pub check_interval: Duration,
    pub http_timeout: Duration,
    pub rsa_key_bits: usize,
}

impl From<&Config> for RegistrationOptions {
    fn from(config: &Config) -> Self {
        Self {
            agent_version: config.agent_version.clone(),
            check_interval: config.registration_check_interval(),
            http_timeout: config.http_timeout(),
            rsa_key_bits: config.rsa_key_bits,
        }
    }
}

/// 注册服务 - 管理与 OIAnalytics 的注册握手
///
/// # 注册流程
///
/// ```text
/// 1. register(): 生成激活码和 RSA 密钥对，POST 到云端 → PENDING
/// 2. 定时 check_registration(): 轮询 checkUrl
///    - COMPLETED: 保存 token (加密) → REGISTERED，停止轮询
///    - 其他状态: 继续轮询
/// 3. unregister(): 回到 NOT_REGISTERED，清除 token 和密钥
/// ```
///
/// 每次状态或连接设置变化都通过 watch 通道广播 ("updated")。
pub struct RegistrationService {
    ledger: LedgerStorage,
    cipher: Arc<SecretCipher>,
    transport: Arc<dyn CloudTransport>,
    engine: Arc<dyn EngineService>,
    options: RegistrationOptions,
    /// "updated" 信号
    status_tx: watch::Sender<RegistrationStatus>,
    in_flight: InFlight,
    /// 轮询任务的取消令牌 (None = 未运行)
    check_loop: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl RegistrationService {
    pub fn new(
        ledger: LedgerStorage,
        cipher: Arc<SecretCipher>,
        transport: Arc<dyn CloudTransport>,
        engine: Arc<dyn EngineService>,
        options: RegistrationOptions,
        shutdown: CancellationToken,
    ) -> AppResult<Self> {
        let status = ledger.get_registration()?.status;
        let (status_tx, _) = watch::channel(status);
        Ok(Self {
            ledger,
            cipher,
            transport,
            engine,
            options,
            status_tx,
            in_flight: InFlight::new(),
            check_loop: Mutex::new(None),
            shutdown,
        })
    }

    /// Subscribe to the "updated" signal
    pub fn subscribe(&self) -> watch::Receiver<RegistrationStatus> {
        self.status_tx.subscribe()
    }

    pub fn settings(&self) -> AppResult<RegistrationSettings> {
        Ok(self.ledger.get_registration()?)
    }

    /// Connection context from the current settings
    pub fn connection_context(&self, timeout: Duration) -> AppResult<ConnectionContext> {
        let settings = self.ledger.get_registration()?;
        Ok(ConnectionContext::from_registration(&settings, &self.cipher, timeout)?)
    }

    /// Decrypted private key used for command secrets
    pub fn private_key(&self) -> AppResult<String> {
        let settings = self.ledger.get_registration()?;
        self.cipher
            .decrypt_optional(settings.private_cipher_key.as_deref())?
            .ok_or_else(|| AppError::crypto("No private key in registration settings"))
    }

    /// Resume polling when a handshake was left pending
    pub fn start(self: &Arc<Self>) -> AppResult<()> {
        let settings = self.ledger.get_registration()?;
        let has_check_url = settings.check_url.as_deref().is_some_and(|u| !u.is_empty());
        if settings.status == RegistrationStatus::Pending && has_check_url {
            tracing::info!(host = %settings.host, "Resuming registration check");
            self.start_check_loop();
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.stop_check_loop();
    }

    pub fn is_checking(&self) -> bool {
        self.check_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn start_check_loop(self: &Arc<Self>) {
        let mut slot = self.check_loop.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let token = self.shutdown.child_token();
        *slot = Some(token.clone());

        let service = Arc::clone(self);
        let period = self.options.check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => service.check_registration().await,
                }
            }
            tracing::debug!("Registration check loop stopped");
        });
    }

    fn stop_check_loop(&self) {
        if let Some(token) = self
            .check_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }

    fn notify_updated(&self, status: RegistrationStatus) {
        tracing::debug!(status = %status, "Registration updated");
        self.status_tx.send_replace(status);
    }

    /// 轮询一次注册状态
    pub async fn check_registration(&self) {
        let Some(_guard) = self.in_flight.try_begin() else {
            tracing::trace!("On going registration check");
            return;
        };

        let settings = match self.ledger.get_registration() {
            Ok(settings) => settings,
            Err(e) => {
                tracing::error!("Error while checking registration status: {e}");
                return;
            }
        };
        let Some(check_url) = settings.check_url.clone().filter(|u| !u.is_empty()) else {
            tracing::error!("Error while checking registration status: could not retrieve check URL");
            return;
        };

        let ctx = match ConnectionContext::from_registration(&settings, &self.cipher, self.options.http_timeout) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!("Error while checking registration status: {e}");
                return;
            }
        };

        match self.transport.check_registration(&ctx, &check_url).await {
            Ok(check) if check.is_completed() => {
                let Some(access_token) = check.access_token.as_deref().filter(|t| !t.is_empty()) else {
                    tracing::error!("Error while checking registration status: completed without access token");
                    return;
                };
                if let Err(e) = self.activate(access_token) {
                    tracing::error!("Error while activating registration: {e}");
                    return;
                }
                self.stop_check_loop();
                tracing::info!(host = %settings.host, "OIBus registered");
                self.notify_updated(RegistrationStatus::Registered);
            }
            Ok(check) => {
                tracing::warn!("Registration not completed. Status: {}", check.status);
            }
            Err(e) => {
                tracing::error!("Error while checking registration status: {e}");
            }
        }
    }

    fn activate(&self, access_token: &str) -> AppResult<()> {
        let encrypted = self.cipher.encrypt_string(access_token)?;
        self.ledger.activate_registration(&now_iso(), &encrypted)?;
        Ok(())
    }

    /// 发起注册
    pub async fn register(self: &Arc<Self>, command: RegistrationCommand) -> AppResult<RegistrationSettings> {
        validate_registration_command(&command)?;

        let current = self.ledger.get_registration()?;
        let key_pair = self.generate_key_pair().await?;
        let activation_code = generate_random_id(ACTIVATION_CODE_LEN);
        let engine = self.engine.engine_settings().await?;

        let ctx = self.command_context(&command, &current)?;
        let request = RegistrationRequest {
            activation_code: activation_code.clone(),
            oibus_version: self.options.agent_version.clone(),
            oibus_arch: std::env::consts::ARCH.to_string(),
            oibus_os: std::env::consts::OS.to_string(),
            oibus_id: engine.id,
            oibus_name: engine.name,
            public_key: key_pair.public_key.clone(),
        };
        let response = self.transport.register(&ctx, &request).await.map_err(|e| {
            AppError::with_message(ErrorCode::RegistrationFailed, format!("Registration failed: {e}"))
        })?;

        let activation = PendingActivation {
            activation_code,
            check_url: response.redirect_url,
            expiration_date: response.expiration_date,
            public_key: key_pair.public_key.clone(),
            private_key: self.cipher.encrypt_string(&key_pair.private_key)?,
        };
        let settings = self
            .ledger
            .register_pending(self.connection_update(command)?, activation)?;
        tracing::info!(host = %settings.host, "Registration pending, waiting for activation");

        self.start_check_loop();
        Ok(settings)
    }

    /// 修改连接设置，不改变注册状态
    pub fn edit_registration_settings(&self, command: RegistrationCommand) -> AppResult<RegistrationSettings> {
        validate_registration_command(&command)?;
        let settings = self
            .ledger
            .update_registration_settings(self.connection_update(command)?)?;
        self.notify_updated(settings.status);
        Ok(settings)
    }

    pub fn update_intervals(&self, intervals: RegistrationIntervals) -> AppResult<RegistrationSettings> {
        let settings = self.ledger.update_registration_intervals(intervals)?;
        self.notify_updated(settings.status);
        Ok(settings)
    }

    /// New key pair; the cloud learns the public key from the next full-config message
    pub async fn regenerate_keys(&self) -> AppResult<()> {
        let key_pair = self.generate_key_pair().await?;
        let private_key = self.cipher.encrypt_string(&key_pair.private_key)?;
        self.ledger.update_keys(&key_pair.public_key, &private_key)?;
        tracing::info!("Registration keys regenerated");
        Ok(())
    }

    pub fn unregister(&self) -> AppResult<()> {
        self.ledger.unregister()?;
        self.stop_check_loop();
        tracing::info!("OIBus unregistered");
        self.notify_updated(RegistrationStatus::NotRegistered);
        Ok(())
    }

    async fn generate_key_pair(&self) -> AppResult<KeyPair> {
        let bits = self.options.rsa_key_bits;
        let key_pair = tokio::task::spawn_blocking(move || KeyPair::generate(bits))
            .await
            .map_err(|e| AppError::internal(format!("Key generation task failed: {e}")))??;
        Ok(key_pair)
    }

    /// Encrypt a new proxy password; an empty one keeps the stored password
    fn connection_update(&self, command: RegistrationCommand) -> AppResult<ConnectionUpdate> {
        let proxy_password = match command.proxy_password.as_deref() {
            Some(password) if !password.is_empty() => Some(self.cipher.encrypt_string(password)?),
            _ => None,
        };
        Ok(ConnectionUpdate {
            host: normalize_host(&command.host),
            use_proxy: command.use_proxy,
            proxy_url: command.proxy_url,
            proxy_username: command.proxy_username,
            proxy_password,
            accept_unauthorized: command.accept_unauthorized,
            intervals: command.intervals,
            command_permissions: command.command_permissions,
        })
    }

    /// Context for the registration call itself, before anything is persisted
    fn command_context(
        &self,
        command: &RegistrationCommand,
        current: &RegistrationSettings,
    ) -> AppResult<ConnectionContext> {
        let mut ctx = ConnectionContext::new(&command.host, self.options.http_timeout);
        ctx.accept_unauthorized = command.accept_unauthorized;
        if command.use_proxy
            && let Some(url) = command.proxy_url.as_deref()
        {
            let password = match command.proxy_password.as_deref() {
                Some(password) if !password.is_empty() => Some(password.to_string()),
                _ => self.cipher.decrypt_optional(current.proxy_password.as_deref())?,
            };
            ctx.proxy = Some(ProxySettings {
                url: url.to_string(),
                username: command.proxy_username.clone().filter(|u| !u.is_empty()),
                password,
            });
        }
        Ok(ctx)
    }
}
