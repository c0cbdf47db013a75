use std::sync::Arc;
use tokio::sync::Notify;

use crate::cloud::{
    CloudTransport, CommandExecutor, CommandSyncEngine, ExitTerminator, HttpCloudClient, MessageSyncEngine,
    command_executor::{ExecutionContext, ExecutorOptions},
    message_sync::MessageOptions,
};
use crate::core::Config;
use crate::core::tasks::{BackgroundTasks, TaskKind};
use crate::db::LedgerStorage;
use crate::services::config_store::ConfigStore;
use crate::services::crypto::SecretCipher;
use crate::services::domain::{DomainServices, EngineService};
use crate::services::registration::{RegistrationOptions, RegistrationService};
use shared::error::{AppError, AppResult, ErrorCode};
use shared::models::{RegistrationCommand, RegistrationStatus};

/// 重启时仍处于 RUNNING 的命令的结果文本
pub const INTERRUPTED_RESULT: &str = "Command interrupted by agent restart";

/// 代理状态 - 持有所有引擎和服务的单例引用
///
/// | 字段 | 说明 |
/// |------|------|
/// | config | 配置项 (不可变) |
/// | ledger | 命令/消息/注册账本 (redb) |
/// | store | 本地 JSON 配置存储 |
/// | registration | 注册状态管理 |
/// | messages | 消息同步引擎 |
/// | command_sync | 命令同步引擎 |
/// | executor | 命令执行器 |
///
/// 使用 Arc 实现浅拷贝。
#[derive(Clone)]
pub struct AgentState {
    pub config: Config,
    pub ledger: LedgerStorage,
    pub store: Arc<ConfigStore>,
    pub registration: Arc<RegistrationService>,
    pub messages: Arc<MessageSyncEngine>,
    pub command_sync: Arc<CommandSyncEngine>,
    pub executor: Arc<CommandExecutor>,
}

impl AgentState {
    /// 初始化代理状态
    ///
    /// 按顺序初始化：
    /// 1. 工作目录
    /// 2. 账本 (work_dir/oibus.redb)
    /// 3. 本地密钥 (work_dir/cipher.key)
    /// 4. 配置存储 (work_dir/oibus.json)
    /// 5. 各引擎
    pub async fn initialize(config: &Config, tasks: &BackgroundTasks) -> AppResult<Self> {
        std::fs::create_dir_all(&config.work_dir).map_err(|e| {
            AppError::with_message(ErrorCode::IoError, format!("Failed to create work directory: {e}"))
        })?;

        let ledger = LedgerStorage::open(config.ledger_path())?;
        let cipher = Arc::new(SecretCipher::load_or_create(config.cipher_key_path())?);
        let store = Arc::new(ConfigStore::open(config.config_store_path(), cipher.clone()).await?);
        let transport: Arc<dyn CloudTransport> = Arc::new(HttpCloudClient::new());

        let registration = Arc::new(RegistrationService::new(
            ledger.clone(),
            cipher,
            transport.clone(),
            store.clone(),
            RegistrationOptions::from(config),
            tasks.shutdown_token(),
        )?);
        let messages = Arc::new(MessageSyncEngine::new(
            ledger.clone(),
            registration.clone(),
            transport.clone(),
            store.clone(),
            MessageOptions::from(config),
        ));

        let executor_trigger = Arc::new(Notify::new());
        let sync_trigger = Arc::new(Notify::new());
        let command_sync = Arc::new(CommandSyncEngine::new(
            ledger.clone(),
            registration.clone(),
            transport.clone(),
            config.http_timeout(),
            sync_trigger.clone(),
            executor_trigger.clone(),
        ));
        let context = ExecutionContext {
            ledger: ledger.clone(),
            registration: registration.clone(),
            services: DomainServices::from_shared(store.clone()),
            messages: messages.clone(),
            transport,
            options: ExecutorOptions::from(config),
        };
        let executor = Arc::new(CommandExecutor::new(
            context,
            Arc::new(ExitTerminator),
            executor_trigger,
            sync_trigger,
        ));

        Ok(Self {
            config: config.clone(),
            ledger,
            store,
            registration,
            messages,
            command_sync,
            executor,
        })
    }

    /// 启动前对账
    ///
    /// - 引擎版本与运行版本不一致时更新
    /// - 上次运行中断的 RUNNING 命令标记为 ERRORED
    /// - 为两类消息各排队一条
    pub async fn reconcile(&self) -> AppResult<()> {
        let engine = self.store.engine_settings().await?;
        if engine.version != self.config.agent_version {
            tracing::info!(
                from = %engine.version,
                to = %self.config.agent_version,
                "Updating engine version"
            );
            self.store
                .update_version(&self.config.agent_version, &self.config.launcher_version)
                .await?;
        }

        let interrupted = self.ledger.fail_running_commands(INTERRUPTED_RESULT)?;
        for id in &interrupted {
            tracing::warn!(command_id = %id, "Command interrupted by previous run marked as errored");
        }

        self.messages.create_all();
        Ok(())
    }

    /// 按 `OIA_HOST` 发起首次注册
    ///
    /// 仅在 NOT_REGISTERED 时生效。激活码写入日志，需在 OIAnalytics 中输入。
    pub async fn bootstrap_registration(&self) -> AppResult<()> {
        let Some(host) = self.config.registration_host.as_deref() else {
            return Ok(());
        };
        let current = self.registration.settings()?;
        if current.status != RegistrationStatus::NotRegistered {
            tracing::debug!(status = %current.status, "Registration already requested, bootstrap skipped");
            return Ok(());
        }

        let settings = self.registration.register(RegistrationCommand::new(host)).await?;
        tracing::info!(
            host = %settings.host,
            activation_code = settings.activation_code.as_deref().unwrap_or_default(),
            expires = settings.activation_expiration_date.as_deref().unwrap_or_default(),
            "Registration requested, enter the activation code in OIAnalytics"
        );
        Ok(())
    }

    /// 启动后台任务
    ///
    /// - 注册检查循环 (仅在 PENDING 时)
    /// - 消息发送循环
    /// - 命令同步 (Periodic)
    /// - 命令执行 (Worker)
    /// - 注册状态日志 (Listener)
    pub fn start_background_tasks(&self, tasks: &mut BackgroundTasks) -> AppResult<()> {
        self.registration.start()?;
        self.messages.start(self.registration.subscribe());

        let sync = self.command_sync.clone();
        let updates = self.registration.subscribe();
        let token = tasks.shutdown_token();
        tasks.spawn("command_sync", TaskKind::Periodic, sync.run(updates, token));

        let executor = self.executor.clone();
        let token = tasks.shutdown_token();
        tasks.spawn("command_executor", TaskKind::Worker, executor.run(token));

        let mut updates = self.registration.subscribe();
        let token = tasks.shutdown_token();
        tasks.spawn("registration_watch", TaskKind::Listener, async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *updates.borrow_and_update();
                        tracing::info!(status = %status, "Registration status changed");
                    }
                }
            }
        });

        tasks.log_summary();
        Ok(())
    }

    /// 停止：先停消息引擎 (有上限)，再停注册检查
    pub async fn shutdown(&self) {
        if !self.messages.stop().await {
            tracing::warn!("Message send still running at shutdown");
        }
        self.registration.stop();
    }
}
