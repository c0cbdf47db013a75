//! Cloud command executor - runs retrieved commands one at a time
//!
//! ```text
//! trigger / poll ─► oldest RETRIEVED
//!                     ├── target version ≠ agent version → ERRORED
//!                     ├── permission denied               → ERRORED
//!                     └── RUNNING → ops::dispatch
//!                           ├── Done(result)      → COMPLETED
//!                           ├── Err(e)            → ERRORED (e.message)
//!                           └── Terminate(result) → COMPLETED, wake sync, grace, exit
//! ```

use shared::models::{Command, CommandFilter, CommandStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::message_sync::MessageSyncEngine;
use super::ops::{self, Completion};
use super::service::CloudTransport;
use crate::core::config::Config;
use crate::core::flight::InFlight;
use crate::db::storage::LedgerStorage;
use crate::services::domain::DomainServices;
use crate::services::registration::RegistrationService;

/// Ends the process so that the launcher restarts it
pub trait ProcessTerminator: Send + Sync {
    fn terminate(&self);
}

/// Exits with status 0
pub struct ExitTerminator;

impl ProcessTerminator for ExitTerminator {
    fn terminate(&self) {
        tracing::info!("Exiting, the launcher restarts OIBus");
        std::process::exit(0);
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub agent_version: String,
    pub ignore_remote_update: bool,
    pub update_dir: PathBuf,
    pub http_timeout: Duration,
    pub download_timeout: Duration,
    /// Wait between the terminal status write and the exit
    pub termination_grace: Duration,
    /// Fallback when no trigger arrives
    pub poll_interval: Duration,
}

impl From<&Config> for ExecutorOptions {
    fn from(config: &Config) -> Self {
        Self {
            agent_version: config.agent_version.clone(),
            ignore_remote_update: config.ignore_remote_update,
            update_dir: config.update_dir(),
            http_timeout: config.http_timeout(),
            download_timeout: config.download_timeout(),
            termination_grace: config.termination_grace(),
            poll_interval: config.execution_poll_interval(),
        }
    }
}

/// Everything a handler may touch
#[derive(Clone)]
pub struct ExecutionContext {
    pub ledger: LedgerStorage,
    pub registration: Arc<RegistrationService>,
    pub services: DomainServices,
    pub messages: Arc<MessageSyncEngine>,
    pub transport: Arc<dyn CloudTransport>,
    pub options: ExecutorOptions,
}

/// Outcome of one execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Busy,
    NotRegistered,
    /// Queue empty
    Idle,
    /// Head command reached a terminal status
    Executed(CommandStatus),
    /// Process termination requested
    Terminated,
}

pub struct CommandExecutor {
    ctx: ExecutionContext,
    terminator: Arc<dyn ProcessTerminator>,
    trigger: Arc<Notify>,
    /// Flushes the ack before a restart
    sync_trigger: Arc<Notify>,
    in_flight: InFlight,
}

impl CommandExecutor {
    pub fn new(
        ctx: ExecutionContext,
        terminator: Arc<dyn ProcessTerminator>,
        trigger: Arc<Notify>,
        sync_trigger: Arc<Notify>,
    ) -> Self {
        Self {
            ctx,
            terminator,
            trigger,
            sync_trigger,
            in_flight: InFlight::new(),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!("Command executor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.trigger.notified() => {}
                _ = tokio::time::sleep(self.ctx.options.poll_interval) => {}
            }

            if let ExecutionOutcome::Executed(_) = self.execute_next().await {
                // Drain the queue without waiting for the poll interval
                self.trigger.notify_one();
            }
        }
        tracing::info!("Command executor stopped");
    }

    /// Execute the oldest RETRIEVED command, if any
    pub async fn execute_next(&self) -> ExecutionOutcome {
        let Some(_guard) = self.in_flight.try_begin() else {
            tracing::debug!("A command is already being executed");
            return ExecutionOutcome::Busy;
        };

        let settings = match self.ctx.registration.settings() {
            Ok(settings) => settings,
            Err(e) => {
                tracing::error!("Error while reading registration settings: {e}");
                return ExecutionOutcome::Idle;
            }
        };
        if !settings.is_registered() {
            tracing::trace!("OIAnalytics not registered, no command executed");
            return ExecutionOutcome::NotRegistered;
        }

        let command = match self
            .ctx
            .ledger
            .list_commands(&CommandFilter::with_status(&[CommandStatus::Retrieved]))
        {
            Ok(commands) => match commands.into_iter().next() {
                Some(command) => command,
                None => {
                    tracing::trace!("No command to execute");
                    return ExecutionOutcome::Idle;
                }
            },
            Err(e) => {
                tracing::error!("Error while listing commands: {e}");
                return ExecutionOutcome::Idle;
            }
        };

        let command_type = command.command_type();
        if command.target_version != self.ctx.options.agent_version {
            let result = format!(
                "Wrong target version: {} for OIBus version {}",
                command.target_version, self.ctx.options.agent_version
            );
            tracing::warn!(command_id = %command.id, "{result}");
            return self.fail(&command, &result);
        }
        if !settings.command_permissions.allows(command_type) {
            let result = format!("Command {} of type {} is not authorized", command.id, command_type);
            tracing::warn!(command_id = %command.id, "{result}");
            return self.fail(&command, &result);
        }

        if let Err(e) = self.ctx.ledger.mark_command_running(&command.id) {
            tracing::error!(command_id = %command.id, "Error while starting command: {e}");
            return ExecutionOutcome::Idle;
        }
        tracing::info!(command_id = %command.id, command_type = %command_type, "Executing command");

        match ops::dispatch(&self.ctx, &command).await {
            Ok(Completion::Done(result)) => {
                if let Err(e) = self.ctx.ledger.mark_command_completed(&command.id, &result) {
                    tracing::error!(command_id = %command.id, "Error while completing command: {e}");
                }
                tracing::info!(command_id = %command.id, command_type = %command_type, "{result}");
                ExecutionOutcome::Executed(CommandStatus::Completed)
            }
            Ok(Completion::Terminate(result)) => {
                self.terminate(&command, &result).await;
                ExecutionOutcome::Terminated
            }
            Err(e) => {
                tracing::error!(command_id = %command.id, command_type = %command_type, "Command failed: {e}");
                self.fail(&command, &e.message)
            }
        }
    }

    /// 写入失败时返回 Idle，不再唤醒自身
    fn fail(&self, command: &Command, result: &str) -> ExecutionOutcome {
        match self.ctx.ledger.mark_command_errored(&command.id, result) {
            Ok(_) => ExecutionOutcome::Executed(CommandStatus::Errored),
            Err(e) => {
                tracing::error!(command_id = %command.id, "Error while marking command errored: {e}");
                ExecutionOutcome::Idle
            }
        }
    }

    /// Persist the result, give the ack a chance to flush, then exit
    async fn terminate(&self, command: &Command, result: &str) {
        match self.ctx.ledger.mark_command_completed(&command.id, result) {
            Ok(_) => tracing::info!(command_id = %command.id, "{result}"),
            Err(e) => tracing::error!(command_id = %command.id, "Error while completing command before exit: {e}"),
        }
        self.sync_trigger.notify_one();
        tokio::time::sleep(self.ctx.options.termination_grace).await;
        self.terminator.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingTerminator, TestAgent, remote_command};
    use shared::models::{CommandPayload, CommandPermissions, MessageType, RegistrationIntervals};

    fn permissions_without_restart() -> CommandPermissions {
        let mut permissions = CommandPermissions::all();
        permissions.restart_engine = false;
        permissions
    }

    #[tokio::test]
    async fn test_not_registered_executes_nothing() {
        let agent = TestAgent::new();
        agent.ledger.create_command(&remote_command("c1", CommandPayload::RegenerateCipherKeys)).unwrap();
        assert_eq!(agent.executor.execute_next().await, ExecutionOutcome::NotRegistered);
        assert_eq!(agent.ledger.get_command("c1").unwrap().unwrap().status, CommandStatus::Retrieved);
    }

    #[tokio::test]
    async fn test_busy_is_coalesced() {
        let agent = TestAgent::registered();
        let _held = agent.executor.in_flight.try_begin().unwrap();
        assert_eq!(agent.executor.execute_next().await, ExecutionOutcome::Busy);
    }

    #[tokio::test]
    async fn test_empty_queue_is_idle() {
        let agent = TestAgent::registered();
        assert_eq!(agent.executor.execute_next().await, ExecutionOutcome::Idle);
    }

    #[tokio::test]
    async fn test_wrong_target_version_never_runs() {
        let agent = TestAgent::registered();
        let mut command = remote_command("c1", CommandPayload::RegenerateCipherKeys);
        command.target_version = "9.9.9".to_string();
        agent.ledger.create_command(&command).unwrap();
        let keys_before = agent.ledger.get_registration().unwrap().public_cipher_key;

        assert_eq!(
            agent.executor.execute_next().await,
            ExecutionOutcome::Executed(CommandStatus::Errored)
        );
        let stored = agent.ledger.get_command("c1").unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Errored);
        assert_eq!(stored.result.as_deref(), Some("Wrong target version: 9.9.9 for OIBus version 3.4.0"));
        assert_eq!(agent.ledger.get_registration().unwrap().public_cipher_key, keys_before);
        assert!(agent.pending_messages().is_empty());
    }

    #[tokio::test]
    async fn test_failed_error_write_is_idle() {
        let agent = TestAgent::registered();
        agent.ledger.create_command(&remote_command("c1", CommandPayload::RestartEngine)).unwrap();
        agent.ledger.mark_command_errored("c1", "first").unwrap();
        let stale = agent.ledger.get_command("c1").unwrap().unwrap();

        // ERRORED -> ERRORED is refused by the ledger
        assert_eq!(agent.executor.fail(&stale, "second"), ExecutionOutcome::Idle);
        let stored = agent.ledger.get_command("c1").unwrap().unwrap();
        assert_eq!(stored.result.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let agent = TestAgent::registered();
        agent
            .ledger
            .modify_registration(|s| s.command_permissions = permissions_without_restart())
            .unwrap();
        agent.ledger.create_command(&remote_command("c1", CommandPayload::RestartEngine)).unwrap();

        agent.executor.execute_next().await;
        let stored = agent.ledger.get_command("c1").unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Errored);
        assert_eq!(stored.result.as_deref(), Some("Command c1 of type restart-engine is not authorized"));
        assert_eq!(agent.terminator.calls(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_command() {
        let agent = TestAgent::registered();
        agent.ledger.create_command(&remote_command("c1", CommandPayload::Unsupported)).unwrap();

        agent.executor.execute_next().await;
        let stored = agent.ledger.get_command("c1").unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Errored);
        assert_eq!(stored.result.as_deref(), Some("Command c1 of type unsupported is not supported"));
    }

    #[tokio::test]
    async fn test_oldest_first_and_handler_error() {
        let agent = TestAgent::registered();
        agent
            .ledger
            .create_command(&remote_command(
                "c1",
                CommandPayload::DeleteScanMode {
                    scan_mode_id: "missing".to_string(),
                },
            ))
            .unwrap();
        agent
            .ledger
            .create_command(&remote_command(
                "c2",
                CommandPayload::UpdateRegistrationSettings {
                    command_content: RegistrationIntervals {
                        command_refresh_interval: 60,
                        command_retry_interval: 5,
                        message_retry_interval: 10,
                    },
                },
            ))
            .unwrap();

        assert_eq!(
            agent.executor.execute_next().await,
            ExecutionOutcome::Executed(CommandStatus::Errored)
        );
        assert_eq!(agent.ledger.get_command("c2").unwrap().unwrap().status, CommandStatus::Retrieved);
        let c1 = agent.ledger.get_command("c1").unwrap().unwrap();
        assert_eq!(c1.result.as_deref(), Some("Scan mode missing not found"));

        assert_eq!(
            agent.executor.execute_next().await,
            ExecutionOutcome::Executed(CommandStatus::Completed)
        );
        let c2 = agent.ledger.get_command("c2").unwrap().unwrap();
        assert_eq!(c2.status, CommandStatus::Completed);
        assert_eq!(c2.result.as_deref(), Some("Registration settings updated successfully"));
        assert!(!c2.ack);
        assert_eq!(agent.ledger.get_registration().unwrap().intervals.command_refresh_interval, 60);
    }

    #[tokio::test]
    async fn test_regenerate_keys_creates_full_config() {
        let agent = TestAgent::registered();
        agent.ledger.create_command(&remote_command("c1", CommandPayload::RegenerateCipherKeys)).unwrap();

        agent.executor.execute_next().await;
        let stored = agent.ledger.get_command("c1").unwrap().unwrap();
        assert_eq!(stored.result.as_deref(), Some("OIAnalytics keys reloaded"));
        assert_eq!(agent.pending_messages(), vec![MessageType::FullConfig]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_flushes_then_terminates() {
        let agent = TestAgent::registered();
        agent.ledger.create_command(&remote_command("c1", CommandPayload::RestartEngine)).unwrap();

        let executor = agent.executor.clone();
        let run = tokio::spawn(async move { executor.execute_next().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let stored = agent.ledger.get_command("c1").unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Completed);
        assert_eq!(stored.result.as_deref(), Some("OIBus restarted"));
        assert_eq!(agent.terminator.calls(), 0);

        // the sync engine was asked for an early ack
        agent.command_sync.check_commands().await;
        assert!(agent.ledger.get_command("c1").unwrap().unwrap().ack);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(run.await.unwrap(), ExecutionOutcome::Terminated);
        assert_eq!(agent.terminator.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_drains_queue() {
        let agent = TestAgent::registered();
        for id in ["c1", "c2", "c3"] {
            agent
                .ledger
                .create_command(&remote_command(
                    id,
                    CommandPayload::UpdateEngineSettings {
                        command_content: serde_json::json!({ "name": id }),
                    },
                ))
                .unwrap();
        }
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(agent.executor.clone().run(shutdown.clone()));

        agent.executor_trigger.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let completed = agent
            .ledger
            .list_commands(&CommandFilter::with_status(&[CommandStatus::Completed]))
            .unwrap();
        assert_eq!(completed.len(), 3);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_recording_terminator() {
        let terminator = RecordingTerminator::default();
        terminator.terminate();
        assert_eq!(terminator.calls(), 1);
    }
}
