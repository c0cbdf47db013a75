//! CommandSyncEngine - periodic command retrieval
//!
//! One cycle, in order:
//! 1. cancellation check of local RETRIEVED commands
//! 2. retrieval of pending commands
//! 3. acknowledgment of every unacknowledged status (runs whatever 1 and 2 gave)
//!
//! Success reschedules at the refresh interval and wakes the executor; a
//! failure of 1 or 2 reschedules at the retry interval.

use shared::error::AppResult;
use shared::models::{CommandFilter, CommandStatus, CommandStatusUpdate, RegistrationStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use super::registration_updated;
use super::service::{CloudTransport, ConnectionContext};
use crate::core::flight::InFlight;
use crate::db::storage::LedgerStorage;
use crate::services::registration::RegistrationService;

/// Outcome of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A cycle was already running
    Skipped,
    NotRegistered,
    Succeeded,
    Failed,
}

pub struct CommandSyncEngine {
    ledger: LedgerStorage,
    registration: Arc<RegistrationService>,
    transport: Arc<dyn CloudTransport>,
    http_timeout: Duration,
    in_flight: InFlight,
    /// Immediate cycle request (e.g. flush an ack before a restart)
    trigger: Arc<Notify>,
    /// Wakes the executor after a successful retrieval
    executor_trigger: Arc<Notify>,
}

impl CommandSyncEngine {
    pub fn new(
        ledger: LedgerStorage,
        registration: Arc<RegistrationService>,
        transport: Arc<dyn CloudTransport>,
        http_timeout: Duration,
        trigger: Arc<Notify>,
        executor_trigger: Arc<Notify>,
    ) -> Self {
        Self {
            ledger,
            registration,
            transport,
            http_timeout,
            in_flight: InFlight::new(),
            trigger,
            executor_trigger,
        }
    }

    pub async fn run(self: Arc<Self>, mut updates: watch::Receiver<RegistrationStatus>, shutdown: CancellationToken) {
        tracing::info!("Command sync started");
        loop {
            let outcome = self.check_commands().await;
            let delay = self.next_delay(outcome);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.trigger.notified() => {}
                status = registration_updated(&mut updates) => {
                    tracing::debug!(status = %status, "Registration updated, checking commands");
                }
            }
        }
        tracing::info!("Command sync stopped");
    }

    fn next_delay(&self, outcome: CycleOutcome) -> Duration {
        let intervals = match self.registration.settings() {
            Ok(settings) => settings.intervals,
            Err(_) => Default::default(),
        };
        let secs = match outcome {
            CycleOutcome::Failed => intervals.command_retry_interval,
            _ => intervals.command_refresh_interval,
        };
        Duration::from_secs(secs.max(1))
    }

    /// Run one cycle
    pub async fn check_commands(&self) -> CycleOutcome {
        let Some(_guard) = self.in_flight.try_begin() else {
            tracing::debug!("OIBus is already retrieving commands from OIAnalytics");
            return CycleOutcome::Skipped;
        };

        let settings = match self.registration.settings() {
            Ok(settings) => settings,
            Err(e) => {
                tracing::error!("Error while reading registration settings: {e}");
                return CycleOutcome::Failed;
            }
        };
        if !settings.is_registered() {
            tracing::debug!("OIAnalytics not registered. OIBus won't retrieve commands");
            return CycleOutcome::NotRegistered;
        }
        let ctx = match self.registration.connection_context(self.http_timeout) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!("Error while building the cloud connection: {e}");
                return CycleOutcome::Failed;
            }
        };

        let fetched = match self.check_cancellation(&ctx).await {
            Ok(()) => self.retrieve(&ctx).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &fetched {
            tracing::error!("Error while retrieving commands: {e}");
        }

        self.acknowledge(&ctx).await;

        match fetched {
            Ok(()) => {
                self.executor_trigger.notify_one();
                CycleOutcome::Succeeded
            }
            Err(_) => CycleOutcome::Failed,
        }
    }

    async fn check_cancellation(&self, ctx: &ConnectionContext) -> AppResult<()> {
        let retrieved = self
            .ledger
            .list_commands(&CommandFilter::with_status(&[CommandStatus::Retrieved]))?;
        if retrieved.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = retrieved.into_iter().map(|c| c.id).collect();
        let cancelled = self.transport.get_commands_by_ids(ctx, &ids).await?;
        for reference in cancelled {
            if self.ledger.mark_command_cancelled(&reference.id)? {
                tracing::info!(command_id = %reference.id, "Command cancelled by OIAnalytics");
            }
        }
        Ok(())
    }

    async fn retrieve(&self, ctx: &ConnectionContext) -> AppResult<()> {
        let commands = self.transport.get_pending_commands(ctx).await?;
        let mut created = 0usize;
        for command in &commands {
            if self.ledger.create_command(command)? {
                tracing::debug!(command_id = %command.id, command_type = %command.payload.command_type(), "Command retrieved");
                created += 1;
            }
        }
        if created > 0 {
            tracing::info!(count = created, "Commands retrieved from OIAnalytics");
        } else {
            tracing::trace!("No command retrieved");
        }
        Ok(())
    }

    async fn acknowledge(&self, ctx: &ConnectionContext) {
        let unacknowledged = match self.ledger.list_commands(&CommandFilter::unacknowledged()) {
            Ok(commands) => commands,
            Err(e) => {
                tracing::error!("Error while listing commands to ack: {e}");
                return;
            }
        };
        if unacknowledged.is_empty() {
            tracing::trace!("No command to ack");
            return;
        }

        let updates: Vec<CommandStatusUpdate> = unacknowledged.iter().map(CommandStatusUpdate::from).collect();
        if let Err(e) = self.transport.push_command_status(ctx, &updates).await {
            tracing::error!("Error while acknowledging commands: {e}");
            return;
        }
        match self.ledger.mark_commands_acknowledged(&updates) {
            Ok(count) => tracing::debug!(count, "Commands acknowledged"),
            Err(e) => tracing::error!("Error while marking commands acknowledged: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Failure, Op, TestAgent, remote_command};
    use shared::models::{CommandPayload, RemoteCommand};

    #[tokio::test]
    async fn test_not_registered_makes_no_call() {
        let agent = TestAgent::new();
        assert_eq!(agent.command_sync.check_commands().await, CycleOutcome::NotRegistered);
        assert_eq!(agent.transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_skipped() {
        let agent = TestAgent::registered();
        let _held = agent.command_sync.in_flight.try_begin().unwrap();
        assert_eq!(agent.command_sync.check_commands().await, CycleOutcome::Skipped);
        assert_eq!(agent.transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_cycle_retrieves_and_acks() {
        let agent = TestAgent::registered();
        agent.transport.set_pending_commands(vec![
            remote_command("c1", CommandPayload::RestartEngine),
            remote_command("c2", CommandPayload::RegenerateCipherKeys),
        ]);

        assert_eq!(agent.command_sync.check_commands().await, CycleOutcome::Succeeded);
        // nothing RETRIEVED before retrieval, so no cancellation call
        assert_eq!(agent.transport.count(Op::CommandsByIds), 0);
        assert_eq!(agent.transport.count(Op::PendingCommands), 1);

        let pushed = agent.transport.pushed_statuses();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].len(), 2);
        assert!(pushed[0].iter().all(|u| u.status == CommandStatus::Retrieved));
        let unacked = agent.ledger.list_commands(&CommandFilter::unacknowledged()).unwrap();
        assert!(unacked.is_empty());

        // Same batch again: idempotent on the cloud id, nothing new to ack
        assert_eq!(agent.command_sync.check_commands().await, CycleOutcome::Succeeded);
        assert_eq!(agent.ledger.list_commands(&CommandFilter::default()).unwrap().len(), 2);
        assert_eq!(agent.transport.count(Op::PushStatus), 1);
        assert_eq!(agent.transport.last_ids_query(), Some(vec!["c1".to_string(), "c2".to_string()]));
    }

    #[tokio::test]
    async fn test_unreadable_command_is_acked_as_errored() {
        let agent = TestAgent::registered();
        agent.transport.set_pending_commands(vec![
            remote_command("c1", CommandPayload::RestartEngine),
            RemoteCommand::rejected("c2", "3.4.0", "Invalid command: missing field `type`"),
        ]);

        assert_eq!(agent.command_sync.check_commands().await, CycleOutcome::Succeeded);

        let pushed = agent.transport.pushed_statuses();
        assert_eq!(pushed.len(), 1);
        let c2 = pushed[0].iter().find(|u| u.id == "c2").unwrap();
        assert_eq!(c2.status, CommandStatus::Errored);
        assert_eq!(c2.result.as_deref(), Some("Invalid command: missing field `type`"));
        assert!(agent.ledger.list_commands(&CommandFilter::unacknowledged()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_marks_retrieved_commands() {
        let agent = TestAgent::registered();
        agent.ledger.create_command(&remote_command("c1", CommandPayload::RestartEngine)).unwrap();
        agent.ledger.create_command(&remote_command("c2", CommandPayload::RestartEngine)).unwrap();
        agent.transport.set_cancelled_ids(vec!["c2".to_string()]);

        assert_eq!(agent.command_sync.check_commands().await, CycleOutcome::Succeeded);
        let c2 = agent.ledger.get_command("c2").unwrap().unwrap();
        assert_eq!(c2.status, CommandStatus::Cancelled);
        let c1 = agent.ledger.get_command("c1").unwrap().unwrap();
        assert_eq!(c1.status, CommandStatus::Retrieved);

        let pushed = agent.transport.pushed_statuses();
        assert!(pushed[0].iter().any(|u| u.id == "c2" && u.status == CommandStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_cancellation_failure_skips_retrieval_but_acks() {
        let agent = TestAgent::registered();
        agent.ledger.create_command(&remote_command("c1", CommandPayload::RestartEngine)).unwrap();
        agent.transport.fail_next(Op::CommandsByIds, Failure::Network("timeout"));

        assert_eq!(agent.command_sync.check_commands().await, CycleOutcome::Failed);
        assert_eq!(agent.transport.count(Op::PendingCommands), 0);
        assert_eq!(agent.transport.count(Op::PushStatus), 1);
        assert!(agent.ledger.get_command("c1").unwrap().unwrap().ack);
    }

    #[tokio::test]
    async fn test_ack_failure_is_not_fatal() {
        let agent = TestAgent::registered();
        agent.transport.set_pending_commands(vec![remote_command("c1", CommandPayload::RestartEngine)]);
        agent.transport.fail_next(Op::PushStatus, Failure::Status(500, "Internal Server Error"));

        assert_eq!(agent.command_sync.check_commands().await, CycleOutcome::Succeeded);
        assert!(!agent.ledger.get_command("c1").unwrap().unwrap().ack);

        agent.command_sync.check_commands().await;
        assert!(agent.ledger.get_command("c1").unwrap().unwrap().ack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_update_triggers_cycle() {
        let agent = TestAgent::new();
        let shutdown = CancellationToken::new();
        let engine = agent.command_sync.clone();
        let task = tokio::spawn(engine.run(agent.registration.subscribe(), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(agent.transport.count(Op::PendingCommands), 0);

        agent.register();
        agent.registration.update_intervals(Default::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(agent.transport.count(Op::PendingCommands), 1);

        // then every refresh interval
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(agent.transport.count(Op::PendingCommands), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reschedules_at_retry_interval() {
        let agent = TestAgent::registered();
        agent.transport.fail_next(Op::PendingCommands, Failure::Network("unreachable"));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(agent.command_sync.clone().run(agent.registration.subscribe(), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(agent.transport.count(Op::PendingCommands), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(agent.transport.count(Op::PendingCommands), 2);

        shutdown.cancel();
        task.await.unwrap();
    }
}
