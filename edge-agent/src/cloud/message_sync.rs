//! MessageSyncEngine - outbound configuration messages
//!
//! ```text
//! create_message(type) ──► ledger (one PENDING per type) ──► trigger
//!                                                              │
//! send loop: oldest PENDING → build payload → PUT ─────────────┘
//!   ├── ok           → COMPLETED, next after pacing delay
//!   ├── Bad Request  → ERRORED, dropped
//!   └── other error  → stays PENDING, retried after the retry interval
//!                      (triggers are ignored while the retry is armed)
//! ```

use serde_json::Value;
use shared::error::{AppError, AppResult, ErrorCode};
use shared::models::{Message, MessageFilter, MessageType, RegistrationSettings, RegistrationStatus};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::payload;
use super::registration_updated;
use super::service::CloudTransport;
use crate::core::config::Config;
use crate::core::flight::InFlight;
use crate::db::storage::LedgerStorage;
use crate::services::domain::ConfigSnapshotSource;
use crate::services::registration::RegistrationService;

/// Marker of an error the cloud will reject again on retry
const TERMINAL_ERROR_MARKER: &str = "Bad Request";

#[derive(Debug, Clone)]
pub struct MessageOptions {
    pub http_timeout: Duration,
    /// Delay between two successful sends
    pub pacing: Duration,
    /// Upper bound on waiting for an in-flight send at stop
    pub stop_timeout: Duration,
}

impl From<&Config> for MessageOptions {
    fn from(config: &Config) -> Self {
        Self {
            http_timeout: config.http_timeout(),
            pacing: config.message_pacing(),
            stop_timeout: config.shutdown_timeout(),
        }
    }
}

/// Outcome of one send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another run is in flight
    Busy,
    NotRegistered,
    /// Nothing pending
    Idle,
    Sent,
    /// Terminal failure, message ERRORED
    Dropped,
    /// Transient failure, same message retried after the delay
    Retry(Duration),
}

pub struct MessageSyncEngine {
    ledger: LedgerStorage,
    registration: Arc<RegistrationService>,
    transport: Arc<dyn CloudTransport>,
    snapshots: Arc<dyn ConfigSnapshotSource>,
    options: MessageOptions,
    trigger: Notify,
    in_flight: InFlight,
    stop: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MessageSyncEngine {
    pub fn new(
        ledger: LedgerStorage,
        registration: Arc<RegistrationService>,
        transport: Arc<dyn CloudTransport>,
        snapshots: Arc<dyn ConfigSnapshotSource>,
        options: MessageOptions,
    ) -> Self {
        Self {
            ledger,
            registration,
            transport,
            snapshots,
            options,
            trigger: Notify::new(),
            in_flight: InFlight::new(),
            stop: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Queue a message unless one of the same type is already pending
    pub fn create_message(&self, message_type: MessageType) -> AppResult<Option<Message>> {
        let settings = self.registration.settings()?;
        if !settings.is_registered() {
            tracing::debug!(message_type = %message_type, "OIAnalytics not registered, message not created");
            return Ok(None);
        }
        let created = self.ledger.create_message(message_type)?;
        match &created {
            Some(message) => {
                tracing::debug!(message_id = %message.id, message_type = %message_type, "Message created");
                self.trigger.notify_one();
            }
            None => {
                tracing::trace!(message_type = %message_type, "Message already pending");
            }
        }
        Ok(created)
    }

    /// Queue both message types
    pub fn create_all(&self) {
        for message_type in [MessageType::FullConfig, MessageType::HistoryQueries] {
            if let Err(e) = self.create_message(message_type) {
                tracing::error!(message_type = %message_type, "Error while creating message: {e}");
            }
        }
    }

    /// Ask the send loop for a run
    pub fn wake(&self) {
        self.trigger.notify_one();
    }

    /// Spawn the send loop
    pub fn start(self: &Arc<Self>, updates: watch::Receiver<RegistrationStatus>) {
        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let engine = Arc::clone(self);
        *slot = Some(tokio::spawn(engine.run_loop(updates)));
        // Messages left pending by a previous run
        self.trigger.notify_one();
    }

    /// Detach the trigger, then wait for an in-flight send, bounded by the stop timeout
    ///
    /// Returns `false` when the send was still running at the deadline; it is
    /// left to finish on its own.
    pub async fn stop(&self) -> bool {
        self.stop.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return true;
        };
        match tokio::time::timeout(self.options.stop_timeout, handle).await {
            Ok(_) => {
                tracing::debug!("Message engine stopped");
                true
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.options.stop_timeout.as_millis() as u64,
                    "Message send still in flight at stop, not waiting any longer"
                );
                false
            }
        }
    }

    async fn run_loop(self: Arc<Self>, mut updates: watch::Receiver<RegistrationStatus>) {
        let mut wake_at: Option<Instant> = None;
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep_until(wake_at.unwrap_or_else(Instant::now)), if wake_at.is_some() => {}
                _ = self.trigger.notified(), if wake_at.is_none() => {}
                status = registration_updated(&mut updates) => {
                    if status == RegistrationStatus::Registered {
                        self.create_all();
                    }
                    continue;
                }
            }

            wake_at = match self.run().await {
                RunOutcome::Sent | RunOutcome::Dropped => Some(Instant::now() + self.options.pacing),
                RunOutcome::Retry(delay) => Some(Instant::now() + delay),
                RunOutcome::Busy | RunOutcome::NotRegistered | RunOutcome::Idle => None,
            };
        }
    }

    /// Send the oldest pending message once
    pub async fn run(&self) -> RunOutcome {
        let Some(_guard) = self.in_flight.try_begin() else {
            tracing::trace!("A message is already being sent");
            return RunOutcome::Busy;
        };

        let settings = match self.registration.settings() {
            Ok(settings) => settings,
            Err(e) => {
                tracing::error!("Error while reading registration settings: {e}");
                return RunOutcome::Idle;
            }
        };
        if !settings.is_registered() {
            tracing::debug!("OIAnalytics not registered, no message sent");
            return RunOutcome::NotRegistered;
        }

        let message = match self.ledger.list_messages(&MessageFilter::pending()) {
            Ok(messages) => match messages.into_iter().next() {
                Some(message) => message,
                None => return RunOutcome::Idle,
            },
            Err(e) => {
                tracing::error!("Error while listing messages: {e}");
                return RunOutcome::Idle;
            }
        };

        match self.send(&message, &settings).await {
            Ok(()) => {
                if let Err(e) = self.ledger.mark_message_completed(&message.id) {
                    tracing::error!(message_id = %message.id, "Error while completing message: {e}");
                }
                tracing::debug!(message_id = %message.id, message_type = %message.message_type, "Message sent");
                RunOutcome::Sent
            }
            Err(e) if e.message.contains(TERMINAL_ERROR_MARKER) => {
                tracing::error!(
                    message_id = %message.id,
                    message_type = %message.message_type,
                    "Message rejected, not retrying: {e}"
                );
                if let Err(e) = self.ledger.mark_message_errored(&message.id, &e.message) {
                    tracing::error!(message_id = %message.id, "Error while marking message errored: {e}");
                }
                RunOutcome::Dropped
            }
            Err(e) => {
                let delay = Duration::from_secs(settings.intervals.message_retry_interval);
                tracing::warn!(
                    message_id = %message.id,
                    message_type = %message.message_type,
                    retry_secs = delay.as_secs(),
                    "Error while sending message: {e}"
                );
                RunOutcome::Retry(delay)
            }
        }
    }

    async fn send(&self, message: &Message, settings: &RegistrationSettings) -> AppResult<()> {
        let body = self.build_payload(message.message_type, settings).await?;
        let ctx = self.registration.connection_context(self.options.http_timeout)?;
        self.transport
            .send_message(&ctx, message.message_type, &body)
            .await?;
        Ok(())
    }

    async fn build_payload(&self, message_type: MessageType, settings: &RegistrationSettings) -> AppResult<Value> {
        let value = match message_type {
            MessageType::FullConfig => {
                let snapshot = self.snapshots.snapshot().await?;
                let body = payload::full_config(
                    &snapshot,
                    self.snapshots.as_ref(),
                    settings.public_cipher_key.clone(),
                )?;
                serde_json::to_value(body)
            }
            MessageType::HistoryQueries => {
                let queries = self.snapshots.history_queries().await?;
                serde_json::to_value(payload::history_queries(&queries, self.snapshots.as_ref())?)
            }
        };
        value.map_err(|e| {
            AppError::with_message(
                ErrorCode::MessagePayloadFailed,
                format!("Failed to serialize {message_type} payload: {e}"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Failure, Op, TestAgent};
    use shared::models::MessageStatus;

    fn statuses(agent: &TestAgent) -> Vec<(MessageType, MessageStatus)> {
        agent
            .ledger
            .list_messages(&MessageFilter::default())
            .unwrap()
            .into_iter()
            .map(|m| (m.message_type, m.status))
            .collect()
    }

    #[tokio::test]
    async fn test_creation_skipped_when_not_registered() {
        let agent = TestAgent::new();
        assert!(agent.messages.create_message(MessageType::FullConfig).unwrap().is_none());
        assert!(statuses(&agent).is_empty());
    }

    #[tokio::test]
    async fn test_creation_is_idempotent_per_type() {
        let agent = TestAgent::registered();
        assert!(agent.messages.create_message(MessageType::FullConfig).unwrap().is_some());
        assert!(agent.messages.create_message(MessageType::FullConfig).unwrap().is_none());
        assert!(agent.messages.create_message(MessageType::HistoryQueries).unwrap().is_some());
        assert_eq!(statuses(&agent).len(), 2);
    }

    #[tokio::test]
    async fn test_run_sends_oldest_first() {
        let agent = TestAgent::registered();
        agent.messages.create_message(MessageType::HistoryQueries).unwrap();
        agent.messages.create_message(MessageType::FullConfig).unwrap();

        assert_eq!(agent.messages.run().await, RunOutcome::Sent);
        assert_eq!(agent.messages.run().await, RunOutcome::Sent);
        assert_eq!(agent.messages.run().await, RunOutcome::Idle);
        assert_eq!(
            agent.transport.sent_messages(),
            vec![MessageType::HistoryQueries, MessageType::FullConfig]
        );
        assert!(statuses(&agent).iter().all(|(_, s)| *s == MessageStatus::Completed));

        // A completed message no longer blocks creation
        assert!(agent.messages.create_message(MessageType::FullConfig).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bad_request_is_terminal() {
        let agent = TestAgent::registered();
        agent.transport.fail_next(Op::SendMessage, Failure::Status(400, "Bad Request"));
        agent.messages.create_message(MessageType::FullConfig).unwrap();

        assert_eq!(agent.messages.run().await, RunOutcome::Dropped);
        let message = &agent.ledger.list_messages(&MessageFilter::default()).unwrap()[0];
        assert_eq!(message.status, MessageStatus::Errored);
        assert_eq!(message.error.as_deref(), Some("400 - Bad Request"));
        assert_eq!(agent.messages.run().await, RunOutcome::Idle);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_message_pending() {
        let agent = TestAgent::registered();
        agent.transport.fail_next(Op::SendMessage, Failure::Status(503, "Service Unavailable"));
        agent.messages.create_message(MessageType::FullConfig).unwrap();

        assert_eq!(agent.messages.run().await, RunOutcome::Retry(Duration::from_secs(10)));
        assert_eq!(statuses(&agent), vec![(MessageType::FullConfig, MessageStatus::Pending)]);
        assert_eq!(agent.messages.run().await, RunOutcome::Sent);
        assert_eq!(statuses(&agent), vec![(MessageType::FullConfig, MessageStatus::Completed)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timer_ignores_triggers() {
        let agent = TestAgent::registered();
        agent.transport.fail_next(Op::SendMessage, Failure::Network("connection reset"));
        agent.messages.create_message(MessageType::FullConfig).unwrap();
        agent.messages.start(agent.registration.subscribe());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(agent.transport.count(Op::SendMessage), 1);

        agent.messages.wake();
        agent.messages.create_message(MessageType::HistoryQueries).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(agent.transport.count(Op::SendMessage), 1);

        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(agent.transport.count(Op::SendMessage), 2);
        assert_eq!(agent.transport.sent_messages()[0], MessageType::FullConfig);

        // history-queries follows after the pacing delay
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(agent.transport.count(Op::SendMessage), 3);
        assert!(agent.messages.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_update_creates_messages() {
        let agent = TestAgent::registered();
        agent.messages.start(agent.registration.subscribe());
        agent.registration.update_intervals(Default::default()).unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(agent.transport.count(Op::SendMessage), 2);
        assert!(agent.messages.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_bounded() {
        let agent = TestAgent::registered();
        agent.transport.delay_sends(Duration::from_secs(120));
        agent.messages.create_message(MessageType::FullConfig).unwrap();
        agent.messages.start(agent.registration.subscribe());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(agent.transport.count(Op::SendMessage), 1);

        let started = Instant::now();
        assert!(!agent.messages.stop().await);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_send() {
        let agent = TestAgent::registered();
        agent.transport.delay_sends(Duration::from_secs(2));
        agent.messages.create_message(MessageType::FullConfig).unwrap();
        agent.messages.start(agent.registration.subscribe());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(agent.messages.stop().await);
        assert_eq!(statuses(&agent), vec![(MessageType::FullConfig, MessageStatus::Completed)]);
    }
}
