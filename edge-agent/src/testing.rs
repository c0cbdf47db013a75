//! Test doubles shared by the unit tests
//!
//! [`FakeTransport`] scripts cloud answers and records every call;
//! [`TestAgent`] wires the engines over an in-memory ledger and config store.

use async_trait::async_trait;
use serde_json::Value;
use shared::cloud::{RegistrationCheck, RegistrationRequest, RegistrationResponse};
use shared::models::{
    CommandPayload, CommandStatusUpdate, MessageFilter, MessageType, RegistrationStatus, RemoteCommand,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::cloud::command_executor::{CommandExecutor, ExecutionContext, ExecutorOptions, ProcessTerminator};
use crate::cloud::command_sync::CommandSyncEngine;
use crate::cloud::message_sync::{MessageOptions, MessageSyncEngine};
use crate::cloud::service::{CloudTransport, CommandReference, ConnectionContext, TransportError, TransportResult};
use crate::db::storage::LedgerStorage;
use crate::services::config_store::ConfigStore;
use crate::services::crypto::{KeyPair, SecretCipher, encrypt_with_public_key};
use crate::services::domain::DomainServices;
use crate::services::registration::{RegistrationOptions, RegistrationService};

pub const AGENT_VERSION: &str = "3.4.0";

/// Transport operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    PendingCommands,
    CommandsByIds,
    PushStatus,
    Register,
    CheckRegistration,
    SendMessage,
    Download,
}

/// Scripted failure
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Status(u16, &'static str),
    Network(&'static str),
}

impl From<Failure> for TransportError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Status(status, reason) => TransportError::Status {
                status,
                reason: reason.to_string(),
            },
            Failure::Network(message) => TransportError::Network(message.to_string()),
        }
    }
}

#[derive(Default)]
struct Script {
    pending_commands: Vec<RemoteCommand>,
    cancelled_ids: Vec<String>,
    register_response: Option<RegistrationResponse>,
    registration_check: Option<RegistrationCheck>,
    fail_always: HashMap<Op, Failure>,
    fail_next: HashMap<Op, Failure>,
    send_delay: Option<Duration>,
    check_delay: Option<Duration>,
}

#[derive(Default)]
struct Journal {
    calls: HashMap<Op, usize>,
    register_requests: Vec<RegistrationRequest>,
    pushed: Vec<Vec<CommandStatusUpdate>>,
    sent: Vec<MessageType>,
    ids_queries: Vec<Vec<String>>,
}

/// In-memory [`CloudTransport`]
#[derive(Default)]
pub struct FakeTransport {
    script: Mutex<Script>,
    journal: Mutex<Journal>,
}

impl FakeTransport {
    pub fn set_pending_commands(&self, commands: Vec<RemoteCommand>) {
        self.script.lock().unwrap().pending_commands = commands;
    }

    pub fn set_cancelled_ids(&self, ids: Vec<String>) {
        self.script.lock().unwrap().cancelled_ids = ids;
    }

    pub fn set_register_response(&self, response: RegistrationResponse) {
        self.script.lock().unwrap().register_response = Some(response);
    }

    pub fn set_registration_check(&self, check: RegistrationCheck) {
        self.script.lock().unwrap().registration_check = Some(check);
    }

    pub fn fail_always(&self, op: Op, failure: Failure) {
        self.script.lock().unwrap().fail_always.insert(op, failure);
    }

    pub fn fail_next(&self, op: Op, failure: Failure) {
        self.script.lock().unwrap().fail_next.insert(op, failure);
    }

    /// Every send waits this long before answering
    pub fn delay_sends(&self, delay: Duration) {
        self.script.lock().unwrap().send_delay = Some(delay);
    }

    /// Registration checks are counted on entry, then answer after `delay`
    pub fn delay_checks(&self, delay: Duration) {
        self.script.lock().unwrap().check_delay = Some(delay);
    }

    pub fn count(&self, op: Op) -> usize {
        self.journal.lock().unwrap().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.journal.lock().unwrap().calls.values().sum()
    }

    pub fn register_requests(&self) -> Vec<RegistrationRequest> {
        self.journal.lock().unwrap().register_requests.clone()
    }

    pub fn pushed_statuses(&self) -> Vec<Vec<CommandStatusUpdate>> {
        self.journal.lock().unwrap().pushed.clone()
    }

    /// Message types of every send attempt, failed ones included
    pub fn sent_messages(&self) -> Vec<MessageType> {
        self.journal.lock().unwrap().sent.clone()
    }

    pub fn last_ids_query(&self) -> Option<Vec<String>> {
        self.journal.lock().unwrap().ids_queries.last().cloned()
    }

    /// Record the call, then apply any scripted failure
    fn enter(&self, op: Op) -> TransportResult<()> {
        *self.journal.lock().unwrap().calls.entry(op).or_default() += 1;
        let mut script = self.script.lock().unwrap();
        if let Some(failure) = script.fail_next.remove(&op) {
            return Err(failure.into());
        }
        match script.fail_always.get(&op) {
            Some(failure) => Err((*failure).into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CloudTransport for FakeTransport {
    async fn get_pending_commands(&self, _ctx: &ConnectionContext) -> TransportResult<Vec<RemoteCommand>> {
        self.enter(Op::PendingCommands)?;
        Ok(self.script.lock().unwrap().pending_commands.clone())
    }

    async fn get_commands_by_ids(
        &self,
        _ctx: &ConnectionContext,
        ids: &[String],
    ) -> TransportResult<Vec<CommandReference>> {
        self.journal.lock().unwrap().ids_queries.push(ids.to_vec());
        self.enter(Op::CommandsByIds)?;
        let requested: HashSet<&String> = ids.iter().collect();
        let script = self.script.lock().unwrap();
        Ok(script
            .cancelled_ids
            .iter()
            .filter(|id| requested.contains(id))
            .map(|id| CommandReference { id: id.clone() })
            .collect())
    }

    async fn push_command_status(
        &self,
        _ctx: &ConnectionContext,
        updates: &[CommandStatusUpdate],
    ) -> TransportResult<()> {
        self.enter(Op::PushStatus)?;
        self.journal.lock().unwrap().pushed.push(updates.to_vec());
        Ok(())
    }

    async fn register(
        &self,
        _ctx: &ConnectionContext,
        request: &RegistrationRequest,
    ) -> TransportResult<RegistrationResponse> {
        self.journal.lock().unwrap().register_requests.push(request.clone());
        self.enter(Op::Register)?;
        self.script
            .lock()
            .unwrap()
            .register_response
            .clone()
            .ok_or_else(|| TransportError::Network("no registration response scripted".to_string()))
    }

    async fn check_registration(&self, _ctx: &ConnectionContext, _check_url: &str) -> TransportResult<RegistrationCheck> {
        self.enter(Op::CheckRegistration)?;
        let delay = self.script.lock().unwrap().check_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .script
            .lock()
            .unwrap()
            .registration_check
            .clone()
            .unwrap_or(RegistrationCheck {
                status: "PENDING".to_string(),
                expired: false,
                access_token: None,
            }))
    }

    async fn send_message(
        &self,
        _ctx: &ConnectionContext,
        message_type: MessageType,
        _payload: &Value,
    ) -> TransportResult<()> {
        self.journal.lock().unwrap().sent.push(message_type);
        let delay = self.script.lock().unwrap().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.enter(Op::SendMessage)
    }

    async fn download_asset(&self, _ctx: &ConnectionContext, asset_id: &str, target: &Path) -> TransportResult<()> {
        self.enter(Op::Download)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, format!("asset {asset_id}")).await?;
        Ok(())
    }
}

/// Records termination instead of exiting
#[derive(Default)]
pub struct RecordingTerminator {
    calls: AtomicUsize,
}

impl RecordingTerminator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProcessTerminator for RecordingTerminator {
    fn terminate(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Retrieved command targeting [`AGENT_VERSION`]
pub fn remote_command(id: &str, payload: CommandPayload) -> RemoteCommand {
    RemoteCommand::new(id, AGENT_VERSION, payload)
}

/// One key pair for the whole test binary; generation is slow
fn test_keys() -> &'static KeyPair {
    static KEYS: OnceLock<KeyPair> = OnceLock::new();
    KEYS.get_or_init(|| KeyPair::generate(1024).unwrap())
}

/// Fully wired agent over in-memory storage
pub struct TestAgent {
    pub ledger: LedgerStorage,
    pub cipher: Arc<SecretCipher>,
    pub transport: Arc<FakeTransport>,
    pub store: Arc<ConfigStore>,
    pub registration: Arc<RegistrationService>,
    pub messages: Arc<MessageSyncEngine>,
    pub command_sync: Arc<CommandSyncEngine>,
    pub executor: Arc<CommandExecutor>,
    pub executor_trigger: Arc<Notify>,
    pub terminator: Arc<RecordingTerminator>,
    context: ExecutionContext,
    _work_dir: tempfile::TempDir,
}

impl TestAgent {
    /// Agent that never registered
    pub fn new() -> Self {
        let ledger = LedgerStorage::open_in_memory().unwrap();
        let cipher = Arc::new(SecretCipher::random());
        let transport = Arc::new(FakeTransport::default());
        let store = Arc::new(ConfigStore::in_memory(cipher.clone()));
        let work_dir = tempfile::tempdir().unwrap();

        let registration = Arc::new(
            RegistrationService::new(
                ledger.clone(),
                cipher.clone(),
                transport.clone(),
                store.clone(),
                RegistrationOptions {
                    agent_version: AGENT_VERSION.to_string(),
                    check_interval: Duration::from_secs(10),
                    http_timeout: Duration::from_secs(10),
                    rsa_key_bits: 1024,
                },
                CancellationToken::new(),
            )
            .unwrap(),
        );
        let messages = Arc::new(MessageSyncEngine::new(
            ledger.clone(),
            registration.clone(),
            transport.clone(),
            store.clone(),
            MessageOptions {
                http_timeout: Duration::from_secs(10),
                pacing: Duration::from_secs(1),
                stop_timeout: Duration::from_secs(30),
            },
        ));

        let executor_trigger = Arc::new(Notify::new());
        let sync_trigger = Arc::new(Notify::new());
        let command_sync = Arc::new(CommandSyncEngine::new(
            ledger.clone(),
            registration.clone(),
            transport.clone(),
            Duration::from_secs(10),
            sync_trigger.clone(),
            executor_trigger.clone(),
        ));

        let context = ExecutionContext {
            ledger: ledger.clone(),
            registration: registration.clone(),
            services: DomainServices::from_shared(store.clone()),
            messages: messages.clone(),
            transport: transport.clone(),
            options: ExecutorOptions {
                agent_version: AGENT_VERSION.to_string(),
                ignore_remote_update: false,
                update_dir: work_dir.path().join("update"),
                http_timeout: Duration::from_secs(10),
                download_timeout: Duration::from_secs(900),
                termination_grace: Duration::from_millis(1500),
                poll_interval: Duration::from_secs(5),
            },
        };
        let terminator = Arc::new(RecordingTerminator::default());
        let executor = Arc::new(CommandExecutor::new(
            context.clone(),
            terminator.clone(),
            executor_trigger.clone(),
            sync_trigger,
        ));

        Self {
            ledger,
            cipher,
            transport,
            store,
            registration,
            messages,
            command_sync,
            executor,
            executor_trigger,
            terminator,
            context,
            _work_dir: work_dir,
        }
    }

    /// Agent registered against `https://oia.example.com` with a key pair
    pub fn registered() -> Self {
        let agent = Self::new();
        agent.register();
        agent
    }

    /// Write REGISTERED settings straight to the ledger, without signalling
    pub fn register(&self) {
        let keys = test_keys();
        let token = self.cipher.encrypt_string("access-token").unwrap();
        let private_key = self.cipher.encrypt_string(&keys.private_key).unwrap();
        self.ledger
            .modify_registration(|s| {
                s.status = RegistrationStatus::Registered;
                s.host = "https://oia.example.com".to_string();
                s.token = Some(token);
                s.public_cipher_key = Some(keys.public_key.clone());
                s.private_cipher_key = Some(private_key);
            })
            .unwrap();
    }

    /// Handler context sharing this agent's collaborators
    pub fn execution_context(&self) -> ExecutionContext {
        self.context.clone()
    }

    /// Encrypt a secret the way the cloud does for this agent
    pub fn encrypt_for_agent(&self, plaintext: &str) -> String {
        encrypt_with_public_key(&test_keys().public_key, plaintext).unwrap()
    }

    /// Types of PENDING messages, oldest first
    pub fn pending_messages(&self) -> Vec<MessageType> {
        self.ledger
            .list_messages(&MessageFilter::pending())
            .unwrap()
            .into_iter()
            .map(|m| m.message_type)
            .collect()
    }
}
