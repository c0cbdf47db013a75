//! redb-based ledger for commands, messages and registration
//!
//! # Tables
//!
//! | Table | Key | Value | Purpose |
//! |-------|-----|-------|---------|
//! | `commands` | `command_id` | `Command` (JSON) | Command lifecycle |
//! | `messages` | `message_id` | `Message` (JSON) | Outbound message lifecycle |
//! | `registration` | `"settings"` | `RegistrationSettings` (JSON) | Registration singleton |
//! | `sequence_counter` | `"command_seq"` / `"message_seq"` | `u64` | Local creation order |
//!
//! # Invariants enforced here
//!
//! - At most one command is `RUNNING`; checked inside the write transaction
//!   that marks a command running.
//! - Terminal commands never change status again.
//! - Every status change resets `ack`.
//! - At most one `PENDING` message per type; checked inside the write
//!   transaction that creates the message.

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition, WriteTransaction};
use shared::error::{AppError, ErrorCode};
use shared::models::{
    Command, CommandFilter, CommandPermissions, CommandStatus, CommandStatusUpdate, Message,
    MessageFilter, MessageStatus, MessageType, Page, RegistrationIntervals,
    RegistrationSettings, RegistrationStatus, RemoteCommand,
};
use shared::util::now_iso;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Table for commands: key = cloud command id, value = JSON-serialized Command
const COMMANDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("commands");

/// Table for messages: key = local message id, value = JSON-serialized Message
const MESSAGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");

/// Table for the registration singleton
const REGISTRATION_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("registration");

/// Table for sequence counters
const SEQUENCE_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequence_counter");

const REGISTRATION_KEY: &str = "settings";
const COMMAND_SEQUENCE_KEY: &str = "command_seq";
const MESSAGE_SEQUENCE_KEY: &str = "message_seq";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Command {running} is already running")]
    CommandAlreadyRunning { running: String },

    #[error("Command {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: CommandStatus,
        to: CommandStatus,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let code = match &err {
            StorageError::CommandNotFound(_) | StorageError::MessageNotFound(_) => {
                ErrorCode::NotFound
            }
            StorageError::CommandAlreadyRunning { .. } | StorageError::InvalidTransition { .. } => {
                ErrorCode::InvalidRequest
            }
            _ => ErrorCode::DatabaseError,
        };
        AppError::with_message(code, err.to_string())
    }
}

/// Connection part of the registration settings, as written by `register`
/// and `edit`
///
/// `proxy_password` is already encrypted; `None` keeps the stored one.
#[derive(Debug, Clone)]
pub struct ConnectionUpdate {
    pub host: String,
    pub use_proxy: bool,
    pub proxy_url: Option<String>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    pub accept_unauthorized: bool,
    pub intervals: RegistrationIntervals,
    pub command_permissions: CommandPermissions,
}

/// Activation data returned by the registration request
#[derive(Debug, Clone)]
pub struct PendingActivation {
    pub activation_code: String,
    pub check_url: String,
    pub expiration_date: String,
    pub public_key: String,
    /// Encrypted private key
    pub private_key: String,
}

/// Ledger backed by redb
#[derive(Clone)]
pub struct LedgerStorage {
    db: Arc<Database>,
}

impl LedgerStorage {
    /// Open or create the ledger at the given path
    ///
    /// Commits are durable once `commit()` returns, which matters for a device
    /// that is restarted by its launcher after every upgrade.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open an in-memory ledger (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> StorageResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> StorageResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(COMMANDS_TABLE)?;
            let _ = write_txn.open_table(MESSAGES_TABLE)?;

            let mut seq_table = write_txn.open_table(SEQUENCE_TABLE)?;
            for key in [COMMAND_SEQUENCE_KEY, MESSAGE_SEQUENCE_KEY] {
                if seq_table.get(key)?.is_none() {
                    seq_table.insert(key, 0u64)?;
                }
            }

            let mut registration = write_txn.open_table(REGISTRATION_TABLE)?;
            if registration.get(REGISTRATION_KEY)?.is_none() {
                let value = serde_json::to_vec(&RegistrationSettings::default())?;
                registration.insert(REGISTRATION_KEY, value.as_slice())?;
            }
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    // ========== Sequence Operations ==========

    fn increment_sequence(txn: &WriteTransaction, key: &str) -> StorageResult<u64> {
        let mut table = txn.open_table(SEQUENCE_TABLE)?;
        let current = table.get(key)?.map(|guard| guard.value()).unwrap_or(0);
        let next = current + 1;
        table.insert(key, next)?;
        Ok(next)
    }

    // ========== Command Operations ==========

    /// Persist a retrieved command
    ///
    /// Idempotent on the cloud id: returns `false` when the command is already
    /// in the ledger, whatever its status.
    pub fn create_command(&self, remote: &RemoteCommand) -> StorageResult<bool> {
        let txn = self.db.begin_write()?;
        let created = {
            let mut table = txn.open_table(COMMANDS_TABLE)?;
            if table.get(remote.id.as_str())?.is_some() {
                false
            } else {
                let sequence = Self::increment_sequence(&txn, COMMAND_SEQUENCE_KEY)?;
                let command = Command::retrieved(remote.clone(), sequence, now_iso());
                let value = serde_json::to_vec(&command)?;
                table.insert(remote.id.as_str(), value.as_slice())?;
                true
            }
        };
        txn.commit()?;
        Ok(created)
    }

    pub fn get_command(&self, id: &str) -> StorageResult<Option<Command>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(COMMANDS_TABLE)?;
        match table.get(id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Commands matching `filter`, oldest first
    pub fn list_commands(&self, filter: &CommandFilter) -> StorageResult<Vec<Command>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(COMMANDS_TABLE)?;

        let mut commands = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            let command: Command = serde_json::from_slice(value.value())?;
            if filter.matches(&command) {
                commands.push(command);
            }
        }
        commands.sort_by_key(|c| c.sequence);
        Ok(commands)
    }

    /// One page of commands matching `filter`, newest first
    ///
    /// `page` is zero-based; a zero `page_size` yields empty pages.
    pub fn search_commands(
        &self,
        filter: &CommandFilter,
        page: usize,
        page_size: usize,
    ) -> StorageResult<Page<Command>> {
        let mut all = self.list_commands(filter)?;
        all.reverse();
        let total_elements = all.len();
        let total_pages = if page_size == 0 {
            0
        } else {
            total_elements.div_ceil(page_size)
        };
        let content = all
            .into_iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .collect();
        Ok(Page {
            content,
            total_elements,
            size: page_size,
            number: page,
            total_pages,
        })
    }

    /// Read-modify-write of one command inside a single write transaction
    fn update_command<F>(&self, id: &str, apply: F) -> StorageResult<Command>
    where
        F: FnOnce(&mut Command, &Table<'_, &'static str, &'static [u8]>) -> StorageResult<()>,
    {
        let txn = self.db.begin_write()?;
        let command = {
            let mut table = txn.open_table(COMMANDS_TABLE)?;
            let mut command: Command = match table.get(id)? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => return Err(StorageError::CommandNotFound(id.to_string())),
            };
            apply(&mut command, &table)?;
            let value = serde_json::to_vec(&command)?;
            table.insert(id, value.as_slice())?;
            command
        };
        txn.commit()?;
        Ok(command)
    }

    fn transition(command: &mut Command, to: CommandStatus) -> StorageResult<()> {
        let allowed = match to {
            CommandStatus::Running | CommandStatus::Cancelled => {
                command.status == CommandStatus::Retrieved
            }
            CommandStatus::Completed | CommandStatus::Errored => !command.status.is_terminal(),
            CommandStatus::Retrieved => false,
        };
        if !allowed {
            return Err(StorageError::InvalidTransition {
                id: command.id.clone(),
                from: command.status,
                to,
            });
        }
        command.status = to;
        command.ack = false;
        Ok(())
    }

    /// RETRIEVED → RUNNING, refused while another command is running
    pub fn mark_command_running(&self, id: &str) -> StorageResult<Command> {
        self.update_command(id, |command, table| {
            for result in table.iter()? {
                let (key, value) = result?;
                if key.value() == id {
                    continue;
                }
                let other: Command = serde_json::from_slice(value.value())?;
                if other.status == CommandStatus::Running {
                    return Err(StorageError::CommandAlreadyRunning { running: other.id });
                }
            }
            Self::transition(command, CommandStatus::Running)
        })
    }

    pub fn mark_command_completed(&self, id: &str, result: &str) -> StorageResult<Command> {
        self.update_command(id, |command, _| {
            Self::transition(command, CommandStatus::Completed)?;
            command.completed_date = Some(now_iso());
            command.result = Some(result.to_string());
            Ok(())
        })
    }

    pub fn mark_command_errored(&self, id: &str, result: &str) -> StorageResult<Command> {
        self.update_command(id, |command, _| {
            Self::transition(command, CommandStatus::Errored)?;
            command.completed_date = Some(now_iso());
            command.result = Some(result.to_string());
            Ok(())
        })
    }

    /// RETRIEVED → CANCELLED. Returns `false` when the command is unknown or
    /// no longer RETRIEVED.
    pub fn mark_command_cancelled(&self, id: &str) -> StorageResult<bool> {
        match self.update_command(id, |command, _| {
            Self::transition(command, CommandStatus::Cancelled)?;
            command.completed_date = Some(now_iso());
            Ok(())
        }) {
            Ok(_) => Ok(true),
            Err(StorageError::CommandNotFound(_) | StorageError::InvalidTransition { .. }) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Set `ack` on commands whose status still matches what was pushed
    ///
    /// A command that changed status after the push keeps `ack = false` and is
    /// pushed again on the next cycle. Returns the number acknowledged.
    pub fn mark_commands_acknowledged(&self, pushed: &[CommandStatusUpdate]) -> StorageResult<usize> {
        let txn = self.db.begin_write()?;
        let mut acknowledged = 0;
        {
            let mut table = txn.open_table(COMMANDS_TABLE)?;
            for update in pushed {
                let current: Option<Command> = match table.get(update.id.as_str())? {
                    Some(value) => Some(serde_json::from_slice(value.value())?),
                    None => None,
                };
                if let Some(mut command) = current
                    && command.status == update.status
                    && !command.ack
                {
                    command.ack = true;
                    let value = serde_json::to_vec(&command)?;
                    table.insert(update.id.as_str(), value.as_slice())?;
                    acknowledged += 1;
                }
            }
        }
        txn.commit()?;
        Ok(acknowledged)
    }

    /// Every RUNNING command → ERRORED with `result`. Returns their ids.
    pub fn fail_running_commands(&self, result: &str) -> StorageResult<Vec<String>> {
        let running = self.list_commands(&CommandFilter::with_status(&[CommandStatus::Running]))?;
        let mut ids = Vec::with_capacity(running.len());
        for command in running {
            self.mark_command_errored(&command.id, result)?;
            ids.push(command.id);
        }
        Ok(ids)
    }

    // ========== Message Operations ==========

    /// Create a PENDING message unless one of the same type is pending
    ///
    /// The check and the insert share one write transaction.
    pub fn create_message(&self, message_type: MessageType) -> StorageResult<Option<Message>> {
        let txn = self.db.begin_write()?;
        let created = {
            let mut table = txn.open_table(MESSAGES_TABLE)?;
            let mut pending_exists = false;
            for result in table.iter()? {
                let (_key, value) = result?;
                let message: Message = serde_json::from_slice(value.value())?;
                if message.message_type == message_type && message.status == MessageStatus::Pending
                {
                    pending_exists = true;
                    break;
                }
            }
            if pending_exists {
                None
            } else {
                let sequence = Self::increment_sequence(&txn, MESSAGE_SEQUENCE_KEY)?;
                let message = Message::pending(message_type, sequence, now_iso());
                let value = serde_json::to_vec(&message)?;
                table.insert(message.id.as_str(), value.as_slice())?;
                Some(message)
            }
        };
        txn.commit()?;
        Ok(created)
    }

    /// Messages matching `filter`, oldest first
    pub fn list_messages(&self, filter: &MessageFilter) -> StorageResult<Vec<Message>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MESSAGES_TABLE)?;

        let mut messages = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            let message: Message = serde_json::from_slice(value.value())?;
            if filter.matches(&message) {
                messages.push(message);
            }
        }
        messages.sort_by_key(|m| m.sequence);
        Ok(messages)
    }

    fn update_message<F>(&self, id: &str, apply: F) -> StorageResult<Message>
    where
        F: FnOnce(&mut Message),
    {
        let txn = self.db.begin_write()?;
        let message = {
            let mut table = txn.open_table(MESSAGES_TABLE)?;
            let mut message: Message = match table.get(id)? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => return Err(StorageError::MessageNotFound(id.to_string())),
            };
            apply(&mut message);
            let value = serde_json::to_vec(&message)?;
            table.insert(id, value.as_slice())?;
            message
        };
        txn.commit()?;
        Ok(message)
    }

    pub fn mark_message_completed(&self, id: &str) -> StorageResult<Message> {
        self.update_message(id, |message| {
            message.status = MessageStatus::Completed;
            message.completed_date = Some(now_iso());
        })
    }

    pub fn mark_message_errored(&self, id: &str, error: &str) -> StorageResult<Message> {
        self.update_message(id, |message| {
            message.status = MessageStatus::Errored;
            message.completed_date = Some(now_iso());
            message.error = Some(error.to_string());
        })
    }

    // ========== Registration Operations ==========

    pub fn get_registration(&self) -> StorageResult<RegistrationSettings> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(REGISTRATION_TABLE)?;
        match table.get(REGISTRATION_KEY)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Ok(RegistrationSettings::default()),
        }
    }

    /// Read-modify-write of the registration singleton
    pub fn modify_registration<F>(&self, apply: F) -> StorageResult<RegistrationSettings>
    where
        F: FnOnce(&mut RegistrationSettings),
    {
        let txn = self.db.begin_write()?;
        let settings = {
            let mut table = txn.open_table(REGISTRATION_TABLE)?;
            let mut settings: RegistrationSettings = match table.get(REGISTRATION_KEY)? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => RegistrationSettings::default(),
            };
            apply(&mut settings);
            let value = serde_json::to_vec(&settings)?;
            table.insert(REGISTRATION_KEY, value.as_slice())?;
            settings
        };
        txn.commit()?;
        Ok(settings)
    }

    fn apply_connection(settings: &mut RegistrationSettings, update: ConnectionUpdate) {
        settings.host = update.host;
        settings.use_proxy = update.use_proxy;
        settings.proxy_url = update.proxy_url;
        settings.proxy_username = update.proxy_username;
        if let Some(password) = update.proxy_password {
            settings.proxy_password = Some(password);
        }
        settings.accept_unauthorized = update.accept_unauthorized;
        settings.intervals = update.intervals;
        settings.command_permissions = update.command_permissions;
    }

    /// Store the connection settings and activation data, status PENDING
    pub fn register_pending(
        &self,
        connection: ConnectionUpdate,
        activation: PendingActivation,
    ) -> StorageResult<RegistrationSettings> {
        self.modify_registration(|settings| {
            Self::apply_connection(settings, connection);
            settings.status = RegistrationStatus::Pending;
            settings.activation_code = Some(activation.activation_code);
            settings.check_url = Some(activation.check_url);
            settings.activation_expiration_date = Some(activation.expiration_date);
            settings.activation_date = None;
            settings.token = None;
            settings.public_cipher_key = Some(activation.public_key);
            settings.private_cipher_key = Some(activation.private_key);
        })
    }

    /// PENDING → REGISTERED with the (encrypted) access token
    pub fn activate_registration(
        &self,
        activation_date: &str,
        encrypted_token: &str,
    ) -> StorageResult<RegistrationSettings> {
        self.modify_registration(|settings| {
            settings.status = RegistrationStatus::Registered;
            settings.activation_date = Some(activation_date.to_string());
            settings.token = Some(encrypted_token.to_string());
        })
    }

    /// Replace the connection settings without touching the status
    pub fn update_registration_settings(
        &self,
        connection: ConnectionUpdate,
    ) -> StorageResult<RegistrationSettings> {
        self.modify_registration(|settings| Self::apply_connection(settings, connection))
    }

    pub fn update_registration_intervals(
        &self,
        intervals: RegistrationIntervals,
    ) -> StorageResult<RegistrationSettings> {
        self.modify_registration(|settings| settings.intervals = intervals)
    }

    /// Replace the key pair; `private_key` is encrypted
    pub fn update_keys(&self, public_key: &str, private_key: &str) -> StorageResult<RegistrationSettings> {
        self.modify_registration(|settings| {
            settings.public_cipher_key = Some(public_key.to_string());
            settings.private_cipher_key = Some(private_key.to_string());
        })
    }

    /// Back to NOT_REGISTERED, clearing token, keys and activation data
    pub fn unregister(&self) -> StorageResult<RegistrationSettings> {
        self.modify_registration(|settings| {
            settings.status = RegistrationStatus::NotRegistered;
            settings.activation_code = None;
            settings.activation_date = None;
            settings.activation_expiration_date = None;
            settings.check_url = None;
            settings.token = None;
            settings.public_cipher_key = None;
            settings.private_cipher_key = None;
        })
    }
}
