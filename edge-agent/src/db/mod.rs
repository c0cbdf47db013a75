//! Database Module
//!
//! Local ledger on redb: commands, messages and the registration singleton.

pub mod storage;

pub use storage::{
    ConnectionUpdate, LedgerStorage, PendingActivation, StorageError, StorageResult,
};
