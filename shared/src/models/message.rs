//! Outbound message model

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message type, one PENDING record at most per type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    FullConfig,
    HistoryQueries,
}

impl MessageType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FullConfig => "full-config",
            Self::HistoryQueries => "history-queries",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Completed,
    Errored,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Errored => "ERRORED",
        };
        f.write_str(s)
    }
}

/// Message ledger record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub sequence: u64,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub creation_date: String,
    pub completed_date: Option<String>,
    pub error: Option<String>,
}

impl Message {
    pub fn pending(message_type: MessageType, sequence: u64, creation_date: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence,
            message_type,
            status: MessageStatus::Pending,
            creation_date,
            completed_date: None,
            error: None,
        }
    }
}

/// Message ledger filter. Empty lists match everything.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub statuses: Vec<MessageStatus>,
    pub types: Vec<MessageType>,
}

impl MessageFilter {
    pub fn pending() -> Self {
        Self {
            statuses: vec![MessageStatus::Pending],
            types: Vec::new(),
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&message.status))
            && (self.types.is_empty() || self.types.contains(&message.message_type))
    }
}
