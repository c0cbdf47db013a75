//! Data models
//!
//! Ledger records and registration settings, shared by the agent and its
//! cloud wire types. Dates are ISO-8601 UTC strings.

pub mod command;
pub mod message;
pub mod registration;

// Re-exports
pub use command::*;
pub use message::*;
pub use registration::*;
