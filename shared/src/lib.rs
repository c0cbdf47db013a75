//! Shared types for the edge agent
//!
//! Domain models, cloud wire types, error codes and small utilities used
//! across the workspace.

pub mod cloud;
pub mod error;
pub mod models;
pub mod util;

// Re-exports
pub use error::{AppError, AppResult, ErrorCode};
pub use serde::{Deserialize, Serialize};
