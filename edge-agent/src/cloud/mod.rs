//! Cloud - synchronization with the OIAnalytics control plane
//!
//! ```text
//! RegistrationService ── watch<RegistrationStatus> ──┬──► CommandSyncEngine
//!                                                    └──► MessageSyncEngine
//!
//! CommandSyncEngine: cancel-check → retrieve → ack ──Notify──► CommandExecutor
//! CommandExecutor:   oldest RETRIEVED → guards → ops::dispatch → COMPLETED/ERRORED
//! MessageSyncEngine: oldest PENDING → payload → PUT, retry/backoff
//! ```

pub mod command_executor;
pub mod command_sync;
pub mod message_sync;
pub mod ops;
pub mod payload;
pub mod service;

pub use command_executor::{CommandExecutor, ExitTerminator, ProcessTerminator};
pub use command_sync::CommandSyncEngine;
pub use message_sync::MessageSyncEngine;
pub use service::{CloudTransport, ConnectionContext, HttpCloudClient, TransportError};

use shared::models::RegistrationStatus;
use tokio::sync::watch;

/// Next "updated" signal; never resolves once the sender is gone
pub(crate) async fn registration_updated(
    updates: &mut watch::Receiver<RegistrationStatus>,
) -> RegistrationStatus {
    if updates.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
    *updates.borrow_and_update()
}
