//! Fuel Order Sync
//!
//! Client-side synchronization engine for fuel-order dispatch. A single
//! serial state machine merges authoritative server pushes with optimistic
//! operator actions, queues those actions while offline and drains them in
//! order once the push channel is back.

pub mod api;
pub mod channel;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod monitor;
pub mod queue;
pub mod replay;
pub mod runtime;
pub mod store;

#[cfg(test)]
mod test_support;

pub use api::{HttpOrderApi, OrderApi};
pub use channel::{PushChannel, PushEnvelope, TcpPushChannel};
pub use config::SyncConfig;
pub use credentials::{CredentialSource, KeyringCredentials, StaticCredential};
pub use engine::{DrainReport, SyncEngine};
pub use error::{ApiError, ChannelError, FailureKind, SyncError};
pub use model::{
    Command, CommandId, CommandPayload, CompletionData, ConnectionStatus, Order, OrderId,
    OrderStatus, Partition, UserId,
};
pub use monitor::{ConnectionBanner, ConnectionMonitor};
pub use replay::ReplayBuffer;
pub use runtime::{spawn_sync_loop, SyncHandle, SyncSnapshot};
pub use store::{apply, OrderState, OrderView, StoreEvent};

/// Crate version plus the git SHA it was built from.
pub fn build_info() -> String {
    format!(
        "v{} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_SHA"),
        env!("BUILD_TIMESTAMP")
    )
}
