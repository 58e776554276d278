pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod merge;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod snapshot;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use cache::{
    InMemoryCache,
    SledCache,
    SnapshotCache,
};
pub use config::SyncConfig;
pub use controller::{
    ActionOutcome,
    ActionPhase,
    Notification,
    PlayerView,
    SaveStatus,
    SyncController,
};
pub use error::{
    Result,
    SyncError,
};
pub use remote::{
    GameServer,
    HttpGameClient,
};
pub use scheduler::PollingScheduler;
pub use session::{
    PlayerId,
    SessionContext,
};
pub use snapshot::PlayerSnapshot;
