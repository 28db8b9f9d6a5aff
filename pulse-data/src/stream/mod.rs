/// Long-lived feed connection with reconnect, ping and auth-failure handling.
pub mod consumer;

/// Short-lived cache of migration snapshot rows.
pub mod migration;

/// Feed frame, room and snapshot row definitions.
pub mod protocol;

/// Quiet-feed detection for the feed socket.
pub mod watchdog;

pub use consumer::{ConnectionState, FrameOutcome, StreamConsumer};
pub use migration::{MigrationStat, MigrationStatCache};
