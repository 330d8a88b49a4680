//! SQLite persistence.
//!
//! Two stores, each owned by exactly one component: `BattleDb` by the
//! battle engine (and read by the settlement synchronizer), `QueueDb` by
//! the matchmaker. Both are built at startup and injected — no global
//! lazily-initialized connections.

pub mod battle_db;
pub mod queue_db;

pub use battle_db::BattleDb;
pub use queue_db::QueueDb;
