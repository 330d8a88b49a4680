//! Siphon Arena backend library.
//!
//! Battle matchmaking, judged rounds, Elo updates, and stake settlement
//! reconciliation for shard-vs-shard matches.

pub mod api;
pub mod collab;
pub mod engine;
pub mod matchmaking;
pub mod models;
pub mod prompts;
pub mod rating;
pub mod settlement;
pub mod store;
