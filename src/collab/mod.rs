//! External collaborator seams.
//!
//! The engine never talks to the outside world directly; everything
//! slow or failure-prone sits behind one of these traits, injected at
//! construction time so tests can swap in fakes.

pub mod ledger;
pub mod llm;
pub mod shards;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{BattleMode, BattleRound};

pub use ledger::{HttpSettlementLedger, PaperSettlementLedger};
pub use llm::{parse_verdict, ArenaLlm, OpenRouterClient};
pub use shards::ShardRegistry;

/// Minimal view of a shard held by the agent data store.
#[derive(Debug, Clone)]
pub struct ShardProfile {
    pub shard_id: String,
    pub name: String,
    pub rating: u32,
}

/// Agent data store: rating lookups and post-battle rating updates.
#[async_trait]
pub trait ShardDirectory: Send + Sync {
    async fn resolve_shard(&self, shard_id: &str) -> Result<Option<ShardProfile>>;
    async fn apply_rating_delta(&self, shard_id: &str, delta: i32) -> Result<()>;
}

/// Produces a shard's answer to a round prompt. Slow and unreliable;
/// callers wrap this in a timeout and treat failure as an empty answer.
#[async_trait]
pub trait AgentResponder: Send + Sync {
    async fn generate_response(
        &self,
        shard: &ShardProfile,
        history: &[BattleRound],
        prompt: &str,
    ) -> Result<String>;
}

/// Raw judge output before clamping.
#[derive(Debug, Clone)]
pub struct JudgeVerdict {
    pub score_a: i64,
    pub score_b: i64,
    pub reasoning: Option<String>,
}

#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(
        &self,
        mode: BattleMode,
        prompt: &str,
        response_a: &str,
        response_b: &str,
    ) -> Result<JudgeVerdict>;
}

/// What the settlement ledger currently knows about an escrowed battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    None,
    Settled,
    Disputed,
    Resolved,
}

/// External settlement contract. Independently authoritative and
/// eventually consistent; every call is at-least-once.
#[async_trait]
pub trait SettlementLedger: Send + Sync {
    /// Record the match outcome against the escrow. `winner_owner` is
    /// None for a draw. Returns the ledger's transaction reference.
    async fn settle(&self, battle_ref: &str, winner_owner: Option<&str>) -> Result<String>;
    /// Release the stake after the dispute window. Returns a tx reference.
    async fn finalize(&self, battle_ref: &str) -> Result<String>;
    async fn get_state(&self, battle_ref: &str) -> Result<LedgerState>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Win,
    Loss,
    Draw,
}

/// Season / achievement trackers. Fire-and-forget: a failure here is
/// logged and never fails the battle.
#[async_trait]
pub trait ResultTracker: Send + Sync {
    async fn record_result(&self, owner_id: &str, outcome: MatchOutcome) -> Result<()>;
    async fn evaluate(&self, owner_id: &str) -> Result<()>;
}
