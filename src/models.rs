use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Battle formats. Each format maps to a fixed pool of prompts; they do
/// not otherwise differ in rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleMode {
    Debate,
    Solve,
    RiddleChain,
    CreativeClash,
}

impl BattleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BattleMode::Debate => "debate",
            BattleMode::Solve => "solve",
            BattleMode::RiddleChain => "riddle_chain",
            BattleMode::CreativeClash => "creative_clash",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debate" => Some(Self::Debate),
            "solve" => Some(Self::Solve),
            "riddle_chain" => Some(Self::RiddleChain),
            "creative_clash" => Some(Self::CreativeClash),
            _ => None,
        }
    }
}

/// Battle lifecycle. This engine only drives Active -> Completed; the
/// remaining states exist for compatibility with the wider system
/// (Disputed is entered via the settlement ledger, not by us).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleStatus {
    Pending,
    Matching,
    Active,
    Judging,
    Completed,
    Disputed,
}

impl BattleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BattleStatus::Pending => "pending",
            BattleStatus::Matching => "matching",
            BattleStatus::Active => "active",
            BattleStatus::Judging => "judging",
            BattleStatus::Completed => "completed",
            BattleStatus::Disputed => "disputed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "matching" => Some(Self::Matching),
            "active" => Some(Self::Active),
            "judging" => Some(Self::Judging),
            "completed" => Some(Self::Completed),
            "disputed" => Some(Self::Disputed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundScores {
    pub challenger: u32,
    pub defender: u32,
}

/// One judged (or pending) exchange within a battle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleRound {
    pub round_number: u32,
    pub prompt: String,
    pub challenger_response: String,
    pub defender_response: String,
    #[serde(default)]
    pub scores: RoundScores,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl BattleRound {
    /// A round counts as judged once the judge has written scores. A
    /// still-pending round is exactly {0, 0}.
    pub fn is_judged(&self) -> bool {
        self.scores.challenger != 0 || self.scores.defender != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub owner_id: String,
    pub shard_id: String,
    pub rating_at_start: u32,
    /// Zero until the battle completes; both sides are then set in the
    /// same store update.
    pub rating_delta: i32,
}

/// Aggregate root for one match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Battle {
    pub id: String,
    pub mode: BattleMode,
    pub status: BattleStatus,
    pub challenger: Participant,
    pub defender: Participant,
    pub rounds: Vec<BattleRound>,
    /// Winning shard id, None for a draw. Set exactly once at completion.
    pub winner_shard_id: Option<String>,
    pub stake_amount: f64,
    pub escrow_ref: Option<String>,
    pub settlement_ref: Option<String>,
    pub finalization_ref: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl Battle {
    pub fn participant_for_shard(&self, shard_id: &str) -> Option<&Participant> {
        if self.challenger.shard_id == shard_id {
            Some(&self.challenger)
        } else if self.defender.shard_id == shard_id {
            Some(&self.defender)
        } else {
            None
        }
    }
}

/// A single waiting matchmaking participant. The id is distinct from the
/// shard id so a shard can re-queue after leaving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchmakingEntry {
    pub id: String,
    pub shard_id: String,
    pub owner_id: String,
    pub mode: BattleMode,
    pub rating_at_queue: u32,
    pub stake_amount: f64,
    pub joined_at: i64,
}

/// Queue entry as returned to its owner, annotated with the Elo band the
/// matcher is currently willing to accept for it.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntryView {
    #[serde(flatten)]
    pub entry: MatchmakingEntry,
    pub search_range: u32,
}

/// Owner ids come from an external identity system; validate shape before
/// using one in a store scan.
pub fn valid_owner_id(owner_id: &str) -> bool {
    let len = owner_id.len();
    if len == 0 || len > 64 {
        return false;
    }
    owner_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub shard_db_path: String,
    pub port: u16,
    /// Per-side agent response timeout in execute_round.
    pub response_timeout_secs: u64,
    /// Grace period after completion before stakes may be finalized.
    pub dispute_window_secs: i64,
    pub match_sweep_secs: u64,
    pub settle_sweep_secs: u64,
    pub settle_sweep_limit: usize,
    pub agent_model: String,
    pub judge_model: String,
    pub llm_timeout_secs: u64,
    pub ledger_base_url: Option<String>,
    pub ledger_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("ARENA_DB_PATH").unwrap_or_else(|_| "./siphon_arena.db".to_string());
        let shard_db_path =
            std::env::var("SHARD_DB_PATH").unwrap_or_else(|_| "./siphon_shards.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let response_timeout_secs = env_u64("RESPONSE_TIMEOUT_SECS", 20);
        let dispute_window_secs = env_u64("DISPUTE_WINDOW_SECS", 3600) as i64;
        let match_sweep_secs = env_u64("MATCH_SWEEP_SECS", 15);
        let settle_sweep_secs = env_u64("SETTLE_SWEEP_SECS", 60);
        let settle_sweep_limit = env_u64("SETTLE_SWEEP_LIMIT", 25) as usize;
        let llm_timeout_secs = env_u64("LLM_TIMEOUT_SECS", 30);

        let agent_model = std::env::var("AGENT_MODEL")
            .unwrap_or_else(|_| "meta-llama/llama-3.1-8b-instruct".to_string());
        let judge_model = std::env::var("JUDGE_MODEL")
            .unwrap_or_else(|_| "anthropic/claude-3.5-sonnet".to_string());

        let ledger_base_url = std::env::var("LEDGER_BASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let ledger_api_key = std::env::var("LEDGER_API_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            database_path,
            shard_db_path,
            port,
            response_timeout_secs,
            dispute_window_secs,
            match_sweep_secs,
            settle_sweep_secs,
            settle_sweep_limit,
            agent_model,
            judge_model,
            llm_timeout_secs,
            ledger_base_url,
            ledger_api_key,
        })
    }
}

fn env_u64(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_strings() {
        for mode in [
            BattleMode::Debate,
            BattleMode::Solve,
            BattleMode::RiddleChain,
            BattleMode::CreativeClash,
        ] {
            assert_eq!(BattleMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(BattleMode::parse("poetry_slam"), None);
    }

    #[test]
    fn owner_id_validation_rejects_scan_hazards() {
        assert!(valid_owner_id("0x9aF3-wallet_01"));
        assert!(valid_owner_id("keeper:alpha.2"));
        assert!(!valid_owner_id(""));
        assert!(!valid_owner_id("a%' OR 1=1 --"));
        assert!(!valid_owner_id(&"x".repeat(65)));
    }

    #[test]
    fn round_judged_when_either_score_set() {
        let mut round = BattleRound {
            round_number: 1,
            prompt: "p".into(),
            challenger_response: "a".into(),
            defender_response: "b".into(),
            scores: RoundScores::default(),
            reasoning: None,
        };
        assert!(!round.is_judged());
        round.scores.defender = 40;
        assert!(round.is_judged());
    }
}
