//! Battle state machine.
//!
//! Drives a battle from creation through collected rounds to a judged,
//! rated completion. Rounds are collected by `execute_round` without
//! judging so responses can be gathered asynchronously; `complete_battle`
//! judges whatever is pending and finishes the match. Completion is
//! idempotent: the `status = completed` short-circuit plus a guarded
//! store update make retries safe at every step.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collab::{
    AgentResponder, Judge, MatchOutcome, ResultTracker, ShardDirectory, ShardProfile,
};
use crate::models::{
    now_ts, valid_owner_id, Battle, BattleMode, BattleRound, BattleStatus, Participant,
    RoundScores,
};
use crate::prompts::{clamp_judge_scores, select_prompt};
use crate::rating::{compute_elo_delta, determine_winner};
use crate::settlement::SettlementSync;
use crate::store::BattleDb;

pub struct BattleEngine {
    battles: BattleDb,
    shards: Arc<dyn ShardDirectory>,
    responder: Arc<dyn AgentResponder>,
    judge: Arc<dyn Judge>,
    trackers: Vec<Arc<dyn ResultTracker>>,
    settlement: Option<Arc<SettlementSync>>,
    response_timeout: Duration,
}

impl BattleEngine {
    pub fn new(
        battles: BattleDb,
        shards: Arc<dyn ShardDirectory>,
        responder: Arc<dyn AgentResponder>,
        judge: Arc<dyn Judge>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            battles,
            shards,
            responder,
            judge,
            trackers: Vec::new(),
            settlement: None,
            response_timeout,
        }
    }

    pub fn with_trackers(mut self, trackers: Vec<Arc<dyn ResultTracker>>) -> Self {
        self.trackers = trackers;
        self
    }

    /// Wire in the settlement synchronizer so completion can trigger
    /// settlement best-effort. Without it, staked battles wait for the
    /// sweep loop.
    pub fn with_settlement(mut self, settlement: Arc<SettlementSync>) -> Self {
        self.settlement = Some(settlement);
        self
    }

    pub async fn create_battle(
        &self,
        challenger_shard: &str,
        defender_shard: &str,
        mode: BattleMode,
        stake_amount: f64,
        challenger_owner: &str,
        defender_owner: &str,
    ) -> Result<Battle> {
        if stake_amount < 0.0 {
            bail!("stake must be non-negative");
        }
        let challenger = self
            .shards
            .resolve_shard(challenger_shard)
            .await?
            .with_context(|| format!("challenger shard not found: {challenger_shard}"))?;
        let defender = self
            .shards
            .resolve_shard(defender_shard)
            .await?
            .with_context(|| format!("defender shard not found: {defender_shard}"))?;

        let battle = Battle {
            id: Uuid::new_v4().to_string(),
            mode,
            status: BattleStatus::Active,
            challenger: Participant {
                owner_id: challenger_owner.to_string(),
                shard_id: challenger.shard_id.clone(),
                rating_at_start: challenger.rating,
                rating_delta: 0,
            },
            defender: Participant {
                owner_id: defender_owner.to_string(),
                shard_id: defender.shard_id.clone(),
                rating_at_start: defender.rating,
                rating_delta: 0,
            },
            rounds: Vec::new(),
            winner_shard_id: None,
            stake_amount,
            escrow_ref: None,
            settlement_ref: None,
            finalization_ref: None,
            created_at: now_ts(),
            completed_at: None,
        };
        self.battles.insert_battle(&battle).await?;

        info!(
            battle_id = %battle.id,
            mode = mode.as_str(),
            challenger = %challenger.shard_id,
            defender = %defender.shard_id,
            stake = stake_amount,
            "⚔️ Battle created"
        );
        Ok(battle)
    }

    /// Collect one round of responses. No judging happens here; scores
    /// stay {0,0} until `complete_battle`. A side that times out or
    /// errors contributes an empty response rather than failing the
    /// battle.
    pub async fn execute_round(&self, battle_id: &str, round_number: u32) -> Result<BattleRound> {
        let mut battle = self.load_battle(battle_id).await?;
        if battle.status != BattleStatus::Active {
            bail!(
                "battle {} is {}, cannot add rounds",
                battle_id,
                battle.status.as_str()
            );
        }
        let expected = battle.rounds.len() as u32 + 1;
        if round_number != expected {
            bail!("round {round_number} out of order; next round is {expected}");
        }

        let prompt = select_prompt(battle.mode, round_number);

        let challenger = self.require_profile(&battle.challenger.shard_id).await?;
        let defender = self.require_profile(&battle.defender.shard_id).await?;

        let challenger_response = self
            .response_or_empty(&challenger, &battle.rounds, prompt)
            .await;
        let defender_response = self
            .response_or_empty(&defender, &battle.rounds, prompt)
            .await;

        let round = BattleRound {
            round_number,
            prompt: prompt.to_string(),
            challenger_response,
            defender_response,
            scores: RoundScores::default(),
            reasoning: None,
        };
        battle.rounds.push(round.clone());

        if !self.battles.update_rounds(battle_id, &battle.rounds).await? {
            bail!("battle {battle_id} completed while the round was running");
        }
        debug!(battle_id, round_number, "round collected");
        Ok(round)
    }

    /// Judge pending rounds, pick a winner, apply ratings, finish the
    /// battle. Re-invoking on a completed battle is a no-op returning the
    /// stored state; a judge failure mid-way leaves already-judged
    /// rounds persisted so the retry skips them.
    pub async fn complete_battle(&self, battle_id: &str) -> Result<Battle> {
        let mut battle = self.load_battle(battle_id).await?;
        if battle.status == BattleStatus::Completed {
            debug!(battle_id, "already completed; returning stored result");
            return Ok(battle);
        }

        self.judge_pending_rounds(&mut battle).await?;

        let winner_shard = determine_winner(&battle);
        let (challenger_delta, defender_delta) = match winner_shard.as_deref() {
            Some(shard) if shard == battle.challenger.shard_id => {
                let delta = compute_elo_delta(
                    battle.challenger.rating_at_start,
                    battle.defender.rating_at_start,
                    false,
                );
                (delta.winner, delta.loser)
            }
            Some(_) => {
                let delta = compute_elo_delta(
                    battle.defender.rating_at_start,
                    battle.challenger.rating_at_start,
                    false,
                );
                (delta.loser, delta.winner)
            }
            None => {
                let delta = compute_elo_delta(
                    battle.challenger.rating_at_start,
                    battle.defender.rating_at_start,
                    true,
                );
                (delta.winner, delta.loser)
            }
        };

        let completed_at = now_ts();
        let won = self
            .battles
            .mark_completed(
                battle_id,
                &battle.rounds,
                winner_shard.as_deref(),
                challenger_delta,
                defender_delta,
                completed_at,
            )
            .await?;
        if !won {
            // Another caller finished the battle first; their ratings
            // already applied.
            debug!(battle_id, "lost completion race; returning stored result");
            return self.load_battle(battle_id).await;
        }

        info!(
            battle_id,
            winner = winner_shard.as_deref().unwrap_or("draw"),
            challenger_delta,
            defender_delta,
            "🏆 Battle completed"
        );

        // The guarded update above means this branch runs at most once
        // per battle, so the deltas cannot double-apply.
        if let Err(e) = self
            .shards
            .apply_rating_delta(&battle.challenger.shard_id, challenger_delta)
            .await
        {
            warn!(battle_id, "failed to apply challenger rating delta: {e:#}");
        }
        if let Err(e) = self
            .shards
            .apply_rating_delta(&battle.defender.shard_id, defender_delta)
            .await
        {
            warn!(battle_id, "failed to apply defender rating delta: {e:#}");
        }

        self.notify_trackers(&battle, winner_shard.as_deref()).await;

        // Best-effort settlement trigger; the sweep loop is the retry
        // path, never this call.
        if battle.stake_amount > 0.0 {
            if let Some(settlement) = &self.settlement {
                if let Err(e) = settlement.sync_settlement(battle_id).await {
                    warn!(battle_id, "best-effort settlement trigger failed: {e:#}");
                }
            }
        }

        self.load_battle(battle_id).await
    }

    pub async fn get_battle(&self, battle_id: &str) -> Result<Option<Battle>> {
        self.battles.get_battle(battle_id).await
    }

    pub async fn battles_for_owner(&self, owner_id: &str) -> Result<Vec<Battle>> {
        if !valid_owner_id(owner_id) {
            bail!("malformed owner id");
        }
        self.battles.battles_for_owner(owner_id, 100).await
    }

    /// Attach the external escrow reference produced by the deposit flow.
    /// Set-once; returns false if one is already recorded.
    pub async fn record_escrow(&self, battle_id: &str, escrow_ref: &str) -> Result<bool> {
        if self.battles.get_battle(battle_id).await?.is_none() {
            bail!("unknown battle: {battle_id}");
        }
        let recorded = self.battles.set_escrow_ref(battle_id, escrow_ref).await?;
        if recorded {
            info!(battle_id, escrow_ref, "escrow reference recorded");
        }
        Ok(recorded)
    }

    async fn load_battle(&self, battle_id: &str) -> Result<Battle> {
        self.battles
            .get_battle(battle_id)
            .await?
            .with_context(|| format!("unknown battle: {battle_id}"))
    }

    async fn require_profile(&self, shard_id: &str) -> Result<ShardProfile> {
        self.shards
            .resolve_shard(shard_id)
            .await?
            .with_context(|| format!("shard not found: {shard_id}"))
    }

    async fn response_or_empty(
        &self,
        shard: &ShardProfile,
        history: &[BattleRound],
        prompt: &str,
    ) -> String {
        match timeout(
            self.response_timeout,
            self.responder.generate_response(shard, history, prompt),
        )
        .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(shard_id = %shard.shard_id, "agent response failed: {e:#}");
                String::new()
            }
            Err(_) => {
                warn!(shard_id = %shard.shard_id, "agent response timed out");
                String::new()
            }
        }
    }

    /// Judge every round still scored {0,0} that has at least one
    /// non-empty response (a one-sided round is judged — and usually
    /// lost — rather than skipped; a fully blank round stays 0-0).
    /// Persists after each verdict so a later judge failure loses
    /// nothing.
    async fn judge_pending_rounds(&self, battle: &mut Battle) -> Result<()> {
        let mode = battle.mode;
        for i in 0..battle.rounds.len() {
            let round = &battle.rounds[i];
            if round.is_judged() {
                continue;
            }
            if round.challenger_response.is_empty() && round.defender_response.is_empty() {
                continue;
            }

            let verdict = self
                .judge
                .judge(
                    mode,
                    &round.prompt,
                    &round.challenger_response,
                    &round.defender_response,
                )
                .await
                .with_context(|| format!("judging round {}", round.round_number))?;

            let round = &mut battle.rounds[i];
            round.scores = clamp_judge_scores(verdict.score_a, verdict.score_b);
            round.reasoning = verdict.reasoning;
            self.battles.update_rounds(&battle.id, &battle.rounds).await?;
        }
        Ok(())
    }

    async fn notify_trackers(&self, battle: &Battle, winner_shard: Option<&str>) {
        if self.trackers.is_empty() {
            return;
        }
        let (challenger_outcome, defender_outcome) = match winner_shard {
            Some(shard) if shard == battle.challenger.shard_id => {
                (MatchOutcome::Win, MatchOutcome::Loss)
            }
            Some(_) => (MatchOutcome::Loss, MatchOutcome::Win),
            None => (MatchOutcome::Draw, MatchOutcome::Draw),
        };

        for tracker in &self.trackers {
            for (owner, outcome) in [
                (&battle.challenger.owner_id, challenger_outcome),
                (&battle.defender.owner_id, defender_outcome),
            ] {
                if let Err(e) = tracker.record_result(owner, outcome).await {
                    warn!(owner, "result tracker failed: {e:#}");
                }
                if let Err(e) = tracker.evaluate(owner).await {
                    warn!(owner, "tracker evaluation failed: {e:#}");
                }
            }
        }
    }
}
