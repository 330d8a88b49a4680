//! Matchmaking: queueing and opponent search.
//!
//! Pairing widens each entry's acceptable Elo band as it waits, and a
//! pair only forms when the gap fits inside BOTH bands — a long-waiting
//! entry cannot drag a fresh one outside what the fresh entry itself
//! would accept. Matching is greedy (best available gap, earliest joiner
//! first), not globally optimal; batches are small and latency matters
//! more than perfect pairing.

use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::BattleEngine;
use crate::models::{
    now_ts, valid_owner_id, Battle, BattleMode, MatchmakingEntry, QueueEntryView,
};
use crate::store::QueueDb;

/// Base Elo half-width every entry starts with.
pub const BAND_FLOOR: u32 = 200;
/// Extra half-width per full widening step waited.
pub const BAND_STEP: u32 = 100;
pub const BAND_STEP_SECS: i64 = 30;
pub const BAND_CAP: u32 = 1200;

/// Entries older than this are purged on the next queue read.
pub const QUEUE_STALE_SECS: i64 = 600;

/// Acceptable Elo half-width after waiting `waited_secs`. Pure function
/// of wait time; both the matcher and the owner-facing `search_range`
/// annotation use this one place.
pub fn search_half_width(waited_secs: i64) -> u32 {
    let steps = (waited_secs.max(0) / BAND_STEP_SECS) as u32;
    (BAND_FLOOR + BAND_STEP.saturating_mul(steps)).min(BAND_CAP)
}

/// Mutual-consent compatibility: same mode, different owners, and the
/// rating gap fits inside both entries' current half-widths.
pub fn compatible(a: &MatchmakingEntry, b: &MatchmakingEntry, now_ts: i64) -> bool {
    if a.id == b.id || a.owner_id == b.owner_id || a.mode != b.mode {
        return false;
    }
    let gap = rating_gap(a, b);
    gap <= search_half_width(now_ts - a.joined_at) && gap <= search_half_width(now_ts - b.joined_at)
}

fn rating_gap(a: &MatchmakingEntry, b: &MatchmakingEntry) -> u32 {
    a.rating_at_queue.abs_diff(b.rating_at_queue)
}

pub struct Matchmaker {
    queue: QueueDb,
    engine: Arc<BattleEngine>,
}

impl Matchmaker {
    pub fn new(queue: QueueDb, engine: Arc<BattleEngine>) -> Self {
        Self { queue, engine }
    }

    /// Insert an entry and immediately look for an opponent. When a match
    /// is found the battle is created synchronously before returning; the
    /// caller gets the entry either way and re-queries battle state to
    /// discover whether it was consumed. Enqueuing the same shard twice
    /// is not prevented here.
    pub async fn enqueue(
        &self,
        shard_id: &str,
        owner_id: &str,
        mode: BattleMode,
        rating: u32,
        stake_amount: f64,
    ) -> Result<MatchmakingEntry> {
        if !valid_owner_id(owner_id) {
            bail!("malformed owner id");
        }
        if stake_amount < 0.0 {
            bail!("stake must be non-negative");
        }

        let entry = MatchmakingEntry {
            id: Uuid::new_v4().to_string(),
            shard_id: shard_id.to_string(),
            owner_id: owner_id.to_string(),
            mode,
            rating_at_queue: rating,
            stake_amount,
            joined_at: now_ts(),
        };
        self.queue.insert_entry(&entry).await?;
        info!(
            entry_id = %entry.id,
            shard_id,
            mode = mode.as_str(),
            rating,
            "🎟️ Shard queued"
        );

        if let Some(opponent) = self.find_match(&entry).await? {
            self.commit_match(&entry, &opponent).await?;
        }
        Ok(entry)
    }

    /// Remove an entry iff the caller owns it. Idempotent; an entry
    /// already consumed by a match reports false.
    pub async fn leave(&self, entry_id: &str, owner_id: &str) -> Result<bool> {
        self.queue.delete_owned(entry_id, owner_id).await
    }

    /// The caller's live entries, annotated with the band currently in
    /// effect for each. Purges globally-stale entries first.
    pub async fn list_entries(&self, owner_id: &str) -> Result<Vec<QueueEntryView>> {
        if !valid_owner_id(owner_id) {
            bail!("malformed owner id");
        }
        let now = now_ts();
        let purged = self.queue.purge_stale(now - QUEUE_STALE_SECS).await?;
        if purged > 0 {
            info!(purged, "purged stale queue entries");
        }

        let entries = self.queue.list_for_owner(owner_id).await?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let search_range = search_half_width(now - entry.joined_at);
                QueueEntryView {
                    entry,
                    search_range,
                }
            })
            .collect())
    }

    /// Best current opponent for `entry`: smallest rating gap among
    /// mutually-compatible candidates, ties to the earliest joiner.
    pub async fn find_match(&self, entry: &MatchmakingEntry) -> Result<Option<MatchmakingEntry>> {
        let now = now_ts();
        let candidates = self.queue.list_waiting(Some(entry.mode)).await?;

        let best = candidates
            .into_iter()
            .filter(|c| compatible(entry, c, now))
            .min_by_key(|c| (rating_gap(entry, c), c.joined_at));
        Ok(best)
    }

    /// Sweep the queue (optionally one mode) pairing whatever fits, in
    /// ascending join order. Returns the number of battles created.
    /// Entries consumed by a concurrent matcher are skipped, not errors.
    pub async fn attempt_matches(&self, mode: Option<BattleMode>) -> Result<usize> {
        let now = now_ts();
        self.queue.purge_stale(now - QUEUE_STALE_SECS).await?;
        let waiting = self.queue.list_waiting(mode).await?;

        let mut consumed: Vec<String> = Vec::new();
        let mut created = 0usize;

        for entry in &waiting {
            if consumed.iter().any(|id| id == &entry.id) {
                continue;
            }
            let best = waiting
                .iter()
                .filter(|c| !consumed.iter().any(|id| id == &c.id))
                .filter(|c| compatible(entry, c, now))
                .min_by_key(|c| (rating_gap(entry, c), c.joined_at));
            let Some(opponent) = best else {
                continue;
            };

            if self.commit_match(entry, opponent).await?.is_some() {
                consumed.push(entry.id.clone());
                consumed.push(opponent.id.clone());
                created += 1;
            }
        }
        Ok(created)
    }

    /// Atomically consume both entries and create the battle. Fails
    /// closed: both rows are re-verified and removed in one transaction,
    /// so a pair discovered from a stale snapshot simply yields None.
    async fn commit_match(
        &self,
        first: &MatchmakingEntry,
        second: &MatchmakingEntry,
    ) -> Result<Option<Battle>> {
        // Re-verify existence right before the destructive step; a
        // concurrent sweep may have consumed either side already.
        if self.queue.get_entry(&first.id).await?.is_none()
            || self.queue.get_entry(&second.id).await?.is_none()
        {
            return Ok(None);
        }
        if !self.queue.delete_pair(&first.id, &second.id).await? {
            return Ok(None);
        }

        // Earlier joiner challenges; both sides must cover the stake.
        let (challenger, defender) = if first.joined_at <= second.joined_at {
            (first, second)
        } else {
            (second, first)
        };
        let stake = challenger.stake_amount.min(defender.stake_amount);

        match self
            .engine
            .create_battle(
                &challenger.shard_id,
                &defender.shard_id,
                challenger.mode,
                stake,
                &challenger.owner_id,
                &defender.owner_id,
            )
            .await
        {
            Ok(battle) => {
                info!(
                    battle_id = %battle.id,
                    challenger = %challenger.shard_id,
                    defender = %defender.shard_id,
                    gap = rating_gap(challenger, defender),
                    "🤝 Match made"
                );
                Ok(Some(battle))
            }
            Err(e) => {
                // Battle creation failed after the queue rows were
                // spent; put both entries back so neither player is
                // silently dropped.
                warn!("battle creation failed after match: {e:#}");
                if let Err(re) = self.queue.insert_entry(first).await {
                    warn!(entry_id = %first.id, "failed to restore queue entry: {re:#}");
                }
                if let Err(re) = self.queue.insert_entry(second).await {
                    warn!(entry_id = %second.id, "failed to restore queue entry: {re:#}");
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{
        AgentResponder, Judge, JudgeVerdict, ShardDirectory, ShardProfile,
    };
    use crate::models::BattleRound;
    use crate::store::BattleDb;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::tempdir;

    struct UniversalShards;

    #[async_trait]
    impl ShardDirectory for UniversalShards {
        async fn resolve_shard(&self, shard_id: &str) -> Result<Option<ShardProfile>> {
            if shard_id.starts_with("ghost") {
                return Ok(None);
            }
            Ok(Some(ShardProfile {
                shard_id: shard_id.to_string(),
                name: shard_id.to_string(),
                rating: 1200,
            }))
        }

        async fn apply_rating_delta(&self, _shard_id: &str, _delta: i32) -> Result<()> {
            Ok(())
        }
    }

    struct SilentResponder;

    #[async_trait]
    impl AgentResponder for SilentResponder {
        async fn generate_response(
            &self,
            _shard: &ShardProfile,
            _history: &[BattleRound],
            _prompt: &str,
        ) -> Result<String> {
            Ok(String::new())
        }
    }

    struct EvenJudge;

    #[async_trait]
    impl Judge for EvenJudge {
        async fn judge(
            &self,
            _mode: BattleMode,
            _prompt: &str,
            _a: &str,
            _b: &str,
        ) -> Result<JudgeVerdict> {
            Ok(JudgeVerdict {
                score_a: 50,
                score_b: 50,
                reasoning: None,
            })
        }
    }

    fn matchmaker() -> (Matchmaker, Arc<BattleEngine>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let queue = QueueDb::new(dir.path().join("queue.db").to_str().unwrap()).unwrap();
        let battles = BattleDb::new(dir.path().join("battles.db").to_str().unwrap()).unwrap();
        let engine = Arc::new(BattleEngine::new(
            battles,
            Arc::new(UniversalShards),
            Arc::new(SilentResponder),
            Arc::new(EvenJudge),
            Duration::from_millis(50),
        ));
        (Matchmaker::new(queue, engine.clone()), engine, dir)
    }

    fn entry(id: &str, owner: &str, rating: u32, joined_at: i64) -> MatchmakingEntry {
        MatchmakingEntry {
            id: id.into(),
            shard_id: format!("shard-{id}"),
            owner_id: owner.into(),
            mode: BattleMode::Debate,
            rating_at_queue: rating,
            stake_amount: 0.0,
            joined_at,
        }
    }

    #[test]
    fn half_width_widens_with_wait_and_caps() {
        assert_eq!(search_half_width(0), 200);
        assert_eq!(search_half_width(29), 200);
        assert_eq!(search_half_width(30), 300);
        assert_eq!(search_half_width(65), 400);
        assert_eq!(search_half_width(100_000), 1200);
        assert_eq!(search_half_width(-5), 200);
    }

    #[test]
    fn fresh_close_ratings_are_compatible() {
        let now = 1000;
        let a = entry("a", "owner-a", 1200, now);
        let b = entry("b", "owner-b", 1250, now);
        assert!(compatible(&a, &b, now));
    }

    #[test]
    fn consent_is_mutual() {
        // Waiter at 1200 has widened to 400, but the fresh 1550 entry
        // only accepts 200: the 350 gap is rejected by the fresh side.
        let now = 1000;
        let waiter = entry("a", "owner-a", 1200, now - 65);
        let fresh = entry("b", "owner-b", 1550, now);
        assert!(!compatible(&waiter, &fresh, now));
        assert!(!compatible(&fresh, &waiter, now));

        // Once the fresh side has waited long enough to widen, the same
        // gap passes.
        assert!(compatible(&waiter, &fresh, now + 65));
    }

    #[test]
    fn same_owner_never_pairs() {
        let now = 1000;
        let a = entry("a", "owner-a", 1200, now);
        let b = entry("b", "owner-a", 1200, now);
        assert!(!compatible(&a, &b, now));
    }

    #[test]
    fn mode_mismatch_never_pairs() {
        let now = 1000;
        let a = entry("a", "owner-a", 1200, now);
        let mut b = entry("b", "owner-b", 1200, now);
        b.mode = BattleMode::Solve;
        assert!(!compatible(&a, &b, now));
    }

    #[tokio::test]
    async fn enqueue_pairs_compatible_entries_immediately() {
        let (mm, engine, _dir) = matchmaker();

        let first = mm
            .enqueue("shard-1", "owner-a", BattleMode::Debate, 1200, 0.0)
            .await
            .unwrap();
        // No opponent yet; entry stays queued.
        assert!(mm.queue.get_entry(&first.id).await.unwrap().is_some());

        let second = mm
            .enqueue("shard-2", "owner-b", BattleMode::Debate, 1250, 0.0)
            .await
            .unwrap();

        // Both consumed; a battle exists with the earlier joiner as
        // challenger.
        assert!(mm.queue.get_entry(&first.id).await.unwrap().is_none());
        assert!(mm.queue.get_entry(&second.id).await.unwrap().is_none());
        let battles = engine.battles_for_owner("owner-a").await.unwrap();
        assert_eq!(battles.len(), 1);
        assert_eq!(battles[0].challenger.shard_id, "shard-1");
        assert_eq!(battles[0].defender.shard_id, "shard-2");
    }

    #[tokio::test]
    async fn enqueue_prefers_smallest_rating_gap() {
        let (mm, engine, _dir) = matchmaker();

        mm.enqueue("shard-far", "owner-a", BattleMode::Debate, 1350, 0.0)
            .await
            .unwrap();
        mm.enqueue("shard-near", "owner-b", BattleMode::Debate, 1210, 0.0)
            .await
            .unwrap();
        // 1200 matches shard-near (gap 10) over shard-far (gap 150)
        // even though shard-far queued first.
        mm.enqueue("shard-new", "owner-c", BattleMode::Debate, 1200, 0.0)
            .await
            .unwrap();

        let battles = engine.battles_for_owner("owner-c").await.unwrap();
        assert_eq!(battles.len(), 1);
        let shards: Vec<&str> = vec![
            &battles[0].challenger.shard_id,
            &battles[0].defender.shard_id,
        ]
        .into_iter()
        .map(|s| s.as_str())
        .collect();
        assert!(shards.contains(&"shard-near"));
        assert!(!shards.contains(&"shard-far"));
    }

    #[tokio::test]
    async fn leave_is_owner_checked_and_idempotent() {
        let (mm, _engine, _dir) = matchmaker();
        let e = mm
            .enqueue("shard-1", "owner-a", BattleMode::Solve, 1200, 0.0)
            .await
            .unwrap();

        assert!(!mm.leave(&e.id, "owner-b").await.unwrap());
        assert!(mm.leave(&e.id, "owner-a").await.unwrap());
        assert!(!mm.leave(&e.id, "owner-a").await.unwrap());
    }

    #[tokio::test]
    async fn list_entries_annotates_band_and_purges_stale() {
        let (mm, _engine, _dir) = matchmaker();

        // A stale row from another owner, inserted directly so its join
        // time is in the past.
        let stale = entry("stale", "owner-z", 1200, now_ts() - QUEUE_STALE_SECS - 5);
        mm.queue.insert_entry(&stale).await.unwrap();

        let live = mm
            .enqueue("shard-1", "owner-a", BattleMode::Solve, 1200, 0.0)
            .await
            .unwrap();

        let mine = mm.list_entries("owner-a").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].entry.id, live.id);
        assert_eq!(mine[0].search_range, BAND_FLOOR);

        // The stale purge was global, not owner-scoped.
        assert!(mm.queue.get_entry("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn attempt_matches_never_double_spends_an_entry() {
        let (mm, engine, _dir) = matchmaker();

        // Four mutually-compatible entries; a correct sweep makes
        // exactly two battles.
        for (shard, owner, rating) in [
            ("shard-1", "owner-a", 1200u32),
            ("shard-2", "owner-b", 1205),
            ("shard-3", "owner-c", 1210),
            ("shard-4", "owner-d", 1215),
        ] {
            let e = entry(shard, owner, rating, now_ts());
            mm.queue.insert_entry(&e).await.unwrap();
        }

        let created = mm.attempt_matches(Some(BattleMode::Debate)).await.unwrap();
        assert_eq!(created, 2);
        assert!(mm.queue.list_waiting(None).await.unwrap().is_empty());

        // Immediate second sweep finds nothing left to pair.
        let again = mm.attempt_matches(None).await.unwrap();
        assert_eq!(again, 0);

        // Each owner appears in exactly one battle.
        for owner in ["owner-a", "owner-b", "owner-c", "owner-d"] {
            assert_eq!(engine.battles_for_owner(owner).await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn failed_battle_creation_restores_the_queue() {
        let (mm, _engine, _dir) = matchmaker();

        // ghost-* shards fail resolution inside create_battle.
        let a = entry("g1", "owner-a", 1200, now_ts());
        let mut a = a;
        a.shard_id = "ghost-1".into();
        let mut b = entry("g2", "owner-b", 1200, now_ts());
        b.shard_id = "ghost-2".into();
        mm.queue.insert_entry(&a).await.unwrap();
        mm.queue.insert_entry(&b).await.unwrap();

        let created = mm.attempt_matches(None).await.unwrap();
        assert_eq!(created, 0);
        assert!(mm.queue.get_entry(&a.id).await.unwrap().is_some());
        assert!(mm.queue.get_entry(&b.id).await.unwrap().is_some());
    }
}
