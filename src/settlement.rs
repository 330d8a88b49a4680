//! Settlement synchronizer.
//!
//! Drives Completed, staked battles to their terminal ledger state. The
//! ledger is independently authoritative: a call we never saw a response
//! for may still have applied, so before finalizing we always ask the
//! ledger what it believes. The settle step is the one place local
//! record-keeping is trusted (first write): if a settlement ref is
//! already recorded we never settle again.
//!
//! The battle engine fires `sync_settlement` best-effort at completion
//! time; `sweep_outstanding` on an interval is the actual source of
//! correctness. Disabling the sweep silently turns a dropped settle call
//! into stuck funds, so don't.

use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::collab::{LedgerState, SettlementLedger};
use crate::models::{now_ts, Battle, BattleStatus};
use crate::store::BattleDb;

/// Recorded in place of a finalize tx when the ledger reports the battle
/// already resolved by another process.
pub const RESOLVED_EXTERNALLY: &str = "resolved:external";

pub const DEFAULT_DISPUTE_WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SweepStats {
    pub checked: usize,
    pub updated: usize,
}

pub struct SettlementSync {
    battles: BattleDb,
    ledger: Arc<dyn SettlementLedger>,
    dispute_window_secs: i64,
}

impl SettlementSync {
    pub fn new(
        battles: BattleDb,
        ledger: Arc<dyn SettlementLedger>,
        dispute_window_secs: i64,
    ) -> Self {
        Self {
            battles,
            ledger,
            dispute_window_secs,
        }
    }

    /// Push one battle toward its terminal ledger state. Returns whether
    /// anything was recorded. Safe to call at any time, from anywhere,
    /// any number of times.
    pub async fn sync_settlement(&self, battle_id: &str) -> Result<bool> {
        self.sync_settlement_at(battle_id, now_ts()).await
    }

    /// `now_ts` is injected so the dispute window is testable without a
    /// clock mock.
    pub async fn sync_settlement_at(&self, battle_id: &str, now_ts: i64) -> Result<bool> {
        let Some(battle) = self.battles.get_battle(battle_id).await? else {
            bail!("unknown battle: {battle_id}");
        };

        if battle.status != BattleStatus::Completed || battle.stake_amount <= 0.0 {
            return Ok(false);
        }
        let Some(escrow_ref) = battle.escrow_ref.clone() else {
            debug!(battle_id, "staked battle has no escrow ref yet; skipping");
            return Ok(false);
        };

        let mut updated = false;

        // Past this branch, settlement is recorded: either the write
        // above landed or a racing writer's did. The finalization ref
        // write below is store-guarded on it regardless.
        if battle.settlement_ref.is_none() {
            let winner_owner = winner_owner(&battle);
            let tx_ref = self
                .ledger
                .settle(&escrow_ref, winner_owner.as_deref())
                .await?;
            if self.battles.set_settlement_ref(&battle.id, &tx_ref).await? {
                info!(
                    battle_id = %battle.id,
                    tx_ref = %tx_ref,
                    winner = winner_owner.as_deref().unwrap_or("draw"),
                    "💰 Settlement recorded"
                );
                updated = true;
            }
        }

        if battle.finalization_ref.is_some() {
            return Ok(updated);
        }

        let completed_at = battle.completed_at.unwrap_or(battle.created_at);
        if now_ts < completed_at + self.dispute_window_secs {
            // Dispute window still open; nothing more to do this pass.
            return Ok(updated);
        }

        match self.ledger.get_state(&escrow_ref).await? {
            LedgerState::Settled => {
                let tx_ref = self.ledger.finalize(&escrow_ref).await?;
                if self
                    .battles
                    .set_finalization_ref(&battle.id, &tx_ref)
                    .await?
                {
                    info!(battle_id = %battle.id, tx_ref = %tx_ref, "🔒 Stake finalized");
                    updated = true;
                }
            }
            LedgerState::Disputed => {
                // Finalization must wait for an external arbiter.
                warn!(
                    battle_id = %battle.id,
                    escrow_ref = %escrow_ref,
                    "⚖️ Battle disputed on ledger; needs operator attention"
                );
            }
            LedgerState::Resolved => {
                // Another process finalized it. Record the fact, don't
                // call finalize again.
                if self
                    .battles
                    .set_finalization_ref(&battle.id, RESOLVED_EXTERNALLY)
                    .await?
                {
                    info!(battle_id = %battle.id, "Ledger already resolved; recorded sentinel");
                    updated = true;
                }
            }
            LedgerState::None => {
                debug!(
                    battle_id = %battle.id,
                    "Ledger has not observed settlement yet; retrying next sweep"
                );
            }
        }

        Ok(updated)
    }

    /// Reconciliation pass over every completed staked battle still
    /// missing a reference. Per-battle failures are absorbed: the next
    /// sweep retries them.
    pub async fn sweep_outstanding(&self, limit: usize) -> SweepStats {
        let ids = match self.battles.outstanding_settlements(limit).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("settlement sweep query failed: {e:#}");
                return SweepStats::default();
            }
        };

        let mut stats = SweepStats::default();
        for id in ids {
            stats.checked += 1;
            match self.sync_settlement(&id).await {
                Ok(true) => stats.updated += 1,
                Ok(false) => {}
                Err(e) => warn!(battle_id = %id, "settlement sync failed: {e:#}"),
            }
        }
        stats
    }
}

fn winner_owner(battle: &Battle) -> Option<String> {
    battle
        .winner_shard_id
        .as_deref()
        .and_then(|shard| battle.participant_for_shard(shard))
        .map(|p| p.owner_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::PaperSettlementLedger;
    use crate::models::{BattleMode, Participant};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Ledger that counts calls and serves a scripted state.
    struct ScriptedLedger {
        state: std::sync::Mutex<LedgerState>,
        settle_calls: AtomicUsize,
        finalize_calls: AtomicUsize,
    }

    impl ScriptedLedger {
        fn new(state: LedgerState) -> Self {
            Self {
                state: std::sync::Mutex::new(state),
                settle_calls: AtomicUsize::new(0),
                finalize_calls: AtomicUsize::new(0),
            }
        }

        fn set_state(&self, state: LedgerState) {
            *self.state.lock().unwrap() = state;
        }
    }

    #[async_trait]
    impl SettlementLedger for ScriptedLedger {
        async fn settle(&self, _battle_ref: &str, _winner: Option<&str>) -> Result<String> {
            self.settle_calls.fetch_add(1, Ordering::SeqCst);
            Ok("tx-settle".into())
        }

        async fn finalize(&self, _battle_ref: &str) -> Result<String> {
            self.finalize_calls.fetch_add(1, Ordering::SeqCst);
            Ok("tx-final".into())
        }

        async fn get_state(&self, _battle_ref: &str) -> Result<LedgerState> {
            Ok(*self.state.lock().unwrap())
        }
    }

    fn completed_battle(id: &str, stake: f64, escrow: Option<&str>, completed_at: i64) -> Battle {
        Battle {
            id: id.into(),
            mode: BattleMode::Debate,
            status: BattleStatus::Active,
            challenger: Participant {
                owner_id: "owner-a".into(),
                shard_id: "shard-a".into(),
                rating_at_start: 1200,
                rating_delta: 0,
            },
            defender: Participant {
                owner_id: "owner-b".into(),
                shard_id: "shard-b".into(),
                rating_at_start: 1250,
                rating_delta: 0,
            },
            rounds: vec![],
            winner_shard_id: None,
            stake_amount: stake,
            escrow_ref: escrow.map(String::from),
            settlement_ref: None,
            finalization_ref: None,
            created_at: completed_at - 60,
            completed_at: None,
        }
    }

    async fn store_completed(db: &BattleDb, battle: &Battle, completed_at: i64) {
        db.insert_battle(battle).await.unwrap();
        db.mark_completed(&battle.id, &[], Some("shard-a"), 16, -16, completed_at)
            .await
            .unwrap();
    }

    async fn db() -> (BattleDb, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("battles.db");
        (BattleDb::new(path.to_str().unwrap()).unwrap(), dir)
    }

    #[tokio::test]
    async fn staked_battle_settles_then_finalizes_after_window() {
        let (db, _dir) = db().await;
        let ledger = Arc::new(ScriptedLedger::new(LedgerState::Settled));
        let sync = SettlementSync::new(db.clone(), ledger.clone(), 3600);

        let battle = completed_battle("b1", 0.05, Some("esc-1"), 1000);
        store_completed(&db, &battle, 1000).await;

        // First pass, inside the window: settle only.
        assert!(sync.sync_settlement_at("b1", 1010).await.unwrap());
        let loaded = db.get_battle("b1").await.unwrap().unwrap();
        assert_eq!(loaded.settlement_ref.as_deref(), Some("tx-settle"));
        assert!(loaded.finalization_ref.is_none());

        // Second pass, still inside the window: full no-op, no duplicate
        // settle call.
        assert!(!sync.sync_settlement_at("b1", 1020).await.unwrap());
        assert_eq!(ledger.settle_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.finalize_calls.load(Ordering::SeqCst), 0);

        // After the window: finalize.
        assert!(sync.sync_settlement_at("b1", 1000 + 3600).await.unwrap());
        let loaded = db.get_battle("b1").await.unwrap().unwrap();
        assert_eq!(loaded.finalization_ref.as_deref(), Some("tx-final"));
        assert_eq!(ledger.finalize_calls.load(Ordering::SeqCst), 1);

        // Terminal: further passes change nothing.
        assert!(!sync.sync_settlement_at("b1", 1000 + 7200).await.unwrap());
        assert_eq!(ledger.settle_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.finalize_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn elapsed_window_settles_and_finalizes_in_one_pass() {
        let (db, _dir) = db().await;
        let ledger = Arc::new(ScriptedLedger::new(LedgerState::Settled));
        let sync = SettlementSync::new(db.clone(), ledger.clone(), 3600);

        let battle = completed_battle("b1", 0.05, Some("esc-1"), 1000);
        store_completed(&db, &battle, 1000).await;

        // First sync arrives after the window already elapsed: settle
        // and finalize run back to back in the same call.
        assert!(sync.sync_settlement_at("b1", 1000 + 3600).await.unwrap());
        let loaded = db.get_battle("b1").await.unwrap().unwrap();
        assert_eq!(loaded.settlement_ref.as_deref(), Some("tx-settle"));
        assert_eq!(loaded.finalization_ref.as_deref(), Some("tx-final"));
        assert_eq!(ledger.settle_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.finalize_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disputed_battle_is_left_alone() {
        let (db, _dir) = db().await;
        let ledger = Arc::new(ScriptedLedger::new(LedgerState::Disputed));
        let sync = SettlementSync::new(db.clone(), ledger.clone(), 3600);

        let battle = completed_battle("b1", 0.05, Some("esc-1"), 1000);
        store_completed(&db, &battle, 1000).await;

        sync.sync_settlement_at("b1", 1010).await.unwrap();
        assert!(sync.sync_settlement_at("b1", 1000 + 4000).await.is_ok());

        let loaded = db.get_battle("b1").await.unwrap().unwrap();
        assert!(loaded.finalization_ref.is_none());
        assert_eq!(ledger.finalize_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn externally_resolved_records_sentinel_without_finalize_call() {
        let (db, _dir) = db().await;
        let ledger = Arc::new(ScriptedLedger::new(LedgerState::Settled));
        let sync = SettlementSync::new(db.clone(), ledger.clone(), 3600);

        let battle = completed_battle("b1", 0.05, Some("esc-1"), 1000);
        store_completed(&db, &battle, 1000).await;
        sync.sync_settlement_at("b1", 1010).await.unwrap();

        ledger.set_state(LedgerState::Resolved);
        assert!(sync.sync_settlement_at("b1", 1000 + 4000).await.unwrap());

        let loaded = db.get_battle("b1").await.unwrap().unwrap();
        assert_eq!(
            loaded.finalization_ref.as_deref(),
            Some(RESOLVED_EXTERNALLY)
        );
        assert_eq!(ledger.finalize_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unstaked_battle_never_touches_the_ledger() {
        let (db, _dir) = db().await;
        let ledger = Arc::new(ScriptedLedger::new(LedgerState::Settled));
        let sync = SettlementSync::new(db.clone(), ledger.clone(), 3600);

        let battle = completed_battle("free", 0.0, Some("esc-1"), 1000);
        store_completed(&db, &battle, 1000).await;

        assert!(!sync.sync_settlement_at("free", 1000 + 7200).await.unwrap());
        let loaded = db.get_battle("free").await.unwrap().unwrap();
        assert!(loaded.settlement_ref.is_none());
        assert!(loaded.finalization_ref.is_none());
        assert_eq!(ledger.settle_calls.load(Ordering::SeqCst), 0);

        let stats = sync.sweep_outstanding(10).await;
        assert_eq!(stats.checked, 0);
    }

    #[tokio::test]
    async fn sweep_drains_oldest_first_and_counts() {
        let (db, _dir) = db().await;
        let ledger = Arc::new(PaperSettlementLedger::new());
        let sync = SettlementSync::new(db.clone(), ledger, 0);

        for (id, completed_at) in [("old", 100), ("new", 200)] {
            let battle = completed_battle(id, 0.05, Some(&format!("esc-{id}")), completed_at);
            store_completed(&db, &battle, completed_at).await;
        }

        // Window of zero: each battle settles and finalizes in a single
        // pass (the paper ledger reports Settled right after settle).
        let stats = sync.sweep_outstanding(10).await;
        assert_eq!(stats.checked, 2);
        assert_eq!(stats.updated, 2);

        let old = db.get_battle("old").await.unwrap().unwrap();
        assert!(old.settlement_ref.is_some());
        assert!(old.finalization_ref.is_some());

        // Everything terminal: sweep finds nothing.
        let stats = sync.sweep_outstanding(10).await;
        assert_eq!(stats.checked, 0);
    }

    #[tokio::test]
    async fn missing_battle_is_an_error() {
        let (db, _dir) = db().await;
        let ledger = Arc::new(PaperSettlementLedger::new());
        let sync = SettlementSync::new(db, ledger, 3600);
        assert!(sync.sync_settlement("ghost").await.is_err());
    }
}
