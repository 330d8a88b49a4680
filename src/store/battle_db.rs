//! Durable battle records.
//!
//! Rounds live in a JSON column; everything the settlement sweep filters
//! on is a real column. Writes that must happen at most once are guarded
//! in SQL (`status != 'completed'`, `ref IS NULL`) so a racing writer
//! loses cleanly instead of corrupting state. Round writes merge by
//! round number rather than replacing the column, so a writer holding a
//! stale snapshot can never erase a round another writer appended.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{Battle, BattleMode, BattleRound, BattleStatus, Participant};

#[derive(Clone)]
pub struct BattleDb {
    conn: Arc<Mutex<Connection>>,
}

impl BattleDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open battle db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS battles (
                id TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                challenger_shard TEXT NOT NULL,
                challenger_owner TEXT NOT NULL,
                challenger_rating INTEGER NOT NULL,
                challenger_delta INTEGER NOT NULL DEFAULT 0,
                defender_shard TEXT NOT NULL,
                defender_owner TEXT NOT NULL,
                defender_rating INTEGER NOT NULL,
                defender_delta INTEGER NOT NULL DEFAULT 0,
                rounds TEXT NOT NULL DEFAULT '[]',
                winner_shard TEXT,
                stake_amount REAL NOT NULL DEFAULT 0,
                escrow_ref TEXT,
                settlement_ref TEXT,
                finalization_ref TEXT,
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_battles_challenger_owner
             ON battles(challenger_owner, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_battles_defender_owner
             ON battles(defender_owner, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_battles_settlement
             ON battles(status, stake_amount, completed_at ASC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn insert_battle(&self, battle: &Battle) -> Result<()> {
        let rounds_json = serde_json::to_string(&battle.rounds)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO battles
             (id, mode, status,
              challenger_shard, challenger_owner, challenger_rating, challenger_delta,
              defender_shard, defender_owner, defender_rating, defender_delta,
              rounds, winner_shard, stake_amount,
              escrow_ref, settlement_ref, finalization_ref,
              created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                &battle.id,
                battle.mode.as_str(),
                battle.status.as_str(),
                &battle.challenger.shard_id,
                &battle.challenger.owner_id,
                battle.challenger.rating_at_start,
                battle.challenger.rating_delta,
                &battle.defender.shard_id,
                &battle.defender.owner_id,
                battle.defender.rating_at_start,
                battle.defender.rating_delta,
                rounds_json,
                battle.winner_shard_id.as_deref(),
                battle.stake_amount,
                battle.escrow_ref.as_deref(),
                battle.settlement_ref.as_deref(),
                battle.finalization_ref.as_deref(),
                battle.created_at,
                battle.completed_at,
            ],
        )?;
        Ok(())
    }

    pub async fn get_battle(&self, battle_id: &str) -> Result<Option<Battle>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM battles WHERE id = ?1"
        ))?;
        let battle = stmt
            .query_row(params![battle_id], map_battle)
            .optional()?;
        Ok(battle)
    }

    /// Merge the caller's rounds into the stored column while the battle
    /// is still open. Merging is by round number: rounds the caller
    /// knows about are overwritten, rounds it has never seen are kept.
    /// Returns false if the battle is already completed (or missing).
    pub async fn update_rounds(&self, battle_id: &str, rounds: &[BattleRound]) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let Some(stored) = open_battle_rounds(&tx, battle_id)? else {
            return Ok(false);
        };
        let rounds_json = serde_json::to_string(&merge_rounds(stored, rounds))?;
        tx.execute(
            "UPDATE battles SET rounds = ?1 WHERE id = ?2",
            params![rounds_json, battle_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Single atomic completion write: final rounds (merged, same rule
    /// as `update_rounds`), winner, both deltas, status, timestamp.
    /// Guarded so only the first caller wins; the caller must only apply
    /// external rating deltas when this returns true.
    pub async fn mark_completed(
        &self,
        battle_id: &str,
        rounds: &[BattleRound],
        winner_shard: Option<&str>,
        challenger_delta: i32,
        defender_delta: i32,
        completed_at: i64,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let Some(stored) = open_battle_rounds(&tx, battle_id)? else {
            return Ok(false);
        };
        let rounds_json = serde_json::to_string(&merge_rounds(stored, rounds))?;
        tx.execute(
            "UPDATE battles SET
                rounds = ?1,
                winner_shard = ?2,
                challenger_delta = ?3,
                defender_delta = ?4,
                status = 'completed',
                completed_at = ?5
             WHERE id = ?6 AND status != 'completed'",
            params![
                rounds_json,
                winner_shard,
                challenger_delta,
                defender_delta,
                completed_at,
                battle_id
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Escrow is attached once by the deposit flow; never overwritten.
    pub async fn set_escrow_ref(&self, battle_id: &str, escrow_ref: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE battles SET escrow_ref = ?1
             WHERE id = ?2 AND escrow_ref IS NULL",
            params![escrow_ref, battle_id],
        )?;
        Ok(changed == 1)
    }

    /// Set-once, and only on a completed battle.
    pub async fn set_settlement_ref(&self, battle_id: &str, tx_ref: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE battles SET settlement_ref = ?1
             WHERE id = ?2 AND settlement_ref IS NULL AND status = 'completed'",
            params![tx_ref, battle_id],
        )?;
        Ok(changed == 1)
    }

    /// Set-once, and only after settlement has been recorded locally.
    pub async fn set_finalization_ref(&self, battle_id: &str, tx_ref: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE battles SET finalization_ref = ?1
             WHERE id = ?2 AND finalization_ref IS NULL
               AND settlement_ref IS NOT NULL AND status = 'completed'",
            params![tx_ref, battle_id],
        )?;
        Ok(changed == 1)
    }

    /// Battles where the given owner sat on either side, newest first.
    pub async fn battles_for_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<Battle>> {
        let limit = limit.clamp(1, 500) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM battles
             WHERE challenger_owner = ?1 OR defender_owner = ?1
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![owner_id, limit], map_battle)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Completed, staked, escrowed battles still missing a settlement or
    /// finalization reference — the settlement sweep's work queue,
    /// oldest-completed first.
    pub async fn outstanding_settlements(&self, limit: usize) -> Result<Vec<String>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM battles
             WHERE status = 'completed'
               AND stake_amount > 0
               AND escrow_ref IS NOT NULL
               AND (settlement_ref IS NULL OR finalization_ref IS NULL)
             ORDER BY completed_at ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Rounds of a battle that is not yet completed, or None.
fn open_battle_rounds(conn: &Connection, battle_id: &str) -> Result<Option<Vec<BattleRound>>> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT rounds FROM battles WHERE id = ?1 AND status != 'completed'",
            params![battle_id],
            |row| row.get(0),
        )
        .optional()?;
    match stored {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Replace-by-round-number merge. Rounds are never removed, so the
/// stored sequence only grows.
fn merge_rounds(mut current: Vec<BattleRound>, incoming: &[BattleRound]) -> Vec<BattleRound> {
    for round in incoming {
        match current
            .iter_mut()
            .find(|r| r.round_number == round.round_number)
        {
            Some(slot) => *slot = round.clone(),
            None => current.push(round.clone()),
        }
    }
    current.sort_by_key(|r| r.round_number);
    current
}

const COLUMNS: &str = "id, mode, status,
    challenger_shard, challenger_owner, challenger_rating, challenger_delta,
    defender_shard, defender_owner, defender_rating, defender_delta,
    rounds, winner_shard, stake_amount,
    escrow_ref, settlement_ref, finalization_ref,
    created_at, completed_at";

fn map_battle(row: &Row<'_>) -> rusqlite::Result<Battle> {
    let mode_str: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let rounds_json: String = row.get(11)?;

    let mode = BattleMode::parse(&mode_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            anyhow!("bad battle mode: {mode_str}").into(),
        )
    })?;
    let status = BattleStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            anyhow!("bad battle status: {status_str}").into(),
        )
    })?;
    let rounds: Vec<BattleRound> = serde_json::from_str(&rounds_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(e)))?;

    Ok(Battle {
        id: row.get(0)?,
        mode,
        status,
        challenger: Participant {
            shard_id: row.get(3)?,
            owner_id: row.get(4)?,
            rating_at_start: row.get::<_, i64>(5)?.max(0) as u32,
            rating_delta: row.get(6)?,
        },
        defender: Participant {
            shard_id: row.get(7)?,
            owner_id: row.get(8)?,
            rating_at_start: row.get::<_, i64>(9)?.max(0) as u32,
            rating_delta: row.get(10)?,
        },
        rounds,
        winner_shard_id: row.get(12)?,
        stake_amount: row.get(13)?,
        escrow_ref: row.get(14)?,
        settlement_ref: row.get(15)?,
        finalization_ref: row.get(16)?,
        created_at: row.get(17)?,
        completed_at: row.get(18)?,
    })
}
