//! Durable matchmaking queue rows.
//!
//! The match-commit step needs "delete exactly these two rows or
//! neither"; `delete_pair` runs both deletes in one transaction and rolls
//! back unless each removed a row, which is what stops two concurrent
//! sweeps from spending the same entry twice.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{BattleMode, MatchmakingEntry};

#[derive(Clone)]
pub struct QueueDb {
    conn: Arc<Mutex<Connection>>,
}

impl QueueDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open queue db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS queue_entries (
                id TEXT PRIMARY KEY,
                shard_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                mode TEXT NOT NULL,
                rating_at_queue INTEGER NOT NULL,
                stake_amount REAL NOT NULL DEFAULT 0,
                joined_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_queue_mode_joined
             ON queue_entries(mode, joined_at ASC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_queue_owner
             ON queue_entries(owner_id)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn insert_entry(&self, entry: &MatchmakingEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO queue_entries
             (id, shard_id, owner_id, mode, rating_at_queue, stake_amount, joined_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &entry.id,
                &entry.shard_id,
                &entry.owner_id,
                entry.mode.as_str(),
                entry.rating_at_queue,
                entry.stake_amount,
                entry.joined_at,
            ],
        )?;
        Ok(())
    }

    pub async fn get_entry(&self, entry_id: &str) -> Result<Option<MatchmakingEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, shard_id, owner_id, mode, rating_at_queue, stake_amount, joined_at
             FROM queue_entries WHERE id = ?1",
        )?;
        let entry = stmt.query_row(params![entry_id], map_entry).optional()?;
        Ok(entry)
    }

    /// Delete an entry iff the caller owns it. Idempotent.
    pub async fn delete_owned(&self, entry_id: &str, owner_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "DELETE FROM queue_entries WHERE id = ?1 AND owner_id = ?2",
            params![entry_id, owner_id],
        )?;
        Ok(changed == 1)
    }

    /// Atomically remove both matched entries, or neither.
    pub async fn delete_pair(&self, first_id: &str, second_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let a = tx.execute("DELETE FROM queue_entries WHERE id = ?1", params![first_id])?;
        let b = tx.execute(
            "DELETE FROM queue_entries WHERE id = ?1",
            params![second_id],
        )?;
        if a == 1 && b == 1 {
            tx.commit()?;
            Ok(true)
        } else {
            tx.rollback()?;
            Ok(false)
        }
    }

    /// Waiting entries in ascending join order, optionally one mode only.
    pub async fn list_waiting(&self, mode: Option<BattleMode>) -> Result<Vec<MatchmakingEntry>> {
        let conn = self.conn.lock().await;
        let mut out = Vec::new();
        if let Some(mode) = mode {
            let mut stmt = conn.prepare_cached(
                "SELECT id, shard_id, owner_id, mode, rating_at_queue, stake_amount, joined_at
                 FROM queue_entries WHERE mode = ?1 ORDER BY joined_at ASC",
            )?;
            let rows = stmt.query_map(params![mode.as_str()], map_entry)?;
            for row in rows {
                out.push(row?);
            }
        } else {
            let mut stmt = conn.prepare_cached(
                "SELECT id, shard_id, owner_id, mode, rating_at_queue, stake_amount, joined_at
                 FROM queue_entries ORDER BY joined_at ASC",
            )?;
            let rows = stmt.query_map([], map_entry)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    pub async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<MatchmakingEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, shard_id, owner_id, mode, rating_at_queue, stake_amount, joined_at
             FROM queue_entries WHERE owner_id = ?1 ORDER BY joined_at ASC",
        )?;
        let rows = stmt.query_map(params![owner_id], map_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Drop entries that joined strictly before `cutoff_ts`.
    pub async fn purge_stale(&self, cutoff_ts: i64) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM queue_entries WHERE joined_at < ?1",
            params![cutoff_ts],
        )?;
        Ok(removed)
    }
}

fn map_entry(row: &Row<'_>) -> rusqlite::Result<MatchmakingEntry> {
    let mode_str: String = row.get(3)?;
    let mode = BattleMode::parse(&mode_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            anyhow::anyhow!("bad queue mode: {mode_str}").into(),
        )
    })?;
    Ok(MatchmakingEntry {
        id: row.get(0)?,
        shard_id: row.get(1)?,
        owner_id: row.get(2)?,
        mode,
        rating_at_queue: row.get::<_, i64>(4)?.max(0) as u32,
        stake_amount: row.get(5)?,
        joined_at: row.get(6)?,
    })
}
