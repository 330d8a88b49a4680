//! SQLite-backed shard registry.
//!
//! The authoritative agent data store lives elsewhere in the system; this
//! adapter carries the two columns the arena needs (name, rating) and the
//! single mutation it is allowed to make (apply a rating delta).

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{ShardDirectory, ShardProfile};

pub const DEFAULT_RATING: u32 = 1200;

#[derive(Clone)]
pub struct ShardRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl ShardRegistry {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open shard db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS shards (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                elo_rating INTEGER NOT NULL DEFAULT 1200,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn upsert_shard(&self, shard_id: &str, name: &str, rating: u32) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO shards (id, name, elo_rating, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                elo_rating = excluded.elo_rating,
                updated_at = excluded.updated_at",
            params![shard_id, name, rating, crate::models::now_ts()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl ShardDirectory for ShardRegistry {
    async fn resolve_shard(&self, shard_id: &str) -> Result<Option<ShardProfile>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT id, name, elo_rating FROM shards WHERE id = ?1")?;
        let profile = stmt
            .query_row(params![shard_id], |row| {
                Ok(ShardProfile {
                    shard_id: row.get(0)?,
                    name: row.get(1)?,
                    rating: row.get::<_, i64>(2)?.max(0) as u32,
                })
            })
            .optional()?;
        Ok(profile)
    }

    async fn apply_rating_delta(&self, shard_id: &str, delta: i32) -> Result<()> {
        let conn = self.conn.lock().await;
        // Ratings floor at zero rather than going negative.
        let changed = conn.execute(
            "UPDATE shards
             SET elo_rating = MAX(0, elo_rating + ?1), updated_at = ?2
             WHERE id = ?3",
            params![delta, crate::models::now_ts(), shard_id],
        )?;
        if changed == 0 {
            anyhow::bail!("shard not found: {shard_id}");
        }
        Ok(())
    }
}
