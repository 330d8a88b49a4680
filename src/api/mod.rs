//! HTTP surface for the arena.
//!
//! Thin axum handlers over the matchmaker, battle engine, and settlement
//! synchronizer; any RPC layer could front these operations, this one is
//! just what ships. No auth here — the gateway in front owns identity.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::collab::ShardDirectory;
use crate::engine::BattleEngine;
use crate::matchmaking::Matchmaker;
use crate::models::{Battle, BattleMode, MatchmakingEntry, QueueEntryView};
use crate::settlement::{SettlementSync, SweepStats};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub matchmaker: Arc<Matchmaker>,
    pub engine: Arc<BattleEngine>,
    pub settlement: Arc<SettlementSync>,
    pub shards: Arc<dyn ShardDirectory>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/queue", post(enqueue).get(list_queue))
        .route("/api/queue/:entry_id/leave", post(leave_queue))
        .route("/api/queue/sweep", post(sweep_queue))
        .route("/api/battles", post(create_battle).get(battles_for_owner))
        .route("/api/battles/:battle_id", get(get_battle))
        .route("/api/battles/:battle_id/rounds", post(execute_round))
        .route("/api/battles/:battle_id/complete", post(complete_battle))
        .route("/api/battles/:battle_id/escrow", post(record_escrow))
        .route("/api/settlement/:battle_id/sync", post(sync_settlement))
        .route("/api/settlement/sweep", post(sweep_settlements))
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, msg.into())
}

fn not_found(msg: impl Into<String>) -> ApiError {
    (StatusCode::NOT_FOUND, msg.into())
}

/// Collapse an internal error to a 500 and keep the detail in the log,
/// except the "not found"-shaped ones callers can act on.
fn internal(e: anyhow::Error) -> ApiError {
    let msg = format!("{e:#}");
    if msg.contains("not found") || msg.contains("unknown battle") {
        return not_found(msg);
    }
    warn!("request failed: {msg}");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
}

fn parse_mode(raw: &str) -> Result<BattleMode, ApiError> {
    BattleMode::parse(raw).ok_or_else(|| bad_request(format!("unknown battle mode: {raw}")))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    shard_id: String,
    owner_id: String,
    mode: String,
    #[serde(default)]
    stake_amount: f64,
}

async fn enqueue(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<MatchmakingEntry>, ApiError> {
    let mode = parse_mode(&req.mode)?;

    // Rating is read from the shard record, not trusted from the caller.
    let profile = state
        .shards
        .resolve_shard(&req.shard_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("shard not found: {}", req.shard_id)))?;

    let entry = state
        .matchmaker
        .enqueue(
            &req.shard_id,
            &req.owner_id,
            mode,
            profile.rating,
            req.stake_amount,
        )
        .await
        .map_err(internal)?;
    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
struct OwnerQuery {
    owner_id: String,
}

async fn list_queue(
    State(state): State<AppState>,
    Query(q): Query<OwnerQuery>,
) -> Result<Json<Vec<QueueEntryView>>, ApiError> {
    let entries = state
        .matchmaker
        .list_entries(&q.owner_id)
        .await
        .map_err(internal)?;
    Ok(Json(entries))
}

#[derive(Debug, Serialize)]
struct LeaveResponse {
    removed: bool,
}

async fn leave_queue(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
    Query(q): Query<OwnerQuery>,
) -> Result<Json<LeaveResponse>, ApiError> {
    let removed = state
        .matchmaker
        .leave(&entry_id, &q.owner_id)
        .await
        .map_err(internal)?;
    Ok(Json(LeaveResponse { removed }))
}

#[derive(Debug, Deserialize)]
struct SweepQueueRequest {
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Serialize)]
struct SweepQueueResponse {
    matched: usize,
}

async fn sweep_queue(
    State(state): State<AppState>,
    Json(req): Json<SweepQueueRequest>,
) -> Result<Json<SweepQueueResponse>, ApiError> {
    let mode = match req.mode.as_deref() {
        Some(raw) => Some(parse_mode(raw)?),
        None => None,
    };
    let matched = state
        .matchmaker
        .attempt_matches(mode)
        .await
        .map_err(internal)?;
    Ok(Json(SweepQueueResponse { matched }))
}

#[derive(Debug, Deserialize)]
struct CreateBattleRequest {
    challenger_shard: String,
    defender_shard: String,
    mode: String,
    #[serde(default)]
    stake_amount: f64,
    challenger_owner: String,
    defender_owner: String,
}

async fn create_battle(
    State(state): State<AppState>,
    Json(req): Json<CreateBattleRequest>,
) -> Result<Json<Battle>, ApiError> {
    let mode = parse_mode(&req.mode)?;
    let battle = state
        .engine
        .create_battle(
            &req.challenger_shard,
            &req.defender_shard,
            mode,
            req.stake_amount,
            &req.challenger_owner,
            &req.defender_owner,
        )
        .await
        .map_err(internal)?;
    Ok(Json(battle))
}

async fn get_battle(
    State(state): State<AppState>,
    Path(battle_id): Path<String>,
) -> Result<Json<Battle>, ApiError> {
    let battle = state
        .engine
        .get_battle(&battle_id)
        .await
        .map_err(internal)?;
    battle
        .map(Json)
        .ok_or_else(|| not_found(format!("unknown battle: {battle_id}")))
}

async fn battles_for_owner(
    State(state): State<AppState>,
    Query(q): Query<OwnerQuery>,
) -> Result<Json<Vec<Battle>>, ApiError> {
    let battles = state
        .engine
        .battles_for_owner(&q.owner_id)
        .await
        .map_err(|e| {
            let msg = format!("{e:#}");
            if msg.contains("malformed") {
                bad_request(msg)
            } else {
                internal(e)
            }
        })?;
    Ok(Json(battles))
}

#[derive(Debug, Deserialize)]
struct ExecuteRoundRequest {
    round_number: u32,
}

async fn execute_round(
    State(state): State<AppState>,
    Path(battle_id): Path<String>,
    Json(req): Json<ExecuteRoundRequest>,
) -> Result<Json<crate::models::BattleRound>, ApiError> {
    let round = state
        .engine
        .execute_round(&battle_id, req.round_number)
        .await
        .map_err(internal)?;
    Ok(Json(round))
}

async fn complete_battle(
    State(state): State<AppState>,
    Path(battle_id): Path<String>,
) -> Result<Json<Battle>, ApiError> {
    let battle = state
        .engine
        .complete_battle(&battle_id)
        .await
        .map_err(internal)?;
    Ok(Json(battle))
}

#[derive(Debug, Deserialize)]
struct EscrowRequest {
    escrow_ref: String,
}

#[derive(Debug, Serialize)]
struct EscrowResponse {
    recorded: bool,
}

async fn record_escrow(
    State(state): State<AppState>,
    Path(battle_id): Path<String>,
    Json(req): Json<EscrowRequest>,
) -> Result<Json<EscrowResponse>, ApiError> {
    let recorded = state
        .engine
        .record_escrow(&battle_id, &req.escrow_ref)
        .await
        .map_err(internal)?;
    Ok(Json(EscrowResponse { recorded }))
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    updated: bool,
}

async fn sync_settlement(
    State(state): State<AppState>,
    Path(battle_id): Path<String>,
) -> Result<Json<SyncResponse>, ApiError> {
    let updated = state
        .settlement
        .sync_settlement(&battle_id)
        .await
        .map_err(internal)?;
    Ok(Json(SyncResponse { updated }))
}

#[derive(Debug, Deserialize)]
struct SweepSettlementsRequest {
    #[serde(default = "default_sweep_limit")]
    limit: usize,
}

fn default_sweep_limit() -> usize {
    25
}

async fn sweep_settlements(
    State(state): State<AppState>,
    Json(req): Json<SweepSettlementsRequest>,
) -> Result<Json<SweepStats>, ApiError> {
    Ok(Json(state.settlement.sweep_outstanding(req.limit).await))
}
