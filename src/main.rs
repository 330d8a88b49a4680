//! Siphon Arena — battle matchmaking & settlement engine.
//!
//! Wires the stores and collaborators together, spawns the two sweeper
//! loops (matchmaking, settlement reconciliation), and serves the HTTP
//! API.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, time::interval};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use siphon_arena::{
    api::{build_router, AppState},
    collab::{ArenaLlm, HttpSettlementLedger, OpenRouterClient, PaperSettlementLedger,
        SettlementLedger, ShardRegistry},
    engine::BattleEngine,
    matchmaking::Matchmaker,
    models::Config,
    settlement::SettlementSync,
    store::{BattleDb, QueueDb},
};

#[derive(Debug, Parser)]
#[command(name = "arena", about = "Siphon Arena battle matchmaking & settlement engine")]
struct Cli {
    /// Override the listen port (falls back to PORT, then 8080).
    #[arg(long, env = "PORT")]
    port: Option<u16>,
    /// Override the arena database path.
    #[arg(long, env = "ARENA_DB_PATH")]
    db_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(db_path) = cli.db_path {
        config.database_path = db_path;
    }

    info!("⚔️ Siphon Arena starting");

    let battles = BattleDb::new(&config.database_path)?;
    let queue = QueueDb::new(&config.database_path)?;
    let shards = Arc::new(ShardRegistry::new(&config.shard_db_path)?);
    info!("📊 Stores open: {} (shards: {})", config.database_path, config.shard_db_path);

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.llm_timeout_secs + 5))
        .build()
        .context("Failed to build HTTP client")?;

    let llm = Arc::new(ArenaLlm::new(
        OpenRouterClient::from_env(http_client.clone())?,
        config.agent_model.clone(),
        config.judge_model.clone(),
        Duration::from_secs(config.llm_timeout_secs),
    ));

    let ledger: Arc<dyn SettlementLedger> = match &config.ledger_base_url {
        Some(base_url) => Arc::new(HttpSettlementLedger::new(
            http_client,
            base_url.clone(),
            config.ledger_api_key.clone(),
        )),
        None => {
            warn!("⚠️ LEDGER_BASE_URL not set - running with the paper settlement ledger");
            Arc::new(PaperSettlementLedger::new())
        }
    };

    let settlement = Arc::new(SettlementSync::new(
        battles.clone(),
        ledger,
        config.dispute_window_secs,
    ));
    let engine = Arc::new(
        BattleEngine::new(
            battles,
            shards.clone(),
            llm.clone(),
            llm,
            Duration::from_secs(config.response_timeout_secs),
        )
        .with_settlement(settlement.clone()),
    );
    let matchmaker = Arc::new(Matchmaker::new(queue, engine.clone()));

    tokio::spawn(matchmaking_sweeper(
        matchmaker.clone(),
        config.match_sweep_secs,
    ));
    tokio::spawn(settlement_sweeper(
        settlement.clone(),
        config.settle_sweep_secs,
        config.settle_sweep_limit,
    ));

    let state = AppState {
        matchmaker,
        engine,
        settlement,
        shards,
    };
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "siphon_arena=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Periodic queue sweep so matches aren't only found at enqueue time.
async fn matchmaking_sweeper(matchmaker: Arc<Matchmaker>, poll_secs: u64) {
    let mut ticker = interval(Duration::from_secs(poll_secs.max(1)));
    loop {
        ticker.tick().await;
        match matchmaker.attempt_matches(None).await {
            Ok(0) => {}
            Ok(matched) => info!(matched, "🤝 Matchmaking sweep paired entries"),
            Err(e) => warn!("matchmaking sweep failed: {e:#}"),
        }
    }
}

/// Reconciliation loop that repairs any settlement the best-effort
/// trigger at completion time failed to record.
async fn settlement_sweeper(settlement: Arc<SettlementSync>, poll_secs: u64, limit: usize) {
    let mut ticker = interval(Duration::from_secs(poll_secs.max(1)));
    loop {
        ticker.tick().await;
        let stats = settlement.sweep_outstanding(limit).await;
        if stats.checked > 0 {
            info!(
                checked = stats.checked,
                updated = stats.updated,
                "💰 Settlement sweep done"
            );
        }
    }
}
