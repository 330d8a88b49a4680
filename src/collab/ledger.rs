//! Settlement ledger clients.
//!
//! `HttpSettlementLedger` talks to the real settlement service;
//! `PaperSettlementLedger` is a dry-run stand-in that keeps the whole
//! pipeline runnable without signing keys (and doubles as a test ledger).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LedgerState, SettlementLedger};

impl LedgerState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "settled" => Some(Self::Settled),
            "disputed" => Some(Self::Disputed),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct HttpSettlementLedger {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpSettlementLedger {
    pub fn new(http: reqwest::Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header(reqwest::header::AUTHORIZATION, format!("Bearer {key}")),
            None => req,
        }
    }
}

#[derive(Debug, Serialize)]
struct SettleRequest<'a> {
    battle_ref: &'a str,
    winner: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct FinalizeRequest<'a> {
    battle_ref: &'a str,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    tx_ref: String,
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: String,
}

#[async_trait]
impl SettlementLedger for HttpSettlementLedger {
    async fn settle(&self, battle_ref: &str, winner_owner: Option<&str>) -> Result<String> {
        let resp = self
            .authed(self.http.post(format!("{}/settle", self.base_url)))
            .json(&SettleRequest {
                battle_ref,
                winner: winner_owner,
            })
            .send()
            .await
            .context("ledger settle request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("ledger settle {}: {}", status.as_u16(), body));
        }
        let tx: TxResponse = resp.json().await.context("ledger settle json")?;
        Ok(tx.tx_ref)
    }

    async fn finalize(&self, battle_ref: &str) -> Result<String> {
        let resp = self
            .authed(self.http.post(format!("{}/finalize", self.base_url)))
            .json(&FinalizeRequest { battle_ref })
            .send()
            .await
            .context("ledger finalize request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("ledger finalize {}: {}", status.as_u16(), body));
        }
        let tx: TxResponse = resp.json().await.context("ledger finalize json")?;
        Ok(tx.tx_ref)
    }

    async fn get_state(&self, battle_ref: &str) -> Result<LedgerState> {
        let resp = self
            .authed(
                self.http
                    .get(format!("{}/state/{}", self.base_url, battle_ref)),
            )
            .send()
            .await
            .context("ledger state request")?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(LedgerState::None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("ledger state {}: {}", status.as_u16(), body));
        }
        let parsed: StateResponse = resp.json().await.context("ledger state json")?;
        LedgerState::parse(&parsed.state)
            .ok_or_else(|| anyhow!("unknown ledger state: {}", parsed.state))
    }
}

/// In-memory ledger: settle marks the ref settled, finalize marks it
/// resolved. No dispute path.
#[derive(Default)]
pub struct PaperSettlementLedger {
    states: Mutex<HashMap<String, LedgerState>>,
}

impl PaperSettlementLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettlementLedger for PaperSettlementLedger {
    async fn settle(&self, battle_ref: &str, _winner_owner: Option<&str>) -> Result<String> {
        let mut states = self.states.lock().await;
        states.insert(battle_ref.to_string(), LedgerState::Settled);
        Ok(format!("paper:settle:{}", Uuid::new_v4()))
    }

    async fn finalize(&self, battle_ref: &str) -> Result<String> {
        let mut states = self.states.lock().await;
        match states.get(battle_ref) {
            Some(LedgerState::Settled) => {
                states.insert(battle_ref.to_string(), LedgerState::Resolved);
                Ok(format!("paper:final:{}", Uuid::new_v4()))
            }
            other => Err(anyhow!("cannot finalize from state {:?}", other)),
        }
    }

    async fn get_state(&self, battle_ref: &str) -> Result<LedgerState> {
        let states = self.states.lock().await;
        Ok(states
            .get(battle_ref)
            .copied()
            .unwrap_or(LedgerState::None))
    }
}
