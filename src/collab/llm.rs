//! LLM-backed agent responder and judge via OpenRouter.
//!
//! The judge replies in a line-oriented `KEY=value` format so scoring is
//! parseable without trusting free-form prose:
//!
//! ```text
//! SCORE_A=78
//! SCORE_B=64
//! REASONING=A answered the actual question; B drifted off-topic.
//! ```

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::{AgentResponder, Judge, JudgeVerdict, ShardProfile};
use crate::models::{BattleMode, BattleRound};
use crate::prompts::SCORE_MAX;

/// Parse the judge's `KEY=value` verdict. Both scores are required;
/// unknown lines are ignored so the model can ramble before the block.
pub fn parse_verdict(raw: &str) -> Result<JudgeVerdict> {
    let mut score_a: Option<i64> = None;
    let mut score_b: Option<i64> = None;
    let mut reasoning: Option<String> = None;

    for line in raw.lines() {
        let line = line.trim();
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim().to_ascii_uppercase();
        let val = v.trim();

        match key.as_str() {
            "SCORE_A" => score_a = val.parse::<i64>().ok(),
            "SCORE_B" => score_b = val.parse::<i64>().ok(),
            "REASONING" => {
                if !val.is_empty() {
                    reasoning = Some(val.chars().take(2000).collect());
                }
            }
            _ => {}
        }
    }

    let score_a = score_a.ok_or_else(|| anyhow!("verdict missing SCORE_A"))?;
    let score_b = score_b.ok_or_else(|| anyhow!("verdict missing SCORE_B"))?;

    Ok(JudgeVerdict {
        score_a,
        score_b,
        reasoning,
    })
}

fn mode_criteria(mode: BattleMode) -> &'static str {
    match mode {
        BattleMode::Debate => "strength of argument, rebuttal quality, and internal consistency",
        BattleMode::Solve => "correctness of the answer and clarity of the reasoning",
        BattleMode::RiddleChain => "correctness of the answer and the quality of the chained riddle",
        BattleMode::CreativeClash => "originality, craft, and how fully the constraint is honored",
    }
}

/// Responder + judge built on one OpenRouter client with two model slots.
#[derive(Clone)]
pub struct ArenaLlm {
    client: OpenRouterClient,
    agent_model: String,
    judge_model: String,
    timeout: Duration,
}

impl ArenaLlm {
    pub fn new(
        client: OpenRouterClient,
        agent_model: String,
        judge_model: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            agent_model,
            judge_model,
            timeout,
        }
    }
}

#[async_trait]
impl AgentResponder for ArenaLlm {
    async fn generate_response(
        &self,
        shard: &ShardProfile,
        history: &[BattleRound],
        prompt: &str,
    ) -> Result<String> {
        let system = format!(
            "You are {}, a competitive agent shard fighting in a judged arena. \
             Answer the prompt directly and at full strength. Plain text only.",
            shard.name
        );

        let mut user = String::new();
        for round in history {
            user.push_str(&format!(
                "Previous round {} prompt: {}\n",
                round.round_number, round.prompt
            ));
        }
        user.push_str(&format!("Prompt: {prompt}"));

        let out = self
            .client
            .chat_completion(&self.agent_model, &system, &user, 700, 0.9, self.timeout)
            .await
            .context("agent response call")?;
        Ok(out.content)
    }
}

#[async_trait]
impl Judge for ArenaLlm {
    async fn judge(
        &self,
        mode: BattleMode,
        prompt: &str,
        response_a: &str,
        response_b: &str,
    ) -> Result<JudgeVerdict> {
        let system = format!(
            "You judge one round of a {} battle. Score each side 0..{} on {}. \
             An empty response scores very low. Reply ONLY in this format:\n\
             SCORE_A=<int>\nSCORE_B=<int>\nREASONING=<one line>",
            mode.as_str(),
            SCORE_MAX,
            mode_criteria(mode),
        );
        let user = format!(
            "PROMPT:\n{prompt}\n\nRESPONSE A:\n{}\n\nRESPONSE B:\n{}",
            if response_a.is_empty() { "(no response)" } else { response_a },
            if response_b.is_empty() { "(no response)" } else { response_b },
        );

        let out = self
            .client
            .chat_completion(&self.judge_model, &system, &user, 300, 0.0, self.timeout)
            .await
            .context("judge call")?;
        parse_verdict(&out.content)
    }
}

#[derive(Debug, Clone)]
pub struct LlmCallOutput {
    pub model: String,
    pub content: String,
    pub latency_ms: u64,
}

#[derive(Clone)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
}

impl OpenRouterClient {
    pub fn new(http: reqwest::Client, api_key: String) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(anyhow!("OpenRouter API key empty"));
        }
        Ok(Self { http, api_key })
    }

    pub fn from_env(http: reqwest::Client) -> Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .context("OPENROUTER_API_KEY missing (set env var)")?;
        Self::new(http, api_key)
    }

    pub async fn chat_completion(
        &self,
        model: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
        temperature: f64,
        timeout: Duration,
    ) -> Result<LlmCallOutput> {
        let start = Instant::now();

        let req = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(temperature),
            max_tokens: Some(max_tokens),
        };

        let resp = self
            .http
            .post("https://openrouter.ai/api/v1/chat/completions")
            .timeout(timeout)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&req)
            .send()
            .await
            .context("openrouter request")?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(800).collect();
            return Err(anyhow!("openrouter {}: {}", status.as_u16(), snippet));
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).context("openrouter json parse")?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        Ok(LlmCallOutput {
            model: model.to_string(),
            content,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    pub message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    pub content: String,
}
