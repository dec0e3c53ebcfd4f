//! Discord adapter.
//!
//! Egress masquerades through per-channel webhooks: the adapter creates a
//! webhook on first use (bot credentials), caches its id and token in the
//! repository KV store, and posts with `username`/`avatar_url` so foreign
//! identities render natively. A webhook deleted out from under us is
//! recreated once per send.

use std::sync::OnceLock;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{Adapter, AdapterContext, AdapterHealth};
use crate::envelope::Envelope;
use crate::error::{CoreError, Result};

const API_BASE: &str = "https://discord.com/api/v10";
const MAX_MESSAGE_CHARS: usize = 2000;

pub struct DiscordAdapter {
    bot_token: String,
    client: Client,
    ctx: OnceLock<AdapterContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredWebhook {
    id: String,
    token: String,
}

impl DiscordAdapter {
    pub fn new(bot_token: impl Into<String>) -> Result<Self> {
        let bot_token = bot_token.into();
        if bot_token.trim().is_empty() {
            return Err(CoreError::InvalidConfig(
                "Discord bot token cannot be empty".into(),
            ));
        }
        Ok(Self {
            bot_token,
            client: Client::new(),
            ctx: OnceLock::new(),
        })
    }

    fn bot_auth(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    fn ctx(&self) -> Result<&AdapterContext> {
        self.ctx
            .get()
            .ok_or_else(|| CoreError::fatal("discord adapter used before init"))
    }

    fn webhook_key(channel_id: &str) -> String {
        format!("webhook:discord:{channel_id}")
    }

    async fn ensure_webhook(&self, channel_id: &str, force_new: bool) -> Result<StoredWebhook> {
        let ctx = self.ctx()?;
        let key = Self::webhook_key(channel_id);

        if !force_new {
            if let Some(raw) = ctx.repository.kv_get(&key)? {
                if let Ok(webhook) = serde_json::from_str::<StoredWebhook>(&raw) {
                    return Ok(webhook);
                }
            }
        }

        let response = self
            .client
            .post(format!("{API_BASE}/channels/{channel_id}/webhooks"))
            .header(reqwest::header::AUTHORIZATION, self.bot_auth())
            .json(&json!({ "name": "openchat-bridge" }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify(status, None, &detail));
        }

        let created: DiscordWebhook = response.json().await?;
        let webhook = StoredWebhook {
            id: created.id,
            token: created.token.ok_or_else(|| {
                CoreError::transient("Discord webhook created without a token")
            })?,
        };
        ctx.repository
            .kv_set(&key, &serde_json::to_string(&webhook)?)?;
        info!(channel_id, webhook_id = %webhook.id, "Created Discord webhook");
        Ok(webhook)
    }

    async fn post_webhook(&self, webhook: &StoredWebhook, payload: &serde_json::Value) -> Result<StatusCode> {
        let response = self
            .client
            .post(format!(
                "{API_BASE}/webhooks/{}/{}",
                webhook.id, webhook.token
            ))
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(status);
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok())
            .map(|secs| (secs * 1000.0) as u64);
        let detail = response.text().await.unwrap_or_default();
        Err(classify(status, retry_after, &detail))
    }
}

fn classify(status: StatusCode, retry_after_ms: Option<u64>, detail: &str) -> CoreError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return CoreError::RateLimited {
            retry_after_ms: retry_after_ms.unwrap_or(1000),
        };
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return CoreError::fatal(format!("Discord rejected credentials: {detail}"));
    }
    CoreError::transient(format!("Discord API {status}: {detail}"))
}

/// Split on the platform's hard message length, preferring line breaks.
fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if current.chars().count() + line.chars().count() > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if line.chars().count() > max_chars {
            let mut piece = String::new();
            for ch in line.chars() {
                if piece.chars().count() == max_chars {
                    chunks.push(std::mem::take(&mut piece));
                }
                piece.push(ch);
            }
            current = piece;
        } else {
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[async_trait]
impl Adapter for DiscordAdapter {
    fn name(&self) -> &str {
        "discord"
    }

    async fn init(&self, ctx: AdapterContext) -> Result<()> {
        self.ctx
            .set(ctx)
            .map_err(|_| CoreError::fatal("discord adapter initialized twice"))?;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        // Ingress arrives via the external gateway feed; egress-side startup
        // only needs valid credentials.
        match self.health().await {
            Ok(health) if health.online => Ok(()),
            Ok(health) => Err(CoreError::fatal(format!(
                "Discord credentials rejected: {}",
                health.detail.unwrap_or_default()
            ))),
            Err(err) => {
                warn!(error = %err, "Discord health check failed at start");
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> Result<AdapterHealth> {
        let response = self
            .client
            .get(format!("{API_BASE}/users/@me"))
            .header(reqwest::header::AUTHORIZATION, self.bot_auth())
            .send()
            .await?;
        Ok(if response.status().is_success() {
            AdapterHealth::online()
        } else {
            AdapterHealth::offline(format!("users/@me returned {}", response.status()))
        })
    }

    async fn process_egress(&self, envelope: &Envelope) -> Result<()> {
        let dest = envelope
            .head
            .dest
            .as_ref()
            .ok_or_else(|| CoreError::InvalidEnvelope("egress envelope without dest".into()))?;

        let username = match envelope.head.source.username.trim() {
            "" => "OpenChat".to_string(),
            name => name.to_string(),
        };
        let text = envelope.degrade_to_text();

        let mut webhook = self.ensure_webhook(&dest.channel_id, false).await?;
        for chunk in chunk_text(&text, MAX_MESSAGE_CHARS) {
            let mut payload = json!({
                "content": chunk,
                "username": username,
            });
            if let Some(avatar) = &envelope.head.source.avatar {
                payload["avatar_url"] = json!(avatar);
            }

            let status = self.post_webhook(&webhook, &payload).await?;
            if status == StatusCode::NOT_FOUND {
                // Webhook was deleted on the Discord side; recreate once.
                debug!(channel_id = %dest.channel_id, "Webhook gone, recreating");
                webhook = self.ensure_webhook(&dest.channel_id, true).await?;
                let retry = self.post_webhook(&webhook, &payload).await?;
                if retry == StatusCode::NOT_FOUND {
                    return Err(CoreError::transient(
                        "Discord webhook missing after recreation",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DiscordWebhook {
    id: String,
    #[serde(default)]
    token: Option<String>,
}
