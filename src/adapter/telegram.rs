//! Telegram adapter.
//!
//! Egress goes through the Bot API `sendMessage`; identity is degraded to a
//! bold name prefix since bots cannot masquerade. Ingress long-polls
//! `getUpdates`, tracking the confirmed offset in the repository KV store so
//! a restart does not replay old updates.

use std::sync::OnceLock;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{masquerade_prefix, Adapter, AdapterContext, AdapterHealth};
use crate::bus::EVENT_INGRESS;
use crate::envelope::{Envelope, EnvelopeParams, MessageKind, SourceRef};
use crate::error::{CoreError, Result};

const OFFSET_KV_KEY: &str = "telegram:update_offset";
const POLL_TIMEOUT_SECS: u32 = 25;

pub struct TelegramAdapter {
    bot_token: String,
    client: Client,
    ctx: OnceLock<AdapterContext>,
    shutdown: watch::Sender<bool>,
}

impl TelegramAdapter {
    pub fn new(bot_token: impl Into<String>) -> Result<Self> {
        let bot_token = bot_token.into();
        if bot_token.trim().is_empty() {
            return Err(CoreError::InvalidConfig(
                "Telegram bot token cannot be empty".into(),
            ));
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            bot_token,
            client: Client::new(),
            ctx: OnceLock::new(),
            shutdown,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.bot_token, method)
    }

    fn ctx(&self) -> Result<&AdapterContext> {
        self.ctx
            .get()
            .ok_or_else(|| CoreError::fatal("telegram adapter used before init"))
    }

    fn classify(status: reqwest::StatusCode, retry_after: Option<u64>, detail: &str) -> CoreError {
        if status.as_u16() == 429 {
            return CoreError::RateLimited {
                retry_after_ms: retry_after.map(|s| s * 1000).unwrap_or(1000),
            };
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return CoreError::fatal(format!("Telegram rejected credentials: {detail}"));
        }
        CoreError::transient(format!("Telegram API {status}: {detail}"))
    }

    fn convert_update(update: TelegramUpdate) -> Option<EnvelopeParams> {
        let msg = update.message?;
        let chat = msg.chat?;
        let text = msg.text.unwrap_or_default();
        if text.is_empty() {
            return None;
        }

        let mut source = SourceRef::new("telegram", chat.id.to_string());
        if let Some(from) = msg.from {
            // Our own egress comes back through getUpdates as a bot message.
            if from.is_bot.unwrap_or(false) {
                return None;
            }
            source.user_id = from.id.to_string();
            source.username = from
                .username
                .or(from.first_name)
                .unwrap_or_else(|| from.id.to_string());
        }

        Some(EnvelopeParams {
            kind: MessageKind::Text,
            source,
            text,
            ..Default::default()
        })
    }
}

#[async_trait]
impl Adapter for TelegramAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn init(&self, ctx: AdapterContext) -> Result<()> {
        self.ctx
            .set(ctx)
            .map_err(|_| CoreError::fatal("telegram adapter initialized twice"))?;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let ctx = self.ctx()?.clone();
        let client = self.client.clone();
        let base = self.api_url("getUpdates");
        let mut shutdown = self.shutdown.subscribe();

        let mut offset: i64 = ctx
            .repository
            .kv_get(OFFSET_KV_KEY)?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);

        tokio::spawn(async move {
            info!(offset, "Telegram ingress poll started");
            loop {
                if *shutdown.borrow() {
                    break;
                }

                let request = client.get(&base).query(&[
                    ("timeout", POLL_TIMEOUT_SECS.to_string()),
                    ("offset", offset.to_string()),
                    ("allowed_updates", "[\"message\"]".to_string()),
                ]);

                let updates = tokio::select! {
                    response = request.send() => response,
                    _ = shutdown.changed() => break,
                };

                let batch: TelegramResponse<Vec<TelegramUpdate>> = match updates {
                    Ok(response) => match response.json().await {
                        Ok(batch) => batch,
                        Err(err) => {
                            warn!(error = %err, "Telegram getUpdates decode failed");
                            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                            continue;
                        }
                    },
                    Err(err) => {
                        warn!(error = %err, "Telegram getUpdates failed");
                        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                        continue;
                    }
                };

                if !batch.ok {
                    warn!(
                        description = batch.description.as_deref().unwrap_or("unknown"),
                        "Telegram getUpdates returned error"
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                    continue;
                }

                for update in batch.result.unwrap_or_default() {
                    offset = offset.max(update.update_id + 1);
                    let Some(params) = Self::convert_update(update) else {
                        continue;
                    };
                    match Envelope::new(params) {
                        Ok(envelope) => {
                            if let Err(err) = ctx.bus.emit_envelope(EVENT_INGRESS, &envelope).await
                            {
                                error!(error = %err, "Failed to emit Telegram ingress");
                            }
                        }
                        Err(err) => debug!(error = %err, "Skipping malformed Telegram update"),
                    }
                }

                if let Err(err) = ctx.repository.kv_set(OFFSET_KV_KEY, &offset.to_string()) {
                    warn!(error = %err, "Failed to persist Telegram offset");
                }
            }
            info!("Telegram ingress poll stopped");
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        Ok(())
    }

    async fn health(&self) -> Result<AdapterHealth> {
        let response = self.client.get(self.api_url("getMe")).send().await?;
        let payload: TelegramResponse<TelegramUser> = response.json().await?;
        Ok(if payload.ok {
            AdapterHealth::online()
        } else {
            AdapterHealth::offline(
                payload
                    .description
                    .unwrap_or_else(|| "getMe returned not ok".to_string()),
            )
        })
    }

    async fn process_egress(&self, envelope: &Envelope) -> Result<()> {
        let dest = envelope
            .head
            .dest
            .as_ref()
            .ok_or_else(|| CoreError::InvalidEnvelope("egress envelope without dest".into()))?;

        let text = format!("{}{}", masquerade_prefix(envelope), envelope.degrade_to_text());
        let payload = json!({
            "chat_id": dest.channel_id,
            "text": text,
        });

        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: TelegramResponse<serde_json::Value> = response.json().await?;
        if !status.is_success() || !body.ok {
            let detail = body.description.unwrap_or_else(|| "unknown error".into());
            let retry_after = body.parameters.and_then(|p| p.retry_after);
            return Err(Self::classify(status, retry_after, &detail));
        }

        debug!(chat_id = %dest.channel_id, "Telegram message delivered");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    parameters: Option<TelegramParameters>,
}

#[derive(Debug, Deserialize)]
struct TelegramParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    is_bot: Option<bool>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}
