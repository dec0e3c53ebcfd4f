//! Stoat adapter.
//!
//! Stoat supports a native masquerade object on message creation, so
//! foreign identities render with their own name and avatar. Ingress polls
//! the linked channels for messages newer than the last one seen; the
//! cursor per channel is kept in the repository KV store.

use std::sync::OnceLock;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Adapter, AdapterContext, AdapterHealth};
use crate::bus::EVENT_INGRESS;
use crate::envelope::{AttachmentDraft, Envelope, EnvelopeParams, MessageKind, SourceRef};
use crate::error::{CoreError, Result};
use crate::storage::MediaOptions;

const DEFAULT_API_BASE: &str = "https://api.stoat.chat";
const POLL_INTERVAL_SECS: u64 = 5;

pub struct StoatAdapter {
    token: String,
    base_url: String,
    client: Client,
    ctx: OnceLock<AdapterContext>,
    shutdown: watch::Sender<bool>,
}

impl StoatAdapter {
    pub fn new(token: impl Into<String>, base_url: Option<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(CoreError::InvalidConfig(
                "Stoat token cannot be empty".into(),
            ));
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            token,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            client: Client::new(),
            ctx: OnceLock::new(),
            shutdown,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn ctx(&self) -> Result<&AdapterContext> {
        self.ctx
            .get()
            .ok_or_else(|| CoreError::fatal("stoat adapter used before init"))
    }

    fn cursor_key(channel_id: &str) -> String {
        format!("stoat:cursor:{channel_id}")
    }

    fn convert_message(msg: StoatMessage, channel_id: &str) -> Option<EnvelopeParams> {
        if msg.masquerade.is_some() {
            // Masqueraded messages are our own bridge output.
            return None;
        }
        let content = msg.content.unwrap_or_default();
        if content.is_empty() && msg.attachments.is_empty() {
            return None;
        }
        let mut source = SourceRef::new("stoat", channel_id);
        source.user_id = msg.author.unwrap_or_default();
        source.username = msg.username.unwrap_or_else(|| source.user_id.clone());
        Some(EnvelopeParams {
            kind: if content.is_empty() {
                MessageKind::File
            } else {
                MessageKind::Text
            },
            source,
            text: content,
            ..Default::default()
        })
    }

    /// Run raw attachment references through the media service so every
    /// downstream network gets a stable public URL.
    async fn resolve_attachments(
        ctx: &AdapterContext,
        attachments: Vec<StoatAttachment>,
    ) -> Vec<AttachmentDraft> {
        let mut drafts = Vec::with_capacity(attachments.len());
        for att in attachments {
            let options = MediaOptions {
                name: att.filename.clone(),
                mime_hint: att.content_type.clone(),
            };
            match ctx.storage.fetch_and_process(&att.url, &options).await {
                Ok(record) => drafts.push(AttachmentDraft {
                    id: Some(record.id),
                    url: Some(record.url),
                    mime_type: Some(record.mime_type),
                    size: Some(record.size).filter(|s| *s > 0).or(att.size),
                    name: Some(record.name),
                    ..Default::default()
                }),
                Err(err) => {
                    // Relay the origin URL rather than dropping the file.
                    warn!(url = %att.url, error = %err, "Media processing failed");
                    drafts.push(AttachmentDraft {
                        id: att.id,
                        url: Some(att.url),
                        mime_type: att.content_type,
                        size: att.size,
                        name: att.filename,
                        ..Default::default()
                    });
                }
            }
        }
        drafts
    }
}

#[async_trait]
impl Adapter for StoatAdapter {
    fn name(&self) -> &str {
        "stoat"
    }

    async fn init(&self, ctx: AdapterContext) -> Result<()> {
        self.ctx
            .set(ctx)
            .map_err(|_| CoreError::fatal("stoat adapter initialized twice"))?;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let ctx = self.ctx()?.clone();
        let client = self.client.clone();
        let token = self.token.clone();
        let base_url = self.base_url.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            info!("Stoat ingress poll started");
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(POLL_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                let channels = match ctx.repository.platform_channels("stoat") {
                    Ok(channels) => channels,
                    Err(err) => {
                        warn!(error = %err, "Failed to list Stoat channels");
                        continue;
                    }
                };

                for channel_id in channels {
                    let cursor_key = StoatAdapter::cursor_key(&channel_id);
                    let after = ctx.repository.kv_get(&cursor_key).ok().flatten();

                    let mut request = client
                        .get(format!("{base_url}/channels/{channel_id}/messages"))
                        .header("x-bot-token", &token)
                        .query(&[("sort", "oldest"), ("limit", "50")]);
                    if let Some(after) = &after {
                        request = request.query(&[("after", after.as_str())]);
                    }

                    let messages: Vec<StoatMessage> = match request.send().await {
                        Ok(response) if response.status().is_success() => {
                            match response.json().await {
                                Ok(messages) => messages,
                                Err(err) => {
                                    warn!(channel_id, error = %err, "Stoat message decode failed");
                                    continue;
                                }
                            }
                        }
                        Ok(response) => {
                            debug!(channel_id, status = %response.status(), "Stoat poll rejected");
                            continue;
                        }
                        Err(err) => {
                            warn!(channel_id, error = %err, "Stoat poll failed");
                            continue;
                        }
                    };

                    for mut msg in messages {
                        let msg_id = msg.id.clone();
                        let attachments = std::mem::take(&mut msg.attachments);
                        if let Some(mut params) =
                            StoatAdapter::convert_message(msg, &channel_id)
                        {
                            params.attachments =
                                StoatAdapter::resolve_attachments(&ctx, attachments).await;
                            match Envelope::new(params) {
                                Ok(envelope) => {
                                    if let Err(err) =
                                        ctx.bus.emit_envelope(EVENT_INGRESS, &envelope).await
                                    {
                                        error!(error = %err, "Failed to emit Stoat ingress");
                                    }
                                }
                                Err(err) => {
                                    debug!(error = %err, "Skipping malformed Stoat message")
                                }
                            }
                        }
                        if let Err(err) = ctx.repository.kv_set(&cursor_key, &msg_id) {
                            warn!(error = %err, "Failed to persist Stoat cursor");
                        }
                    }
                }
            }
            info!("Stoat ingress poll stopped");
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        Ok(())
    }

    async fn health(&self) -> Result<AdapterHealth> {
        let response = self
            .client
            .get(self.api_url("/users/@me"))
            .header("x-bot-token", &self.token)
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

        let mut masquerade = json!({
            "name": match envelope.head.source.username.trim() {
                "" => "OpenChat",
                name => name,
            },
        });
        if let Some(avatar) = &envelope.head.source.avatar {
            masquerade["avatar"] = json!(avatar);
        }
        let payload = json!({
            "content": envelope.degrade_to_text(),
            "masquerade": masquerade,
        });
        let body = serde_json::to_string(&payload)?;

        let response = self
            .client
            .post(self.api_url(&format!("/channels/{}/messages", dest.channel_id)))
            .header("x-bot-token", &self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(channel_id = %dest.channel_id, "Stoat message delivered");
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => CoreError::RateLimited {
                retry_after_ms: 1000,
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                CoreError::fatal(format!("Stoat rejected credentials: {detail}"))
            }
            _ => CoreError::transient(format!("Stoat API {status}: {detail}")),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StoatMessage {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    masquerade: Option<serde_json::Value>,
    #[serde(default)]
    attachments: Vec<StoatAttachment>,
}

#[derive(Debug, Deserialize)]
struct StoatAttachment {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    url: String,
}
