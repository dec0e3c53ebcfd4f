//! WhatsApp adapter (Cloud API).
//!
//! Text-only egress through the Graph API; WhatsApp has no masquerade, so
//! identity degrades to a bold name prefix. Ingress arrives via the webhook
//! feed outside the core.

use std::sync::OnceLock;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{masquerade_prefix, Adapter, AdapterContext, AdapterHealth};
use crate::envelope::Envelope;
use crate::error::{CoreError, Result};

const GRAPH_BASE: &str = "https://graph.facebook.com";
const API_VERSION: &str = "v21.0";

pub struct WhatsAppAdapter {
    access_token: String,
    phone_number_id: String,
    client: Client,
    ctx: OnceLock<AdapterContext>,
}

impl WhatsAppAdapter {
    pub fn new(
        access_token: impl Into<String>,
        phone_number_id: impl Into<String>,
    ) -> Result<Self> {
        let access_token = access_token.into();
        let phone_number_id = phone_number_id.into();
        if access_token.trim().is_empty() || phone_number_id.trim().is_empty() {
            return Err(CoreError::InvalidConfig(
                "WhatsApp access token and phone number id are required".into(),
            ));
        }
        Ok(Self {
            access_token,
            phone_number_id,
            client: Client::new(),
            ctx: OnceLock::new(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{GRAPH_BASE}/{API_VERSION}/{path}")
    }
}

#[async_trait]
impl Adapter for WhatsAppAdapter {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn init(&self, ctx: AdapterContext) -> Result<()> {
        self.ctx
            .set(ctx)
            .map_err(|_| CoreError::fatal("whatsapp adapter initialized twice"))?;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> Result<AdapterHealth> {
        let response = self
            .client
            .get(self.api_url(&self.phone_number_id))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        Ok(if response.status().is_success() {
            AdapterHealth::online()
        } else {
            AdapterHealth::offline(format!(
                "phone number lookup returned {}",
                response.status()
            ))
        })
    }

    async fn process_egress(&self, envelope: &Envelope) -> Result<()> {
        let dest = envelope
            .head
            .dest
            .as_ref()
            .ok_or_else(|| CoreError::InvalidEnvelope("egress envelope without dest".into()))?;

        let body = format!("{}{}", masquerade_prefix(envelope), envelope.degrade_to_text());
        let payload = json!({
            "messaging_product": "whatsapp",
            "to": dest.channel_id,
            "type": "text",
            "text": { "body": body },
        });

        let response = self
            .client
            .post(self.api_url(&format!("{}/messages", self.phone_number_id)))
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(to = %dest.channel_id, "WhatsApp message delivered");
            return Ok(());
        }

        let error: GraphErrorBody = response.json().await.unwrap_or_default();
        let detail = error
            .error
            .map(|e| e.message)
            .unwrap_or_else(|| "unknown error".to_string());
        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => CoreError::RateLimited {
                retry_after_ms: 2000,
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                CoreError::fatal(format!("WhatsApp rejected credentials: {detail}"))
            }
            _ => CoreError::transient(format!("WhatsApp API {status}: {detail}")),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct GraphErrorBody {
    #[serde(default)]
    error: Option<GraphError>,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: String,
}
