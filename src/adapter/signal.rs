//! Signal adapter.
//!
//! Egress goes through a signal-cli REST sidecar. signal-cli serializes its
//! own sends, so this adapter's queue runs at concurrency 1; identity
//! degrades to a name prefix.

use std::sync::OnceLock;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::debug;

use super::{masquerade_prefix, Adapter, AdapterContext, AdapterHealth};
use crate::envelope::Envelope;
use crate::error::{CoreError, Result};

pub struct SignalAdapter {
    phone_number: String,
    base_url: String,
    client: Client,
    ctx: OnceLock<AdapterContext>,
}

impl SignalAdapter {
    pub fn new(phone_number: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let phone_number = phone_number.into();
        if phone_number.trim().is_empty() {
            return Err(CoreError::InvalidConfig(
                "Signal phone number cannot be empty".into(),
            ));
        }
        Ok(Self {
            phone_number,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            ctx: OnceLock::new(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Adapter for SignalAdapter {
    fn name(&self) -> &str {
        "signal"
    }

    async fn init(&self, ctx: AdapterContext) -> Result<()> {
        self.ctx
            .set(ctx)
            .map_err(|_| CoreError::fatal("signal adapter initialized twice"))?;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> Result<AdapterHealth> {
        let response = self.client.get(self.api_url("/v1/about")).send().await?;
        Ok(if response.status().is_success() {
            AdapterHealth::online()
        } else {
            AdapterHealth::offline(format!("signal-cli returned {}", response.status()))
        })
    }

    async fn process_egress(&self, envelope: &Envelope) -> Result<()> {
        let dest = envelope
            .head
            .dest
            .as_ref()
            .ok_or_else(|| CoreError::InvalidEnvelope("egress envelope without dest".into()))?;

        let message = format!("{}{}", masquerade_prefix(envelope), envelope.degrade_to_text());
        let payload = json!({
            "message": message,
            "number": self.phone_number,
            "recipients": [dest.channel_id],
        });

        let response = self
            .client
            .post(self.api_url("/v2/send"))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(recipient = %dest.channel_id, "Signal message delivered");
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => CoreError::RateLimited {
                retry_after_ms: 2000,
            },
            _ => CoreError::transient(format!("signal-cli {status}: {detail}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_phone_is_rejected() {
        assert!(SignalAdapter::new("", "http://127.0.0.1:8080").is_err());
    }

    #[test]
    fn base_url_is_normalized() {
        let adapter = SignalAdapter::new("+491700000000", "http://127.0.0.1:8080/").unwrap();
        assert_eq!(adapter.api_url("/v2/send"), "http://127.0.0.1:8080/v2/send");
    }
}
