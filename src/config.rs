//! Configuration surface.
//!
//! Runtime options come from the environment (or flags); per-adapter tuning
//! comes from an optional TOML file. Absence of `REDIS_URL` selects the
//! in-process bus and queue mode.

use std::collections::HashMap;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::error::{CoreError, Result};
use crate::queue::{QueueOptions, RateLimit};

#[derive(Debug, Parser, Clone)]
#[command(author, version, about = "OpenChat bridge core daemon", long_about = None)]
pub struct DaemonConfig {
    /// Node identifier used in logs and health output
    #[arg(long, env = "NODE_ID", default_value = "openchat-1")]
    pub node_id: String,

    /// Path of the embedded topology database
    #[arg(long, env = "DB_PATH", default_value = "data/openchat_core.db")]
    pub db_path: String,

    /// Redis broker for the distributed bus; local mode when absent
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Discord bot token
    #[arg(long, env = "DISCORD_TOKEN")]
    pub discord_token: Option<String>,

    /// Telegram bot token
    #[arg(long, env = "TELEGRAM_TOKEN")]
    pub telegram_token: Option<String>,

    /// Stoat API token
    #[arg(long, env = "STOAT_TOKEN")]
    pub stoat_token: Option<String>,

    /// Phone number registered with signal-cli
    #[arg(long, env = "SIGNAL_PHONE")]
    pub signal_phone: Option<String>,

    /// signal-cli REST endpoint
    #[arg(long, env = "SIGNAL_CLI_URL", default_value = "http://127.0.0.1:8080")]
    pub signal_cli_url: String,

    /// WhatsApp Cloud API access token
    #[arg(long, env = "WHATSAPP_TOKEN")]
    pub whatsapp_token: Option<String>,

    /// WhatsApp Cloud API phone number id
    #[arg(long, env = "WHATSAPP_PHONE_ID")]
    pub whatsapp_phone_id: Option<String>,

    /// Optional OpenAI key handed to addon plugins
    #[arg(long, env = "OPENAI_API_KEY")]
    pub openai_api_key: Option<String>,

    /// S3 bucket for media offload
    #[arg(long, env = "S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// S3 region
    #[arg(long, env = "S3_REGION")]
    pub s3_region: Option<String>,

    /// S3-compatible endpoint override
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// Public CDN base URL used to rewrite stored media links
    #[arg(long, env = "CDN_URL")]
    pub cdn_url: Option<String>,

    /// error, warn, info, debug or trace
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Health endpoint port
    #[arg(long, env = "PORT", default_value_t = 8090)]
    pub port: u16,

    /// Comma-separated user ids granted operator rights (hashed at startup)
    #[arg(long, env = "GLOBAL_SUDO")]
    pub global_sudo: Option<String>,

    /// Path to a hot-reloadable ACL rules file
    #[arg(long, env = "ACL_PATH")]
    pub acl_path: Option<String>,

    /// Optional TOML file with per-adapter tuning
    #[arg(long, env = "OPENCHAT_CONFIG")]
    pub config_file: Option<String>,
}

impl DaemonConfig {
    /// Parse the adapter tuning file when configured.
    pub fn load_file_config(&self) -> Result<FileConfig> {
        let Some(path) = &self.config_file else {
            return Ok(FileConfig::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::InvalidConfig(format!("read {path}: {e}")))?;
        toml::from_str(&raw).map_err(|e| CoreError::InvalidConfig(format!("parse {path}: {e}")))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub adapters: HashMap<String, AdapterTuning>,
}

impl FileConfig {
    pub fn tuning(&self, platform: &str) -> AdapterTuning {
        self.adapters.get(platform).cloned().unwrap_or_default()
    }
}

/// Per-adapter overrides layered over each platform's built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterTuning {
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub reset_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max: u32,
    pub duration_ms: u64,
}

impl AdapterTuning {
    pub fn queue_options(&self, defaults: QueueOptions) -> QueueOptions {
        QueueOptions {
            concurrency: self.concurrency.unwrap_or(defaults.concurrency),
            rate_limit: self
                .rate_limit
                .map(|rl| RateLimit {
                    max: rl.max,
                    duration_ms: rl.duration_ms,
                })
                .or(defaults.rate_limit),
            attempts: self.attempts.unwrap_or(defaults.attempts),
            backoff_ms: self.backoff_ms.unwrap_or(defaults.backoff_ms),
            ..defaults
        }
    }

    pub fn breaker_config(&self, defaults: BreakerConfig) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            reset_timeout: self
                .reset_timeout_secs
                .map(std::time::Duration::from_secs)
                .unwrap_or(defaults.reset_timeout),
            request_timeout: self
                .request_timeout_secs
                .map(std::time::Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_overrides_defaults() {
        let toml_str = r#"
            [adapters.telegram]
            rate_limit = { max = 30, duration_ms = 1000 }
            concurrency = 2

            [adapters.whatsapp]
            rate_limit = { max = 5, duration_ms = 2000 }
            request_timeout_secs = 20
        "#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();

        let telegram = config
            .tuning("telegram")
            .queue_options(QueueOptions::default());
        assert_eq!(telegram.concurrency, 2);
        let rl = telegram.rate_limit.unwrap();
        assert_eq!((rl.max, rl.duration_ms), (30, 1000));

        let breaker = config
            .tuning("whatsapp")
            .breaker_config(BreakerConfig::default());
        assert_eq!(breaker.request_timeout.as_secs(), 20);
        assert_eq!(breaker.failure_threshold, 5);
    }

    #[test]
    fn missing_tuning_keeps_defaults() {
        let config = FileConfig::default();
        let options = config.tuning("signal").queue_options(QueueOptions {
            concurrency: 1,
            ..Default::default()
        });
        assert_eq!(options.concurrency, 1);
        assert!(options.rate_limit.is_none());
    }
}
