//! Media storage collaborator.
//!
//! Transcoding and persistence of attachments is delegated to an external
//! service; the core only needs the interface adapters call to resolve an
//! attachment URL into a stored record. The default implementation fetches
//! headers to learn type and size and rewrites the public URL under the CDN
//! base when one is configured.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct MediaOptions {
    /// Preferred file name, carried through to the stored record.
    pub name: Option<String>,
    /// Hint when the origin does not report a content type.
    pub mime_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaRecord {
    pub id: String,
    pub url: String,
    pub mime_type: String,
    pub size: u64,
    pub name: String,
}

#[async_trait]
pub trait MediaStorage: Send + Sync {
    async fn fetch_and_process(&self, url: &str, opts: &MediaOptions) -> Result<MediaRecord>;
}

/// Passthrough storage: media stays at its origin URL unless a CDN base is
/// configured, in which case the public link is rewritten under it.
pub struct CdnMediaStorage {
    client: Client,
    cdn_base: Option<String>,
}

impl CdnMediaStorage {
    pub fn new(cdn_base: Option<String>) -> Self {
        Self {
            client: Client::new(),
            cdn_base: cdn_base.map(|base| base.trim_end_matches('/').to_string()),
        }
    }

    fn public_url(&self, id: &str, origin: &str) -> String {
        match &self.cdn_base {
            Some(base) => format!("{base}/{id}"),
            None => origin.to_string(),
        }
    }
}

#[async_trait]
impl MediaStorage for CdnMediaStorage {
    async fn fetch_and_process(&self, url: &str, opts: &MediaOptions) -> Result<MediaRecord> {
        let id = Uuid::new_v4().to_string();

        let (mime_type, size) = match self.client.head(url).send().await {
            Ok(response) => {
                let mime = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string());
                let size = response
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                (mime, size)
            }
            Err(err) => {
                debug!(url, error = %err, "Media HEAD failed, using hints");
                (None, 0)
            }
        };

        Ok(MediaRecord {
            url: self.public_url(&id, url),
            mime_type: mime_type
                .or_else(|| opts.mime_hint.clone())
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size,
            name: opts.name.clone().unwrap_or_else(|| "attachment".to_string()),
            id,
        })
    }
}
