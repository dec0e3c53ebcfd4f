//! Unified message format (UMF).
//!
//! Every message entering the core is normalized into an [`Envelope`]:
//! a `head` with routing metadata and a `body` with content. Envelopes are
//! immutable once emitted onto the bus except for `head.dest` and
//! `head.trace_path`, which the router sets per outbound clone. Cloning an
//! envelope copies the head and shares the body, so fan-out never duplicates
//! attachment payloads and sibling clones cannot observe each other's
//! trace-path mutations.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
    Sticker,
    System,
}

/// Originating endpoint of an envelope. `platform` and `channel_id` are
/// normalized (lowercased, trimmed) at construction.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceRef {
    pub platform: String,
    pub channel_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl SourceRef {
    pub fn new(platform: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            platform: normalize(platform.into()),
            channel_id: normalize(channel_id.into()),
            user_id: String::new(),
            username: String::new(),
            avatar: None,
        }
    }

    pub fn token(&self) -> String {
        endpoint_token(&self.platform, &self.channel_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestRef {
    pub platform: String,
    pub channel_id: String,
}

impl DestRef {
    pub fn token(&self) -> String {
        endpoint_token(&self.platform, &self.channel_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyTo {
    pub parent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RichContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl RichContent {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.url.is_none()
    }
}

/// Attachment record. Every field has a stable default so downstream code
/// never dereferences a missing value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub url: String,
    pub kind: MessageKind,
    pub mime_type: String,
    pub size: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

impl Default for Attachment {
    fn default() -> Self {
        Self {
            id: String::new(),
            url: String::new(),
            kind: MessageKind::File,
            mime_type: "application/octet-stream".to_string(),
            size: 0,
            name: "attachment".to_string(),
            local_path: None,
        }
    }
}

/// Loosely-populated attachment input as adapters receive it from platform
/// APIs; [`Attachment::from_draft`] fills the gaps.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttachmentDraft {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub kind: Option<MessageKind>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub local_path: Option<String>,
}

impl Attachment {
    pub fn from_draft(draft: AttachmentDraft) -> Self {
        let defaults = Attachment::default();
        Self {
            id: draft.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            url: draft.url.unwrap_or(defaults.url),
            kind: draft.kind.unwrap_or(defaults.kind),
            mime_type: draft.mime_type.unwrap_or(defaults.mime_type),
            size: draft.size.unwrap_or(0),
            name: draft.name.unwrap_or(defaults.name),
            local_path: draft.local_path,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Head {
    pub id: String,
    pub correlation_id: String,
    /// Creation time, milliseconds since epoch.
    pub timestamp: i64,
    pub kind: MessageKind,
    pub source: SourceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<DestRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
    #[serde(default)]
    pub trace_path: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Body {
    #[serde(default)]
    pub text: String,
    /// Original text before any transformation.
    #[serde(default)]
    pub raw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rich: Option<RichContent>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub head: Head,
    pub body: Arc<Body>,
}

/// Construction parameters for [`Envelope::new`].
#[derive(Debug, Clone, Default)]
pub struct EnvelopeParams {
    pub kind: MessageKind,
    pub source: SourceRef,
    pub text: String,
    pub raw: Option<String>,
    pub rich: Option<RichContent>,
    pub attachments: Vec<AttachmentDraft>,
    pub reply_to: Option<ReplyTo>,
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// Build a validated envelope. Fails when the source platform or channel
    /// is empty. The trace path starts at the source token and the
    /// correlation id defaults to the envelope id.
    pub fn new(params: EnvelopeParams) -> Result<Self> {
        let mut source = params.source;
        source.platform = normalize(std::mem::take(&mut source.platform));
        source.channel_id = normalize(std::mem::take(&mut source.channel_id));

        if source.platform.is_empty() {
            return Err(CoreError::InvalidEnvelope("source.platform is empty".into()));
        }
        if source.channel_id.is_empty() {
            return Err(CoreError::InvalidEnvelope(
                "source.channel_id is empty".into(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let correlation_id = params.correlation_id.unwrap_or_else(|| id.clone());
        let trace_path = vec![source.token()];

        let raw = params.raw.unwrap_or_else(|| params.text.clone());
        let attachments = params
            .attachments
            .into_iter()
            .map(Attachment::from_draft)
            .collect();

        Ok(Self {
            head: Head {
                id,
                correlation_id,
                timestamp: Utc::now().timestamp_millis(),
                kind: params.kind,
                source,
                dest: None,
                reply_to: params.reply_to,
                trace_path,
            },
            body: Arc::new(Body {
                text: params.text,
                raw,
                rich: params.rich,
                attachments,
            }),
        })
    }

    /// Schema validation applied at the bus boundary. The core never routes
    /// an envelope that fails this check.
    pub fn validate(&self) -> bool {
        !self.head.id.is_empty()
            && !self.head.source.platform.is_empty()
            && !self.head.source.channel_id.is_empty()
    }

    pub fn source_token(&self) -> String {
        self.head.source.token()
    }

    /// Flatten rich content and attachments into plain text for platforms
    /// without native rendering. Re-applying to a text-only envelope built
    /// from the output is a no-op.
    pub fn degrade_to_text(&self) -> String {
        let mut out = self.body.text.clone();

        if let Some(rich) = &self.body.rich {
            if let Some(title) = &rich.title {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&format!("*{title}*\n"));
            }
            if let Some(description) = &rich.description {
                out.push_str(description);
            }
            if let Some(url) = &rich.url {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&format!("Enlace: {url}"));
            }
        }

        for attachment in &self.body.attachments {
            out.push_str(&format!(
                "\n\n[Adjunto]: {}: {}",
                attachment.name, attachment.url
            ));
        }

        out
    }
}

pub fn endpoint_token(platform: &str, channel_id: &str) -> String {
    format!("{platform}:{channel_id}")
}

fn normalize(value: String) -> String {
    value.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(platform: &str, channel: &str) -> EnvelopeParams {
        EnvelopeParams {
            source: SourceRef {
                platform: platform.to_string(),
                channel_id: channel.to_string(),
                user_id: "u1".to_string(),
                username: "ana".to_string(),
                avatar: None,
            },
            text: "hola".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn new_envelope_validates() {
        let env = Envelope::new(params("Discord", " C1 ")).unwrap();
        assert!(env.validate());
        assert_eq!(env.head.source.platform, "discord");
        assert_eq!(env.head.source.channel_id, "c1");
        assert_eq!(env.head.trace_path, vec!["discord:c1".to_string()]);
        assert_eq!(env.head.correlation_id, env.head.id);
        assert_eq!(env.body.raw, "hola");
    }

    #[test]
    fn empty_source_is_rejected() {
        let err = Envelope::new(params("", "c1")).unwrap_err();
        assert!(matches!(err, CoreError::InvalidEnvelope(_)));
        let err = Envelope::new(params("discord", "  ")).unwrap_err();
        assert!(matches!(err, CoreError::InvalidEnvelope(_)));
    }

    #[test]
    fn clone_shares_body_but_not_trace_path() {
        let env = Envelope::new(params("discord", "c1")).unwrap();
        let mut clone = env.clone();
        clone.head.trace_path.push("telegram:t1".to_string());
        clone.head.dest = Some(DestRef {
            platform: "telegram".to_string(),
            channel_id: "t1".to_string(),
        });

        assert_eq!(env.head.trace_path.len(), 1);
        assert!(env.head.dest.is_none());
        assert!(Arc::ptr_eq(&env.body, &clone.body));
    }

    #[test]
    fn attachment_drafts_get_defaults() {
        let mut p = params("discord", "c1");
        p.attachments = vec![AttachmentDraft {
            url: Some("https://cdn.example/x.png".to_string()),
            ..Default::default()
        }];
        let env = Envelope::new(p).unwrap();
        let att = &env.body.attachments[0];
        assert!(!att.id.is_empty());
        assert_eq!(att.mime_type, "application/octet-stream");
        assert_eq!(att.name, "attachment");
        assert_eq!(att.size, 0);
    }

    #[test]
    fn degradation_appends_rich_then_attachments() {
        let mut p = params("discord", "c1");
        p.rich = Some(RichContent {
            title: Some("Titulo".to_string()),
            description: Some("desc".to_string()),
            url: Some("https://example.com".to_string()),
        });
        p.attachments = vec![AttachmentDraft {
            name: Some("foto.png".to_string()),
            url: Some("https://cdn.example/foto.png".to_string()),
            ..Default::default()
        }];
        let env = Envelope::new(p).unwrap();
        let text = env.degrade_to_text();

        assert!(text.starts_with("hola\n*Titulo*\ndesc"));
        assert!(text.contains("Enlace: https://example.com"));
        assert!(text.ends_with("[Adjunto]: foto.png: https://cdn.example/foto.png"));
    }

    #[test]
    fn degradation_is_idempotent_for_text_only() {
        let mut p = params("discord", "c1");
        p.rich = Some(RichContent {
            title: Some("t".to_string()),
            ..Default::default()
        });
        let env = Envelope::new(p).unwrap();
        let degraded = env.degrade_to_text();

        let mut rebuilt = params("discord", "c1");
        rebuilt.text = degraded.clone();
        let rebuilt = Envelope::new(rebuilt).unwrap();
        assert_eq!(rebuilt.degrade_to_text(), degraded);
    }

    #[test]
    fn serde_round_trip() {
        let env = Envelope::new(params("discord", "c1")).unwrap();
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.head.id, env.head.id);
        assert_eq!(back.body.text, "hola");
        assert!(back.validate());
    }
}
