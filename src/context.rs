//! Correlation context propagation across asynchronous boundaries.
//!
//! Every unit of work derived from an envelope (ingress dispatch, router
//! fan-out, queue processing, adapter egress) runs inside a task-local frame
//! carrying the originating correlation id, so log records attribute to the
//! message that caused them. The id survives serialization into queue
//! payloads via `head.correlation_id`.

use std::future::Future;

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CorrelationContext {
    pub correlation_id: String,
    pub source: Option<String>,
}

impl CorrelationContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            source: None,
        }
    }

    pub fn with_source(correlation_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            source: Some(source.into()),
        }
    }
}

tokio::task_local! {
    static CURRENT: CorrelationContext;
}

/// Run `fut` inside the given correlation frame.
pub async fn with_correlation<F>(ctx: CorrelationContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(ctx, fut).await
}

/// The correlation frame of the current task, if any.
pub fn current() -> Option<CorrelationContext> {
    CURRENT.try_with(|ctx| ctx.clone()).ok()
}

/// The current correlation id, or a fresh UUID when no upstream frame exists.
pub fn current_or_new_id() -> String {
    current()
        .map(|ctx| ctx.correlation_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_is_task_local() {
        assert!(current().is_none());

        let ctx = CorrelationContext::with_source("corr-1", "discord:c1");
        let seen = with_correlation(ctx, async {
            let inner = current().expect("frame visible inside scope");
            (inner.correlation_id, inner.source)
        })
        .await;

        assert_eq!(seen.0, "corr-1");
        assert_eq!(seen.1.as_deref(), Some("discord:c1"));
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn fallback_generates_fresh_id() {
        let a = current_or_new_id();
        let b = current_or_new_id();
        assert_ne!(a, b);

        let fixed = with_correlation(CorrelationContext::new("fixed"), async {
            current_or_new_id()
        })
        .await;
        assert_eq!(fixed, "fixed");
    }
}
