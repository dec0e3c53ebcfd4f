//! Adapter contract.
//!
//! Each platform integration implements [`Adapter`] and registers itself
//! into the [`AdapterRegistry`] at kernel init; adapters are statically
//! linked, there is no dynamic loading. The core hands every adapter an
//! immutable [`AdapterContext`] and installs an egress processor on the
//! adapter's queue that validates the envelope, announces the pre-egress
//! transform hook and invokes `process_egress` inside the adapter's circuit
//! breaker. Adapters emit ingress by constructing envelopes (which
//! validates them) and publishing `message.ingress`; the core re-validates
//! at the pipeline head regardless.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::breaker::CircuitBreaker;
use crate::bus::{transform_event, MessageBus};
use crate::envelope::Envelope;
use crate::error::{CoreError, Result};
use crate::queue::{Processor, QueueManager};
use crate::repository::Repository;
use crate::storage::MediaStorage;

pub mod discord;
pub mod signal;
pub mod stoat;
pub mod telegram;
pub mod whatsapp;

/// Dependencies an adapter may use, fixed at init time.
#[derive(Clone)]
pub struct AdapterContext {
    pub name: String,
    pub config: serde_json::Value,
    pub bus: Arc<MessageBus>,
    pub repository: Arc<Repository>,
    pub queues: Arc<QueueManager>,
    pub storage: Arc<dyn MediaStorage>,
    pub breaker: Arc<CircuitBreaker>,
}

#[derive(Debug, Clone)]
pub struct AdapterHealth {
    pub online: bool,
    pub checked_at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl AdapterHealth {
    pub fn online() -> Self {
        Self {
            online: true,
            checked_at: Utc::now(),
            detail: None,
        }
    }

    pub fn offline(detail: impl Into<String>) -> Self {
        Self {
            online: false,
            checked_at: Utc::now(),
            detail: Some(detail.into()),
        }
    }
}

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Lowercased platform name; also the queue suffix.
    fn name(&self) -> &str;

    async fn init(&self, ctx: AdapterContext) -> Result<()>;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn health(&self) -> Result<AdapterHealth>;

    /// Deliver one outbound envelope copy to the external network.
    async fn process_egress(&self, envelope: &Envelope) -> Result<()>;
}

/// Keeps registration order so shutdown can reverse startup.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<Vec<Arc<dyn Adapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: Arc<dyn Adapter>) {
        let mut adapters = self.adapters.write().expect("registry lock");
        adapters.retain(|existing| existing.name() != adapter.name());
        adapters.push(adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters
            .read()
            .expect("registry lock")
            .iter()
            .find(|adapter| adapter.name() == name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters
            .read()
            .expect("registry lock")
            .iter()
            .map(|adapter| adapter.name().to_string())
            .collect()
    }

    /// Adapters in registration order.
    pub fn all(&self) -> Vec<Arc<dyn Adapter>> {
        self.adapters.read().expect("registry lock").to_vec()
    }
}

/// Build the queue processor the kernel installs for one adapter.
pub fn egress_processor(
    adapter: Arc<dyn Adapter>,
    breaker: Arc<CircuitBreaker>,
    bus: Arc<MessageBus>,
) -> Processor {
    Arc::new(move |job| {
        let adapter = Arc::clone(&adapter);
        let breaker = Arc::clone(&breaker);
        let bus = Arc::clone(&bus);
        Box::pin(async move {
            let envelope = job.envelope;
            if !envelope.validate() {
                return Err(CoreError::InvalidEnvelope(format!(
                    "egress job {} carries an invalid envelope",
                    job.id
                )));
            }

            // Pre-egress hook for addons; delivery failures here never
            // block the send.
            if let Err(err) = bus
                .emit_envelope(&transform_event(adapter.name()), &envelope)
                .await
            {
                warn!(
                    platform = adapter.name(),
                    error = %err,
                    "Transform hook emit failed"
                );
            }

            breaker.call(adapter.process_egress(&envelope)).await
        })
    })
}

/// Name-prefix identity degradation for platforms without a native
/// masquerade mechanism.
pub fn masquerade_prefix(envelope: &Envelope) -> String {
    let username = envelope.head.source.username.trim();
    if username.is_empty() {
        String::new()
    } else {
        format!("**{username}**: ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::envelope::{EnvelopeParams, SourceRef};
    use crate::queue::Job;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NullAdapter {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Adapter for NullAdapter {
        fn name(&self) -> &str {
            "stoat"
        }

        async fn init(&self, _ctx: AdapterContext) -> Result<()> {
            Ok(())
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        async fn health(&self) -> Result<AdapterHealth> {
            Ok(AdapterHealth::online())
        }

        async fn process_egress(&self, _envelope: &Envelope) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn envelope() -> Envelope {
        let mut source = SourceRef::new("discord", "c1");
        source.username = "ana".to_string();
        Envelope::new(EnvelopeParams {
            source,
            text: "hola".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn egress_processor_rejects_invalid_envelope() {
        let adapter = Arc::new(NullAdapter {
            calls: AtomicU32::new(0),
        });
        let breaker = Arc::new(CircuitBreaker::new("stoat_api", BreakerConfig::default()));
        let bus = MessageBus::local();
        let processor = egress_processor(adapter.clone(), breaker, bus);

        let mut env = envelope();
        env.head.id = String::new();
        let result = processor(Job {
            id: "j1".to_string(),
            envelope: env,
            attempt: 1,
        })
        .await;

        assert!(matches!(result, Err(CoreError::InvalidEnvelope(_))));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn egress_processor_invokes_adapter() {
        let adapter = Arc::new(NullAdapter {
            calls: AtomicU32::new(0),
        });
        let breaker = Arc::new(CircuitBreaker::new("stoat_api", BreakerConfig::default()));
        let bus = MessageBus::local();
        let processor = egress_processor(adapter.clone(), breaker.clone(), bus);

        processor(Job {
            id: "j1".to_string(),
            envelope: envelope(),
            attempt: 1,
        })
        .await
        .unwrap();

        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.metrics().success, 1);
    }

    #[test]
    fn masquerade_prefix_uses_username() {
        assert_eq!(masquerade_prefix(&envelope()), "**ana**: ");

        let mut anonymous = envelope();
        anonymous.head.source.username = String::new();
        assert_eq!(masquerade_prefix(&anonymous), "");
    }

    #[test]
    fn registry_lookup() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(NullAdapter {
            calls: AtomicU32::new(0),
        }));
        assert!(registry.get("stoat").is_some());
        assert!(registry.get("matrix").is_none());
        assert_eq!(registry.names(), vec!["stoat".to_string()]);
    }
}
