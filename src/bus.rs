//! Dual-mode pub/sub bus.
//!
//! Local mode dispatches through an in-process queue: one dispatcher task
//! drains emits in order and invokes listeners sequentially, so per-event
//! delivery order matches emit order and emitters never recurse into
//! handlers. Distributed mode publishes serialized messages to a Redis
//! channel named after the event; a dedicated subscriber connection
//! deserializes and re-emits locally. Publisher and subscriber are two
//! physically separate connections. No cross-process ordering guarantee.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::context;
use crate::envelope::Envelope;
use crate::error::{CoreError, Result};

pub const EVENT_INGRESS: &str = "message.ingress";
pub const EVENT_READY: &str = "system.ready";
pub const EVENT_SHUTDOWN: &str = "system.shutdown";

/// Topic for the optional pre-egress mutator hook of one platform.
pub fn transform_event(platform: &str) -> String {
    format!("bridge.transform.{platform}")
}

const DEFAULT_MAX_LISTENERS: usize = 100;
const CHANNEL_PREFIX: &str = "openchat";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub event: String,
    pub correlation_id: String,
    pub payload: Value,
}

impl BusMessage {
    pub fn envelope(&self) -> Result<Envelope> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

pub type Handler = Arc<dyn Fn(BusMessage) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionId {
    event: String,
    id: u64,
}

struct Listener {
    id: u64,
    handler: Handler,
    once: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    Local,
    Distributed,
}

impl BusMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Distributed => "distributed",
        }
    }
}

pub struct MessageBus {
    mode: BusMode,
    redis_url: Option<String>,
    max_listeners: usize,
    listeners: Arc<RwLock<HashMap<String, Vec<Listener>>>>,
    next_id: AtomicU64,
    dispatch_tx: mpsc::UnboundedSender<BusMessage>,
    publisher: RwLock<Option<redis::aio::ConnectionManager>>,
    subscriber_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MessageBus {
    /// In-process bus, no broker.
    pub fn local() -> Arc<Self> {
        Self::build(BusMode::Local, None, DEFAULT_MAX_LISTENERS)
    }

    /// Broker-backed bus. Connections are opened by [`MessageBus::connect`].
    pub fn distributed(redis_url: impl Into<String>) -> Arc<Self> {
        Self::build(
            BusMode::Distributed,
            Some(redis_url.into()),
            DEFAULT_MAX_LISTENERS,
        )
    }

    pub fn with_max_listeners(mode: BusMode, redis_url: Option<String>, max: usize) -> Arc<Self> {
        Self::build(mode, redis_url, max)
    }

    fn build(mode: BusMode, redis_url: Option<String>, max_listeners: usize) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let listeners: Arc<RwLock<HashMap<String, Vec<Listener>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        tokio::spawn(dispatch_loop(dispatch_rx, Arc::clone(&listeners)));

        Arc::new(Self {
            mode,
            redis_url,
            max_listeners,
            listeners,
            next_id: AtomicU64::new(1),
            dispatch_tx,
            publisher: RwLock::new(None),
            subscriber_task: std::sync::Mutex::new(None),
        })
    }

    pub fn mode(&self) -> BusMode {
        self.mode
    }

    /// Open broker connections in distributed mode; a no-op locally.
    pub async fn connect(&self) -> Result<()> {
        let Some(url) = &self.redis_url else {
            return Ok(());
        };

        let client = redis::Client::open(url.as_str())?;
        let manager = client.get_connection_manager().await?;
        *self.publisher.write().expect("publisher lock") = Some(manager);

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{CHANNEL_PREFIX}:*")).await?;

        let dispatch_tx = self.dispatch_tx.clone();
        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(error = %err, "Failed to read bus payload from broker");
                        continue;
                    }
                };
                match serde_json::from_str::<BusMessage>(&payload) {
                    Ok(message) => {
                        if dispatch_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "Discarding malformed bus message from broker");
                    }
                }
            }
            info!("Bus subscriber connection closed");
        });
        *self.subscriber_task.lock().expect("subscriber lock") = Some(task);

        info!(url = %url, "Bus connected to broker");
        Ok(())
    }

    pub async fn disconnect(&self) {
        if let Some(task) = self.subscriber_task.lock().expect("subscriber lock").take() {
            task.abort();
        }
        *self.publisher.write().expect("publisher lock") = None;
    }

    /// Publish an event. The payload is enriched with the current
    /// correlation id when the caller did not establish one.
    pub async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        let message = BusMessage {
            event: event.to_string(),
            correlation_id: context::current_or_new_id(),
            payload,
        };

        match self.mode {
            BusMode::Local => {
                self.dispatch_tx
                    .send(message)
                    .map_err(|_| CoreError::fatal("bus dispatcher is gone"))?;
            }
            BusMode::Distributed => {
                let manager = self
                    .publisher
                    .read()
                    .expect("publisher lock")
                    .clone()
                    .ok_or_else(|| CoreError::transient("bus publisher not connected"))?;
                let mut conn = manager;
                let channel = format!("{CHANNEL_PREFIX}:{event}");
                let body = serde_json::to_string(&message)?;
                redis::AsyncCommands::publish::<_, _, ()>(&mut conn, channel, body).await?;
            }
        }
        Ok(())
    }

    pub async fn emit_envelope(&self, event: &str, envelope: &Envelope) -> Result<()> {
        let ctx = context::CorrelationContext::with_source(
            envelope.head.correlation_id.clone(),
            envelope.source_token(),
        );
        context::with_correlation(ctx, self.emit(event, serde_json::to_value(envelope)?)).await
    }

    pub fn on(&self, event: &str, handler: Handler) -> SubscriptionId {
        self.register(event, handler, false)
    }

    /// Like [`MessageBus::on`], but the listener is removed after its first
    /// invocation.
    pub fn once(&self, event: &str, handler: Handler) -> SubscriptionId {
        self.register(event, handler, true)
    }

    fn register(&self, event: &str, handler: Handler, once: bool) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.listeners.write().expect("listeners lock");
        let entry = map.entry(event.to_string()).or_default();
        if entry.len() >= self.max_listeners {
            warn!(
                event,
                count = entry.len(),
                max = self.max_listeners,
                "Listener count exceeds configured maximum"
            );
        }
        entry.push(Listener { id, handler, once });
        SubscriptionId {
            event: event.to_string(),
            id,
        }
    }

    pub fn off(&self, subscription: &SubscriptionId) {
        let mut map = self.listeners.write().expect("listeners lock");
        if let Some(entry) = map.get_mut(&subscription.event) {
            entry.retain(|l| l.id != subscription.id);
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .expect("listeners lock")
            .get(event)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<BusMessage>,
    listeners: Arc<RwLock<HashMap<String, Vec<Listener>>>>,
) {
    while let Some(message) = rx.recv().await {
        let handlers: Vec<Handler> = {
            let mut map = listeners.write().expect("listeners lock");
            match map.get_mut(&message.event) {
                Some(entry) => {
                    let snapshot = entry.iter().map(|l| Arc::clone(&l.handler)).collect();
                    entry.retain(|l| !l.once);
                    snapshot
                }
                None => Vec::new(),
            }
        };

        if handlers.is_empty() {
            debug!(event = %message.event, "No listeners for bus event");
            continue;
        }

        let ctx = context::CorrelationContext::new(message.correlation_id.clone());
        for handler in handlers {
            let fut = handler(message.clone());
            if let Err(panic) = tokio::spawn(context::with_correlation(ctx.clone(), fut)).await {
                error!(event = %message.event, error = %panic, "Bus listener panicked");
            }
        }
    }
}
