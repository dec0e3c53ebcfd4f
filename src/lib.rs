//! OpenChat Core
//!
//! Bridge routing and delivery subsystem for a multi-platform chat bridge:
//! adapters normalize platform messages into a single envelope format, the
//! router fans envelopes out across bridge topologies with split-horizon and
//! trace-path loop prevention, and per-platform queues deliver them through
//! token-bucket rate limiting and circuit breakers.
//!
//! ## Key components
//!
//! - **Envelope (UMF)**: canonical message structure with validation and
//!   text degradation for platforms without rich rendering
//! - **Repository**: embedded SQLite store of bridges, channel links and KV
//! - **MessageBus**: in-process dispatcher, or Redis pub/sub when
//!   `REDIS_URL` is set
//! - **Router**: topology resolution, loop guards, per-destination fan-out
//! - **QueueManager**: per-platform FIFO queues with retries and dead-letter
//! - **BreakerRegistry**: per-service closed/open/half-open circuit breakers
//! - **Kernel**: ordered startup, dependency wiring, graceful shutdown
//!
//! ## Usage
//!
//! ```rust,ignore
//! use clap::Parser;
//! use openchat_core::config::DaemonConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = DaemonConfig::parse();
//! openchat_core::kernel::run(config).await?;
//! # Ok(())
//! # }
//! ```

pub mod acl;
pub mod adapter;
pub mod breaker;
pub mod bus;
pub mod config;
pub mod context;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod health;
pub mod kernel;
pub mod queue;
pub mod repository;
pub mod router;
pub mod storage;

pub use adapter::{Adapter, AdapterContext, AdapterHealth, AdapterRegistry};
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use bus::{BusMessage, BusMode, MessageBus};
pub use config::{DaemonConfig, FileConfig};
pub use context::{with_correlation, CorrelationContext};
pub use dedup::DedupFilter;
pub use envelope::{Attachment, Envelope, EnvelopeParams, MessageKind, RichContent, SourceRef};
pub use error::{CoreError, Result};
pub use kernel::Kernel;
pub use queue::{Job, QueueManager, QueueOptions, RateLimit};
pub use repository::{Bridge, BridgeStatus, ChannelLink, LinkRequest, Repository};
pub use router::{RouteOutcome, Router};
pub use storage::{MediaRecord, MediaStorage};
