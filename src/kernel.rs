//! Kernel: dependency wiring and lifecycle.
//!
//! Startup order: config, tracing, bus, repository, storage, queues,
//! breakers, ACL, adapter registration/init, adapter start, health server,
//! `system.ready`. Shutdown runs the reverse order exactly once; a failing
//! step is logged and never prevents the remaining subsystems from closing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::acl::Acl;
use crate::adapter::{
    discord::DiscordAdapter, egress_processor, signal::SignalAdapter, stoat::StoatAdapter,
    telegram::TelegramAdapter, whatsapp::WhatsAppAdapter, Adapter, AdapterContext,
    AdapterRegistry,
};
use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::bus::{MessageBus, EVENT_INGRESS, EVENT_READY, EVENT_SHUTDOWN};
use crate::config::{DaemonConfig, FileConfig};
use crate::dedup::DedupFilter;
use crate::health::{self, HealthState};
use crate::queue::{queue_name, QueueManager, QueueOptions, RateLimit};
use crate::repository::Repository;
use crate::router::Router;
use crate::storage::{CdnMediaStorage, MediaStorage};

const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const ACL_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub fn init_tracing(log_level: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

pub struct Kernel {
    pub config: DaemonConfig,
    pub file_config: FileConfig,
    pub bus: Arc<MessageBus>,
    pub repository: Arc<Repository>,
    pub storage: Arc<dyn MediaStorage>,
    pub queues: Arc<QueueManager>,
    pub breakers: Arc<BreakerRegistry>,
    pub acl: Arc<Acl>,
    pub adapters: Arc<AdapterRegistry>,
    pub dedup: Arc<DedupFilter>,
    pub router: Arc<Router>,
    ready: Arc<AtomicBool>,
    shutting_down: AtomicBool,
    started_at: Instant,
}

impl Kernel {
    /// Ordered bring-up of every subsystem; adapters are initialized but not
    /// yet started.
    pub async fn bootstrap(config: DaemonConfig) -> Result<Arc<Self>> {
        let file_config = config
            .load_file_config()
            .context("failed to load adapter tuning file")?;

        let bus = match &config.redis_url {
            Some(url) => MessageBus::distributed(url.clone()),
            None => MessageBus::local(),
        };
        bus.connect().await.context("failed to connect bus broker")?;

        let repository = Arc::new(
            Repository::open(&config.db_path)
                .with_context(|| format!("failed to open repository at {}", config.db_path))?,
        );

        let storage: Arc<dyn MediaStorage> =
            Arc::new(CdnMediaStorage::new(config.cdn_url.clone()));
        let queues = Arc::new(QueueManager::default());
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));

        let acl = Arc::new(
            Acl::new(config.global_sudo.as_deref(), config.acl_path.as_deref())
                .context("failed to load ACL")?,
        );
        Arc::clone(&acl).spawn_watcher(ACL_POLL_INTERVAL);

        let dedup = Arc::new(DedupFilter::default());
        let router = Arc::new(Router::new(
            Arc::clone(&repository),
            Arc::clone(&queues),
            Arc::clone(&dedup),
        ));

        let kernel = Arc::new(Self {
            config,
            file_config,
            bus,
            repository,
            storage,
            queues,
            breakers,
            acl,
            adapters: Arc::new(AdapterRegistry::new()),
            dedup,
            router,
            ready: Arc::new(AtomicBool::new(false)),
            shutting_down: AtomicBool::new(false),
            started_at: Instant::now(),
        });

        kernel.install_ingress_pipeline();
        kernel.spawn_dedup_sweeper();
        kernel.register_builtin_adapters().await?;

        info!(node_id = %kernel.config.node_id, bus_mode = kernel.bus.mode().as_str(), "Kernel bootstrapped");
        Ok(kernel)
    }

    /// Route every `message.ingress` delivery through dedup and fan-out.
    fn install_ingress_pipeline(&self) {
        let router = Arc::clone(&self.router);
        self.bus.on(
            EVENT_INGRESS,
            Arc::new(move |message| {
                let router = Arc::clone(&router);
                Box::pin(async move {
                    match message.envelope() {
                        Ok(envelope) => {
                            router.handle_ingress(envelope);
                        }
                        Err(err) => {
                            warn!(error = %err, "Dropping undecodable ingress payload");
                        }
                    }
                })
            }),
        );
    }

    fn spawn_dedup_sweeper(&self) {
        let dedup = Arc::clone(&self.dedup);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEDUP_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                dedup.sweep();
            }
        });
    }

    /// Build adapters for every platform with credentials configured.
    async fn register_builtin_adapters(&self) -> Result<()> {
        if let Some(token) = self.config.discord_token.clone() {
            self.register_adapter(Arc::new(DiscordAdapter::new(token)?))
                .await?;
        }
        if let Some(token) = self.config.telegram_token.clone() {
            self.register_adapter(Arc::new(TelegramAdapter::new(token)?))
                .await?;
        }
        if let (Some(token), Some(phone_id)) = (
            self.config.whatsapp_token.clone(),
            self.config.whatsapp_phone_id.clone(),
        ) {
            self.register_adapter(Arc::new(WhatsAppAdapter::new(token, phone_id)?))
                .await?;
        }
        if let Some(phone) = self.config.signal_phone.clone() {
            self.register_adapter(Arc::new(SignalAdapter::new(
                phone,
                self.config.signal_cli_url.clone(),
            )?))
            .await?;
        }
        if let Some(token) = self.config.stoat_token.clone() {
            self.register_adapter(Arc::new(StoatAdapter::new(token, None)?))
                .await?;
        }
        Ok(())
    }

    /// Init one adapter and install its rate-limited, breaker-wrapped egress
    /// consumer.
    pub async fn register_adapter(&self, adapter: Arc<dyn Adapter>) -> Result<()> {
        let name = adapter.name().to_string();
        let tuning = self.file_config.tuning(&name);

        let breaker = self.breakers.get_with(
            &format!("{name}_api"),
            Some(tuning.breaker_config(BreakerConfig::default())),
        );

        let ctx = AdapterContext {
            name: name.clone(),
            config: serde_json::to_value(&tuning).unwrap_or(serde_json::Value::Null),
            bus: Arc::clone(&self.bus),
            repository: Arc::clone(&self.repository),
            queues: Arc::clone(&self.queues),
            storage: Arc::clone(&self.storage),
            breaker: Arc::clone(&breaker),
        };
        adapter
            .init(ctx)
            .await
            .with_context(|| format!("failed to init adapter `{name}`"))?;

        let options = tuning.queue_options(default_queue_options(&name));
        self.queues.process(
            &queue_name(&name),
            egress_processor(Arc::clone(&adapter), breaker, Arc::clone(&self.bus)),
            Some(options),
        );

        self.adapters.register(adapter);
        info!(adapter = %name, "Adapter registered");
        Ok(())
    }

    /// Start adapters, expose health, announce readiness.
    pub async fn start(&self) -> Result<()> {
        for adapter in self.adapters.all() {
            if let Err(err) = adapter.start().await {
                // The adapter stays registered but unhealthy; peers continue.
                error!(adapter = adapter.name(), error = %err, "Adapter failed to start");
            }
        }

        health::spawn(
            Arc::new(HealthState {
                node_id: self.config.node_id.clone(),
                bus_mode: self.bus.mode(),
                started_at: self.started_at,
                ready: Arc::clone(&self.ready),
                queues: Arc::clone(&self.queues),
                breakers: Arc::clone(&self.breakers),
                adapters: Arc::clone(&self.adapters),
            }),
            self.config.port,
        );

        if let Err(err) = self.bus.emit(EVENT_READY, serde_json::Value::Null).await {
            warn!(error = %err, "Failed to emit system.ready");
        }
        self.ready.store(true, Ordering::Relaxed);
        info!(node_id = %self.config.node_id, "System ready");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Reverse-order teardown; runs at most once, every step tolerated.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutdown started");
        self.ready.store(false, Ordering::Relaxed);

        if let Err(err) = self.bus.emit(EVENT_SHUTDOWN, serde_json::Value::Null).await {
            warn!(error = %err, "Failed to emit system.shutdown");
        }

        for adapter in self.adapters.all().into_iter().rev() {
            if let Err(err) = adapter.stop().await {
                error!(adapter = adapter.name(), error = %err, "Adapter stop failed");
            }
        }

        self.queues.stop_all().await;
        self.bus.disconnect().await;
        info!("Shutdown complete");
    }
}

fn default_queue_options(platform: &str) -> QueueOptions {
    match platform {
        "telegram" => QueueOptions {
            rate_limit: Some(RateLimit {
                max: 30,
                duration_ms: 1000,
            }),
            ..Default::default()
        },
        "whatsapp" => QueueOptions {
            rate_limit: Some(RateLimit {
                max: 5,
                duration_ms: 2000,
            }),
            ..Default::default()
        },
        // signal-cli serializes sends; keep per-source ordering too.
        "signal" => QueueOptions {
            concurrency: 1,
            ..Default::default()
        },
        _ => QueueOptions::default(),
    }
}

/// Run the daemon until SIGINT/SIGTERM.
pub async fn run(config: DaemonConfig) -> Result<()> {
    init_tracing(&config.log_level);
    let kernel = Kernel::bootstrap(config).await?;
    kernel.start().await?;

    shutdown_signal().await;
    info!("Shutdown signal received");
    kernel.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
