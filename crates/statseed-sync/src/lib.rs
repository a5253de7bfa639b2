//! Pending-work discovery, per-event seeding, grouped fan-out, and the runtime that wires them
//! to storage, provider adapters and the notification pipeline.

use std::sync::Arc;

use anyhow::Context;
use statseed_adapters::AdapterRegistry;
use statseed_notify::{
    DispatchConfig, DispatchWorker, HttpPushGateway, NotificationPipeline, PushGateway,
};
use statseed_storage::{HttpClient, HttpClientConfig, PgSeedStore, SeedStore};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod config;
mod fanout;
mod finder;
mod orchestrator;
mod scheduler;

pub use config::{ConfigError, SeedConfig};
pub use fanout::{group_events, EventGroup, FanOutScheduler, ProcessRequest};
pub use finder::PendingWorkFinder;
pub use orchestrator::SeedOrchestrator;
pub use scheduler::maybe_build_scheduler;

pub const CRATE_NAME: &str = "statseed-sync";

/// Every long-lived component, built once at startup and shared by reference.
#[derive(Clone)]
pub struct SeedRuntime {
    pub config: Arc<SeedConfig>,
    pub store: Arc<dyn SeedStore>,
    pub adapters: Arc<AdapterRegistry>,
    pub orchestrator: Arc<SeedOrchestrator>,
    pub fanout: FanOutScheduler,
    pub dispatcher: Arc<DispatchWorker>,
}

impl SeedRuntime {
    pub fn assemble(
        config: SeedConfig,
        store: Arc<dyn SeedStore>,
        adapters: AdapterRegistry,
        gateway: Arc<dyn PushGateway>,
    ) -> Self {
        let adapters = Arc::new(adapters);
        let orchestrator = Arc::new(
            SeedOrchestrator::new(store.clone(), adapters.clone())
                .with_notifier(NotificationPipeline::new(store.clone())),
        );
        let finder = PendingWorkFinder::new(store.clone(), config.min_delay_minutes);
        let fanout = FanOutScheduler::new(store.clone(), finder, orchestrator.clone());
        let dispatcher = Arc::new(DispatchWorker::new(
            store.clone(),
            gateway,
            DispatchConfig {
                interval: config.dispatch_interval(),
                batch_limit: config.dispatch_batch,
                lease: config.claim_lease(),
            },
        ));
        Self {
            config: Arc::new(config),
            store,
            adapters,
            orchestrator,
            fanout,
            dispatcher,
        }
    }

    /// PostgreSQL store, `providers.yaml` adapters and the HTTP push gateway.
    pub async fn connect(config: SeedConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;
        let max_connections = (config.workers + 4).min(64) as u32;
        let store = PgSeedStore::connect(&config.database_url, max_connections)
            .await
            .context("connecting to database")?;
        let http = Arc::new(
            HttpClient::new(HttpClientConfig {
                timeout: config.http_timeout(),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })
            .context("building http client")?,
        );
        let adapters = AdapterRegistry::load(&config.providers_file, http.clone())
            .with_context(|| format!("loading {}", config.providers_file.display()))?;
        let gateway = HttpPushGateway::new(
            http,
            config.push_endpoint.clone(),
            config.push_server_key.clone(),
        );
        if !gateway.is_configured() {
            info!("push gateway not configured; deliveries will be marked sent without pushing");
        }
        Ok(Self::assemble(
            config,
            Arc::new(store),
            adapters,
            Arc::new(gateway),
        ))
    }

    pub async fn from_env() -> anyhow::Result<Self> {
        Self::connect(SeedConfig::from_env()).await
    }

    pub fn default_request(&self) -> ProcessRequest {
        ProcessRequest::from_config(&self.config)
    }

    /// Runs the cron job (when enabled) and the dispatch loop until `cancel` fires.
    pub async fn serve(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let scheduler =
            maybe_build_scheduler(&self.config, self.fanout.clone(), cancel.clone()).await?;
        if let Some(sched) = &scheduler {
            sched.start().await.context("starting scheduler")?;
        }

        self.dispatcher.run(cancel).await;

        if let Some(mut sched) = scheduler {
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Ok(())
    }
}
