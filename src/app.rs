use crate::cli::ServiceName;
use crate::config::Config;
use crate::cycles::CycleManager;
use crate::cycles::lifecycle::CycleService;
use crate::data::cycles::{CycleStore, PgCycleStore};
use crate::data::runs::{PgRunStore, RunStore};
use crate::data::sources::{PgSourceStore, SourceStore};
use crate::ingest::operator::Operator;
use crate::ingest::scheduler::{Scheduler, SchedulerSettings};
use crate::ingest::worker::Worker;
use crate::ingest::{SchedulerService, WorkerService};
use crate::pollers::PollerRegistry;
use crate::pollers::http::FeedClient;
use crate::pollers::metar::{AwcMetarFeed, MetarPoller, PgMetarStore};
use crate::pollers::storm_cell::{
    PgStormCellStore, StormCellPoller, XweatherCredentials, XweatherStormFeed,
};
use crate::queue::postgres::PgQueue;
use crate::queue::{DurableQueue, RetryPolicy, WorkOptions};
use crate::services::manager::ServiceManager;
use crate::services::web::WebService;
use crate::state::{AppState, ServiceStatusRegistry};
use crate::utils::fmt_duration;
use anyhow::Context;
use chrono::Utc;
use sqlx::ConnectOptions;
use sqlx::postgres::PgPoolOptions;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Main application struct containing all necessary components
pub struct App {
    config: Config,
    scheduler: Scheduler,
    worker: Worker,
    queue: Arc<dyn DurableQueue>,
    app_state: AppState,
    service_manager: ServiceManager,
}

impl App {
    /// Connect, migrate, recover, seed and wire every component.
    ///
    /// Pollers are registered and checked against the source table here,
    /// before any service exists that could consume a job.
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        let slow_threshold = Duration::from_millis(500);
        let connect_options = sqlx::postgres::PgConnectOptions::from_str(&config.database_url)
            .context("Failed to parse database URL")?
            .log_statements(tracing::log::LevelFilter::Debug)
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_secs(1));

        let max_connections = u32::try_from(config.worker_concurrency)
            .unwrap_or(u32::MAX)
            .saturating_add(4);
        let db_pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(max_connections)
            .acquire_slow_threshold(slow_threshold)
            .acquire_timeout(Duration::from_secs(4))
            .idle_timeout(Duration::from_secs(60 * 2))
            .max_lifetime(Duration::from_secs(60 * 30))
            .connect_with(connect_options)
            .await
            .context("Failed to create database pool")?;

        info!(
            max_connections,
            acquire_timeout = "4s",
            acquire_slow_threshold = fmt_duration(slow_threshold),
            "database pool established"
        );

        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run database migrations")?;
        info!("Database migrations completed successfully");

        let sources: Arc<dyn SourceStore> = Arc::new(PgSourceStore::new(db_pool.clone()));
        let runs: Arc<dyn RunStore> = Arc::new(PgRunStore::new(db_pool.clone()));
        let cycle_store: Arc<dyn CycleStore> = Arc::new(PgCycleStore::new(db_pool.clone()));
        let queue: Arc<dyn DurableQueue> = Arc::new(PgQueue::new(
            db_pool.clone(),
            RetryPolicy {
                limit: config.queue_retry_limit,
                delay: config.queue_retry_delay,
                max_delay: config.queue_retry_delay_max,
            },
        ));

        if config.recover_on_startup {
            Self::recover(sources.as_ref(), queue.as_ref()).await?;
        }

        let metar_store = Arc::new(PgMetarStore::new(db_pool.clone(), config.metar_retention));
        let registry = Arc::new(Self::build_registry(&config, &db_pool, metar_store.clone())?);

        let seeded = sources
            .seed(&registry.descriptors())
            .await
            .context("Failed to seed data sources")?;
        if seeded > 0 {
            info!(count = seeded, "Seeded new data sources");
        }
        let all_sources = sources.list().await?;
        registry
            .ensure_covers(&all_sources)
            .context("Poller registration incomplete")?;
        info!(pollers = ?registry, sources = all_sources.len(), "Poller registry ready");

        let scheduler = Scheduler::new(
            sources.clone(),
            queue.clone(),
            SchedulerSettings {
                tick: config.scheduler_tick,
                cleanup_interval: config.cleanup_interval,
            },
        )
        .with_sweeper(metar_store);
        let worker = Worker::new(sources.clone(), runs.clone(), registry);

        let cycle_manager = Arc::new(CycleManager::new(cycle_store.clone()));
        let app_state = AppState::new(
            Operator::new(sources, runs, queue.clone(), scheduler.clone()),
            CycleService::new(cycle_store, cycle_manager),
            ServiceStatusRegistry::new(),
            config.admin_token.clone(),
        );
        if app_state.admin_token.is_none() {
            warn!("ADMIN_TOKEN is not set; admin routes are unauthenticated");
        }

        Ok(App {
            config,
            scheduler,
            worker,
            queue,
            app_state,
            service_manager: ServiceManager::new(),
        })
    }

    /// Reset state left behind by a process that died mid-poll.
    async fn recover(sources: &dyn SourceStore, queue: &dyn DurableQueue) -> anyhow::Result<()> {
        let reset_sources = sources
            .recover_running()
            .await
            .context("Failed to recover running sources")?;
        let reset_jobs = queue
            .recover_active(Utc::now())
            .await
            .context("Failed to recover active jobs")?;
        if reset_sources > 0 || reset_jobs > 0 {
            warn!(reset_sources, reset_jobs, "Recovered work interrupted by a previous shutdown");
        }
        Ok(())
    }

    fn build_registry(
        config: &Config,
        pool: &sqlx::PgPool,
        metar_store: Arc<PgMetarStore>,
    ) -> anyhow::Result<PollerRegistry> {
        let awc = FeedClient::new("awc", config.http_timeout, config.outbound_requests_per_minute)?;
        let xweather = FeedClient::new(
            "xweather",
            config.http_timeout,
            config.outbound_requests_per_minute,
        )?;

        let credentials = match (&config.xweather_client_id, &config.xweather_client_secret) {
            (Some(client_id), Some(client_secret)) => Some(XweatherCredentials {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            }),
            _ => {
                warn!("Xweather credentials not configured; storm cell polls will report an error");
                None
            }
        };

        let registry = PollerRegistry::new()
            .with(Arc::new(MetarPoller::new(
                Arc::new(AwcMetarFeed::new(awc, config.awc_base_url.clone())),
                metar_store,
            )))?
            .with(Arc::new(StormCellPoller::new(
                Arc::new(XweatherStormFeed::new(
                    xweather,
                    config.xweather_base_url.clone(),
                    credentials,
                )),
                Arc::new(PgStormCellStore::new(pool.clone())),
            )))?;
        Ok(registry)
    }

    /// Setup and register services based on enabled service list
    pub fn setup_services(&mut self, services: &[ServiceName]) -> Result<(), anyhow::Error> {
        let statuses = self.app_state.service_statuses.clone();

        if services.contains(&ServiceName::Web) {
            let web_service = Box::new(WebService::new(self.config.port, self.app_state.clone()));
            self.service_manager
                .register_service(ServiceName::Web.as_str(), web_service);
        }

        if services.contains(&ServiceName::Scheduler) {
            let scheduler_service = Box::new(SchedulerService::new(
                self.scheduler.clone(),
                statuses.clone(),
            ));
            self.service_manager
                .register_service(ServiceName::Scheduler.as_str(), scheduler_service);
        }

        if services.contains(&ServiceName::Worker) {
            let worker_service = Box::new(WorkerService::new(
                self.worker.clone(),
                self.queue.clone(),
                WorkOptions {
                    concurrency: self.config.worker_concurrency,
                    poll_interval: self.config.queue_poll_interval,
                },
                statuses,
            ));
            self.service_manager
                .register_service(ServiceName::Worker.as_str(), worker_service);
        }

        if !self.service_manager.has_services() {
            error!("No services enabled. Cannot start application.");
            return Err(anyhow::anyhow!("No services enabled"));
        }

        Ok(())
    }

    /// Start all registered services
    pub fn start_services(&mut self) {
        self.service_manager.spawn_all();
    }

    /// Run the application and handle shutdown signals
    pub async fn run(self) -> ExitCode {
        use crate::services::signals::handle_shutdown_signals;
        handle_shutdown_signals(self.service_manager, self.config.shutdown_timeout).await
    }
}
