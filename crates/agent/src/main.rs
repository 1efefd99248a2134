use agent::binding::{SqlInterfaceLoader, UpsertDataWriter};
use agent::cleanup::LogCleaner;
use agent::config::ConfigService;
use agent::executor::InterfaceExecutor;
use agent::listener::ChangeListener;
use agent::lock::{DistributedLock, MemoryLock, RedisLock};
use agent::processors::{DataSourceChangeProcessor, SyncTaskChangeProcessor};
use agent::scheduler::Scheduler;
use agent::schema::PgSchemaService;
use agent::tasks::SyncTaskService;
use anyhow::Context;
use clap::Parser;
use drivers::{DriverRegistry, RealtimePipeline, RealtimePipelineConfig, SourceManager};
use futures::FutureExt;
use rand::Rng;
use sqlx::ConnectOptions;
use std::sync::Arc;

/// Agent is the daemon which runs the sync orchestration core of the
/// DataHub control plane.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// URL of the postgres control database. Overrides the DB_* parts.
    #[clap(long = "database", env = "DATABASE_URL")]
    database_url: Option<String>,
    #[clap(long, env = "DB_HOST", default_value = "127.0.0.1")]
    db_host: String,
    #[clap(long, env = "DB_PORT", default_value = "5432")]
    db_port: u16,
    #[clap(long, env = "DB_USER", default_value = "datahub")]
    db_user: String,
    #[clap(long, env = "DB_PASSWORD", default_value = "")]
    db_password: String,
    #[clap(long, env = "DB_NAME", default_value = "datahub")]
    db_name: String,
    #[clap(long, env = "DB_SSLMODE", default_value = "prefer")]
    db_sslmode: String,
    /// Redis URL backing the distributed lock. Absent, the scheduler
    /// degrades to single-instance mode.
    #[clap(long = "redis", env = "REDIS_URL")]
    redis_url: Option<String>,
    /// Whether this instance fires scheduled tasks.
    #[clap(
        long,
        env = "SCHEDULER_ENABLED",
        default_value = "true",
        action = clap::ArgAction::Set
    )]
    scheduler_enabled: bool,
    /// Maximum connections of the control-database pool.
    #[clap(long, env = "DB_POOL_SIZE", default_value = "16")]
    db_pool_size: u32,
}

fn main() -> Result<(), anyhow::Error> {
    // Use reasonable defaults for printing structured logs to stderr.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(?args, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}

async fn async_main(args: Args) -> Result<(), anyhow::Error> {
    // 1) Control database. A failure here is fatal.
    let mut pg_options = match &args.database_url {
        Some(url) => url
            .parse::<sqlx::postgres::PgConnectOptions>()
            .context("parsing database URL")?,
        None => sqlx::postgres::PgConnectOptions::new()
            .host(&args.db_host)
            .port(args.db_port)
            .username(&args.db_user)
            .password(&args.db_password)
            .database(&args.db_name)
            .ssl_mode(
                args.db_sslmode
                    .parse()
                    .context("parsing DB_SSLMODE")?,
            ),
    };
    pg_options.log_slow_statements(log::LevelFilter::Warn, std::time::Duration::from_secs(10));

    let pg_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(args.db_pool_size)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect_with(pg_options)
        .await
        .context("connecting to control database")?;

    // 2) Migrations. Also fatal.
    sqlx::migrate!("./migrations")
        .run(&pg_pool)
        .await
        .context("running database migrations")?;

    // 3) Driver registry and realtime pipeline.
    let registry = Arc::new(DriverRegistry::builtin());
    let loader = Arc::new(SqlInterfaceLoader::new(pg_pool.clone()));
    let writer = Arc::new(UpsertDataWriter::new(pg_pool.clone()));
    let (pipeline, realtime_tx) =
        RealtimePipeline::start(loader.clone(), writer, RealtimePipelineConfig::default());
    let manager = Arc::new(SourceManager::new(registry, realtime_tx.clone()));

    // 4) Load active data sources. Per-source failures degrade, not abort.
    let active = datahub_sql::data_sources::list_active(&pg_pool)
        .await
        .context("loading active data sources")?;
    for source in active {
        let source_id = source.id;
        if let Err(err) = manager.register(source).await {
            tracing::error!(source_id = %source_id, %err, "failed to register data source at startup");
        }
    }

    // Bind realtime interfaces eagerly so residents produce traffic
    // immediately once started.
    let registered = manager.registered_ids().await;
    drivers::preload_bindings(loader.as_ref(), &registered).await;

    // 5) Services.
    let config = Arc::new(ConfigService::new(pg_pool.clone()));
    let schema = Arc::new(PgSchemaService::new(pg_pool.clone()));
    let executor = Arc::new(InterfaceExecutor::new(
        pg_pool.clone(),
        manager.clone(),
        schema,
    ));

    let id_gen_shard = rand::thread_rng().gen_range(1u16..1024u16);
    let service = Arc::new(SyncTaskService::new(
        pg_pool.clone(),
        executor,
        models::IdGenerator::new(id_gen_shard),
    ));

    // 6) Reset executions interrupted by the previous process, before any
    // scheduler starts.
    service
        .reset_interrupted()
        .await
        .context("resetting interrupted executions")?;

    // Legacy per-datasource schedule rules are read-only compatibility
    // rows; surface any that are still enabled.
    match datahub_sql::schedule_configs::list(&pg_pool).await {
        Ok(configs) => {
            for config in configs.iter().filter(|c| c.enabled) {
                tracing::warn!(
                    schedule_config = %config.id,
                    data_source_id = %config.data_source_id,
                    "enabled legacy schedule config found; superseded by sync tasks"
                );
            }
        }
        Err(err) => tracing::warn!(%err, "failed to load legacy schedule configs"),
    }

    // 7) Distributed lock: Redis when configured, otherwise explicit
    // single-instance mode.
    let lock: Arc<dyn DistributedLock> = match &args.redis_url {
        Some(url) => Arc::new(RedisLock::new(url).context("opening redis lock store")?),
        None => {
            tracing::warn!("no REDIS_URL configured; scheduler runs in single-instance mode");
            Arc::new(MemoryLock::new())
        }
    };

    // Share-able future which completes when the agent should exit.
    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    // 8) Scheduler, log cleanup, and change listener. Failures here
    // degrade a subsystem but do not abort the process.
    let (scheduler_tx, scheduler_rx) = tokio::sync::mpsc::unbounded_channel();
    service.set_scheduler(scheduler_tx.clone());

    let scheduler_fut = if args.scheduler_enabled {
        let scheduler = Scheduler::new(pg_pool.clone(), service.clone(), lock);
        let shutdown = shutdown.clone();
        async move { scheduler.serve(scheduler_rx, shutdown).await }.boxed()
    } else {
        tracing::warn!("SCHEDULER_ENABLED=false; this instance will not fire tasks");
        futures::future::ready(()).boxed()
    };

    let cleaner = LogCleaner::new(pg_pool.clone(), config.clone());
    let cleanup_fut = cleaner.serve(shutdown.clone()).boxed();

    let listener = ChangeListener::new(pg_pool.clone())
        .register(Arc::new(DataSourceChangeProcessor::new(
            pg_pool.clone(),
            manager.clone(),
        )))
        .register(Arc::new(SyncTaskChangeProcessor::new(
            pg_pool.clone(),
            scheduler_tx,
        )));
    if let Err(err) = listener.ensure_notify_infrastructure().await {
        tracing::error!(%err, "failed to install change-notification triggers");
    }
    let listener_fut = listener.serve(shutdown.clone()).boxed();

    let probes_fut = agent::health::serve_source_probes(
        pg_pool.clone(),
        manager.clone(),
        std::time::Duration::from_secs(300),
        shutdown.clone(),
    )
    .boxed();

    // 9) Start resident sources last, once everything downstream exists.
    manager.start_all().await;

    let ((), (), (), ()) = tokio::join!(scheduler_fut, cleanup_fut, listener_fut, probes_fut);

    // Graceful teardown: stop residents, then drain the realtime queue.
    tracing::info!("shutting down: stopping resident sources");
    manager.stop_all().await;
    drop(realtime_tx);
    pipeline.shutdown().await;

    Ok(())
}
