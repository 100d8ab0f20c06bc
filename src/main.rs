use std::process;
use std::sync::Arc;

use scorta::{
    application::error::AppError,
    application::repos::OrdersRepo,
    config,
    infra::{db::PostgresRepositories, error::InfraError, redis::RedisStore, telemetry},
    seckill::{OrderPersister, PersisterConfig},
    store::SharedStore,
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(config::ServeArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let database_url = settings
        .database
        .url
        .as_deref()
        .ok_or_else(|| InfraError::configuration("database.url is required"))?;
    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections)
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;
    let repositories = PostgresRepositories::new(pool);

    let store: Arc<dyn SharedStore> = Arc::new(RedisStore::connect(&settings.redis.url).await?);
    info!(redis = %settings.redis.url, "connected to shared store");

    let persister = Arc::new(OrderPersister::new(
        Arc::clone(&store),
        Arc::new(repositories.clone()) as Arc<dyn OrdersRepo>,
        PersisterConfig {
            stream: settings.persister.stream.clone(),
            group: settings.persister.group.clone(),
            consumer: settings.persister.consumer.clone(),
            block: settings.persister.block,
            lock_ttl: settings.persister.lock_ttl,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = {
        let persister = Arc::clone(&persister);
        tokio::spawn(async move { persister.run(shutdown_rx).await })
    };

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| AppError::unexpected(format!("failed to listen for shutdown: {err}")))?;
    info!("shutdown signal received");
    shutdown_tx
        .send(true)
        .map_err(|err| AppError::unexpected(format!("failed to signal shutdown: {err}")))?;
    worker
        .await
        .map_err(|err| AppError::unexpected(format!("persister task panicked: {err}")))?;

    Ok(())
}
