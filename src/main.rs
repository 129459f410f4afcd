use std::sync::Arc;

use anyhow::Context;
use evlog::{meta, LogEventConsolePrinter, Logger};
use tokio::sync::watch;

use easypoll::config::Config;
use easypoll::db::dbclient::DBClient;
use easypoll::db::memory::MemoryStore;
use easypoll::db::PollStore;
use easypoll::runtime::{get_logger, set_logger};
use easypoll::service::PollService;

async fn serve<S: PollStore>(store: Arc<S>, config: &Config) -> anyhow::Result<()> {
    let service = PollService::new(store, config.service_options());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = service.scheduler().spawn(shutdown_rx);

    tokio::signal::ctrl_c().await
        .context("failed to listen for ctrl-c")?;

    get_logger().info("Shutting down.", None);

    // Err only if the scheduler already exited.
    let _ = shutdown_tx.send(true);
    sweeper.await
        .context("lifecycle scheduler panicked")?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let mut logger = Logger::default();
    logger.register(LogEventConsolePrinter::default());
    set_logger(logger);

    let config = Config::from_env()?;

    match &config.database_url {
        Some(db_url) => {
            let db_client = DBClient::new(db_url, config.database_max_connections).await
                .context("failed to connect to database")?;
            db_client.migrate().await
                .context("failed to apply migrations")?;

            get_logger().info("Using PostgreSQL poll store.", meta![
                "MaxConnections" => config.database_max_connections,
            ]);

            serve(Arc::new(db_client), &config).await
        }
        None => {
            get_logger().notice("EASYPOLL_DATABASE_URL is not set; polls are kept in memory.", None);

            serve(Arc::new(MemoryStore::new()), &config).await
        }
    }
}
