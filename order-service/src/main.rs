use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use order_service::api::{self, AppState};
use order_service::catalog::HttpFoodCatalog;
use order_service::config::Config;
use order_service::consumers;
use order_service::saga::{OrderSaga, SagaSettings};
use order_service::store::PgOrderStore;
use shared::{payment_timeout_queue, shutdown, EventBus, KafkaBus, TimeoutScheduler};
use tracing::info;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    shared::telemetry::init("order-service");
    let config = Config::parse();

    info!("Running database migrations...");
    let mut conn = PgConnection::establish(&config.database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.database_url);
    let pool = Pool::builder().build(manager).await?;

    let (trigger, shutdown) = shutdown::channel();

    let bus: Arc<dyn EventBus> = Arc::new(KafkaBus::connect(&config.broker, shutdown.clone())?);
    let timeouts = TimeoutScheduler::new(bus.clone(), payment_timeout_queue(config.payment_timeout()));
    bus.declare_topology(&consumers::topology(timeouts.queue())).await?;

    let catalog = HttpFoodCatalog::new(&config.food_service_url, config.food_service_timeout())?;
    let saga = Arc::new(OrderSaga::new(
        Arc::new(PgOrderStore::new(pool)),
        Arc::new(catalog),
        bus.clone(),
        timeouts,
        SagaSettings {
            currency: config.currency.clone(),
            payment_timeout: config.payment_timeout(),
        },
    ));

    let workers = consumers::spawn_all(bus.as_ref(), saga.clone(), config.consumer_options(), shutdown.clone()).await?;

    let app = api::create_router(AppState { saga });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "Order service ready to accept HTTP requests");

    let mut server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.wait().await })
            .await
    });

    shutdown::os_signal().await;
    info!("shutdown requested, draining");
    trigger.trigger();

    shutdown::drain(server, workers, HTTP_DRAIN_TIMEOUT).await;

    info!("order-service stopped");
    Ok(())
}
