use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use payment_service::api::{self, AppState};
use payment_service::config::Config;
use payment_service::consumers;
use payment_service::gateway::{PaymentGateway, SimulatedGateway, StripeGateway, StripeSettings};
use payment_service::processor::PaymentProcessor;
use payment_service::store::PgPaymentStore;
use shared::{shutdown, EventBus, KafkaBus};
use tracing::{info, warn};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn build_gateway(config: &Config) -> Result<Arc<dyn PaymentGateway>> {
    match &config.stripe_secret_key {
        Some(key) => {
            let settings = StripeSettings::with_redirects(
                key.clone(),
                &config.stripe_api_base,
                &config.redirect_base_url,
                config.gateway_timeout(),
            );
            info!(api_base = %config.stripe_api_base, "using Stripe gateway");
            Ok(Arc::new(StripeGateway::new(settings)?))
        }
        None => {
            warn!(
                success_rate = config.simulated_success_rate,
                "STRIPE_SECRET_KEY not set, using simulated gateway"
            );
            Ok(Arc::new(SimulatedGateway::new(
                config.simulated_success_rate,
                &format!("{}/checkout", config.redirect_base_url.trim_end_matches('/')),
                config.checkout_ttl(),
            )))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    shared::telemetry::init("payment-service");
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
    bus.declare_topology(&consumers::topology()).await?;

    let processor = Arc::new(PaymentProcessor::new(
        Arc::new(PgPaymentStore::new(pool)),
        build_gateway(&config)?,
        bus.clone(),
        config.processor_settings(),
    ));
    info!(mode = ?config.payment_mode, "payment processor configured");

    let workers =
        consumers::spawn_all(bus.as_ref(), processor.clone(), config.consumer_options(), shutdown.clone()).await?;

    if config.stripe_webhook_secret.is_none() {
        warn!("STRIPE_WEBHOOK_SECRET not set, webhook signatures will not be verified");
    }
    let app = api::create_router(AppState {
        processor,
        webhook_secret: config.stripe_webhook_secret.clone(),
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "Payment service ready to accept HTTP requests");

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

    info!("payment-service stopped");
    Ok(())
}
