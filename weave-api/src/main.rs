use anyhow::Context;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use weave_api::{app, AppState, AuthConfig, Backends, ServiceSettings};
use weave_core::payment::PaymentGateway;
use weave_order::orchestrator::MockPaymentGateway;
use weave_order::{CardFee, FeeSchedule};
use weave_shared::Currency;
use weave_store::app_config::{Config, PricingConfig};
use weave_store::{
    DbClient, HttpObjectStorage, HttpPdfRenderer, KafkaEventPublisher, PgOrderRepository, RedisLocker, StripeGateway,
};

fn fee_schedule(pricing: &PricingConfig) -> anyhow::Result<FeeSchedule> {
    let mut fees = HashMap::new();
    for (code, fee) in &pricing.card_fees {
        let currency = Currency::from_str(code).with_context(|| format!("pricing.card_fees.{}", code))?;
        fees.insert(currency, CardFee { rate: fee.rate, fixed: fee.fixed });
    }
    Ok(FeeSchedule::from_map(fees))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weave_api=debug,weave_order=debug,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Weave API on port {}", config.server.port);

    // Postgres
    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    // Redis locks
    let locker = RedisLocker::new(&config.redis.url, config.locks.wait(), config.locks.retry_interval())
        .context("Failed to open Redis client")?;

    // Kafka
    let publisher = KafkaEventPublisher::new(&config.kafka.brokers).context("Failed to create Kafka producer")?;

    let gateway: Arc<dyn PaymentGateway> = match &config.gateway.secret_key {
        Some(secret) => Arc::new(StripeGateway::new(&config.gateway.api_base_url, secret)?),
        None => {
            tracing::warn!("No gateway secret configured, card payments use the mock gateway");
            Arc::new(MockPaymentGateway::default())
        }
    };

    let storage = HttpObjectStorage::new(&config.documents.storage_url, config.documents.storage_token.as_deref())?;

    let backends = Backends {
        repo: Arc::new(PgOrderRepository::new(db.pool.clone())),
        locker: Arc::new(locker),
        gateway,
        publisher: Arc::new(publisher),
        renderer: Arc::new(HttpPdfRenderer::new(&config.documents.renderer_url)),
        storage: Arc::new(storage),
    };
    let settings = ServiceSettings {
        fees: fee_schedule(&config.pricing)?,
        callback_base_url: config.checkout.callback_base_url.clone(),
        invoice_print_base_url: config.checkout.invoice_print_base_url.clone(),
        invoice_bucket: config.checkout.invoice_bucket.clone(),
    };
    let auth = AuthConfig {
        secret: config.auth.jwt_secret.clone(),
        expiration: config.auth.jwt_expiration_seconds,
    };
    let app_state = AppState::new(backends, settings, auth);

    let issuer = app_state.invoices.clone();
    let (brokers, group_id) = (config.kafka.brokers.clone(), config.kafka.group_id.clone());
    tokio::spawn(async move {
        if let Err(e) = weave_api::worker::start_invoice_worker(brokers, group_id, issuer).await {
            tracing::error!("Invoice worker stopped: {}", e);
        }
    });

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
