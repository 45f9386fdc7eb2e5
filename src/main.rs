use idempotency_engine::api::{create_router, AppState};
use idempotency_engine::config::{Settings, StoreKind};
use idempotency_engine::idempotency::{
    DefaultSpecification, IdempotencyCoordinator, IdempotencyStore, MemoryIdempotencyStore,
    PurgeJob, RedisIdempotencyStore,
};
use idempotency_engine::observability::{init_logging, init_metrics};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;
    init_logging(&settings.log_config());
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;

    let record_ttl = settings.record_ttl()?;
    let store: Arc<dyn IdempotencyStore> = match settings.idempotency.store {
        StoreKind::Memory => {
            let store = Arc::new(match record_ttl {
                Some(ttl) => MemoryIdempotencyStore::with_ttl(ttl),
                None => MemoryIdempotencyStore::new(),
            });
            if record_ttl.is_some() {
                PurgeJob::new(Arc::clone(&store), settings.idempotency.purge_interval_seconds)
                    .start();
            }
            info!("Using in-memory idempotency store");
            store
        }
        StoreKind::Redis => {
            info!("Connecting to Redis at {}...", settings.redis.url);
            let client = redis::Client::open(settings.redis.url.as_str())?;
            let store = RedisIdempotencyStore::new(
                client,
                settings.redis.key_prefix.clone(),
                record_ttl.map_or(0, |ttl| ttl.num_seconds()),
            );
            store.ping().await?;
            info!("Redis connection established");
            Arc::new(store)
        }
    };

    let specification = DefaultSpecification::new(settings.specification_config())?;
    let coordinator = Arc::new(IdempotencyCoordinator::new(
        store,
        Arc::new(specification),
        settings.coordinator_config()?,
    ));

    let state = AppState::new(coordinator).with_metrics(metrics_handle);
    let app = create_router(state);

    let address = settings.bind_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
