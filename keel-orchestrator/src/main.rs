use std::sync::Arc;
use std::time::Duration;

use keel_orchestrator::api::{self, AppState};
use keel_orchestrator::repository::{InMemoryJobStore, JobStore, PgJobStore};
use keel_orchestrator::service::{
    CapabilityFeed, HttpNodeTransport, InMemoryCapabilityFeed, LifecycleCoordinator,
};
use keel_orchestrator::{OrchestratorConfig, db};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Keel Orchestrator...");

    let config = OrchestratorConfig::from_env()?;

    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");

            let pool = db::create_pool(database_url).await?;
            tracing::info!("Database connection pool created");

            db::run_migrations(&pool).await?;
            Arc::new(PgJobStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, jobs are kept in memory only");
            Arc::new(InMemoryJobStore::new())
        }
    };

    let feed = Arc::new(InMemoryCapabilityFeed::new());

    let transport = HttpNodeTransport::new(config.node_request_timeout)?;

    let coordinator = LifecycleCoordinator::builder(config.clone())
        .with_store(store)
        .with_feed(Arc::clone(&feed) as Arc<dyn CapabilityFeed>)
        .with_transport(Arc::new(transport))
        .build();

    let resumed = coordinator.recover().await?;
    if resumed > 0 {
        tracing::info!("Resumed {} unfinished jobs", resumed);
    }

    spawn_feed_pruning(Arc::clone(&feed), config.node_ttl)?;

    // Build router with all API endpoints
    let app = api::create_router(AppState::new(coordinator, feed));

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Drops nodes whose last advertisement is older than `ttl`
fn spawn_feed_pruning(feed: Arc<InMemoryCapabilityFeed>, ttl: Duration) -> anyhow::Result<()> {
    let max_age = chrono::Duration::from_std(ttl)?;
    let period = (ttl / 2).max(Duration::from_millis(100));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;

            let pruned = feed.prune_older_than(chrono::Utc::now() - max_age);
            if !pruned.is_empty() {
                tracing::info!("Pruned stale nodes: {:?}", pruned);
            }
        }
    });

    Ok(())
}
