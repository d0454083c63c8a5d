use std::sync::Arc;

use anyhow::Context;
use fleet_orchestrator::config::{database, RemoteMode};
use fleet_orchestrator::store::{MemoryStore, PgStore, RecordStore};
use fleet_orchestrator::{app, commands, recovery, routes, setup, AppState, OrchestratorConfig};
use fleet_remote::http::HttpRemoteService;
use fleet_remote::RemoteService;

fn build_remote(config: &OrchestratorConfig) -> anyhow::Result<Arc<dyn RemoteService>> {
    match config.remote {
        RemoteMode::Http => {
            let client = HttpRemoteService::new(config.probe_timeout, config.request_timeout)
                .context("failed to build remote HTTP client")?;
            Ok(Arc::new(client))
        }
        #[cfg(feature = "remote-mock")]
        RemoteMode::Mock => {
            tracing::warn!("FLEET_REMOTE=mock: using the scripted in-process remote");
            Ok(Arc::new(fleet_remote::mock::MockRemote::new()))
        }
        #[cfg(not(feature = "remote-mock"))]
        RemoteMode::Mock => anyhow::bail!("FLEET_REMOTE=mock requires the `remote-mock` feature"),
    }
}

async fn build_store(config: &OrchestratorConfig) -> anyhow::Result<Arc<dyn RecordStore>> {
    match &config.database_url {
        Some(url) => {
            let pool = database::connect(url, config.db_max_connections)
                .await
                .context("Failed to connect to Postgres")?;
            tracing::info!("✅ Connected to Database");
            setup::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;
            Ok(Arc::new(PgStore::new(pool)))
        }
        None => {
            tracing::warn!("DATABASE_URL not set: records are kept in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = OrchestratorConfig::from_env()?;
    let store = build_store(&config).await?;
    let remote = build_remote(&config)?;
    let http_addr = config.http_addr;
    let redis_url = config.redis_url.clone();

    let state = AppState::new(config, store, remote);

    let report = recovery::recover(state.store.as_ref(), &state.monitors, &state.tracker).await;
    tracing::debug!("recovery report: {:?}", report);

    if let Some(url) = redis_url {
        let client = redis::Client::open(url.as_str()).context("invalid REDIS_URL")?;
        let state_redis = state.clone();
        tokio::spawn(async move {
            if let Err(e) = commands::run(state_redis, client).await {
                tracing::error!("❌ command listener stopped: {}", e);
            }
        });
    } else {
        tracing::info!("REDIS_URL not set: command bus disabled");
    }

    let app = routes::create_router()
        .with_state(state)
        .layer(app::create_cors());

    tracing::info!("🚀 Fleet orchestrator listening on {}", http_addr);
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
