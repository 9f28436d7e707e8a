//! Segment Membership Server

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use seg_config::{AppConfig, ConfigLoader, DatabaseConfig, StoreKind};
use seg_membership::{
    router, AppState, ExpirySweeper, InMemoryMembershipStore, MembershipStore,
    PostgresMembershipStore, SegmentService, ServiceConfig, SqliteMembershipStore,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    seg_common::logging::init_logging("seg-server");

    info!(version = seg_common::VERSION, "Starting Segment Membership Server");

    let config = ConfigLoader::new().load()?;
    info!(
        store = %config.database.kind,
        store_timeout_ms = config.membership.store_timeout_ms,
        reconcile_on_startup = config.membership.reconcile_on_startup,
        "Configuration loaded"
    );

    let store = open_store(&config.database).await?;
    store.init_schema().await?;

    let service = Arc::new(SegmentService::new(
        store,
        ServiceConfig {
            store_timeout: config.membership.store_timeout(),
        },
    ));

    if config.membership.reconcile_on_startup {
        match service.reconcile().await {
            Ok(report) => info!(
                expired = report.expired,
                rearmed = report.rearmed,
                "Startup reconciliation complete"
            ),
            Err(e) => error!(error = %e, "Startup reconciliation failed"),
        }
    }

    let sweeper = config
        .membership
        .sweep_interval()
        .map(|interval| Arc::new(ExpirySweeper::new(service.clone(), interval)));
    if let Some(sweeper) = &sweeper {
        sweeper.start().await;
    }

    let app = router(AppState::new(service.clone())).layer(TraceLayer::new_for_http());

    let addr = listen_addr(&config)?;
    info!(%addr, "HTTP server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(sweeper) = &sweeper {
        sweeper.stop().await;
    }
    service.shutdown();

    info!("Segment Membership Server stopped");
    Ok(())
}

async fn open_store(database: &DatabaseConfig) -> anyhow::Result<Arc<dyn MembershipStore>> {
    let kind = database
        .store_kind()
        .with_context(|| format!("unsupported database kind: {}", database.kind))?;

    let store: Arc<dyn MembershipStore> = match kind {
        StoreKind::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(database.max_connections)
                .acquire_timeout(database.acquire_timeout())
                .connect(&database.url)
                .await
                .context("failed to connect to PostgreSQL")?;
            info!(max_connections = database.max_connections, "Connected to PostgreSQL");
            Arc::new(PostgresMembershipStore::new(pool))
        }
        StoreKind::Sqlite if database.url.contains(":memory:") => {
            warn!("Using in-memory SQLite; memberships are lost on restart");
            Arc::new(SqliteMembershipStore::in_memory().await?)
        }
        StoreKind::Sqlite => {
            let options = SqliteConnectOptions::from_str(&database.url)?.create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(database.max_connections)
                .acquire_timeout(database.acquire_timeout())
                .connect_with(options)
                .await
                .context("failed to open SQLite database")?;
            info!(url = %database.url, "Opened SQLite database");
            Arc::new(SqliteMembershipStore::new(pool))
        }
        StoreKind::Memory => {
            warn!("Using in-memory store; memberships are lost on restart");
            Arc::new(InMemoryMembershipStore::new())
        }
    };

    Ok(store)
}

fn listen_addr(config: &AppConfig) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", config.http.host, config.http.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.http.host, config.http.port))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
