use anyhow::Result;
use portcullis::{build_router, AppContext, Config};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let bind_address = format!("0.0.0.0:{}", config.port);

    let db = portcullis::db::create_pool(&config.database_url, &config.db).await?;
    sqlx::migrate!("./migrations").run(&db).await?;
    tracing::info!("connected to database");

    let cache = portcullis::cache::SharedCache::connect(&config.redis_url).await?;
    tracing::info!("connected to shared cache");

    let ctx = Arc::new(AppContext::new(config, db, cache));
    let router = build_router(ctx);

    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "portcullis listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
