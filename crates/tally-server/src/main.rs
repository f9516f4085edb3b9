mod config;
mod db;
mod error;
mod presence;
mod routes;

use std::sync::{Arc, Mutex};

use config::AppConfig;
use db::Authority;
use routes::{app_router, AppState};
use tally_core::Registry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tally_server=info".parse().expect("valid directive")),
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!("Starting tally-server with config: {:?}", config);

    let db = Authority::open(&config.db_path, Registry::retail())?;
    db.init_schema()?;

    let state = AppState {
        db: Arc::new(Mutex::new(db)),
    };
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("tally-server listening on {}", config.bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
