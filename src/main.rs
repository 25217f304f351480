//! Metastudio server binary.

use metastudio::query::builder::InternalTables;
use metastudio::{
    api_router, ensure_database_exists, ensure_sys_tables, load_registry_from_pool, AppState,
    ExternalQueryService, ObjectService, PoolRegistry, QueryEngine,
};
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;

const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("metastudio=info")),
        )
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/metastudio".into());
    ensure_database_exists(&database_url).await?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    ensure_sys_tables(&pool).await?;
    let registry = load_registry_from_pool(&pool).await?;

    let tables = InternalTables::with_schema(&metastudio::store::studio_schema());
    let state = AppState {
        pool: pool.clone(),
        registry: Arc::new(RwLock::new(registry)),
        engine: Arc::new(QueryEngine::new(pool.clone(), tables.clone())),
        external: Arc::new(ExternalQueryService::new(PoolRegistry::new())),
        objects: Arc::new(ObjectService::new(pool, tables)),
    };

    let app = axum::Router::new()
        .nest("/api/v1", api_router(state))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES));

    let bind = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".into());
    let listener = TcpListener::bind(&bind).await?;
    tracing::info!("metastudio listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
