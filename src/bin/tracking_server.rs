use std::{net::SocketAddr, sync::Arc};

use northstar_fe::{
    init_logging, log_app_bind, log_app_start, logging_config_from_env, runtime_config_from_env,
    tracking_router, ExecutionReader, SqliteTrackingStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("tracking_server", &logging_cfg);

    let addr: SocketAddr = std::env::var("NSFE_TRACKING_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let runtime = runtime_config_from_env();
    let reader: Arc<dyn ExecutionReader> =
        Arc::new(SqliteTrackingStore::open(&runtime.store_path)?);
    let app = tracking_router(reader);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
