use anyhow::Result;
use std::{io::ErrorKind, sync::Arc};
use storage_dsm::{
    config::{AppConfig, ObjectStoreMode},
    constants::{DATCORE_ID, SIMCORE_S3_ID},
    db,
    handlers::AppState,
    routes::routes,
    s3::{MemoryObjectStore, ObjectStore, S3ObjectStore},
    services::{DataManagerProvider, DatCoreDataManager, Location, SimcoreS3DataManager, UploadCleaner},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;

    // --- Logging setup (RUST_LOG wins over the configured level) ---
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting storage-dsm with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    tracing::debug!("Connecting using raw URL => {}", cfg.database_url);
    let db = Arc::new(db::connect(&cfg.database_url).await?);
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if cfg.migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Object store ---
    let bucket = cfg.storage.bucket.clone();
    let mut memory_store = None;
    let store: Arc<dyn ObjectStore> = match cfg.object_store {
        ObjectStoreMode::S3 => Arc::new(S3ObjectStore::connect(&cfg.s3).await),
        ObjectStoreMode::Memory => {
            let store =
                MemoryObjectStore::new(format!("http://{}{}", cfg.addr(), routes::MEMORY_STORE_PREFIX));
            store.create_bucket(&bucket).await;
            tracing::warn!("Using the in-memory object store, data is lost on exit");
            memory_store = Some(store.clone());
            Arc::new(store)
        }
    };

    // --- Storage locations ---
    let datcore = Arc::new(DatCoreDataManager::new(db.clone(), &cfg.storage)?);
    let mut simcore = SimcoreS3DataManager::new(db.clone(), store.clone(), cfg.storage.clone());
    if cfg.storage.datcore_adapter_url.is_some() {
        simcore = simcore.with_datcore(datcore.clone());
    }
    let simcore = Arc::new(simcore);

    let mut locations = DataManagerProvider::new();
    locations.register_location(Location::SimcoreS3(simcore.clone()));
    locations.register_location(Location::DatCore(datcore));
    tracing::info!(
        simcore = SIMCORE_S3_ID,
        datcore = DATCORE_ID,
        "storage locations registered"
    );

    // --- Background upload cleaner ---
    let shutdown = CancellationToken::new();
    let cleaner = tokio::spawn(UploadCleaner::new(simcore, db.clone()).run(shutdown.clone()));

    // --- Build router ---
    let state = AppState {
        db,
        store,
        locations: Arc::new(locations),
        bucket,
    };
    let app = match memory_store {
        Some(store) => routes::app_with_memory_store(state, store),
        None => routes::app(state),
    };

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Err(err) = cleaner.await {
        tracing::warn!("Upload cleaner task ended abnormally: {}", err);
    }
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
