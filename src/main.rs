use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use mytardis_store::{
    config::{AppConfig, RunMode},
    db, routes,
    services::{AllowList, StorageService, WorkerPool},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting mytardis-store ({:?}) with config: {:?}", mode, cfg);

    // --- Initialize SQLite connection ---
    tracing::debug!("Connecting using raw URL => {}", cfg.database_url);
    let db = Arc::new(
        db::connect(&cfg.database_url, 5)
            .await
            .with_context(|| format!("opening database {}", cfg.database_url))?,
    );

    // --- Handle migration mode ---
    if mode == RunMode::Migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let pool = WorkerPool::new();
    let storage = StorageService::new(db.clone(), cfg.storage.clone(), Arc::new(pool.clone()))
        .with_authorizer(Arc::new(AllowList::new(cfg.allowed_actors.clone())));

    let boxes = storage
        .validate_backends()
        .await
        .context("validating storage box backends")?;
    tracing::info!("{} storage boxes configured", boxes);

    let workers = pool.spawn_workers(storage.clone(), cfg.workers);

    if mode == RunMode::ArchiveSweep {
        let summary = storage.run_due_auto_archives(chrono::Utc::now()).await?;
        tracing::info!("Auto-archive sweep: {:?}", summary);
        pool.close();
        for worker in workers {
            worker.await?;
        }
        return Ok(());
    }

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(storage);

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
    axum::serve(listener, app).await?;

    pool.close();
    Ok(())
}
