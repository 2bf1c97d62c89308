use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use config::ObjectBackend;
use services::{
    document_service::DocumentService, local_store::LocalObjectStore,
    metadata_repository::SqliteMetadataRepository, object_store::ObjectStore,
    s3_store::S3ObjectStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + init flag ---
    let (cfg, init_only) = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        "Starting document-store on {} (backend {:?}, bucket {})",
        cfg.addr(),
        cfg.object_backend,
        cfg.bucket
    );

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let connect_options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database url `{}`", db_url))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await
            .context("connecting to metadata database")?,
    );

    // --- Object store backend ---
    let objects: Arc<dyn ObjectStore> = match cfg.object_backend {
        ObjectBackend::Local => {
            if !Path::new(&cfg.storage_dir).exists() {
                fs::create_dir_all(&cfg.storage_dir)?;
                tracing::info!("Created storage directory at {}", cfg.storage_dir);
            }
            Arc::new(LocalObjectStore::new(cfg.storage_dir.clone()))
        }
        ObjectBackend::S3 => {
            tracing::info!("Using S3-compatible object store at {}", cfg.s3_endpoint);
            Arc::new(S3ObjectStore::connect(cfg.s3_settings()).await)
        }
    };

    // --- Initialize core service ---
    let service = DocumentService::new(
        objects,
        Arc::new(SqliteMetadataRepository::new(db.clone())),
        cfg.document_service(),
    );
    service
        .initialize()
        .await
        .context("initializing document storage")?;

    if init_only {
        tracing::info!("Initialization complete.");
        db.close().await;
        return Ok(());
    }

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes).with_state(service);

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

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    tracing::info!(
        "API available at http://{}/api/v1/upload",
        listener.local_addr()?
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    db.close().await;
    tracing::info!("HTTP server closed");
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn wait_for_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for SIGINT: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("SIGINT received, shutting down gracefully..."),
        _ = terminate => tracing::info!("SIGTERM received, shutting down gracefully..."),
    }
    token.cancel();
}
