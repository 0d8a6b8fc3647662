use clap::Parser;
use ragnard::api::{self, AppState};
use ragnard::blob::{BlobConfig, BlobStore};
use ragnard::config::Config;
use ragnard::embedding::{EmbedModel, Embedder};
use ragnard::logging;
use ragnard::pipeline::Pipeline;
use ragnard::queue::TaskQueue;
use ragnard::store::MetaStore;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Number of queue workers consuming pipeline tasks.
const PIPELINE_WORKERS: usize = 4;

/// Bound on component close during shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    logging::init_tracing(&config.log_level, &config.log_format);
    config.validate()?;

    tracing::info!(prod = config.production, "Starting Ragnar service");

    tracing::info!("Creating store..");
    let store = MetaStore::connect(&config.db_uri, !config.production).await?;

    tracing::info!("Creating blob storage..");
    let blobs = Arc::new(BlobStore::new(&BlobConfig {
        endpoint: config.s3_endpoint.clone(),
        bucket: config.s3_bucket.clone(),
        access_key: config.s3_access_key.clone(),
        secret_key: config.s3_secret_key.clone(),
        production: config.production,
    })?);

    tracing::info!("Creating embedder..");
    let default_model = EmbedModel::lookup(&config.default_embed_model)
        .expect("default embed model validated at startup");
    let embedder = Arc::new(Embedder::new(
        &config.bellman_uri,
        &config.bellman_name,
        &config.bellman_key,
        default_model,
    ));

    tracing::info!("Creating pipeline..");
    let queue = TaskQueue::new(store.pool().clone());
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        blobs.clone(),
        embedder.clone(),
        queue,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = pipeline.spawn_workers(PIPELINE_WORKERS, shutdown_rx.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        store: store.clone(),
        blobs,
        embedder,
        pipeline,
    });
    let app = api::create_router(state);

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.http_port)).await?;
    tracing::info!(port = config.http_port, "Starting HTTP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Initiating graceful shutdown..");
    let _ = shutdown_tx.send(true);

    let close = async {
        for worker in workers {
            let _ = worker.await;
        }
        store.close().await;
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
        tracing::error!("Timed out waiting for components to close");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
