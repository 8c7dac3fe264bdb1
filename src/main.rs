use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bookd::catalog::{Catalog, InMemoryCatalog};
use bookd::config::Config;
use bookd::engine::Engine;
use bookd::notify::{Dispatcher, LogMailer, NotificationQueue, NotifyHub};

const COMPACT_CHECK_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    bookd::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let catalog: Arc<dyn Catalog> = match &config.catalog_path {
        Some(path) => {
            let catalog = InMemoryCatalog::load(path)?;
            info!(
                providers = catalog.provider_count(),
                service_items = catalog.service_item_count(),
                "catalog loaded from {}",
                path.display()
            );
            Arc::new(catalog)
        }
        None => {
            tracing::warn!("BOOKD_CATALOG not set, starting with an empty catalog");
            Arc::new(InMemoryCatalog::new())
        }
    };

    let hub = Arc::new(NotifyHub::new());
    let (queue, queue_rx) = NotificationQueue::channel();
    let dispatcher = Dispatcher::new(hub.clone(), Arc::new(LogMailer), config.retry_policy());
    tokio::spawn(dispatcher.run(queue_rx));

    let engine = Arc::new(Engine::new(config.wal_path(), catalog, Arc::new(queue))?);
    tokio::spawn(bookd::compactor::run_compactor(
        engine.clone(),
        config.compact_threshold,
        COMPACT_CHECK_PERIOD,
    ));

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("bookd listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  compact_threshold: {}", config.compact_threshold);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, bookd::http::router(engine, hub))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("bookd stopped");
    Ok(())
}

/// Resolves on SIGTERM or ctrl-c. In-flight requests are drained by axum.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::error!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received");
}
