use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use inference_server::config::Args;
use inference_server::device_detection::{HardwareSource, SystemHardware};
use inference_server::loader::{CandleBackend, ModelBackend, ModelLoader};
use inference_server::server::create_router;
use inference_server::service::InferenceService;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("inference_server=info,tower_http=info")),
        )
        .init();

    let load_settings = args.load_settings()?;
    let serve_settings = args.serve_settings()?;
    let generation_defaults = args.generation_defaults()?;
    info!("Starting inference server for {}", load_settings.model_id);

    // Bind before loading so health checks answer while the model loads.
    let listener = tokio::net::TcpListener::bind(serve_settings.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", serve_settings.addr))?;
    info!("Listening on http://{}", serve_settings.addr);

    let hardware: Arc<dyn HardwareSource> = Arc::new(SystemHardware);
    let backend: Arc<dyn ModelBackend> = Arc::new(CandleBackend);
    let loader = ModelLoader::new(backend, hardware.clone(), load_settings, args.budget_settings());
    loader.start();

    let service = InferenceService::new(loader, hardware, generation_defaults, &serve_settings);
    let app = create_router(service);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped gracefully");
    Ok(())
}
