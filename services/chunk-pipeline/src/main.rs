use anyhow::{Context, Result};
use chunk_pipeline::{
    backend_for_settings, ChunkUploader, Config, PipelineSettings, Record, SessionContext,
};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting chunk pipeline"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let settings = PipelineSettings::from_config(&config.pipeline)
        .context("Invalid pipeline configuration")?;

    let backend = backend_for_settings(&settings, &config)
        .await
        .context("Failed to initialize storage backend")?;

    let uploader: ChunkUploader<Record> = ChunkUploader::new(settings, backend);

    // The service name stands in for `{name}` unless configured explicitly
    let mut attributes = config.service.attributes.clone();
    attributes
        .entry("name".to_string())
        .or_insert_with(|| config.service.name.clone());

    uploader
        .open(SessionContext::new().with_attributes(attributes))
        .await
        .context("Failed to open uploader")?;

    if let Err(e) = ingest_stdin(&uploader).await {
        error!(error = %e, "Ingest stopped");
    }

    uploader
        .close()
        .await
        .context("Failed to flush final chunk")?;

    info!(
        succeeded = uploader.stats().succeeded(),
        failed = uploader.stats().failed(),
        "Chunk pipeline stopped"
    );

    Ok(())
}

/// Submit one record per JSON object line on stdin until EOF or a shutdown
/// signal. The signal is only observed between records, so a flush that is
/// already running always completes.
async fn ingest_stdin(uploader: &ChunkUploader<Record>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number = 0u64;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = &mut shutdown => {
                info!("Shutting down chunk pipeline");
                break;
            }
        };

        let Some(line) = line else {
            info!(lines = line_number, "Reached end of input");
            break;
        };

        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let fields: Map<String, Value> = match serde_json::from_str(&line) {
            Ok(fields) => fields,
            Err(e) => {
                warn!(line = line_number, error = %e, "Skipping line that is not a JSON object");
                continue;
            }
        };

        // A failed flush is already counted; keep accepting records
        if let Err(e) = uploader.submit(Record::from(fields)).await {
            error!(line = line_number, error = %e, "Chunk flush failed");
        }
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
