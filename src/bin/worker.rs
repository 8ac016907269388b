use metrics_exporter_prometheus::PrometheusBuilder;
use nlp_parser_poller::{
    app_state::AppState,
    config::WorkerConfig,
    models::run::SignatureSource,
    services::{
        invoker::CoreNlp,
        poller::{Poller, PollerError},
        storage::S3Store,
    },
};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting NLP parser worker");

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = install_metrics(&config) {
        tracing::error!(error = %e, "Failed to start metrics exporter");
        return ExitCode::FAILURE;
    }

    tracing::info!(bucket = %config.s3_bucket, "Initializing object store client");
    let store = match S3Store::from_config(&config) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize object store client");
            return ExitCode::FAILURE;
        }
    };

    let instance_id = config
        .instance_id
        .clone()
        .unwrap_or_else(SignatureSource::default_instance_id);
    let signatures = match SignatureSource::new(instance_id) {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(error = %e, "Invalid instance id");
            return ExitCode::FAILURE;
        }
    };

    let state = AppState::new(store, CoreNlp::from_config(&config));
    let poller = Poller::new(
        state,
        signatures,
        &config.work_dir,
        config.poller_settings(),
    );

    tracing::info!(
        instance_id = %poller.instance_id(),
        work_dir = %config.work_dir,
        poll_interval_secs = config.poll_interval_secs,
        "Worker ready, starting batch polling loop"
    );

    match poller.run(shutdown_signal()).await {
        Ok(()) => {
            tracing::info!("Worker stopped");
            ExitCode::SUCCESS
        }
        Err(PollerError::Halted(reason)) => {
            // A supervisor is expected to restart us; the store is already
            // consistent at this point.
            tracing::error!(reason = %reason, "Worker halted");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker stopped on error");
            ExitCode::FAILURE
        }
    }
}

fn install_metrics(config: &WorkerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let Some(addr) = config.metrics_socket()? else {
        return Ok(());
    };

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    metrics::describe_counter!("parser_batches_claimed_total", "Batches claimed from the inbox");
    metrics::describe_counter!(
        "parser_claim_races_lost_total",
        "Claims abandoned because another consumer moved the batch first"
    );
    metrics::describe_counter!("parser_runs_published_total", "Runs that wrote a manifest");
    metrics::describe_counter!("parser_runs_restored_total", "Failed runs whose batch went back to the inbox");
    metrics::describe_counter!(
        "parser_batches_dead_lettered_total",
        "Batches moved to the dead-letter prefix"
    );
    metrics::describe_counter!("parser_outputs_published_total", "Annotated documents uploaded");
    metrics::describe_histogram!("parser_processing_seconds", "Time spent in the NLP engine per run");

    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for ctrl-c, shutdown only via halt");
        std::future::pending::<()>().await;
    }
}
