use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Builder;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use speedtest_exporter::cli::{self, Args, VERSION};
use speedtest_exporter::config::ExporterConfig;
use speedtest_exporter::exporter::http_server::{self, ExporterState};
use speedtest_exporter::exporter::{spawn_measurement_loop, SpeedtestMetrics};
use speedtest_exporter::logging;
use speedtest_exporter::speedtest::{MeasurementProvider, SpeedtestClient};

fn main() {
    // parse command line arguments
    let args = Args::parse_normalized();

    if args.version {
        println!("{}", cli::version_string());
        return;
    }

    logging::init(args.log_level, args.log_format);

    let rt = match Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            error!(error = %err, "Failed to start tokio runtime");
            std::process::exit(1);
        }
    };

    // if error log it and exit
    if let Err(err) = rt.block_on(run_exporter_mode(args)) {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

async fn run_exporter_mode(args: Args) -> anyhow::Result<()> {
    // fail on bad flags before touching the network
    let config = ExporterConfig::from_args(&args)
        .await
        .context("Invalid configuration")?;

    info!(version = VERSION, "Starting speedtest exporter");
    info!(
        listen_address = %config.listen_address,
        telemetry_path = %config.telemetry_path,
        interval_secs = config.interval.as_secs(),
        "Exporter settings"
    );

    let provider: Arc<dyn MeasurementProvider> = Arc::new(
        SpeedtestClient::new(&config.config_url, &config.server_url)
            .await
            .context("Can't create exporter")?,
    );

    info!("Register exporter");
    let metrics = Arc::new(SpeedtestMetrics::new().context("Failed to register gauges")?);

    // Ctrl+C flips the shutdown flag for both the loop and the server
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => {
                warn!(error = %err, "Unable to listen for shutdown signal");
            }
        }
    });

    let measurement_loop = spawn_measurement_loop(
        provider,
        metrics.clone(),
        config.interval,
        shutdown_rx.clone(),
    );

    let state = ExporterState::new(metrics, &config.telemetry_path);
    let served = http_server::start_metrics_server(state, config.listen_address, shutdown_rx).await;

    match served {
        Ok(()) => {
            measurement_loop.await.context("Measurement loop panicked")?;
            Ok(())
        }
        Err(err) => {
            measurement_loop.abort();
            Err(err.into())
        }
    }
}
